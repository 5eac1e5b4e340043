use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub trait LedPin {
    type Error: fmt::Display;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error>;
}

// Only LedController writes to this cell; clones are readers.
#[derive(Debug, Clone, Default)]
pub struct LedState(Arc<AtomicBool>);

impl LedState {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, on: bool) {
        self.0.store(on, Ordering::Release);
    }
}

pub struct LedController<P: LedPin> {
    pin: P,
    state: LedState,
}

impl<P: LedPin> LedController<P> {
    pub fn initialize(mut pin: P) -> Result<Self, P::Error> {
        pin.set_level(false)?;
        Ok(Self {
            pin,
            state: LedState::default(),
        })
    }

    pub fn set_state(&mut self, on: bool) -> Result<(), P::Error> {
        self.pin.set_level(on)?;
        self.state.set(on);
        Ok(())
    }

    pub fn state(&self) -> bool {
        self.state.get()
    }

    pub fn state_cell(&self) -> LedState {
        self.state.clone()
    }
}
