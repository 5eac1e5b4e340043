use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    StaStarted,
    Disconnected,
    GotIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiAction {
    None,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiTransition {
    Started,
    Retrying { attempt: u32, max: u32 },
    Connected,
    Failed { retries: u32 },
    Ignored(WifiEvent),
}

impl fmt::Display for WifiTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "station started, connecting"),
            Self::Retrying { attempt, max } => {
                write!(f, "disconnected, retrying ({attempt}/{max})")
            }
            Self::Connected => write!(f, "IP acquired"),
            Self::Failed { retries } => {
                write!(f, "connection failed after {retries} retries")
            }
            Self::Ignored(event) => write!(f, "ignored {event:?} after failure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiStep {
    pub transition: WifiTransition,
    pub action: WifiAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected,
    Failed,
    TimedOut,
}

impl ConnectionOutcome {
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Connected)
    }
}

// No I/O here. The first terminal state is latched as the outcome.
#[derive(Debug, Clone)]
pub struct WifiStateMachine {
    state: ConnectionState,
    retries: u32,
    max_retries: u32,
    outcome: Option<ConnectionOutcome>,
}

impl WifiStateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            retries: 0,
            max_retries,
            outcome: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retries
    }

    pub fn outcome(&self) -> Option<ConnectionOutcome> {
        self.outcome
    }

    pub fn handle(&mut self, event: WifiEvent) -> WifiStep {
        match event {
            WifiEvent::StaStarted => {
                self.state = ConnectionState::Connecting;
                WifiStep {
                    transition: WifiTransition::Started,
                    action: WifiAction::Connect,
                }
            }
            WifiEvent::Disconnected => {
                if self.state == ConnectionState::Failed {
                    return ignored(event);
                }

                if self.retries < self.max_retries {
                    self.retries += 1;
                    self.state = ConnectionState::Connecting;
                    WifiStep {
                        transition: WifiTransition::Retrying {
                            attempt: self.retries,
                            max: self.max_retries,
                        },
                        action: WifiAction::Connect,
                    }
                } else {
                    self.state = ConnectionState::Failed;
                    self.settle(ConnectionOutcome::Failed);
                    WifiStep {
                        transition: WifiTransition::Failed {
                            retries: self.retries,
                        },
                        action: WifiAction::None,
                    }
                }
            }
            WifiEvent::GotIp => {
                self.retries = 0;
                self.state = ConnectionState::Connected;
                self.settle(ConnectionOutcome::Connected);
                WifiStep {
                    transition: WifiTransition::Connected,
                    action: WifiAction::None,
                }
            }
        }
    }

    pub fn time_out(&mut self) -> ConnectionOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        self.state = ConnectionState::TimedOut;
        self.outcome = Some(ConnectionOutcome::TimedOut);
        ConnectionOutcome::TimedOut
    }

    fn settle(&mut self, outcome: ConnectionOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }
}

fn ignored(event: WifiEvent) -> WifiStep {
    WifiStep {
        transition: WifiTransition::Ignored(event),
        action: WifiAction::None,
    }
}

#[derive(Clone)]
pub struct WifiConnectionManager {
    inner: Arc<(Mutex<WifiStateMachine>, Condvar)>,
}

impl WifiConnectionManager {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Arc::new((Mutex::new(WifiStateMachine::new(max_retries)), Condvar::new())),
        }
    }

    pub fn handle_event(&self, event: WifiEvent) -> WifiStep {
        let (machine, settled) = &*self.inner;
        let mut machine = lock(machine);
        let was_settled = machine.outcome().is_some();
        let step = machine.handle(event);
        if !was_settled && machine.outcome().is_some() {
            settled.notify_all();
        }
        step
    }

    pub fn wait_settled(&self, timeout: Duration) -> ConnectionOutcome {
        let (machine, settled) = &*self.inner;
        let guard = lock(machine);
        let (mut guard, _) = settled
            .wait_timeout_while(guard, timeout, |machine| machine.outcome().is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match guard.outcome() {
            Some(outcome) => outcome,
            None => guard.time_out(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.0).state()
    }

    pub fn retry_count(&self) -> u32 {
        lock(&self.inner.0).retry_count()
    }
}

fn lock(machine: &Mutex<WifiStateMachine>) -> MutexGuard<'_, WifiStateMachine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use pretty_assertions::assert_eq;

    use super::*;

    fn started(max_retries: u32) -> WifiStateMachine {
        let mut machine = WifiStateMachine::new(max_retries);
        let step = machine.handle(WifiEvent::StaStarted);
        assert_eq!(step.action, WifiAction::Connect);
        machine
    }

    #[test]
    fn disconnects_below_limit_retry() {
        let mut machine = started(5);

        for expected in 1..=5 {
            let step = machine.handle(WifiEvent::Disconnected);
            assert_eq!(step.action, WifiAction::Connect);
            assert_eq!(
                step.transition,
                WifiTransition::Retrying {
                    attempt: expected,
                    max: 5
                }
            );
            assert_eq!(machine.state(), ConnectionState::Connecting);
            assert_eq!(machine.retry_count(), expected);
            assert_eq!(machine.outcome(), None);
        }
    }

    #[test]
    fn disconnect_at_limit_fails_exactly_once() {
        let mut machine = started(5);
        for _ in 0..5 {
            machine.handle(WifiEvent::Disconnected);
        }

        let step = machine.handle(WifiEvent::Disconnected);
        assert_eq!(step.transition, WifiTransition::Failed { retries: 5 });
        assert_eq!(step.action, WifiAction::None);
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(machine.outcome(), Some(ConnectionOutcome::Failed));

        let step = machine.handle(WifiEvent::Disconnected);
        assert_eq!(
            step.transition,
            WifiTransition::Ignored(WifiEvent::Disconnected)
        );
        assert_eq!(step.action, WifiAction::None);
        assert_eq!(machine.retry_count(), 5);
    }

    #[test]
    fn got_ip_resets_retry_counter() {
        for prior in 0..=5 {
            let mut machine = started(5);
            for _ in 0..prior {
                machine.handle(WifiEvent::Disconnected);
            }

            let step = machine.handle(WifiEvent::GotIp);
            assert_eq!(step.transition, WifiTransition::Connected);
            assert_eq!(machine.retry_count(), 0);
            assert_eq!(machine.state(), ConnectionState::Connected);
            assert_eq!(machine.outcome(), Some(ConnectionOutcome::Connected));
        }
    }

    #[test]
    fn disconnect_after_connect_retries_with_fresh_budget() {
        let mut machine = started(5);
        machine.handle(WifiEvent::Disconnected);
        machine.handle(WifiEvent::GotIp);

        let step = machine.handle(WifiEvent::Disconnected);
        assert_eq!(step.action, WifiAction::Connect);
        assert_eq!(machine.retry_count(), 1);
        assert_eq!(machine.outcome(), Some(ConnectionOutcome::Connected));
    }

    #[test]
    fn zero_retry_budget_fails_on_first_disconnect() {
        let mut machine = started(0);

        let step = machine.handle(WifiEvent::Disconnected);
        assert_eq!(step.transition, WifiTransition::Failed { retries: 0 });
    }

    #[test]
    fn outcome_is_latched() {
        let mut machine = started(0);
        machine.handle(WifiEvent::Disconnected);
        machine.handle(WifiEvent::GotIp);

        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.outcome(), Some(ConnectionOutcome::Failed));
        assert_eq!(machine.time_out(), ConnectionOutcome::Failed);
    }

    #[test]
    fn wait_without_events_times_out() {
        let manager = WifiConnectionManager::new(5);
        manager.handle_event(WifiEvent::StaStarted);

        let started_at = Instant::now();
        let outcome = manager.wait_settled(Duration::from_millis(30));

        assert_eq!(outcome, ConnectionOutcome::TimedOut);
        assert!(started_at.elapsed() >= Duration::from_millis(30));
        assert_eq!(manager.state(), ConnectionState::TimedOut);
        assert!(!outcome.is_reachable());
    }

    #[test]
    fn wait_wakes_when_driver_thread_connects() {
        let manager = WifiConnectionManager::new(5);
        let driver = manager.clone();

        let handle = thread::spawn(move || {
            driver.handle_event(WifiEvent::StaStarted);
            thread::sleep(Duration::from_millis(10));
            driver.handle_event(WifiEvent::Disconnected);
            thread::sleep(Duration::from_millis(10));
            driver.handle_event(WifiEvent::GotIp);
        });

        let outcome = manager.wait_settled(Duration::from_secs(5));
        handle.join().unwrap();

        assert_eq!(outcome, ConnectionOutcome::Connected);
        assert!(outcome.is_reachable());
        assert_eq!(manager.retry_count(), 0);
    }

    #[test]
    fn wait_returns_failed_after_retry_budget() {
        let manager = WifiConnectionManager::new(2);
        let driver = manager.clone();

        let handle = thread::spawn(move || {
            let mut step = driver.handle_event(WifiEvent::StaStarted);
            while step.action == WifiAction::Connect {
                step = driver.handle_event(WifiEvent::Disconnected);
            }
        });

        let outcome = manager.wait_settled(Duration::from_secs(5));
        handle.join().unwrap();

        assert_eq!(outcome, ConnectionOutcome::Failed);
        assert_eq!(manager.state(), ConnectionState::Failed);
    }
}
