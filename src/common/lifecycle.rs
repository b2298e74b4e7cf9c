//! Cooperative thread/slot lifecycle state.
//!
//! Off -> Starting -> Running -> Terminate -> Terminating -> Terminated,
//! with CantRun for a setup failure. The owner requests Terminate; only the
//! thread itself moves through Terminating to Terminated.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Off = 0,
    Starting = 1,
    Running = 2,
    Terminate = 3,
    CantRun = 4,
    Terminating = 5,
    Terminated = 6,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            1 => RunState::Starting,
            2 => RunState::Running,
            3 => RunState::Terminate,
            4 => RunState::CantRun,
            5 => RunState::Terminating,
            6 => RunState::Terminated,
            _ => RunState::Off,
        }
    }
}

#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new(RunState::Off)
    }
}

impl LifecycleCell {
    pub fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RunState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == RunState::Running
    }

    /// True for states in which a fresh start is allowed.
    pub fn can_start(&self) -> bool {
        matches!(self.get(), RunState::Off | RunState::Terminated | RunState::CantRun)
    }

    pub fn request_terminate(&self) {
        self.set(RunState::Terminate);
    }

    pub fn terminate_requested(&self) -> bool {
        self.get() == RunState::Terminate
    }

    /// Bounded wait for the thread to reach Terminated/Off. Returns false if
    /// the grace period expires; the caller proceeds with cleanup regardless.
    pub fn wait_terminated(&self, grace: Duration) -> bool {
        let step = Duration::from_millis(1);
        let mut waited = Duration::ZERO;
        loop {
            if matches!(self.get(), RunState::Terminated | RunState::Off) {
                return true;
            }
            if waited >= grace {
                return false;
            }
            std::thread::sleep(step);
            waited += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let cell = LifecycleCell::default();
        assert!(cell.can_start());
        cell.set(RunState::Running);
        assert!(cell.is_running());
        assert!(!cell.can_start());
        cell.request_terminate();
        assert!(cell.terminate_requested());
        cell.set(RunState::Terminated);
        assert!(cell.wait_terminated(Duration::from_millis(1)));
        assert!(cell.can_start());
    }
}
