use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one proxied process.
///
/// The only legal transitions are `NotRunning → Starting` (on start),
/// `Starting → Running` (on the helper's started report), and back to
/// `NotRunning` on error, finish or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    NotRunning = 0,
    Starting = 1,
    Running = 2,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::NotRunning,
        }
    }
}

/// Process state readable from any thread.
///
/// Writes happen on the caller's thread; `cancel` uses a swap so that two
/// racing observers cannot both see a cancellable state.
#[derive(Debug, Default)]
pub(crate) struct AtomicProcessState(AtomicU8);

impl AtomicProcessState {
    pub(crate) fn load(&self) -> ProcessState {
        ProcessState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, state: ProcessState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn swap(&self, state: ProcessState) -> ProcessState {
        ProcessState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_previous_state() {
        let state = AtomicProcessState::default();
        assert_eq!(state.load(), ProcessState::NotRunning);

        state.store(ProcessState::Starting);
        assert_eq!(state.swap(ProcessState::NotRunning), ProcessState::Starting);
        assert_eq!(state.load(), ProcessState::NotRunning);
        assert_eq!(state.swap(ProcessState::NotRunning), ProcessState::NotRunning);
    }
}
