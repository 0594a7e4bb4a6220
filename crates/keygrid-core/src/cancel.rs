//! Cancellation tokens for long-running read loops.
//!
//! Nothing in the storage layer checks these automatically; callers
//! driving an unbounded loop (draining `get_all`, bulk deletes) are
//! expected to test the token between iterations.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub enum Cancel {
    /// Never cancels.
    Never,
    /// Cancels once the deadline passes.
    Deadline(Instant),
}

impl Cancel {
    pub fn never() -> Self {
        Self::Never
    }

    pub fn after_timeout(duration: Duration) -> Self {
        Self::Deadline(Instant::now() + duration)
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Never => false,
            Self::Deadline(deadline) => Instant::now() >= *deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_is_never_cancelled() {
        assert!(!Cancel::never().is_cancelled());
    }

    #[test]
    fn deadline_in_the_past_is_cancelled() {
        let cancel = Cancel::after_timeout(Duration::ZERO);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn deadline_in_the_future_is_not_cancelled() {
        let cancel = Cancel::after_timeout(Duration::from_secs(3600));
        assert!(!cancel.is_cancelled());
    }
}
