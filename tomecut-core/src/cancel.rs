//! Cooperative cancellation shared across graph drives and external tools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TomecutError};

/// Cloneable cancellation flag. Long-running loops call [`CancelSignal::checkpoint`]
/// at their top so a cancel observed anywhere unwinds the whole operation.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TomecutError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep in short slices so a cancel interrupts within ~25 ms.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let slice = Duration::from_millis(25);
        let mut remaining = duration;
        while !remaining.is_zero() {
            self.checkpoint()?;
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        self.checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_cancelled() {
        let signal = CancelSignal::new();
        assert!(signal.checkpoint().is_ok());
        signal.cancel();
        assert!(matches!(signal.checkpoint(), Err(TomecutError::Cancelled)));
    }

    #[test]
    fn clones_share_the_flag() {
        let a = CancelSignal::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    fn sleep_aborts_early_on_cancel() {
        let signal = CancelSignal::new();
        signal.cancel();
        assert!(signal.sleep(Duration::from_secs(5)).is_err());
    }
}
