use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{SnapError, SnapResult};

/// Cooperative cancellation signal checked between discrete file operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Cancelled` error once the signal is set.
    pub fn check(&self, operation: &str) -> SnapResult<()> {
        if self.is_cancelled() {
            Err(SnapError::cancelled(operation))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_signal() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(observer.check("archive").is_ok());
        token.cancel();
        assert!(matches!(
            observer.check("archive"),
            Err(SnapError::Cancelled { .. })
        ));
    }
}
