use crate::ControllerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation flag shared by everything working on behalf of one
/// operation. Blocking waits poll it and give up with
/// [`ControllerError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ControllerError> {
        if self.is_cancelled() {
            Err(ControllerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
