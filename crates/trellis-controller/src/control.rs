//! Caller-driven commit for operations executed with a [`TransactionControl`].
//!
//! Once an operation has run through VERIFY without failing, the controller
//! hands the control a [`PreparedTransaction`] and blocks until it is
//! committed or rolled back. The transaction may be moved to another thread;
//! dropping it undecided rolls back.

use crate::context::ResultAction;
use crate::rendezvous::Broadcast;
use std::fmt;
use std::sync::Arc;
use trellis_model::OperationResponse;

pub trait TransactionControl: Send + Sync {
    /// The operation succeeded so far and awaits a decision.
    fn operation_prepared(&self, transaction: PreparedTransaction, result: &OperationResponse);

    /// The operation failed before it could be prepared.
    fn operation_failed(&self, response: &OperationResponse);

    /// Final response of a prepared operation, after commit or rollback.
    fn operation_completed(&self, response: &OperationResponse);
}

pub struct PreparedTransaction {
    decision: Arc<Broadcast<ResultAction>>,
}

impl fmt::Debug for PreparedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTransaction")
            .field("decision", &self.decision.get())
            .finish()
    }
}

impl PreparedTransaction {
    pub(crate) fn new(decision: Arc<Broadcast<ResultAction>>) -> Self {
        Self { decision }
    }

    pub fn commit(self) {
        self.decision.publish(ResultAction::Keep);
    }

    pub fn rollback(self) {
        self.decision.publish(ResultAction::Rollback);
    }
}

impl Drop for PreparedTransaction {
    fn drop(&mut self) {
        self.decision.publish(ResultAction::Rollback);
    }
}
