//! Staged, transactional execution of management operations.
//!
//! The `ModelController` accepts an `Operation`, runs it through the MODEL,
//! RUNTIME and VERIFY stages of an `OperationContext` under the permit-keyed
//! controller lock, validates capability requirements and container
//! stability, and then either publishes the new model and capability
//! registry or rolls everything back. Boot runs the same pipeline with
//! independent subsystems partitioned into chunks on worker threads.

pub mod attachment;
pub mod boot;
pub mod cancel;
pub mod config;
pub mod container;
pub mod context;
pub mod control;
pub mod controller;
pub mod handlers;
pub mod parallel_boot;
pub mod permit_lock;
pub mod registration;
pub mod rendezvous;

pub use attachment::{AttachmentKey, Attachments};
pub use boot::{BootError, BootErrorCollector, BootOutcome};
pub use cancel::CancelToken;
pub use config::ControllerConfig;
pub use container::{
    ContainerStateChangeReport, ContainerStateMonitor, MissingDependency, ServiceContainer,
    ServiceRegistry, ServiceState, StabilityError, StabilitySnapshot,
};
pub use context::{
    ContextKind, OperationContext, ProcessState, ResultAction, Stage, StepRecord,
};
pub use control::{PreparedTransaction, TransactionControl};
pub use controller::{ModelController, OperationHandle};
pub use handlers::{
    from_fn, AddOperation, AddStepHandler, HandlerParameters, ModelOnlyAddHandler,
    ModelOnlyRemoveHandler, ModelOnlyWriteAttributeHandler, OperationStepHandler,
    ReadAttributeHandler, ReadResourceHandler, RemoveOperation, RemoveStepHandler,
    WriteAttributeHandler, WriteAttributeOperation,
};
pub use parallel_boot::{plan_chunks, BootChunk, BootPartition, ChunkPlan};
pub use permit_lock::{LockMode, Permit, PermitLock};
pub use registration::ResourceRegistration;
pub use rendezvous::{Arrivals, Broadcast};

use thiserror::Error;
use trellis_capability::CapabilityError;
use trellis_model::ModelError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    OperationFailed(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("no handler for operation '{operation}' at address {address}")]
    NoHandler { operation: String, address: String },
}

impl ControllerError {
    pub fn failed(description: impl Into<String>) -> Self {
        ControllerError::OperationFailed(description.into())
    }

    pub fn illegal_state(description: impl Into<String>) -> Self {
        ControllerError::IllegalState(description.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("controller lock released more times than it was acquired")]
    NotLocked,
    #[error("interrupted while waiting for the controller lock")]
    Interrupted,
    #[error("permit {0} holds the controller lock shared and cannot wait for exclusive mode")]
    Deadlock(Permit),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_error_display_operation_failed() {
        let e = ControllerError::failed("bad parameter 'port'");
        assert_eq!(e.to_string(), "bad parameter 'port'");
    }

    #[test]
    fn controller_error_display_no_handler() {
        let e = ControllerError::NoHandler {
            operation: "frobnicate".to_owned(),
            address: "/subsystem=web".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("frobnicate"));
        assert!(msg.contains("/subsystem=web"));
    }

    #[test]
    fn lock_error_wraps_into_controller_error() {
        let e: ControllerError = LockError::Deadlock(4).into();
        assert!(e.to_string().contains("permit 4"));
    }

    #[test]
    fn config_error_display_invalid_value() {
        let e = ConfigError::InvalidValue {
            name: "TRELLIS_LOCK_TIMEOUT_MS".to_owned(),
            value: "soon".to_owned(),
        };
        assert!(e.to_string().contains("soon"));
    }
}
