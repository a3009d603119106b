//! Addressing, operation wire shapes, attribute metadata and the resource tree for trellis.
//!
//! This crate defines the data layer the controller operates on: hierarchical
//! `PathAddress` values (with the `/key=value` CLI syntax), the `Operation` and
//! `OperationResponse` wire shapes, `AttributeDefinition` validation, and the
//! in-memory `Resource` tree that holds configuration state.

pub mod attribute;
pub mod operation;
pub mod path;
pub mod resource;
pub mod types;

pub use attribute::{AttributeDefinition, AttributeType, CapabilityReference, RestartLevel};
pub use operation::{
    Operation, OperationResponse, Outcome, ADD, ADDRESS, ADD_INDEX, NAME, OP, OPERATION_HEADERS,
    READ_ATTRIBUTE, READ_RESOURCE, RECURSIVE, REMOVE, VALUE, WRITE_ATTRIBUTE,
};
pub use path::{PathAddress, PathElement, WILDCARD_VALUE};
pub use resource::Resource;
pub use types::{ServiceName, SubsystemName};

use thiserror::Error;

/// Structured, JSON-like value used for operation parameters and resource models.
pub type ModelNode = serde_json::Value;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("duplicate path element key '{0}'")]
    DuplicateElement(String),
    #[error("illegal address '{address}': {reason}")]
    IllegalAddress { address: String, reason: String },
    #[error("invalid path element: {0}")]
    InvalidElement(String),
    #[error("invalid address node: {0}")]
    InvalidAddressNode(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("required parameter '{0}' is missing")]
    MissingParameter(String),
    #[error("invalid value for '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
