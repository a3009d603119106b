use crate::context::Stage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;
use trellis_model::{Operation, OperationResponse, PathAddress, SubsystemName};

/// A boot operation that failed without rolling back the boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootError {
    pub address: PathAddress,
    pub operation: String,
    pub stage: Stage,
    pub failure_description: String,
}

/// Collects per-operation boot failures from every boot context, including
/// parallel workers.
#[derive(Debug, Default)]
pub struct BootErrorCollector {
    errors: Mutex<Vec<BootError>>,
}

impl BootErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &Operation, stage: Stage, description: impl Into<String>) {
        let description = description.into();
        error!("boot operation {operation} failed in stage {stage}: {description}");
        self.errors.lock().push(BootError {
            address: operation.address.clone(),
            operation: operation.name.clone(),
            stage,
            failure_description: description,
        });
    }

    pub fn errors(&self) -> Vec<BootError> {
        self.errors.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

/// Result of [`crate::ModelController::boot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootOutcome {
    pub success: bool,
    pub response: OperationResponse,
    pub errors: Vec<BootError>,
    /// Subsystems per parallel worker, in start order.
    pub chunks: Vec<Vec<SubsystemName>>,
    pub operations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
