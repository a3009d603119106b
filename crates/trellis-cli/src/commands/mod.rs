pub mod address;
pub mod boot;
pub mod config;
pub mod execute;
pub mod plan;

use crate::model_file;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use trellis_controller::{ControllerConfig, ModelController, ServiceContainer, ServiceRegistry};
use trellis_model::{Operation, OperationResponse};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MODEL_ERROR: u8 = 2;
pub const EXIT_CONFIG_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ncancellation requested, rolling back the current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Controller configuration from `path` (or defaults), then `TRELLIS_*`
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<ControllerConfig, String> {
    let config = match path {
        Some(path) => ControllerConfig::load(path)
            .map_err(|e| format!("config error: {}: {e}", path.display()))?,
        None => ControllerConfig::default(),
    };
    config.apply_env().map_err(|e| format!("config error: {e}"))
}

pub fn build_controller(model: &Path, config: ControllerConfig) -> Result<ModelController, String> {
    let registration = model_file::load(model)?;
    let container: Arc<dyn ServiceContainer> = ServiceRegistry::new();
    Ok(ModelController::new(registration, container, config))
}

/// Operations from a JSON file holding one operation object or a list of
/// them. Addresses may be given in CLI syntax.
pub fn read_operations(path: &Path) -> Result<Vec<Operation>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("failed to read operations '{}': {e}", path.display()))?;
    parse_operations(&content)
}

pub fn parse_operations(content: &str) -> Result<Vec<Operation>, String> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| format!("failed to parse operations: {e}"))?;
    let nodes = match value {
        Value::Array(nodes) => nodes,
        other => vec![other],
    };
    nodes
        .into_iter()
        .enumerate()
        .map(|(i, node)| {
            Operation::try_from(node).map_err(|e| format!("operation {}: {e}", i + 1))
        })
        .collect()
}

pub fn describe_response(response: &OperationResponse) -> String {
    let mut line = response.outcome.to_string();
    if let Some(description) = &response.failure_description {
        line.push_str(": ");
        line.push_str(description);
    }
    if let Some(state) = response.response_headers.get("process-state") {
        line.push_str(&format!(" [{}]", state.as_str().unwrap_or_default()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_pretty_serializes_object() {
        let result = json_pretty(&json!({"outcome": "success"})).unwrap();
        assert!(result.contains("\"outcome\""));
    }

    #[test]
    fn single_operation_object_is_accepted() {
        let ops = parse_operations(r#"{"operation": "add", "address": "/subsystem=web"}"#).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].address.to_string(), "/subsystem=web");
    }

    #[test]
    fn operation_list_keeps_parameters() {
        let ops = parse_operations(
            r#"[
                {"operation": "add", "address": [{"socket-binding": "http"}], "port": 8080},
                {"operation": "read-resource", "address": "/", "recursive": true}
            ]"#,
        )
        .unwrap();
        assert_eq!(ops[0].param("port"), Some(&json!(8080)));
        assert!(ops[1].address.is_empty());
        assert!(ops[1].bool_param("recursive"));
    }

    #[test]
    fn bad_operation_names_its_position() {
        let err = parse_operations(r#"[{"operation": "add"}, {"address": "/a=b"}]"#).unwrap_err();
        assert!(err.starts_with("operation 2"), "{err}");
    }

    #[test]
    fn response_line_includes_state() {
        let mut response = OperationResponse::success(Value::Null);
        response
            .response_headers
            .insert("process-state".to_owned(), json!("reload-required"));
        assert_eq!(describe_response(&response), "success [reload-required]");
        assert_eq!(
            describe_response(&OperationResponse::failed("boom")),
            "failed: boom"
        );
    }
}
