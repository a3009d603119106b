use super::{
    describe_response, json_pretty, read_operations, shutdown_requested, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use trellis_controller::ModelController;
use trellis_model::{Operation, OperationResponse};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Boot from `boot` when given, then execute each operation in turn. Stops
/// at the first operation that does not succeed.
pub fn run(
    controller: &ModelController,
    boot: Option<&Path>,
    operations: &Path,
    json: bool,
) -> Result<u8, String> {
    if let Some(boot) = boot {
        let outcome = controller.boot(read_operations(boot)?);
        if !outcome.success {
            return Err(format!(
                "boot failed: {}",
                outcome
                    .response
                    .failure_description
                    .as_deref()
                    .unwrap_or("unknown failure")
            ));
        }
        debug!("booted {} operations", outcome.operations);
    }

    let mut responses = Vec::new();
    let mut code = EXIT_SUCCESS;
    for operation in read_operations(operations)? {
        let description = operation.to_string();
        let response = execute_cancellable(controller, operation)?;
        if !json {
            println!("{description}: {}", describe_response(&response));
            if !response.result.is_null() {
                println!("{}", json_pretty(&response.result)?);
            }
        }
        let success = response.is_success();
        responses.push(response);
        if !success {
            code = EXIT_FAILURE;
            break;
        }
    }
    if json {
        println!("{}", json_pretty(&responses)?);
    }
    Ok(code)
}

/// Run `operation` on its own thread, cancelling it when Ctrl-C is pressed.
fn execute_cancellable(
    controller: &ModelController,
    operation: Operation,
) -> Result<OperationResponse, String> {
    let handle = controller
        .execute_async(operation)
        .map_err(|e| e.to_string())?;
    while !handle.is_finished() {
        if shutdown_requested() {
            warn!("cancelling operation {}", handle.operation_id());
            handle.cancel();
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(handle.wait())
}
