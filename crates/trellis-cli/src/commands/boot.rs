use super::{json_pretty, read_operations, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use trellis_controller::ModelController;
use trellis_model::SubsystemName;

pub fn run(controller: &ModelController, operations: &Path, json: bool) -> Result<u8, String> {
    let operations = read_operations(operations)?;
    let outcome = controller.boot(operations);
    if json {
        println!("{}", json_pretty(&outcome)?);
    } else {
        let status = if outcome.success { "succeeded" } else { "failed" };
        println!("boot {status}: {} operations", outcome.operations);
        for (i, chunk) in outcome.chunks.iter().enumerate() {
            let names: Vec<&str> = chunk.iter().map(SubsystemName::as_str).collect();
            println!("  worker {}: {}", i + 1, names.join(", "));
        }
        for error in &outcome.errors {
            println!(
                "  {}:{} failed in {}: {}",
                error.address, error.operation, error.stage, error.failure_description
            );
        }
        if let Some(description) = &outcome.response.failure_description {
            println!("  {description}");
        }
        let elapsed = outcome.finished_at - outcome.started_at;
        println!("  took {} ms", elapsed.num_milliseconds());
    }
    Ok(if outcome.success {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
