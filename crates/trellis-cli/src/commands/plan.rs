use super::{json_pretty, read_operations, EXIT_SUCCESS};
use serde_json::json;
use std::path::Path;
use trellis_controller::{plan_chunks, BootPartition, ControllerConfig};
use trellis_model::SubsystemName;

/// Show how a boot script would be split across workers, without running it.
pub fn run(config: &ControllerConfig, operations: &Path, json: bool) -> Result<u8, String> {
    let partition = BootPartition::new(read_operations(operations)?);
    let before = partition.before.len();
    let after = partition.after.len();
    let order = partition.subsystem_order();
    let plan = plan_chunks(partition.subsystems, config.max_parallel_boot_tasks);
    let workers = plan.logging.iter().chain(&plan.chunks);

    if json {
        let workers: Vec<_> = workers
            .map(|chunk| {
                json!({
                    "subsystems": chunk.subsystems,
                    "operations": chunk.operations.len(),
                })
            })
            .collect();
        let report = json!({
            "parallel": config.parallel_boot,
            "max-parallel-boot-tasks": config.max_parallel_boot_tasks,
            "before": before,
            "after": after,
            "subsystem-order": order,
            "workers": workers,
        });
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{before} operations before the subsystems, {after} after");
    if !config.parallel_boot {
        println!("parallel boot is disabled; subsystems boot in script order");
    }
    for (i, chunk) in workers.enumerate() {
        let names: Vec<&str> = chunk.subsystems.iter().map(SubsystemName::as_str).collect();
        println!(
            "  worker {}: {} ({} operations)",
            i + 1,
            names.join(", "),
            chunk.operations.len()
        );
    }
    Ok(EXIT_SUCCESS)
}
