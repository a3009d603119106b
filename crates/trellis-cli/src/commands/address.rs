use super::{json_pretty, EXIT_SUCCESS};
use serde_json::json;
use trellis_model::PathAddress;

/// Parse a CLI-syntax address and print its wire form.
pub fn run(address: &str, json: bool) -> Result<u8, String> {
    let parsed = PathAddress::parse(address).map_err(|e| e.to_string())?;
    if json {
        let report = json!({
            "address": parsed.to_cli_string(),
            "elements": parsed.to_model_node(),
        });
        println!("{}", json_pretty(&report)?);
    } else {
        println!("{}", parsed.to_cli_string());
        for element in &parsed {
            println!("  {} = {}", element.key(), element.value());
        }
    }
    Ok(EXIT_SUCCESS)
}
