use super::{json_pretty, EXIT_SUCCESS};
use trellis_controller::ControllerConfig;

/// Print the effective controller configuration.
pub fn run(config: &ControllerConfig, json: bool) -> Result<u8, String> {
    if json {
        println!("{}", json_pretty(config)?);
    } else {
        let rendered =
            toml::to_string_pretty(config).map_err(|e| format!("TOML serialization failed: {e}"))?;
        print!("{rendered}");
    }
    Ok(EXIT_SUCCESS)
}
