mod commands;
mod handlers;
mod model_file;

use clap::{Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_MODEL_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "trellis",
    version,
    about = "Transactional management-model controller"
)]
struct Cli {
    /// Path to the model description.
    #[arg(long, default_value = "trellis-model.toml", global = true)]
    model: PathBuf,

    /// Path to a controller configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Boot the model from a JSON list of operations.
    Boot {
        /// Path to the boot operations.
        operations: PathBuf,
    },
    /// Execute operations one at a time, optionally after a boot.
    Execute {
        /// Path to the operations to execute.
        operations: PathBuf,
        /// Boot from these operations first.
        #[arg(long)]
        boot: Option<PathBuf>,
    },
    /// Show how boot operations would be split across parallel workers.
    Plan {
        /// Path to the boot operations.
        operations: PathBuf,
    },
    /// Parse an address in `/key=value` syntax.
    Address {
        address: String,
    },
    /// Print the effective controller configuration.
    Config,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TRELLIS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    commands::install_signal_handler();

    let result = dispatch(cli);

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("model error:")
                || msg.starts_with("failed to parse model")
                || msg.starts_with("failed to read model")
            {
                EXIT_MODEL_ERROR
            } else if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8, String> {
    let json = cli.json;
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Address { address } => commands::address::run(&address, json),
        Commands::Config => commands::config::run(&commands::load_config(config)?, json),
        Commands::Plan { operations } => {
            commands::plan::run(&commands::load_config(config)?, &operations, json)
        }
        Commands::Boot { operations } => {
            let controller = commands::build_controller(&cli.model, commands::load_config(config)?)?;
            commands::boot::run(&controller, &operations, json)
        }
        Commands::Execute { operations, boot } => {
            let controller = commands::build_controller(&cli.model, commands::load_config(config)?)?;
            commands::execute::run(&controller, boot.as_deref(), &operations, json)
        }
    }
}
