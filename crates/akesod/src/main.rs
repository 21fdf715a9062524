//! `akesod` binary entry point.
//!
//! Startup sequence:
//! 1. Parse the command line.
//! 2. Load and validate [`Config`] from the optional file and environment.
//! 3. Initialise the tracing pipeline.
//! 4. Run the subcommand and map failures onto exit codes.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use akesod::cli::{self, Cli};
use akesod::config::Config;
use akesod::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    // -----------------------------------------------------------------------
    // 1. Command line
    // -----------------------------------------------------------------------
    let args = Cli::parse();

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let cfg = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Telemetry is not yet up; write to stderr directly.
            eprintln!("ERROR: configuration invalid: {e:#}");
            return ExitCode::from(2);
        }
    };

    // -----------------------------------------------------------------------
    // 3. Telemetry
    // -----------------------------------------------------------------------
    if let Err(e) =
        telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)
    {
        eprintln!("ERROR: telemetry initialisation failed: {e:#}");
        return ExitCode::FAILURE;
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bucket = %cfg.bucket,
        "akesod starting"
    );

    // -----------------------------------------------------------------------
    // 4. Command
    // -----------------------------------------------------------------------
    let result = cli::run(args.command, &cfg).await;
    telemetry::shutdown_telemetry();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "akesod failed");
            ExitCode::from(u8::try_from(cli::exit_code(&e)).unwrap_or(1))
        }
    }
}
