//! # timbang
//!
//! Command line front-end for Bluetooth weight scales.
//!
//! ```bash
//! timbang scan --duration 15
//! timbang watch --license LIC-001 --device C8:47:8C:00:12:34
//! timbang read --license LIC-001            # uses the saved binding
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Context;
use clap::Parser;
use timbang_core::{Settings, TimbangError};
use tracing::{error, info};

use timbang_cli::cli::{Action, AdapterCommand, Cli};
use timbang_cli::commands::{self, OutputFormat};
use timbang_cli::logging;
use timbang_cli::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.production)?;

    let command = match Action::from(cli.command) {
        Action::InitSettings { force } => {
            let path = commands::init_settings(cli.config.as_deref(), force)?;
            println!("{}", path.display());
            return Ok(());
        }
        Action::Adapter(command) => command,
    };

    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    let format = OutputFormat::from_flag(cli.json);
    info!(?command, "Starting timbang");

    let state = AppState::new(settings).await?;
    let result = run(&state, command, format).await;
    if let Some(err) = result.as_ref().err().and_then(|e| e.downcast_ref::<TimbangError>()) {
        error!(
            code = err.error_code(),
            recoverable = err.is_recoverable(),
            "Command failed"
        );
    }
    result
}

async fn run(
    state: &AppState,
    command: AdapterCommand,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        AdapterCommand::Scan { duration } => {
            let devices = commands::scan(state, duration).await?;
            if devices.is_empty() && format == OutputFormat::Text {
                eprintln!("No scales found");
            }
            for device in &devices {
                println!("{}", format.device(device));
            }
        }
        AdapterCommand::Read(target) => {
            let reading = commands::read(state, &target).await?;
            println!("{}", format.reading(&reading));
        }
        AdapterCommand::Watch(target) => {
            let sink = move |reading: &timbang_core::WeightReading| {
                println!("{}", format.reading(reading));
            };
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
            };
            let device = commands::watch(state, &target, sink, shutdown).await?;
            info!(device_id = %device.id, "Stopped watching");
        }
        AdapterCommand::Binding { license } => match commands::binding(state, &license)? {
            Some(binding) => println!("{}", format.binding(&binding)),
            None => eprintln!("No scale is bound to {license}"),
        },
        AdapterCommand::Reset => {
            state.session().destroy().await;
            eprintln!("All bindings forgotten");
        }
    }
    Ok(())
}
