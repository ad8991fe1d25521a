//! Command line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use timbang_core::{DeviceId, LicenseKey};

/// Find, bind and read Bluetooth weight scales.
#[derive(Debug, Parser)]
#[command(name = "timbang", version, about)]
pub struct Cli {
    /// Settings file. Defaults to the platform config directory.
    #[arg(long, global = true, env = "TIMBANG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Production logging: JSON files plus compact stderr.
    #[arg(long, global = true, env = "TIMBANG_PRODUCTION")]
    pub production: bool,

    /// Print results as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for nearby scales.
    Scan {
        /// Scan duration in seconds. Overrides `scanner.duration_secs`.
        #[arg(long, short)]
        duration: Option<u64>,
    },

    /// Connect and stream readings until interrupted.
    Watch(Target),

    /// Connect and take a single reading.
    Read(Target),

    /// Show the device bound to a license.
    Binding {
        /// License key to look up.
        #[arg(long, short)]
        license: String,
    },

    /// Forget every stored binding.
    Reset,

    /// Write a settings file with the defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Commands that run with the adapter and binding store open.
#[derive(Debug)]
pub enum AdapterCommand {
    Scan { duration: Option<u64> },
    Watch(Target),
    Read(Target),
    Binding { license: String },
    Reset,
}

/// A parsed command, split by whether it needs the adapter.
#[derive(Debug)]
pub enum Action {
    /// `init`: only touches the settings file.
    InitSettings { force: bool },
    Adapter(AdapterCommand),
}

impl From<Command> for Action {
    fn from(command: Command) -> Self {
        match command {
            Command::Init { force } => Self::InitSettings { force },
            Command::Scan { duration } => Self::Adapter(AdapterCommand::Scan { duration }),
            Command::Watch(target) => Self::Adapter(AdapterCommand::Watch(target)),
            Command::Read(target) => Self::Adapter(AdapterCommand::Read(target)),
            Command::Binding { license } => Self::Adapter(AdapterCommand::Binding { license }),
            Command::Reset => Self::Adapter(AdapterCommand::Reset),
        }
    }
}

/// Which scale to use on behalf of which license.
#[derive(Debug, Clone, Args)]
pub struct Target {
    /// License key the scale is bound to.
    #[arg(long, short)]
    pub license: String,

    /// Scale address. Without it the saved binding is used.
    #[arg(long, short, value_parser = parse_device_id)]
    pub device: Option<DeviceId>,
}

impl Target {
    /// License key as the domain type.
    #[must_use]
    pub fn license_key(&self) -> LicenseKey {
        LicenseKey::new(self.license.as_str())
    }
}

fn parse_device_id(value: &str) -> Result<DeviceId, String> {
    if timbang_core::is_valid_device_address(value) {
        Ok(DeviceId::new(value.to_ascii_uppercase()))
    } else {
        Err(format!("'{value}' is not a Bluetooth address (AA:BB:CC:DD:EE:FF)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch_with_device() {
        let cli = Cli::try_parse_from([
            "timbang",
            "watch",
            "--license",
            "LIC-1",
            "--device",
            "aa:bb:cc:dd:ee:ff",
        ])
        .unwrap();

        let Command::Watch(target) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(target.license_key().as_str(), "LIC-1");
        assert_eq!(target.device.unwrap().as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_read_without_device() {
        let cli = Cli::try_parse_from(["timbang", "--json", "read", "-l", "LIC-1"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Read(Target { device: None, .. })));
    }

    #[test]
    fn test_rejects_bad_address() {
        let err = Cli::try_parse_from(["timbang", "read", "-l", "LIC-1", "-d", "not-a-mac"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_parse_init() {
        let cli = Cli::try_parse_from(["timbang", "init", "--force"]).unwrap();
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn test_production_help_names_stderr() {
        let command = Cli::command();
        let help = command
            .get_arguments()
            .find(|arg| arg.get_id() == "production")
            .and_then(|arg| arg.get_help())
            .unwrap()
            .to_string();
        assert!(help.contains("stderr"), "{help}");
        assert!(!help.contains("stdout"), "{help}");
    }

    #[test]
    fn test_init_needs_no_adapter() {
        let cli = Cli::try_parse_from(["timbang", "init"]).unwrap();
        assert!(matches!(
            Action::from(cli.command),
            Action::InitSettings { force: false }
        ));

        let cli = Cli::try_parse_from(["timbang", "read", "-l", "LIC-1"]).unwrap();
        assert!(matches!(
            Action::from(cli.command),
            Action::Adapter(AdapterCommand::Read(Target { device: None, .. }))
        ));

        let cli = Cli::try_parse_from(["timbang", "reset"]).unwrap();
        assert!(matches!(
            Action::from(cli.command),
            Action::Adapter(AdapterCommand::Reset)
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["timbang", "scan", "-d", "5", "--config", "/tmp/t.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(matches!(cli.command, Command::Scan { duration: Some(5) }));
    }
}
