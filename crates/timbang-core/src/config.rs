//! Application settings management.
//!
//! Handles loading, saving, and validating timbang settings:
//! - Scan duration and the scale name vocabulary
//! - Weight Scale service / Weight Measurement characteristic identifiers
//! - Location of the binding store
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `TIMBANG_<SECTION>__<KEY>` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scanner::DEFAULT_NAME_TOKENS;
use crate::transport::{WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID, WEIGHT_SCALE_SERVICE_UUID};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TIMBANG";

/// Upper bound for a single scan.
pub const MAX_SCAN_DURATION_SECS: u64 = 300;

static DEVICE_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("device address regex is valid")
});

/// Errors that can occur during settings operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// An explicitly requested settings file does not exist.
    #[error("Settings file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Layered loading or deserialisation failed.
    #[error("Failed to load settings: {0}")]
    LoadError(#[from] config::ConfigError),

    /// Failed to serialise settings to TOML.
    #[error("Failed to serialize settings: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Failed to write the settings file.
    #[error("Failed to write settings file {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A single field failed validation.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// Dotted field name.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("Multiple validation errors: {}", format_errors(.0))]
    MultipleValidationErrors(Vec<SettingsError>),
}

fn format_errors(errors: &[SettingsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SettingsError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for settings operations.
pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Device discovery.
    pub scanner: ScannerSettings,

    /// Connection and subscription.
    pub session: SessionSettings,

    /// Binding persistence.
    pub storage: StorageSettings,
}

/// Device discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// How long a scan listens for advertisements.
    pub duration_secs: u64,

    /// How long to wait for the adapter to power on before giving up.
    pub power_on_timeout_secs: u64,

    /// Case-insensitive name fragments identifying a scale.
    pub name_tokens: Vec<String>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            power_on_timeout_secs: 5,
            name_tokens: DEFAULT_NAME_TOKENS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ScannerSettings {
    /// Scan duration as a [`Duration`].
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Power-on wait as a [`Duration`].
    #[must_use]
    pub const fn power_on_timeout(&self) -> Duration {
        Duration::from_secs(self.power_on_timeout_secs)
    }
}

/// Connection and subscription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Service carrying the measurement characteristic.
    pub service_uuid: Uuid,

    /// Measurement characteristic read and subscribed to.
    pub characteristic_uuid: Uuid,

    /// Capacity of the notification channel handed to transports.
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            service_uuid: WEIGHT_SCALE_SERVICE_UUID,
            characteristic_uuid: WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID,
            event_buffer: 32,
        }
    }
}

/// Binding persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Bindings file. Defaults to the platform data directory.
    pub bindings_path: Option<PathBuf>,
}

impl StorageSettings {
    /// Configured bindings path, falling back to the platform default.
    #[must_use]
    pub fn resolved_bindings_path(&self) -> Option<PathBuf> {
        self.bindings_path
            .clone()
            .or_else(crate::storage::default_bindings_path)
    }
}

impl Settings {
    /// Load settings from `path` (required) or the default location (optional),
    /// then apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, any layer fails to
    /// parse, or the merged settings are invalid.
    pub fn load(path: Option<&Path>) -> SettingsResult<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(SettingsError::NotFound(path.to_path_buf()));
                }
                builder = builder.add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(
                        config::File::from(default_path)
                            .format(config::FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("scanner.name_tokens")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or the settings are invalid.
    pub fn from_toml_str(content: &str) -> SettingsResult<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub fn save(&self, path: &Path) -> SettingsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SettingsError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| SettingsError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate every section, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`SettingsError::MultipleValidationErrors`].
    pub fn validate(&self) -> SettingsResult<()> {
        let mut errors = Vec::new();

        if self.scanner.duration_secs == 0 || self.scanner.duration_secs > MAX_SCAN_DURATION_SECS {
            errors.push(SettingsError::validation(
                "scanner.duration_secs",
                format!("must be between 1 and {MAX_SCAN_DURATION_SECS}"),
            ));
        }
        if self.scanner.name_tokens.is_empty() {
            errors.push(SettingsError::validation(
                "scanner.name_tokens",
                "at least one name token is required",
            ));
        }
        if self.scanner.name_tokens.iter().any(|t| t.trim().is_empty()) {
            errors.push(SettingsError::validation(
                "scanner.name_tokens",
                "name tokens cannot be blank",
            ));
        }
        if self.session.event_buffer == 0 {
            errors.push(SettingsError::validation(
                "session.event_buffer",
                "must be greater than zero",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SettingsError::MultipleValidationErrors(errors)),
        }
    }
}

/// Default settings file location (`~/.config/timbang/config.toml` on Linux).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "timbang")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Validate a BlueZ-style device address (`AA:BB:CC:DD:EE:FF`).
#[must_use]
pub fn is_valid_device_address(address: &str) -> bool {
    DEVICE_ADDRESS_RE.is_match(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.session.service_uuid, WEIGHT_SCALE_SERVICE_UUID);
        assert!(settings.scanner.name_tokens.iter().any(|t| t == "timbangan"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [scanner]
            duration_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(settings.scanner.duration_secs, 3);
        assert_eq!(settings.scanner.power_on_timeout_secs, 5);
        assert_eq!(settings.session.event_buffer, 32);
    }

    #[test]
    fn test_custom_uuid_and_tokens() {
        let settings = Settings::from_toml_str(
            r#"
            [scanner]
            name_tokens = ["acme"]

            [session]
            characteristic_uuid = "0000fff1-0000-1000-8000-00805f9b34fb"
            "#,
        )
        .unwrap();
        assert_eq!(settings.scanner.name_tokens, vec!["acme".to_string()]);
        assert_eq!(
            settings.session.characteristic_uuid.to_string(),
            "0000fff1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut settings = Settings::default();
        settings.scanner.duration_secs = 0;
        settings.scanner.name_tokens.clear();
        settings.session.event_buffer = 0;

        match settings.validate() {
            Err(SettingsError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error() {
        let mut settings = Settings::default();
        settings.scanner.duration_secs = MAX_SCAN_DURATION_SECS + 1;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.scanner.duration_secs = 7;
        settings.storage.bindings_path = Some(dir.path().join("bindings.json"));
        settings.save(&path).unwrap();

        let loaded = Settings::load(Some(&path)).unwrap();
        assert_eq!(loaded.scanner.duration_secs, 7);
        assert_eq!(loaded.storage.bindings_path, settings.storage.bindings_path);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Settings::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, SettingsError::NotFound(_)));
    }

    #[test]
    fn test_device_address_validation() {
        assert!(is_valid_device_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_device_address("0a:1b:2c:3d:4e:5f"));
        assert!(!is_valid_device_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_device_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_device_address(""));
    }
}
