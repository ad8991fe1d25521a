//! Command implementations.
//!
//! Each command takes the shared [`AppState`] and returns plain domain values;
//! `main` decides how to print them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use timbang_core::config::default_config_path;
use timbang_core::{Device, LicenseBinding, LicenseKey, Settings, TimbangError, WeightReading};
use tracing::{info, warn};

use crate::cli::Target;
use crate::state::AppState;

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One human readable line per item.
    Text,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    /// Select JSON when `json` is set.
    #[must_use]
    pub const fn from_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Text
        }
    }

    /// Render a discovered device.
    #[must_use]
    pub fn device(self, device: &Device) -> String {
        match self {
            Self::Json => to_json_line(device),
            Self::Text => {
                let rssi = device
                    .rssi
                    .map_or_else(|| "   ?".to_string(), |r| format!("{r:>4}"));
                format!("{}  {rssi} dBm  {}", device.id, device.name)
            }
        }
    }

    /// Render a weight reading.
    #[must_use]
    pub fn reading(self, reading: &WeightReading) -> String {
        match self {
            Self::Json => to_json_line(reading),
            Self::Text => format!(
                "{}  {reading}{}",
                reading.timestamp.format("%H:%M:%S"),
                if reading.stable { "" } else { "  (settling)" }
            ),
        }
    }

    /// Render a stored binding.
    #[must_use]
    pub fn binding(self, binding: &LicenseBinding) -> String {
        match self {
            Self::Json => to_json_line(binding),
            Self::Text => format!(
                "{} -> {} ({}), last connected {}, auto-reconnect {}",
                binding.license_key,
                binding.device_id,
                binding.device_name,
                binding.last_connected_at.to_rfc3339(),
                if binding.auto_reconnect { "on" } else { "off" }
            ),
        }
    }
}

fn to_json_line<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#))
}

async fn ensure_powered(state: &AppState) -> anyhow::Result<()> {
    let timeout = state.settings().scanner.power_on_timeout();
    state
        .scanner()
        .wait_for_power_on(timeout)
        .await
        .context("Bluetooth is not available")
}

/// Scan for scales for `duration_secs`, or the configured duration.
///
/// # Errors
///
/// Returns an error if the adapter does not power on or discovery fails.
pub async fn scan(state: &AppState, duration_secs: Option<u64>) -> anyhow::Result<Vec<Device>> {
    ensure_powered(state).await?;
    let duration =
        duration_secs.map_or_else(|| state.settings().scanner.duration(), Duration::from_secs);
    let devices = state.scanner().scan(duration).await?;
    info!(count = devices.len(), "Scan finished");
    Ok(devices)
}

/// Connect to the target device, or the one bound to its license.
async fn connect(state: &AppState, target: &Target) -> anyhow::Result<Device> {
    let license_key = target.license_key();
    let result = match &target.device {
        Some(device_id) => state.session().connect(&license_key, device_id).await,
        None => state.session().auto_connect(&license_key).await,
    };
    result.map_err(|e| {
        if e.requires_rescan() {
            anyhow::Error::new(e)
                .context("no scale is bound to this license; run `timbang scan` and pass --device")
        } else {
            e.into()
        }
    })
}

/// Connect, take one reading, and disconnect.
///
/// # Errors
///
/// Returns an error if connecting or reading fails. The session is idle
/// afterwards either way.
pub async fn read(state: &AppState, target: &Target) -> anyhow::Result<WeightReading> {
    ensure_powered(state).await?;
    let device = connect(state, target).await?;
    info!(device_id = %device.id, "Reading weight");

    let reading = state.session().read_weight().await;
    if let Err(e) = state.session().disconnect().await {
        warn!(error = %e, "Disconnect after read failed");
    }
    Ok(reading?)
}

/// Connect and hand every streamed reading to `sink` until `shutdown`
/// completes.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn watch<F, S>(
    state: &AppState,
    target: &Target,
    sink: S,
    shutdown: F,
) -> anyhow::Result<Device>
where
    F: Future<Output = ()>,
    S: Fn(&WeightReading) + Send + Sync + 'static,
{
    ensure_powered(state).await?;
    let device = connect(state, target).await?;
    let token = state.session().subscribe(sink);
    info!(device_id = %device.id, "Streaming readings");

    shutdown.await;

    token.unsubscribe();
    if let Err(e) = state.session().disconnect().await {
        warn!(error = %e, "Disconnect after watch failed");
    }
    Ok(device)
}

/// Write default settings to `path`, or the platform config location.
///
/// # Errors
///
/// Returns an error if the file exists and `force` is unset, or it cannot
/// be written.
pub fn init_settings(path: Option<&Path>, force: bool) -> anyhow::Result<PathBuf> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path().context("no config directory on this platform")?,
    };
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    Settings::default()
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Settings written");
    Ok(path)
}

/// Look up the binding stored for `license`.
///
/// # Errors
///
/// Returns an error if the binding store cannot be read.
pub fn binding(state: &AppState, license: &str) -> anyhow::Result<Option<LicenseBinding>> {
    let binding = state
        .session()
        .store()
        .get(&LicenseKey::new(license))
        .map_err(TimbangError::from)?;
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use timbang_core::{
        AdapterState, DeviceId, MemoryBindingStore, MockDevice, MockTransport, SessionPhase,
        Transport, WeightUnit,
    };

    const SCALE: &str = "C8:47:8C:00:12:34";

    fn app(transport: &Arc<MockTransport>) -> AppState {
        AppState::with_parts(
            Settings::default(),
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(MemoryBindingStore::new()),
        )
    }

    fn mock() -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .with_device(
                    MockDevice::scale(SCALE, "RENPHO ES-CS20M")
                        .with_rssi(-61)
                        .with_value(vec![0x00, 0x10, 0x27]),
                )
                .with_device(MockDevice::other("11:22:33:44:55:66", Some("Headphones"))),
        )
    }

    fn target(device: Option<&str>) -> Target {
        Target {
            license: "LIC-7".into(),
            device: device.map(DeviceId::new),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_lists_only_scales() {
        let transport = mock();
        let devices = scan(&app(&transport), Some(2)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id.as_str(), SCALE);
        assert_eq!(devices[0].rssi, Some(-61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_fails_when_adapter_stays_off() {
        let transport = mock();
        transport.set_adapter_state(AdapterState::PoweredOff);
        assert!(scan(&app(&transport), Some(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_read_binds_and_disconnects() {
        let transport = mock();
        let state = app(&transport);

        let reading = read(&state, &target(Some(SCALE))).await.unwrap();
        assert_eq!(reading.unit, WeightUnit::Kilograms);
        assert!((reading.weight - 40.96).abs() < 1e-9);

        assert_eq!(state.session().status().await.phase, SessionPhase::Idle);
        assert_eq!(transport.connection_count(), 0);
        let bound = binding(&state, "LIC-7").unwrap().unwrap();
        assert_eq!(bound.device_id.as_str(), SCALE);

        // The binding now drives a device-less read.
        read(&state, &target(None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_without_binding_suggests_scan() {
        let transport = mock();
        let err = read(&app(&transport), &target(None)).await.unwrap_err();
        assert!(err.to_string().contains("timbang scan"));
        assert!(transport.connect_calls().is_empty());
    }

    #[tokio::test]
    async fn test_watch_streams_until_shutdown() {
        let transport = mock();
        let state = app(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = {
            let seen = Arc::clone(&seen);
            move |r: &WeightReading| seen.lock().unwrap().push(r.weight)
        };
        let shutdown = {
            let transport = Arc::clone(&transport);
            let seen = Arc::clone(&seen);
            async move {
                while transport.subscription_count() == 0 {
                    tokio::task::yield_now().await;
                }
                transport
                    .notify(&DeviceId::new(SCALE), vec![0x01, 0xE8, 0x03])
                    .await;
                while seen.lock().unwrap().is_empty() {
                    tokio::task::yield_now().await;
                }
            }
        };

        let device = watch(&state, &target(Some(SCALE)), sink, shutdown)
            .await
            .unwrap();
        assert_eq!(device.name, "RENPHO ES-CS20M");
        assert_eq!(seen.lock().unwrap().as_slice(), &[10.0]);
        assert!(state.session().observers().is_empty());
        assert!(!state.session().status().await.connected);
    }

    #[test]
    fn test_init_settings_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timbang").join("config.toml");

        assert_eq!(init_settings(Some(&path), false).unwrap(), path);
        assert_eq!(Settings::load(Some(&path)).unwrap(), Settings::default());

        assert!(init_settings(Some(&path), false).is_err());
        assert!(init_settings(Some(&path), true).is_ok());
    }

    #[test]
    fn test_text_rendering() {
        let device = Device {
            id: DeviceId::new(SCALE),
            name: "Scale".into(),
            rssi: None,
            connected: false,
        };
        assert_eq!(
            OutputFormat::Text.device(&device),
            format!("{SCALE}     ? dBm  Scale")
        );
    }

    #[test]
    fn test_json_rendering() {
        let device = Device {
            id: DeviceId::new(SCALE),
            name: "Scale".into(),
            rssi: Some(-70),
            connected: false,
        };
        let line = OutputFormat::from_flag(true).device(&device);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], SCALE);
        assert_eq!(value["rssi"], -70);
    }
}
