//! Scale discovery.
//!
//! [`Scanner::scan`] listens to advertisements for a fixed wall-clock
//! duration and returns every advertiser whose name looks like a scale.
//! Discovery is always stopped before `scan` returns, and a scan future
//! dropped mid-way schedules the stop on the runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TimbangError};
use crate::transport::{AdapterState, Advertisement, Transport};
use crate::types::{Device, DeviceId};

/// Name fragments that identify a weighing device.
pub const DEFAULT_NAME_TOKENS: &[&str] = &[
    "scale",
    "weight",
    "timbangan",
    "xiaomi",
    "renpho",
    "eufy",
    "withings",
    "etekcity",
    "yunmai",
    "beurer",
    "tanita",
    "omron",
];

/// Case-insensitive substring filter over advertised names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    tokens: Vec<String>,
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_TOKENS.iter().copied())
    }
}

impl NameFilter {
    /// Build a filter from name fragments. Blank fragments are ignored.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Returns `true` if `name` contains any fragment.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.tokens.iter().any(|token| name.contains(token.as_str()))
    }
}

/// Stops discovery when dropped without [`DiscoveryGuard::stop`].
struct DiscoveryGuard {
    transport: Option<Arc<dyn Transport>>,
}

impl DiscoveryGuard {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    async fn stop(mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.stop_discovery().await {
                warn!(error = %e, "Failed to stop discovery");
            }
        }
    }
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        debug!("Scan interrupted, stopping discovery");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.stop_discovery().await {
                        warn!(error = %e, "Failed to stop discovery after interrupted scan");
                    }
                });
            }
            Err(_) => warn!("No runtime available to stop discovery after interrupted scan"),
        }
    }
}

/// Discovers scales through a [`Transport`].
#[derive(Clone)]
pub struct Scanner {
    transport: Arc<dyn Transport>,
    filter: NameFilter,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Create a scanner with the default name vocabulary.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_filter(transport, NameFilter::default())
    }

    /// Create a scanner with a custom name filter.
    #[must_use]
    pub fn with_filter(transport: Arc<dyn Transport>, filter: NameFilter) -> Self {
        Self { transport, filter }
    }

    /// The active name filter.
    #[must_use]
    pub const fn filter(&self) -> &NameFilter {
        &self.filter
    }

    /// Wait until the adapter reports [`AdapterState::PoweredOn`].
    ///
    /// # Errors
    ///
    /// Returns [`TimbangError::TransportUnavailable`] with the last seen state
    /// if the adapter is not powered on within `timeout`.
    pub async fn wait_for_power_on(&self, timeout: Duration) -> Result<()> {
        let mut changes = self.transport.state_changes();
        let current = self.transport.adapter_state().await?;
        if current.is_powered_on() {
            return Ok(());
        }
        info!(state = ?current, "Waiting for Bluetooth adapter to power on");

        let powered = tokio::time::timeout(timeout, changes.wait_for(|s| s.is_powered_on()))
            .await
            .map(|changed| changed.is_ok());
        match powered {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => {
                let last = *changes.borrow();
                warn!(state = ?last, "Bluetooth adapter did not power on");
                Err(TimbangError::TransportUnavailable(last))
            }
        }
    }

    /// Listen for scale advertisements for `duration`.
    ///
    /// The result is deduplicated by device identity, in first-seen order.
    ///
    /// # Errors
    ///
    /// Returns [`TimbangError::TransportUnavailable`] if the adapter is not
    /// powered on, or a transport error if discovery cannot start.
    #[instrument(skip_all, fields(duration_secs = duration.as_secs_f64()))]
    pub async fn scan(&self, duration: Duration) -> Result<Vec<Device>> {
        let state = self.transport.adapter_state().await?;
        if state != AdapterState::PoweredOn {
            warn!(?state, "Bluetooth adapter not powered on, refusing to scan");
            return Err(TimbangError::TransportUnavailable(state));
        }

        let mut advertisements = self.transport.start_discovery().await?;
        let guard = DiscoveryGuard::new(Arc::clone(&self.transport));
        info!("Scanning for scales");

        let mut found = FoundDevices::default();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => break,
                advertisement = advertisements.recv() => match advertisement {
                    Some(advertisement) => self.consider(&mut found, advertisement),
                    None => {
                        debug!("Discovery stream ended early");
                        deadline.as_mut().await;
                        break;
                    }
                },
            }
        }

        guard.stop().await;
        let devices = found.into_devices();
        info!(count = devices.len(), "Scan complete");
        Ok(devices)
    }

    fn consider(&self, found: &mut FoundDevices, advertisement: Advertisement) {
        let Some(name) = advertisement.name.as_deref() else {
            return;
        };
        if !self.filter.matches(name) {
            return;
        }
        let id = advertisement.id.clone();
        if found.insert(advertisement) {
            debug!(device_id = %id, "Scale candidate discovered");
        }
    }
}

/// Deduplicating accumulator preserving first-seen order.
#[derive(Default)]
struct FoundDevices {
    order: Vec<DeviceId>,
    devices: HashMap<DeviceId, Device>,
}

impl FoundDevices {
    /// Returns `true` for a device not seen before.
    fn insert(&mut self, advertisement: Advertisement) -> bool {
        if let Some(existing) = self.devices.get_mut(&advertisement.id) {
            if advertisement.rssi.is_some() {
                existing.rssi = advertisement.rssi;
            }
            return false;
        }
        self.order.push(advertisement.id.clone());
        self.devices.insert(
            advertisement.id.clone(),
            Device {
                id: advertisement.id,
                name: advertisement.name.unwrap_or_default(),
                rssi: advertisement.rssi,
                connected: false,
            },
        );
        true
    }

    fn into_devices(mut self) -> Vec<Device> {
        self.order
            .iter()
            .filter_map(|id| self.devices.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockTransport};

    fn scanner(transport: &Arc<MockTransport>) -> Scanner {
        Scanner::new(Arc::clone(transport) as Arc<dyn Transport>)
    }

    #[test]
    fn test_name_filter_is_case_insensitive() {
        let filter = NameFilter::default();
        assert!(filter.matches("MI SCALE 2"));
        assert!(filter.matches("Timbangan Digital"));
        assert!(filter.matches("RENPHO ES-CS20M"));
        assert!(filter.matches("Body Weight"));
        assert!(!filter.matches("AirPods Pro"));
        assert!(!filter.matches(""));
    }

    #[test]
    fn test_custom_filter_ignores_blank_tokens() {
        let filter = NameFilter::new(["  ", "Acme"]);
        assert!(filter.matches("acme-kitchen"));
        assert!(!filter.matches("anything"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_and_stops_discovery() {
        let transport = Arc::new(
            MockTransport::new()
                .with_device(MockDevice::scale("AA:00:00:00:00:01", "MI SCALE 2"))
                .with_device(MockDevice::other("AA:00:00:00:00:02", Some("AirPods")))
                .with_device(MockDevice::other("AA:00:00:00:00:03", None)),
        );

        let devices = scanner(&transport)
            .scan(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id.as_str(), "AA:00:00:00:00:01");
        assert_eq!(devices[0].name, "MI SCALE 2");
        assert!(!devices[0].connected);
        assert!(!transport.is_discovering());
        assert_eq!(transport.stop_discovery_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_deduplicates_and_refreshes_rssi() {
        let transport = Arc::new(
            MockTransport::new().with_device(MockDevice::scale("S1", "Timbangan").with_rssi(-80)),
        );
        let scanner = scanner(&transport);
        let feeder = Arc::clone(&transport);

        let scan = tokio::spawn(async move { scanner.scan(Duration::from_secs(3)).await });
        while !feeder.is_discovering() {
            tokio::task::yield_now().await;
        }
        assert!(
            feeder
                .advertise(Advertisement {
                    id: DeviceId::new("S1"),
                    name: Some("Timbangan".into()),
                    rssi: Some(-40),
                })
                .await
        );

        let devices = scan.await.unwrap().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].rssi, Some(-40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_waits_full_duration() {
        let transport = Arc::new(MockTransport::new());
        let started = tokio::time::Instant::now();

        let devices = scanner(&transport)
            .scan(Duration::from_secs(4))
            .await
            .unwrap();

        assert!(devices.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_scan_requires_powered_adapter() {
        let transport = Arc::new(MockTransport::new().with_adapter_state(AdapterState::PoweredOff));

        let err = scanner(&transport)
            .scan(Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TimbangError::TransportUnavailable(AdapterState::PoweredOff)
        ));
        assert_eq!(transport.stop_discovery_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_scan_still_stops_discovery() {
        let transport = Arc::new(MockTransport::new());
        let scanner = scanner(&transport);

        let scan = tokio::spawn(async move { scanner.scan(Duration::from_secs(60)).await });
        while !transport.is_discovering() {
            tokio::task::yield_now().await;
        }

        scan.abort();
        assert!(scan.await.unwrap_err().is_cancelled());
        // Let the guard's stop task run.
        for _ in 0..10 {
            if !transport.is_discovering() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!transport.is_discovering());
        assert_eq!(transport.stop_discovery_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_does_not_fail_scan() {
        let transport = Arc::new(
            MockTransport::new().with_device(MockDevice::scale("S1", "Kitchen Scale")),
        );
        transport.fail_next_stop_discovery(crate::transport::TransportError::Operation(
            "busy".into(),
        ));

        let devices = scanner(&transport)
            .scan(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_power_on() {
        let transport = Arc::new(MockTransport::new().with_adapter_state(AdapterState::PoweredOff));
        let scanner = scanner(&transport);

        let mut wait = tokio_test::task::spawn(scanner.wait_for_power_on(Duration::from_secs(5)));
        tokio_test::assert_pending!(wait.poll());

        transport.set_adapter_state(AdapterState::PoweredOn);
        assert!(wait.is_woken());
        tokio_test::assert_ready_ok!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_power_on_times_out() {
        let transport = Arc::new(MockTransport::new().with_adapter_state(AdapterState::Unauthorized));

        let err = scanner(&transport)
            .wait_for_power_on(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TimbangError::TransportUnavailable(AdapterState::Unauthorized)
        ));
    }
}
