//! Connection session state machine.
//!
//! A [`ScaleSession`] owns at most one connected scale, the license it is
//! bound to, and the live Weight Measurement subscription:
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──ok──▶ Connected ──disconnect──▶ Disconnecting ──▶ Idle
//!                         │                                                         ▲
//!                         └────────────── failure (rolled back) ───────────────────┘
//! ```
//!
//! Transitions are serialised: a second `connect` waits for the first to
//! settle. Notifications are decoded and published to the
//! [`ObserverRegistry`] by a pump task owned by the subscription; undecodable
//! payloads and stream errors are logged and never end the session.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionSettings;
use crate::decoder::decode_characteristic_value;
use crate::error::{ConnectFailure, Result, TimbangError};
use crate::observers::{ObserverRegistry, ObserverToken};
use crate::storage::BindingStore;
use crate::transport::{
    CharacteristicInfo, NotificationEvent, PeripheralInfo, SubscriptionId, Transport,
    TransportError,
};
use crate::types::{
    Device, DeviceId, LicenseBinding, LicenseKey, SessionPhase, SessionStatus, WeightReading,
};

/// Device and license of a live connection. Always set and cleared together.
#[derive(Debug, Clone)]
struct ActiveLink {
    device: Device,
    license_key: LicenseKey,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    active: Option<ActiveLink>,
}

/// An open measurement subscription and the task draining it.
#[derive(Debug)]
struct LiveSubscription {
    id: SubscriptionId,
    pump: JoinHandle<()>,
}

impl LiveSubscription {
    fn start(
        id: SubscriptionId,
        events: mpsc::Receiver<NotificationEvent>,
        observers: ObserverRegistry,
        device_id: DeviceId,
    ) -> Self {
        let pump = tokio::spawn(pump_measurements(events, observers, device_id));
        Self { id, pump }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_measurements(
    mut events: mpsc::Receiver<NotificationEvent>,
    observers: ObserverRegistry,
    device_id: DeviceId,
) {
    while let Some(event) = events.recv().await {
        match event {
            Ok(value) => match decode_characteristic_value(&value) {
                Ok(reading) => {
                    let delivered = observers.publish(&reading);
                    debug!(%device_id, %reading, delivered, "Weight reading published");
                }
                Err(e) => {
                    warn!(%device_id, error = %e, "Dropping undecodable weight measurement");
                }
            },
            Err(e) => {
                // The link is left as the transport left it; reconnecting is up to the caller.
                warn!(%device_id, error = %e, "Weight notification stream error");
            }
        }
    }
    debug!(%device_id, "Weight notification stream closed");
}

/// Rolls back a connect whose future is dropped before it settles.
///
/// Records what the attempt has opened so far. If dropped while still
/// armed, a cleanup task unsubscribes, releases the link and resets the
/// phase to idle. That task keeps the transition lock until it is done.
struct PendingConnect {
    transition: Option<OwnedMutexGuard<Option<LiveSubscription>>>,
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<SessionState>>,
    device_id: DeviceId,
    connected: bool,
    subscription: Option<SubscriptionId>,
}

impl PendingConnect {
    fn new(
        transition: OwnedMutexGuard<Option<LiveSubscription>>,
        transport: Arc<dyn Transport>,
        state: Arc<RwLock<SessionState>>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            transition: Some(transition),
            transport,
            state,
            device_id,
            connected: false,
            subscription: None,
        }
    }

    /// Store the outcome and release the transition lock without rolling back.
    fn finish(mut self, live: Option<LiveSubscription>) {
        if let Some(mut transition) = self.transition.take() {
            *transition = live;
        }
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        let Some(transition) = self.transition.take() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let device_id = self.device_id.clone();
        let connected = self.connected;
        let subscription = self.subscription.take();
        warn!(%device_id, connected, "Connect abandoned, rolling back");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(id) = subscription {
                        if let Err(e) = transport.unsubscribe(id).await {
                            debug!(error = %e, "Subscription already closed");
                        }
                    }
                    if connected {
                        if let Err(e) = transport.cancel_connection(&device_id).await {
                            warn!(%device_id, error = %e, "Failed to release abandoned connection");
                        }
                    }
                    {
                        let mut state = state.write().await;
                        if state.active.is_none() {
                            state.phase = SessionPhase::Idle;
                        }
                    }
                    drop(transition);
                    info!(%device_id, "Abandoned connect rolled back");
                });
            }
            Err(_) => {
                if let Ok(mut state) = state.try_write() {
                    if state.active.is_none() {
                        state.phase = SessionPhase::Idle;
                    }
                }
                warn!(%device_id, "No runtime available, link may stay open");
            }
        }
    }
}

/// Session bound to one transport and one binding store.
pub struct ScaleSession {
    transport: Arc<dyn Transport>,
    store: Arc<dyn BindingStore>,
    observers: ObserverRegistry,
    settings: SessionSettings,
    state: Arc<RwLock<SessionState>>,
    /// Held for the duration of every transition.
    subscription: Arc<Mutex<Option<LiveSubscription>>>,
}

impl std::fmt::Debug for ScaleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleSession")
            .field("settings", &self.settings)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

impl ScaleSession {
    /// Create an idle session using the standard Weight Scale identifiers.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn BindingStore>) -> Self {
        Self::with_settings(transport, store, SessionSettings::default())
    }

    /// Create an idle session with explicit settings.
    #[must_use]
    pub fn with_settings(
        transport: Arc<dyn Transport>,
        store: Arc<dyn BindingStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            transport,
            store,
            observers: ObserverRegistry::new(),
            settings,
            state: Arc::new(RwLock::new(SessionState::default())),
            subscription: Arc::new(Mutex::new(None)),
        }
    }

    /// Registry receiving every streamed reading.
    #[must_use]
    pub const fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Register a reading callback. See [`ObserverRegistry::subscribe`].
    pub fn subscribe<F>(&self, callback: F) -> ObserverToken
    where
        F: Fn(&WeightReading) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Binding store used to persist license bindings.
    #[must_use]
    pub fn store(&self) -> &dyn BindingStore {
        self.store.as_ref()
    }

    /// Snapshot of the current state. Never mutates.
    pub async fn status(&self) -> SessionStatus {
        let state = self.state.read().await;
        SessionStatus {
            connected: state.phase == SessionPhase::Connected,
            phase: state.phase,
            device: state.active.as_ref().map(|a| a.device.clone()),
            license_key: state.active.as_ref().map(|a| a.license_key.clone()),
        }
    }

    async fn set_phase(&self, phase: SessionPhase) {
        self.state.write().await.phase = phase;
    }

    /// Connect to `device_id` on behalf of `license_key`.
    ///
    /// An existing connection is torn down first. On success the binding
    /// for `license_key` is overwritten with this device.
    ///
    /// # Errors
    ///
    /// Returns [`TimbangError::ConnectionFailed`] if any step fails; the
    /// session is then idle and no binding was written. Dropping the
    /// returned future mid-way rolls the attempt back the same way.
    #[instrument(skip_all, fields(license_key = %license_key, device_id = %device_id))]
    pub async fn connect(&self, license_key: &LicenseKey, device_id: &DeviceId) -> Result<Device> {
        let mut transition = Arc::clone(&self.subscription).lock_owned().await;

        if self.state.read().await.active.is_some() {
            info!("Already connected, disconnecting first");
            if let Err(e) = self.teardown(&mut transition).await {
                warn!(error = %e, "Previous connection did not close cleanly");
            }
        }

        let mut pending = PendingConnect::new(
            transition,
            Arc::clone(&self.transport),
            Arc::clone(&self.state),
            device_id.clone(),
        );
        self.set_phase(SessionPhase::Connecting).await;
        info!("Connecting to scale");

        match self.establish(license_key, device_id, &mut pending).await {
            Ok((device, live)) => {
                {
                    let mut state = self.state.write().await;
                    state.active = Some(ActiveLink {
                        device: device.clone(),
                        license_key: license_key.clone(),
                    });
                    state.phase = SessionPhase::Connected;
                }
                pending.finish(Some(live));
                info!(name = %device.name, "Scale connected");
                Ok(device)
            }
            Err(failure) => {
                warn!(error = %failure, "Connect failed, session rolled back");
                self.set_phase(SessionPhase::Idle).await;
                pending.finish(None);
                Err(TimbangError::connection_failed(device_id, failure))
            }
        }
    }

    /// Connect and open the subscription, releasing the link on failure.
    async fn establish(
        &self,
        license_key: &LicenseKey,
        device_id: &DeviceId,
        pending: &mut PendingConnect,
    ) -> std::result::Result<(Device, LiveSubscription), ConnectFailure> {
        let peripheral = self.transport.connect(device_id).await?;
        pending.connected = true;

        let opened = self.open_measurements(license_key, &peripheral, pending).await;
        if opened.is_err() {
            self.release_connection(device_id).await;
            pending.connected = false;
        }
        opened
    }

    async fn open_measurements(
        &self,
        license_key: &LicenseKey,
        peripheral: &PeripheralInfo,
        pending: &mut PendingConnect,
    ) -> std::result::Result<(Device, LiveSubscription), ConnectFailure> {
        let wanted = CharacteristicInfo {
            service: self.settings.service_uuid,
            characteristic: self.settings.characteristic_uuid,
        };
        let characteristics = self
            .transport
            .discover_characteristics(&peripheral.id)
            .await?;
        debug!(count = characteristics.len(), "Characteristics discovered");
        if !characteristics.contains(&wanted) {
            return Err(TransportError::CharacteristicNotFound {
                service: wanted.service,
                characteristic: wanted.characteristic,
            }
            .into());
        }

        let subscription = self
            .transport
            .subscribe(&peripheral.id, wanted.service, wanted.characteristic)
            .await?;
        pending.subscription = Some(subscription.id);
        let live = LiveSubscription::start(
            subscription.id,
            subscription.events,
            self.observers.clone(),
            peripheral.id.clone(),
        );

        let device = Device {
            id: peripheral.id.clone(),
            name: peripheral
                .name
                .clone()
                .unwrap_or_else(|| peripheral.id.to_string()),
            rssi: peripheral.rssi,
            connected: true,
        };
        let binding = LicenseBinding {
            license_key: license_key.clone(),
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            auto_reconnect: true,
            last_connected_at: Utc::now(),
        };
        if let Err(e) = self.store.put(binding) {
            self.cancel_subscription(live).await;
            pending.subscription = None;
            return Err(e.into());
        }

        Ok((device, live))
    }

    /// Disconnect the current scale. A no-op when idle.
    ///
    /// The session is idle afterwards even if the transport fails to
    /// release the link.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while releasing the connection.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut subscription = self.subscription.lock().await;
        self.teardown(&mut subscription).await
    }

    async fn teardown(&self, subscription: &mut Option<LiveSubscription>) -> Result<()> {
        let active = {
            let mut state = self.state.write().await;
            if state.active.is_none() {
                state.phase = SessionPhase::Idle;
                return Ok(());
            }
            state.phase = SessionPhase::Disconnecting;
            state.active.clone()
        };

        if let Some(live) = subscription.take() {
            self.cancel_subscription(live).await;
        }

        let released = match &active {
            Some(link) => self.transport.cancel_connection(&link.device.id).await,
            None => Ok(()),
        };

        {
            let mut state = self.state.write().await;
            state.active = None;
            state.phase = SessionPhase::Idle;
        }

        if let Some(link) = active {
            info!(device_id = %link.device.id, license_key = %link.license_key, "Scale disconnected");
        }
        released.map_err(Into::into)
    }

    async fn cancel_subscription(&self, live: LiveSubscription) {
        if let Err(e) = self.transport.unsubscribe(live.id).await {
            debug!(error = %e, "Subscription already closed");
        }
        drop(live);
    }

    async fn release_connection(&self, device_id: &DeviceId) {
        if let Err(e) = self.transport.cancel_connection(device_id).await {
            warn!(%device_id, error = %e, "Failed to release connection");
        }
    }

    /// Reconnect to the scale bound to `license_key` without scanning.
    ///
    /// # Errors
    ///
    /// Returns [`TimbangError::NoSavedConfiguration`] if there is no binding
    /// or auto-reconnect is disabled for it, otherwise as [`Self::connect`].
    #[instrument(skip_all, fields(license_key = %license_key))]
    pub async fn auto_connect(&self, license_key: &LicenseKey) -> Result<Device> {
        match self.store.get(license_key)? {
            Some(binding) if binding.auto_reconnect => {
                info!(device_id = %binding.device_id, "Reconnecting to bound scale");
                self.connect(license_key, &binding.device_id).await
            }
            Some(_) => {
                debug!("Binding has auto-reconnect disabled");
                Err(TimbangError::NoSavedConfiguration(license_key.clone()))
            }
            None => Err(TimbangError::NoSavedConfiguration(license_key.clone())),
        }
    }

    /// Read the current weight directly, bypassing the subscription and
    /// the observers.
    ///
    /// # Errors
    ///
    /// Returns [`TimbangError::NotConnected`] when idle,
    /// [`TimbangError::DecodeFailed`] for a malformed value, or the
    /// transport error of the read.
    pub async fn read_weight(&self) -> Result<WeightReading> {
        let _transition = self.subscription.lock().await;
        let device_id = {
            let state = self.state.read().await;
            match (&state.phase, &state.active) {
                (SessionPhase::Connected, Some(link)) => link.device.id.clone(),
                _ => return Err(TimbangError::NotConnected),
            }
        };

        let value = self
            .transport
            .read_characteristic(
                &device_id,
                self.settings.service_uuid,
                self.settings.characteristic_uuid,
            )
            .await?;
        let reading = decode_characteristic_value(&value)?;
        debug!(%device_id, %reading, "One-shot weight read");
        Ok(reading)
    }

    /// Tear everything down: disconnect, release the transport, clear
    /// observers and bindings. Never fails; every failing step is logged.
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        let mut subscription = self.subscription.lock().await;

        if let Err(e) = self.teardown(&mut subscription).await {
            warn!(error = %e, "Disconnect during destroy failed");
        }
        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "Transport shutdown failed");
        }
        self.observers.clear();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear binding store");
        }
        info!("Session destroyed");
    }
}
