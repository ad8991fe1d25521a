//! Scriptable in-process [`Transport`] for tests and demos.
//!
//! [`MockTransport`] simulates an adapter with a fixed set of
//! [`MockDevice`]s. Tests drive it from the outside: push advertisements and
//! notifications, flip the adapter state, or make the next connect,
//! discovery or subscribe step fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::transport::{
    AdapterState, Advertisement, CharacteristicInfo, CharacteristicValue, NotificationEvent,
    PeripheralInfo, Subscription, SubscriptionId, Transport, TransportError, TransportResult,
    WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID, WEIGHT_SCALE_SERVICE_UUID,
};
use crate::types::DeviceId;

const CHANNEL_CAPACITY: usize = 64;

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// Identity.
    pub id: DeviceId,
    /// Advertised name.
    pub name: Option<String>,
    /// Advertised signal strength.
    pub rssi: Option<i16>,
    /// Characteristics exposed after connecting.
    pub characteristics: Vec<CharacteristicInfo>,
    /// Value returned by direct reads.
    pub value: Option<CharacteristicValue>,
}

impl MockDevice {
    /// A scale exposing the standard Weight Measurement characteristic.
    pub fn scale(id: impl Into<DeviceId>, name: &str) -> Self {
        Self {
            id: id.into(),
            name: Some(name.to_string()),
            rssi: Some(-60),
            characteristics: vec![CharacteristicInfo {
                service: WEIGHT_SCALE_SERVICE_UUID,
                characteristic: WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID,
            }],
            value: None,
        }
    }

    /// An advertiser that is not a scale.
    pub fn other(id: impl Into<DeviceId>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(ToString::to_string),
            rssi: Some(-70),
            characteristics: Vec::new(),
            value: None,
        }
    }

    /// Set the value returned by direct reads.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<CharacteristicValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the advertised signal strength.
    #[must_use]
    pub const fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Remove every characteristic.
    #[must_use]
    pub fn without_characteristics(mut self) -> Self {
        self.characteristics.clear();
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
        }
    }
}

#[derive(Debug, Default)]
struct Failures {
    connect: Option<TransportError>,
    discover: Option<TransportError>,
    subscribe: Option<TransportError>,
    read: Option<TransportError>,
    stop_discovery: Option<TransportError>,
    cancel_connection: Option<TransportError>,
    shutdown: Option<TransportError>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<DeviceId, MockDevice>,
    discovery: Option<mpsc::Sender<Advertisement>>,
    connected: HashSet<DeviceId>,
    subscriptions: HashMap<SubscriptionId, (DeviceId, mpsc::Sender<NotificationEvent>)>,
    failures: Failures,
    connect_calls: Vec<DeviceId>,
    stop_discovery_calls: usize,
    shutdown_calls: usize,
    latency: Option<Duration>,
}

/// In-memory transport with scriptable behaviour.
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    adapter: watch::Sender<AdapterState>,
    next_subscription: AtomicU64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A powered-on adapter with no devices.
    #[must_use]
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::PoweredOn);
        Self {
            state: Mutex::new(MockState::default()),
            adapter,
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Builder: add a device.
    #[must_use]
    pub fn with_device(self, device: MockDevice) -> Self {
        self.add_device(device);
        self
    }

    /// Builder: start in the given adapter state.
    #[must_use]
    pub fn with_adapter_state(self, state: AdapterState) -> Self {
        self.set_adapter_state(state);
        self
    }

    /// Builder: sleep for `latency` at the start of every `connect`,
    /// characteristic discovery and `subscribe`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_powered(&self) -> TransportResult<()> {
        let state = *self.adapter.borrow();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(TransportError::Unavailable { state })
        }
    }

    fn ensure_connected(&self, id: &DeviceId) -> TransportResult<()> {
        if self.state().connected.contains(id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected { id: id.clone() })
        }
    }

    fn find_characteristic(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<MockDevice> {
        let state = self.state();
        let device = state
            .devices
            .get(id)
            .ok_or_else(|| TransportError::DeviceNotFound { id: id.clone() })?;
        let wanted = CharacteristicInfo {
            service,
            characteristic,
        };
        if device.characteristics.contains(&wanted) {
            Ok(device.clone())
        } else {
            Err(TransportError::CharacteristicNotFound {
                service,
                characteristic,
            })
        }
    }

    /// Add or replace a device.
    pub fn add_device(&self, device: MockDevice) {
        self.state().devices.insert(device.id.clone(), device);
    }

    /// Change the adapter state and notify watchers.
    pub fn set_adapter_state(&self, state: AdapterState) {
        self.adapter.send_replace(state);
    }

    /// Push an advertisement into a running discovery. Returns `false` if
    /// discovery is not running.
    pub async fn advertise(&self, advertisement: Advertisement) -> bool {
        let sender = self.state().discovery.clone();
        match sender {
            Some(tx) => tx.send(advertisement).await.is_ok(),
            None => false,
        }
    }

    /// Deliver a value to every subscription on `id`. Returns how many
    /// subscriptions received it.
    pub async fn notify(&self, id: &DeviceId, value: impl Into<CharacteristicValue>) -> usize {
        self.push(id, Ok(value.into())).await
    }

    /// Deliver a stream error to every subscription on `id`.
    pub async fn notify_error(&self, id: &DeviceId, error: TransportError) -> usize {
        self.push(id, Err(error)).await
    }

    async fn push(&self, id: &DeviceId, event: NotificationEvent) -> usize {
        let senders: Vec<_> = self
            .state()
            .subscriptions
            .values()
            .filter(|(device, _)| device == id)
            .map(|(_, tx)| tx.clone())
            .collect();

        let mut delivered = 0;
        for tx in senders {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Make the next `connect` fail.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.state().failures.connect = Some(error);
    }

    /// Make the next characteristic discovery fail.
    pub fn fail_next_discovery(&self, error: TransportError) {
        self.state().failures.discover = Some(error);
    }

    /// Make the next `subscribe` fail.
    pub fn fail_next_subscribe(&self, error: TransportError) {
        self.state().failures.subscribe = Some(error);
    }

    /// Make the next direct read fail.
    pub fn fail_next_read(&self, error: TransportError) {
        self.state().failures.read = Some(error);
    }

    /// Make the next `stop_discovery` fail.
    pub fn fail_next_stop_discovery(&self, error: TransportError) {
        self.state().failures.stop_discovery = Some(error);
    }

    /// Make the next `cancel_connection` fail.
    pub fn fail_next_cancel_connection(&self, error: TransportError) {
        self.state().failures.cancel_connection = Some(error);
    }

    /// Make the next `shutdown` fail.
    pub fn fail_next_shutdown(&self, error: TransportError) {
        self.state().failures.shutdown = Some(error);
    }

    /// Whether `id` currently has an open connection.
    #[must_use]
    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.state().connected.contains(id)
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state().connected.len()
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Every device `connect` was called with, in order.
    #[must_use]
    pub fn connect_calls(&self) -> Vec<DeviceId> {
        self.state().connect_calls.clone()
    }

    /// Whether discovery is running.
    #[must_use]
    pub fn is_discovering(&self) -> bool {
        self.state().discovery.is_some()
    }

    /// How many times `stop_discovery` was called.
    #[must_use]
    pub fn stop_discovery_calls(&self) -> usize {
        self.state().stop_discovery_calls
    }

    /// How many times `shutdown` was called.
    #[must_use]
    pub fn shutdown_calls(&self) -> usize {
        self.state().shutdown_calls
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn adapter_state(&self) -> TransportResult<AdapterState> {
        Ok(*self.adapter.borrow())
    }

    fn state_changes(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    async fn start_discovery(&self) -> TransportResult<mpsc::Receiver<Advertisement>> {
        self.ensure_powered()?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut state = self.state();
        for device in state.devices.values() {
            // Capacity exceeded only with very large fixtures; extra devices are dropped.
            let _ = tx.try_send(device.advertisement());
        }
        state.discovery = Some(tx);
        Ok(rx)
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.stop_discovery_calls += 1;
        state.discovery = None;
        state.failures.stop_discovery.take().map_or(Ok(()), Err)
    }

    async fn connect(&self, id: &DeviceId) -> TransportResult<PeripheralInfo> {
        self.ensure_powered()?;
        self.delay().await;
        let mut state = self.state();
        state.connect_calls.push(id.clone());
        if let Some(error) = state.failures.connect.take() {
            return Err(error);
        }
        let device = state
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound { id: id.clone() })?;
        state.connected.insert(id.clone());

        Ok(PeripheralInfo {
            id: device.id,
            name: device.name,
            rssi: device.rssi,
        })
    }

    async fn cancel_connection(&self, id: &DeviceId) -> TransportResult<()> {
        let mut state = self.state();
        if let Some(error) = state.failures.cancel_connection.take() {
            return Err(error);
        }
        state.connected.remove(id);
        // A dropped link ends its notifications.
        state.subscriptions.retain(|_, (device, _)| device != id);
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
    ) -> TransportResult<Vec<CharacteristicInfo>> {
        self.delay().await;
        self.ensure_connected(id)?;
        let mut state = self.state();
        if let Some(error) = state.failures.discover.take() {
            return Err(error);
        }
        state
            .devices
            .get(id)
            .map(|device| device.characteristics.clone())
            .ok_or_else(|| TransportError::DeviceNotFound { id: id.clone() })
    }

    async fn read_characteristic(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<CharacteristicValue> {
        self.ensure_connected(id)?;
        if let Some(error) = self.state().failures.read.take() {
            return Err(error);
        }
        self.find_characteristic(id, service, characteristic)?
            .value
            .ok_or_else(|| TransportError::Operation("characteristic has no value".into()))
    }

    async fn subscribe(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Subscription> {
        self.delay().await;
        self.ensure_connected(id)?;
        if let Some(error) = self.state().failures.subscribe.take() {
            return Err(error);
        }
        self.find_characteristic(id, service, characteristic)?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let subscription_id =
            SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.state()
            .subscriptions
            .insert(subscription_id, (id.clone(), tx));

        Ok(Subscription {
            id: subscription_id,
            events: rx,
        })
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> TransportResult<()> {
        self.state().subscriptions.remove(&subscription);
        Ok(())
    }

    async fn shutdown(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.shutdown_calls += 1;
        if let Some(error) = state.failures.shutdown.take() {
            return Err(error);
        }
        state.discovery = None;
        state.subscriptions.clear();
        state.connected.clear();
        Ok(())
    }
}
