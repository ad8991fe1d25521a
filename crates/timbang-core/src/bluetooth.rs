//! BlueZ transport backed by `bluer`.
//!
//! Requires a running `bluetoothd`. Device ids are adapter addresses in
//! `AA:BB:CC:DD:EE:FF` form.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::is_valid_device_address;
use crate::transport::{
    AdapterState, Advertisement, CharacteristicInfo, CharacteristicValue, PeripheralInfo,
    Subscription, SubscriptionId, Transport, TransportError, TransportResult,
};
use crate::types::DeviceId;

const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

fn operation(err: bluer::Error) -> TransportError {
    TransportError::Operation(err.to_string())
}

const fn powered_state(powered: bool) -> AdapterState {
    if powered {
        AdapterState::PoweredOn
    } else {
        AdapterState::PoweredOff
    }
}

/// Parse a device id as a Bluetooth address.
fn parse_address(id: &DeviceId) -> TransportResult<Address> {
    if !is_valid_device_address(id.as_str()) {
        return Err(TransportError::DeviceNotFound { id: id.clone() });
    }
    id.as_str()
        .parse()
        .map_err(|_| TransportError::DeviceNotFound { id: id.clone() })
}

/// [`Transport`] over the default BlueZ adapter.
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
    state: watch::Sender<AdapterState>,
    state_task: JoinHandle<()>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_subscription: AtomicU64,
    event_buffer: usize,
}

impl std::fmt::Debug for BluerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluerTransport")
            .field("adapter", &self.adapter.name())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl BluerTransport {
    /// Open the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] if BlueZ cannot be reached or
    /// no adapter exists.
    pub async fn new(event_buffer: usize) -> TransportResult<Self> {
        let unsupported = |e: bluer::Error| {
            warn!(error = %e, "BlueZ is not available");
            TransportError::Unavailable {
                state: AdapterState::Unsupported,
            }
        };
        let session = Session::new().await.map_err(unsupported)?;
        let adapter = session.default_adapter().await.map_err(unsupported)?;

        let powered = adapter.is_powered().await.map_err(operation)?;
        let (state, _) = watch::channel(powered_state(powered));
        let events = adapter.events().await.map_err(operation)?;
        let state_task = tokio::spawn(track_power(events, state.clone()));

        info!(adapter = adapter.name(), powered, "Bluetooth adapter opened");
        Ok(Self {
            _session: session,
            adapter,
            state,
            state_task,
            discovery: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            event_buffer: event_buffer.max(1),
        })
    }

    fn discovery(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, JoinHandle<()>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_powered(&self) -> TransportResult<()> {
        let state = *self.state.borrow();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(TransportError::Unavailable { state })
        }
    }

    async fn connected_device(&self, id: &DeviceId) -> TransportResult<bluer::Device> {
        let device = self
            .adapter
            .device(parse_address(id)?)
            .map_err(operation)?;
        if device.is_connected().await.map_err(operation)? {
            Ok(device)
        } else {
            Err(TransportError::NotConnected { id: id.clone() })
        }
    }

    /// BlueZ populates the GATT database asynchronously after connecting.
    async fn wait_services_resolved(device: &bluer::Device) -> TransportResult<()> {
        let resolve = async {
            loop {
                if device.is_services_resolved().await.map_err(operation)? {
                    return Ok(());
                }
                tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
            }
        };
        tokio::time::timeout(SERVICES_RESOLVE_TIMEOUT, resolve)
            .await
            .map_err(|_| TransportError::Operation("timed out resolving GATT services".into()))?
    }

    async fn find_characteristic(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Characteristic> {
        let device = self.connected_device(id).await?;
        Self::wait_services_resolved(&device).await?;

        for remote_service in device.services().await.map_err(operation)? {
            if remote_service.uuid().await.map_err(operation)? != service {
                continue;
            }
            for remote in remote_service.characteristics().await.map_err(operation)? {
                if remote.uuid().await.map_err(operation)? == characteristic {
                    return Ok(remote);
                }
            }
        }
        Err(TransportError::CharacteristicNotFound {
            service,
            characteristic,
        })
    }
}

async fn track_power(
    events: impl futures::Stream<Item = AdapterEvent> + Send,
    state: watch::Sender<AdapterState>,
) {
    let mut events = pin!(events);
    while let Some(event) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            debug!(powered, "Adapter power changed");
            state.send_replace(powered_state(powered));
        }
    }
}

async fn forward_advertisements(
    adapter: Adapter,
    events: impl futures::Stream<Item = AdapterEvent> + Send,
    tx: mpsc::Sender<Advertisement>,
) {
    let mut events = pin!(events);
    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let Ok(device) = adapter.device(address) else {
            continue;
        };
        let advertisement = Advertisement {
            id: DeviceId::new(address.to_string()),
            name: device.name().await.ok().flatten(),
            rssi: device.rssi().await.ok().flatten(),
        };
        trace!(device_id = %advertisement.id, "Advertisement received");
        if tx.send(advertisement).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for BluerTransport {
    async fn adapter_state(&self) -> TransportResult<AdapterState> {
        let powered = self.adapter.is_powered().await.map_err(operation)?;
        let state = powered_state(powered);
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        Ok(state)
    }

    fn state_changes(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    async fn start_discovery(&self) -> TransportResult<mpsc::Receiver<Advertisement>> {
        self.ensure_powered()?;
        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: false,
                ..DiscoveryFilter::default()
            })
            .await
            .map_err(operation)?;
        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(operation)?;

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let task = tokio::spawn(forward_advertisements(self.adapter.clone(), events, tx));
        if let Some(previous) = self.discovery().replace(task) {
            previous.abort();
        }
        debug!("Discovery started");
        Ok(rx)
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        // Dropping the event stream ends the BlueZ discovery session.
        if let Some(task) = self.discovery().take() {
            task.abort();
            debug!("Discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> TransportResult<PeripheralInfo> {
        self.ensure_powered()?;
        let device = self
            .adapter
            .device(parse_address(id)?)
            .map_err(operation)?;

        if !device.is_connected().await.map_err(operation)? {
            device.connect().await.map_err(|e| match e.kind {
                bluer::ErrorKind::NotFound => TransportError::DeviceNotFound { id: id.clone() },
                _ => operation(e),
            })?;
        }

        Ok(PeripheralInfo {
            id: id.clone(),
            name: device.name().await.ok().flatten(),
            rssi: device.rssi().await.ok().flatten(),
        })
    }

    async fn cancel_connection(&self, id: &DeviceId) -> TransportResult<()> {
        let device = self
            .adapter
            .device(parse_address(id)?)
            .map_err(operation)?;
        if device.is_connected().await.map_err(operation)? {
            device.disconnect().await.map_err(operation)?;
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
    ) -> TransportResult<Vec<CharacteristicInfo>> {
        let device = self.connected_device(id).await?;
        Self::wait_services_resolved(&device).await?;

        let mut found = Vec::new();
        for remote_service in device.services().await.map_err(operation)? {
            let service = remote_service.uuid().await.map_err(operation)?;
            for remote in remote_service.characteristics().await.map_err(operation)? {
                found.push(CharacteristicInfo {
                    service,
                    characteristic: remote.uuid().await.map_err(operation)?,
                });
            }
        }
        Ok(found)
    }

    async fn read_characteristic(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<CharacteristicValue> {
        let remote = self.find_characteristic(id, service, characteristic).await?;
        let value = remote.read().await.map_err(operation)?;
        Ok(CharacteristicValue::Bytes(value))
    }

    async fn subscribe(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Subscription> {
        let remote = self.find_characteristic(id, service, characteristic).await?;
        let notifications = remote.notify().await.map_err(operation)?;

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let subscription_id =
            SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let device_id = id.clone();
        let task = tokio::spawn(async move {
            let mut notifications = pin!(notifications);
            while let Some(value) = notifications.next().await {
                if tx.send(Ok(CharacteristicValue::Bytes(value))).await.is_err() {
                    return;
                }
            }
            // BlueZ ends the stream when the link drops.
            let _ = tx
                .send(Err(TransportError::NotConnected { id: device_id }))
                .await;
        });
        self.subscriptions().insert(subscription_id, task);

        Ok(Subscription {
            id: subscription_id,
            events: rx,
        })
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> TransportResult<()> {
        if let Some(task) = self.subscriptions().remove(&subscription) {
            task.abort();
        }
        Ok(())
    }

    async fn shutdown(&self) -> TransportResult<()> {
        if let Some(task) = self.discovery().take() {
            task.abort();
        }
        for (_, task) in self.subscriptions().drain() {
            task.abort();
        }
        debug!("Bluetooth transport shut down");
        Ok(())
    }
}

impl Drop for BluerTransport {
    fn drop(&mut self) {
        self.state_task.abort();
        if let Some(task) = self.discovery().take() {
            task.abort();
        }
        for (_, task) in self.subscriptions().drain() {
            task.abort();
        }
    }
}
