//! Bluetooth Low Energy transport port.
//!
//! The session and scanner never talk to a radio directly. They drive a
//! [`Transport`] implementation, which delivers discovery results and
//! characteristic notifications as events on channels:
//!
//! - [`Transport::start_discovery`] returns a receiver of [`Advertisement`]s
//! - [`Transport::subscribe`] returns a [`Subscription`] whose receiver yields
//!   one [`NotificationEvent`] per characteristic value change
//!
//! Closing those channels, or calling [`Transport::stop_discovery`] /
//! [`Transport::unsubscribe`], are the only cancellation points.

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::types::DeviceId;

/// Bluetooth SIG Weight Scale service (`0x181D`).
pub const WEIGHT_SCALE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_181d_0000_1000_8000_0080_5f9b_34fb);

/// Bluetooth SIG Weight Measurement characteristic (`0x2A9D`).
pub const WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_2a9d_0000_1000_8000_0080_5f9b_34fb);

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    /// State not yet known.
    #[default]
    Unknown,
    /// Adapter is restarting.
    Resetting,
    /// No Bluetooth LE support on this host.
    Unsupported,
    /// The process lacks permission to use Bluetooth.
    Unauthorized,
    /// Adapter present but switched off.
    PoweredOff,
    /// Adapter ready for use.
    PoweredOn,
}

impl AdapterState {
    /// Returns `true` when scanning and connecting are possible.
    #[must_use]
    pub const fn is_powered_on(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// One advertising report from discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser identity.
    pub id: DeviceId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
}

/// A GATT characteristic found during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicInfo {
    /// Owning service.
    pub service: Uuid,
    /// Characteristic identifier.
    pub characteristic: Uuid,
}

/// Result of connecting to a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    /// Identity the connection was opened for.
    pub id: DeviceId,
    /// Name resolved by the transport, if any.
    pub name: Option<String>,
    /// Signal strength at connect time.
    pub rssi: Option<i16>,
}

/// Byte-bearing characteristic value as delivered by a transport.
///
/// Native stacks hand over raw bytes; bridged stacks frequently deliver
/// base64 text instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicValue {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Standard base64 text.
    Base64(String),
}

impl CharacteristicValue {
    /// Returns the raw bytes of this value.
    ///
    /// # Errors
    ///
    /// Returns an error message if a base64 value is malformed.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Base64(text) => base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| e.to_string()),
        }
    }
}

impl From<Vec<u8>> for CharacteristicValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for CharacteristicValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// A single notification on a subscription: a value or a stream error.
pub type NotificationEvent = Result<CharacteristicValue, TransportError>;

/// Identifier of an open characteristic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// An open characteristic subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier to pass to [`Transport::unsubscribe`].
    pub id: SubscriptionId,
    /// Notification stream. Closed by the transport when the subscription ends.
    pub events: mpsc::Receiver<NotificationEvent>,
}

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No usable adapter or the adapter is not powered on.
    #[error("Bluetooth adapter unavailable (state: {state:?})")]
    Unavailable {
        /// State reported by the adapter.
        state: AdapterState,
    },

    /// The device identity could not be resolved.
    #[error("Device not found: {id}")]
    DeviceNotFound {
        /// Identity that was looked up.
        id: DeviceId,
    },

    /// An operation needed an open connection to the device.
    #[error("Device {id} is not connected")]
    NotConnected {
        /// Identity of the device.
        id: DeviceId,
    },

    /// The requested service/characteristic pair does not exist.
    #[error("Characteristic {characteristic} of service {service} not found")]
    CharacteristicNotFound {
        /// Service identifier.
        service: Uuid,
        /// Characteristic identifier.
        characteristic: Uuid,
    },

    /// Any other failure reported by the Bluetooth stack.
    #[error("Bluetooth operation failed: {0}")]
    Operation(String),
}

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A Bluetooth LE central as consumed by the session and scanner.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current adapter power state.
    async fn adapter_state(&self) -> TransportResult<AdapterState>;

    /// Adapter state-change notifications.
    fn state_changes(&self) -> watch::Receiver<AdapterState>;

    /// Begin duplicate-suppressing discovery of all advertisers.
    async fn start_discovery(&self) -> TransportResult<mpsc::Receiver<Advertisement>>;

    /// Stop discovery. Stopping when not discovering is not an error.
    async fn stop_discovery(&self) -> TransportResult<()>;

    /// Open a connection to a device by identity.
    async fn connect(&self, id: &DeviceId) -> TransportResult<PeripheralInfo>;

    /// Close or abort a connection. Not an error when already closed.
    async fn cancel_connection(&self, id: &DeviceId) -> TransportResult<()>;

    /// Discover every service and characteristic of a connected device.
    async fn discover_characteristics(
        &self,
        id: &DeviceId,
    ) -> TransportResult<Vec<CharacteristicInfo>>;

    /// Read a characteristic value once.
    async fn read_characteristic(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<CharacteristicValue>;

    /// Subscribe to value notifications of a characteristic.
    async fn subscribe(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Subscription>;

    /// Cancel a subscription. Unknown or closed ids are not an error.
    async fn unsubscribe(&self, subscription: SubscriptionId) -> TransportResult<()>;

    /// Release the underlying Bluetooth resources.
    async fn shutdown(&self) -> TransportResult<()>;
}
