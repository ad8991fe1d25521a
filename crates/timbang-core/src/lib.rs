//! # timbang-core
//!
//! Client-side session manager for Bluetooth LE weighing scales that speak
//! the standard Weight Scale service (`0x181D`).
//!
//! This crate provides:
//! - Adapter-aware discovery of scale-like devices
//! - A connection session with rollback, serialised transitions and
//!   per-license device bindings
//! - Decoding of Weight Measurement (`0x2A9D`) payloads
//! - Fan-out of streamed readings to observer callbacks
//!
//! ## Architecture
//!
//! - [`transport`] - The radio port every other module talks to
//! - [`bluetooth`] - BlueZ implementation of the port (feature `bluetooth`)
//! - [`mock`] - Scriptable in-memory transport (feature `mock-bluetooth`)
//! - [`scanner`] - Time-boxed discovery filtered by advertised name
//! - [`session`] - Connection state machine
//! - [`decoder`] - Weight Measurement payload decoding
//! - [`observers`] - Reading callback registry
//! - [`storage`] - License binding persistence
//! - [`config`] - Layered settings (TOML file and environment)
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared domain types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod decoder;
pub mod error;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
pub mod observers;
pub mod scanner;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluerTransport;
pub use config::{
    is_valid_device_address, ScannerSettings, SessionSettings, Settings, SettingsError,
    SettingsResult, StorageSettings,
};
pub use decoder::{decode_characteristic_value, decode_weight_measurement, DecodeError};
pub use error::{ConnectFailure, Result, TimbangError};
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use mock::{MockDevice, MockTransport};
pub use observers::{ObserverId, ObserverRegistry, ObserverToken};
pub use scanner::{NameFilter, Scanner, DEFAULT_NAME_TOKENS};
pub use session::ScaleSession;
pub use storage::{
    default_bindings_path, default_data_dir, BindingStore, JsonFileBindingStore,
    MemoryBindingStore, StoreError, StoreResult,
};
pub use transport::{
    AdapterState, CharacteristicValue, Transport, TransportError, TransportResult,
    WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID, WEIGHT_SCALE_SERVICE_UUID,
};
pub use types::{
    Device, DeviceId, LicenseBinding, LicenseKey, SessionPhase, SessionStatus, WeightReading,
    WeightUnit,
};
