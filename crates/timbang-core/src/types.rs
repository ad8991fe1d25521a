//! Shared domain types.
//!
//! Identity newtypes, the decoded [`WeightReading`], the persisted
//! [`LicenseBinding`] and the read-only [`SessionStatus`] snapshot live here.
//! Transport-level types are defined in [`crate::transport`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque transport address of a Bluetooth device.
///
/// On BlueZ this is the `AA:BB:CC:DD:EE:FF` address; other transports may
/// use platform-specific identifiers. The core never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a transport identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Business license identifier a scale is bound to.
///
/// Treated as an opaque key: no format or authenticity checks happen here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Wrap a license identifier.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LicenseKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LicenseKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A weighing device seen during a scan or held by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Transport identity.
    pub id: DeviceId,

    /// Advertised or resolved display name.
    pub name: String,

    /// Signal strength in dBm, when the transport reported one.
    pub rssi: Option<i16>,

    /// Whether this device is the one currently connected.
    pub connected: bool,
}

/// Unit selected by bit 0 of the measurement flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightUnit {
    /// Kilograms (flag bit clear).
    #[serde(rename = "kg")]
    Kilograms,

    /// Pounds (flag bit set).
    #[serde(rename = "lb")]
    Pounds,
}

impl WeightUnit {
    /// Short unit symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Kilograms => "kg",
            Self::Pounds => "lb",
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A decoded weight measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightReading {
    /// Weight in `unit`, two decimal digits of precision.
    pub weight: f64,

    /// Unit of `weight`.
    pub unit: WeightUnit,

    /// When the payload was decoded.
    pub timestamp: DateTime<Utc>,

    /// Whether the scale reported a settled value. Always `true`, the
    /// instability flag of the measurement is not interpreted.
    pub stable: bool,
}

impl fmt::Display for WeightReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.weight, self.unit)
    }
}

/// Persisted association between a license key and a scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseBinding {
    /// License the device is bound to.
    pub license_key: LicenseKey,

    /// Bound device identity.
    pub device_id: DeviceId,

    /// Display name at the time of binding.
    pub device_name: String,

    /// Whether [`crate::ScaleSession::auto_connect`] may use this binding.
    pub auto_reconnect: bool,

    /// When the device was last connected under this license.
    pub last_connected_at: DateTime<Utc>,
}

/// Lifecycle phase of a [`crate::ScaleSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No device and no license.
    #[default]
    Idle,
    /// A connect sequence is in flight.
    Connecting,
    /// Device, license and subscription are live.
    Connected,
    /// A teardown is in flight.
    Disconnecting,
}

/// Read-only snapshot returned by [`crate::ScaleSession::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Whether a device is connected.
    pub connected: bool,

    /// Current lifecycle phase.
    pub phase: SessionPhase,

    /// The connected device.
    pub device: Option<Device>,

    /// The license the connected device is bound to.
    pub license_key: Option<LicenseKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_unit_serializes_as_symbol() {
        assert_eq!(
            serde_json::to_string(&WeightUnit::Kilograms).unwrap(),
            "\"kg\""
        );
        assert_eq!(serde_json::to_string(&WeightUnit::Pounds).unwrap(), "\"lb\"");
    }

    #[test]
    fn test_newtypes_are_transparent() {
        let binding = LicenseBinding {
            license_key: LicenseKey::new("LIC-001"),
            device_id: DeviceId::new("AA:BB:CC:DD:EE:FF"),
            device_name: "Timbangan Dapur".into(),
            auto_reconnect: true,
            last_connected_at: Utc::now(),
        };
        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["license_key"], "LIC-001");
        assert_eq!(json["device_id"], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_reading_display() {
        let reading = WeightReading {
            weight: 40.96,
            unit: WeightUnit::Kilograms,
            timestamp: Utc::now(),
            stable: true,
        };
        assert_eq!(reading.to_string(), "40.96 kg");
    }
}
