//! Connection identity and device descriptions.
//!
//! # Connection keys (for beginners)
//!
//! A single serial port can be opened for more than one purpose.  The
//! gateway therefore identifies a connection by the *pair*
//! `(port, data_source)`:
//!
//! ```text
//! ("/dev/ttyUSB0", "main")      ─┐
//!                                ├─ two distinct connections
//! ("/dev/ttyUSB0", "laser")     ─┘
//! ```
//!
//! Uniqueness is over the full pair, never over the port alone.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifies one remote client session.
///
/// The gateway never keeps a session alive through this id: controllers and
/// the registry store ids, and only the session pool owns the session's
/// outbound channel.
pub type SessionId = Uuid;

/// Composite identifier of a physical connection: device path plus logical
/// data source.
///
/// # Example
///
/// ```rust
/// use devgate_core::ConnectionKey;
///
/// let a = ConnectionKey::new("COM3", "main");
/// let b = ConnectionKey::new("COM3", "laser");
/// assert_ne!(a, b);
/// assert_eq!(a.to_string(), "COM3/main");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Physical address of the device (e.g. `/dev/ttyUSB0` or `COM3`).
    pub port: String,
    /// Logical data source multiplexed over the physical address.
    pub data_source: String,
}

impl ConnectionKey {
    /// Creates a key from a physical address and a logical data source.
    pub fn new(port: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            data_source: data_source.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.data_source)
    }
}

/// Device-specific settings supplied with an `open` request.
///
/// Every field is optional on the wire; the server fills absent values from
/// its configured defaults before creating a controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial line speed in baud.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
}

/// One entry of the `ports-list` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Device path.
    pub port: String,
    /// Manufacturer string reported by the OS, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// `true` when an open controller currently uses this physical address
    /// (under any data source).
    pub in_use: bool,
}

/// A network-reachable device reported by the discovery scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Address at which the device can be reached (`host:port` or URL).
    pub address: String,
    /// Model identifier, when the device advertises one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Who produced a line written to a controller.
///
/// Downstream consumers use this to tell client-issued writes apart from
/// lines generated inside the server (feeders, macros).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteSource {
    /// Written on behalf of a remote session.
    Client,
    /// Generated by the server itself.
    Server,
    /// Produced by a queued-line feeder.
    Feeder,
}

/// Metadata accompanying a `writeln` request.
///
/// Fields other than `source` are carried through to the controller
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteContext {
    /// Origin tag.  The command router stamps [`WriteSource::Client`] when the
    /// caller leaves it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<WriteSource>,
    /// Any additional caller-supplied metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
