//! The controller collaborator seam.
//!
//! A [`Controller`] is the stateful object behind one opened physical
//! connection.  How it frames bytes for a particular firmware is none of the
//! gateway's business; the gateway only needs the narrow surface below.
//!
//! Controllers never hold sessions.  They are told which [`SessionId`]s are
//! bound to them and reach those sessions through a [`DeviceEvents`] handle,
//! which holds only a weak reference to the session pool.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use devgate_core::{ConnectionKey, ControllerConfig, ServerEvent, SessionId, WriteContext};
use serde_json::Value;
use thiserror::Error;

use super::session_pool::SessionPool;

/// Errors reported by a controller.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The physical connection could not be opened.
    #[error("failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    /// The controller is not open.
    #[error("controller is not open")]
    NotOpen,

    /// The controller does not understand the command.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// An I/O error on an open connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller settings after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub baud_rate: u32,
}

impl ControllerSettings {
    /// Fills the fields a client left empty from `defaults`.
    pub fn resolve(requested: &ControllerConfig, defaults: ControllerSettings) -> Self {
        Self {
            baud_rate: requested.baud_rate.unwrap_or(defaults.baud_rate),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { baud_rate: 115_200 }
    }
}

/// One opened (or opening) physical connection.
///
/// Implementations must be cheap to call from inside the registry's critical
/// sections: every method except [`open`](Controller::open) and
/// [`close`](Controller::close) must return without waiting on I/O.
/// `command` and `writeln` run while the registry lock is held and must not
/// call back into the registry.
#[async_trait]
pub trait Controller: Send + Sync {
    /// The key this controller was created for.
    fn key(&self) -> &ConnectionKey;

    /// Performs the physical open.  May take seconds.
    async fn open(&self) -> Result<(), DeviceError>;

    /// Closes the physical connection.  Idempotent.
    async fn close(&self);

    /// `true` while the physical connection is usable.
    fn is_open(&self) -> bool;

    /// Runs a controller-level command on behalf of `session`.
    fn command(&self, session: SessionId, command: &str, args: &[Value])
        -> Result<(), DeviceError>;

    /// Writes one line of data.
    fn writeln(&self, data: &str, context: WriteContext) -> Result<(), DeviceError>;

    /// Binds a session so it receives this controller's device events.
    fn add_session(&self, session: SessionId);

    /// Unbinds a session.  Unknown ids are ignored.
    fn remove_session(&self, session: SessionId);

    /// Sessions currently bound.
    fn sessions(&self) -> Vec<SessionId>;

    /// Snapshot of device state sent with `device-ready`.
    fn state(&self) -> Value;
}

/// Creates controllers for keys the registry has reserved.
pub trait ControllerFactory: Send + Sync {
    fn create(
        &self,
        key: &ConnectionKey,
        settings: ControllerSettings,
        events: DeviceEvents,
    ) -> Arc<dyn Controller>;
}

/// Room-scoped outlet for device output.
///
/// Events go to every session joined to the key at the moment of emission.
/// Emitting after the gateway has shut down is a no-op.
#[derive(Clone)]
pub struct DeviceEvents {
    key: ConnectionKey,
    pool: Weak<SessionPool>,
}

impl DeviceEvents {
    pub fn new(key: ConnectionKey, pool: Weak<SessionPool>) -> Self {
        Self { key, pool }
    }

    /// A sink connected to nothing; used by tests and tools.
    pub fn detached(key: ConnectionKey) -> Self {
        Self {
            key,
            pool: Weak::new(),
        }
    }

    /// Delivers `event` with `payload` to the key's room.  Returns the number
    /// of sessions that accepted it.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        let Some(pool) = self.pool.upgrade() else {
            return 0;
        };
        pool.broadcast_to_key(
            &self.key,
            ServerEvent::DeviceEvent {
                key: self.key.clone(),
                event: event.to_string(),
                payload,
            },
        )
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_keeps_requested_baud_rate() {
        let requested = ControllerConfig {
            baud_rate: Some(250_000),
        };
        let settings = ControllerSettings::resolve(&requested, ControllerSettings::default());
        assert_eq!(settings.baud_rate, 250_000);
    }

    #[test]
    fn test_resolve_falls_back_to_default_baud_rate() {
        let settings =
            ControllerSettings::resolve(&ControllerConfig::default(), ControllerSettings::default());
        assert_eq!(settings.baud_rate, 115_200);
    }

    #[test]
    fn test_detached_events_reach_nobody() {
        let events = DeviceEvents::detached(ConnectionKey::new("COM3", "main"));
        assert_eq!(events.emit("data", Value::from("ok")), 0);
        assert_eq!(events.key().port, "COM3");
    }
}
