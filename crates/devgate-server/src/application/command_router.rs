//! CommandRouter: forwards `command` and `writeln` calls to open controllers.
//!
//! The router holds no state of its own.  The call is forwarded from inside
//! the registry's critical section, so it only ever reaches a controller the
//! registry considers open at that moment.

use std::sync::Arc;

use devgate_core::{ConnectionKey, GatewayError, SessionId, WriteContext, WriteSource};
use serde_json::Value;
use tracing::debug;

use super::controller_registry::ControllerRegistry;

/// A call addressed to a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedCall {
    /// Controller-level command with positional arguments.
    Command { command: String, args: Vec<Value> },
    /// One line of data plus its write metadata.
    Writeln {
        data: String,
        context: Option<WriteContext>,
    },
}

impl RoutedCall {
    /// The verb reported back in `command-error` events.
    pub fn verb(&self) -> &str {
        match self {
            RoutedCall::Command { command, .. } => command,
            RoutedCall::Writeln { .. } => "writeln",
        }
    }
}

pub struct CommandRouter {
    registry: Arc<ControllerRegistry>,
}

impl CommandRouter {
    pub fn new(registry: Arc<ControllerRegistry>) -> Self {
        Self { registry }
    }

    /// Forwards `call` to the controller for `key`.
    ///
    /// # Errors
    ///
    /// - `NotFound` when no controller is registered for `key`.
    /// - `Unavailable` when it is registered but not open (still opening or
    ///   closing), or when it stopped after an I/O error.
    /// - `Device` when the controller refuses the call.
    pub fn route(
        &self,
        session: SessionId,
        key: &ConnectionKey,
        call: RoutedCall,
    ) -> Result<(), GatewayError> {
        let verb = call.verb().to_string();
        let result = self.registry.with_routable(key, |controller| {
            debug!(%key, %session, %verb, "routing call");
            match call {
                RoutedCall::Command { command, args } => {
                    controller.command(session, &command, &args)
                }
                RoutedCall::Writeln { data, context } => {
                    let mut context = context.unwrap_or_default();
                    context.source.get_or_insert(WriteSource::Client);
                    controller.writeln(&data, context)
                }
            }
        })?;
        result.map_err(|err| GatewayError::Device(err.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
