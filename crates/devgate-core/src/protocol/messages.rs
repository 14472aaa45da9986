//! JSON message types for the session-facing event surface.
//!
//! # Message flow
//!
//! ```text
//! Session → Gateway:  JSON text frame  →  ClientRequest
//! Gateway → Session:  ServerEvent      →  JSON text frame
//! ```
//!
//! # JSON discriminant
//!
//! Every message is a JSON object with a `"type"` field in kebab-case that
//! identifies the variant.  Connection keys are flattened into the same
//! object, for example:
//!
//! ```json
//! {"type":"open","port":"COM3","data_source":"main","config":{"baud_rate":115200}}
//! {"type":"device-ready","port":"COM3","data_source":"main","state":{"status":"idle"}}
//! ```
//!
//! Two separate enums keep the directions apart: it is a compile-time error
//! to hand an inbound request to the outbound sink.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::connection::{ConnectionKey, ControllerConfig, DeviceInfo, PortInfo, WriteContext};
use crate::domain::job::{JobId, JobStatus};

// ── Session → Gateway ─────────────────────────────────────────────────────────

/// All requests a session can send to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    /// Asks for the known ports with their `in_use` flags.
    ListPorts,

    /// Opens (or attaches to) the connection addressed by `key`.
    Open {
        #[serde(flatten)]
        key: ConnectionKey,
        #[serde(default)]
        config: ControllerConfig,
    },

    /// Leaves and closes the connection addressed by `key`.
    Close {
        #[serde(flatten)]
        key: ConnectionKey,
    },

    /// Runs a controller-level command (e.g. `reset`, `gcode`).
    Command {
        #[serde(flatten)]
        key: ConnectionKey,
        command: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Writes one line of raw data to the device.
    Writeln {
        #[serde(flatten)]
        key: ConnectionKey,
        data: String,
        #[serde(default)]
        context: Option<WriteContext>,
    },

    /// Submits an asynchronous job (e.g. slicing) under a caller-chosen id.
    SubmitJob {
        job_id: JobId,
        #[serde(default)]
        params: Value,
    },

    /// Asks the discovery scanner to refresh its device list.
    Discover,
}

impl ClientRequest {
    /// Returns a short name for the variant.
    ///
    /// Used in log lines so request payloads (which may carry raw device
    /// data) are not written to the log.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::ListPorts => "list-ports",
            ClientRequest::Open { .. } => "open",
            ClientRequest::Close { .. } => "close",
            ClientRequest::Command { .. } => "command",
            ClientRequest::Writeln { .. } => "writeln",
            ClientRequest::SubmitJob { .. } => "submit-job",
            ClientRequest::Discover => "discover",
        }
    }
}

// ── Gateway → Session ─────────────────────────────────────────────────────────

/// All events the gateway sends to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First event on every admitted session.
    Startup,

    /// Reply to `list-ports`.
    PortsList { ports: Vec<PortInfo> },

    /// Outcome of an `open` request; `error` is absent on success.
    OpenResult {
        #[serde(flatten)]
        key: ConnectionKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The controller for `key` is open; `state` is its device snapshot.
    DeviceReady {
        #[serde(flatten)]
        key: ConnectionKey,
        state: Value,
    },

    /// Outcome of a `close` request; `error` is absent on success.
    CloseResult {
        #[serde(flatten)]
        key: ConnectionKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A `command` or `writeln` could not be routed.
    CommandError {
        #[serde(flatten)]
        key: ConnectionKey,
        command: String,
        error: String,
    },

    /// Output pushed by a controller to the sessions joined to its key.
    DeviceEvent {
        #[serde(flatten)]
        key: ConnectionKey,
        event: String,
        payload: Value,
    },

    /// The submitting session's job was accepted.
    JobStarted { job_id: JobId },

    /// Progress report for a job, sent to every session.
    JobProgress { job_id: JobId, progress: Value },

    /// Normalised completion record, sent to every session.
    JobCompleted {
        job_id: JobId,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<String>,
    },

    /// The submitting session's job failed.
    JobError { job_id: JobId, error: String },

    /// Devices reported by the discovery scanner.
    DiscoveredDevices { devices: Vec<DeviceInfo> },
}

impl ServerEvent {
    /// Returns the wire name of the variant (the `"type"` field).
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Startup => "startup",
            ServerEvent::PortsList { .. } => "ports-list",
            ServerEvent::OpenResult { .. } => "open-result",
            ServerEvent::DeviceReady { .. } => "device-ready",
            ServerEvent::CloseResult { .. } => "close-result",
            ServerEvent::CommandError { .. } => "command-error",
            ServerEvent::DeviceEvent { .. } => "device-event",
            ServerEvent::JobStarted { .. } => "job-started",
            ServerEvent::JobProgress { .. } => "job-progress",
            ServerEvent::JobCompleted { .. } => "job-completed",
            ServerEvent::JobError { .. } => "job-error",
            ServerEvent::DiscoveredDevices { .. } => "discovered-devices",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
