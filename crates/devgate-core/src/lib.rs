//! # devgate-core
//!
//! Shared library for the devgate device gateway containing the domain
//! entities, the error taxonomy, and the JSON wire protocol spoken between
//! remote sessions and the gateway.
//!
//! This crate has zero dependencies on async runtimes, sockets, or serial
//! devices.
//!
//! # Architecture overview (for beginners)
//!
//! devgate lets many remote client sessions share a small number of physical
//! device connections (serial-attached machine controllers) without stepping
//! on each other.  A physical connection is addressed by a
//! [`ConnectionKey`]: the device path plus a logical data source, so one
//! physical port can carry several independent logical connections.
//!
//! - **`domain`** – Identifiers and value types: connection keys, controller
//!   configuration, port and device descriptions, job identity and status,
//!   and the [`GatewayError`] taxonomy.
//!
//! - **`protocol`** – The JSON "language" between a session and the gateway:
//!   [`ClientRequest`] (inbound) and [`ServerEvent`] (outbound).

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `devgate_core::ConnectionKey` instead of the full module path.
pub use domain::connection::{
    ConnectionKey, ControllerConfig, DeviceInfo, PortInfo, SessionId, WriteContext, WriteSource,
};
pub use domain::error::GatewayError;
pub use domain::job::{JobId, JobStatus};
pub use protocol::messages::{ClientRequest, ServerEvent};
