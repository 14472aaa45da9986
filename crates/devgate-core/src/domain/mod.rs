//! Domain entities for the device gateway.
//!
//! Everything here is a plain value type.  No module in `domain` performs I/O,
//! spawns tasks, or holds locks; the server crate builds its stateful
//! components (registry, session pool, job coordinator) on top of these types.

/// Connection keys, controller configuration, and port/device descriptions.
pub mod connection;

/// The error taxonomy shared by every gateway component.
pub mod error;

/// Job identity and lifecycle status.
pub mod job;
