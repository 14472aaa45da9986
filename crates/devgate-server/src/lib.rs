//! devgate-server library crate.
//!
//! A real-time gateway that lets remote sessions share serial-attached
//! devices (printers, engravers, CNC controllers) over WebSocket.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Remote session (JSON over WebSocket)
//!         ↕
//! [devgate-server]
//!   ├── application/        Registry, session pool, router, jobs, access gate
//!   └── infrastructure/
//!         ├── ws_server     WebSocket accept loop (tokio-tungstenite)
//!         ├── storage/      TOML configuration
//!         ├── auth          JWT token validation
//!         ├── devices/      Serial controller and port scanner
//!         ├── jobs/         External-process job executor
//!         └── mock          In-memory collaborators for tests
//! ```
//!
//! Domain types and the wire protocol live in `devgate-core`.
//!
//! # Layer rules
//!
//! - `application` depends on `devgate-core` and on traits it defines itself.
//! - `infrastructure` implements those traits and owns all I/O.

/// Application layer: gateway use cases.
pub mod application;

/// Infrastructure layer: transport, configuration, and concrete collaborators.
pub mod infrastructure;

pub use application::gateway::{Gateway, GatewayParts};
