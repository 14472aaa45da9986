//! Infrastructure layer for the gateway.
//!
//! Contains the OS-facing adapters: the WebSocket server, configuration
//! storage, token validation, serial devices, and job processes.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `devgate_core`, but MUST NOT be imported by the `application` layer
//! outside of tests.

pub mod auth;
pub mod devices;
pub mod jobs;
pub mod mock;
pub mod storage;
pub mod ws_server;
