//! Application layer: the gateway's use cases.
//!
//! # What lives here? (for beginners)
//!
//! Everything that decides *what* happens when a session asks for
//! something, written against traits rather than real devices, sockets, or
//! processes.  The infrastructure layer supplies the implementations.
//!
//! # Sub-modules
//!
//! - **`controller`** – The `Controller` / `ControllerFactory` seam and the
//!   room-scoped `DeviceEvents` sink.
//! - **`controller_registry`** – The key → controller map, including the
//!   reservation that prevents duplicate physical opens.
//! - **`session_pool`** – Admitted sessions, their key memberships, and
//!   best-effort delivery.
//! - **`command_router`** – Forwards `command` / `writeln` to open
//!   controllers.
//! - **`job_coordinator`** – Runs jobs and relays their progress.
//! - **`access_gate`** – Token and origin checks before admission.
//! - **`discovery_relay`** – Port listing and discovery rebroadcast.
//! - **`gateway`** – The facade the transport calls into.

pub mod access_gate;
pub mod command_router;
pub mod controller;
pub mod controller_registry;
pub mod discovery_relay;
pub mod gateway;
pub mod job_coordinator;
pub mod session_pool;
