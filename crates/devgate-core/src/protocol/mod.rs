//! Protocol module containing the JSON session messages.

pub mod messages;

pub use messages::*;
