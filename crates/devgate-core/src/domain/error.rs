//! The gateway error taxonomy.
//!
//! # Propagation policy
//!
//! | Variant             | Raised by            | Delivered to                         |
//! |---------------------|----------------------|--------------------------------------|
//! | `Unauthenticated`   | access gate          | nobody: the handshake is refused     |
//! | `Forbidden`         | access gate          | nobody: the handshake is refused     |
//! | `NotFound`          | registry, router     | originating session (result event)   |
//! | `Unavailable`       | router               | originating session (result event)   |
//! | `AlreadyInProgress` | registry             | originating session (result event)   |
//! | `Device`            | controller           | originating session (result event)   |
//! | `Job`               | job executor         | submitting session (`job-error`)     |
//!
//! None of these is fatal to the gateway process.

use thiserror::Error;

use super::connection::ConnectionKey;

/// Errors surfaced by gateway components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The session presented no token, or the token did not validate.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The session's origin address is not in any allowed range and remote
    /// access is disabled.
    #[error("forbidden: origin {0} is not allowed on this server")]
    Forbidden(String),

    /// No controller is registered for the key.
    #[error("connection \"{0}\" not found")]
    NotFound(ConnectionKey),

    /// A controller is registered for the key but is not open.
    #[error("connection \"{0}\" not accessible")]
    Unavailable(ConnectionKey),

    /// The same session already has an open pending for the key.
    #[error("open already in progress for \"{0}\"")]
    AlreadyInProgress(ConnectionKey),

    /// Physical I/O failure reported by a controller.
    #[error("device error: {0}")]
    Device(String),

    /// Execution failure reported by the job executor.
    #[error("job error: {0}")]
    Job(String),
}

impl GatewayError {
    /// Returns a stable machine-readable code for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::AlreadyInProgress(_) => "already_in_progress",
            GatewayError::Device(_) => "device_error",
            GatewayError::Job(_) => "job_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_the_full_key() {
        let err = GatewayError::NotFound(ConnectionKey::new("COM3", "main"));
        assert_eq!(err.to_string(), "connection \"COM3/main\" not found");
    }

    #[test]
    fn test_codes_are_distinct_per_variant() {
        let key = ConnectionKey::new("p", "d");
        let codes = [
            GatewayError::Unauthenticated(String::new()).code(),
            GatewayError::Forbidden(String::new()).code(),
            GatewayError::NotFound(key.clone()).code(),
            GatewayError::Unavailable(key.clone()).code(),
            GatewayError::AlreadyInProgress(key).code(),
            GatewayError::Device(String::new()).code(),
            GatewayError::Job(String::new()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
