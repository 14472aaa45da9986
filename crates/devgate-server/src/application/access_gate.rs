//! AccessGate: the checks every session passes before admission.
//!
//! # Check order (for beginners)
//!
//! ```text
//!   upgrade request ──► token present? ──► token valid? ──► origin allowed? ──► admit
//!                           │ no               │ no               │ no
//!                           ▼                  ▼                  ▼
//!                     Unauthenticated   Unauthenticated       Forbidden
//! ```
//!
//! Both checks run once, during the WebSocket handshake.  Nothing after
//! admission re-checks authorization.
//!
//! # Origin ranges
//!
//! The origin filter is an allow-list of CIDR ranges.  The defaults cover
//! loopback plus the private and link-local networks, so a server on a home
//! LAN works out of the box while requests from the public internet are
//! refused.  Setting `allow_remote_access` switches the filter off entirely.
//!
//! IPv4 clients reaching a dual-stack listener show up as IPv4-mapped IPv6
//! addresses (`::ffff:192.168.1.20`).  These are canonicalised to plain IPv4
//! before matching, so `192.168.0.0/16` covers them.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use devgate_core::GatewayError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Ranges allowed when the configuration does not list any.
pub const DEFAULT_ALLOWED_RANGES: &[&str] = &[
    "127.0.0.0/8",
    "::1/128",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "fe80::/10",
    "fc00::/7",
];

/// Who a validated token belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.id) {
            (Some(name), _) => f.write_str(name),
            (None, Some(id)) => f.write_str(id),
            (None, None) => f.write_str("anonymous"),
        }
    }
}

/// Why a token was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no access token presented")]
    Missing,

    #[error("access token expired")]
    Expired,

    #[error("invalid access token: {0}")]
    Invalid(String),
}

/// Validates an access token and returns the identity it carries.
#[cfg_attr(test, mockall::automock)]
pub trait AuthValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// A configured range could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address range {0:?}")]
pub struct InvalidRange(pub String);

/// Parses `"10.0.0.0/8"` style ranges.  A bare address is a single-host
/// range.
pub fn parse_range(text: &str) -> Result<IpNet, InvalidRange> {
    let text = text.trim();
    text.parse::<IpNet>()
        .or_else(|_| text.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| InvalidRange(text.to_string()))
}

/// The origin-address allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<IpNet>,
    allow_remote_access: bool,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<IpNet>, allow_remote_access: bool) -> Self {
        Self {
            allowed,
            allow_remote_access,
        }
    }

    /// Builds a policy from configured range strings.
    pub fn from_ranges<S: AsRef<str>>(
        ranges: &[S],
        allow_remote_access: bool,
    ) -> Result<Self, InvalidRange> {
        let allowed = ranges
            .iter()
            .map(|range| parse_range(range.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(allowed, allow_remote_access))
    }

    /// `true` when a session from `origin` may be admitted.
    pub fn permits(&self, origin: IpAddr) -> bool {
        if self.allow_remote_access {
            return true;
        }
        let origin = origin.to_canonical();
        self.allowed.iter().any(|net| net.contains(&origin))
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        let allowed = DEFAULT_ALLOWED_RANGES
            .iter()
            .filter_map(|range| range.parse().ok())
            .collect();
        Self::new(allowed, false)
    }
}

/// Token check followed by origin check.
pub struct AccessGate {
    validator: Arc<dyn AuthValidator>,
    policy: OriginPolicy,
}

impl AccessGate {
    pub fn new(validator: Arc<dyn AuthValidator>, policy: OriginPolicy) -> Self {
        Self { validator, policy }
    }

    /// Runs both checks for a session arriving from `origin`.
    ///
    /// Returns the token's identity on success.  The origin is only looked
    /// at once the token has been accepted.
    pub fn check(&self, token: Option<&str>, origin: IpAddr) -> Result<Identity, GatewayError> {
        let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) else {
            warn!(%origin, "session rejected: no token");
            return Err(GatewayError::Unauthenticated(AuthError::Missing.to_string()));
        };

        let identity = self.validator.validate(token).map_err(|err| {
            warn!(%origin, error = %err, "session rejected: token refused");
            GatewayError::Unauthenticated(err.to_string())
        })?;

        if !self.policy.permits(origin) {
            warn!(%origin, %identity, "session rejected: origin not allowed");
            return Err(GatewayError::Forbidden(origin.to_string()));
        }

        debug!(%origin, %identity, "access granted");
        Ok(identity)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            id: Some("u-1".to_string()),
            name: Some("alice".to_string()),
        }
    }

    fn accepting_validator() -> MockAuthValidator {
        let mut validator = MockAuthValidator::new();
        validator
            .expect_validate()
            .withf(|token| token.to_string() == "good")
            .returning(|_| Ok(alice()));
        validator
    }

    fn gate(validator: MockAuthValidator, policy: OriginPolicy) -> AccessGate {
        AccessGate::new(Arc::new(validator), policy)
    }

    #[test]
    fn test_missing_token_is_unauthenticated_without_calling_validator() {
        // Arrange
        let mut validator = MockAuthValidator::new();
        validator.expect_validate().times(0);
        let gate = gate(validator, OriginPolicy::default());

        // Act
        let result = gate.check(None, "127.0.0.1".parse().unwrap());

        // Assert
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_blank_token_counts_as_missing() {
        let mut validator = MockAuthValidator::new();
        validator.expect_validate().times(0);
        let gate = gate(validator, OriginPolicy::default());

        let result = gate.check(Some("   "), "127.0.0.1".parse().unwrap());

        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_invalid_token_is_unauthenticated() {
        let mut validator = MockAuthValidator::new();
        validator
            .expect_validate()
            .returning(|_| Err(AuthError::Invalid("bad signature".to_string())));
        let gate = gate(validator, OriginPolicy::default());

        let result = gate.check(Some("forged"), "127.0.0.1".parse().unwrap());

        assert!(
            matches!(result, Err(GatewayError::Unauthenticated(msg)) if msg.contains("bad signature"))
        );
    }

    #[test]
    fn test_public_origin_is_forbidden_by_default() {
        let gate = gate(accepting_validator(), OriginPolicy::default());

        let result = gate.check(Some("good"), "203.0.113.5".parse().unwrap());

        assert_eq!(result, Err(GatewayError::Forbidden("203.0.113.5".to_string())));
    }

    #[test]
    fn test_token_is_checked_before_origin() {
        let mut validator = MockAuthValidator::new();
        validator
            .expect_validate()
            .returning(|_| Err(AuthError::Expired));
        let gate = gate(validator, OriginPolicy::default());

        let result = gate.check(Some("old"), "203.0.113.5".parse().unwrap());

        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_lan_origin_is_admitted_with_identity() {
        let gate = gate(accepting_validator(), OriginPolicy::default());

        let identity = gate.check(Some("good"), "192.168.1.20".parse().unwrap()).unwrap();

        assert_eq!(identity, alice());
        assert_eq!(identity.to_string(), "alice");
    }

    #[test]
    fn test_remote_access_escape_hatch_admits_public_origin() {
        let gate = gate(accepting_validator(), OriginPolicy::new(vec![], true));

        let result = gate.check(Some("good"), "203.0.113.5".parse().unwrap());

        assert!(result.is_ok());
    }

    #[test]
    fn test_ipv4_mapped_origin_matches_ipv4_range() {
        let policy = OriginPolicy::default();
        assert!(policy.permits("::ffff:192.168.1.20".parse().unwrap()));
        assert!(!policy.permits("::ffff:203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn test_default_policy_covers_loopback_and_private_ranges() {
        let policy = OriginPolicy::default();
        for allowed in ["127.0.0.1", "::1", "10.1.2.3", "172.20.0.9", "fe80::1", "fd00::7"] {
            assert!(policy.permits(allowed.parse().unwrap()), "{allowed} should be allowed");
        }
        assert!(!policy.permits("172.32.0.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_range_accepts_bare_address() {
        let net = parse_range("203.0.113.5").unwrap();
        assert!(net.contains(&"203.0.113.5".parse::<IpAddr>().unwrap()));
        assert_eq!(net.prefix_len(), 32);
    }

    #[test]
    fn test_from_ranges_rejects_garbage() {
        let result = OriginPolicy::from_ranges(&["10.0.0.0/8", "not-a-range"], false);
        assert_eq!(result, Err(InvalidRange("not-a-range".to_string())));
    }
}
