//! JWT access tokens (HS256).
//!
//! Tokens carry two optional claims, `id` and `name`, which become the
//! session's [`Identity`].  `exp` is enforced when present; tokens without
//! it never expire.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::access_gate::{AuthError, AuthValidator, Identity};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl AuthValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(err.to_string()),
            },
        )?;

        // Numeric ids are accepted and kept in their decimal form.
        let id = data.claims.id.map(|id| match id {
            Value::String(text) => text,
            other => other.to_string(),
        });
        Ok(Identity {
            id,
            name: data.claims.name,
        })
    }
}

/// Signs a token for `identity`, valid for `ttl` (or forever on `None`).
pub fn issue_token(
    secret: &str,
    identity: &Identity,
    ttl: Option<Duration>,
) -> Result<String, AuthError> {
    let exp = ttl.map(|ttl| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now + ttl).as_secs()
    });
    let claims = Claims {
        id: identity.id.clone().map(Value::String),
        name: identity.name.clone(),
        exp,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| AuthError::Invalid(err.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
