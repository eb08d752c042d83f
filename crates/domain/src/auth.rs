//! Token Verifier (spec §4.B).
//!
//! Pure: no I/O, no mutable state. Its error classification is the single
//! source of truth for what the Gateway Server reports to the client as
//! `auth_error.code`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// `timestamp + GUEST_TTL` is a guest token's expiry (spec §4.B, §6).
pub const GUEST_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GuestTokenError {
    #[error("not a guest token")]
    NotGuestShape,
    #[error("malformed guest token: {0}")]
    Malformed(String),
}

/// The three disjoint failure kinds the Token Verifier can report (spec
/// §4.B). `AUTH_REQUIRED`/`AUTH_INVALID`/`AUTH_EXPIRED` map directly to the
/// wire `auth_error.code` values in §6.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("Authentication token required")]
    AuthRequired,
    #[error("Authentication token is invalid")]
    AuthInvalid,
    #[error("Authentication token has expired")]
    AuthExpired,
}

impl TokenError {
    /// The wire-level `auth_error.code` string (spec §6).
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::AuthRequired => "AUTH_REQUIRED",
            TokenError::AuthInvalid => "AUTH_INVALID",
            TokenError::AuthExpired => "AUTH_EXPIRED",
        }
    }
}

/// Transient, produced by the Token Verifier and consumed to seed a Session.
/// Never persisted (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenPayload {
    pub user_id: String,
    pub is_guest: bool,
    pub email: Option<String>,
    pub roles: HashSet<String>,
    pub subscription_tier: String,
    pub permissions: HashSet<String>,
    pub expiry: DateTime<Utc>,
}

impl TokenPayload {
    fn guest(uuid: Uuid, expiry: DateTime<Utc>) -> Self {
        let mut roles = HashSet::new();
        roles.insert("guest".to_string());

        let mut permissions = HashSet::new();
        permissions.insert("realtime:connect".to_string());
        permissions.insert("realtime:audio".to_string());

        Self {
            user_id: format!("guest-{uuid}"),
            is_guest: true,
            email: None,
            roles,
            subscription_tier: "free".to_string(),
            permissions,
            expiry,
        }
    }
}

/// Claims embedded in a non-guest bearer token. Verification here is a pure
/// decode-and-check: the signing secret is supplied by the caller (the
/// Gateway Server reads it from configuration), keeping the verifier itself
/// free of I/O.
#[derive(Debug, Serialize, Deserialize)]
struct BearerClaims {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    roles: HashSet<String>,
    #[serde(default = "default_tier")]
    subscription_tier: String,
    #[serde(default)]
    permissions: HashSet<String>,
    exp: i64,
}

fn default_tier() -> String {
    "free".to_string()
}

/// Validates bearer/guest credentials and classifies failure (spec §4.B).
pub struct TokenVerifier {
    hmac_secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(hmac_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            hmac_secret: hmac_secret.into(),
        }
    }

    /// `token` is the raw credential as extracted from query/header/
    /// subprotocol by the Gateway Server (spec §4.G, §6); `None` means no
    /// credential was presented at all.
    pub fn verify(&self, token: Option<&str>) -> Result<TokenPayload, TokenError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(TokenError::AuthRequired)?;

        if let Some(stripped) = token.strip_prefix("guest_") {
            return self.verify_guest(stripped);
        }

        self.verify_bearer(token)
    }

    /// Guest tokens have a specific parseable shape: a UUID, an underscore,
    /// then a millisecond unix timestamp (spec §4.B, §6, §8 scenario S2/S4).
    fn verify_guest(&self, rest: &str) -> Result<TokenPayload, TokenError> {
        let (uuid_part, ts_part) = rest.rsplit_once('_').ok_or(TokenError::AuthInvalid)?;
        let uuid = Uuid::parse_str(uuid_part).map_err(|_| TokenError::AuthInvalid)?;
        let millis: i64 = ts_part.parse().map_err(|_| TokenError::AuthInvalid)?;
        let issued_at =
            DateTime::<Utc>::from_timestamp_millis(millis).ok_or(TokenError::AuthInvalid)?;

        let expiry = issued_at + chrono::Duration::seconds(GUEST_TTL_SECS);
        if expiry <= Utc::now() {
            return Err(TokenError::AuthExpired);
        }

        Ok(TokenPayload::guest(uuid, expiry))
    }

    /// Parse the guest token shape without checking expiry, used where the
    /// caller only wants the embedded identity (e.g. tests, §8 scenario S2).
    pub fn parse_guest_shape(token: &str) -> Result<(Uuid, DateTime<Utc>), GuestTokenError> {
        let rest = token
            .strip_prefix("guest_")
            .ok_or(GuestTokenError::NotGuestShape)?;
        let (uuid_part, ts_part) = rest
            .rsplit_once('_')
            .ok_or_else(|| GuestTokenError::Malformed("missing timestamp segment".to_string()))?;
        let uuid = Uuid::parse_str(uuid_part)
            .map_err(|e| GuestTokenError::Malformed(format!("bad uuid: {e}")))?;
        let millis: i64 = ts_part
            .parse()
            .map_err(|_| GuestTokenError::Malformed("bad timestamp".to_string()))?;
        let issued_at = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| GuestTokenError::Malformed("timestamp out of range".to_string()))?;
        Ok((uuid, issued_at))
    }

    fn verify_bearer(&self, token: &str) -> Result<TokenPayload, TokenError> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let mut parts = token.splitn(2, '.');
        let payload_b64 = parts.next().ok_or(TokenError::AuthInvalid)?;
        let sig_b64 = parts.next().ok_or(TokenError::AuthInvalid)?;

        let payload_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            payload_b64,
        )
        .map_err(|_| TokenError::AuthInvalid)?;
        let sig_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            sig_b64,
        )
        .map_err(|_| TokenError::AuthInvalid)?;

        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.hmac_secret).map_err(|_| TokenError::AuthInvalid)?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&sig_bytes).map_err(|_| TokenError::AuthInvalid)?;

        let claims: BearerClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::AuthInvalid)?;

        let expiry =
            DateTime::<Utc>::from_timestamp(claims.exp, 0).ok_or(TokenError::AuthInvalid)?;
        if expiry <= Utc::now() {
            return Err(TokenError::AuthExpired);
        }

        Ok(TokenPayload {
            user_id: claims.sub,
            is_guest: false,
            email: claims.email,
            roles: claims.roles,
            subscription_tier: claims.subscription_tier,
            permissions: claims.permissions,
            expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], claims: &BearerClaims) -> String {
        use base64::Engine;
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let payload = serde_json::to_vec(claims).unwrap();
        let payload_b64 =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(payload_b64.as_bytes());
        let sig = mac.finalize().into_bytes();
        let sig_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig);
        format!("{payload_b64}.{sig_b64}")
    }

    #[test]
    fn missing_token_is_auth_required() {
        let verifier = TokenVerifier::new(b"secret".to_vec());
        assert_eq!(verifier.verify(None).unwrap_err(), TokenError::AuthRequired);
        assert_eq!(
            verifier.verify(Some("")).unwrap_err(),
            TokenError::AuthRequired
        );
    }

    #[test]
    fn valid_guest_token_shape() {
        let verifier = TokenVerifier::new(b"secret".to_vec());
        let uuid = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let now_ms = Utc::now().timestamp_millis();
        let token = format!("guest_{uuid}_{now_ms}");

        let payload = verifier.verify(Some(&token)).unwrap();
        assert!(payload.is_guest);
        assert_eq!(payload.user_id, format!("guest-{uuid}"));
        assert!(payload.roles.contains("guest"));
        assert_eq!(payload.subscription_tier, "free");
    }

    #[test]
    fn expired_guest_token() {
        let verifier = TokenVerifier::new(b"secret".to_vec());
        let uuid = Uuid::new_v4();
        let expired_ms = (Utc::now() - chrono::Duration::seconds(GUEST_TTL_SECS + 1000))
            .timestamp_millis();
        let token = format!("guest_{uuid}_{expired_ms}");
        assert_eq!(
            verifier.verify(Some(&token)).unwrap_err(),
            TokenError::AuthExpired
        );
    }

    #[test]
    fn malformed_guest_token_is_invalid() {
        let verifier = TokenVerifier::new(b"secret".to_vec());
        assert_eq!(
            verifier.verify(Some("guest_not-a-uuid_123")).unwrap_err(),
            TokenError::AuthInvalid
        );
    }

    #[test]
    fn valid_bearer_token() {
        let secret = b"top-secret".to_vec();
        let verifier = TokenVerifier::new(secret.clone());
        let claims = BearerClaims {
            sub: "user-123".to_string(),
            email: Some("a@b.com".to_string()),
            roles: HashSet::new(),
            subscription_tier: "pro".to_string(),
            permissions: HashSet::new(),
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
        };
        let token = sign(&secret, &claims);
        let payload = verifier.verify(Some(&token)).unwrap();
        assert_eq!(payload.user_id, "user-123");
        assert!(!payload.is_guest);
    }

    #[test]
    fn bearer_token_wrong_signature_is_invalid() {
        let verifier = TokenVerifier::new(b"real-secret".to_vec());
        let claims = BearerClaims {
            sub: "user-123".to_string(),
            email: None,
            roles: HashSet::new(),
            subscription_tier: "free".to_string(),
            permissions: HashSet::new(),
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
        };
        let token = sign(b"wrong-secret", &claims);
        assert_eq!(
            verifier.verify(Some(&token)).unwrap_err(),
            TokenError::AuthInvalid
        );
    }

    #[test]
    fn expired_bearer_token() {
        let secret = b"top-secret".to_vec();
        let verifier = TokenVerifier::new(secret.clone());
        let claims = BearerClaims {
            sub: "user-123".to_string(),
            email: None,
            roles: HashSet::new(),
            subscription_tier: "free".to_string(),
            permissions: HashSet::new(),
            exp: (Utc::now() - chrono::Duration::hours(1)).timestamp(),
        };
        let token = sign(&secret, &claims);
        assert_eq!(
            verifier.verify(Some(&token)).unwrap_err(),
            TokenError::AuthExpired
        );
    }
}
