//! Credential capability consumed by the channel
//!
//! The channel never owns token lifecycle. It asks a [`CredentialProvider`] for
//! the current token at every connection attempt and keeps the answer only for
//! that attempt, so a refresh or a logout is picked up on the next reconnect.

use std::fmt;
use std::sync::RwLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};

/// Source of the bearer token used for the handshake
pub trait CredentialProvider: Send + Sync {
    /// Current token, if any
    fn token(&self) -> Option<String>;

    /// Whether the current token is expired
    fn is_token_expired(&self) -> bool;

    /// When the current token expires, if known
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Time left before expiry. Negative once expired, `None` if unknown.
    fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at().map(|exp| exp - Utc::now())
    }
}

/// Token plus derived expiry, valid for a single connection attempt
#[derive(Clone)]
pub struct CredentialSnapshot {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CredentialSnapshot {
    /// Read the provider. Absent and expired tokens are both refusals.
    pub fn capture(provider: &dyn CredentialProvider) -> ChannelResult<Self> {
        let token = match provider.token() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(ChannelError::CredentialMissing),
        };

        if provider.is_token_expired() {
            return Err(ChannelError::CredentialExpired {
                expired_at: provider.expires_at(),
            });
        }

        Ok(Self {
            token,
            expires_at: provider.expires_at(),
        })
    }

    /// The raw bearer token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry instant, if known
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Payload attached to the transport handshake
    pub fn auth_payload(&self) -> AuthPayload {
        AuthPayload {
            token: self.token.clone(),
        }
    }
}

impl fmt::Debug for CredentialSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSnapshot")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential payload sent during the handshake
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Bearer token
    pub token: String,
}

impl AuthPayload {
    /// Value for an `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPayload").field("token", &"<redacted>").finish()
    }
}

/// Token data for a signed-in user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    /// The access token used for the handshake
    pub access_token: String,

    /// When the access token expires (if known)
    pub expires_at: Option<DateTime<Utc>>,

    /// When this token was stored
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct JwtClaims {
    #[serde(default)]
    exp: Option<i64>,
}

impl TokenData {
    /// Create a new token data structure
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
            created_at: Utc::now(),
        }
    }

    /// Build token data from a JWT, taking expiry from its `exp` claim.
    ///
    /// The signature is not checked; the server does that during the handshake.
    pub fn from_jwt(token: impl Into<String>) -> ChannelResult<Self> {
        let token = token.into();
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| ChannelError::invalid_config("token", "not a JWT"))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ChannelError::invalid_config("token", format!("bad JWT payload: {}", e)))?;
        let claims: JwtClaims = serde_json::from_slice(&bytes)
            .map_err(|e| ChannelError::invalid_config("token", format!("bad JWT claims: {}", e)))?;

        let expires_at = claims
            .exp
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));

        Ok(Self::new(token, expires_at))
    }

    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |exp| exp <= Utc::now())
    }

    /// Check if the token is valid (present and not expired)
    pub fn is_valid(&self) -> bool {
        !self.access_token.is_empty() && !self.is_expired()
    }

    /// Calculate seconds until expiration
    pub fn seconds_until_expiration(&self) -> Option<i64> {
        self.expires_at.map(|exp| (exp - Utc::now()).num_seconds())
    }
}

/// In-memory credential provider
///
/// Stands in for whatever login flow owns the token. `set` after sign-in,
/// `clear` on logout.
#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<TokenData>>,
}

impl TokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `token`
    pub fn with_token(token: TokenData) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }

    /// Replace the stored token
    pub fn set(&self, token: TokenData) {
        debug!(expires_at = ?token.expires_at, "Storing token");
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    /// Forget the stored token
    pub fn clear(&self) {
        debug!("Clearing token");
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn current(&self) -> Option<TokenData> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CredentialProvider for TokenStore {
    fn token(&self) -> Option<String> {
        self.current().map(|t| t.access_token)
    }

    fn is_token_expired(&self) -> bool {
        self.current().map_or(true, |t| t.is_expired())
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.current().and_then(|t| t.expires_at)
    }
}
