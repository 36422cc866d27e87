//! Bearer token acquisition and caching.
//!
//! [`CredentialStore`] keeps one token for the whole process and refreshes it
//! through a [`TokenProvider`] once it is about to expire. Callers that find a
//! usable cached token only take a short read lock. Callers that miss queue on
//! a single refresh gate, so one contention window produces at most one round
//! trip to the identity provider. That holds when the refresh fails too: callers
//! queued behind a failed attempt receive its failure instead of retrying.

mod keycloak;

pub use keycloak::KeycloakTokenProvider;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::errors::CredentialError;

/// Minimum remaining lifetime of any token handed to a caller.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// A token as issued by the identity provider.
#[derive(Clone)]
pub struct IssuedToken {
    /// Opaque bearer value.
    pub access_token: String,
    /// Lifetime reported by the provider.
    pub expires_in: Duration,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Source of fresh bearer tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Request a new token from the identity provider.
    async fn fetch_token(&self) -> Result<IssuedToken, CredentialError>;
}

/// A cached bearer token.
#[derive(Clone)]
pub struct Token {
    value: String,
    expires_at: Instant,
}

impl Token {
    /// Value for the `Authorization: Bearer` header.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Instant at which the provider considers the token expired.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the token still has at least [`EXPIRY_MARGIN`] left at `now`.
    fn is_usable_at(&self, now: Instant) -> bool {
        self.expires_at
            .checked_duration_since(now)
            .is_some_and(|remaining| remaining >= EXPIRY_MARGIN)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Process-wide bearer token cache.
pub struct CredentialStore {
    provider: Arc<dyn TokenProvider>,
    /// Current token; only written while `refresh_gate` is held.
    cached: RwLock<Option<Token>>,
    /// Completed refresh attempts; only advanced while `refresh_gate` is held.
    attempts: AtomicU64,
    /// Failure of the most recent refresh attempt, if it failed.
    refresh_gate: Mutex<Option<String>>,
}

impl CredentialStore {
    /// Create an empty store backed by `provider`.
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
            attempts: AtomicU64::new(0),
            refresh_gate: Mutex::new(None),
        }
    }

    /// Return a token with at least [`EXPIRY_MARGIN`] of lifetime left,
    /// refreshing it from the provider when needed.
    ///
    /// A failed refresh leaves the cache untouched. Callers that were already
    /// waiting on that refresh get [`CredentialError::ConcurrentRefreshFailed`];
    /// the next caller to arrive afterwards tries again.
    pub async fn get_token(&self) -> Result<Token, CredentialError> {
        if let Some(token) = self.cached_token() {
            trace!("Using cached bearer token");
            return Ok(token);
        }

        let observed = self.attempts.load(Ordering::Acquire);
        let mut last_failure = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we were queued
        if let Some(token) = self.cached_token() {
            debug!("Bearer token refreshed by concurrent caller");
            return Ok(token);
        }
        if self.attempts.load(Ordering::Acquire) != observed {
            if let Some(reason) = last_failure.as_ref() {
                debug!("Concurrent token refresh failed, not retrying");
                return Err(CredentialError::ConcurrentRefreshFailed(reason.clone()));
            }
        }

        let outcome = self.refresh().await;
        *last_failure = outcome.as_ref().err().map(|e| e.to_string());
        self.attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Fetch a new token and cache it. Caller must hold `refresh_gate`.
    async fn refresh(&self) -> Result<Token, CredentialError> {
        debug!("Bearer token missing or expiring, requesting a new one");
        let issued = match self.provider.fetch_token().await {
            Ok(issued) => issued,
            Err(e) => {
                warn!(error = %e, "Failed to obtain bearer token");
                return Err(e);
            }
        };

        if issued.expires_in < EXPIRY_MARGIN {
            return Err(CredentialError::LifetimeTooShort {
                expires_in: issued.expires_in,
                margin: EXPIRY_MARGIN,
            });
        }

        let expires_at = Instant::now().checked_add(issued.expires_in).ok_or_else(|| {
            CredentialError::InvalidResponse(format!(
                "expires_in of {}s is out of range",
                issued.expires_in.as_secs()
            ))
        })?;

        let token = Token {
            value: issued.access_token,
            expires_at,
        };
        *self.cached.write() = Some(token.clone());

        info!(
            expires_in_secs = issued.expires_in.as_secs(),
            refresh_after_secs = (issued.expires_in - EXPIRY_MARGIN).as_secs(),
            "Obtained bearer token"
        );
        Ok(token)
    }

    fn cached_token(&self) -> Option<Token> {
        let now = Instant::now();
        self.cached
            .read()
            .as_ref()
            .filter(|token| token.is_usable_at(now))
            .cloned()
    }
}
