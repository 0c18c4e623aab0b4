//! Credential checks and opaque session tokens.
//!
//! Passwords map to roles; a successful password auth mints a session whose
//! token can be presented on later connections until it expires. All
//! failures are non-fatal: validation returns `None` and the caller decides
//! policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::{Role, Session};

/// Session token length in bytes (256 bits of entropy, hex-encoded on the wire)
const TOKEN_LENGTH: usize = 32;

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Session and credential store
pub struct AuthStore {
    operator_password: String,
    viewer_password: String,
    ttl: chrono::Duration,
    sessions: DashMap<String, Session>,
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl AuthStore {
    #[must_use]
    pub fn new(operator_password: String, viewer_password: String, ttl_ms: u64) -> Self {
        Self {
            operator_password,
            viewer_password,
            ttl: chrono::Duration::milliseconds(ttl_ms as i64),
            sessions: DashMap::new(),
        }
    }

    /// Check a password against both configured secrets, in constant time.
    /// Returns the granted role, or `None`.
    #[must_use]
    pub fn validate_password(&self, password: &str) -> Option<Role> {
        // evaluate both comparisons so timing does not reveal which secret matched
        let is_operator = constant_time_eq(password.as_bytes(), self.operator_password.as_bytes());
        let is_viewer = constant_time_eq(password.as_bytes(), self.viewer_password.as_bytes());
        if is_operator {
            Some(Role::Operator)
        } else if is_viewer {
            Some(Role::Viewer)
        } else {
            None
        }
    }

    /// Mint a session for an authenticated client. Returns the opaque token.
    pub fn create_session(&self, role: Role, name: &str) -> String {
        let token = Self::generate_token();
        let session = Session {
            token: token.clone(),
            role,
            name: name.to_string(),
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions.insert(token.clone(), session);
        debug!(role = %role, name = %name, "session created");
        token
    }

    /// Look up a session by token. Expired entries are removed lazily and
    /// reported as absent.
    #[must_use]
    pub fn validate_session(&self, token: &str) -> Option<Session> {
        let now = Utc::now();
        let session = self.sessions.get(token)?.clone();
        if session.is_expired(now) {
            drop(self.sessions.remove(token));
            return None;
        }
        Some(session)
    }

    pub fn invalidate_session(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Remove every expired session. Safe to run concurrently with
    /// validation: only entries already past expiry are removed, so an
    /// unexpired token can never be swept out from under a validator.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        before - self.sessions.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Periodic expiry sweep loop.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    info!(removed, remaining = self.session_count(), "expired sessions swept");
                }
            }
        })
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}
