//! Session keeper: owns the access credential lifecycle.
//!
//! - `ensure_fresh()` is the gate every remote call passes through. A
//!   successful check is cached for the throttle window; inside the window the
//!   keeper answers "valid" without touching the backend.
//! - Outside the window it asks the backend for the current session and
//!   refreshes proactively when less than the refresh threshold remains.
//! - Refreshes are serialized; a caller that waited on an in-flight refresh
//!   reuses its result.
//! - Sign-out clears the session and the local preference scratch space
//!   under one lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::CrmError;
use crate::preferences::PreferenceStore;
use crate::remote::{AuthService, RemoteError};
use crate::types::SessionConfig;

/// Minimum password length accepted by the backend's sign-up endpoint.
const MIN_PASSWORD_LEN: usize = 6;

/// An authenticated session as issued by the backend.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_token: String,
    /// Opaque handle; only ever sent back to the refresh endpoint.
    pub refresh_token: String,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True if the session expires within `threshold` from now (or already has).
    pub fn expires_within(&self, threshold: Duration) -> bool {
        let threshold = chrono::Duration::seconds(threshold.as_secs().min(i64::MAX as u64) as i64);
        self.expires_at <= Utc::now() + threshold
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("subject_id", &self.subject_id)
            .field("email", &self.email)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Timing knobs for the keeper, resolved from config.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// How long a successful check is trusted without re-querying.
    pub throttle: Duration,
    /// Refresh when less than this remains before expiry.
    pub refresh_threshold: Duration,
    /// Period of the keepalive timer.
    pub check_interval: Duration,
    /// Minimum gap between checks triggered by the app regaining visibility.
    pub visibility_throttle: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            throttle: Duration::from_secs(config.throttle_secs),
            refresh_threshold: Duration::from_secs(config.refresh_threshold_secs),
            check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
            visibility_throttle: Duration::from_secs(config.visibility_throttle_secs),
        }
    }
}

/// Latest auth state change, observable through `SessionKeeper::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedOut,
    SignedIn { subject_id: String },
    TokenRefreshed,
    RefreshFailed,
}

/// Environment events that prompt an expiry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Periodic keepalive timer fired.
    Tick,
    /// The app came back to the foreground.
    VisibilityRegained,
    /// Connectivity came back after an outage.
    NetworkRestored,
}

#[derive(Debug, Default)]
struct KeeperState {
    session: Option<Session>,
    /// When the last check that concluded "valid" happened.
    last_valid_check: Option<Instant>,
    last_visibility_check: Option<Instant>,
    /// Bumped on every successful refresh and on sign-out.
    refresh_generation: u64,
}

pub struct SessionKeeper {
    auth: Arc<dyn AuthService>,
    policy: SessionPolicy,
    preferences: Arc<PreferenceStore>,
    state: Mutex<KeeperState>,
    refresh_lock: tokio::sync::Mutex<()>,
    events: watch::Sender<AuthEvent>,
}

impl SessionKeeper {
    pub fn new(
        auth: Arc<dyn AuthService>,
        policy: SessionPolicy,
        preferences: Arc<PreferenceStore>,
    ) -> Self {
        let (events, _) = watch::channel(AuthEvent::SignedOut);
        Self {
            auth,
            policy,
            preferences,
            state: Mutex::new(KeeperState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.lock().session.clone()
    }

    pub fn subject_id(&self) -> Option<String> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| s.subject_id.clone())
    }

    // =========================================================================
    // Sign in / up / out
    // =========================================================================

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, CrmError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(CrmError::Validation(
                "email and password are required".to_string(),
            ));
        }

        let session = match self.auth.sign_in(email, password).await {
            Ok(session) => session,
            Err(RemoteError::AuthExpired) => {
                log::info!("Sign-in rejected for {}", email);
                return Err(CrmError::Validation(
                    "Invalid login credentials".to_string(),
                ));
            }
            Err(e) => {
                log::warn!("Sign-in failed: {}", e);
                return Err(e.into());
            }
        };

        self.install(session.clone());
        log::info!("Signed in as {}", session.subject_id);
        self.events.send_replace(AuthEvent::SignedIn {
            subject_id: session.subject_id.clone(),
        });
        Ok(session)
    }

    /// Register a new user. Returns `None` when the backend wants the email
    /// confirmed before issuing a session.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Option<Session>, CrmError> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(CrmError::Validation(format!(
                "'{}' is not an email address",
                email
            )));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CrmError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let session = self
            .auth
            .sign_up(email, password, full_name.trim())
            .await
            .map_err(|e| {
                log::warn!("Sign-up failed: {}", e);
                CrmError::from(e)
            })?;

        match &session {
            Some(session) => {
                self.install(session.clone());
                self.events.send_replace(AuthEvent::SignedIn {
                    subject_id: session.subject_id.clone(),
                });
            }
            None => log::info!("Sign-up for {} pending email confirmation", email),
        }
        Ok(session)
    }

    /// End the session. Local state is cleared even if the backend call fails.
    pub async fn sign_out(&self) -> Result<(), CrmError> {
        if let Err(e) = self.auth.sign_out().await {
            log::warn!("Remote sign-out failed, clearing local session anyway: {}", e);
        }

        let cleared = {
            let mut state = self.state.lock();
            let generation = state.refresh_generation + 1;
            *state = KeeperState {
                refresh_generation: generation,
                ..KeeperState::default()
            };
            self.preferences.clear()
        };

        self.events.send_replace(AuthEvent::SignedOut);
        log::info!("Signed out");
        cleared
    }

    // =========================================================================
    // Freshness
    // =========================================================================

    /// Make sure the next remote call carries a live credential.
    ///
    /// Returns false only when there is no session or a needed refresh failed.
    pub async fn ensure_fresh(&self) -> bool {
        if self.within_throttle() {
            return true;
        }
        self.check_expiry().await
    }

    /// Query the backend session and refresh it if it is close to expiry.
    /// Ignores the throttle window.
    pub async fn check_expiry(&self) -> bool {
        let session = match self.auth.get_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::debug!("Session check: no active session");
                self.mark_invalid();
                return false;
            }
            Err(e) => {
                log::warn!("Session check failed: {}", e);
                self.mark_invalid();
                return false;
            }
        };

        if session.expires_within(self.policy.refresh_threshold) {
            log::info!(
                "Session expires at {}, refreshing proactively",
                session.expires_at.to_rfc3339()
            );
            return self.force_refresh().await.is_ok();
        }

        self.install(session);
        true
    }

    /// Refresh the session now. Concurrent callers are serialized; a caller
    /// that waited behind a successful refresh gets that session back.
    pub async fn force_refresh(&self) -> Result<Session, CrmError> {
        let seen_generation = self.state.lock().refresh_generation;
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.lock();
            if state.refresh_generation != seen_generation {
                if let Some(session) = &state.session {
                    log::debug!("Reusing session refreshed by a concurrent caller");
                    return Ok(session.clone());
                }
            }
        }

        match self.auth.refresh_session().await {
            Ok(session) => {
                {
                    let mut state = self.state.lock();
                    state.session = Some(session.clone());
                    state.last_valid_check = Some(Instant::now());
                    state.refresh_generation += 1;
                }
                log::info!(
                    "Session refreshed, expires at {}",
                    session.expires_at.to_rfc3339()
                );
                self.events.send_replace(AuthEvent::TokenRefreshed);
                Ok(session)
            }
            Err(e) => {
                log::warn!("Session refresh failed: {}", e);
                self.mark_invalid();
                self.events.send_replace(AuthEvent::RefreshFailed);
                Err(e.into())
            }
        }
    }

    /// React to an environment event.
    ///
    /// Returns `None` when the event was throttled and no check ran,
    /// otherwise whether the session is valid afterwards.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> Option<bool> {
        match event {
            LifecycleEvent::Tick | LifecycleEvent::NetworkRestored => {
                log::debug!("Session check triggered by {:?}", event);
                Some(self.check_expiry().await)
            }
            LifecycleEvent::VisibilityRegained => {
                let throttled = {
                    let mut state = self.state.lock();
                    match state.last_visibility_check {
                        Some(at) if at.elapsed() < self.policy.visibility_throttle => true,
                        _ => {
                            state.last_visibility_check = Some(Instant::now());
                            false
                        }
                    }
                };
                if throttled {
                    log::debug!("Visibility check throttled");
                    return None;
                }
                Some(self.ensure_fresh().await)
            }
        }
    }

    fn within_throttle(&self) -> bool {
        self.state
            .lock()
            .last_valid_check
            .map(|at| at.elapsed() < self.policy.throttle)
            .unwrap_or(false)
    }

    fn install(&self, session: Session) {
        let mut state = self.state.lock();
        state.session = Some(session);
        state.last_valid_check = Some(Instant::now());
    }

    fn mark_invalid(&self) {
        self.state.lock().last_valid_check = None;
    }
}
