//! Resilient remote call: one remote operation with bounded recovery from
//! auth failures.
//!
//! Before every attempt the session keeper is asked for a fresh credential.
//! If it cannot provide one on the final attempt the operation is not issued
//! at all. An `AuthExpired` failure with attempts left forces a refresh, backs
//! off briefly and retries. Any other failure propagates unchanged.
//!
//! Retried writes must be safe to repeat. That is the caller's contract.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CrmError;
use crate::remote::RemoteError;
use crate::session::SessionKeeper;
use crate::types::RetryConfig;

const MAX_RETRIES_CAP: u32 = 2;
const MAX_BACKOFF_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after an auth failure (1..=2).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.clamp(1, MAX_RETRIES_CAP),
            initial_backoff_ms: config.backoff_ms,
        }
    }
}

fn retry_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(MAX_BACKOFF_MS);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 100;
    Duration::from_millis(base.saturating_add(jitter))
}

#[derive(Clone)]
pub struct ResilientCaller {
    keeper: Arc<SessionKeeper>,
    policy: RetryPolicy,
}

impl ResilientCaller {
    pub fn new(keeper: Arc<SessionKeeper>, policy: RetryPolicy) -> Self {
        Self { keeper, policy }
    }

    pub fn keeper(&self) -> &Arc<SessionKeeper> {
        &self.keeper
    }

    /// Run `op` with the auth-retry policy. `label` names the operation in logs.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, CrmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.policy.max_retries + 1;

        for attempt in 1..=attempts {
            let final_attempt = attempt == attempts;

            if !self.keeper.ensure_fresh().await && final_attempt {
                log::warn!(
                    "{}: no valid session on attempt {}/{}, not issuing call",
                    label,
                    attempt,
                    attempts
                );
                return Err(CrmError::AuthExpired);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_auth_expired() && !final_attempt => {
                    let delay = retry_delay(attempt, &self.policy);
                    log::warn!(
                        "{}: auth failure on attempt {}/{}, refreshing session (sleep {:?})",
                        label,
                        attempt,
                        attempts,
                        delay
                    );
                    if let Err(e) = self.keeper.force_refresh().await {
                        log::warn!("{}: forced refresh failed: {}", label, e);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    log::error!("{} failed: {}", label, err);
                    return Err(err.into());
                }
            }
        }

        Err(CrmError::AuthExpired)
    }
}
