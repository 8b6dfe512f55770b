//! HTTP client for a PostgREST + GoTrue style backend.
//!
//! Tables live under `{api_url}/rest/v1/{table}`, auth under
//! `{api_url}/auth/v1/*`. Every request carries the publishable key as
//! `apikey`; data requests carry the session access token as the bearer
//! (falling back to the key when signed out). The client holds the current
//! session itself so the data side always sends the latest token.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;

use super::{classify_api_error, AuthService, DataService, Query, RemoteError, Table};
use crate::error::CrmError;
use crate::session::Session;
use crate::types::Config;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

// ============================================================================
// Auth payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Token grant response (password, refresh_token, and auto-confirmed sign-up).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Unix seconds.
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let issued_at = Utc::now();
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| {
                issued_at
                    + chrono::Duration::seconds(
                        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
                    )
            });
        Session {
            subject_id: self.user.id,
            email: self.user.email,
            issued_at,
            expires_at,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
        }
    }
}

/// Turn a failed response body into a `RemoteError`.
///
/// PostgREST reports `{code, message}`; GoTrue uses `{error_code, msg}` or
/// the OAuth `{error, error_description}` pair.
fn parse_error_body(status: u16, body: &str) -> RemoteError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |names: &[&str]| -> Option<String> {
        let value = parsed.as_ref()?;
        names
            .iter()
            .find_map(|name| value.get(*name).and_then(Value::as_str))
            .map(str::to_string)
    };

    let code = field(&["code", "error_code", "error"]);
    let message = field(&["message", "msg", "error_description"]).unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            body.to_string()
        }
    });
    classify_api_error(status, code.as_deref(), &message)
}

async fn read_error(resp: reqwest::Response) -> RemoteError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    parse_error_body(status, &body)
}

/// PostgREST filter/order parameters for a query.
fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for (column, value) in &query.filters {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.push((column.clone(), format!("eq.{}", rendered)));
    }
    if let Some((column, ascending)) = &query.order {
        let direction = if *ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", column, direction)));
    }
    params
}

// ============================================================================
// Client
// ============================================================================

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    session: RwLock<Option<Session>>,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self, CrmError> {
        config.validate_remote()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| CrmError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            session: RwLock::new(None),
        })
    }

    fn rest_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        self.session
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.api_key.clone())
    }

    fn with_keys(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(self.bearer())
    }

    fn store_session(&self, session: &Session) {
        *self.session.write() = Some(session.clone());
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<Session, RemoteError> {
        let resp = self
            .client
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }
        let token: TokenResponse = resp.json().await?;
        let session = token.into_session();
        self.store_session(&session);
        Ok(session)
    }

    /// First row of a `return=representation` response.
    async fn single_row(
        resp: reqwest::Response,
        table: Table,
        id: Option<&str>,
    ) -> Result<Value, RemoteError> {
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }
        let rows: Vec<Value> = resp.json().await?;
        rows.into_iter().next().ok_or_else(|| RemoteError::NotFound {
            table: table.as_str(),
            id: id.unwrap_or("<new>").to_string(),
        })
    }
}

#[async_trait]
impl DataService for HttpBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        let resp = self
            .with_keys(self.client.get(self.rest_url(table)))
            .query(&query_params(query))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError> {
        let resp = self
            .with_keys(self.client.post(self.rest_url(table)))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        Self::single_row(resp, table, None).await
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError> {
        let resp = self
            .with_keys(self.client.patch(self.rest_url(table)))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        Self::single_row(resp, table, Some(id)).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        let resp = self
            .with_keys(self.client.delete(self.rest_url(table)))
            .query(&[("id", format!("eq.{}", id))])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }
        Ok(())
    }
}

#[async_trait]
impl AuthService for HttpBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
        self.token_grant(
            "password",
            serde_json::json!({ "email": email, "password": password }),
        )
        .await
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Option<Session>, RemoteError> {
        let resp = self
            .client
            .post(self.auth_url("signup"))
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": { "full_name": full_name },
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }

        // Auto-confirmed projects answer with a token grant, others with the bare user.
        let body: Value = resp.json().await?;
        if body.get("access_token").is_none() {
            return Ok(None);
        }
        let token: TokenResponse = serde_json::from_value(body)?;
        let session = token.into_session();
        self.store_session(&session);
        Ok(Some(session))
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let session = self.session.write().take();
        let Some(session) = session else {
            return Ok(());
        };
        let resp = self
            .client
            .post(self.auth_url("logout"))
            .header("apikey", &self.api_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, RemoteError> {
        let Some(session) = self.session.read().clone() else {
            return Ok(None);
        };
        // An expired access token cannot be verified; hand it back so the
        // keeper can refresh it.
        if session.is_expired() {
            return Ok(Some(session));
        }

        let resp = self
            .client
            .get(self.auth_url("user"))
            .header("apikey", &self.api_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(Some(session));
        }
        match read_error(resp).await {
            RemoteError::AuthExpired => {
                log::info!("Session for {} was revoked", session.subject_id);
                *self.session.write() = None;
                Ok(None)
            }
            other => Err(other),
        }
    }

    async fn refresh_session(&self) -> Result<Session, RemoteError> {
        let refresh_token = self
            .session
            .read()
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(RemoteError::AuthExpired)?;
        self.token_grant(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }
}
