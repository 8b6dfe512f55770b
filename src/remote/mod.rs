//! Remote data service boundary.
//!
//! The backend is a black-box table store plus an auth subsystem. Everything
//! above this module sees only the two traits below and `RemoteError`.
//! Backend-specific auth failure vocabulary is translated into
//! `RemoteError::AuthExpired` here and nowhere else.
//!
//! Modules:
//! - http: PostgREST/GoTrue-style client over reqwest
//! - memory: in-process backend with fault injection

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::session::Session;

/// Tables the core reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Hospitals,
    Contacts,
    Notes,
    UsageRecords,
    InstalledEquipment,
    Profiles,
    Contracts,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Hospitals => "hospitals",
            Table::Contacts => "contacts",
            Table::Notes => "notes",
            Table::UsageRecords => "usage_records",
            Table::InstalledEquipment => "installed_equipment",
            Table::Profiles => "profiles",
            Table::Contracts => "contracts",
        }
    }
}

/// Equality filters plus an optional ordering for `select`.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order: Option<(String, bool)>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), true));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), false));
        self
    }
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Session expired or revoked")]
    AuthExpired,
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("{table} row not found: {id}")]
    NotFound { table: &'static str, id: String },
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, RemoteError::AuthExpired)
    }

    /// Network-level or 5xx-equivalent failures.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http(err) => err.is_timeout() || err.is_connect(),
            RemoteError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            RemoteError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Error codes the backend uses for a dead or missing credential.
const AUTH_ERROR_CODES: &[&str] = &[
    "PGRST301",
    "PGRST302",
    "bad_jwt",
    "invalid_jwt",
    "session_not_found",
    "session_expired",
    "refresh_token_not_found",
    "refresh_token_already_used",
    "invalid_grant",
];

/// Map a failed backend response onto `RemoteError`.
///
/// 401s and the known auth codes/messages become `AuthExpired`; everything
/// else keeps its status, code and message.
pub fn classify_api_error(status: u16, code: Option<&str>, message: &str) -> RemoteError {
    let lowered = message.to_lowercase();
    let auth_code = code
        .map(|c| AUTH_ERROR_CODES.iter().any(|known| known.eq_ignore_ascii_case(c)))
        .unwrap_or(false);
    let auth_message = lowered.contains("jwt expired")
        || lowered.contains("invalid jwt")
        || lowered.contains("token is expired")
        || lowered.contains("invalid refresh token");

    if status == 401 || auth_code || auth_message {
        return RemoteError::AuthExpired;
    }
    RemoteError::Api {
        status,
        code: code.map(str::to_string),
        message: message.to_string(),
    }
}

// ============================================================================
// Service traits
// ============================================================================

/// Table-like CRUD keyed by row id. Rows travel as JSON objects.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError>;

    /// Insert a row and return it as stored, including its generated id.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError>;

    /// Patch the row with `id` and return it as stored.
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError>;
}

/// Authentication subsystem of the backend.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError>;

    /// Returns `None` when the backend requires email confirmation first.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Option<Session>, RemoteError>;

    async fn sign_out(&self) -> Result<(), RemoteError>;

    /// Current session as the backend sees it. May be expired.
    async fn get_session(&self) -> Result<Option<Session>, RemoteError>;

    async fn refresh_session(&self) -> Result<Session, RemoteError>;
}

/// Decode a list of rows, failing on the first malformed one.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, RemoteError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(RemoteError::Json))
        .collect()
}

pub fn decode_row<T: DeserializeOwned>(row: Value) -> Result<T, RemoteError> {
    serde_json::from_value(row).map_err(RemoteError::Json)
}
