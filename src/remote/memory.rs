//! In-process backend.
//!
//! Behaves like the hosted service closely enough for the core: data calls
//! require a live session, inserts assign ids, sign-up creates a profile row.
//! Faults can be injected per call class, and call counters let tests assert
//! how often the network would have been hit.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use super::{classify_api_error, AuthService, DataService, Query, RemoteError, Table};
use crate::models::RoleType;
use crate::session::Session;

const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

/// Failure to inject into upcoming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    AuthExpired,
    Unavailable,
}

impl Fault {
    fn to_error(self) -> RemoteError {
        match self {
            Fault::AuthExpired => RemoteError::AuthExpired,
            Fault::Unavailable => RemoteError::Unavailable("injected fault".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub session_queries: u32,
    pub refresh_calls: u32,
    pub reads: u32,
    pub writes: u32,
}

#[derive(Debug, Clone)]
struct MemoryUser {
    id: String,
    password: String,
}

#[derive(Debug)]
struct MemoryState {
    tables: HashMap<Table, Vec<Value>>,
    users: HashMap<String, MemoryUser>,
    session: Option<Session>,
    session_ttl: chrono::Duration,
    read_faults: Option<(u32, Fault)>,
    write_faults: Option<(u32, Fault)>,
    refresh_fails: bool,
    counters: CallCounters,
    token_seq: u64,
}

impl MemoryState {
    fn authorize(&self) -> Result<(), RemoteError> {
        match &self.session {
            Some(session) if !session.is_expired() => Ok(()),
            _ => Err(RemoteError::AuthExpired),
        }
    }

    fn issue_session(&mut self, subject_id: &str, email: &str) -> Session {
        self.token_seq += 1;
        let now = Utc::now();
        let session = Session {
            subject_id: subject_id.to_string(),
            email: Some(email.to_string()),
            issued_at: now,
            expires_at: now + self.session_ttl,
            access_token: format!("access-{}-{}", subject_id, self.token_seq),
            refresh_token: format!("refresh-{}-{}", subject_id, self.token_seq),
        };
        self.session = Some(session.clone());
        session
    }

    fn insert_profile(&mut self, id: &str, email: &str, full_name: &str, role: RoleType) {
        let profile = serde_json::json!({
            "id": id,
            "email": email,
            "full_name": full_name,
            "role_type": role,
            "region": null,
            "avatar_url": null,
        });
        self.tables.entry(Table::Profiles).or_default().push(profile);
    }
}

/// Take one charge of an injected fault, if any remain.
fn take_fault(slot: &mut Option<(u32, Fault)>) -> Option<RemoteError> {
    let (remaining, fault) = (*slot)?;
    if remaining <= 1 {
        *slot = None;
    } else if remaining != u32::MAX {
        *slot = Some((remaining - 1, fault));
    }
    Some(fault.to_error())
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

pub struct MemoryBackend {
    inner: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                tables: HashMap::new(),
                users: HashMap::new(),
                session: None,
                session_ttl: chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECS),
                read_faults: None,
                write_faults: None,
                refresh_fails: false,
                counters: CallCounters::default(),
                token_seq: 0,
            }),
        }
    }

    /// Register a user with a matching profile row. Returns the user id.
    pub fn add_user(&self, email: &str, password: &str, full_name: &str, role: RoleType) -> String {
        let mut state = self.inner.lock();
        let id = uuid::Uuid::new_v4().to_string();
        state.users.insert(
            email.to_lowercase(),
            MemoryUser {
                id: id.clone(),
                password: password.to_string(),
            },
        );
        state.insert_profile(&id, email, full_name, role);
        id
    }

    /// Put rows straight into a table, bypassing auth and faults.
    pub fn seed(&self, table: Table, rows: Vec<Value>) {
        self.inner.lock().tables.entry(table).or_default().extend(rows);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.inner
            .lock()
            .tables
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_session_ttl(&self, ttl: chrono::Duration) {
        self.inner.lock().session_ttl = ttl;
    }

    /// Make the current session look expired to every later call.
    pub fn expire_session(&self) {
        if let Some(session) = self.inner.lock().session.as_mut() {
            session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.inner.lock().refresh_fails = fail;
    }

    /// Fail the next `times` selects (`u32::MAX` = until cleared).
    pub fn fail_reads(&self, times: u32, fault: Fault) {
        self.inner.lock().read_faults = (times > 0).then_some((times, fault));
    }

    /// Fail the next `times` inserts/updates/deletes (`u32::MAX` = until cleared).
    pub fn fail_writes(&self, times: u32, fault: Fault) {
        self.inner.lock().write_faults = (times > 0).then_some((times, fault));
    }

    pub fn clear_faults(&self) {
        let mut state = self.inner.lock();
        state.read_faults = None;
        state.write_faults = None;
        state.refresh_fails = false;
    }

    pub fn counters(&self) -> CallCounters {
        self.inner.lock().counters
    }

    pub fn reset_counters(&self) {
        self.inner.lock().counters = CallCounters::default();
    }
}

#[async_trait]
impl DataService for MemoryBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        let mut state = self.inner.lock();
        state.counters.reads += 1;
        if let Some(err) = take_fault(&mut state.read_faults) {
            return Err(err);
        }
        state.authorize()?;

        let mut rows: Vec<Value> = state
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        query
                            .filters
                            .iter()
                            .all(|(column, value)| row.get(column) == Some(value))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, ascending)) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(column), b.get(column));
                if *ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, mut row: Value) -> Result<Value, RemoteError> {
        let mut state = self.inner.lock();
        state.counters.writes += 1;
        if let Some(err) = take_fault(&mut state.write_faults) {
            return Err(err);
        }
        state.authorize()?;

        let Some(object) = row.as_object_mut() else {
            return Err(classify_api_error(400, Some("PGRST102"), "row must be an object"));
        };
        if object.get("id").map(Value::is_null).unwrap_or(true) {
            object.insert(
                "id".to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }

        let rows = state.tables.entry(table).or_default();
        if rows.iter().any(|existing| row_id(existing) == row_id(&row)) {
            return Err(classify_api_error(
                409,
                Some("23505"),
                "duplicate key value violates unique constraint",
            ));
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, RemoteError> {
        let mut state = self.inner.lock();
        state.counters.writes += 1;
        if let Some(err) = take_fault(&mut state.write_faults) {
            return Err(err);
        }
        state.authorize()?;

        let row = state
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.iter_mut().find(|row| row_id(row) == Some(id)))
            .ok_or_else(|| RemoteError::NotFound {
                table: table.as_str(),
                id: id.to_string(),
            })?;

        if let (Some(target), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
            for (key, value) in changes {
                if key != "id" {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        let mut state = self.inner.lock();
        state.counters.writes += 1;
        if let Some(err) = take_fault(&mut state.write_faults) {
            return Err(err);
        }
        state.authorize()?;

        if let Some(rows) = state.tables.get_mut(&table) {
            rows.retain(|row| row_id(row) != Some(id));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthService for MemoryBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
        let mut state = self.inner.lock();
        let user = state
            .users
            .get(&email.to_lowercase())
            .filter(|user| user.password == password)
            .cloned()
            .ok_or_else(|| {
                classify_api_error(400, Some("invalid_grant"), "Invalid login credentials")
            })?;
        Ok(state.issue_session(&user.id, email))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Option<Session>, RemoteError> {
        let mut state = self.inner.lock();
        let key = email.to_lowercase();
        if state.users.contains_key(&key) {
            return Err(classify_api_error(
                422,
                Some("user_already_exists"),
                "User already registered",
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.users.insert(
            key,
            MemoryUser {
                id: id.clone(),
                password: password.to_string(),
            },
        );
        state.insert_profile(&id, email, full_name, RoleType::Sales);
        Ok(Some(state.issue_session(&id, email)))
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.inner.lock().session = None;
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, RemoteError> {
        let mut state = self.inner.lock();
        state.counters.session_queries += 1;
        Ok(state.session.clone())
    }

    async fn refresh_session(&self) -> Result<Session, RemoteError> {
        let mut state = self.inner.lock();
        state.counters.refresh_calls += 1;
        if state.refresh_fails {
            return Err(RemoteError::AuthExpired);
        }
        let (subject_id, email) = match &state.session {
            Some(session) => (
                session.subject_id.clone(),
                session.email.clone().unwrap_or_default(),
            ),
            None => return Err(RemoteError::AuthExpired),
        };
        Ok(state.issue_session(&subject_id, &email))
    }
}
