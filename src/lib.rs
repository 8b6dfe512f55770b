//! Field sales CRM core for medical equipment reps.
//!
//! The session keeper keeps the backend credential alive, the resilient
//! caller wraps every remote call with bounded auth recovery, and the
//! application store owns the in-memory collections and applies writes
//! optimistically.

pub mod error;
pub mod keepalive;
pub mod models;
pub mod preferences;
pub mod queries;
pub mod remote;
pub mod resilient;
pub mod session;
pub mod store;
pub mod types;
mod util;

pub use error::{CommandError, CrmError, ErrorType};
pub use keepalive::run_keepalive;
pub use preferences::PreferenceStore;
pub use remote::{AuthService, DataService, RemoteError};
pub use resilient::{ResilientCaller, RetryPolicy};
pub use session::{AuthEvent, LifecycleEvent, Session, SessionKeeper, SessionPolicy};
pub use store::{AppStore, Collection, Collections};
pub use types::{load_config, Config};

/// Initialise `log` output. `RUST_LOG` overrides the default `info` filter.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
