//! Headless companion: signs in, loads the dashboard data, logs a pipeline
//! summary and keeps the session alive until Ctrl-C.
//!
//! Credentials come from MEDREP_EMAIL / MEDREP_PASSWORD.

use std::sync::Arc;

use medrep_lib::queries;
use medrep_lib::remote::http::HttpBackend;
use medrep_lib::{
    load_config, run_keepalive, AppStore, CommandError, CrmError, PreferenceStore,
    ResilientCaller, RetryPolicy, SessionKeeper, SessionPolicy,
};
use tokio::sync::mpsc;

const EMAIL_ENV: &str = "MEDREP_EMAIL";
const PASSWORD_ENV: &str = "MEDREP_PASSWORD";

#[tokio::main]
async fn main() {
    medrep_lib::init_logging();

    if let Err(e) = run().await {
        let report = CommandError::from(&e);
        match serde_json::to_string(&report) {
            Ok(json) => log::error!("{}", json),
            Err(_) => log::error!("{}", e),
        }
        std::process::exit(1);
    }
}

fn required_env(name: &str) -> Result<String, CrmError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CrmError::Config(format!("{} is not set", name)))
}

async fn run() -> Result<(), CrmError> {
    let config = load_config()?;
    let backend = Arc::new(HttpBackend::new(&config)?);
    let preferences = Arc::new(PreferenceStore::open(&config.preferences_path()?)?);

    let keeper = Arc::new(SessionKeeper::new(
        backend.clone(),
        SessionPolicy::from(&config.session),
        preferences,
    ));
    let store = Arc::new(AppStore::new(
        backend.clone(),
        ResilientCaller::new(keeper.clone(), RetryPolicy::from(&config.retry)),
    ));

    let email = required_env(EMAIL_ENV)?;
    let password = required_env(PASSWORD_ENV)?;
    keeper.sign_in(&email, &password).await?;
    store.load_all().await?;

    let summary = queries::pipeline_summary(&store.accounts());
    for stage in &summary.stages {
        log::info!("{:?}: {}", stage.stage, stage.count);
    }
    log::info!(
        "{} open, {} with equipment, {} never visited",
        summary.open_accounts,
        summary.equipped_accounts,
        summary.never_visited
    );

    let (events, rx) = mpsc::channel(8);
    let keepalive = tokio::spawn(run_keepalive(keeper.clone(), Some(store.clone()), rx));

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupted, shutting down");

    drop(events);
    if let Err(e) = keepalive.await {
        log::warn!("Keepalive task ended abnormally: {}", e);
    }
    store.sign_out().await
}
