//! Background session keepalive.
//!
//! Follows the poller pattern: one long-lived task that wakes on a timer or
//! on an external signal. Timer ticks only check the session. Visibility and
//! network events also kick off a fire-and-forget reload of the store once
//! the session is known to be good.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::session::{LifecycleEvent, SessionKeeper};
use crate::store::AppStore;

/// Run until the event channel closes.
pub async fn run_keepalive(
    keeper: Arc<SessionKeeper>,
    store: Option<Arc<AppStore>>,
    mut events: mpsc::Receiver<LifecycleEvent>,
) {
    let period = keeper.policy().check_interval;
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("Session keepalive: checking every {:?}", period);

    loop {
        let event = tokio::select! {
            _ = timer.tick() => LifecycleEvent::Tick,
            received = events.recv() => match received {
                Some(event) => event,
                None => {
                    log::info!("Session keepalive: event channel closed, stopping");
                    return;
                }
            },
        };

        match keeper.handle_lifecycle(event).await {
            None => {}
            Some(false) => {
                log::warn!("Session keepalive: no valid session after {:?}", event);
            }
            Some(true) if event != LifecycleEvent::Tick => {
                if let Some(store) = &store {
                    let store = Arc::clone(store);
                    tokio::spawn(async move {
                        store.refresh_silently().await;
                    });
                }
            }
            Some(true) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::RoleType;
    use crate::preferences::PreferenceStore;
    use crate::remote::memory::MemoryBackend;
    use crate::resilient::{ResilientCaller, RetryPolicy};
    use crate::session::SessionPolicy;

    async fn setup() -> (Arc<MemoryBackend>, Arc<SessionKeeper>, Arc<AppStore>) {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_user("rep@example.com", "secret-pw", "Rep One", RoleType::Sales);
        let keeper = Arc::new(SessionKeeper::new(
            backend.clone(),
            SessionPolicy::default(),
            Arc::new(PreferenceStore::in_memory()),
        ));
        keeper.sign_in("rep@example.com", "secret-pw").await.unwrap();
        let store = Arc::new(AppStore::new(
            backend.clone(),
            ResilientCaller::new(keeper.clone(), RetryPolicy::default()),
        ));
        (backend, keeper, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_tick_checks_session_without_reload() {
        let (backend, keeper, store) = setup().await;
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_keepalive(keeper, Some(store), rx));

        tokio::time::sleep(Duration::from_secs(601)).await;
        let counters = backend.counters();
        assert_eq!(counters.session_queries, 1);
        assert_eq!(counters.reads, 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_restored_triggers_background_reload() {
        let (backend, keeper, store) = setup().await;
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_keepalive(keeper, Some(store.clone()), rx));

        tx.send(LifecycleEvent::NetworkRestored).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let counters = backend.counters();
        assert_eq!(counters.session_queries, 1);
        assert!(counters.reads > 0);
        assert_eq!(store.snapshot().profiles.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_session_skips_reload() {
        let (backend, keeper, store) = setup().await;
        backend.expire_session();
        backend.fail_refresh(true);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_keepalive(keeper, Some(store), rx));

        tx.send(LifecycleEvent::NetworkRestored).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(backend.counters().reads, 0);
    }
}
