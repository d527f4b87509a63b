//! Periodic liveness message on `/heartbeat`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use connector_common::{Heartbeat, suffixes};

use crate::status::StatusStore;

/// Publish a heartbeat every `period` until the task is aborted.
///
/// The first beat goes out immediately. Failed publishes are logged and the
/// schedule continues.
pub fn spawn(store: Arc<StatusStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            beat(&store, started).await;
        }
    })
}

async fn beat(store: &StatusStore, started: Instant) {
    let heartbeat = Heartbeat {
        timestamp: Utc::now(),
        uptime_secs: started.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(e) = store.info(suffixes::HEARTBEAT, &heartbeat).await {
        tracing::warn!(error = %e, "heartbeat not sent");
    }
}
