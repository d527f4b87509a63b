//! Shared helpers for unit tests.
//!
//! `RecordingChannel` stands in for the broker and keeps everything it was
//! asked to send.

#![allow(clippy::expect_used)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use connector_common::{AgentConfig, SKETCH_INDEX_FILE};

use crate::channel::Channel;
use crate::error::AgentError;
use crate::index::SketchIndex;
use crate::status::StatusStore;
use crate::supervisor::{SpawnEnv, Supervisor};

#[derive(Default)]
pub struct RecordingChannel {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<Vec<String>>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingChannel {
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// One entry per subscribe request.
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make every publish fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Publish calls seen, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AgentError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::publish(topic, "broker unavailable"));
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<(), AgentError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topics);
        Ok(())
    }
}

/// Write an executable `/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Minimal valid configuration for device `id`.
pub fn config_for(id: &str) -> AgentConfig {
    envy::prefixed("CONNECTOR_")
        .from_iter([
            ("CONNECTOR_ID".to_string(), id.to_string()),
            ("CONNECTOR_HOST".to_string(), "broker.example.com".to_string()),
        ])
        .expect("config")
}

/// Supervisor over a fresh temp sketch folder, publishing to a recorder.
pub async fn supervisor_fixture() -> (TempDir, Supervisor, Arc<RecordingChannel>) {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(StatusStore::new("dev-1"));
    let cloud = Arc::new(RecordingChannel::default());
    store.attach_cloud(cloud.clone()).await;
    let supervisor = Supervisor::new(
        store,
        dir.path(),
        SketchIndex::new(dir.path().join(SKETCH_INDEX_FILE)),
        SpawnEnv::default(),
    );
    (dir, supervisor, cloud)
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
