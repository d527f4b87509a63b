//! Shared device status.
//!
//! One `StatusStore` exists per agent and is handed to every component as
//! an `Arc`. Mutations happen under a single mutex; `publish` copies the
//! aggregate while holding it and sends after releasing it, so a slow broker
//! never stalls the supervisor or the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use connector_common::{
    AgentConfig, DeviceInfo, ErrorReport, SketchRecord, StatusSnapshot, error_suffix, subjects,
    suffixes, thing_topic,
};

use crate::channel::Channel;
use crate::error::AgentError;
use crate::local_bus::LocalBus;

#[derive(Default)]
struct DeviceStatus {
    info: DeviceInfo,
    cloud: Option<Arc<dyn Channel>>,
    local_bus: Option<LocalBus>,
    sketches: HashMap<String, SketchRecord>,
}

pub struct StatusStore {
    device_id: String,
    inner: Mutex<DeviceStatus>,
}

impl StatusStore {
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let info = DeviceInfo {
            id: device_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..DeviceInfo::default()
        };
        Self {
            device_id,
            inner: Mutex::new(DeviceStatus {
                info,
                ..DeviceStatus::default()
            }),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn get(&self, id: &str) -> Option<SketchRecord> {
        self.inner.lock().await.sketches.get(id).cloned()
    }

    /// Insert or replace the record for `id`.
    ///
    /// Callers follow every `set` with [`publish`](Self::publish).
    pub async fn set(&self, id: &str, record: SketchRecord) {
        self.inner
            .lock()
            .await
            .sketches
            .insert(id.to_string(), record);
    }

    /// Find a record by its display name.
    pub async fn find_by_name(&self, name: &str) -> Option<SketchRecord> {
        self.inner
            .lock()
            .await
            .sketches
            .values()
            .find(|rec| rec.name() == name)
            .cloned()
    }

    /// Sorted sketch ids currently known.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.sketches.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refresh the device facts from configuration and publish.
    pub async fn update(&self, config: &AgentConfig) {
        {
            let mut status = self.inner.lock().await;
            status.info.id.clone_from(&config.id);
            status.info.host.clone_from(&config.host);
            status.info.sketch_folder.clone_from(&config.sketch_folder);
            status.info.version = env!("CARGO_PKG_VERSION").to_string();
            if status.info.started_at.is_none() {
                status.info.started_at = Some(Utc::now());
            }
        }
        self.publish_best_effort().await;
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let status = self.inner.lock().await;
        StatusSnapshot {
            info: status.info.clone(),
            sketches: status.sketches.clone(),
        }
    }

    /// Replace the device facts and every sketch record with `snapshot`.
    pub async fn apply_snapshot(&self, snapshot: StatusSnapshot) {
        {
            let mut status = self.inner.lock().await;
            status.info = snapshot.info;
            status.sketches = snapshot.sketches;
        }
        self.publish_best_effort().await;
    }

    pub async fn attach_cloud(&self, channel: Arc<dyn Channel>) {
        self.inner.lock().await.cloud = Some(channel);
    }

    pub async fn detach_cloud(&self) {
        self.inner.lock().await.cloud = None;
    }

    pub async fn attach_local_bus(&self, bus: LocalBus) {
        self.inner.lock().await.local_bus = Some(bus);
    }

    /// Send the current aggregate to the shadow and mirror it on the local bus.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Publish` when no cloud session is attached or the
    /// session refuses the message. The local mirror never fails.
    pub async fn publish(&self) -> Result<(), AgentError> {
        let (snapshot, cloud, bus) = {
            let status = self.inner.lock().await;
            let snapshot = StatusSnapshot {
                info: status.info.clone(),
                sketches: status.sketches.clone(),
            };
            (snapshot, status.cloud.clone(), status.local_bus.clone())
        };

        let topic = thing_topic(&self.device_id, suffixes::STATUS);
        let payload =
            serde_json::to_vec(&snapshot).map_err(|e| AgentError::publish(&topic, e))?;

        if let Some(bus) = bus {
            bus.publish(subjects::STATUS, &payload);
        }
        let cloud = cloud.ok_or_else(|| AgentError::publish(&topic, "cloud session not attached"))?;
        cloud.publish(&topic, payload).await
    }

    /// [`publish`](Self::publish), logging instead of failing.
    pub async fn publish_best_effort(&self) {
        if let Err(e) = self.publish().await {
            tracing::debug!(error = %e, "status publish skipped");
        }
    }

    /// Publish a JSON result on `<id><suffix>`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Publish` when serialization fails or no cloud
    /// session is attached.
    pub async fn info<T: Serialize + ?Sized>(
        &self,
        suffix: &str,
        body: &T,
    ) -> Result<(), AgentError> {
        let topic = thing_topic(&self.device_id, suffix);
        let payload = serde_json::to_vec(body).map_err(|e| AgentError::publish(&topic, e))?;
        self.send(&topic, payload).await
    }

    /// Publish a failure for the command received on `suffix`.
    ///
    /// `/sketch/post` reports on `/sketch/error`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Publish` when no cloud session is attached.
    pub async fn error(&self, suffix: &str, message: &str) -> Result<(), AgentError> {
        let topic = thing_topic(&self.device_id, &error_suffix(suffix));
        let report = ErrorReport {
            error: message.to_string(),
        };
        let payload = serde_json::to_vec(&report).map_err(|e| AgentError::publish(&topic, e))?;
        self.send(&topic, payload).await
    }

    /// Publish raw bytes on an absolute topic.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Publish` when no cloud session is attached.
    pub async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), AgentError> {
        let cloud = self.inner.lock().await.cloud.clone();
        let cloud = cloud.ok_or_else(|| AgentError::publish(topic, "cloud session not attached"))?;
        cloud.publish(topic, payload).await
    }
}
