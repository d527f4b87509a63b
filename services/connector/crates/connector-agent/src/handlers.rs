//! Built-in command handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use connector_common::{ActionRequest, AgentConfig, UpdateReport, suffixes};

use crate::dispatch::{CommandHandler, Dispatcher, HandlerContext};
use crate::error::AgentError;

/// Replies with the full status snapshot.
pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, _: &[u8], ctx: &HandlerContext) -> Result<Option<Value>, AgentError> {
        let snapshot = ctx.store.snapshot().await;
        serde_json::to_value(snapshot)
            .map(Some)
            .map_err(|e| AgentError::publish(suffixes::STATUS, e))
    }
}

/// START/STOP a sketch and reply with its updated record.
pub struct SketchHandler;

#[async_trait]
impl CommandHandler for SketchHandler {
    async fn handle(
        &self,
        payload: &[u8],
        ctx: &HandlerContext,
    ) -> Result<Option<Value>, AgentError> {
        let request: ActionRequest = serde_json::from_slice(payload)
            .map_err(|e| AgentError::malformed(suffixes::SKETCH_POST, e))?;
        tracing::info!(sketch = %request.id, action = %request.action, "sketch command");

        let record = ctx
            .supervisor
            .apply_action(&request.id, request.action)
            .await?;
        serde_json::to_value(record)
            .map(Some)
            .map_err(|e| AgentError::publish(suffixes::SKETCH_POST, e))
    }
}

/// Reports the running version and where updates come from.
pub struct UpdateHandler {
    report: UpdateReport,
}

impl UpdateHandler {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            report: UpdateReport {
                app_name: config.app_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                update_url: config.update_url.clone(),
            },
        }
    }
}

#[async_trait]
impl CommandHandler for UpdateHandler {
    async fn handle(&self, _: &[u8], _: &HandlerContext) -> Result<Option<Value>, AgentError> {
        tracing::info!(
            version = %self.report.version,
            feed = %self.report.update_url,
            "update check"
        );
        serde_json::to_value(&self.report)
            .map(Some)
            .map_err(|e| AgentError::publish(suffixes::UPDATE_POST, e))
    }
}

/// Register `/status/post`, `/sketch/post` and `/update/post`.
pub fn register_builtin(dispatcher: &Dispatcher, config: &AgentConfig) {
    dispatcher.register(suffixes::STATUS_POST, Arc::new(StatusHandler));
    dispatcher.register(suffixes::SKETCH_POST, Arc::new(SketchHandler));
    dispatcher.register(suffixes::UPDATE_POST, Arc::new(UpdateHandler::new(config)));
}
