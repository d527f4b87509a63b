//! Transport-independent command dispatch.
//!
//! Cloud messages and local-bus messages are both reduced to a
//! `(suffix, payload)` pair and routed through one suffix table. Each
//! command runs on its own task; its outcome is published on the result
//! topic or, on failure, exactly once on the sibling `/error` topic.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use connector_common::{local_subject_to_suffix, result_suffix, subjects};

use crate::error::AgentError;
use crate::local_bus::LocalBus;
use crate::status::StatusStore;
use crate::supervisor::Supervisor;

/// Shared handles every handler may use.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<StatusStore>,
    pub supervisor: Supervisor,
}

impl HandlerContext {
    #[must_use]
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            store: supervisor.store().clone(),
            supervisor,
        }
    }
}

/// One command suffix.
///
/// `Ok(Some(body))` is published on the result topic, `Ok(None)` publishes
/// nothing, and `Err` is reported on the error topic.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &[u8],
        ctx: &HandlerContext,
    ) -> Result<Option<serde_json::Value>, AgentError>;
}

struct DispatcherInner {
    ctx: HandlerContext,
    handlers: RwLock<BTreeMap<String, Arc<dyn CommandHandler>>>,
}

/// Suffix → handler table. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// An empty table.
    #[must_use]
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                ctx,
                handlers: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Install `handler` for `suffix`, replacing any previous one.
    pub fn register(&self, suffix: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let suffix = suffix.into();
        tracing::debug!(%suffix, "command handler registered");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(suffix, handler);
    }

    /// Every registered suffix, sorted.
    #[must_use]
    pub fn table(&self) -> Vec<String> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn context(&self) -> &HandlerContext {
        &self.inner.ctx
    }

    fn handler(&self, suffix: &str) -> Option<Arc<dyn CommandHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(suffix)
            .cloned()
    }

    /// Run the command on its own task. Returns `None` when no handler
    /// matches `suffix`.
    pub fn dispatch(&self, suffix: &str, payload: Vec<u8>) -> Option<JoinHandle<()>> {
        let Some(handler) = self.handler(suffix) else {
            tracing::debug!(%suffix, "no handler, ignoring");
            return None;
        };
        let ctx = self.inner.ctx.clone();
        let suffix = suffix.to_string();
        Some(tokio::spawn(async move {
            run(&suffix, handler.as_ref(), &payload, &ctx).await;
        }))
    }

    /// Run the command inline. Returns `false` when no handler matches.
    pub async fn execute(&self, suffix: &str, payload: &[u8]) -> bool {
        let Some(handler) = self.handler(suffix) else {
            tracing::debug!(%suffix, "no handler, ignoring");
            return false;
        };
        run(suffix, handler.as_ref(), payload, &self.inner.ctx).await;
        true
    }

    /// Feed every `$arduino.cloud.>` message of `bus` into the table.
    pub fn bridge_local_bus(&self, bus: &LocalBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe(subjects::CLOUD_WILDCARD);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match local_subject_to_suffix(&msg.subject) {
                    Some(suffix) => {
                        dispatcher.dispatch(&suffix, msg.payload);
                    }
                    None => tracing::debug!(subject = %msg.subject, "unroutable local subject"),
                }
            }
        })
    }
}

async fn run(suffix: &str, handler: &dyn CommandHandler, payload: &[u8], ctx: &HandlerContext) {
    match handler.handle(payload, ctx).await {
        Ok(Some(body)) => {
            if let Err(e) = ctx.store.info(result_suffix(suffix), &body).await {
                tracing::warn!(%suffix, error = %e, "cannot publish command result");
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(%suffix, error = %err, "command failed");
            if let Err(e) = ctx.store.error(suffix, &err.to_string()).await {
                tracing::warn!(%suffix, error = %e, "cannot publish command error");
            }
        }
    }
}
