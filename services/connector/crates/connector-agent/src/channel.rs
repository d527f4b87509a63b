//! Transport seam between the agent and its cloud broker.

use async_trait::async_trait;

use crate::error::AgentError;

/// Minimal publish/subscribe surface the agent needs from a broker session.
///
/// Implemented by the MQTT session and by the in-memory recorder used in
/// tests, so handlers and the status store never see the transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue `payload` for delivery on `topic` (at-least-once).
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AgentError>;

    /// Subscribe to every topic in one request.
    async fn subscribe(&self, topics: Vec<String>) -> Result<(), AgentError>;
}
