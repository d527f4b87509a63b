//! Typed agent errors.
//!
//! Command-scoped variants are turned into `<suffix>/error` publications by
//! the dispatcher; subsystem variants (`Connection`, `LocalBus`,
//! `WatcherInit`) end the process from `main`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cloud connection failed: {0}")]
    Connection(String),

    #[error("malformed command on {suffix}: {reason}")]
    MalformedCommand { suffix: String, reason: String },

    #[error("unknown sketch '{0}'")]
    UnknownSketch(String),

    #[error("cannot launch sketch '{id}' from {}: {source}", path.display())]
    ProcessSpawn {
        id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot move {} into {}: {reason}", from.display(), to.display())]
    FileSystemTransfer {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("cannot watch {}: {reason}", path.display())]
    WatcherInit { path: PathBuf, reason: String },

    #[error("publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("local bus unavailable: {0}")]
    LocalBus(String),
}

impl AgentError {
    pub(crate) fn malformed(suffix: &str, reason: impl ToString) -> Self {
        Self::MalformedCommand {
            suffix: suffix.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn publish(topic: &str, reason: impl ToString) -> Self {
        Self::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
