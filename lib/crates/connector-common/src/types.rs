use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a supervised sketch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SketchState {
    #[default]
    Stopped,
    Running,
}

/// Verb carried by a sketch action request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SketchAction {
    Start,
    Stop,
}

impl fmt::Display for SketchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SketchAction::Start => f.write_str("START"),
            SketchAction::Stop => f.write_str("STOP"),
        }
    }
}

/// Inbound payload of `/sketch/post`.
///
/// Unknown fields are ignored so the cloud can grow the payload without
/// breaking older agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRequest {
    pub id: String,
    pub action: SketchAction,
}

/// A record whose state and pid disagree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sketch '{id}' is {state:?} with pid {pid}")]
pub struct InconsistentRecord {
    pub id: String,
    pub state: SketchState,
    pub pid: u32,
}

/// One supervised sketch as seen by the cloud shadow.
///
/// `state` and `pid` only move together: the pid is non-zero exactly when
/// the sketch is running. Deserialization rejects records that break this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSketchRecord")]
pub struct SketchRecord {
    id: String,
    name: String,
    #[serde(rename = "status")]
    state: SketchState,
    pid: u32,
    path: PathBuf,
}

#[derive(Deserialize)]
struct WireSketchRecord {
    id: String,
    name: String,
    #[serde(rename = "status")]
    state: SketchState,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    path: PathBuf,
}

impl TryFrom<WireSketchRecord> for SketchRecord {
    type Error = InconsistentRecord;

    fn try_from(wire: WireSketchRecord) -> Result<Self, Self::Error> {
        let consistent = match wire.state {
            SketchState::Running => wire.pid != 0,
            SketchState::Stopped => wire.pid == 0,
        };
        if !consistent {
            return Err(InconsistentRecord {
                id: wire.id,
                state: wire.state,
                pid: wire.pid,
            });
        }
        Ok(Self {
            id: wire.id,
            name: wire.name,
            state: wire.state,
            pid: wire.pid,
            path: wire.path,
        })
    }
}

impl SketchRecord {
    /// A freshly discovered sketch: stopped, no process.
    #[must_use]
    pub fn stopped(
        id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: SketchState::Stopped,
            pid: 0,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> SketchState {
        self.state
    }

    /// Process id of the running child, `0` when stopped.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == SketchState::Running
    }

    pub fn mark_running(&mut self, pid: NonZeroU32) {
        self.state = SketchState::Running;
        self.pid = pid.get();
    }

    pub fn mark_stopped(&mut self) {
        self.state = SketchState::Stopped;
        self.pid = 0;
    }
}

/// Static facts about the device, refreshed by `update(config)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub id: String,
    pub version: String,
    pub host: String,
    pub sketch_folder: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
}

/// Serialized form of the whole device status, as sent to the shadow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub info: DeviceInfo,
    pub sketches: HashMap<String, SketchRecord>,
}

/// Liveness payload published on `/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub version: String,
}

/// Body published on every `<suffix>/error` topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub error: String,
}

/// Answer to `/update/post`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateReport {
    pub app_name: String,
    pub version: String,
    pub update_url: String,
}
