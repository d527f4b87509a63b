//! Persisted file-name → sketch-id lookup.
//!
//! The index is a JSON object `{"<file name>": "<sketch id>"}` written by
//! whoever installs sketches. It is read on every lookup and never written
//! by the agent; a missing or unreadable index means "use the file name".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SketchIndex {
    path: PathBuf,
}

impl SketchIndex {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable id recorded for `file_name`, if any.
    pub async fn lookup(&self, file_name: &str) -> Option<String> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(
                    index = %self.path.display(),
                    error = %e,
                    "sketch index unavailable"
                );
                return None;
            }
        };
        match serde_json::from_slice::<HashMap<String, String>>(&raw) {
            Ok(mut entries) => entries.remove(file_name),
            Err(e) => {
                tracing::warn!(
                    index = %self.path.display(),
                    error = %e,
                    "ignoring malformed sketch index"
                );
                None
            }
        }
    }

    /// [`lookup`](Self::lookup) falling back to the file name itself.
    pub async fn resolve(&self, file_name: &str) -> String {
        self.lookup(file_name)
            .await
            .unwrap_or_else(|| file_name.to_string())
    }
}
