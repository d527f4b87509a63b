//! Follows an installer log and forwards its progress markers to `/install`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use connector_common::suffixes;

use crate::status::StatusStore;

/// Lines carrying this marker are forwarded.
pub const MARKER: &str = "$$$";

const POLL: Duration = Duration::from_secs(1);

/// Follow `path` from its beginning, waiting for it to appear.
pub fn spawn(store: Arc<StatusStore>, path: PathBuf) -> JoinHandle<()> {
    spawn_with_poll(store, path, POLL)
}

fn spawn_with_poll(store: Arc<StatusStore>, path: PathBuf, poll: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let file = loop {
            match File::open(&path).await {
                Ok(file) => break file,
                Err(e) => {
                    tracing::trace!(
                        path = %path.display(),
                        error = %e,
                        "install log not there yet"
                    );
                    tokio::time::sleep(poll).await;
                }
            }
        };
        tracing::info!(path = %path.display(), "following install log");

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            match reader.read_line(&mut line).await {
                Ok(0) => tokio::time::sleep(poll).await,
                Ok(_) if line.ends_with('\n') => {
                    let text = line.trim_end_matches(['\n', '\r']);
                    if text.contains(MARKER) {
                        if let Err(e) = store.info(suffixes::INSTALL, text).await {
                            tracing::warn!(error = %e, "install progress not sent");
                        }
                    }
                    line.clear();
                }
                // Partial line: keep it and wait for the rest.
                Ok(_) => tokio::time::sleep(poll).await,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "install log unreadable");
                    return;
                }
            }
        }
    })
}
