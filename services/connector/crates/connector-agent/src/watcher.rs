//! Hot-plug drop folder.
//!
//! Files appearing in the drop folder replace the `sketchLoadedThroughUSB`
//! sketch: the running occupant is stopped, the new file is moved into the
//! sketch folder, registered and started. Events are handled one at a time
//! in arrival order.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use connector_common::{SketchAction, SketchRecord};

use crate::error::AgentError;
use crate::supervisor::{HOTPLUG_SKETCH, Supervisor};

/// Wait after a create event before touching the file, so the writer can
/// finish.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

const DROP_DIR_MODE: u32 = 0o700;
const SKETCH_MODE: u32 = 0o700;

pub struct HotplugWatcher {
    drop_dir: PathBuf,
    supervisor: Supervisor,
    settle: Duration,
    events: mpsc::UnboundedReceiver<PathBuf>,
    // Dropping the watcher ends the event stream.
    _watcher: RecommendedWatcher,
}

impl HotplugWatcher {
    /// Create `drop_dir` (mode 0700) if needed and start watching it.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::WatcherInit` when the folder cannot be created or
    /// the OS watch cannot be registered.
    pub async fn start(
        drop_dir: impl Into<PathBuf>,
        supervisor: Supervisor,
    ) -> Result<Self, AgentError> {
        let drop_dir = drop_dir.into();
        let init_error = |reason: String| AgentError::WatcherInit {
            path: drop_dir.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&drop_dir)
            .await
            .map_err(|e| init_error(e.to_string()))?;
        tokio::fs::set_permissions(&drop_dir, std::fs::Permissions::from_mode(DROP_DIR_MODE))
            .await
            .map_err(|e| init_error(e.to_string()))?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) if is_arrival(event.kind) => {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::error!(%err, "hot-plug watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| init_error(e.to_string()))?;
        watcher
            .watch(&drop_dir, RecursiveMode::NonRecursive)
            .map_err(|e| init_error(e.to_string()))?;

        tracing::info!(dir = %drop_dir.display(), "watching hot-plug folder");
        Ok(Self {
            drop_dir,
            supervisor,
            settle: DEFAULT_SETTLE,
            events,
            _watcher: watcher,
        })
    }

    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    #[must_use]
    pub fn drop_dir(&self) -> &Path {
        &self.drop_dir
    }

    /// Handle arrivals until the watcher shuts down.
    pub async fn run(mut self) {
        while let Some(path) = self.events.recv().await {
            tokio::time::sleep(self.settle).await;
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "hot-plug source gone, skipping");
                continue;
            }
            match install(&self.supervisor, &path).await {
                Ok(record) => tracing::info!(
                    sketch = %record.id(),
                    pid = record.pid(),
                    "hot-plugged sketch running"
                ),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "hot-plug failed"),
            }
        }
        tracing::warn!("hot-plug watcher stopped");
    }
}

fn is_arrival(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

/// Replace the hot-plug sketch with the executable at `source` and start it.
///
/// # Errors
///
/// Aborts on the first failing step: stopping the current occupant, moving
/// the file (`FileSystemTransfer`, source left in place), making it
/// executable, or spawning it.
pub async fn install(supervisor: &Supervisor, source: &Path) -> Result<SketchRecord, AgentError> {
    let store = supervisor.store();
    if let Some(current) = store.find_by_name(HOTPLUG_SKETCH).await {
        if current.is_running() {
            supervisor
                .apply_action(current.id(), SketchAction::Stop)
                .await?;
        }
    }

    let target = supervisor.hotplug_path();
    transfer(source, &target).await?;
    tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(SKETCH_MODE))
        .await
        .map_err(|e| AgentError::FileSystemTransfer {
            from: source.to_path_buf(),
            to: target.clone(),
            reason: format!("chmod: {e}"),
        })?;

    let record = supervisor.register(&target).await;
    supervisor.apply_action(record.id(), SketchAction::Start).await
}

/// Move `from` to `to`, copying when a rename is not possible.
async fn transfer(from: &Path, to: &Path) -> Result<(), AgentError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e, "rename failed, copying instead");
            copy_then_remove(from, to).await
        }
    }
}

async fn copy_then_remove(from: &Path, to: &Path) -> Result<(), AgentError> {
    if let Err(e) = tokio::fs::remove_file(to).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %to.display(), error = %e, "cannot remove previous sketch");
        }
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| AgentError::FileSystemTransfer {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            reason: e.to_string(),
        })?;
    if let Err(e) = tokio::fs::remove_file(from).await {
        tracing::warn!(
            path = %from.display(),
            error = %e,
            "copied sketch but cannot remove source"
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::index::SketchIndex;
    use crate::status::StatusStore;
    use crate::supervisor::SpawnEnv;
    use crate::test_support::{RecordingChannel, wait_until, write_script};

    const WAIT: Duration = Duration::from_secs(10);

    struct Fixture {
        drops: TempDir,
        sketches: TempDir,
        supervisor: Supervisor,
    }

    async fn fixture() -> Fixture {
        let drops = TempDir::new().expect("drop tempdir");
        let sketches = TempDir::new().expect("sketch tempdir");
        let store = Arc::new(StatusStore::new("dev-1"));
        store
            .attach_cloud(Arc::new(RecordingChannel::default()))
            .await;
        let supervisor = Supervisor::new(
            store,
            sketches.path(),
            SketchIndex::new(sketches.path().join("sketches.json")),
            SpawnEnv::default(),
        );
        Fixture {
            drops,
            sketches,
            supervisor,
        }
    }

    #[tokio::test]
    async fn test_install_moves_file_and_starts_it() {
        let fx = fixture().await;
        let source = write_script(fx.drops.path(), "blink.bin", "exec sleep 30");

        let record = install(&fx.supervisor, &source).await.expect("install");
        assert!(record.is_running());
        assert_eq!(record.name(), HOTPLUG_SKETCH);
        assert!(!source.exists(), "source must be consumed");

        let target = fx.sketches.path().join(HOTPLUG_SKETCH);
        let mode = std::fs::metadata(&target).expect("target").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        fx.supervisor
            .apply_action(record.id(), SketchAction::Stop)
            .await
            .expect("stop");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_install_replaces_running_occupant() {
        let fx = fixture().await;
        let first = install(
            &fx.supervisor,
            &write_script(fx.drops.path(), "one", "exec sleep 30"),
        )
        .await
        .expect("first install");
        let old_pid = first.pid();

        let second = install(
            &fx.supervisor,
            &write_script(fx.drops.path(), "two", "exec sleep 30"),
        )
        .await
        .expect("second install");
        assert!(second.is_running());
        assert_ne!(second.pid(), old_pid);
        assert!(
            wait_until(WAIT, || async {
                !Path::new(&format!("/proc/{old_pid}")).exists()
            })
            .await,
            "previous occupant must be terminated"
        );
        assert_eq!(fx.supervisor.store().ids().await.len(), 1);

        fx.supervisor
            .apply_action(second.id(), SketchAction::Stop)
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_source_in_place() {
        let fx = fixture().await;
        let source = write_script(fx.drops.path(), "blink.bin", "exit 0");
        let store = Arc::new(StatusStore::new("dev-1"));
        let broken = Supervisor::new(
            store,
            fx.sketches.path().join("missing"),
            SketchIndex::new(fx.sketches.path().join("sketches.json")),
            SpawnEnv::default(),
        );

        let err = install(&broken, &source).await.expect_err("no target folder");
        assert!(matches!(err, AgentError::FileSystemTransfer { .. }));
        assert!(source.exists());
        assert!(broken.store().ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_occupant_stop_failure_aborts_install() {
        let fx = fixture().await;
        let source = write_script(fx.drops.path(), "blink.bin", "exec sleep 30");
        // Filed under a key that does not match its id, so STOP cannot find it.
        let mut occupant = SketchRecord::stopped(
            "stale-id",
            HOTPLUG_SKETCH,
            fx.supervisor.hotplug_path(),
        );
        occupant.mark_running(std::num::NonZeroU32::new(4242).expect("pid"));
        fx.supervisor.store().set("usb", occupant).await;

        let err = install(&fx.supervisor, &source)
            .await
            .expect_err("stop failure must abort");
        assert!(matches!(err, AgentError::UnknownSketch(_)));
        assert!(source.exists(), "source untouched");
        assert!(!fx.supervisor.hotplug_path().exists(), "nothing installed");
        assert_eq!(fx.supervisor.store().ids().await, vec!["usb".to_string()]);
    }

    #[tokio::test]
    async fn test_copy_then_remove_moves_contents() {
        let dir = TempDir::new().expect("tempdir");
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        std::fs::write(&from, b"new").expect("write from");
        std::fs::write(&to, b"old").expect("write to");

        copy_then_remove(&from, &to).await.expect("copy");
        assert_eq!(std::fs::read(&to).expect("read"), b"new");
        assert!(!from.exists());
    }

    #[tokio::test]
    async fn test_start_creates_private_drop_dir() {
        let fx = fixture().await;
        let drop_dir = fx.drops.path().join("nested").join("drop");
        let watcher = HotplugWatcher::start(&drop_dir, fx.supervisor.clone())
            .await
            .expect("start");
        assert_eq!(watcher.drop_dir(), drop_dir);
        let mode = std::fs::metadata(&drop_dir).expect("dir").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_start_on_unusable_path_is_init_error() {
        let fx = fixture().await;
        let file = fx.drops.path().join("plain-file");
        std::fs::write(&file, b"x").expect("write");
        let err = HotplugWatcher::start(file.join("drop"), fx.supervisor.clone())
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, AgentError::WatcherInit { .. }));
    }

    #[tokio::test]
    async fn test_dropped_file_is_installed_and_started() {
        let fx = fixture().await;
        let watcher = HotplugWatcher::start(fx.drops.path(), fx.supervisor.clone())
            .await
            .expect("start")
            .with_settle(Duration::from_millis(200));
        tokio::spawn(watcher.run());

        let staging = TempDir::new().expect("staging");
        let script = write_script(staging.path(), "usb.bin", "exec sleep 30");
        std::fs::copy(&script, fx.drops.path().join("usb.bin")).expect("drop file");

        let store = fx.supervisor.store().clone();
        assert!(
            wait_until(WAIT, || {
                let store = store.clone();
                async move {
                    store
                        .find_by_name(HOTPLUG_SKETCH)
                        .await
                        .is_some_and(|r| r.is_running())
                }
            })
            .await,
            "dropped sketch must be running"
        );

        let record = store.find_by_name(HOTPLUG_SKETCH).await.expect("record");
        fx.supervisor
            .apply_action(record.id(), SketchAction::Stop)
            .await
            .expect("stop");
    }
}
