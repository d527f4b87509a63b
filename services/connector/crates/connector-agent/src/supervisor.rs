//! Sketch process supervision.
//!
//! Every sketch id owns a slot guarded by its own async mutex. START and
//! STOP for one id run strictly one after the other while different ids
//! proceed in parallel. The slot holds the only handle able to kill the
//! child; nothing outside this module ever signals a pid.
//!
//! Each child gets a monitor task that reaps it. A sketch that exits by
//! itself is marked STOPPED by its monitor, which re-takes the slot lock and
//! checks a generation number so it never clears a newer process.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};

use connector_common::{AgentConfig, SKETCH_INDEX_FILE, SketchAction, SketchRecord};

use crate::error::AgentError;
use crate::index::SketchIndex;
use crate::status::StatusStore;

/// Canonical name of the hot-plug slot inside the sketch folder.
pub const HOTPLUG_SKETCH: &str = "sketchLoadedThroughUSB";

/// How long STOP waits for a killed child to be reaped.
const EXIT_GRACE: Duration = Duration::from_secs(5);

const NO_PROXY_DEFAULT: &str = "localhost,127.0.0.1,localaddress,.localdomain.com";

/// Environment handed to every sketch on top of the agent's own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnEnv {
    vars: Vec<(String, String)>,
}

impl SpawnEnv {
    /// Library path and proxy settings for sketches launched under `config`.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::build(
            config,
            std::env::var("LD_LIBRARY_PATH").ok(),
            std::env::var_os("no_proxy").is_some(),
        )
    }

    fn build(config: &AgentConfig, inherited_ld_path: Option<String>, has_no_proxy: bool) -> Self {
        let lib = config.sketch_folder.join("lib").display().to_string();
        let ld_path = match inherited_ld_path {
            Some(existing) if !existing.is_empty() => format!("{lib}:{existing}"),
            _ => lib,
        };

        let mut vars = vec![("LD_LIBRARY_PATH".to_string(), ld_path)];
        for (key, value) in [
            ("http_proxy", &config.http_proxy),
            ("https_proxy", &config.https_proxy),
            ("all_proxy", &config.all_proxy),
        ] {
            if let Some(value) = value {
                vars.push((key.to_string(), value.clone()));
            }
        }
        if !has_no_proxy {
            vars.push(("no_proxy".to_string(), NO_PROXY_DEFAULT.to_string()));
        }
        Self { vars }
    }

    #[must_use]
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }
}

/// Owned handle to a running child.
struct SketchProcess {
    pid: NonZeroU32,
    generation: u64,
    kill: oneshot::Sender<()>,
    exited: oneshot::Receiver<()>,
}

impl SketchProcess {
    async fn terminate(self, id: &str) {
        let _ = self.kill.send(());
        if tokio::time::timeout(EXIT_GRACE, self.exited).await.is_err() {
            tracing::warn!(sketch = %id, pid = self.pid.get(), "sketch not reaped after kill");
        }
    }
}

#[derive(Default)]
struct Slot {
    process: Option<SketchProcess>,
}

struct Inner {
    store: Arc<StatusStore>,
    index: SketchIndex,
    sketch_folder: PathBuf,
    env: SpawnEnv,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
    generation: AtomicU64,
}

/// Starts, stops and reaps sketches. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        store: Arc<StatusStore>,
        sketch_folder: impl Into<PathBuf>,
        index: SketchIndex,
        env: SpawnEnv,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                index,
                sketch_folder: sketch_folder.into(),
                env,
                slots: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn from_config(store: Arc<StatusStore>, config: &AgentConfig) -> Self {
        Self::new(
            store,
            &config.sketch_folder,
            SketchIndex::new(config.sketch_index_path()),
            SpawnEnv::from_config(config),
        )
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StatusStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn sketch_folder(&self) -> &Path {
        &self.inner.sketch_folder
    }

    /// Where hot-plugged executables are installed.
    #[must_use]
    pub fn hotplug_path(&self) -> PathBuf {
        self.inner.sketch_folder.join(HOTPLUG_SKETCH)
    }

    async fn slot(&self, id: &str) -> Arc<Mutex<Slot>> {
        self.inner
            .slots
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Apply START or STOP to the sketch `id` and publish the result.
    ///
    /// START on a running sketch and STOP on a stopped one succeed without
    /// touching any process.
    ///
    /// # Errors
    ///
    /// `UnknownSketch` when no record exists for `id`; `ProcessSpawn` when the
    /// executable cannot be launched, in which case the record stays STOPPED.
    pub async fn apply_action(
        &self,
        id: &str,
        action: SketchAction,
    ) -> Result<SketchRecord, AgentError> {
        let slot = self.slot(id).await;
        let mut slot = slot.lock().await;
        let store = &self.inner.store;
        let mut record = store
            .get(id)
            .await
            .ok_or_else(|| AgentError::UnknownSketch(id.to_string()))?;

        match action {
            SketchAction::Start => {
                if record.is_running() {
                    tracing::debug!(
                        sketch = %id,
                        pid = record.pid(),
                        "start ignored, already running"
                    );
                    return Ok(record);
                }
                let process = self.spawn(id, &record)?;
                record.mark_running(process.pid);
                tracing::info!(sketch = %id, pid = process.pid.get(), "sketch started");
                slot.process = Some(process);
            }
            SketchAction::Stop => {
                if !record.is_running() {
                    tracing::debug!(sketch = %id, "stop ignored, not running");
                    return Ok(record);
                }
                match slot.process.take() {
                    Some(process) => process.terminate(id).await,
                    None => tracing::warn!(
                        sketch = %id,
                        pid = record.pid(),
                        "no owned process for running record, clearing without signal"
                    ),
                }
                record.mark_stopped();
                tracing::info!(sketch = %id, "sketch stopped");
            }
        }

        store.set(id, record.clone()).await;
        store.publish_best_effort().await;
        Ok(record)
    }

    fn spawn(&self, id: &str, record: &SketchRecord) -> Result<SketchProcess, AgentError> {
        let spawn_error = |source| AgentError::ProcessSpawn {
            id: id.to_string(),
            path: record.path().to_path_buf(),
            source,
        };

        let mut child = Command::new(record.path())
            .envs(self.inner.env.vars().iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let pid = child
            .id()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                spawn_error(std::io::Error::other("child exited before reporting a pid"))
            })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(sketch = %id, error = %e, "kill failed");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => tracing::info!(sketch = %id, %status, "sketch exited"),
                Err(e) => tracing::warn!(sketch = %id, error = %e, "cannot reap sketch"),
            }
            let _ = exited_tx.send(());
            supervisor.reap(&id, generation).await;
        });

        Ok(SketchProcess {
            pid,
            generation,
            kill: kill_tx,
            exited: exited_rx,
        })
    }

    /// Mark `id` stopped after its child exited on its own.
    async fn reap(&self, id: &str, generation: u64) {
        let slot = self.slot(id).await;
        let mut slot = slot.lock().await;
        if slot.process.as_ref().map(|p| p.generation) != Some(generation) {
            return;
        }
        slot.process = None;

        let store = &self.inner.store;
        if let Some(mut record) = store.get(id).await {
            record.mark_stopped();
            store.set(id, record).await;
            store.publish_best_effort().await;
        }
    }

    /// Create or replace the record for the file at `path`, stopped.
    ///
    /// The id comes from the sketch index, falling back to the file name.
    /// A still-running process for the same id is stopped first.
    pub async fn register(&self, path: &Path) -> SketchRecord {
        let name = path.file_name().map_or_else(
            || path.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        );
        let id = self.inner.index.resolve(&name).await;

        let slot = self.slot(&id).await;
        let mut slot = slot.lock().await;
        if let Some(process) = slot.process.take() {
            tracing::warn!(sketch = %id, "rediscovered while running, stopping previous process");
            process.terminate(&id).await;
        }

        let record = SketchRecord::stopped(&id, &name, path);
        tracing::info!(sketch = %id, name = %name, "sketch registered");
        self.inner.store.set(&id, record.clone()).await;
        self.inner.store.publish_best_effort().await;
        record
    }

    /// Register every regular file of the sketch folder.
    ///
    /// An unreadable folder is logged and yields no records.
    pub async fn scan_folder(&self) -> Vec<SketchRecord> {
        let folder = &self.inner.sketch_folder;
        let mut entries = match tokio::fs::read_dir(folder).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(folder = %folder.display(), error = %e, "cannot scan sketch folder");
                return Vec::new();
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
                    let path = entry.path();
                    if is_file
                        && entry.file_name() != SKETCH_INDEX_FILE
                        && path != self.inner.index.path()
                    {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        folder = %folder.display(),
                        error = %e,
                        "sketch folder scan interrupted"
                    );
                    break;
                }
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            records.push(self.register(&path).await);
        }
        records
    }

    /// START the sketch whose display name is `name`, if one is registered.
    pub async fn autospawn(&self, name: &str) -> Option<Result<SketchRecord, AgentError>> {
        let record = self.inner.store.find_by_name(name).await?;
        Some(self.apply_action(record.id(), SketchAction::Start).await)
    }
}
