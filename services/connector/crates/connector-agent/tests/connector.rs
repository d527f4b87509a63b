//! End-to-end flows across the local bus, dispatcher, supervisor and
//! hot-plug watcher, with an in-memory channel standing in for the broker.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use connector_agent::dispatch::{Dispatcher, HandlerContext};
use connector_agent::index::SketchIndex;
use connector_agent::{
    AgentError, Channel, HOTPLUG_SKETCH, HotplugWatcher, LocalBus, SpawnEnv, StatusStore,
    Supervisor, handlers,
};
use connector_common::{AgentConfig, ErrorReport, SketchAction, SketchRecord};

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Recorder {
    fn on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Channel for Recorder {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AgentError> {
        self.sent.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, _: Vec<String>) -> Result<(), AgentError> {
        Ok(())
    }
}

struct Agent {
    dir: TempDir,
    store: Arc<StatusStore>,
    supervisor: Supervisor,
    cloud: Arc<Recorder>,
    bus: LocalBus,
}

async fn agent() -> Agent {
    let dir = TempDir::new().expect("tempdir");
    let config: AgentConfig = envy::prefixed("CONNECTOR_")
        .from_iter([
            ("CONNECTOR_ID".to_string(), "dev-1".to_string()),
            ("CONNECTOR_HOST".to_string(), "broker.example.com".to_string()),
        ])
        .expect("config");

    let bus = LocalBus::start("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("local bus");
    let store = Arc::new(StatusStore::new("dev-1"));
    let cloud = Arc::new(Recorder::default());
    store.attach_cloud(cloud.clone()).await;
    store.attach_local_bus(bus.clone()).await;

    let supervisor = Supervisor::new(
        store.clone(),
        dir.path(),
        SketchIndex::new(dir.path().join("sketches.json")),
        SpawnEnv::default(),
    );
    let dispatcher = Dispatcher::new(HandlerContext::new(supervisor.clone()));
    handlers::register_builtin(&dispatcher, &config);
    dispatcher.bridge_local_bus(&bus);

    Agent {
        dir,
        store,
        supervisor,
        cloud,
        bus,
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn running(store: &StatusStore, name: &str) -> Option<SketchRecord> {
    store.find_by_name(name).await.filter(SketchRecord::is_running)
}

/// Minimal NATS client: returns the reader half after consuming `INFO`.
async fn nats_client(bus: &LocalBus) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(bus.local_addr().expect("bound"))
        .await
        .expect("connect");
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut info = String::new();
    reader.read_line(&mut info).await.expect("info");
    assert!(info.starts_with("INFO "));
    write.write_all(b"CONNECT {}\r\n").await.expect("connect op");
    (reader, write)
}

#[tokio::test]
async fn test_local_bus_command_starts_sketch_and_mirrors_status() {
    let agent = agent().await;
    agent
        .supervisor
        .register(&script(agent.dir.path(), "blink", "exec sleep 30"))
        .await;

    let (mut reader, mut writer) = nats_client(&agent.bus).await;
    writer
        .write_all(b"SUB $arduino.status 7\r\nPING\r\n")
        .await
        .expect("sub");
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("pong");
    assert_eq!(line, "PONG\r\n");

    let payload = br#"{"id":"blink","action":"START"}"#;
    writer
        .write_all(format!("PUB $arduino.cloud.sketch.post {}\r\n", payload.len()).as_bytes())
        .await
        .expect("pub header");
    writer.write_all(payload).await.expect("pub body");
    writer.write_all(b"\r\n").await.expect("pub end");

    let store = agent.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { running(&store, "blink").await.is_some() }
        })
        .await,
        "sketch must start from a local command"
    );

    line.clear();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("status mirror in time")
        .expect("read");
    assert!(line.starts_with("MSG $arduino.status 7 "), "got {line:?}");

    let cloud = agent.cloud.clone();
    assert!(eventually(|| async { cloud.on("$aws/things/dev-1/sketch").len() == 1 }).await);

    agent
        .supervisor
        .apply_action("blink", SketchAction::Stop)
        .await
        .expect("stop");
}

#[tokio::test]
async fn test_malformed_local_command_reports_single_error() {
    let agent = agent().await;
    agent
        .supervisor
        .register(&script(agent.dir.path(), "blink", "exit 0"))
        .await;
    let before = agent.store.snapshot().await.sketches;

    assert_eq!(agent.bus.publish("$arduino.cloud.sketch.post", b"{\"id\":"), 1);

    let cloud = agent.cloud.clone();
    assert!(eventually(|| async { !cloud.on("$aws/things/dev-1/sketch/error").is_empty() }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let errors = cloud.on("$aws/things/dev-1/sketch/error");
    assert_eq!(errors.len(), 1);
    let report: ErrorReport = serde_json::from_slice(&errors[0]).expect("error json");
    assert!(report.error.contains("/sketch/post"));
    assert_eq!(agent.store.snapshot().await.sketches, before);
}

#[tokio::test]
async fn test_hotplug_replaces_running_sketch() {
    let agent = agent().await;
    let drops = TempDir::new().expect("drop dir");
    let staging = TempDir::new().expect("staging");
    let watcher = HotplugWatcher::start(drops.path(), agent.supervisor.clone())
        .await
        .expect("watcher")
        .with_settle(Duration::from_millis(200));
    tokio::spawn(watcher.run());

    let first = script(staging.path(), "first.bin", "exec sleep 30");
    std::fs::copy(&first, drops.path().join("first.bin")).expect("drop first");
    let store = agent.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { running(&store, HOTPLUG_SKETCH).await.is_some() }
        })
        .await,
        "first drop must run"
    );
    let old_pid = running(&store, HOTPLUG_SKETCH).await.expect("running").pid();

    let second = script(staging.path(), "second.bin", "exec sleep 30");
    std::fs::copy(&second, drops.path().join("second.bin")).expect("drop second");
    assert!(
        eventually(|| {
            let store = store.clone();
            async move {
                running(&store, HOTPLUG_SKETCH)
                    .await
                    .is_some_and(|r| r.pid() != old_pid)
            }
        })
        .await,
        "second drop must replace the first"
    );

    assert_eq!(store.ids().await.len(), 1);
    assert!(!drops.path().join("second.bin").exists());
    assert!(
        eventually(|| async { !Path::new(&format!("/proc/{old_pid}")).exists() }).await,
        "replaced sketch must be gone"
    );

    let record = running(&store, HOTPLUG_SKETCH).await.expect("running");
    agent
        .supervisor
        .apply_action(record.id(), SketchAction::Stop)
        .await
        .expect("stop");
}
