use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the persisted file-name → sketch-id index inside the sketch folder.
pub const SKETCH_INDEX_FILE: &str = "sketches.json";

/// Connector agent configuration.
///
/// Loaded from `CONNECTOR_*` environment variables by the agent binary;
/// every field except the device id and broker host has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Thing id in the cloud registry, also the MQTT client id
    pub id: String,

    /// Broker host; doubles as the TLS server name
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Device certificate (PEM)
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,

    /// Device private key (PEM)
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Trusted roots used to verify the broker (PEM bundle)
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,

    /// Folder scanned for sketches at boot
    #[serde(default = "default_sketch_folder")]
    pub sketch_folder: PathBuf,

    /// Hot-plug drop directory
    #[serde(default = "default_drop_dir")]
    pub drop_dir: PathBuf,

    /// Override for the sketch index location
    #[serde(default)]
    pub sketch_index: Option<PathBuf>,

    /// Listen address of the local bus.
    /// ⚠️ Must be a loopback address; the agent refuses to start otherwise.
    #[serde(default = "default_local_bus_addr")]
    pub local_bus_addr: SocketAddr,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_update_url")]
    pub update_url: String,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,

    #[serde(default)]
    pub all_proxy: Option<String>,
}

impl AgentConfig {
    /// Index location, defaulting to `sketches.json` inside the sketch folder.
    #[must_use]
    pub fn sketch_index_path(&self) -> PathBuf {
        self.sketch_index
            .clone()
            .unwrap_or_else(|| self.sketch_folder.join(SKETCH_INDEX_FILE))
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

fn default_port() -> u16 {
    8883
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("certificate.pem")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("certificate.key")
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/ca-certificates.crt")
}

fn default_sketch_folder() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("sketches"))
        .unwrap_or_else(|| PathBuf::from("sketches"))
}

fn default_drop_dir() -> PathBuf {
    PathBuf::from("/tmp/sketches")
}

fn default_local_bus_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4222))
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_update_url() -> String {
    "http://downloads.arduino.cc/tools/feed/".to_string()
}

fn default_app_name() -> String {
    "arduino-connector".to_string()
}
