//! Device connector agent.
//!
//! Bridges a cloud MQTT command channel and a loopback-only local bus to a
//! set of locally supervised sketches, and keeps the cloud shadow informed
//! of the device status.

pub mod channel;
pub mod cloud;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod index;
pub mod install_log;
pub mod local_bus;
pub mod status;
pub mod supervisor;
pub mod tls;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::Channel;
pub use cloud::{CloudLink, CloudSession, MqttChannel};
pub use dispatch::{CommandHandler, Dispatcher, HandlerContext};
pub use error::AgentError;
pub use local_bus::{LocalBus, LocalMessage};
pub use status::StatusStore;
pub use supervisor::{HOTPLUG_SKETCH, SpawnEnv, Supervisor};
pub use watcher::HotplugWatcher;
