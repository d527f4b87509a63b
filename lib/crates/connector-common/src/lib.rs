pub mod config;
pub mod topics;
pub mod types;

pub use config::{AgentConfig, SKETCH_INDEX_FILE};
pub use topics::{
    error_suffix, local_subject_to_suffix, result_suffix, shadow_delete_topic, subjects,
    suffixes, thing_namespace, thing_topic, validate_device_id,
};
pub use types::*;
