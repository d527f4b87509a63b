/// Topic suffixes appended to the per-device namespace
pub mod suffixes {
    /// Request a full status publication.
    pub const STATUS_POST: &str = "/status/post";

    /// Start or stop a sketch.
    /// Payload: JSON-serialized ActionRequest
    pub const SKETCH_POST: &str = "/sketch/post";

    /// Ask the agent which version it runs and where it updates from.
    pub const UPDATE_POST: &str = "/update/post";

    /// Publish-only liveness channel.
    pub const HEARTBEAT: &str = "/heartbeat";

    /// Publish-only progress lines from the install log follower.
    pub const INSTALL: &str = "/install";

    /// Where status snapshots land.
    pub const STATUS: &str = "/status";

    /// Trailing component of every inbound command suffix.
    pub const POST: &str = "/post";

    /// Appended to a result suffix to form its failure topic.
    pub const ERROR: &str = "/error";
}

/// Subjects on the loopback bus
pub mod subjects {
    /// Every subject under this prefix is treated as a command.
    /// Format: $arduino.cloud.{token}.{token}... maps to /{token}/{token}...
    pub const CLOUD_PREFIX: &str = "$arduino.cloud";

    /// Wildcard subscription covering `CLOUD_PREFIX`.
    pub const CLOUD_WILDCARD: &str = "$arduino.cloud.>";

    /// Status snapshots are mirrored here for co-located processes.
    pub const STATUS: &str = "$arduino.status";
}

/// Root of every per-device cloud topic.
pub const THING_PREFIX: &str = "$aws/things/";

/// `$aws/things/{id}`
pub fn thing_namespace(device_id: &str) -> String {
    format!("{THING_PREFIX}{device_id}")
}

/// `$aws/things/{id}{suffix}`
pub fn thing_topic(device_id: &str, suffix: &str) -> String {
    format!("{THING_PREFIX}{device_id}{suffix}")
}

/// Topic that wipes the device shadow.
pub fn shadow_delete_topic(device_id: &str) -> String {
    thing_topic(device_id, "/shadow/delete")
}

/// Suffix a handler's successful result is published on:
/// `/sketch/post` becomes `/sketch`.
pub fn result_suffix(suffix: &str) -> &str {
    suffix.strip_suffix(suffixes::POST).unwrap_or(suffix)
}

/// Sibling failure suffix: `/sketch/post` becomes `/sketch/error`.
pub fn error_suffix(suffix: &str) -> String {
    format!("{}{}", result_suffix(suffix), suffixes::ERROR)
}

/// Map a local bus subject onto a command suffix.
///
/// Returns `None` for subjects outside `$arduino.cloud`, for the bare
/// prefix itself, and for subjects with empty tokens.
pub fn local_subject_to_suffix(subject: &str) -> Option<String> {
    let rest = subject
        .strip_prefix(subjects::CLOUD_PREFIX)?
        .strip_prefix('.')?;
    if rest.is_empty() || rest.split('.').any(str::is_empty) {
        return None;
    }
    let mut suffix = String::with_capacity(rest.len() + 1);
    for token in rest.split('.') {
        suffix.push('/');
        suffix.push_str(token);
    }
    Some(suffix)
}

/// Validate that a device id is usable as a single MQTT topic level.
/// Returns Ok(()) if valid, Err with description if invalid.
pub fn validate_device_id(device_id: &str) -> Result<(), &'static str> {
    if device_id.is_empty() {
        return Err("device id must not be empty");
    }
    if device_id.contains(['/', '+', '#']) {
        return Err("device id must not contain MQTT separators or wildcards");
    }
    if device_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("device id must not contain whitespace or control characters");
    }
    Ok(())
}
