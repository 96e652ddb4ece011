pub const TOPIC_ROOT: &str = "sensors";

pub fn data_topic(sensor_id: &str) -> String {
    format!("{TOPIC_ROOT}/{sensor_id}/data")
}

pub fn status_topic(sensor_id: &str) -> String {
    format!("{TOPIC_ROOT}/{sensor_id}/status")
}

pub fn command_topic(sensor_id: &str) -> String {
    format!("{TOPIC_ROOT}/{sensor_id}/command")
}

pub fn config_topic(sensor_id: &str) -> String {
    format!("{TOPIC_ROOT}/{sensor_id}/config")
}

/// Inbound topics the application subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    Command,
    Config,
}

impl InboundTopic {
    /// Classifies `topic` if it addresses `sensor_id`.
    pub fn classify(topic: &str, sensor_id: &str) -> Option<Self> {
        let rest = topic
            .strip_prefix(TOPIC_ROOT)?
            .strip_prefix('/')?
            .strip_prefix(sensor_id)?;
        match rest {
            "/command" => Some(Self::Command),
            "/config" => Some(Self::Config),
            _ => None,
        }
    }
}
