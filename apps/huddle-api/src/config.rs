use std::time::Duration;

/// Huddle API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Snowflake node id used when minting group ids.
    pub node_id: u16,
    /// Capacity of each group dispatcher's mailbox.
    pub worker_mailbox_capacity: usize,
    /// Capacity of each channel's outbound queue.
    pub channel_buffer: usize,
    /// How often a channel pings its client. A client silent for two
    /// intervals is disconnected.
    pub channel_ping_interval: Duration,
    /// Largest text frame a member may send.
    pub max_frame_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            port: var_or("PORT", 4003),
            node_id: var_or("NODE_ID", 1),
            worker_mailbox_capacity: var_or("WORKER_MAILBOX_CAPACITY", 256),
            channel_buffer: var_or("CHANNEL_BUFFER", 256usize).max(1),
            channel_ping_interval: Duration::from_secs(var_or("CHANNEL_PING_INTERVAL_SECS", 20u64).max(1)),
            max_frame_bytes: var_or("CHANNEL_MAX_FRAME_BYTES", 64 * 1024),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4003,
            node_id: 1,
            worker_mailbox_capacity: 256,
            channel_buffer: 256,
            channel_ping_interval: Duration::from_secs(20),
            max_frame_bytes: 64 * 1024,
        }
    }
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %v, "ignoring unparsable config value");
            default
        }),
        Err(_) => default,
    }
}
