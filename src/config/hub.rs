// ============================================================================
// Connection Hub Configuration
// ============================================================================

use std::time::Duration;

use super::env_parse;

// 64 KB is plenty for typing/read/presence frames; anything larger is abuse
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Bounded outbound queue per session; overflow evicts the session
    pub outbound_queue_capacity: usize,
    /// Bounded command queue in front of the hub loop
    pub command_buffer: usize,
    /// Largest inbound frame accepted from a client
    pub max_frame_bytes: usize,
    /// Idle-read deadline, reset by every frame and every pong
    pub read_timeout: Duration,
    /// Liveness probe period; must be shorter than `read_timeout`
    pub ping_interval: Duration,
    /// Deadline for a single network write
    pub write_timeout: Duration,
    /// Deadline for a client to complete the WebSocket upgrade
    pub handshake_timeout: Duration,
}

impl HubConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            outbound_queue_capacity: env_parse("HUB_OUTBOUND_QUEUE_CAPACITY", 256),
            command_buffer: env_parse("HUB_COMMAND_BUFFER", 1024),
            max_frame_bytes: env_parse("HUB_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES),
            read_timeout: Duration::from_secs(env_parse("HUB_READ_TIMEOUT_SECS", 60)),
            ping_interval: Duration::from_secs(env_parse("HUB_PING_INTERVAL_SECS", 54)),
            write_timeout: Duration::from_secs(env_parse("HUB_WRITE_TIMEOUT_SECS", 10)),
            handshake_timeout: Duration::from_secs(env_parse("HUB_HANDSHAKE_TIMEOUT_SECS", 10)),
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.outbound_queue_capacity == 0 {
            anyhow::bail!("HUB_OUTBOUND_QUEUE_CAPACITY must be at least 1");
        }
        if self.command_buffer == 0 {
            anyhow::bail!("HUB_COMMAND_BUFFER must be at least 1");
        }
        if self.max_frame_bytes == 0 {
            anyhow::bail!("HUB_MAX_FRAME_BYTES must be positive");
        }
        if self.ping_interval.is_zero() {
            anyhow::bail!("HUB_PING_INTERVAL_SECS must be positive");
        }
        if self.ping_interval >= self.read_timeout {
            anyhow::bail!("HUB_PING_INTERVAL_SECS must be shorter than HUB_READ_TIMEOUT_SECS");
        }
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            command_buffer: 1024,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
