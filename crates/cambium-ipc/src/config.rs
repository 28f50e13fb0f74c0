//! Transport configuration.

use crate::wire::DEFAULT_MAGIC;
use std::time::Duration;

/// Configuration shared by endpoints and servers.
#[derive(Clone, Debug)]
pub struct IpcConfig {
    /// Protocol magic number; both ends of a connection must agree on it.
    pub magic: u32,
    /// Largest message accepted from the wire (in bytes).
    pub max_message_size: usize,
    /// How long an outbound connect may take.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on TCP connections.
    pub nodelay: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            max_message_size: 16 * 1024 * 1024,
            connect_timeout: Duration::from_millis(1000),
            nodelay: true,
        }
    }
}

/// Builder for transport configuration.
pub struct IpcConfigBuilder {
    config: IpcConfig,
}

impl IpcConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: IpcConfig::default(),
        }
    }

    pub fn magic(mut self, magic: u32) -> Self {
        self.config.magic = magic;
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.config.connect_timeout = Duration::from_millis(ms);
        self
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    pub fn build(self) -> IpcConfig {
        self.config
    }
}

impl Default for IpcConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
