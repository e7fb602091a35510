//! Transport configuration

use std::time::Duration;

use crate::error::ConfigError;

/// Tunables shared by connections, acceptors and the send pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Size of each pooled send buffer in bytes
    pub chunk_size: usize,
    /// Number of free buffers kept by `BufferPool::clean_pool`
    pub pool_baseline: usize,
    /// Sleep between polls of the transport queue
    pub poll_interval: Duration,
    /// Size of the shared per-connection receive buffer
    pub receive_buffer_size: usize,
    /// Largest frame the receive path will reassemble
    pub max_frame_len: usize,
    /// Connect messages per handshake before "incorrect channel" replies
    /// abandon it
    pub max_handshake_attempts: u32,
    /// Samples kept by the profiler's rate window
    pub profiler_window: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            pool_baseline: 16,
            poll_interval: Duration::from_millis(1),
            receive_buffer_size: 64 * 1024,
            max_frame_len: 1024 * 1024,
            max_handshake_attempts: 8,
            profiler_window: 100,
        }
    }
}

impl TransportConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_pool_baseline(mut self, baseline: usize) -> Self {
        self.pool_baseline = baseline;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_max_handshake_attempts(mut self, attempts: u32) -> Self {
        self.max_handshake_attempts = attempts;
        self
    }

    pub fn with_profiler_window(mut self, window: usize) -> Self {
        self.profiler_window = window;
        self
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.receive_buffer_size < self.chunk_size {
            return Err(ConfigError::ReceiveBufferTooSmall {
                receive: self.receive_buffer_size,
                chunk: self.chunk_size,
            });
        }
        if self.max_handshake_attempts == 0 {
            return Err(ConfigError::ZeroHandshakeAttempts);
        }
        if self.profiler_window < 2 {
            return Err(ConfigError::ProfilerWindowTooSmall);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(TransportConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_small_receive_buffer() {
        let config = TransportConfig::default()
            .with_chunk_size(4096)
            .with_receive_buffer_size(1024);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ReceiveBufferTooSmall {
                receive: 1024,
                chunk: 4096
            })
        );
    }

    #[test]
    fn test_rejects_zero_values() {
        let config = TransportConfig::default().with_chunk_size(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroChunkSize));

        let config = TransportConfig::default().with_poll_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroPollInterval));

        let config = TransportConfig::default().with_max_handshake_attempts(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroHandshakeAttempts));
    }
}
