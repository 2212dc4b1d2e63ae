//! Protocol tunables

use rxp_protocol::packet::{DEFAULT_MAX_DATAGRAM, MAX_HEADER_SIZE};
use std::time::Duration;
use thiserror::Error;

/// Largest UDP payload over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Configuration shared by a listener, its communicator and its connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxpConfig {
    /// Maximum datagram size read from (and written to) the socket
    pub max_datagram_size: usize,
    /// Age after which an unacknowledged packet is resent; also the sweep period
    pub retry_delay: Duration,
    /// Maximum payload bytes per DATA segment
    pub send_buffer_size: usize,
    /// Send window slots for accepted connections
    pub window_size: usize,
    /// How long a close state waits before forcing teardown
    pub close_timeout: Duration,
    /// Socket read timeout; bounds how long loops take to notice shutdown
    pub poll_interval: Duration,
    /// Inbound packets queued per connection before the reader blocks
    pub inbound_queue: usize,
    /// Times a close timer re-arms while the local FIN is unacknowledged
    pub close_rearm_limit: u32,
    /// Give up on `connect` after this long; `None` retries forever
    pub connect_timeout: Option<Duration>,
}

impl Default for RxpConfig {
    fn default() -> Self {
        let retry_delay = Duration::from_secs(5);
        RxpConfig {
            max_datagram_size: DEFAULT_MAX_DATAGRAM,
            retry_delay,
            send_buffer_size: 8,
            window_size: 1,
            close_timeout: retry_delay * 2,
            poll_interval: Duration::from_millis(100),
            inbound_queue: 256,
            close_rearm_limit: 3,
            connect_timeout: None,
        }
    }
}

impl RxpConfig {
    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_datagram_size <= MAX_HEADER_SIZE || self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::DatagramSize {
                size: self.max_datagram_size,
                min: MAX_HEADER_SIZE + 1,
                max: MAX_UDP_PAYLOAD,
            });
        }
        if self.send_buffer_size == 0 {
            return Err(ConfigError::Zero("send_buffer_size"));
        }
        let room = self.max_datagram_size - MAX_HEADER_SIZE;
        if self.send_buffer_size > room {
            return Err(ConfigError::SegmentTooLarge {
                size: self.send_buffer_size,
                max: room,
            });
        }
        if self.window_size == 0 {
            return Err(ConfigError::Zero("window_size"));
        }
        if self.inbound_queue == 0 {
            return Err(ConfigError::Zero("inbound_queue"));
        }
        if self.retry_delay.is_zero() {
            return Err(ConfigError::Zero("retry_delay"));
        }
        if self.close_timeout.is_zero() {
            return Err(ConfigError::Zero("close_timeout"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Datagram size {size} out of range ({min}..={max})")]
    DatagramSize { size: usize, min: usize, max: usize },

    #[error("Segment size {size} does not fit in one datagram (max {max})")]
    SegmentTooLarge { size: usize, max: usize },
}
