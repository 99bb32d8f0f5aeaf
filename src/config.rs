//! Per-endpoint protocol parameters.
//!
//! ```
//! use std::time::Duration;
//! use ost::Config;
//!
//! let config = Config::default()
//!     .with_window(4)
//!     .with_retransmission_interval(Duration::from_millis(50));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::{
    constants::*,
    error::{OstError, Result},
};

/// Protocol parameters for one endpoint and every connection it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of segments that may be outstanding in each direction.
    pub window: u8,
    /// Fixed interval after which an unacknowledged segment is resent.
    pub retransmission_interval: Duration,
    /// How long a connection lingers in CLOSE_WAIT before it is released.
    pub close_wait_interval: Duration,
    /// SYN / SYN+ACK resends before the handshake is abandoned.
    pub handshake_retries: u32,
    /// Sequence number an active opener anchors its windows at.
    pub initial_sequence: u8,
    /// Largest payload accepted by `write`.
    pub max_segment_size: usize,
    /// Cap on payloads waiting for window space. `None` is unbounded.
    pub send_queue_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            retransmission_interval: DEFAULT_RETRANSMISSION_INTERVAL,
            close_wait_interval: DEFAULT_CLOSE_WAIT_INTERVAL,
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
            initial_sequence: 0,
            max_segment_size: MAX_SEGMENT_SIZE,
            send_queue_limit: Some(DEFAULT_SEND_QUEUE_LIMIT),
        }
    }
}

impl Config {
    /// Sets the window size `W`.
    pub fn with_window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    /// Sets the retransmission interval, also used between handshake resends.
    pub fn with_retransmission_interval(mut self, interval: Duration) -> Self {
        self.retransmission_interval = interval;
        self
    }

    /// Sets how long CLOSE_WAIT lingers.
    pub fn with_close_wait_interval(mut self, interval: Duration) -> Self {
        self.close_wait_interval = interval;
        self
    }

    /// Sets how many times a SYN or SYN+ACK is resent.
    pub fn with_handshake_retries(mut self, retries: u32) -> Self {
        self.handshake_retries = retries;
        self
    }

    /// Sets the sequence number an active open starts from.
    pub fn with_initial_sequence(mut self, seq: u8) -> Self {
        self.initial_sequence = seq;
        self
    }

    /// Sets the largest payload a single write may carry.
    pub fn with_max_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Caps the outbound queue. `None` removes the cap.
    pub fn with_send_queue_limit(mut self, limit: Option<usize>) -> Self {
        self.send_queue_limit = limit;
        self
    }

    /// Checks every field against the wire format and timer hardware limits.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 || self.window > MAX_WINDOW {
            return Err(OstError::InvalidConfig("window must be within 1..=128"));
        }
        if self.retransmission_interval.is_zero()
            || self.retransmission_interval > MAX_TIMER_DURATION
        {
            return Err(OstError::InvalidConfig(
                "retransmission interval must be non-zero and fit the hardware counter",
            ));
        }
        if self.close_wait_interval > MAX_TIMER_DURATION {
            return Err(OstError::InvalidConfig(
                "close-wait interval must fit the hardware counter",
            ));
        }
        if self.max_segment_size == 0 || self.max_segment_size > MAX_SEGMENT_SIZE {
            return Err(OstError::InvalidConfig(
                "max segment size must be within 1..=255",
            ));
        }
        if self.send_queue_limit == Some(0) {
            return Err(OstError::InvalidConfig("send queue limit must be non-zero"));
        }
        Ok(())
    }
}
