//! Error type shared by the whole crate.

use crate::{connection::State, Address};

/// Everything that can go wrong in the protocol engine and its drivers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OstError {
    /// No room left in the transmit window.
    #[error("transmit window is full")]
    WindowFull,

    /// A connection to the endpoint's own address.
    #[error("cannot open a connection to own address {0}")]
    BadAddress(Address),

    /// Every retransmission timer slot is in use.
    #[error("retransmission timer queue is full")]
    TimerQueueFull,

    /// Cancel for a sequence number with no timer.
    #[error("no retransmission timer for sequence {0}")]
    TimerNotFound(u8),

    /// Requested interval exceeds the hardware counter.
    #[error("timer duration of {0}us exceeds the hardware counter")]
    TimerDurationTooLarge(u128),

    /// Write larger than the maximum segment size.
    #[error("payload of {size} bytes exceeds maximum segment size {max}")]
    OversizedSegment {
        /// Length of the rejected payload.
        size: usize,
        /// Configured maximum segment size.
        max: usize,
    },

    /// Operation not allowed in the connection's current state.
    #[error("operation not permitted in state {0}")]
    WrongState(State),

    /// No connection to that peer.
    #[error("no connection to peer {0}")]
    NoConnection(Address),

    /// No endpoint registered at that address.
    #[error("no endpoint at address {0}")]
    UnknownEndpoint(Address),

    /// The outbound queue is full.
    #[error("outbound queue is at its limit of {0} segments")]
    Busy(usize),

    /// Frame shorter than a header.
    #[error("malformed header: {0} bytes, need 4")]
    MalformedHeader(usize),

    /// Fewer payload bytes than the header declares.
    #[error("truncated segment: header declares {expected} payload bytes, {actual} present")]
    Truncated {
        /// Payload length from the header.
        expected: usize,
        /// Payload bytes actually present.
        actual: usize,
    },

    /// A [`crate::Config`] field is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The driver task is gone.
    #[error("endpoint driver has shut down")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OstError>;
