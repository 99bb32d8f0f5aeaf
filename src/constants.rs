//! Wire format, window and timer constants.

use std::time::Duration;

/// Bytes in front of every payload.
pub const HEADER_SIZE: usize = 4;

/// Size of the sequence-number space. Sequence numbers are `u8` and wrap at 256.
pub const SEQ_SPACE: usize = 256;

/// Largest window for which the wraparound membership test stays unambiguous.
pub const MAX_WINDOW: u8 = (SEQ_SPACE / 2) as u8;
/// Window used when none is configured.
pub const DEFAULT_WINDOW: u8 = 10;

/// `payload_length` is a single octet on the wire.
pub const MAX_SEGMENT_SIZE: usize = u8::MAX as usize;

/// Width of the hardware interval counter; longer timers cannot be armed.
pub const MAX_TIMER_DURATION: Duration = Duration::from_micros(16_843_000);

/// Default fixed retransmission interval.
pub const DEFAULT_RETRANSMISSION_INTERVAL: Duration = Duration::from_millis(300);
/// Default CLOSE_WAIT linger time.
pub const DEFAULT_CLOSE_WAIT_INTERVAL: Duration = Duration::from_secs(1);
/// Default SYN / SYN+ACK resends.
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 5;
/// Default cap on queued outbound payloads.
pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 256;

// Header flag bits
/// Acknowledgment.
pub const FLAG_ACK: u8 = 0b0000_0001;
/// Synchronize: opens a connection.
pub const FLAG_SYN: u8 = 0b0000_0010;
/// Reset: tears a connection down.
pub const FLAG_RST: u8 = 0b0000_0100;
