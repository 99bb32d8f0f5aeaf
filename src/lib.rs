//! OST: reliable, in-order segment streams over an unreliable point-to-point
//! serial link.
//!
//! The protocol engine is event driven and never blocks:
//! - a 4 byte header (flags, source, sequence, length) in front of each payload
//! - per-segment retransmission deadlines multiplexed onto one timer per
//!   connection
//! - a sliding window with selective acknowledgment and cumulative advance
//! - an optional SYN / SYN+ACK / ACK handshake with RST teardown
//!
//! An [`Endpoint`] is driven from outside: frames arrive through
//! [`Endpoint::on_receive`], timers come back through [`Endpoint::on_timer`],
//! and outgoing frames leave through a [`Link`]. The [`sim`] module drives
//! endpoints in virtual time over a lossy channel; [`driver`] runs one on a
//! tokio task.
#![warn(
    missing_debug_implementations,
    missing_docs,
    redundant_lifetimes,
    non_local_definitions,
    unsafe_code
)]

pub mod cirbuf;
pub mod config;
pub mod connection;
pub mod constants;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod header;
pub mod link;
pub mod queue;
pub mod scheduler;
pub mod sim;
pub mod timer;
pub mod window;

pub use config::Config;
pub use connection::{Connection, Mode, State};
pub use endpoint::{Accept, Endpoint, EndpointStats};
pub use error::{OstError, Result};
pub use header::{Flags, Header, Segment};
pub use link::Link;
pub use scheduler::{EventQueue, Scheduler, TimerEvent, TimerKind, TimerToken};

/// Station address on the link.
pub type Address = u8;
