//! A station on the link and its table of per-peer connections.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use tracing::{debug, info, info_span, trace, Span};

use crate::{
    config::Config,
    connection::{Connection, Mode, State},
    error::{OstError, Result},
    header::{Flags, Header, Segment},
    link::Link,
    scheduler::{Scheduler, TimerEvent, TimerToken},
    Address,
};

/// What to do with a segment from a peer that has no connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accept {
    /// Reply RST to everything but RST.
    #[default]
    None,
    /// Open a connectionless connection on the first ACK or DATA.
    Connectionless,
    /// Create a passive connection in LISTEN and hand it the segment.
    Connection,
}

/// Running totals for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Frames the link accepted.
    pub segments_sent: u64,
    /// Header and payload bytes the link accepted.
    pub bytes_sent: u64,
    /// Frames handed to `on_receive`, malformed ones included.
    pub segments_received: u64,
    /// Bytes handed to `on_receive`.
    pub bytes_received: u64,
    /// DATA, SYN and SYN+ACK resends.
    pub retransmissions: u64,
    /// Frames that failed to decode.
    pub malformed: u64,
    /// Frames the link refused.
    pub link_failures: u64,
    /// Payloads handed to the delivery callback.
    pub delivered: u64,
}

/// Counts every frame that passes through to the real link.
struct Counted<'a, L: ?Sized> {
    link: &'a mut L,
    stats: &'a mut EndpointStats,
}

impl<L: Link + ?Sized> Link for Counted<'_, L> {
    fn send(&mut self, frame: Bytes, dest: Address) -> bool {
        let len = frame.len() as u64;
        if self.link.send(frame, dest) {
            self.stats.segments_sent += 1;
            self.stats.bytes_sent += len;
            true
        } else {
            self.stats.link_failures += 1;
            false
        }
    }

    fn is_ready(&self) -> bool {
        self.link.is_ready()
    }
}

/// One station on the link: a table of connections keyed by peer address.
///
/// The endpoint never blocks and never owns a clock. Every entry point that
/// may arm a timer takes the [`Scheduler`], and the scheduler's owner feeds
/// expiries back through [`Endpoint::on_timer`].
pub struct Endpoint<L> {
    address: Address,
    link: L,
    config: Config,
    accept: Accept,
    // Ordered so multi-peer drains are reproducible.
    connections: BTreeMap<Address, Connection>,
    deliver: Box<dyn FnMut(Address, Bytes) + Send>,
    stats: EndpointStats,
    span: Span,
}

impl<L: fmt::Debug> fmt::Debug for Endpoint<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("link", &self.link)
            .field("config", &self.config)
            .field("accept", &self.accept)
            .field("connections", &self.connections)
            //.field("deliver", &self.deliver)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<L: Link> Endpoint<L> {
    /// Creates an endpoint with no connections. Fails if `config` is invalid.
    pub fn new(address: Address, link: L, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            address,
            link,
            config,
            accept: Accept::default(),
            connections: BTreeMap::new(),
            deliver: Box::new(|_, _| {}),
            stats: EndpointStats::default(),
            span: info_span!("endpoint", addr = address),
        })
    }

    /// Installs the callback that receives in-order payloads.
    pub fn on_deliver<F>(&mut self, callback: F)
    where
        F: FnMut(Address, Bytes) + Send + 'static,
    {
        self.deliver = Box::new(callback);
    }

    /// Sets what happens to segments from peers with no connection.
    pub fn accept(&mut self, policy: Accept) {
        self.accept = policy;
    }

    /// This station's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Parameters every new connection is created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counters since the endpoint was created.
    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// The attached link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The attached link, mutably.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// State of the connection to `peer`. `None` once it has been released.
    pub fn state(&self, peer: Address) -> Option<State> {
        self.connections.get(&peer).map(Connection::state)
    }

    /// The connection to `peer`, if any.
    pub fn connection(&self, peer: Address) -> Option<&Connection> {
        self.connections.get(&peer)
    }

    /// Peers with a live connection, in ascending address order.
    pub fn peers(&self) -> Vec<Address> {
        self.connections.keys().copied().collect()
    }

    /// Creates a connection to `peer` and opens it in `mode`.
    ///
    /// Fails with [`OstError::BadAddress`] for this endpoint's own address and
    /// with [`OstError::WrongState`] if a connection to `peer` already exists.
    pub fn open(&mut self, peer: Address, mode: Mode, sched: &mut dyn Scheduler) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if peer == self.address {
            return Err(OstError::BadAddress(peer));
        }
        if let Some(existing) = self.connections.get(&peer) {
            return Err(OstError::WrongState(existing.state()));
        }

        let mut conn = Connection::new(self.address, peer, mode, &self.config);
        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        conn.open(&mut link, sched)?;
        info!(peer, ?mode, state = %conn.state(), "opened");
        self.connections.insert(peer, conn);
        Ok(())
    }

    /// Closes the connection to `peer`.
    pub fn close(&mut self, peer: Address, sched: &mut dyn Scheduler) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let conn = self
            .connections
            .get_mut(&peer)
            .ok_or(OstError::NoConnection(peer))?;
        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        conn.close(&mut link, sched)?;
        info!(peer, state = %conn.state(), "closed");
        self.prune(peer);
        Ok(())
    }

    /// Queues one payload for `peer`. The connection must be OPEN.
    pub fn write(&mut self, peer: Address, payload: Bytes, sched: &mut dyn Scheduler) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let conn = self
            .connections
            .get_mut(&peer)
            .ok_or(OstError::NoConnection(peer))?;
        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        conn.write(payload, &mut link, sched)
    }

    /// Handles one frame from the link.
    pub fn on_receive(&mut self, frame: Bytes, sched: &mut dyn Scheduler) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        self.stats.segments_received += 1;
        self.stats.bytes_received += frame.len() as u64;
        let segment = match Segment::decode(frame) {
            Ok(segment) => segment,
            Err(err) => {
                self.stats.malformed += 1;
                debug!(%err, "dropping malformed frame");
                return Err(err);
            }
        };
        let peer = segment.header.source;

        if !self.connections.contains_key(&peer) && !self.admit(peer, segment.header, sched)? {
            return Ok(());
        }
        let Some(conn) = self.connections.get_mut(&peer) else {
            return Ok(());
        };

        let mut delivered = 0;
        let deliver = &mut self.deliver;
        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        let result = conn.on_segment(segment, &mut link, sched, &mut |payload| {
            delivered += 1;
            deliver(peer, payload);
        });
        self.stats.delivered += delivered;
        self.prune(peer);
        result
    }

    /// The link can take frames again; drain every connection's queue in
    /// ascending peer order.
    pub fn on_ready_to_transmit(&mut self, sched: &mut dyn Scheduler) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        for conn in self.connections.values_mut() {
            if !link.is_ready() {
                break;
            }
            conn.on_ready_to_transmit(&mut link, sched)?;
        }
        Ok(())
    }

    /// Hands an expired timer back to the connection that armed it.
    pub fn on_timer(
        &mut self,
        event: TimerEvent,
        token: TimerToken,
        sched: &mut dyn Scheduler,
    ) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if event.endpoint != self.address {
            debug!(?event, "timer for another endpoint");
            return Ok(());
        }
        let Some(conn) = self.connections.get_mut(&event.peer) else {
            trace!(?event, "timer for released connection");
            return Ok(());
        };
        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        let retransmitted = conn.on_timer(event.kind, token, &mut link, sched)?;
        if retransmitted {
            self.stats.retransmissions += 1;
        }
        self.prune(event.peer);
        Ok(())
    }

    /// Applies the accept policy to a segment from an unknown peer. Returns
    /// whether a connection now exists for it.
    fn admit(
        &mut self,
        peer: Address,
        header: Header,
        sched: &mut dyn Scheduler,
    ) -> Result<bool> {
        if peer == self.address {
            debug!(peer, %header, "segment claims our own address");
            return Ok(false);
        }
        let plain = !header.is_syn() && !header.is_rst();
        let mode = match self.accept {
            Accept::Connectionless if header.is_data() || (plain && header.is_ack()) => {
                Mode::Connectionless
            }
            Accept::Connection if header.is_syn() && !header.is_ack() => Mode::ConnectionPassive,
            _ => {
                debug!(peer, %header, "segment from unknown peer");
                if !header.is_rst() {
                    let frame = Segment::control(Flags::RST, header.seq, self.address).encode();
                    let mut link = Counted {
                        link: &mut self.link,
                        stats: &mut self.stats,
                    };
                    link.send(frame, peer);
                }
                return Ok(false);
            }
        };

        let mut conn = Connection::new(self.address, peer, mode, &self.config);
        let mut link = Counted {
            link: &mut self.link,
            stats: &mut self.stats,
        };
        conn.open(&mut link, sched)?;
        info!(peer, ?mode, "accepted");
        self.connections.insert(peer, conn);
        Ok(true)
    }

    fn prune(&mut self, peer: Address) {
        if self.connections.get(&peer).is_some_and(Connection::is_closed) {
            self.connections.remove(&peer);
            debug!(peer, "connection released");
        }
    }
}
