//! Virtual-time simulation of endpoints sharing a lossy serial line.
//!
//! Every frame an endpoint hands its [`SimLink`] is either dropped (seeded
//! loss or an explicit [`Network::drop_next`]) or scheduled to arrive at the
//! destination after the channel delay. Arrivals, protocol timers and
//! link-ready notifications are dispatched from one [`EventQueue`] in
//! deadline order, and endpoints drain their peers in address order, so a run
//! is fully reproducible from its seed.
//!
//! ```
//! use std::time::Duration;
//! use bytes::Bytes;
//! use ost::{sim::{ChannelConfig, Network}, Config, Mode};
//!
//! let mut net = Network::new(ChannelConfig::default().with_loss_rate(0.3).with_seed(7));
//! net.add_endpoint(1, Config::default()).unwrap();
//! net.add_endpoint(2, Config::default()).unwrap();
//! net.open(1, 2, Mode::Connectionless).unwrap();
//! net.open(2, 1, Mode::Connectionless).unwrap();
//!
//! net.write(1, 2, Bytes::from_static(b"hello")).unwrap();
//! net.run_for(Duration::from_secs(10)).unwrap();
//! assert_eq!(net.received(2), &[(1, Bytes::from_static(b"hello"))]);
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::mpsc,
    time::Duration,
};

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use crate::{
    config::Config,
    connection::Mode,
    endpoint::Endpoint,
    error::{OstError, Result},
    link::Link,
    scheduler::{EventQueue, TimerEvent},
    Address,
};

/// Everything the network dispatches from its event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// A protocol timer expired.
    Timer(TimerEvent),
    /// A frame reaches its destination.
    Arrival {
        /// Destination address.
        to: Address,
        /// The frame as sent.
        frame: Bytes,
    },
    /// The endpoint's link came back up.
    LinkReady {
        /// Endpoint whose link is up.
        endpoint: Address,
    },
}

impl From<TimerEvent> for SimEvent {
    fn from(event: TimerEvent) -> Self {
        SimEvent::Timer(event)
    }
}

/// Link attachment that parks outgoing frames until the network collects
/// them.
#[derive(Debug)]
pub struct SimLink {
    up: bool,
    outbox: Vec<(Bytes, Address)>,
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLink {
    /// A link that starts up with an empty outbox.
    pub fn new() -> Self {
        Self {
            up: true,
            outbox: Vec::new(),
        }
    }

    /// Whether frames are currently accepted.
    pub fn is_up(&self) -> bool {
        self.up
    }

    /// Takes the link down or brings it back.
    pub fn set_up(&mut self, up: bool) {
        self.up = up;
    }

    fn take(&mut self) -> Vec<(Bytes, Address)> {
        std::mem::take(&mut self.outbox)
    }
}

impl Link for SimLink {
    fn send(&mut self, frame: Bytes, dest: Address) -> bool {
        if !self.up {
            return false;
        }
        self.outbox.push((frame, dest));
        true
    }

    fn is_ready(&self) -> bool {
        self.up
    }
}

/// Properties of the shared channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// One-way propagation delay.
    pub delay: Duration,
    /// Probability in `[0, 1]` that a frame is lost.
    pub loss_rate: f64,
    /// Seed for the loss generator.
    pub seed: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1),
            loss_rate: 0.0,
            seed: 0,
        }
    }
}

impl ChannelConfig {
    /// Sets the one-way delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the loss probability.
    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate;
        self
    }

    /// Sets the loss generator seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug)]
struct Inbox {
    rx: mpsc::Receiver<(Address, Bytes)>,
    items: Vec<(Address, Bytes)>,
}

/// Endpoints joined by one simulated channel, driven in virtual time.
#[derive(Debug)]
pub struct Network {
    queue: EventQueue<SimEvent>,
    endpoints: BTreeMap<Address, Endpoint<SimLink>>,
    inboxes: BTreeMap<Address, Inbox>,
    channel: ChannelConfig,
    rng: ChaCha8Rng,
    drop_next: HashMap<Address, usize>,
    dropped: u64,
}

impl Network {
    /// An empty network over `channel`.
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            queue: EventQueue::new(),
            endpoints: BTreeMap::new(),
            inboxes: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(channel.seed),
            channel,
            drop_next: HashMap::new(),
            dropped: 0,
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    /// Frames lost on the channel so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Attaches an endpoint at `address`. Its deliveries are collected for
    /// [`Network::received`].
    pub fn add_endpoint(&mut self, address: Address, config: Config) -> Result<()> {
        let mut endpoint = Endpoint::new(address, SimLink::new(), config)?;
        let (tx, rx) = mpsc::channel();
        endpoint.on_deliver(move |peer, payload| {
            // The inbox lives as long as the network.
            let _ = tx.send((peer, payload));
        });
        self.endpoints.insert(address, endpoint);
        self.inboxes.insert(
            address,
            Inbox {
                rx,
                items: Vec::new(),
            },
        );
        Ok(())
    }

    /// The endpoint at `address`.
    pub fn endpoint(&self, address: Address) -> Option<&Endpoint<SimLink>> {
        self.endpoints.get(&address)
    }

    /// The endpoint at `address`, mutably.
    pub fn endpoint_mut(&mut self, address: Address) -> Option<&mut Endpoint<SimLink>> {
        self.endpoints.get_mut(&address)
    }

    /// Opens a connection from `at` to `peer`.
    pub fn open(&mut self, at: Address, peer: Address, mode: Mode) -> Result<()> {
        let endpoint = Self::lookup(&mut self.endpoints, at)?;
        let result = endpoint.open(peer, mode, &mut self.queue);
        self.flush(at);
        result
    }

    /// Writes `payload` from `at` to `peer`.
    pub fn write(&mut self, at: Address, peer: Address, payload: Bytes) -> Result<()> {
        let endpoint = Self::lookup(&mut self.endpoints, at)?;
        let result = endpoint.write(peer, payload, &mut self.queue);
        self.flush(at);
        result
    }

    /// Closes the connection from `at` to `peer`.
    pub fn close(&mut self, at: Address, peer: Address) -> Result<()> {
        let endpoint = Self::lookup(&mut self.endpoints, at)?;
        let result = endpoint.close(peer, &mut self.queue);
        self.flush(at);
        result
    }

    /// Takes an endpoint's link down or brings it back. Coming back up
    /// schedules a ready-to-transmit notification.
    pub fn set_link_up(&mut self, at: Address, up: bool) -> Result<()> {
        let endpoint = Self::lookup(&mut self.endpoints, at)?;
        endpoint.link_mut().set_up(up);
        if up {
            self.queue
                .push(Duration::ZERO, SimEvent::LinkReady { endpoint: at });
        }
        Ok(())
    }

    /// Drops the next `count` frames addressed to `dest`.
    pub fn drop_next(&mut self, dest: Address, count: usize) {
        *self.drop_next.entry(dest).or_default() += count;
    }

    /// Changes the loss probability for frames sent from now on.
    pub fn set_loss_rate(&mut self, loss_rate: f64) {
        self.channel.loss_rate = loss_rate;
    }

    /// Everything delivered to the application at `at`, as `(peer, payload)`.
    pub fn received(&mut self, at: Address) -> &[(Address, Bytes)] {
        match self.inboxes.get_mut(&at) {
            Some(inbox) => {
                inbox.items.extend(inbox.rx.try_iter());
                inbox.items.as_slice()
            }
            None => &[],
        }
    }

    /// Runs the network for `duration` of virtual time.
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        self.run_until(self.now() + duration)
    }

    /// Dispatches every event due at or before `limit`, then sets the clock to
    /// `limit`.
    pub fn run_until(&mut self, limit: Duration) -> Result<()> {
        while let Some((token, event)) = self.queue.pop_until(limit) {
            match event {
                SimEvent::Timer(timer) => {
                    if let Some(endpoint) = self.endpoints.get_mut(&timer.endpoint) {
                        endpoint.on_timer(timer, token, &mut self.queue)?;
                    }
                    self.flush(timer.endpoint);
                }
                SimEvent::Arrival { to, frame } => {
                    let Some(endpoint) = self.endpoints.get_mut(&to) else {
                        trace!(to, "frame for absent endpoint");
                        continue;
                    };
                    if let Err(err) = endpoint.on_receive(frame, &mut self.queue) {
                        debug!(to, %err, "receive failed");
                    }
                    self.flush(to);
                }
                SimEvent::LinkReady { endpoint: at } => {
                    if let Some(endpoint) = self.endpoints.get_mut(&at) {
                        endpoint.on_ready_to_transmit(&mut self.queue)?;
                    }
                    self.flush(at);
                }
            }
        }
        self.queue.advance_to(limit);
        Ok(())
    }

    fn lookup(
        endpoints: &mut BTreeMap<Address, Endpoint<SimLink>>,
        at: Address,
    ) -> Result<&mut Endpoint<SimLink>> {
        endpoints.get_mut(&at).ok_or(OstError::UnknownEndpoint(at))
    }

    /// Moves frames from an endpoint's link onto the channel.
    fn flush(&mut self, at: Address) {
        let Some(endpoint) = self.endpoints.get_mut(&at) else {
            return;
        };
        for (frame, dest) in endpoint.link_mut().take() {
            if self.should_drop(dest) {
                self.dropped += 1;
                trace!(from = at, to = dest, "frame lost");
                continue;
            }
            self.queue
                .push(self.channel.delay, SimEvent::Arrival { to: dest, frame });
        }
    }

    fn should_drop(&mut self, dest: Address) -> bool {
        if let Some(count) = self.drop_next.get_mut(&dest) {
            if *count > 0 {
                *count -= 1;
                return true;
            }
        }
        let p = self.channel.loss_rate;
        if p <= 0.0 {
            false
        } else if p >= 1.0 {
            true
        } else {
            self.rng.gen::<f64>() < p
        }
    }
}
