//! Discrete-event scheduling.
//!
//! The protocol engine never blocks. Every wait is a [`TimerEvent`] handed to a
//! [`Scheduler`], which later gives the event back together with the
//! [`TimerToken`] it was issued under. The engine compares tokens, so an event
//! that fires after its timer was cancelled or re-armed is recognised as stale.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use crate::Address;

/// Opaque handle for one scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Purpose of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The connection's single physical retransmission timer.
    Retransmit,
    /// Lingering in CLOSE_WAIT.
    CloseWait,
    /// SYN or SYN+ACK resend.
    Handshake,
    /// Deferred drain of the outbound queue, scheduled for "now".
    Drain,
}

/// Handed back by the scheduler when a timer expires. Connections are named
/// by peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerEvent {
    /// Endpoint that armed the timer.
    pub endpoint: Address,
    /// Peer of the owning connection.
    pub peer: Address,
    /// What the timer is for.
    pub kind: TimerKind,
}

/// Source of timers for the protocol engine.
pub trait Scheduler {
    /// Time elapsed since the scheduler's epoch.
    fn now(&self) -> Duration;

    /// Arranges for `event` to be handed back once `delay` has elapsed.
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerToken;

    /// Withdraws a scheduled event. Unknown or already fired tokens are ignored.
    fn cancel(&mut self, token: TimerToken);
}

/// Events ordered by deadline, ties broken by scheduling order.
///
/// The clock only moves when the owner calls [`EventQueue::advance_to`] or pops
/// with [`EventQueue::pop_until`], so the same queue serves virtual-time
/// simulation and a wall-clock driver.
#[derive(Debug)]
pub struct EventQueue<E> {
    now: Duration,
    next_token: u64,
    events: BTreeMap<(Duration, TimerToken), E>,
    deadlines: HashMap<TimerToken, Duration>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    /// Empty queue with the clock at zero.
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_token: 0,
            events: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Moves the clock forward. The clock never runs backwards.
    pub fn advance_to(&mut self, t: Duration) {
        if t > self.now {
            self.now = t;
        }
    }

    /// Schedules `event` at `now + delay`.
    pub fn push(&mut self, delay: Duration, event: E) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        let deadline = self.now + delay;
        self.events.insert((deadline, token), event);
        self.deadlines.insert(token, deadline);
        token
    }

    /// Unschedules `token`, returning its event if it had not fired.
    pub fn remove(&mut self, token: TimerToken) -> Option<E> {
        let deadline = self.deadlines.remove(&token)?;
        self.events.remove(&(deadline, token))
    }

    /// Deadline of the earliest pending event.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.events.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pops the earliest event whose deadline has already passed.
    pub fn pop_due(&mut self) -> Option<(TimerToken, E)> {
        self.pop_until(self.now)
    }

    /// Pops the earliest event due at or before `limit`, advancing the clock to
    /// its deadline.
    pub fn pop_until(&mut self, limit: Duration) -> Option<(TimerToken, E)> {
        let &(deadline, token) = self.events.keys().next()?;
        if deadline > limit {
            return None;
        }
        let event = self.events.remove(&(deadline, token))?;
        self.deadlines.remove(&token);
        self.advance_to(deadline);
        Some((token, event))
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<E: From<TimerEvent>> Scheduler for EventQueue<E> {
    fn now(&self) -> Duration {
        self.now
    }

    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerToken {
        self.push(delay, E::from(event))
    }

    fn cancel(&mut self, token: TimerToken) {
        self.remove(token);
    }
}
