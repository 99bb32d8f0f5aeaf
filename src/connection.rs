//! Per-peer connection state.
//!
//! A [`Connection`] wraps one [`SlidingWindow`] with the handshake and teardown
//! machine. In [`Mode::Connectionless`] the machine is bypassed: `open` goes
//! straight to OPEN and only ACK and DATA segments mean anything.

use std::{fmt, time::Duration};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    config::Config,
    error::{OstError, Result},
    header::{Flags, Segment},
    link::Link,
    scheduler::{Scheduler, TimerEvent, TimerKind, TimerToken},
    window::SlidingWindow,
    Address,
};

/// How a connection is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// No handshake: OPEN as soon as it is opened.
    Connectionless,
    /// Sends the SYN.
    ConnectionActive,
    /// Waits in LISTEN for the peer's SYN.
    ConnectionPassive,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No resources held.
    Closed,
    /// Passive open waiting for a SYN.
    Listen,
    /// SYN sent, waiting for SYN+ACK.
    SynSent,
    /// SYN answered, waiting for the final ACK.
    SynRcvd,
    /// Data may flow in both directions.
    Open,
    /// Torn down, lingering before release.
    CloseWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN-SENT",
            State::SynRcvd => "SYN-RCVD",
            State::Open => "OPEN",
            State::CloseWait => "CLOSE-WAIT",
        };
        f.write_str(name)
    }
}

/// One peer's state machine and sliding window.
#[derive(Debug)]
pub struct Connection {
    local: Address,
    peer: Address,
    mode: Mode,
    state: State,
    window: SlidingWindow,

    // Sequence number both windows were anchored at by the handshake.
    anchor: u8,
    initial_sequence: u8,

    close_wait: Option<TimerToken>,
    handshake: Option<TimerToken>,
    drain: Option<TimerToken>,

    handshake_attempts: u32,
    handshake_retries: u32,
    retransmission_interval: Duration,
    close_wait_interval: Duration,
}

impl Connection {
    /// Creates a CLOSED connection from `local` to `peer`.
    pub fn new(local: Address, peer: Address, mode: Mode, config: &Config) -> Self {
        Self {
            local,
            peer,
            mode,
            state: State::Closed,
            window: SlidingWindow::new(local, peer, config),
            anchor: 0,
            initial_sequence: config.initial_sequence,
            close_wait: None,
            handshake: None,
            drain: None,
            handshake_attempts: 0,
            handshake_retries: config.handshake_retries,
            retransmission_interval: config.retransmission_interval,
            close_wait_interval: config.close_wait_interval,
        }
    }

    /// Address of the remote station.
    pub fn peer(&self) -> Address {
        self.peer
    }

    /// Mode the connection was opened in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The connection's sliding window, for inspection.
    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// Whether the connection has released everything.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Starts the connection according to its mode. Only valid in CLOSED.
    ///
    /// An active open anchors both windows at the configured initial sequence
    /// number and sends the SYN.
    pub fn open(&mut self, link: &mut dyn Link, sched: &mut dyn Scheduler) -> Result<()> {
        if self.state != State::Closed {
            return Err(OstError::WrongState(self.state));
        }
        match self.mode {
            Mode::Connectionless => self.transition(State::Open),
            Mode::ConnectionActive => {
                let isn = self.initial_sequence;
                self.anchor_at(isn, sched);
                self.send_control(Flags::SYN, isn, link);
                self.handshake_attempts = 0;
                self.arm_handshake(sched);
                self.transition(State::SynSent);
            }
            Mode::ConnectionPassive => self.transition(State::Listen),
        }
        Ok(())
    }

    /// Tears the connection down. Connection-oriented peers are sent a RST and
    /// the connection lingers in CLOSE_WAIT.
    pub fn close(&mut self, link: &mut dyn Link, sched: &mut dyn Scheduler) -> Result<()> {
        match self.state {
            State::Closed | State::CloseWait => return Ok(()),
            _ => {}
        }
        if self.mode == Mode::Connectionless {
            self.deallocate(sched);
            return Ok(());
        }
        let (bottom, _) = self.window.tx_window();
        self.send_control(Flags::RST, bottom, link);
        self.enter_close_wait(sched);
        Ok(())
    }

    /// Queues `payload` and schedules a drain of the outbound queue for the
    /// next scheduler tick.
    pub fn write(
        &mut self,
        payload: Bytes,
        link: &mut dyn Link,
        sched: &mut dyn Scheduler,
    ) -> Result<()> {
        if self.state != State::Open {
            return Err(OstError::WrongState(self.state));
        }
        self.window.enqueue_for_send(payload)?;
        if self.drain.is_none() && link.is_ready() && self.window.queued() > 0 {
            self.drain = Some(sched.schedule(Duration::ZERO, self.event(TimerKind::Drain)));
        }
        Ok(())
    }

    /// The link can take frames again.
    pub fn on_ready_to_transmit(
        &mut self,
        link: &mut dyn Link,
        sched: &mut dyn Scheduler,
    ) -> Result<usize> {
        self.drain_window(link, sched)
    }

    /// Runs one inbound segment through the state table. In-order payloads go
    /// to `deliver`.
    pub fn on_segment(
        &mut self,
        segment: Segment,
        link: &mut dyn Link,
        sched: &mut dyn Scheduler,
        deliver: &mut dyn FnMut(Bytes),
    ) -> Result<()> {
        let header = segment.header;
        let seq = header.seq;
        trace!(peer = self.peer, state = %self.state, %header, "segment");

        match self.state {
            State::Closed => {
                if !header.is_rst() {
                    self.send_control(Flags::RST, seq, link);
                }
            }

            State::Listen => {
                if header.is_rst() {
                    self.ignore(header.flags);
                } else if header.is_syn() && !header.is_ack() {
                    self.anchor_at(seq, sched);
                    self.send_control(Flags::SYN_ACK, seq, link);
                    self.handshake_attempts = 0;
                    self.arm_handshake(sched);
                    self.transition(State::SynRcvd);
                } else {
                    self.send_control(Flags::RST, seq, link);
                }
            }

            State::SynSent => {
                if header.is_rst() {
                    self.deallocate(sched);
                } else if header.is_syn() && header.is_ack() {
                    self.anchor_at(seq, sched);
                    self.send_control(Flags::ACK, seq, link);
                    self.establish(link, sched)?;
                } else if header.is_syn() {
                    // Simultaneous open.
                    self.anchor_at(seq, sched);
                    self.send_control(Flags::SYN_ACK, seq, link);
                    self.handshake_attempts = 0;
                    self.arm_handshake(sched);
                    self.transition(State::SynRcvd);
                } else if header.is_ack() && seq != self.anchor {
                    self.reject(seq, link, sched);
                } else {
                    self.ignore(header.flags);
                }
            }

            State::SynRcvd => {
                let (bottom, _) = self.window.tx_window();
                if header.is_rst() {
                    match self.mode {
                        Mode::ConnectionPassive => {
                            self.cancel_timers(sched);
                            self.window.release(sched);
                            self.transition(State::Listen);
                        }
                        _ => self.deallocate(sched),
                    }
                } else if header.is_ack() && seq == bottom {
                    if header.is_syn() {
                        // Both sides sent SYN+ACK after a simultaneous open.
                        self.send_control(Flags::ACK, seq, link);
                    }
                    self.establish(link, sched)?;
                } else if header.is_syn() && !header.is_ack() && seq == self.anchor {
                    // Our SYN+ACK was lost and the SYN resent.
                    self.send_control(Flags::SYN_ACK, seq, link);
                } else {
                    self.reject(seq, link, sched);
                }
            }

            State::Open if self.mode == Mode::Connectionless => {
                if header.is_rst() || header.is_syn() {
                    self.ignore(header.flags);
                } else if header.is_ack() {
                    self.window.on_ack(seq, sched);
                    self.drain_window(link, sched)?;
                } else if header.is_data() {
                    self.window.on_data(seq, segment.payload, link, deliver);
                } else {
                    self.ignore(header.flags);
                }
            }

            State::Open => {
                if header.is_rst() {
                    self.enter_close_wait(sched);
                } else if header.is_syn() {
                    if header.is_ack() && seq == self.anchor && self.handshake_pristine() {
                        // Our ACK of the peer's SYN+ACK was lost.
                        self.send_control(Flags::ACK, seq, link);
                    } else {
                        self.reject(seq, link, sched);
                    }
                } else if header.is_ack() {
                    self.window.on_ack(seq, sched);
                    self.drain_window(link, sched)?;
                } else if header.is_data() {
                    self.window.on_data(seq, segment.payload, link, deliver);
                } else {
                    self.ignore(header.flags);
                }
            }

            State::CloseWait => {
                if header.is_rst() {
                    self.deallocate(sched);
                } else {
                    self.ignore(header.flags);
                }
            }
        }
        Ok(())
    }

    /// Dispatches one of this connection's timers. Returns `true` when
    /// something was retransmitted.
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        token: TimerToken,
        link: &mut dyn Link,
        sched: &mut dyn Scheduler,
    ) -> Result<bool> {
        match kind {
            TimerKind::Retransmit => Ok(self.window.on_timeout(token, link, sched)?.is_some()),

            TimerKind::Drain => {
                if self.drain != Some(token) {
                    return Ok(false);
                }
                self.drain = None;
                self.drain_window(link, sched)?;
                Ok(false)
            }

            TimerKind::CloseWait => {
                if self.close_wait == Some(token) && self.state == State::CloseWait {
                    self.close_wait = None;
                    self.deallocate(sched);
                }
                Ok(false)
            }

            TimerKind::Handshake => {
                if self.handshake != Some(token) {
                    return Ok(false);
                }
                self.handshake = None;
                let flags = match self.state {
                    State::SynSent => Flags::SYN,
                    State::SynRcvd => Flags::SYN_ACK,
                    _ => return Ok(false),
                };
                if self.handshake_attempts >= self.handshake_retries {
                    debug!(peer = self.peer, attempts = self.handshake_attempts, "handshake abandoned");
                    self.send_control(Flags::RST, self.anchor, link);
                    self.deallocate(sched);
                    return Ok(false);
                }
                self.handshake_attempts += 1;
                debug!(peer = self.peer, %flags, attempt = self.handshake_attempts, "resending handshake");
                self.send_control(flags, self.anchor, link);
                self.arm_handshake(sched);
                Ok(true)
            }
        }
    }

    /// Releases buffers and timers and moves to CLOSED.
    pub fn deallocate(&mut self, sched: &mut dyn Scheduler) {
        self.cancel_timers(sched);
        self.window.release(sched);
        self.transition(State::Closed);
    }

    fn establish(&mut self, link: &mut dyn Link, sched: &mut dyn Scheduler) -> Result<()> {
        self.cancel(TimerKind::Handshake, sched);
        self.transition(State::Open);
        self.drain_window(link, sched)?;
        Ok(())
    }

    fn drain_window(&mut self, link: &mut dyn Link, sched: &mut dyn Scheduler) -> Result<usize> {
        if self.state != State::Open {
            return Ok(0);
        }
        self.window.drain(link, sched)
    }

    /// Sends RST for the offending segment and lingers in CLOSE_WAIT.
    fn reject(&mut self, seq: u8, link: &mut dyn Link, sched: &mut dyn Scheduler) {
        self.send_control(Flags::RST, seq, link);
        self.enter_close_wait(sched);
    }

    fn enter_close_wait(&mut self, sched: &mut dyn Scheduler) {
        self.cancel_timers(sched);
        self.window.release(sched);
        let event = self.event(TimerKind::CloseWait);
        self.close_wait = Some(sched.schedule(self.close_wait_interval, event));
        self.transition(State::CloseWait);
    }

    fn anchor_at(&mut self, seq: u8, sched: &mut dyn Scheduler) {
        self.anchor = seq;
        self.window.reset(seq, sched);
    }

    /// No segment has been acknowledged or received since the handshake.
    fn handshake_pristine(&self) -> bool {
        let (tx_bottom, _) = self.window.tx_window();
        let (rx_bottom, _) = self.window.rx_window();
        tx_bottom == self.anchor && rx_bottom == self.anchor
    }

    fn arm_handshake(&mut self, sched: &mut dyn Scheduler) {
        self.cancel(TimerKind::Handshake, sched);
        let event = self.event(TimerKind::Handshake);
        self.handshake = Some(sched.schedule(self.retransmission_interval, event));
    }

    fn cancel(&mut self, kind: TimerKind, sched: &mut dyn Scheduler) {
        let slot = match kind {
            TimerKind::Handshake => &mut self.handshake,
            TimerKind::CloseWait => &mut self.close_wait,
            TimerKind::Drain => &mut self.drain,
            TimerKind::Retransmit => return,
        };
        if let Some(token) = slot.take() {
            sched.cancel(token);
        }
    }

    fn cancel_timers(&mut self, sched: &mut dyn Scheduler) {
        self.cancel(TimerKind::Handshake, sched);
        self.cancel(TimerKind::CloseWait, sched);
        self.cancel(TimerKind::Drain, sched);
    }

    fn send_control(&self, flags: Flags, seq: u8, link: &mut dyn Link) -> bool {
        self.window.send_control(flags, seq, link)
    }

    fn event(&self, kind: TimerKind) -> TimerEvent {
        TimerEvent {
            endpoint: self.local,
            peer: self.peer,
            kind,
        }
    }

    fn ignore(&self, flags: Flags) {
        debug!(peer = self.peer, state = %self.state, %flags, "segment ignored");
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            debug!(peer = self.peer, from = %self.state, to = %next, "state change");
            self.state = next;
        }
    }
}
