//! Sliding-window ARQ.
//!
//! Acknowledgments are tracked per segment but `tx_bottom` only moves across a
//! contiguous run of acknowledged segments. The receiver buffers anything that
//! falls inside its window and hands the application a contiguous run starting
//! at `rx_bottom`.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    cirbuf::CircularBuffer,
    config::Config,
    error::{OstError, Result},
    header::{Flags, Segment},
    link::Link,
    queue::Queue,
    scheduler::{Scheduler, TimerEvent, TimerKind, TimerToken},
    timer::TimerQueue,
    Address,
};

/// Whether `seq` lies in `[bottom, top)` on the modulo-256 circle.
pub fn in_window(seq: u8, bottom: u8, top: u8) -> bool {
    (top >= bottom && bottom <= seq && seq < top)
        || (bottom > top && (seq >= bottom || seq < top))
}

/// Transmit and receive windows for one connection, with the outbound
/// queue and retransmission timers that feed them.
#[derive(Debug)]
pub struct SlidingWindow {
    local: Address,
    peer: Address,
    window: u8,

    tx_bottom: u8,
    tx_top: u8,
    rx_bottom: u8,

    // Transmit slots are marked once acknowledged, receive slots once filled.
    tx_buffer: CircularBuffer<Bytes>,
    rx_buffer: CircularBuffer<Bytes>,
    outbound: Queue<Bytes>,

    timers: TimerQueue,
    retransmission_interval: Duration,
    max_segment_size: usize,
}

impl SlidingWindow {
    /// Empty windows anchored at sequence 0.
    pub fn new(local: Address, peer: Address, config: &Config) -> Self {
        let event = TimerEvent {
            endpoint: local,
            peer,
            kind: TimerKind::Retransmit,
        };
        Self {
            local,
            peer,
            window: config.window,
            tx_bottom: 0,
            tx_top: 0,
            rx_bottom: 0,
            tx_buffer: CircularBuffer::new(config.window),
            rx_buffer: CircularBuffer::new(config.window),
            outbound: Queue::new(config.send_queue_limit),
            timers: TimerQueue::new(config.window as usize, event),
            retransmission_interval: config.retransmission_interval,
            max_segment_size: config.max_segment_size,
        }
    }

    /// `(tx_bottom, tx_top)`.
    pub fn tx_window(&self) -> (u8, u8) {
        (self.tx_bottom, self.tx_top)
    }

    /// `(rx_bottom, rx_top)`. The receive window always spans exactly `W`.
    pub fn rx_window(&self) -> (u8, u8) {
        (self.rx_bottom, self.rx_bottom.wrapping_add(self.window))
    }

    /// Segments sent and not yet cumulatively acknowledged.
    pub fn in_flight(&self) -> u8 {
        self.tx_top.wrapping_sub(self.tx_bottom)
    }

    /// Whether another segment fits in the transmit window.
    pub fn has_space(&self) -> bool {
        self.in_flight() < self.window
    }

    /// Payloads waiting for window space.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Nothing in flight and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0 && self.outbound.is_empty()
    }

    /// Segments with a running retransmission deadline.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Token of the running retransmission timer, if any.
    pub fn retransmit_token(&self) -> Option<TimerToken> {
        self.timers.armed_token()
    }

    /// Appends `payload` to the outbound queue. Empty payloads are dropped.
    pub fn enqueue_for_send(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() > self.max_segment_size {
            return Err(OstError::OversizedSegment {
                size: payload.len(),
                max: self.max_segment_size,
            });
        }
        if payload.is_empty() {
            trace!(peer = self.peer, "empty write ignored");
            return Ok(());
        }
        self.outbound.push_back(payload)
    }

    /// Stores `payload` at `tx_top` and returns the sequence number it was
    /// given.
    pub fn admit_to_tx_window(&mut self, payload: Bytes) -> Result<u8> {
        if !self.has_space() {
            return Err(OstError::WindowFull);
        }
        let seq = self.tx_top;
        self.tx_buffer.set(seq, payload);
        self.tx_top = self.tx_top.wrapping_add(1);
        Ok(seq)
    }

    /// Transmits the buffered segment at `seq` and (re)arms its retransmission
    /// timer. The timer is armed even when the link drops the frame.
    pub fn send(
        &mut self,
        seq: u8,
        link: &mut dyn Link,
        sched: &mut dyn Scheduler,
    ) -> Result<bool> {
        let payload = match self.tx_buffer.get(seq) {
            Some(payload) => payload.clone(),
            None => {
                debug!(seq, "nothing buffered to send");
                return Ok(false);
            }
        };
        let frame = Segment::new(Flags::DATA, seq, self.local, payload).encode();
        let sent = link.send(frame, self.peer);
        if !sent {
            warn!(seq, peer = self.peer, "link dropped segment");
        } else {
            trace!(seq, peer = self.peer, "sent DATA");
        }

        if self.timers.contains(seq) {
            self.timers.cancel(seq, sched)?;
        }
        self.timers.add(seq, self.retransmission_interval, sched)?;
        Ok(sent)
    }

    /// Acknowledges the peer's segment `seq`.
    pub fn send_ack(&self, seq: u8, link: &mut dyn Link) -> bool {
        self.send_control(Flags::ACK, seq, link)
    }

    /// Sends a payload-free segment. Control segments are never timed.
    pub fn send_control(&self, flags: Flags, seq: u8, link: &mut dyn Link) -> bool {
        let frame = Segment::control(flags, seq, self.local).encode();
        let sent = link.send(frame, self.peer);
        if !sent {
            warn!(%flags, seq, peer = self.peer, "link dropped control segment");
        } else {
            trace!(%flags, seq, peer = self.peer, "sent control");
        }
        sent
    }

    /// Records an acknowledgment. Returns `false` for acks outside the window
    /// and for repeats.
    pub fn on_ack(&mut self, seq: u8, sched: &mut dyn Scheduler) -> bool {
        if !in_window(seq, self.tx_bottom, self.tx_top) {
            trace!(seq, bottom = self.tx_bottom, top = self.tx_top, "ack outside window");
            return false;
        }
        if self.tx_buffer.is_marked(seq) {
            trace!(seq, "duplicate ack");
            return false;
        }

        self.tx_buffer.mark(seq);
        if let Err(err) = self.timers.cancel(seq, sched) {
            debug!(seq, %err, "acked segment had no timer");
        }

        while self.tx_bottom != self.tx_top && self.tx_buffer.is_marked(self.tx_bottom) {
            self.tx_buffer.remove(self.tx_bottom);
            self.tx_bottom = self.tx_bottom.wrapping_add(1);
        }
        trace!(seq, bottom = self.tx_bottom, top = self.tx_top, "ack");
        true
    }

    /// Acknowledges `seq` unconditionally, buffers the payload if it is new and
    /// inside the receive window, then delivers the contiguous prefix. Returns
    /// the number of payloads delivered.
    pub fn on_data(
        &mut self,
        seq: u8,
        payload: Bytes,
        link: &mut dyn Link,
        deliver: &mut dyn FnMut(Bytes),
    ) -> usize {
        self.send_ack(seq, link);

        let (bottom, top) = self.rx_window();
        if !in_window(seq, bottom, top) {
            trace!(seq, bottom, top, "data outside window");
            return 0;
        }
        if self.rx_buffer.is_marked(seq) {
            trace!(seq, "duplicate data");
            return 0;
        }
        self.rx_buffer.set(seq, payload);
        self.rx_buffer.mark(seq);

        let mut delivered = 0;
        while self.rx_buffer.is_marked(self.rx_bottom) {
            if let Some(payload) = self.rx_buffer.remove(self.rx_bottom) {
                deliver(payload);
                delivered += 1;
            }
            self.rx_bottom = self.rx_bottom.wrapping_add(1);
        }
        if delivered > 0 {
            trace!(delivered, bottom = self.rx_bottom, "delivered");
        }
        delivered
    }

    /// Handles expiry of the retransmission timer and resends the segment
    /// whose deadline passed, if it is still outstanding.
    pub fn on_timeout(
        &mut self,
        token: TimerToken,
        link: &mut dyn Link,
        sched: &mut dyn Scheduler,
    ) -> Result<Option<u8>> {
        let seq = match self.timers.on_timeout(token, sched) {
            Some(seq) => seq,
            None => return Ok(None),
        };
        if !in_window(seq, self.tx_bottom, self.tx_top) || self.tx_buffer.is_marked(seq) {
            trace!(seq, "timeout for settled segment");
            return Ok(None);
        }
        debug!(seq, peer = self.peer, "retransmitting");
        self.send(seq, link, sched)?;
        Ok(Some(seq))
    }

    /// Moves queued payloads into the transmit window and sends them while the
    /// link is ready and the window has room.
    pub fn drain(&mut self, link: &mut dyn Link, sched: &mut dyn Scheduler) -> Result<usize> {
        let mut sent = 0;
        while link.is_ready() && self.has_space() {
            let Some(payload) = self.outbound.pop_front() else {
                break;
            };
            let seq = self.admit_to_tx_window(payload)?;
            self.send(seq, link, sched)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Empties both windows and re-anchors them at `anchor`. Queued payloads
    /// survive.
    pub fn reset(&mut self, anchor: u8, sched: &mut dyn Scheduler) {
        self.timers.clear(sched);
        self.tx_buffer.clear();
        self.rx_buffer.clear();
        self.tx_bottom = anchor;
        self.tx_top = anchor;
        self.rx_bottom = anchor;
    }

    /// Frees every buffer, timer and queued payload.
    pub fn release(&mut self, sched: &mut dyn Scheduler) {
        let anchor = self.tx_bottom;
        self.reset(anchor, sched);
        self.outbound.clear();
    }
}
