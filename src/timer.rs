//! Retransmission timer multiplexing.
//!
//! A connection needs one deadline per outstanding segment but owns a single
//! physical countdown timer. [`TimerQueue`] keeps the deadlines as a chain of
//! relative deltas:
//!
//! ```text
//!  tail (armed)                                   head
//!  +---------+    +---------+    +---------+
//!  | seq  d0 | -> | seq  d1 | -> | seq  d2 |
//!  +---------+    +---------+    +---------+
//!
//!  deadline(k) = armed_at + d0 + d1 + ... + dk
//! ```
//!
//! Only the tail entry is bound to the physical timer. When it fires, the next
//! entry's delta is exactly the time still to wait, so re-arming is one call.

use std::{collections::VecDeque, time::Duration};

use tracing::trace;

use crate::{
    constants::MAX_TIMER_DURATION,
    error::{OstError, Result},
    scheduler::{Scheduler, TimerEvent, TimerToken},
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    seq: u8,
    delta: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    token: TimerToken,
    at: Duration,
    duration: Duration,
}

impl Armed {
    fn deadline(&self) -> Duration {
        self.at + self.duration
    }
}

/// Per-segment retransmission deadlines chained onto one physical timer.
#[derive(Debug)]
pub struct TimerQueue {
    entries: VecDeque<Entry>,
    capacity: usize,
    armed: Option<Armed>,
    event: TimerEvent,
}

impl TimerQueue {
    /// `event` is what the physical timer hands back to the scheduler's owner
    /// whenever it expires.
    pub fn new(capacity: usize, event: TimerEvent) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            armed: None,
            event,
        }
    }

    /// Number of pending deadlines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no deadline is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `seq` has a pending deadline.
    pub fn contains(&self, seq: u8) -> bool {
        self.entries.iter().any(|e| e.seq == seq)
    }

    /// Token of the physical timer, if one is running.
    pub fn armed_token(&self) -> Option<TimerToken> {
        self.armed.map(|a| a.token)
    }

    /// Remaining time to every deadline, tail first.
    pub fn deadlines(&self, now: Duration) -> Vec<(u8, Duration)> {
        let mut acc = self.left(now);
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                if i > 0 {
                    acc += e.delta;
                }
                (e.seq, acc)
            })
            .collect()
    }

    /// Schedules a deadline `duration` from now for `seq`.
    pub fn add(&mut self, seq: u8, duration: Duration, sched: &mut dyn Scheduler) -> Result<()> {
        if duration > MAX_TIMER_DURATION {
            return Err(OstError::TimerDurationTooLarge(duration.as_micros()));
        }
        if self.entries.len() >= self.capacity {
            return Err(OstError::TimerQueueFull);
        }

        if self.entries.is_empty() {
            self.arm(duration, sched);
            self.entries.push_back(Entry {
                seq,
                delta: duration,
            });
            trace!(seq, ?duration, "timer armed");
            return Ok(());
        }

        // `acc` walks the absolute remaining time of each queued deadline.
        let mut acc = self.left(sched.now());
        if duration < acc {
            self.disarm(sched);
            if let Some(tail) = self.entries.front_mut() {
                tail.delta = acc - duration;
            }
            self.entries.push_front(Entry {
                seq,
                delta: duration,
            });
            self.arm(duration, sched);
            trace!(seq, ?duration, "timer became new tail");
            return Ok(());
        }

        for i in 1..self.entries.len() {
            let next = acc + self.entries[i].delta;
            if duration < next {
                self.entries[i].delta = next - duration;
                self.entries.insert(
                    i,
                    Entry {
                        seq,
                        delta: duration - acc,
                    },
                );
                trace!(seq, position = i, "timer spliced");
                return Ok(());
            }
            acc = next;
        }

        let delta = duration - acc;
        self.entries.push_back(Entry { seq, delta });
        trace!(seq, ?delta, "timer queued");
        Ok(())
    }

    /// Withdraws the deadline for `seq`, keeping every other deadline intact.
    pub fn cancel(&mut self, seq: u8, sched: &mut dyn Scheduler) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.seq == seq)
            .ok_or(OstError::TimerNotFound(seq))?;

        if pos == 0 {
            let left = self.left(sched.now());
            self.disarm(sched);
            self.entries.pop_front();
            if let Some(tail) = self.entries.front_mut() {
                tail.delta += left;
                let duration = tail.delta;
                self.arm(duration, sched);
            }
        } else if let Some(removed) = self.entries.remove(pos) {
            if let Some(next) = self.entries.get_mut(pos) {
                next.delta += removed.delta;
            }
        }
        trace!(seq, remaining = self.entries.len(), "timer cancelled");
        Ok(())
    }

    /// Handles expiry of the physical timer. Returns the sequence number whose
    /// deadline passed, or `None` when `token` is not the armed timer.
    pub fn on_timeout(&mut self, token: TimerToken, sched: &mut dyn Scheduler) -> Option<u8> {
        let armed = match self.armed {
            Some(armed) if armed.token == token => armed,
            _ => {
                trace!(%token, "stale timer ignored");
                return None;
            }
        };
        self.armed = None;
        let expired = self.entries.pop_front()?;

        if let Some(tail) = self.entries.front() {
            // Fires can be late on a wall clock; absorb the lateness so later
            // deadlines do not drift.
            let late = sched.now().saturating_sub(armed.deadline());
            let duration = tail.delta.saturating_sub(late);
            self.arm(duration, sched);
        }
        trace!(seq = expired.seq, "timer expired");
        Some(expired.seq)
    }

    /// Drops every deadline and releases the physical timer.
    pub fn clear(&mut self, sched: &mut dyn Scheduler) {
        self.disarm(sched);
        self.entries.clear();
    }

    fn left(&self, now: Duration) -> Duration {
        self.armed
            .map(|a| a.deadline().saturating_sub(now))
            .unwrap_or_default()
    }

    fn arm(&mut self, duration: Duration, sched: &mut dyn Scheduler) {
        let token = sched.schedule(duration, self.event);
        self.armed = Some(Armed {
            token,
            at: sched.now(),
            duration,
        });
    }

    fn disarm(&mut self, sched: &mut dyn Scheduler) {
        if let Some(armed) = self.armed.take() {
            sched.cancel(armed.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{EventQueue, TimerKind};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler() -> EventQueue<TimerEvent> {
        EventQueue::new()
    }

    fn queue(capacity: usize) -> TimerQueue {
        TimerQueue::new(
            capacity,
            TimerEvent {
                endpoint: 1,
                peer: 2,
                kind: TimerKind::Retransmit,
            },
        )
    }

    /// Runs the scheduler up to `limit`, feeding expiries back into `q`.
    fn fire_until(
        q: &mut TimerQueue,
        sched: &mut EventQueue<TimerEvent>,
        limit: Duration,
    ) -> Vec<(u8, Duration)> {
        let mut fired = Vec::new();
        while let Some((token, _)) = sched.pop_until(limit) {
            if let Some(seq) = q.on_timeout(token, sched) {
                fired.push((seq, sched.now()));
            }
        }
        sched.advance_to(limit);
        fired
    }

    #[test]
    fn relative_delta_example() {
        let mut sched = scheduler();
        let mut q = queue(4);

        q.add(1, ms(100), &mut sched).unwrap();
        assert_eq!(sched.len(), 1);

        sched.advance_to(ms(20));
        q.add(2, ms(150), &mut sched).unwrap();
        // Physical timer untouched; seq 2 stored as 150 - 80 - 0.
        assert_eq!(sched.len(), 1);
        assert_eq!(q.entries[1].delta, ms(70));

        let fired = fire_until(&mut q, &mut sched, ms(500));
        assert_eq!(fired, vec![(1, ms(100)), (2, ms(170))]);
        assert!(q.is_empty());
        assert!(sched.is_empty());
    }

    #[test]
    fn cancel_tail_folds_remaining_time() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(100), &mut sched).unwrap();
        sched.advance_to(ms(10));
        q.add(2, ms(100), &mut sched).unwrap();
        sched.advance_to(ms(40));

        q.cancel(1, &mut sched).unwrap();
        assert_eq!(q.deadlines(sched.now()), vec![(2, ms(70))]);

        let fired = fire_until(&mut q, &mut sched, ms(500));
        assert_eq!(fired, vec![(2, ms(110))]);
    }

    #[test]
    fn cancel_only_entry_releases_timer() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(9, ms(100), &mut sched).unwrap();
        q.cancel(9, &mut sched).unwrap();
        assert!(q.is_empty());
        assert!(sched.is_empty());
        assert_eq!(q.armed_token(), None);
    }

    #[test]
    fn cancel_middle_preserves_later_deadlines() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(100), &mut sched).unwrap();
        sched.advance_to(ms(10));
        q.add(2, ms(100), &mut sched).unwrap();
        sched.advance_to(ms(20));
        q.add(3, ms(100), &mut sched).unwrap();

        q.cancel(2, &mut sched).unwrap();
        let fired = fire_until(&mut q, &mut sched, ms(500));
        assert_eq!(fired, vec![(1, ms(100)), (3, ms(120))]);
    }

    #[test]
    fn cancel_head_entry() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(100), &mut sched).unwrap();
        sched.advance_to(ms(10));
        q.add(2, ms(100), &mut sched).unwrap();
        q.cancel(2, &mut sched).unwrap();
        assert_eq!(q.len(), 1);
        let fired = fire_until(&mut q, &mut sched, ms(500));
        assert_eq!(fired, vec![(1, ms(100))]);
    }

    #[test]
    fn cancel_unknown_is_error() {
        let mut sched = scheduler();
        let mut q = queue(4);
        assert_eq!(q.cancel(3, &mut sched), Err(OstError::TimerNotFound(3)));
        q.add(1, ms(10), &mut sched).unwrap();
        assert_eq!(q.cancel(3, &mut sched), Err(OstError::TimerNotFound(3)));
    }

    #[test]
    fn full_queue_rejects() {
        let mut sched = scheduler();
        let mut q = queue(2);
        q.add(1, ms(10), &mut sched).unwrap();
        q.add(2, ms(10), &mut sched).unwrap();
        assert_eq!(q.add(3, ms(10), &mut sched), Err(OstError::TimerQueueFull));
    }

    #[test]
    fn oversized_duration_rejects() {
        let mut sched = scheduler();
        let mut q = queue(2);
        let too_long = MAX_TIMER_DURATION + Duration::from_micros(1);
        assert!(matches!(
            q.add(1, too_long, &mut sched),
            Err(OstError::TimerDurationTooLarge(_))
        ));
        assert!(q.add(1, MAX_TIMER_DURATION, &mut sched).is_ok());
    }

    #[test]
    fn shorter_duration_becomes_new_tail() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(100), &mut sched).unwrap();
        q.add(2, ms(30), &mut sched).unwrap();
        q.add(3, ms(60), &mut sched).unwrap();
        let fired = fire_until(&mut q, &mut sched, ms(500));
        assert_eq!(fired, vec![(2, ms(30)), (3, ms(60)), (1, ms(100))]);
    }

    #[test]
    fn stale_token_is_ignored() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(100), &mut sched).unwrap();
        let stale = q.armed_token().unwrap();
        q.cancel(1, &mut sched).unwrap();
        q.add(2, ms(100), &mut sched).unwrap();
        assert_eq!(q.on_timeout(stale, &mut sched), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn late_fire_does_not_drift() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(100), &mut sched).unwrap();
        q.add(2, ms(150), &mut sched).unwrap();
        let token = q.armed_token().unwrap();

        // Deliver the first expiry 30ms late.
        sched.advance_to(ms(130));
        sched.cancel(token);
        assert_eq!(q.on_timeout(token, &mut sched), Some(1));
        assert_eq!(q.deadlines(sched.now()), vec![(2, ms(20))]);
    }

    #[test]
    fn clear_releases_everything() {
        let mut sched = scheduler();
        let mut q = queue(4);
        q.add(1, ms(10), &mut sched).unwrap();
        q.add(2, ms(20), &mut sched).unwrap();
        q.clear(&mut sched);
        assert!(q.is_empty());
        assert!(sched.is_empty());
    }
}
