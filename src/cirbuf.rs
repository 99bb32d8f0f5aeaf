//! Sequence-indexed ring storage for the transmit and receive windows.

use crate::constants::MAX_WINDOW;

/// Fixed ring of slots addressed directly by sequence number.
///
/// The ring is sized to the next power of two at or above the window, so
/// `seq & mask` stays consistent across the 256 wrap and any `window`
/// consecutive sequence numbers land in distinct slots. Every slot also carries
/// a mark bit (acknowledged on the transmit side, received on the receive side).
#[derive(Clone, Debug)]
pub struct CircularBuffer<T> {
    values: Vec<Option<T>>,
    marks: Vec<bool>,
    mask: u8,
}

impl<T> CircularBuffer<T> {
    /// Creates an empty ring able to hold any `window` consecutive sequence
    /// numbers.
    pub fn new(window: u8) -> Self {
        debug_assert!((1..=MAX_WINDOW).contains(&window));
        let size = (window as usize).next_power_of_two();
        Self {
            values: (0..size).map(|_| None).collect(),
            marks: vec![false; size],
            mask: (size - 1) as u8,
        }
    }

    fn index(&self, seq: u8) -> usize {
        (seq & self.mask) as usize
    }

    /// Stores `val` at `seq` and clears the slot's mark.
    pub fn set(&mut self, seq: u8, val: T) {
        let idx = self.index(seq);
        self.values[idx] = Some(val);
        self.marks[idx] = false;
    }

    /// Value stored at `seq`, if any.
    pub fn get(&self, seq: u8) -> Option<&T> {
        self.values[self.index(seq)].as_ref()
    }

    /// Empties the slot and clears its mark.
    pub fn remove(&mut self, seq: u8) -> Option<T> {
        let idx = self.index(seq);
        self.marks[idx] = false;
        self.values[idx].take()
    }

    /// Sets the mark bit of the slot for `seq`.
    pub fn mark(&mut self, seq: u8) {
        let idx = self.index(seq);
        self.marks[idx] = true;
    }

    /// Whether the slot for `seq` is marked.
    pub fn is_marked(&self, seq: u8) -> bool {
        self.marks[self.index(seq)]
    }

    /// Empties every slot.
    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = None);
        self.marks.iter_mut().for_each(|m| *m = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_to_power_of_two() {
        let buf: CircularBuffer<u8> = CircularBuffer::new(10);
        assert_eq!(buf.values.len(), 16);
        assert_eq!(buf.mask, 15);
    }

    #[test]
    fn consecutive_sequences_across_wrap_do_not_collide() {
        let mut buf = CircularBuffer::new(10);
        let seqs: Vec<u8> = (0..10u8).map(|i| 250u8.wrapping_add(i)).collect();
        for &s in &seqs {
            buf.set(s, s);
        }
        for &s in &seqs {
            assert_eq!(buf.get(s), Some(&s));
        }
    }

    #[test]
    fn set_clears_mark_and_remove_empties() {
        let mut buf = CircularBuffer::new(4);
        buf.set(3, "a");
        buf.mark(3);
        assert!(buf.is_marked(3));
        buf.set(3, "b");
        assert!(!buf.is_marked(3));

        buf.mark(3);
        assert_eq!(buf.remove(3), Some("b"));
        assert!(!buf.is_marked(3));
        assert_eq!(buf.get(3), None);
    }
}
