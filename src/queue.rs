//! Outbound payload queue.

use std::collections::VecDeque;

use crate::error::{OstError, Result};

/// FIFO of application payloads waiting for transmit-window space.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
    limit: Option<usize>,
}

impl<T> Queue<T> {
    /// Empty queue. `None` means no limit.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
        }
    }

    /// Appends `item`, or fails with [`OstError::Busy`] at the limit.
    pub fn push_back(&mut self, item: T) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.items.len() >= limit {
                return Err(OstError::Busy(limit));
            }
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Oldest item.
    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Items waiting.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
