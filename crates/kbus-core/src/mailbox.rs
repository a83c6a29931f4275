//! Ordered store of undelivered messages for one connection.
//!
//! Entries are kept in arrival order, keyed by a per-mailbox sequence
//! number. A second index ordered by `(priority, sequence)` answers
//! priority-bounded receives: its first element is the most urgent entry,
//! and among equal priorities the earliest arrival. Removing through either
//! path keeps both indexes in step; nothing else in the mailbox moves.

use std::collections::{BTreeMap, BTreeSet};

use crate::message::Message;
use crate::pool::PoolOffset;
use crate::quota::Charge;

/// A message waiting in a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Arrival sequence within this mailbox.
    pub seq: u64,
    /// The message.
    pub message: Message,
    /// Pool slice holding the message bytes.
    pub offset: PoolOffset,
    /// Quota charge to refund on removal.
    pub charge: Charge,
}

/// The queue itself.
#[derive(Debug, Default)]
pub struct Mailbox {
    next_seq: u64,
    entries: BTreeMap<u64, QueuedMessage>,
    by_priority: BTreeSet<(i64, u64)>,
}

impl Mailbox {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message at the tail and returns its sequence number.
    pub fn push(&mut self, message: Message, offset: PoolOffset, charge: Charge) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_priority.insert((message.priority, seq));
        self.entries.insert(
            seq,
            QueuedMessage {
                seq,
                message,
                offset,
                charge,
            },
        );
        seq
    }

    /// Removes and returns the oldest message.
    pub fn pop_fifo(&mut self) -> Option<QueuedMessage> {
        let (_, entry) = self.entries.pop_first()?;
        self.by_priority.remove(&(entry.message.priority, entry.seq));
        Some(entry)
    }

    /// Removes and returns the most urgent message whose priority is at most
    /// `threshold`; the earliest arrival wins among equals.
    pub fn pop_priority(&mut self, threshold: i64) -> Option<QueuedMessage> {
        let &(priority, seq) = self.by_priority.first()?;
        if priority > threshold {
            return None;
        }
        self.by_priority.remove(&(priority, seq));
        self.entries.remove(&seq)
    }

    /// Returns the oldest message without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.entries.first_key_value().map(|(_, entry)| entry)
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over queued messages in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.values()
    }

    /// Removes every message, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.by_priority.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
