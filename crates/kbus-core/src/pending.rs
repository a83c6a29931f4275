//! Pending-reply tracking.
//!
//! Two halves cooperate:
//!
//! - [`PendingCounter`] lives on the *requesting* connection and bounds how
//!   many reply-expected requests it may have outstanding. It is a lock-free
//!   counter so a sender can reserve without taking any connection lock.
//! - [`ReplySlots`] lives on the *replying* connection, guarded by that
//!   connection's lock. It records every genuine request the connection
//!   received, keyed by `(requester, cookie)`.
//!
//! A slot is the token that owns one unit of its requester's counter.
//! Whoever removes the slot (a reply, the timeout sweep, teardown of the
//! replier) releases that unit; since removal happens under the replier's
//! lock, a reply racing a timeout releases exactly once. Slots of a
//! requester that is torn down are discarded with no release.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::message::ConnectionId;

/// Upper bound on a reply deadline when the requested timeout does not fit
/// in an `Instant`.
const MAX_REPLY_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Outstanding reply-expected requests of one sending connection.
#[derive(Debug)]
pub struct PendingCounter {
    count: AtomicUsize,
    max: usize,
}

impl PendingCounter {
    /// Creates a counter allowing `max` outstanding requests.
    #[must_use]
    pub const fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserves one outstanding request.
    ///
    /// # Errors
    ///
    /// Returns the current count if the cap is reached.
    pub fn try_reserve(&self) -> Result<(), usize> {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current >= self.max {
                return Err(current);
            }
            if self
                .count
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Releases one outstanding request.
    ///
    /// Releasing with nothing outstanding leaves the count at zero and logs
    /// a warning, since every release must pair with a reservation.
    pub fn release(&self) {
        let released = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            warn!(max = self.max, "pending request released with none outstanding");
        }
    }

    /// Returns the number of outstanding requests.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns the cap.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }
}

/// Key of a reply slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyKey {
    /// Connection that sent the request.
    pub requester: ConnectionId,
    /// Cookie of the request.
    pub cookie: u64,
}

/// A request received by a connection and still awaiting its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplySlot {
    /// When the requester stops waiting.
    pub deadline: Instant,
}

/// Requests a connection has received and may answer.
///
/// Cookies need not be unique, so one key can hold several open requests.
/// They are answered oldest first.
#[derive(Debug, Default)]
pub struct ReplySlots {
    slots: HashMap<ReplyKey, VecDeque<ReplySlot>>,
    len: usize,
}

impl ReplySlots {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request from `requester` with `cookie`, due at
    /// `now + timeout`.
    pub fn open(&mut self, requester: ConnectionId, cookie: u64, now: Instant, timeout: Duration) {
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(MAX_REPLY_WAIT))
            .unwrap_or(now);
        self.slots
            .entry(ReplyKey { requester, cookie })
            .or_default()
            .push_back(ReplySlot { deadline });
        self.len += 1;
    }

    /// Returns `true` if a request with this key is open.
    #[must_use]
    pub fn contains(&self, requester: ConnectionId, cookie: u64) -> bool {
        self.slots.contains_key(&ReplyKey { requester, cookie })
    }

    /// Claims the oldest slot with this key for a reply. The caller now
    /// owns the requester's pending unit.
    pub fn claim(&mut self, requester: ConnectionId, cookie: u64) -> Option<ReplySlot> {
        let key = ReplyKey { requester, cookie };
        let queue = self.slots.get_mut(&key)?;
        let slot = queue.pop_front();
        if queue.is_empty() {
            self.slots.remove(&key);
        }
        if slot.is_some() {
            self.len -= 1;
        }
        slot
    }

    /// Puts back a slot claimed by a reply that could not be delivered. It
    /// is again the first to be claimed.
    pub fn restore(&mut self, requester: ConnectionId, cookie: u64, slot: ReplySlot) {
        self.slots
            .entry(ReplyKey { requester, cookie })
            .or_default()
            .push_front(slot);
        self.len += 1;
    }

    /// Removes every slot whose deadline is at or before `now`, returning
    /// one key per removed slot.
    pub fn take_expired(&mut self, now: Instant) -> Vec<ReplyKey> {
        let mut expired = Vec::new();
        self.slots.retain(|key, queue| {
            queue.retain(|slot| {
                let due = slot.deadline <= now;
                if due {
                    expired.push(*key);
                }
                !due
            });
            !queue.is_empty()
        });
        self.len -= expired.len();
        expired
    }

    /// Removes every slot opened by `requester`, returning how many.
    pub fn take_requester(&mut self, requester: ConnectionId) -> usize {
        let mut removed = 0;
        self.slots.retain(|key, queue| {
            if key.requester == requester {
                removed += queue.len();
                false
            } else {
                true
            }
        });
        self.len -= removed;
        removed
    }

    /// Removes every slot, returning one key per slot.
    pub fn take_all(&mut self) -> Vec<ReplyKey> {
        self.len = 0;
        self.slots
            .drain()
            .flat_map(|(key, queue)| std::iter::repeat_n(key, queue.len()))
            .collect()
    }

    /// Returns the number of open slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slot is open.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
