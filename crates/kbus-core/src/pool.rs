//! Per-connection byte arena.
//!
//! Every queued message occupies one slice of its recipient's pool. A slice
//! is identified by its [`PoolOffset`] and moves through two states:
//!
//! 1. **Kernel-owned**: allocated at enqueue; the message is still queued.
//!    Only the bus may free it (drop, teardown).
//! 2. **Handed out**: the message was received; the owning connection frees
//!    it with [`Pool::release`] once it has consumed the bytes.
//!
//! Free space is kept as an offset-ordered map of ranges. Allocation is
//! first-fit and freeing coalesces with both neighbours, so a freed slice is
//! reusable by the next allocation of the same size.
//!
//! # Invariants
//!
//! - `used == sum(live slice lengths) <= capacity`
//! - `used + sum(free range lengths) == capacity`
//! - live slices and free ranges never overlap

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed per-message bookkeeping charged to the pool in front of the payload.
pub const MESSAGE_HEADER_SIZE: usize = 64;

/// Rounds up to the next multiple of 8.
const fn align8(n: usize) -> usize {
    n.saturating_add(7) & !7
}

/// Returns the number of pool bytes a message with `payload_len` bytes
/// occupies.
#[must_use]
pub const fn slice_size(payload_len: usize) -> usize {
    align8(MESSAGE_HEADER_SIZE.saturating_add(payload_len))
}

/// Opaque handle to a pool slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolOffset(usize);

impl PoolOffset {
    /// Wraps a raw offset.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for PoolOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No free range can hold the requested bytes.
    #[error("pool full: {requested} bytes requested, {available} available")]
    Full {
        /// Bytes requested.
        requested: usize,
        /// Bytes free in total.
        available: usize,
    },

    /// The offset does not name a slice the caller may free.
    #[error("invalid pool offset {offset}")]
    InvalidOffset {
        /// Offending offset.
        offset: PoolOffset,
    },
}

#[derive(Debug)]
struct Slice {
    len: usize,
    data: Bytes,
    handed_out: bool,
}

/// A fixed-capacity byte arena.
#[derive(Debug)]
pub struct Pool {
    capacity: usize,
    used: usize,
    /// Free ranges keyed by start offset.
    free: BTreeMap<usize, usize>,
    /// Live slices keyed by start offset.
    slices: BTreeMap<usize, Slice>,
}

impl Pool {
    /// Creates an empty pool of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            used: 0,
            free,
            slices: BTreeMap::new(),
        }
    }

    /// Returns the pool capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the bytes held by live slices.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Returns the bytes not held by any slice.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Returns the number of live slices.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Allocates a kernel-owned slice holding `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Full`] if the slice does not fit. The pool is
    /// unchanged on error.
    pub fn alloc(&mut self, payload: Bytes) -> Result<PoolOffset, PoolError> {
        let len = slice_size(payload.len());
        let full = PoolError::Full {
            requested: len,
            available: self.available(),
        };
        if len > self.available() {
            return Err(full);
        }

        let Some((&start, &range_len)) = self.free.iter().find(|&(_, &range)| range >= len)
        else {
            return Err(full);
        };

        self.free.remove(&start);
        if range_len > len {
            self.free.insert(start + len, range_len - len);
        }
        self.slices.insert(
            start,
            Slice {
                len,
                data: payload,
                handed_out: false,
            },
        );
        self.used += len;
        Ok(PoolOffset(start))
    }

    /// Marks a slice as handed to the consumer, who now owns its release.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidOffset`] if no slice starts at `offset`.
    pub fn hand_out(&mut self, offset: PoolOffset) -> Result<(), PoolError> {
        let slice = self
            .slices
            .get_mut(&offset.0)
            .ok_or(PoolError::InvalidOffset { offset })?;
        slice.handed_out = true;
        Ok(())
    }

    /// Releases a slice previously handed out to the consumer.
    ///
    /// Releasing the same offset twice, an offset that was never allocated,
    /// or a slice whose message is still queued fails without touching the
    /// accounting.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidOffset`] in each of those cases.
    pub fn release(&mut self, offset: PoolOffset) -> Result<usize, PoolError> {
        match self.slices.get(&offset.0) {
            Some(slice) if slice.handed_out => Ok(self.free_slice(offset)),
            _ => Err(PoolError::InvalidOffset { offset }),
        }
    }

    /// Frees a slice regardless of ownership. Used by the bus when it drops
    /// a queued message or tears the connection down.
    ///
    /// Returns the number of bytes freed (zero if no slice starts at
    /// `offset`).
    pub fn free_slice(&mut self, offset: PoolOffset) -> usize {
        let Some(slice) = self.slices.remove(&offset.0) else {
            return 0;
        };
        self.used -= slice.len;
        self.insert_free(offset.0, slice.len);
        slice.len
    }

    /// Returns the payload stored in a live slice.
    #[must_use]
    pub fn read(&self, offset: PoolOffset) -> Option<&Bytes> {
        self.slices.get(&offset.0).map(|slice| &slice.data)
    }

    /// Returns the pool bytes the slice at `offset` occupies.
    #[must_use]
    pub fn slice_len(&self, offset: PoolOffset) -> Option<usize> {
        self.slices.get(&offset.0).map(|slice| slice.len)
    }

    /// Frees every slice.
    pub fn clear(&mut self) {
        self.slices.clear();
        self.free.clear();
        if self.capacity > 0 {
            self.free.insert(0, self.capacity);
        }
        self.used = 0;
    }

    fn insert_free(&mut self, mut start: usize, mut len: usize) {
        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }

    #[cfg(test)]
    fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    #[cfg(test)]
    fn free_ranges(&self) -> usize {
        self.free.len()
    }
}
