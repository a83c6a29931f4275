//! Connection records.
//!
//! A `Connection` bundles everything the bus keeps per endpoint: its
//! identity and subscription switches, the lock-free counter of requests it
//! has sent, and a mutex-guarded `ConnectionState` holding its mailbox,
//! pool, quota ledger and reply slots.
//!
//! Admission runs entirely under the recipient's lock, so quota, pool,
//! mailbox and reply slot change together or not at all. The bus never
//! holds two connection locks at once.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tracing::trace;

use crate::config::BusLimits;
use crate::error::{BusError, BusResult};
use crate::mailbox::{Mailbox, QueuedMessage};
use crate::message::{ConnectionId, Message, UserId};
use crate::pending::{PendingCounter, ReplyKey, ReplySlot, ReplySlots};
use crate::pool::{Pool, PoolError, PoolOffset};
use crate::quota::{QuotaLedger, QuotaRejection};

/// Switches and sizing chosen when a connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Deliver broadcasts sent by other connections.
    pub receive_broadcasts: bool,
    /// Deliver peer appeared/vanished notifications.
    pub receive_id_changes: bool,
    /// Pool capacity in bytes. `None`, or anything above the bus limit,
    /// gets the bus limit.
    pub pool_size: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            receive_broadcasts: true,
            receive_id_changes: false,
            pool_size: None,
        }
    }
}

impl ConnectionOptions {
    /// Opts into peer appeared/vanished notifications.
    #[must_use]
    pub const fn with_id_changes(mut self) -> Self {
        self.receive_id_changes = true;
        self
    }

    /// Opts out of broadcasts.
    #[must_use]
    pub const fn without_broadcasts(mut self) -> Self {
        self.receive_broadcasts = false;
        self
    }

    /// Asks for a pool of `bytes` instead of the bus-wide size.
    #[must_use]
    pub const fn with_pool_size(mut self, bytes: usize) -> Self {
        self.pool_size = Some(bytes);
        self
    }

    /// Returns the pool capacity a connection with these options gets
    /// under `limits`.
    #[must_use]
    pub fn pool_capacity(&self, limits: &BusLimits) -> usize {
        self.pool_size
            .map_or(limits.pool_size, |bytes| bytes.min(limits.pool_size))
    }
}

/// Immutable description of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// User the connection sends as.
    pub user: UserId,
    /// Switches and sizing chosen at creation.
    pub options: ConnectionOptions,
}

/// Point-in-time resource usage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages waiting in the mailbox.
    pub queue_depth: usize,
    /// Pool bytes held by queued or handed-out messages.
    pub pool_used: usize,
    /// Pool capacity in bytes.
    pub pool_capacity: usize,
    /// Requests this connection sent that still await a reply.
    pub pending_requests: usize,
    /// Requests this connection received and may still answer.
    pub reply_slots: usize,
    /// Broadcasts and notifications dropped at this mailbox.
    pub dropped: u64,
}

/// How a receive selects its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Oldest message first.
    Fifo,
    /// Most urgent message whose priority is at most the threshold.
    Priority(i64),
}

/// A received message and the pool slice that holds it.
///
/// The slice stays allocated until the receiver passes `offset` to
/// [`crate::Bus::release_payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// The message.
    pub message: Message,
    /// Pool offset of the message bytes.
    pub offset: PoolOffset,
}

/// A connection as held by the bus registry.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) info: ConnectionInfo,
    pub(crate) pending: PendingCounter,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(info: ConnectionInfo, limits: &BusLimits) -> Self {
        Self {
            info,
            pending: PendingCounter::new(limits.max_pending_requests),
            state: Mutex::new(ConnectionState::new(
                info.id,
                info.options.pool_capacity(limits),
                limits,
            )),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Locks the connection state. A panic in another holder leaves the
    /// accounting consistent, so a poisoned lock is recovered.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        let state = self.lock();
        ConnectionStats {
            queue_depth: state.mailbox.len(),
            pool_used: state.pool.used(),
            pool_capacity: state.pool.capacity(),
            pending_requests: self.pending.count(),
            reply_slots: state.replies.len(),
            dropped: state.dropped,
        }
    }
}

/// Mutable per-connection state, guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    id: ConnectionId,
    alive: bool,
    mailbox: Mailbox,
    pool: Pool,
    quota: QuotaLedger,
    replies: ReplySlots,
    dropped: u64,
}

impl ConnectionState {
    fn new(id: ConnectionId, pool_capacity: usize, limits: &BusLimits) -> Self {
        Self {
            id,
            alive: true,
            mailbox: Mailbox::new(),
            pool: Pool::new(pool_capacity),
            quota: QuotaLedger::new(limits),
            replies: ReplySlots::new(),
            dropped: 0,
        }
    }

    pub(crate) const fn is_alive(&self) -> bool {
        self.alive
    }

    /// Admits `message` into this mailbox.
    ///
    /// `sender` is the sending user, or `None` for bus notifications. A
    /// message expecting a reply also opens a reply slot keyed by its source
    /// and cookie. On error nothing has changed.
    pub(crate) fn enqueue(
        &mut self,
        message: Message,
        sender: Option<UserId>,
        now: Instant,
    ) -> BusResult<()> {
        if !self.alive {
            return Err(BusError::DestinationGone {
                connection: self.id,
            });
        }
        let opens_slot = message.expect_reply && !message.is_kernel();

        let charge = self
            .quota
            .admit(sender)
            .map_err(|rejection| self.quota_error(rejection))?;
        let offset = match self.pool.alloc(message.payload.clone()) {
            Ok(offset) => offset,
            Err(err) => {
                self.quota.refund(charge);
                return Err(self.pool_error(err));
            },
        };

        if opens_slot {
            self.replies
                .open(message.src_id, message.cookie, now, message.reply_timeout);
        }
        trace!(
            connection_id = %self.id,
            src_id = %message.src_id,
            cookie = message.cookie,
            priority = message.priority,
            %offset,
            "enqueued message"
        );
        self.mailbox.push(message, offset, charge);
        Ok(())
    }

    /// Removes the next message selected by `mode` and hands its slice to
    /// the consumer.
    pub(crate) fn receive(&mut self, mode: ReceiveMode) -> BusResult<Received> {
        let entry = self.take(mode)?;
        self.pool
            .hand_out(entry.offset)
            .map_err(|err| self.pool_error(err))?;
        trace!(
            connection_id = %self.id,
            src_id = %entry.message.src_id,
            cookie = entry.message.cookie,
            offset = %entry.offset,
            "received message"
        );
        Ok(Received {
            message: entry.message,
            offset: entry.offset,
        })
    }

    /// Returns a copy of the oldest queued message.
    pub(crate) fn peek(&self) -> BusResult<Message> {
        self.mailbox
            .peek()
            .map(|entry| entry.message.clone())
            .ok_or(BusError::WouldBlock)
    }

    /// Discards the oldest queued message and frees its slice.
    pub(crate) fn drop_next(&mut self) -> BusResult<Message> {
        let entry = self.take(ReceiveMode::Fifo)?;
        self.pool.free_slice(entry.offset);
        trace!(connection_id = %self.id, cookie = entry.message.cookie, "discarded message");
        Ok(entry.message)
    }

    /// Frees a slice previously handed out by a receive.
    pub(crate) fn release(&mut self, offset: PoolOffset) -> BusResult<usize> {
        self.pool.release(offset).map_err(|err| self.pool_error(err))
    }

    /// Returns the payload of a live slice.
    pub(crate) fn read(&self, offset: PoolOffset) -> BusResult<Bytes> {
        self.pool
            .read(offset)
            .cloned()
            .ok_or(BusError::InvalidOffset {
                connection: self.id,
                offset,
            })
    }

    pub(crate) fn claim_reply(&mut self, requester: ConnectionId, cookie: u64) -> Option<ReplySlot> {
        self.replies.claim(requester, cookie)
    }

    pub(crate) fn restore_reply(&mut self, requester: ConnectionId, cookie: u64, slot: ReplySlot) {
        self.replies.restore(requester, cookie, slot);
    }

    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<ReplyKey> {
        self.replies.take_expired(now)
    }

    /// Discards every reply slot opened by `requester`.
    pub(crate) fn forget_requester(&mut self, requester: ConnectionId) -> usize {
        self.replies.take_requester(requester)
    }

    pub(crate) fn record_drop(&mut self) {
        self.dropped += 1;
    }

    /// Marks the connection dead and releases everything it holds.
    ///
    /// Returns the reply slots that were still open, so their requesters can
    /// be told the replier is gone.
    pub(crate) fn teardown(&mut self) -> Vec<ReplyKey> {
        self.alive = false;
        let discarded = self.mailbox.drain().len();
        self.pool.clear();
        self.quota.clear();
        trace!(connection_id = %self.id, discarded, "tore down mailbox");
        self.replies.take_all()
    }

    fn take(&mut self, mode: ReceiveMode) -> BusResult<QueuedMessage> {
        let entry = match mode {
            ReceiveMode::Fifo => self.mailbox.pop_fifo(),
            ReceiveMode::Priority(threshold) => self.mailbox.pop_priority(threshold),
        }
        .ok_or(BusError::WouldBlock)?;
        self.quota.refund(entry.charge);
        Ok(entry)
    }

    fn quota_error(&self, rejection: QuotaRejection) -> BusError {
        match rejection {
            QuotaRejection::QueueFull { queued, max } => BusError::QueueFull {
                recipient: self.id,
                queued,
                max,
            },
            QuotaRejection::UserQuotaExceeded { user, charged, max } => {
                BusError::UserQuotaExceeded {
                    recipient: self.id,
                    user: user.get(),
                    charged,
                    max,
                }
            },
        }
    }

    fn pool_error(&self, err: PoolError) -> BusError {
        match err {
            PoolError::Full {
                requested,
                available,
            } => BusError::ExFull {
                recipient: self.id,
                requested,
                available,
            },
            PoolError::InvalidOffset { offset } => BusError::InvalidOffset {
                connection: self.id,
                offset,
            },
        }
    }
}
