//! The bus: connection registry and entry points.
//!
//! # Locking
//!
//! The registry is an `RwLock<HashMap<ConnectionId, Arc<Connection>>>`.
//! Every operation takes the read lock only long enough to clone the
//! `Arc`s it needs; creation and destruction take the write lock to insert
//! or remove a single entry. Per-connection state sits behind its own
//! mutex, and no code path holds two connection mutexes at once.
//!
//! # Teardown
//!
//! [`Bus::destroy_connection`] first unlinks the connection from the
//! registry, then marks it dead under its own lock. A sender that resolved
//! the destination before the unlink finds it dead once it gets the lock
//! and fails with [`BusError::DestinationGone`] having changed nothing.
//!
//! # Reply accounting
//!
//! A request expecting a reply reserves one unit of its sender's pending
//! counter before the destination lock is taken, and opens a reply slot
//! at the destination under that lock. The unit is given back exactly once,
//! by whichever of these removes the slot first:
//!
//! - a successful [`Bus::reply`]
//! - [`Bus::expire_pending`] after the deadline
//! - destruction of the replying connection
//!
//! If the enqueue itself is rejected, the reservation is rolled back
//! immediately. Destroying the requesting connection discards its slots at
//! every replier; a request that lands after that sweep is withdrawn by its
//! sender once it sees the requester is dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::broadcast::{self, RecipientFilter, SubscriptionFilter};
use crate::config::{BusLimits, ConfigError};
use crate::connection::{
    Connection, ConnectionInfo, ConnectionOptions, ConnectionStats, ReceiveMode, Received,
};
use crate::error::{BusError, BusResult};
use crate::message::{ConnectionId, Destination, Message, Notification, OutgoingMessage, UserId};
use crate::pool::PoolOffset;

/// An in-process message bus.
///
/// `Bus` is `Send + Sync`; share it behind an [`Arc`] to drive it from
/// several threads.
#[derive(Debug)]
pub struct Bus {
    limits: BusLimits,
    filter: Box<dyn RecipientFilter>,
    /// Next id to hand out. Ids below this value were issued at some point.
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Bus {
    /// Creates a bus enforcing `limits`, selecting broadcast recipients by
    /// their subscription switches.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the limits are inconsistent.
    pub fn new(limits: BusLimits) -> Result<Self, ConfigError> {
        Self::with_filter(limits, SubscriptionFilter)
    }

    /// Creates a bus with a custom broadcast recipient filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the limits are inconsistent.
    pub fn with_filter(
        limits: BusLimits,
        filter: impl RecipientFilter + 'static,
    ) -> Result<Self, ConfigError> {
        limits.validate()?;
        Ok(Self {
            limits,
            filter: Box::new(filter),
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the limits this bus enforces.
    #[must_use]
    pub const fn limits(&self) -> &BusLimits {
        &self.limits
    }

    /// Registers a new connection sending as `user`.
    ///
    /// Its pool holds `options.pool_size` bytes, capped by the bus-wide
    /// pool size. Connections subscribed to id changes are told about it.
    pub fn create_connection(&self, user: UserId, options: ConnectionOptions) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let connection = Arc::new(Connection::new(
            ConnectionInfo { id, user, options },
            &self.limits,
        ));
        let pool_capacity = options.pool_capacity(&self.limits);
        self.write().insert(id, connection);
        info!(connection_id = %id, %user, pool_capacity, "connection created");

        self.announce(id, Notification::IdAdd { id }, Instant::now());
        id
    }

    /// Tears a connection down.
    ///
    /// Its queued messages and pool are discarded. Every request it received
    /// and did not answer is reported to its requester as
    /// [`Notification::ReplyDead`]. Requests it sent that still await a reply
    /// are forgotten by their repliers. Subscribers to id changes are told it
    /// left.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DestinationGone`] if it was already destroyed, or
    /// [`BusError::UnknownConnection`] if the id was never issued.
    pub fn destroy_connection(&self, id: ConnectionId) -> BusResult<()> {
        let removed = self.write().remove(&id);
        let connection = removed.ok_or_else(|| self.missing(id))?;

        let unanswered = connection.lock().teardown();
        let now = Instant::now();
        for key in &unanswered {
            if let Ok(requester) = self.lookup(key.requester) {
                requester.pending.release();
                Self::notify(
                    &requester,
                    Notification::ReplyDead { cookie: key.cookie },
                    now,
                );
            }
        }

        let abandoned: usize = self
            .snapshot()
            .iter()
            .map(|replier| replier.lock().forget_requester(id))
            .sum();

        self.announce(id, Notification::IdRemove { id }, now);
        info!(
            connection_id = %id,
            unanswered = unanswered.len(),
            abandoned,
            "connection destroyed"
        );
        Ok(())
    }

    /// Sends a message.
    ///
    /// A unicast either lands in the destination mailbox or fails with the
    /// reason. A broadcast is offered to every selected connection except
    /// the sender and always succeeds once it passes validation; recipients
    /// that cannot take it drop it.
    ///
    /// # Errors
    ///
    /// - [`BusError::MessageTooLarge`] if the payload exceeds the limit
    /// - [`BusError::InvalidArgs`] if a reply is expected with a zero cookie
    ///   or zero timeout, or on a broadcast
    /// - [`BusError::UnknownConnection`] if the sender is not registered
    /// - [`BusError::DestinationGone`] or [`BusError::UnknownConnection`] if
    ///   the destination does not exist
    /// - [`BusError::TooManyPending`] if the sender has too many open
    ///   requests
    /// - [`BusError::QueueFull`], [`BusError::UserQuotaExceeded`] or
    ///   [`BusError::ExFull`] if the destination cannot take the message
    pub fn send(
        &self,
        sender: ConnectionId,
        destination: Destination,
        message: OutgoingMessage,
    ) -> BusResult<()> {
        let cookie = message.cookie;
        let result = self.try_send(sender, destination, message);
        if let Err(err) = &result {
            debug!(
                %sender,
                %destination,
                cookie,
                error = %err,
                errno = %err.errno(),
                "send rejected"
            );
        }
        result
    }

    fn try_send(
        &self,
        sender: ConnectionId,
        destination: Destination,
        message: OutgoingMessage,
    ) -> BusResult<()> {
        self.validate(destination, &message)?;
        let source = self.sender(sender)?;
        let now = Instant::now();

        let target = match destination {
            Destination::Broadcast => {
                let message = Message::from_outgoing(sender, destination, message);
                let fanout = broadcast::dispatch(
                    &self.snapshot(),
                    sender,
                    &message,
                    Some(source.info.user),
                    self.filter.as_ref(),
                    now,
                );
                trace!(
                    %sender,
                    cookie = message.cookie,
                    delivered = fanout.delivered,
                    dropped = fanout.dropped,
                    "broadcast sent"
                );
                return Ok(());
            },
            Destination::Unicast(target) => target,
        };

        let recipient = self.lookup(target)?;
        let expects_reply = message.expect_reply;
        if expects_reply {
            source
                .pending
                .try_reserve()
                .map_err(|pending| BusError::TooManyPending {
                    sender,
                    pending,
                    max: source.pending.max(),
                })?;
        }

        let message = Message::from_outgoing(sender, destination, message);
        let result = recipient
            .lock()
            .enqueue(message, Some(source.info.user), now);
        if expects_reply {
            if result.is_err() {
                source.pending.release();
            } else if !source.lock().is_alive() {
                // Torn down mid-send: the slot may have missed the sweep.
                recipient.lock().forget_requester(sender);
            }
        }
        result
    }

    /// Answers a request `requester` sent to `replier` with `cookie`.
    ///
    /// The reply is delivered to `requester` with its `cookie_reply` set to
    /// `cookie`. A request can be answered once; if delivery fails the
    /// request stays open and may be answered again.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotPermitted`] if `replier` holds no such request,
    ///   which includes every request of a destroyed requester
    /// - [`BusError::InvalidArgs`] if the reply itself expects a reply
    /// - [`BusError::MessageTooLarge`] if the payload exceeds the limit
    /// - [`BusError::UnknownConnection`] if `replier` is not registered
    /// - [`BusError::DestinationGone`] if `requester` went away while the
    ///   reply was in flight; the request is consumed
    /// - any admission error of [`Bus::send`] from the requester's mailbox
    pub fn reply(
        &self,
        replier: ConnectionId,
        requester: ConnectionId,
        cookie: u64,
        message: OutgoingMessage,
    ) -> BusResult<()> {
        let result = self.try_reply(replier, requester, cookie, message);
        if let Err(err) = &result {
            debug!(
                %replier,
                %requester,
                cookie,
                error = %err,
                errno = %err.errno(),
                "reply rejected"
            );
        }
        result
    }

    fn try_reply(
        &self,
        replier: ConnectionId,
        requester: ConnectionId,
        cookie: u64,
        message: OutgoingMessage,
    ) -> BusResult<()> {
        if message.expect_reply {
            return Err(BusError::InvalidArgs {
                reason: "a reply cannot itself expect a reply",
            });
        }
        self.check_payload(&message)?;
        let source = self.sender(replier)?;

        let Some(slot) = source.lock().claim_reply(requester, cookie) else {
            return Err(BusError::NotPermitted {
                replier,
                requester,
                cookie,
            });
        };
        // From here this call owns the requester's pending unit.
        let target = self.lookup(requester)?;

        let mut reply = Message::from_outgoing(replier, Destination::Unicast(requester), message);
        reply.cookie_reply = cookie;
        let now = Instant::now();
        let result = target.lock().enqueue(reply, Some(source.info.user), now);
        match &result {
            Ok(()) => {
                target.pending.release();
                trace!(%replier, %requester, cookie, "reply delivered");
            },
            Err(BusError::DestinationGone { .. }) => {},
            Err(_) => {
                let mut state = source.lock();
                if state.is_alive() {
                    state.restore_reply(requester, cookie, slot);
                } else {
                    // The replier was torn down while the slot was claimed.
                    drop(state);
                    target.pending.release();
                    Self::notify(&target, Notification::ReplyDead { cookie }, now);
                }
            },
        }
        result
    }

    /// Removes the next message from a mailbox.
    ///
    /// The message bytes stay in the connection's pool until released with
    /// [`Bus::release_payload`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::WouldBlock`] if no message matches `mode`, or a
    /// lookup error if the connection does not exist.
    pub fn receive(&self, connection: ConnectionId, mode: ReceiveMode) -> BusResult<Received> {
        self.lookup(connection)?.lock().receive(mode)
    }

    /// Returns a copy of the oldest queued message without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::WouldBlock`] if the mailbox is empty, or a lookup
    /// error if the connection does not exist.
    pub fn peek(&self, connection: ConnectionId) -> BusResult<Message> {
        self.lookup(connection)?.lock().peek()
    }

    /// Discards the oldest queued message and frees its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::WouldBlock`] if the mailbox is empty, or a lookup
    /// error if the connection does not exist.
    pub fn drop_next(&self, connection: ConnectionId) -> BusResult<Message> {
        self.lookup(connection)?.lock().drop_next()
    }

    /// Frees the pool slice of a received message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidOffset`] if `offset` is not a received,
    /// unreleased slice of this connection.
    pub fn release_payload(&self, connection: ConnectionId, offset: PoolOffset) -> BusResult<()> {
        let freed = self.lookup(connection)?.lock().release(offset)?;
        trace!(connection_id = %connection, %offset, freed, "released payload");
        Ok(())
    }

    /// Returns the bytes of a live pool slice.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidOffset`] if no slice starts at `offset`.
    pub fn read_payload(&self, connection: ConnectionId, offset: PoolOffset) -> BusResult<Bytes> {
        self.lookup(connection)?.lock().read(offset)
    }

    /// Expires every open request whose deadline is at or before `now`.
    ///
    /// Each requester gets its pending unit back and a
    /// [`Notification::ReplyTimeout`] carrying the request cookie. Returns
    /// the number of requests expired.
    pub fn expire_pending(&self, now: Instant) -> usize {
        let mut expired = 0;
        for replier in self.snapshot() {
            let keys = replier.lock().take_expired(now);
            for key in keys {
                expired += 1;
                debug!(
                    replier = %replier.id(),
                    requester = %key.requester,
                    cookie = key.cookie,
                    "request timed out"
                );
                if let Ok(requester) = self.lookup(key.requester) {
                    requester.pending.release();
                    Self::notify(
                        &requester,
                        Notification::ReplyTimeout { cookie: key.cookie },
                        now,
                    );
                }
            }
        }
        expired
    }

    /// Returns resource usage of a connection.
    #[must_use]
    pub fn connection_stats(&self, connection: ConnectionId) -> Option<ConnectionStats> {
        self.read().get(&connection).map(|conn| conn.stats())
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    fn validate(&self, destination: Destination, message: &OutgoingMessage) -> BusResult<()> {
        self.check_payload(message)?;
        if !message.expect_reply {
            return Ok(());
        }
        if destination == Destination::Broadcast {
            return Err(BusError::InvalidArgs {
                reason: "a broadcast cannot expect a reply",
            });
        }
        if message.cookie == 0 {
            return Err(BusError::InvalidArgs {
                reason: "a request expecting a reply needs a non-zero cookie",
            });
        }
        if message.reply_timeout.is_zero() {
            return Err(BusError::InvalidArgs {
                reason: "a request expecting a reply needs a non-zero timeout",
            });
        }
        Ok(())
    }

    fn check_payload(&self, message: &OutgoingMessage) -> BusResult<()> {
        if message.payload.len() > self.limits.max_payload_size {
            return Err(BusError::MessageTooLarge {
                size: message.payload.len(),
                max: self.limits.max_payload_size,
            });
        }
        Ok(())
    }

    /// Queues a bus notification to one connection, dropping it if the
    /// mailbox cannot take it.
    fn notify(target: &Connection, notification: Notification, now: Instant) {
        let message = Message::notification(Destination::Unicast(target.id()), notification);
        let mut state = target.lock();
        if let Err(err) = state.enqueue(message, None, now) {
            if state.is_alive() {
                state.record_drop();
            }
            debug!(
                recipient = %target.id(),
                ?notification,
                error = %err,
                "dropped notification"
            );
        }
    }

    /// Fans a peer notification about `subject` out to subscribers.
    fn announce(&self, subject: ConnectionId, notification: Notification, now: Instant) {
        let message = Message::notification(Destination::Broadcast, notification);
        let fanout = broadcast::dispatch(
            &self.snapshot(),
            subject,
            &message,
            None,
            self.filter.as_ref(),
            now,
        );
        trace!(
            %subject,
            ?notification,
            delivered = fanout.delivered,
            dropped = fanout.dropped,
            "announced"
        );
    }

    fn lookup(&self, id: ConnectionId) -> BusResult<Arc<Connection>> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or_else(|| self.missing(id))
    }

    /// Resolves a sending connection. A sender that is not registered is
    /// unknown even if it once existed.
    fn sender(&self, id: ConnectionId) -> BusResult<Arc<Connection>> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(BusError::UnknownConnection { connection: id })
    }

    fn missing(&self, id: ConnectionId) -> BusError {
        if !id.is_kernel() && id.get() < self.next_id.load(Ordering::Acquire) {
            BusError::DestinationGone { connection: id }
        } else {
            BusError::UnknownConnection { connection: id }
        }
    }

    /// Live connections in id order.
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.read().values().cloned().collect();
        connections.sort_by_key(|conn| conn.id());
        connections
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
