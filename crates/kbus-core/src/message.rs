//! Message model: connection and user identities, destinations, and the
//! immutable message record handed to a mailbox.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of a connection on the bus.
///
/// Ids are allocated monotonically starting at 1. Id 0 is reserved for the
/// kernel as the source of bus notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Source id of messages generated by the bus itself.
    pub const KERNEL: Self = Self(0);

    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` for the kernel source id.
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending-user identity, as established by the handshake layer.
///
/// Per-user fairness in a mailbox is keyed on this value, not on the
/// connection, so one user cannot escape its share by opening more
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(u32);

impl UserId {
    /// Wraps a raw user id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw user id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A single connection.
    Unicast(ConnectionId),
    /// Every subscribed connection except the sender.
    Broadcast,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast(id) => write!(f, "{id}"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Bus-generated notification bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    /// A connection joined the bus.
    IdAdd {
        /// The new connection.
        id: ConnectionId,
    },
    /// A connection left the bus.
    IdRemove {
        /// The departed connection.
        id: ConnectionId,
    },
    /// A request sent by the recipient was not answered in time.
    ReplyTimeout {
        /// Cookie of the unanswered request.
        cookie: u64,
    },
    /// The connection a request was sent to went away before replying.
    ReplyDead {
        /// Cookie of the unanswered request.
        cookie: u64,
    },
}

impl Notification {
    /// Returns `true` for peer appeared/vanished notifications, which are
    /// fanned out to subscribers rather than addressed to one connection.
    #[must_use]
    pub const fn is_id_change(&self) -> bool {
        matches!(self, Self::IdAdd { .. } | Self::IdRemove { .. })
    }
}

/// A message as submitted by a sender, before the bus stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Sender-chosen correlation token.
    pub cookie: u64,
    /// Delivery priority; lower is more urgent.
    pub priority: i64,
    /// Whether the sender expects a reply.
    pub expect_reply: bool,
    /// How long the sender waits for a reply.
    pub reply_timeout: Duration,
    /// Serialized body.
    pub payload: Bytes,
}

impl OutgoingMessage {
    /// Creates a message with the given cookie and an empty payload.
    #[must_use]
    pub fn new(cookie: u64) -> Self {
        Self {
            cookie,
            priority: 0,
            expect_reply: false,
            reply_timeout: Duration::ZERO,
            payload: Bytes::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Marks the message as a request expecting a reply within `timeout`.
    #[must_use]
    pub const fn expecting_reply(mut self, timeout: Duration) -> Self {
        self.expect_reply = true;
        self.reply_timeout = timeout;
        self
    }
}

/// A message as stored in a mailbox and returned by a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender-chosen correlation token (zero for notifications).
    pub cookie: u64,
    /// Cookie of the request this message answers, or zero.
    pub cookie_reply: u64,
    /// Delivery priority; lower is more urgent.
    pub priority: i64,
    /// Sending connection, or [`ConnectionId::KERNEL`].
    pub src_id: ConnectionId,
    /// How the message was addressed.
    pub dst: Destination,
    /// Whether the sender expects a reply.
    pub expect_reply: bool,
    /// How long the sender waits for a reply.
    pub reply_timeout: Duration,
    /// Serialized body.
    pub payload: Bytes,
    /// Notification body for bus-generated messages.
    pub notification: Option<Notification>,
}

impl Message {
    /// Stamps an outgoing message with its source and destination.
    #[must_use]
    pub fn from_outgoing(src_id: ConnectionId, dst: Destination, outgoing: OutgoingMessage) -> Self {
        Self {
            cookie: outgoing.cookie,
            cookie_reply: 0,
            priority: outgoing.priority,
            src_id,
            dst,
            expect_reply: outgoing.expect_reply,
            reply_timeout: outgoing.reply_timeout,
            payload: outgoing.payload,
            notification: None,
        }
    }

    /// Builds a bus notification addressed to `dst`.
    #[must_use]
    pub fn notification(dst: Destination, notification: Notification) -> Self {
        let cookie_reply = match notification {
            Notification::ReplyTimeout { cookie } | Notification::ReplyDead { cookie } => cookie,
            Notification::IdAdd { .. } | Notification::IdRemove { .. } => 0,
        };
        Self {
            cookie: 0,
            cookie_reply,
            priority: 0,
            src_id: ConnectionId::KERNEL,
            dst,
            expect_reply: false,
            reply_timeout: Duration::ZERO,
            payload: Bytes::new(),
            notification: Some(notification),
        }
    }

    /// Returns `true` if the bus generated this message.
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.src_id.is_kernel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_id_is_zero() {
        assert!(ConnectionId::KERNEL.is_kernel());
        assert!(!ConnectionId::new(1).is_kernel());
        assert_eq!(ConnectionId::new(42).to_string(), "42");
    }

    #[test]
    fn outgoing_builder_sets_fields() {
        let msg = OutgoingMessage::new(9)
            .with_priority(-5)
            .with_payload(&b"hello"[..])
            .expecting_reply(Duration::from_millis(100));
        assert_eq!(msg.cookie, 9);
        assert_eq!(msg.priority, -5);
        assert!(msg.expect_reply);
        assert_eq!(msg.reply_timeout, Duration::from_millis(100));
        assert_eq!(&msg.payload[..], b"hello");
    }

    #[test]
    fn stamped_message_keeps_sender_fields() {
        let out = OutgoingMessage::new(3).with_priority(7);
        let msg = Message::from_outgoing(
            ConnectionId::new(1),
            Destination::Unicast(ConnectionId::new(2)),
            out,
        );
        assert_eq!(msg.src_id, ConnectionId::new(1));
        assert_eq!(msg.dst, Destination::Unicast(ConnectionId::new(2)));
        assert_eq!(msg.priority, 7);
        assert_eq!(msg.cookie_reply, 0);
        assert!(!msg.is_kernel());
    }

    #[test]
    fn reply_notifications_carry_cookie_reply() {
        let msg = Message::notification(
            Destination::Unicast(ConnectionId::new(1)),
            Notification::ReplyTimeout { cookie: 77 },
        );
        assert!(msg.is_kernel());
        assert_eq!(msg.cookie_reply, 77);
        assert!(!msg.notification.unwrap().is_id_change());

        let add = Notification::IdAdd {
            id: ConnectionId::new(4),
        };
        assert!(add.is_id_change());
        assert_eq!(
            Message::notification(Destination::Broadcast, add).cookie_reply,
            0
        );
    }
}
