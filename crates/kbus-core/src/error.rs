//! Error types for the mailbox engine.
//!
//! Every rejection is transactional: when one of these errors is returned,
//! all shared structures (mailbox, pool, quota ledger, pending counters,
//! reply slots) are exactly as they were before the call.
//!
//! # Error Classification
//!
//! | Variant | Meaning | Broadcast fan-out |
//! |---------|---------|-------------------|
//! | [`BusError::QueueFull`] | recipient queue at the global cap | dropped silently |
//! | [`BusError::UserQuotaExceeded`] | sender's user exhausted its fair share | dropped silently |
//! | [`BusError::ExFull`] | recipient pool cannot hold the bytes | dropped silently |
//! | [`BusError::TooManyPending`] | sender holds too many open requests | n/a |
//! | [`BusError::InvalidArgs`] | malformed reply expectation | surfaced |
//! | [`BusError::NotPermitted`] | forged reply | n/a |
//! | [`BusError::InvalidOffset`] | unknown or double pool release | n/a |
//! | [`BusError::WouldBlock`] | nothing matches the receive mode | n/a |

use nix::errno::Errno;
use thiserror::Error;

use crate::message::ConnectionId;
use crate::pool::PoolOffset;

/// Errors returned by the bus entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The recipient's mailbox holds the global maximum of messages.
    #[error("queue full: connection {recipient} holds {queued} messages (maximum {max})")]
    QueueFull {
        /// Connection whose mailbox is full.
        recipient: ConnectionId,
        /// Messages currently queued.
        queued: usize,
        /// Global queue cap.
        max: usize,
    },

    /// The sending user already holds its per-user share of the mailbox.
    #[error("user {user} exceeded its quota on connection {recipient}: {charged} >= maximum {max}")]
    UserQuotaExceeded {
        /// Connection whose ledger rejected the message.
        recipient: ConnectionId,
        /// Sending user identity.
        user: u32,
        /// Messages currently charged to the user.
        charged: usize,
        /// Per-user cap.
        max: usize,
    },

    /// The recipient's pool cannot hold the message bytes.
    #[error("pool of connection {recipient} exhausted: {requested} bytes requested, {available} available")]
    ExFull {
        /// Connection whose pool is exhausted.
        recipient: ConnectionId,
        /// Bytes the message needs.
        requested: usize,
        /// Bytes still free in the pool.
        available: usize,
    },

    /// The sender already has the maximum number of outstanding requests.
    #[error("connection {sender} has {pending} requests awaiting a reply (maximum {max})")]
    TooManyPending {
        /// Sending connection.
        sender: ConnectionId,
        /// Requests currently pending.
        pending: usize,
        /// Pending-request cap.
        max: usize,
    },

    /// The request is malformed.
    #[error("invalid arguments: {reason}")]
    InvalidArgs {
        /// What was wrong with the request.
        reason: &'static str,
    },

    /// The payload is larger than the bus allows for a single message.
    #[error("message payload of {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Maximum single-payload size.
        max: usize,
    },

    /// A reply did not correspond to a request the replier received.
    #[error("connection {replier} holds no request {cookie:#x} from connection {requester}")]
    NotPermitted {
        /// Connection attempting the reply.
        replier: ConnectionId,
        /// Connection the reply was addressed to.
        requester: ConnectionId,
        /// Cookie being replied to.
        cookie: u64,
    },

    /// The offset does not name a live allocation in the pool.
    #[error("connection {connection} has no live pool slice at offset {offset}")]
    InvalidOffset {
        /// Pool owner.
        connection: ConnectionId,
        /// Offending offset.
        offset: PoolOffset,
    },

    /// No queued message matches the receive mode.
    #[error("no message available")]
    WouldBlock,

    /// The destination was torn down while the call was in flight.
    #[error("connection {connection} is gone")]
    DestinationGone {
        /// The vanished connection.
        connection: ConnectionId,
    },

    /// The id never named a connection on this bus.
    #[error("unknown connection {connection}")]
    UnknownConnection {
        /// The unknown id.
        connection: ConnectionId,
    },
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const POOL_FULL_ERRNO: Errno = Errno::EXFULL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POOL_FULL_ERRNO: Errno = Errno::ENOBUFS;

impl BusError {
    /// Returns the errno a transport layer reports for this error.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub const fn errno(&self) -> Errno {
        match self {
            Self::QueueFull { .. } | Self::UserQuotaExceeded { .. } => Errno::ENOBUFS,
            Self::ExFull { .. } => POOL_FULL_ERRNO,
            Self::TooManyPending { .. } => Errno::EMLINK,
            Self::InvalidArgs { .. } => Errno::EINVAL,
            Self::MessageTooLarge { .. } => Errno::EMSGSIZE,
            Self::NotPermitted { .. } => Errno::EPERM,
            Self::WouldBlock => Errno::EAGAIN,
            Self::InvalidOffset { .. } => Errno::ENXIO,
            Self::DestinationGone { .. } | Self::UnknownConnection { .. } => Errno::ENXIO,
        }
    }

    /// Returns `true` for recipient-side backpressure.
    ///
    /// These are the rejections a broadcast fan-out swallows per recipient.
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::UserQuotaExceeded { .. } | Self::ExFull { .. }
        )
    }

    /// Returns `true` if the error is caused by the caller's own request
    /// rather than by the state of a peer.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgs { .. }
                | Self::MessageTooLarge { .. }
                | Self::NotPermitted { .. }
                | Self::InvalidOffset { .. }
        )
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
