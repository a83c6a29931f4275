//! Broadcast fan-out.
//!
//! A broadcast is admitted independently at every selected recipient.
//! Rejections (quota, pool, a recipient torn down mid-flight) are recorded
//! against that recipient and otherwise ignored: the sender always sees
//! success once every recipient has been tried.
//!
//! Which connections are selected is decided by a [`RecipientFilter`]. The
//! bus ships [`SubscriptionFilter`], which honours the switches in
//! [`ConnectionOptions`](crate::ConnectionOptions); a match-rule layer can
//! plug in its own.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::connection::{Connection, ConnectionInfo};
use crate::message::{ConnectionId, Message, UserId};

/// Chooses which connections receive a fanned-out message.
pub trait RecipientFilter: Send + Sync + fmt::Debug {
    /// Returns `true` if `recipient` should be offered `message`.
    ///
    /// The sender (or, for peer notifications, the subject connection) is
    /// excluded before the filter is consulted.
    fn accepts(&self, recipient: &ConnectionInfo, message: &Message) -> bool;
}

/// Selects recipients by their subscription switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionFilter;

impl RecipientFilter for SubscriptionFilter {
    fn accepts(&self, recipient: &ConnectionInfo, message: &Message) -> bool {
        match message.notification {
            None => recipient.options.receive_broadcasts,
            Some(notification) if notification.is_id_change() => {
                recipient.options.receive_id_changes
            },
            // Reply notifications are addressed, never fanned out.
            Some(_) => false,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Recipients whose mailbox accepted the message.
    pub delivered: usize,
    /// Recipients that dropped it.
    pub dropped: usize,
}

/// Offers `message` to every connection in `recipients` except `exclude`
/// that `filter` accepts.
pub(crate) fn dispatch(
    recipients: &[Arc<Connection>],
    exclude: ConnectionId,
    message: &Message,
    sender: Option<UserId>,
    filter: &dyn RecipientFilter,
    now: Instant,
) -> Fanout {
    let mut fanout = Fanout::default();
    for recipient in recipients {
        if recipient.id() == exclude || !filter.accepts(&recipient.info, message) {
            continue;
        }
        let mut state = recipient.lock();
        match state.enqueue(message.clone(), sender, now) {
            Ok(()) => fanout.delivered += 1,
            Err(err) => {
                state.record_drop();
                fanout.dropped += 1;
                debug!(
                    recipient = %recipient.id(),
                    src_id = %message.src_id,
                    error = %err,
                    "dropped fanned-out message"
                );
            },
        }
    }
    fanout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusLimits;
    use crate::connection::ConnectionOptions;
    use crate::message::{Destination, Notification, OutgoingMessage};

    const ALICE: UserId = UserId::new(1000);

    fn connection(id: u64, options: ConnectionOptions) -> Arc<Connection> {
        Arc::new(Connection::new(
            ConnectionInfo {
                id: ConnectionId::new(id),
                user: ALICE,
                options,
            },
            &BusLimits::for_testing(),
        ))
    }

    fn broadcast_from(id: u64) -> Message {
        Message::from_outgoing(
            ConnectionId::new(id),
            Destination::Broadcast,
            OutgoingMessage::new(1),
        )
    }

    #[test]
    fn default_filter_follows_switches() {
        let filter = SubscriptionFilter;
        let listener = ConnectionInfo {
            id: ConnectionId::new(1),
            user: ALICE,
            options: ConnectionOptions::default(),
        };
        let watcher = ConnectionInfo {
            options: ConnectionOptions::default()
                .without_broadcasts()
                .with_id_changes(),
            ..listener
        };
        let id_add = Message::notification(
            Destination::Broadcast,
            Notification::IdAdd {
                id: ConnectionId::new(9),
            },
        );
        let timeout = Message::notification(
            Destination::Unicast(ConnectionId::new(1)),
            Notification::ReplyTimeout { cookie: 4 },
        );

        assert!(filter.accepts(&listener, &broadcast_from(2)));
        assert!(!filter.accepts(&watcher, &broadcast_from(2)));
        assert!(!filter.accepts(&listener, &id_add));
        assert!(filter.accepts(&watcher, &id_add));
        assert!(!filter.accepts(&watcher, &timeout));
    }

    #[test]
    fn sender_is_excluded() {
        let recipients: Vec<_> = (1..=3)
            .map(|id| connection(id, ConnectionOptions::default()))
            .collect();
        let fanout = dispatch(
            &recipients,
            ConnectionId::new(2),
            &broadcast_from(2),
            Some(ALICE),
            &SubscriptionFilter,
            Instant::now(),
        );
        assert_eq!(
            fanout,
            Fanout {
                delivered: 2,
                dropped: 0,
            }
        );
        assert_eq!(recipients[1].stats().queue_depth, 0);
        assert_eq!(recipients[0].stats().queue_depth, 1);
    }

    #[test]
    fn full_recipient_drops_without_affecting_others() {
        let full = connection(1, ConnectionOptions::default());
        let open = connection(2, ConnectionOptions::default());
        let limits = BusLimits::for_testing();
        for _ in 0..limits.max_queued_messages {
            full.lock()
                .enqueue(broadcast_from(9), None, Instant::now())
                .unwrap();
        }

        let recipients = vec![Arc::clone(&full), Arc::clone(&open)];
        let fanout = dispatch(
            &recipients,
            ConnectionId::new(3),
            &broadcast_from(3),
            Some(ALICE),
            &SubscriptionFilter,
            Instant::now(),
        );
        assert_eq!(fanout.delivered, 1);
        assert_eq!(fanout.dropped, 1);
        assert_eq!(full.stats().dropped, 1);
        assert_eq!(full.stats().queue_depth, limits.max_queued_messages);
        assert_eq!(open.stats().queue_depth, 1);
    }
}
