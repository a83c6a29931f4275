//! End-to-end message flow through the public `Bus` API: unicast, priority
//! receive, broadcast fan-out, argument validation and pool release.

use std::time::Duration;

use kbus_core::{
    Bus, BusError, BusLimits, ConnectionId, ConnectionInfo, ConnectionOptions, Destination,
    Message, OutgoingMessage, ReceiveMode, RecipientFilter, UserId,
};

const ALICE: UserId = UserId::new(1000);
const BOB: UserId = UserId::new(1001);

fn pair(limits: BusLimits) -> (Bus, ConnectionId, ConnectionId) {
    let bus = Bus::new(limits).unwrap();
    let a = bus.create_connection(ALICE, ConnectionOptions::default());
    let b = bus.create_connection(BOB, ConnectionOptions::default());
    (bus, a, b)
}

#[test]
fn unicast_delivers_payload_in_order() {
    let (bus, a, b) = pair(BusLimits::for_testing());
    for (cookie, body) in [(1, "first"), (2, "second")] {
        bus.send(
            a,
            Destination::Unicast(b),
            OutgoingMessage::new(cookie).with_payload(body.as_bytes().to_vec()),
        )
        .unwrap();
    }

    let first = bus.receive(b, ReceiveMode::Fifo).unwrap();
    assert_eq!(first.message.cookie, 1);
    assert_eq!(first.message.src_id, a);
    assert_eq!(first.message.dst, Destination::Unicast(b));
    assert_eq!(&bus.read_payload(b, first.offset).unwrap()[..], b"first");

    let second = bus.receive(b, ReceiveMode::Fifo).unwrap();
    assert_eq!(&bus.read_payload(b, second.offset).unwrap()[..], b"second");
    assert_eq!(bus.receive(b, ReceiveMode::Fifo), Err(BusError::WouldBlock));
}

#[test]
fn priority_receive_selects_most_urgent_within_threshold() {
    let (bus, a, b) = pair(BusLimits::default());
    let priorities = [25, -600, 10, -35, -100, 20, -15, -800, -150, 10, -800, -10];
    for (i, priority) in priorities.into_iter().enumerate() {
        bus.send(
            a,
            Destination::Unicast(b),
            OutgoingMessage::new(i as u64 + 1).with_priority(priority),
        )
        .unwrap();
    }

    let take = |threshold| {
        bus.receive(b, ReceiveMode::Priority(threshold))
            .map(|received| (received.message.priority, received.message.cookie))
    };
    assert_eq!(take(-200), Ok((-800, 8)));
    assert_eq!(take(-100), Ok((-800, 11)));
    assert_eq!(take(-400), Ok((-600, 2)));
    assert_eq!(take(-400), Err(BusError::WouldBlock));
    assert_eq!(take(10), Ok((-150, 9)));
    assert_eq!(take(10), Ok((-100, 5)));

    // Plain receive still sees the untouched arrival order.
    let head = bus.receive(b, ReceiveMode::Fifo).unwrap();
    assert_eq!(head.message.priority, 25);
    assert_eq!(bus.connection_stats(b).unwrap().queue_depth, 6);
}

#[test]
fn peek_and_drop_next() {
    let (bus, a, b) = pair(BusLimits::for_testing());
    bus.send(a, Destination::Unicast(b), OutgoingMessage::new(3))
        .unwrap();
    bus.send(a, Destination::Unicast(b), OutgoingMessage::new(4))
        .unwrap();

    assert_eq!(bus.peek(b).unwrap().cookie, 3);
    assert_eq!(bus.peek(b).unwrap().cookie, 3);
    assert_eq!(bus.drop_next(b).unwrap().cookie, 3);
    assert_eq!(bus.receive(b, ReceiveMode::Fifo).unwrap().message.cookie, 4);
    assert_eq!(bus.peek(b), Err(BusError::WouldBlock));
    assert_eq!(bus.drop_next(b), Err(BusError::WouldBlock));
}

#[test]
fn release_is_exactly_once() {
    let (bus, a, b) = pair(BusLimits::for_testing());
    bus.send(
        a,
        Destination::Unicast(b),
        OutgoingMessage::new(1).with_payload(vec![7u8; 100]),
    )
    .unwrap();
    let received = bus.receive(b, ReceiveMode::Fifo).unwrap();
    assert!(bus.connection_stats(b).unwrap().pool_used > 0);

    bus.release_payload(b, received.offset).unwrap();
    assert_eq!(bus.connection_stats(b).unwrap().pool_used, 0);
    assert_eq!(
        bus.release_payload(b, received.offset),
        Err(BusError::InvalidOffset {
            connection: b,
            offset: received.offset,
        })
    );
    assert!(matches!(
        bus.read_payload(b, received.offset),
        Err(BusError::InvalidOffset { .. })
    ));
    assert_eq!(bus.connection_stats(b).unwrap().pool_used, 0);
}

#[test]
fn queued_message_cannot_be_released_before_receive() {
    let (bus, a, b) = pair(BusLimits::for_testing());
    bus.send(a, Destination::Unicast(b), OutgoingMessage::new(1))
        .unwrap();
    bus.send(a, Destination::Unicast(b), OutgoingMessage::new(2))
        .unwrap();
    let first = bus.receive(b, ReceiveMode::Fifo).unwrap();
    bus.release_payload(b, first.offset).unwrap();

    // The freed hole is reused by the next message; until that one is
    // received its slice belongs to the bus.
    bus.send(a, Destination::Unicast(b), OutgoingMessage::new(3))
        .unwrap();
    assert!(matches!(
        bus.release_payload(b, first.offset),
        Err(BusError::InvalidOffset { .. })
    ));
    assert_eq!(bus.connection_stats(b).unwrap().queue_depth, 2);
}

mod validation {
    use super::*;

    #[test]
    fn reply_expectation_needs_cookie_and_timeout() {
        let (bus, a, b) = pair(BusLimits::for_testing());
        let before_a = bus.connection_stats(a).unwrap();
        let before_b = bus.connection_stats(b).unwrap();

        let zero_cookie = OutgoingMessage::new(0).expecting_reply(Duration::from_secs(1));
        let zero_timeout = OutgoingMessage::new(5).expecting_reply(Duration::ZERO);
        for message in [zero_cookie, zero_timeout] {
            let err = bus
                .send(a, Destination::Unicast(b), message)
                .unwrap_err();
            assert!(matches!(err, BusError::InvalidArgs { .. }));
            assert_eq!(err.errno(), nix::errno::Errno::EINVAL);
        }

        assert_eq!(bus.connection_stats(a).unwrap(), before_a);
        assert_eq!(bus.connection_stats(b).unwrap(), before_b);
    }

    #[test]
    fn broadcast_cannot_expect_reply() {
        let (bus, a, b) = pair(BusLimits::for_testing());
        let err = bus
            .send(
                a,
                Destination::Broadcast,
                OutgoingMessage::new(9).expecting_reply(Duration::from_secs(1)),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidArgs { .. }));
        assert_eq!(bus.connection_stats(b).unwrap().queue_depth, 0);
    }

    #[test]
    fn repeated_cookie_is_tracked_per_request() {
        let (bus, a, b) = pair(BusLimits::for_testing());
        let request = || OutgoingMessage::new(11).expecting_reply(Duration::from_secs(5));
        bus.send(a, Destination::Unicast(b), request()).unwrap();
        bus.send(a, Destination::Unicast(b), request()).unwrap();
        assert_eq!(bus.connection_stats(a).unwrap().pending_requests, 2);
        assert_eq!(bus.connection_stats(b).unwrap().reply_slots, 2);

        for remaining in [1, 0] {
            bus.reply(b, a, 11, OutgoingMessage::new(0)).unwrap();
            assert_eq!(bus.connection_stats(a).unwrap().pending_requests, remaining);
            assert_eq!(bus.connection_stats(b).unwrap().reply_slots, remaining);
        }
        assert!(matches!(
            bus.reply(b, a, 11, OutgoingMessage::new(0)),
            Err(BusError::NotPermitted { .. })
        ));
    }

    #[test]
    fn forged_reply_is_not_permitted() {
        let bus = Bus::new(BusLimits::for_testing()).unwrap();
        let client = bus.create_connection(ALICE, ConnectionOptions::default());
        let server = bus.create_connection(BOB, ConnectionOptions::default());
        let intruder = bus.create_connection(BOB, ConnectionOptions::default());

        // Never requested at all.
        let err = bus
            .reply(server, client, 99, OutgoingMessage::new(1))
            .unwrap_err();
        assert_eq!(
            err,
            BusError::NotPermitted {
                replier: server,
                requester: client,
                cookie: 99,
            }
        );
        assert_eq!(err.errno(), nix::errno::Errno::EPERM);

        // Requested of someone else.
        bus.send(
            client,
            Destination::Unicast(server),
            OutgoingMessage::new(99).expecting_reply(Duration::from_secs(1)),
        )
        .unwrap();
        assert!(matches!(
            bus.reply(intruder, client, 99, OutgoingMessage::new(1)),
            Err(BusError::NotPermitted { .. })
        ));
        assert_eq!(bus.connection_stats(client).unwrap().queue_depth, 0);
        assert_eq!(bus.connection_stats(client).unwrap().pending_requests, 1);

        // A plain message does not open a request.
        bus.send(client, Destination::Unicast(intruder), OutgoingMessage::new(5))
            .unwrap();
        assert!(matches!(
            bus.reply(intruder, client, 5, OutgoingMessage::new(1)),
            Err(BusError::NotPermitted { .. })
        ));
    }
}

mod broadcast {
    use super::*;

    #[test]
    fn sender_never_receives_its_own_broadcast() {
        let bus = Bus::new(BusLimits::for_testing()).unwrap();
        let ids: Vec<_> = (0..4)
            .map(|_| bus.create_connection(ALICE, ConnectionOptions::default()))
            .collect();

        bus.send(ids[0], Destination::Broadcast, OutgoingMessage::new(1))
            .unwrap();

        assert_eq!(
            bus.receive(ids[0], ReceiveMode::Fifo),
            Err(BusError::WouldBlock)
        );
        for &id in &ids[1..] {
            let received = bus.receive(id, ReceiveMode::Fifo).unwrap();
            assert_eq!(received.message.src_id, ids[0]);
            assert_eq!(received.message.dst, Destination::Broadcast);
        }
    }

    #[test]
    fn unsubscribed_connections_are_skipped() {
        let bus = Bus::new(BusLimits::for_testing()).unwrap();
        let sender = bus.create_connection(ALICE, ConnectionOptions::default());
        let deaf = bus.create_connection(BOB, ConnectionOptions::default().without_broadcasts());
        let listener = bus.create_connection(BOB, ConnectionOptions::default());

        bus.send(sender, Destination::Broadcast, OutgoingMessage::new(1))
            .unwrap();
        assert_eq!(bus.connection_stats(deaf).unwrap().queue_depth, 0);
        assert_eq!(bus.connection_stats(deaf).unwrap().dropped, 0);
        assert_eq!(bus.connection_stats(listener).unwrap().queue_depth, 1);

        // Unicast ignores the broadcast switch.
        bus.send(sender, Destination::Unicast(deaf), OutgoingMessage::new(2))
            .unwrap();
        assert_eq!(bus.connection_stats(deaf).unwrap().queue_depth, 1);
    }

    /// Delivers broadcasts only to connections of one user.
    #[derive(Debug)]
    struct SameUser(UserId);

    impl RecipientFilter for SameUser {
        fn accepts(&self, recipient: &ConnectionInfo, message: &Message) -> bool {
            message.notification.is_none() && recipient.user == self.0
        }
    }

    #[test]
    fn custom_filter_selects_recipients() {
        let bus = Bus::with_filter(BusLimits::for_testing(), SameUser(BOB)).unwrap();
        let sender = bus.create_connection(ALICE, ConnectionOptions::default());
        let peer = bus.create_connection(ALICE, ConnectionOptions::default());
        let deaf_bob =
            bus.create_connection(BOB, ConnectionOptions::default().without_broadcasts());
        let watcher = bus.create_connection(BOB, ConnectionOptions::default().with_id_changes());

        bus.send(sender, Destination::Broadcast, OutgoingMessage::new(7))
            .unwrap();

        // The filter replaces the subscription switches entirely.
        assert_eq!(bus.connection_stats(peer).unwrap().queue_depth, 0);
        assert_eq!(bus.receive(deaf_bob, ReceiveMode::Fifo).unwrap().message.cookie, 7);
        assert_eq!(bus.receive(watcher, ReceiveMode::Fifo).unwrap().message.cookie, 7);
        assert_eq!(
            bus.receive(watcher, ReceiveMode::Fifo),
            Err(BusError::WouldBlock)
        );
    }

    #[test]
    fn broadcast_with_no_recipients_succeeds() {
        let bus = Bus::new(BusLimits::for_testing()).unwrap();
        let alone = bus.create_connection(ALICE, ConnectionOptions::default());
        assert_eq!(
            bus.send(alone, Destination::Broadcast, OutgoingMessage::new(1)),
            Ok(())
        );
    }
}
