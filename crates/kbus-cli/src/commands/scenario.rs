//! `kbus scenario`: drive one admission rule against an in-process bus.
//!
//! | Scenario | Shows |
//! |----------|-------|
//! | `priority` | priority-bounded receive over a fixed sequence |
//! | `quota` | unaccounted window, per-user share, second user |
//! | `broadcast` | per-recipient drops, sender exclusion |
//! | `pending` | the open-request cap and its release by a reply |
//! | `pool` | pool exhaustion with maximal payloads and reuse |
//! | `notify` | peer notifications filling a watcher's queue |

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use kbus_core::{
    Bus, BusError, BusLimits, ConnectionId, ConnectionOptions, Destination, OutgoingMessage,
    ReceiveMode, UserId,
};
use tracing::info;

const PRIORITIES: [i64; 12] = [25, -600, 10, -35, -100, 20, -15, -800, -150, 10, -800, -10];
const THRESHOLDS: [i64; 6] = [-200, -100, -400, -400, 10, 10];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Arguments for `kbus scenario`.
#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Scenario to run
    #[arg(value_enum)]
    pub name: ScenarioName,
}

/// Built-in scenarios.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioName {
    /// Priority-bounded receive
    Priority,
    /// Per-user quota tiers
    Quota,
    /// Broadcast fan-out under pressure
    Broadcast,
    /// Pending-request cap
    Pending,
    /// Pool exhaustion and release
    Pool,
    /// Peer notifications
    Notify,
}

/// Runs the selected scenario on a fresh bus with `limits`.
pub fn run(limits: BusLimits, args: &ScenarioArgs) -> Result<()> {
    let bus = Bus::new(limits).context("invalid bus limits")?;
    info!(scenario = ?args.name, "running scenario");
    match args.name {
        ScenarioName::Priority => priority(&bus),
        ScenarioName::Quota => quota(&bus),
        ScenarioName::Broadcast => broadcast(&bus),
        ScenarioName::Pending => pending(&bus),
        ScenarioName::Pool => pool(&bus),
        ScenarioName::Notify => notify(&bus),
    }
}

fn connect(bus: &Bus, user: u32) -> ConnectionId {
    bus.create_connection(UserId::new(user), ConnectionOptions::default())
}

/// Sends plain messages until the destination refuses one.
fn fill(bus: &Bus, sender: ConnectionId, target: ConnectionId) -> (u64, BusError) {
    let mut accepted = 0;
    loop {
        match bus.send(
            sender,
            Destination::Unicast(target),
            OutgoingMessage::new(accepted + 1),
        ) {
            Ok(()) => accepted += 1,
            Err(err) => return (accepted, err),
        }
    }
}

fn priority(bus: &Bus) -> Result<()> {
    let reader = connect(bus, 0);
    // One sender per message keeps the sequence clear of per-user quota.
    for (n, priority) in (1u32..).zip(PRIORITIES) {
        let writer = connect(bus, n);
        bus.send(
            writer,
            Destination::Unicast(reader),
            OutgoingMessage::new(u64::from(n)).with_priority(priority),
        )
        .with_context(|| format!("failed to queue priority {priority}"))?;
    }
    println!("queued priorities {PRIORITIES:?}");

    for threshold in THRESHOLDS {
        match bus.receive(reader, ReceiveMode::Priority(threshold)) {
            Ok(received) => {
                println!(
                    "threshold {threshold:>5}: received priority {}",
                    received.message.priority
                );
                bus.release_payload(reader, received.offset)?;
            },
            Err(BusError::WouldBlock) => println!("threshold {threshold:>5}: would block"),
            Err(err) => return Err(err).context("priority receive failed"),
        }
    }
    Ok(())
}

fn quota(bus: &Bus) -> Result<()> {
    let limits = bus.limits();
    let reader = connect(bus, 0);

    let first = connect(bus, 1);
    let (accepted, err) = fill(bus, first, reader);
    println!(
        "user 1 queued {accepted} (window {} + share {}), then: {err} [{:?}]",
        limits.unaccounted_messages,
        limits.max_messages_per_user,
        err.errno()
    );

    let second = connect(bus, 2);
    let (accepted, err) = fill(bus, second, reader);
    println!("user 2 queued {accepted}, then: {err} [{:?}]", err.errno());

    let stats = bus
        .connection_stats(reader)
        .context("reader connection vanished")?;
    println!(
        "reader holds {} of {} messages",
        stats.queue_depth, limits.max_queued_messages
    );
    Ok(())
}

fn broadcast(bus: &Bus) -> Result<()> {
    let limits = bus.limits();
    let sender = connect(bus, 0);
    let busy = connect(bus, 1);
    let idle = connect(bus, 2);
    let deaf = bus.create_connection(
        UserId::new(3),
        ConnectionOptions::default().without_broadcasts(),
    );

    let (preloaded, _) = fill(bus, deaf, busy);
    println!("preloaded connection {busy} with {preloaded} messages");

    let rounds = limits.unaccounted_messages + limits.max_messages_per_user + 4;
    for cookie in (1u64..).take(rounds) {
        bus.send(sender, Destination::Broadcast, OutgoingMessage::new(cookie))
            .context("broadcast was rejected")?;
    }
    println!("sent {rounds} broadcasts from connection {sender}");

    for id in [busy, idle, deaf, sender] {
        let stats = bus.connection_stats(id).context("connection vanished")?;
        println!(
            "connection {id}: queued {}, dropped {}",
            stats.queue_depth, stats.dropped
        );
    }
    Ok(())
}

fn pending(bus: &Bus) -> Result<()> {
    let limits = bus.limits();
    let client = connect(bus, 0);
    let per_server = limits.unaccounted_messages.max(1);

    let mut servers = Vec::new();
    let mut remaining = limits.max_pending_requests;
    while remaining > 0 {
        let server = connect(bus, 1);
        let batch = remaining.min(per_server);
        for cookie in (1u64..).take(batch) {
            bus.send(
                client,
                Destination::Unicast(server),
                OutgoingMessage::new(cookie).expecting_reply(REQUEST_TIMEOUT),
            )
            .context("request rejected below the pending cap")?;
        }
        remaining -= batch;
        servers.push(server);
    }
    let stats = bus
        .connection_stats(client)
        .context("client connection vanished")?;
    println!(
        "{} requests open across {} servers",
        stats.pending_requests,
        servers.len()
    );

    let spare = connect(bus, 2);
    let request = || OutgoingMessage::new(1).expecting_reply(REQUEST_TIMEOUT);
    match bus.send(client, Destination::Unicast(spare), request()) {
        Err(err) => println!("next request: {err} [{:?}]", err.errno()),
        Ok(()) => bail!("a request beyond the pending cap was accepted"),
    }

    let answered = *servers.first().context("no server was created")?;
    bus.reply(answered, client, 1, OutgoingMessage::new(0))
        .context("reply was rejected")?;
    bus.send(client, Destination::Unicast(spare), request())
        .context("request after a reply was rejected")?;
    println!("after one reply: next request accepted");
    Ok(())
}

fn pool(bus: &Bus) -> Result<()> {
    let limits = bus.limits();
    let reader = connect(bus, 0);
    let writer = connect(bus, 1);
    let payload = vec![0x5a_u8; limits.max_payload_size];
    let send = |cookie: u64| {
        bus.send(
            writer,
            Destination::Unicast(reader),
            OutgoingMessage::new(cookie).with_payload(payload.clone()),
        )
    };

    let mut queued = 0;
    let err = loop {
        match send(queued + 1) {
            Ok(()) => queued += 1,
            Err(err) => break err,
        }
    };
    let stats = bus
        .connection_stats(reader)
        .context("reader connection vanished")?;
    println!(
        "queued {queued} payloads of {} bytes ({} of {} pool bytes), then: {err} [{:?}]",
        limits.max_payload_size,
        stats.pool_used,
        stats.pool_capacity,
        err.errno()
    );

    let received = bus
        .receive(reader, ReceiveMode::Fifo)
        .context("nothing was queued")?;
    match send(queued + 1) {
        Err(err) => println!("received but not released: {err}"),
        Ok(()) => println!("received but not released: accepted"),
    }
    bus.release_payload(reader, received.offset)
        .context("release failed")?;
    match send(queued + 2) {
        Ok(()) => println!("after release: accepted"),
        Err(err) => println!("after release: {err}"),
    }
    Ok(())
}

fn notify(bus: &Bus) -> Result<()> {
    let limits = bus.limits();
    let watcher = bus.create_connection(
        UserId::new(0),
        ConnectionOptions::default().with_id_changes(),
    );
    for _ in 0..=limits.max_queued_messages {
        connect(bus, 1);
    }

    let stats = bus
        .connection_stats(watcher)
        .context("watcher connection vanished")?;
    println!(
        "watcher queued {} notifications, dropped {}",
        stats.queue_depth, stats.dropped
    );
    let first = bus
        .receive(watcher, ReceiveMode::Fifo)
        .context("no notification was queued")?;
    println!(
        "first: {:?} from connection {}",
        first.message.notification, first.message.src_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_runs_with_test_limits() {
        for name in ScenarioName::value_variants() {
            let args = ScenarioArgs { name: *name };
            run(BusLimits::for_testing(), &args).unwrap();
        }
    }

    #[test]
    fn inconsistent_limits_are_reported() {
        let limits = BusLimits {
            max_pending_requests: 0,
            ..BusLimits::for_testing()
        };
        let args = ScenarioArgs {
            name: ScenarioName::Pending,
        };
        let err = run(limits, &args).unwrap_err();
        assert!(err.to_string().contains("invalid bus limits"));
    }
}
