//! Mailbox and quota-accounting engine for an in-process message bus.
//!
//! Connections exchange messages through per-connection mailboxes. Every
//! send is admitted against three independent budgets of the destination:
//!
//! - a **quota ledger** bounding queued messages, with a per-user fair share
//!   once the mailbox is past its unaccounted window
//! - a **pool** holding the message bytes until the receiver releases them
//! - the sender's **pending counter** when the message expects a reply
//!
//! Admission is all-or-nothing: a rejected send leaves every structure as it
//! was.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use kbus_core::{
//!     Bus, BusLimits, ConnectionOptions, Destination, OutgoingMessage, ReceiveMode, UserId,
//! };
//!
//! let bus = Bus::new(BusLimits::default()).unwrap();
//! let client = bus.create_connection(UserId::new(1000), ConnectionOptions::default());
//! let server = bus.create_connection(UserId::new(1001), ConnectionOptions::default());
//!
//! bus.send(
//!     client,
//!     Destination::Unicast(server),
//!     OutgoingMessage::new(7)
//!         .with_payload(&b"ping"[..])
//!         .expecting_reply(Duration::from_secs(1)),
//! )
//! .unwrap();
//!
//! let request = bus.receive(server, ReceiveMode::Fifo).unwrap();
//! assert_eq!(&bus.read_payload(server, request.offset).unwrap()[..], b"ping");
//! bus.release_payload(server, request.offset).unwrap();
//!
//! bus.reply(server, client, 7, OutgoingMessage::new(1).with_payload(&b"pong"[..]))
//!     .unwrap();
//! let answer = bus.receive(client, ReceiveMode::Fifo).unwrap();
//! assert_eq!(answer.message.cookie_reply, 7);
//! ```

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod pending;
pub mod pool;
pub mod quota;

pub use broadcast::{Fanout, RecipientFilter, SubscriptionFilter};
pub use bus::Bus;
pub use config::{BusConfig, BusLimits, ConfigError};
pub use connection::{ConnectionInfo, ConnectionOptions, ConnectionStats, ReceiveMode, Received};
pub use error::{BusError, BusResult};
pub use message::{ConnectionId, Destination, Message, Notification, OutgoingMessage, UserId};
pub use pool::PoolOffset;
