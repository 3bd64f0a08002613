//! hamqp - High-availability client for sets of AMQP 0-9-1 brokers
//!
//! Fronts a priority-ordered set of RabbitMQ-compatible brokers as one
//! logical endpoint. Client code publishes, subscribes, and declares
//! exchanges and queues against the aggregate; the client decides which
//! broker connection to use, maintains per-connection lifecycle (connect,
//! heartbeat, reconnect, close), re-routes undeliverable-message returns
//! to a peer broker, and reports aggregated connection status.
//!
//! # Overview
//!
//! - [`HaBrokerClient`] is the public surface: publish, subscribe, declare,
//!   delete, close, connection-status watchers, non-delivery callback.
//! - One [`broker::BrokerClient`] per configured address owns its AMQP
//!   connection and tracks subscriptions and failure counters.
//! - Returned messages are matched to their publish context through an
//!   age-bounded LRU cache ([`cache::PublishedCache`]) and republished to a
//!   remaining connected broker.
//!
//! # Quick start
//!
//! ```
//! use hamqp::address;
//! use hamqp::protocol::Packet;
//! use serde_json::json;
//!
//! // Two brokers, priority order b0 then b1
//! let addresses = address::addresses(Some("broker0,broker1"), Some("5672")).unwrap();
//! assert_eq!(addresses[0].identity(), "rs-broker-broker0-5672");
//! assert_eq!(addresses[1].alias(), "b1");
//!
//! // The unit of publication
//! let packet = Packet::new("Request", json!({"method": "list"})).with_token("abc");
//! assert_eq!(packet.kind, "Request");
//! ```

pub mod address;
pub mod barrier;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod ha;
pub mod observability;
pub mod protocol;
pub mod stats;
pub mod testing;
pub mod transport;

pub use broker::{BrokerClient, BrokerStatus, Envelope, Inbound, SubscriptionHandler};
pub use config::{
    ExchangeSpec, HaClientOptions, PublishOptions, QueueSpec, SelectionOrder, SubscribeOptions,
};
pub use error::{HaClientError, HaResult};
pub use ha::{
    Boundary, ConnectionStatus, HaBrokerClient, HaCallbacks, NonDelivery, StatusWatcherOptions,
};
pub use protocol::{JsonSerializer, Packet, PacketSerializer};
