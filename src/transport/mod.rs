//! Transport seam over the AMQP wire library.
//!
//! Core logic never touches the wire crate directly; it talks to these
//! traits so tests can drive a mock and the binding can be swapped. The
//! surface is exactly what the client needs from AMQP 0-9-1: connect with a
//! status callback, channel operations, consumer streams, and
//! returned-message notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;

/// Wire-level operation failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("channel operation failed: {0}")]
    Channel(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("close failed: {0}")]
    Close(String),
}

/// Connection-status events reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// TCP established, handshake still in progress
    Connected,
    /// Handshake complete; channel operations will be accepted
    Ready,
    /// Connection lost; the transport retries on its own timer
    Disconnected,
    /// Unrecoverable failure
    Failed,
    /// Closed at our request
    Closed,
}

/// Callback for connection-status events
pub type StatusCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// A message the broker handed back as undeliverable
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    /// Return reason, e.g. `NO_ROUTE`, `NO_CONSUMERS`, `ACCESS_REFUSED`
    pub reply_text: String,
    pub body: Vec<u8>,
}

/// Callback for returned messages
pub type ReturnCallback = Arc<dyn Fn(ReturnedMessage) + Send + Sync>;

/// One inbound consumer delivery
#[derive(Debug, Clone)]
pub struct TransportDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Settings forwarded to the wire library on connect
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub vhost: String,
    /// Forbid broker connection redirection
    pub insist: bool,
    /// Seconds between transport heartbeats; `None` disables
    pub heartbeat: Option<u16>,
    /// Delay between reconnect attempts, drawn once per connect
    pub reconnect_delay: Duration,
}

/// AMQP exchange types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

/// Declaration flags shared by queues and exchanges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareFlags {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub passive: bool,
}

/// Per-publish wire flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub routing_key: String,
    pub persistent: bool,
    /// Ask the broker to return the message if it cannot route it
    pub mandatory: bool,
    pub immediate: bool,
}

/// Factory for broker connections
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a connection and allocate its channel. The status callback is
    /// installed before any event can fire; `Ready` is emitted once the
    /// handshake completes, and again after every transparent reconnect.
    async fn connect(
        &self,
        settings: ConnectSettings,
        status: StatusCallback,
    ) -> Result<Arc<dyn TransportChannel>, TransportError>;
}

/// The opaque per-connection channel handle
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Install the returned-message callback; survives reconnects
    fn on_return(&self, callback: ReturnCallback);

    /// Apply the unacked-message window; 0 means unbounded
    async fn qos(&self, prefetch: u16) -> Result<(), TransportError>;

    async fn declare_queue(&self, name: &str, flags: DeclareFlags) -> Result<(), TransportError>;

    async fn declare_exchange(
        &self,
        kind: ExchangeType,
        name: &str,
        flags: DeclareFlags,
    ) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Start a consumer; deliveries arrive on the returned stream until the
    /// consumer is cancelled or the channel closes. Consumers are re-issued
    /// transparently after a reconnect.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<mpsc::Receiver<TransportDelivery>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        body: &[u8],
        flags: &PublishFlags,
    ) -> Result<(), TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Close the connection; resolves once the peer acknowledges
    async fn close(&self) -> Result<(), TransportError>;
}
