//! Per-broker client: one AMQP connection with lifecycle, subscription
//! bookkeeping, and return-message wiring.

use std::sync::Arc;

use crate::error::HaResult;
use crate::protocol::{Packet, SerializeError};
use crate::transport::ExchangeType;

mod client;
mod status;

pub use client::BrokerClient;
pub use status::{status_for_event, transition_allowed, BrokerStatus};

/// What a subscription handler receives for each delivery
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Identity of the broker that delivered the message
    pub broker: String,
    pub message: Inbound,
    pub header: MessageHeader,
}

/// Decoded or raw message content
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Raw bytes; the subscription asked for no decoding or no serializer
    /// is configured
    Raw(Vec<u8>),
    Packet(Packet),
}

/// AMQP delivery header fields exposed to handlers
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Handler invoked for each accepted delivery
pub type SubscriptionHandler = Arc<dyn Fn(Envelope) -> HaResult<()> + Send + Sync>;

/// Hook invoked after every distinct status transition:
/// `(broker, was_connected_before)`
pub type UpdateStatusCallback = Arc<dyn Fn(&Arc<BrokerClient>, bool) + Send + Sync>;

/// Callback invoked when inbound bytes fail to decode
pub type ReceiveExceptionCallback = Arc<dyn Fn(&[u8], &SerializeError) + Send + Sync>;

/// Per-broker return notification: `(to, reason, message)`
pub type BrokerReturnCallback = Arc<dyn Fn(String, String, Vec<u8>) + Send + Sync>;

/// A declarable broker entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declarable {
    Queue,
    Exchange(ExchangeType),
}
