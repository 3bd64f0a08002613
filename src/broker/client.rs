//! Impure I/O side of the per-broker client.
//!
//! One [`BrokerClient`] exclusively owns one transport connection and its
//! channel handle. Status transitions are driven by transport events
//! through the pure rules in [`super::status`]; every distinct transition
//! fires the update-status callback exactly once. Operational faults are
//! caught at method boundaries, tracked, and folded into a `false` return.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::status::{self, BrokerStatus};
use super::{
    BrokerReturnCallback, Declarable, Envelope, Inbound, MessageHeader, ReceiveExceptionCallback,
    SubscriptionHandler, UpdateStatusCallback,
};
use crate::address::BrokerAddress;
use crate::config::{ExchangeSpec, HaClientOptions, PublishOptions, QueueSpec, SubscribeOptions};
use crate::error::{ExceptionTracker, HaClientError};
use crate::protocol::{Packet, PacketSerializer};
use crate::stats::{ActivityCounter, BrokerStats, BrokerSummary};
use crate::transport::{
    BrokerTransport, ConnectSettings, DeclareFlags, PublishFlags, StatusCallback,
    TransportChannel, TransportDelivery, TransportEvent,
};

/// Legacy three-byte payload historically used as an empty-message marker
const NIL_SENTINEL: &[u8] = b"nil";

/// Client for one broker in the set
pub struct BrokerClient {
    address: BrokerAddress,
    identity: String,
    alias: String,
    options: HaClientOptions,
    serializer: Option<Arc<dyn PacketSerializer>>,
    transport: Arc<dyn BrokerTransport>,
    exceptions: Arc<ExceptionTracker>,
    state: Mutex<ClientState>,
    update_status_cb: Mutex<Option<UpdateStatusCallback>>,
    receive_exception_cb: Mutex<Option<ReceiveExceptionCallback>>,
    return_cb: Mutex<Option<BrokerReturnCallback>>,
}

struct ClientState {
    status: BrokerStatus,
    channel: Option<Arc<dyn TransportChannel>>,
    /// Subscribed queue name to consumer tag
    queues: HashMap<String, String>,
    last_failed: bool,
    retries: u32,
    disconnects: ActivityCounter,
    failures: ActivityCounter,
}

impl BrokerClient {
    /// Build a client in `connecting` status; `connect` performs the dial
    pub fn new(
        address: BrokerAddress,
        options: HaClientOptions,
        serializer: Option<Arc<dyn PacketSerializer>>,
        transport: Arc<dyn BrokerTransport>,
        exceptions: Arc<ExceptionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: address.identity(),
            alias: address.alias(),
            address,
            options,
            serializer,
            transport,
            exceptions,
            state: Mutex::new(ClientState {
                status: BrokerStatus::Connecting,
                channel: None,
                queues: HashMap::new(),
                last_failed: false,
                retries: 0,
                disconnects: ActivityCounter::new(),
                failures: ActivityCounter::new(),
            }),
            update_status_cb: Mutex::new(None),
            receive_exception_cb: Mutex::new(None),
            return_cb: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    pub fn index(&self) -> u16 {
        self.address.index
    }

    pub fn status(&self) -> BrokerStatus {
        self.state.lock().unwrap().status
    }

    /// Usable brokers accept subscriptions and declarations
    pub fn usable(&self) -> bool {
        self.status().usable()
    }

    pub fn connected(&self) -> bool {
        self.status() == BrokerStatus::Connected
    }

    pub fn failed(&self) -> bool {
        self.status() == BrokerStatus::Failed
    }

    /// Names of queues with a live subscription
    pub fn subscribed_queues(&self) -> Vec<String> {
        self.state.lock().unwrap().queues.keys().cloned().collect()
    }

    pub fn is_subscribed(&self, queue: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(queue)
    }

    /// Install the per-transition hook the coordinator aggregates through
    pub fn set_update_status_callback(&self, callback: UpdateStatusCallback) {
        *self.update_status_cb.lock().unwrap() = Some(callback);
    }

    /// Install the decode-failure callback
    pub fn set_receive_exception_callback(&self, callback: ReceiveExceptionCallback) {
        *self.receive_exception_cb.lock().unwrap() = Some(callback);
    }

    /// Open the underlying connection and allocate the channel.
    ///
    /// The reconnect delay handed to the transport is drawn uniformly from
    /// `[0, reconnect_interval)` so a restarted broker is not stormed by
    /// every client at once.
    pub async fn connect(self: &Arc<Self>) -> bool {
        let settings = ConnectSettings {
            host: self.address.host.clone(),
            port: self.address.port,
            user: self.options.resolved_user(),
            pass: self.options.resolved_pass(),
            vhost: self.options.vhost.clone(),
            insist: self.options.insist,
            heartbeat: self.options.effective_heartbeat(),
            reconnect_delay: draw_reconnect_delay(self.options.reconnect_interval()),
        };

        let weak = Arc::downgrade(self);
        let status_cb: StatusCallback = Arc::new(move |event| {
            if let Some(client) = weak.upgrade() {
                client.transport_event(event);
            }
        });

        match self.transport.connect(settings, status_cb).await {
            Ok(channel) => {
                if let Some(prefetch) = self.options.effective_prefetch() {
                    if let Err(error) = channel.qos(prefetch).await {
                        self.exceptions.track("connect", &error.into());
                        let _ = channel.close().await;
                        self.update_status(BrokerStatus::Failed);
                        return false;
                    }
                }
                self.state.lock().unwrap().channel = Some(channel.clone());
                self.install_return(&channel);
                true
            }
            Err(error) => {
                self.exceptions.track("connect", &error.into());
                self.update_status(BrokerStatus::Failed);
                false
            }
        }
    }

    fn transport_event(self: &Arc<Self>, event: TransportEvent) {
        if let Some(to) = status::status_for_event(event) {
            self.update_status(to);
        }
    }

    /// Apply a status transition, firing the update-status callback once
    /// per distinct transition. Disallowed transitions (terminal states,
    /// re-entry) are silent no-ops.
    pub fn update_status(self: &Arc<Self>, to: BrokerStatus) {
        self.apply_status(to, true);
    }

    fn apply_status(self: &Arc<Self>, to: BrokerStatus, notify: bool) {
        let was_connected = {
            let mut state = self.state.lock().unwrap();
            let from = state.status;
            if !status::transition_allowed(from, to) {
                return;
            }
            state.status = to;
            match to {
                BrokerStatus::Connected => {
                    state.last_failed = false;
                    state.retries = 0;
                }
                BrokerStatus::Failed => {
                    if state.last_failed {
                        state.retries += 1;
                    } else {
                        state.last_failed = true;
                        state.retries = 0;
                        state.failures.update();
                    }
                }
                BrokerStatus::Disconnected => {
                    state.disconnects.update();
                }
                _ => {}
            }
            info!(
                identity = %self.identity,
                alias = %self.alias,
                from = %from,
                to = %to,
                "broker status changed"
            );
            from == BrokerStatus::Connected
        };

        if notify {
            let callback = self.update_status_cb.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(self, was_connected);
            }
        }
    }

    /// Declare the queue (and exchanges), install a consumer, and start
    /// delivering to the handler. Returns true when the subscription is
    /// live or already existed; false when the broker is not usable or an
    /// operation failed.
    pub async fn subscribe(
        self: &Arc<Self>,
        queue: &QueueSpec,
        exchange: Option<&ExchangeSpec>,
        options: &SubscribeOptions,
        handler: SubscriptionHandler,
    ) -> bool {
        let channel = {
            let state = self.state.lock().unwrap();
            if !state.status.usable() {
                debug!(identity = %self.identity, queue = %queue.name, "not usable, skipping subscribe");
                return false;
            }
            if state.queues.contains_key(&queue.name) {
                debug!(identity = %self.identity, queue = %queue.name, "already subscribed");
                return true;
            }
            match state.channel.clone() {
                Some(channel) => channel,
                None => {
                    debug!(identity = %self.identity, queue = %queue.name, "no channel yet");
                    return false;
                }
            }
        };

        match self
            .establish_subscription(&channel, queue, exchange, options, handler)
            .await
        {
            Ok(consumer_tag) => {
                if !options.no_log {
                    info!(identity = %self.identity, queue = %queue.name, "subscribed");
                }
                self.state
                    .lock()
                    .unwrap()
                    .queues
                    .insert(queue.name.clone(), consumer_tag);
                true
            }
            Err(error) => {
                self.exceptions.track("subscribe", &error);
                false
            }
        }
    }

    async fn establish_subscription(
        self: &Arc<Self>,
        channel: &Arc<dyn TransportChannel>,
        queue: &QueueSpec,
        exchange: Option<&ExchangeSpec>,
        options: &SubscribeOptions,
        handler: SubscriptionHandler,
    ) -> Result<String, HaClientError> {
        if !options.no_declare {
            channel.declare_queue(&queue.name, queue.flags).await?;
        }

        let binding_key = options.key.as_deref().unwrap_or(&queue.name);
        for spec in exchange.into_iter().chain(options.exchange2.as_ref()) {
            if !options.no_declare {
                channel
                    .declare_exchange(spec.kind, &spec.name, spec.flags)
                    .await?;
            }
            channel
                .bind_queue(&queue.name, &spec.name, binding_key)
                .await?;
        }

        let consumer_tag = format!("{}-{}", queue.name, Uuid::new_v4());
        let receiver = channel
            .consume(&queue.name, &consumer_tag, !options.ack)
            .await?;
        self.spawn_consumer(channel.clone(), receiver, options.clone(), handler);
        Ok(consumer_tag)
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        channel: Arc<dyn TransportChannel>,
        mut receiver: mpsc::Receiver<TransportDelivery>,
        options: SubscribeOptions,
        handler: SubscriptionHandler,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let Some(client) = weak.upgrade() else { break };
                client
                    .handle_delivery(&channel, delivery, &options, &handler)
                    .await;
            }
        });
    }

    async fn handle_delivery(
        self: &Arc<Self>,
        channel: &Arc<dyn TransportChannel>,
        delivery: TransportDelivery,
        options: &SubscribeOptions,
        handler: &SubscriptionHandler,
    ) {
        // Acknowledge before the handler runs: biases toward at-most-once
        // under crash, at the cost of possible loss
        if options.ack {
            if let Err(error) = channel.ack(delivery.delivery_tag).await {
                self.exceptions.track("receive", &error.into());
            }
        }

        if delivery.body.as_slice() == NIL_SENTINEL {
            debug!(identity = %self.identity, "ignoring nil sentinel message");
            return;
        }

        let header = MessageHeader {
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };

        let serializer = match (&self.serializer, options.no_unserialize) {
            (Some(serializer), false) => Some(serializer.clone()),
            _ => None,
        };

        match serializer {
            None => {
                let envelope = Envelope {
                    broker: self.identity.clone(),
                    message: Inbound::Raw(delivery.body),
                    header,
                };
                if let Err(error) = handler(envelope) {
                    self.exceptions
                        .track("receive", &HaClientError::Handler(error.to_string()));
                }
            }
            Some(serializer) => match serializer.decode(&delivery.body) {
                Ok(packet) => {
                    if !options.allows(&packet.kind) {
                        warn!(
                            identity = %self.identity,
                            kind = %packet.kind,
                            "dropping packet of unexpected kind"
                        );
                        return;
                    }
                    if !options.no_log {
                        info!(
                            identity = %self.identity,
                            kind = %packet.kind,
                            token = ?packet.token,
                            "RECV"
                        );
                    }
                    let envelope = Envelope {
                        broker: self.identity.clone(),
                        message: Inbound::Packet(packet),
                        header,
                    };
                    if let Err(error) = handler(envelope) {
                        self.exceptions
                            .track("receive", &HaClientError::Handler(error.to_string()));
                    }
                }
                Err(error) => {
                    let callback = self.receive_exception_cb.lock().unwrap().clone();
                    if let Some(callback) = callback {
                        callback(&delivery.body, &error);
                    }
                    self.exceptions
                        .track("receive", &HaClientError::Serialize(error));
                }
            },
        }
    }

    /// Publish an already-serialized message through the exchange. Returns
    /// false unless this broker is `connected`.
    pub async fn publish(
        &self,
        exchange: &ExchangeSpec,
        packet: &Packet,
        message: &[u8],
        options: &PublishOptions,
    ) -> bool {
        let channel = {
            let state = self.state.lock().unwrap();
            if state.status != BrokerStatus::Connected {
                return false;
            }
            match state.channel.clone() {
                Some(channel) => channel,
                None => return false,
            }
        };

        if options.declare {
            if let Err(error) = channel
                .declare_exchange(exchange.kind, &exchange.name, exchange.flags)
                .await
            {
                self.exceptions.track("publish", &error.into());
                return false;
            }
        }

        if !options.no_log {
            let verb = if packet.tries.is_empty() {
                "SEND"
            } else {
                "RE-SEND"
            };
            info!(
                identity = %self.identity,
                kind = %packet.kind,
                token = ?packet.token,
                exchange = %exchange.name,
                "{verb}"
            );
        }

        let flags = PublishFlags {
            routing_key: options.routing_key.clone().unwrap_or_default(),
            persistent: options.persistent,
            mandatory: options.mandatory,
            immediate: options.immediate,
        };
        match channel.publish(&exchange.name, message, &flags).await {
            Ok(()) => true,
            Err(error) => {
                self.exceptions.track("publish", &error.into());
                false
            }
        }
    }

    /// Force a fresh declaration of a queue or exchange. The passive flag
    /// is stripped so the declaration always creates.
    pub async fn declare(&self, target: Declarable, name: &str, flags: DeclareFlags) -> bool {
        let channel = {
            let state = self.state.lock().unwrap();
            if !state.status.usable() {
                return false;
            }
            match state.channel.clone() {
                Some(channel) => channel,
                None => return false,
            }
        };

        let flags = DeclareFlags {
            passive: false,
            ..flags
        };
        let result = match target {
            Declarable::Queue => channel.declare_queue(name, flags).await,
            Declarable::Exchange(kind) => channel.declare_exchange(kind, name, flags).await,
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                self.exceptions.track("declare", &error.into());
                false
            }
        }
    }

    /// Delete a queue broker-side, dropping any local subscription to it.
    /// Unknown queues are declared first so a NOT_FOUND cannot close the
    /// channel.
    pub async fn delete(&self, name: &str) -> bool {
        let (channel, known) = {
            let mut state = self.state.lock().unwrap();
            let known = state.queues.remove(name).is_some();
            (state.channel.clone(), known)
        };
        let Some(channel) = channel else { return false };

        let result = if known {
            channel.delete_queue(name).await
        } else {
            match channel.declare_queue(name, DeclareFlags::default()).await {
                Ok(()) => channel.delete_queue(name).await,
                Err(error) => Err(error),
            }
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                self.exceptions.track("delete", &error.into());
                false
            }
        }
    }

    /// Cancel the consumers for the named queues. Unknown queues are a
    /// silent no-op.
    pub async fn unsubscribe(&self, queues: &[String]) -> bool {
        let (channel, cancelled) = {
            let mut state = self.state.lock().unwrap();
            let cancelled: Vec<(String, String)> = queues
                .iter()
                .filter_map(|name| {
                    state
                        .queues
                        .remove(name)
                        .map(|tag| (name.clone(), tag))
                })
                .collect();
            (state.channel.clone(), cancelled)
        };

        for (queue, consumer_tag) in cancelled {
            if let Some(channel) = &channel {
                if let Err(error) = channel.cancel_consumer(&consumer_tag).await {
                    self.exceptions.track("unsubscribe", &error.into());
                }
            }
            info!(identity = %self.identity, queue = %queue, "unsubscribed");
        }
        true
    }

    /// Install the return-message callback. Applied immediately when the
    /// channel exists, otherwise at connect time.
    pub fn return_message(&self, callback: BrokerReturnCallback) {
        *self.return_cb.lock().unwrap() = Some(callback);
        let channel = self.state.lock().unwrap().channel.clone();
        if let Some(channel) = channel {
            self.install_return(&channel);
        }
    }

    fn install_return(&self, channel: &Arc<dyn TransportChannel>) {
        let callback = self.return_cb.lock().unwrap().clone();
        let Some(callback) = callback else { return };
        let identity = self.identity.clone();
        channel.on_return(Arc::new(move |returned| {
            let to = if returned.exchange.is_empty() {
                returned.routing_key.clone()
            } else {
                returned.exchange.clone()
            };
            debug!(
                identity = %identity,
                reason = %returned.reply_text,
                to = %to,
                "message returned by broker"
            );
            callback(to, returned.reply_text, returned.body);
        }));
    }

    /// Close the connection. Idempotent; a broker already in a terminal
    /// state stays there. `status == closed` means closure was initiated;
    /// the returned future resolves once the transport acknowledged.
    pub async fn close(self: &Arc<Self>, propagate: bool, normal: bool, log: bool) {
        let channel = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.status, BrokerStatus::Closed | BrokerStatus::Failed) {
                return;
            }
            state.channel.take()
        };

        if log {
            info!(identity = %self.identity, normal, "closing broker connection");
        }
        let to = if normal {
            BrokerStatus::Closed
        } else {
            BrokerStatus::Failed
        };
        self.apply_status(to, propagate);

        if let Some(channel) = channel {
            if let Err(error) = channel.close().await {
                self.exceptions.track("close", &error.into());
            }
        }
    }

    /// Status summary record
    pub fn summary(&self) -> BrokerSummary {
        let state = self.state.lock().unwrap();
        BrokerSummary {
            identity: self.identity.clone(),
            alias: self.alias.clone(),
            status: state.status,
            disconnects: state.disconnects.total(),
            failures: state.failures.total(),
            retries: state.retries,
        }
    }

    /// Statistics record; optionally resets the counters
    pub fn stats(&self, reset: bool) -> BrokerStats {
        let mut state = self.state.lock().unwrap();
        let stats = BrokerStats {
            alias: self.alias.clone(),
            identity: self.identity.clone(),
            status: state.status.to_string(),
            disconnects: state.disconnects.non_zero(),
            disconnect_last: state.disconnects.last(),
            failures: state.failures.non_zero(),
            failure_last: state.failures.last(),
            retries: (state.retries > 0).then_some(state.retries),
        };
        if reset {
            state.disconnects.reset();
            state.failures.reset();
        }
        stats
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("identity", &self.identity)
            .field("alias", &self.alias)
            .field("status", &self.status())
            .finish()
    }
}

/// Draw the reconnect delay uniformly from `[0, interval)`
fn draw_reconnect_delay(interval: Duration) -> Duration {
    let upper = interval.as_millis() as u64;
    if upper == 0 {
        return Duration::ZERO;
    }
    let millis = rand::rng().random_range(0..upper);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_within_interval() {
        let interval = Duration::from_secs(60);
        for _ in 0..200 {
            let delay = draw_reconnect_delay(interval);
            assert!(delay < interval);
        }
    }

    #[test]
    fn test_reconnect_delay_zero_interval() {
        assert_eq!(draw_reconnect_delay(Duration::ZERO), Duration::ZERO);
    }
}
