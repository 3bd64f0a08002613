//! Mock transport for driving the client without a broker.
//!
//! [`MockTransport`] hands out one [`MockChannel`] per endpoint and keeps
//! them addressable by `host:port` so tests can script status events,
//! deliveries, and returned messages per broker, and inspect everything
//! the client asked the wire to do.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{
    BrokerTransport, ConnectSettings, DeclareFlags, ExchangeType, PublishFlags, ReturnCallback,
    ReturnedMessage, StatusCallback, TransportChannel, TransportDelivery, TransportError,
    TransportEvent,
};

/// A recorded publish: `(exchange, body, flags)`
pub type RecordedPublish = (String, Vec<u8>, PublishFlags);

/// Scriptable transport factory
#[derive(Default)]
pub struct MockTransport {
    channels: Mutex<HashMap<String, Arc<MockChannel>>>,
    /// Endpoints whose connect attempts fail
    refuse: Mutex<HashSet<String>>,
    /// Endpoints left in `connecting` (no `Ready` emitted on connect)
    hold_ready: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connect attempts to `host:port` fail
    pub fn refuse(&self, endpoint: &str) {
        self.refuse.lock().unwrap().insert(endpoint.to_string());
    }

    /// Keep `host:port` in `connecting`: connect succeeds but `Ready` is
    /// not emitted until the test scripts it
    pub fn hold_ready(&self, endpoint: &str) {
        self.hold_ready.lock().unwrap().insert(endpoint.to_string());
    }

    /// The channel handed out for `host:port`, if connected
    pub fn channel(&self, endpoint: &str) -> Option<Arc<MockChannel>> {
        self.channels.lock().unwrap().get(endpoint).cloned()
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(
        &self,
        settings: ConnectSettings,
        status: StatusCallback,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let endpoint = format!("{}:{}", settings.host, settings.port);
        if self.refuse.lock().unwrap().contains(&endpoint) {
            return Err(TransportError::Connect(format!(
                "connection refused: {endpoint}"
            )));
        }

        let channel = Arc::new(MockChannel::new(settings, status));
        self.channels
            .lock()
            .unwrap()
            .insert(endpoint.clone(), channel.clone());

        channel.emit(TransportEvent::Connected);
        if !self.hold_ready.lock().unwrap().contains(&endpoint) {
            channel.emit(TransportEvent::Ready);
        }
        Ok(channel)
    }
}

/// Everything a test can script and inspect for one broker connection
pub struct MockChannel {
    pub settings: ConnectSettings,
    status: StatusCallback,
    return_cb: Mutex<Option<ReturnCallback>>,
    pub published: Mutex<Vec<RecordedPublish>>,
    pub declared_queues: Mutex<Vec<(String, DeclareFlags)>>,
    pub declared_exchanges: Mutex<Vec<(ExchangeType, String, DeclareFlags)>>,
    pub binds: Mutex<Vec<(String, String, String)>>,
    pub consumers: Mutex<Vec<(String, String, bool)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub acks: Mutex<Vec<u64>>,
    pub deleted_queues: Mutex<Vec<String>>,
    pub qos: Mutex<Option<u16>>,
    closed: AtomicBool,
    fail_publish: AtomicBool,
    delivery_senders: Mutex<HashMap<String, mpsc::Sender<TransportDelivery>>>,
}

impl MockChannel {
    fn new(settings: ConnectSettings, status: StatusCallback) -> Self {
        Self {
            settings,
            status,
            return_cb: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            declared_queues: Mutex::new(Vec::new()),
            declared_exchanges: Mutex::new(Vec::new()),
            binds: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            deleted_queues: Mutex::new(Vec::new()),
            qos: Mutex::new(None),
            closed: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            delivery_senders: Mutex::new(HashMap::new()),
        }
    }

    /// Script a connection-status event
    pub fn emit(&self, event: TransportEvent) {
        (self.status)(event);
    }

    /// Script a broker return of a previously published message
    pub fn emit_return(&self, returned: ReturnedMessage) {
        let callback = self.return_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(returned);
        }
    }

    /// Script an inbound delivery on a consumed queue
    pub async fn deliver(&self, queue: &str, delivery: TransportDelivery) -> bool {
        let sender = self.delivery_senders.lock().unwrap().get(queue).cloned();
        match sender {
            Some(sender) => sender.send(delivery).await.is_ok(),
            None => false,
        }
    }

    /// Make subsequent publishes fail at the wire
    pub fn fail_publishes(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportChannel for MockChannel {
    fn on_return(&self, callback: ReturnCallback) {
        *self.return_cb.lock().unwrap() = Some(callback);
    }

    async fn qos(&self, prefetch: u16) -> Result<(), TransportError> {
        *self.qos.lock().unwrap() = Some(prefetch);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, flags: DeclareFlags) -> Result<(), TransportError> {
        self.declared_queues
            .lock()
            .unwrap()
            .push((name.to_string(), flags));
        Ok(())
    }

    async fn declare_exchange(
        &self,
        kind: ExchangeType,
        name: &str,
        flags: DeclareFlags,
    ) -> Result<(), TransportError> {
        self.declared_exchanges
            .lock()
            .unwrap()
            .push((kind, name.to_string(), flags));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.binds.lock().unwrap().push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<mpsc::Receiver<TransportDelivery>, TransportError> {
        let (sender, receiver) = mpsc::channel(16);
        self.delivery_senders
            .lock()
            .unwrap()
            .insert(queue.to_string(), sender);
        self.consumers.lock().unwrap().push((
            queue.to_string(),
            consumer_tag.to_string(),
            no_ack,
        ));
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.cancelled.lock().unwrap().push(consumer_tag.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        body: &[u8],
        flags: &PublishFlags,
    ) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("scripted failure".to_string()));
        }
        self.published.lock().unwrap().push((
            exchange.to_string(),
            body.to_vec(),
            flags.clone(),
        ));
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.deleted_queues.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Delivery with sensible defaults for scripting
pub fn delivery(body: &[u8]) -> TransportDelivery {
    TransportDelivery {
        delivery_tag: 1,
        exchange: "".to_string(),
        routing_key: "".to_string(),
        redelivered: false,
        body: body.to_vec(),
    }
}
