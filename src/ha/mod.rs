//! HA coordinator: fronts the priority-ordered broker set as one logical
//! endpoint.
//!
//! The coordinator owns the broker list, the published-context cache, and
//! the connection-status watcher registry. Publishes walk the use order
//! (priority or random) stopping at first success unless fanned out;
//! broker-returned messages are re-routed to a remaining peer using the
//! context cache, falling back to the non-delivery callback once every
//! re-routing avenue is exhausted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::address::{self, BrokerAddress};
use crate::barrier::CountedBarrier;
use crate::broker::{
    BrokerClient, BrokerStatus, Declarable, ReceiveExceptionCallback, SubscriptionHandler,
};
use crate::cache::{Context, PublishedCache};
use crate::config::{
    ExchangeSpec, HaClientOptions, PublishOptions, QueueSpec, SubscribeOptions,
};
use crate::error::{ExceptionCallback, ExceptionTracker, HaClientError, HaResult};
use crate::protocol::{Packet, PacketSerializer};
use crate::stats::{BrokerStats, BrokerSummary};
use crate::transport::amqp::AmqpTransport;
use crate::transport::{BrokerTransport, DeclareFlags};

mod select;
mod watch;

pub use watch::{Boundary, ConnectionStatus, StatusWatcherCallback, StatusWatcherOptions};

use watch::StatusWatcher;

/// Return reason: no queue bound for the routing key
pub const RETURN_NO_ROUTE: &str = "NO_ROUTE";
/// Return reason: queue exists but has no consumers (immediate publishes)
pub const RETURN_NO_CONSUMERS: &str = "NO_CONSUMERS";
/// Return reason: broker is denying access, typically while shutting down
pub const RETURN_ACCESS_REFUSED: &str = "ACCESS_REFUSED";

/// Details handed to the non-delivery callback once re-routing is exhausted
#[derive(Debug, Clone)]
pub struct NonDelivery {
    pub reason: String,
    pub kind: Option<String>,
    pub token: Option<String>,
    pub from: Option<String>,
    pub to: String,
}

/// Callback invoked when a message could not be delivered anywhere
pub type NonDeliveryCallback = Arc<dyn Fn(NonDelivery) + Send + Sync>;

/// Hook invoked after every per-broker status transition:
/// `(summary, connected_before)`
pub type UpdateStatusHook = Arc<dyn Fn(&BrokerSummary, bool) + Send + Sync>;

/// Runtime callbacks installed at construction
#[derive(Clone, Default)]
pub struct HaCallbacks {
    pub exception: Option<ExceptionCallback>,
    pub exception_on_receive: Option<ReceiveExceptionCallback>,
    pub non_delivery: Option<NonDeliveryCallback>,
    pub update_status: Option<UpdateStatusHook>,
}

/// Ordered broker set plus its identity index.
///
/// Positions are contiguous priorities; at most one client per identity.
struct BrokerSet {
    list: Vec<Arc<BrokerClient>>,
    by_identity: HashMap<String, Arc<BrokerClient>>,
}

impl BrokerSet {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            by_identity: HashMap::new(),
        }
    }

    /// Insert at the given priority; a hint beyond the end lands at the
    /// next free position. Re-inserting an identity replaces it in place.
    fn insert(&mut self, client: Arc<BrokerClient>, priority: Option<usize>) {
        let identity = client.identity().to_string();
        if let Some(position) = self.list.iter().position(|b| b.identity() == identity) {
            self.list[position] = client.clone();
        } else {
            let position = priority.unwrap_or(self.list.len()).min(self.list.len());
            self.list.insert(position, client.clone());
        }
        self.by_identity.insert(identity, client);
    }

    fn remove(&mut self, identity: &str) -> Option<Arc<BrokerClient>> {
        let position = self.list.iter().position(|b| b.identity() == identity)?;
        let client = self.list.remove(position);
        self.by_identity.remove(identity);
        Some(client)
    }

    fn get(&self, identity: &str) -> Option<Arc<BrokerClient>> {
        self.by_identity.get(identity).cloned()
    }

    fn list(&self) -> Vec<Arc<BrokerClient>> {
        self.list.clone()
    }

    fn len(&self) -> usize {
        self.list.len()
    }
}

/// High-availability client fronting a set of AMQP brokers
#[derive(Clone)]
pub struct HaBrokerClient {
    inner: Arc<HaInner>,
}

struct HaInner {
    options: HaClientOptions,
    serializer: Option<Arc<dyn PacketSerializer>>,
    transport: Arc<dyn BrokerTransport>,
    brokers: Mutex<BrokerSet>,
    published: Mutex<PublishedCache>,
    watchers: Mutex<HashMap<u64, StatusWatcher>>,
    watcher_seq: AtomicU64,
    non_delivery: Mutex<Option<NonDeliveryCallback>>,
    update_status_hook: Mutex<Option<UpdateStatusHook>>,
    receive_exception: Option<ReceiveExceptionCallback>,
    exceptions: Arc<ExceptionTracker>,
    closed: AtomicBool,
}

impl HaBrokerClient {
    /// Connect to the configured broker set over the lapin transport
    pub async fn new(
        serializer: Option<Arc<dyn PacketSerializer>>,
        options: HaClientOptions,
        callbacks: HaCallbacks,
    ) -> HaResult<Self> {
        Self::with_transport(serializer, options, callbacks, Arc::new(AmqpTransport)).await
    }

    /// Connect using an explicit transport (tests use the mock here)
    pub async fn with_transport(
        serializer: Option<Arc<dyn PacketSerializer>>,
        options: HaClientOptions,
        callbacks: HaCallbacks,
        transport: Arc<dyn BrokerTransport>,
    ) -> HaResult<Self> {
        let addresses = address::addresses(options.host.as_deref(), options.port.as_deref())?;

        let exceptions = Arc::new(ExceptionTracker::new());
        if let Some(callback) = callbacks.exception {
            exceptions.set_callback(callback);
        }

        let inner = Arc::new(HaInner {
            options,
            serializer,
            transport,
            brokers: Mutex::new(BrokerSet::new()),
            published: Mutex::new(PublishedCache::new()),
            watchers: Mutex::new(HashMap::new()),
            watcher_seq: AtomicU64::new(0),
            non_delivery: Mutex::new(callbacks.non_delivery),
            update_status_hook: Mutex::new(callbacks.update_status),
            receive_exception: callbacks.exception_on_receive,
            exceptions,
            closed: AtomicBool::new(false),
        });

        let client = Self { inner };
        info!(
            brokers = addresses.len(),
            "connecting to broker set"
        );
        for address in addresses {
            client.add_broker(address, None).await;
        }
        Ok(client)
    }

    /// Add a broker to the set, wiring hooks and starting its connection
    async fn add_broker(
        &self,
        address: BrokerAddress,
        priority: Option<usize>,
    ) -> Arc<BrokerClient> {
        let broker = BrokerClient::new(
            address,
            self.inner.options.clone(),
            self.inner.serializer.clone(),
            self.inner.transport.clone(),
            self.inner.exceptions.clone(),
        );
        if let Some(callback) = &self.inner.receive_exception {
            broker.set_receive_exception_callback(callback.clone());
        }

        let weak = Arc::downgrade(&self.inner);
        broker.set_update_status_callback(Arc::new(move |client, connected_before| {
            if let Some(inner) = weak.upgrade() {
                HaInner::update_status(&inner, client, connected_before);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let identity = broker.identity().to_string();
        broker.return_message(Arc::new(move |to, reason, message| {
            if let Some(inner) = weak.upgrade() {
                let identity = identity.clone();
                tokio::spawn(async move {
                    HaInner::handle_return(inner, identity, to, reason, message).await;
                });
            }
        }));

        self.inner
            .brokers
            .lock()
            .unwrap()
            .insert(broker.clone(), priority);
        broker.connect().await;
        broker
    }

    /// Subscribe on every usable broker, returning the identities where the
    /// delegation succeeded. Subscribing while `connecting` is permitted;
    /// the transport queues channel operations until ready.
    pub async fn subscribe(
        &self,
        queue: &QueueSpec,
        exchange: Option<&ExchangeSpec>,
        options: &SubscribeOptions,
        handler: SubscriptionHandler,
    ) -> Vec<String> {
        let selected = self.inner.usable_brokers(options.brokers.as_deref());
        let mut identities = Vec::new();
        for broker in selected {
            if broker
                .subscribe(queue, exchange, options, handler.clone())
                .await
            {
                identities.push(broker.identity().to_string());
            }
        }
        identities
    }

    /// Publish a packet, serializing it unless `no_serialize` is set or no
    /// serializer is configured. Walks the use order stopping at first
    /// success, or every usable broker under `fanout`. Mandatory publishes
    /// of serialized packets are remembered for return re-routing.
    pub async fn publish(
        &self,
        exchange: &ExchangeSpec,
        packet: &Packet,
        options: &PublishOptions,
    ) -> HaResult<Vec<String>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HaClientError::NoConnectedBrokers);
        }

        let serializer = self
            .inner
            .serializer
            .as_ref()
            .filter(|_| !options.no_serialize);
        let message = match serializer {
            Some(serializer) => serializer.encode(packet)?,
            None => packet.raw_bytes()?,
        };

        let (identities, candidates) = self
            .inner
            .publish_message(exchange, packet, &message, options)
            .await?;

        if options.mandatory && serializer.is_some() {
            let context = Context::new(packet, exchange, options, candidates);
            self.inner.published.lock().unwrap().store(&message, context);
        }
        Ok(identities)
    }

    /// Declare a queue or exchange on each usable broker
    pub async fn declare(
        &self,
        target: Declarable,
        name: &str,
        flags: DeclareFlags,
        brokers: Option<&[String]>,
    ) -> Vec<String> {
        let selected = self.inner.usable_brokers(brokers);
        let mut identities = Vec::new();
        for broker in selected {
            if broker.declare(target, name, flags).await {
                identities.push(broker.identity().to_string());
            }
        }
        identities
    }

    /// Delete a queue on each selected usable broker
    pub async fn delete(&self, name: &str, brokers: Option<&[String]>) -> Vec<String> {
        let selected = self.inner.usable_brokers(brokers);
        let mut identities = Vec::new();
        for broker in selected {
            if broker.delete(name).await {
                identities.push(broker.identity().to_string());
            }
        }
        identities
    }

    /// Add a broker at runtime. An existing broker at the same address is
    /// closed and replaced; a priority hint beyond the set lands at the
    /// next free position.
    pub async fn connect_broker(
        &self,
        host: &str,
        port: u16,
        index: u16,
        priority: Option<usize>,
    ) -> HaResult<String> {
        let identity = address::identity(host, port);
        let existing = self.inner.brokers.lock().unwrap().remove(&identity);
        if let Some(existing) = existing {
            info!(%identity, "replacing existing broker connection");
            existing.close(false, true, false).await;
        }
        let broker = self
            .add_broker(BrokerAddress::new(host, port, index), priority)
            .await;
        Ok(broker.identity().to_string())
    }

    /// Remove a broker from the set, closing it normally and collapsing
    /// its position. Unknown addresses are a logged no-op.
    pub async fn remove(&self, host: &str, port: u16) -> Option<String> {
        let identity = address::identity(host, port);
        let broker = self.inner.brokers.lock().unwrap().remove(&identity);
        match broker {
            Some(broker) => {
                info!(%identity, "removing broker from set");
                broker.close(true, true, false).await;
                Some(identity)
            }
            None => {
                warn!(%identity, "cannot remove unknown broker");
                None
            }
        }
    }

    /// Cancel subscriptions to the named queues on every broker holding
    /// them, proceeding once all brokers answered or the timeout elapsed.
    pub async fn unsubscribe(&self, queues: &[String], timeout: Option<Duration>) {
        let holders: Vec<Arc<BrokerClient>> = self
            .inner
            .brokers
            .lock()
            .unwrap()
            .list()
            .into_iter()
            .filter(|broker| queues.iter().any(|queue| broker.is_subscribed(queue)))
            .collect();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let barrier = CountedBarrier::new(holders.len(), timeout, move || {
            let _ = tx.send(());
        });
        for broker in holders {
            let barrier = barrier.clone();
            let queues = queues.to_vec();
            tokio::spawn(async move {
                broker.unsubscribe(&queues).await;
                barrier.completed_one();
            });
        }
        let _ = rx.await;
    }

    /// Close every broker connection; idempotent, resolves once all
    /// closures complete.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let brokers = self.inner.brokers.lock().unwrap().list();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let barrier = CountedBarrier::new(brokers.len(), None, move || {
            let _ = tx.send(());
        });
        for broker in brokers {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                broker.close(false, true, false).await;
                barrier.completed_one();
            });
        }
        let _ = rx.await;
        info!("all broker connections closed");
    }

    /// Install or replace the non-delivery callback
    pub fn non_delivery(&self, callback: NonDeliveryCallback) {
        *self.inner.non_delivery.lock().unwrap() = Some(callback);
    }

    /// Register a connection-status watcher; returns its id. A `one_off`
    /// watcher auto-fires `Timeout` and unregisters when its deadline
    /// passes without a matching transition.
    pub fn connection_status(
        &self,
        options: StatusWatcherOptions,
        callback: StatusWatcherCallback,
    ) -> u64 {
        let id = self.inner.watcher_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let timer = options.one_off.map(|timeout| {
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    let watcher = inner.watchers.lock().unwrap().remove(&id);
                    if let Some(watcher) = watcher {
                        debug!(watcher = id, "connection-status watcher timed out");
                        (watcher.callback)(ConnectionStatus::Timeout);
                    }
                }
            })
        });

        self.inner.watchers.lock().unwrap().insert(
            id,
            StatusWatcher {
                options,
                callback,
                timer,
            },
        );
        id
    }

    /// Deregister a watcher; returns whether it existed
    pub fn cancel_connection_status(&self, id: u64) -> bool {
        let watcher = self.inner.watchers.lock().unwrap().remove(&id);
        match watcher {
            Some(watcher) => {
                if let Some(timer) = watcher.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Identities of brokers currently in `connected` status
    pub fn connected(&self) -> Vec<String> {
        self.inner
            .brokers
            .lock()
            .unwrap()
            .list
            .iter()
            .filter(|broker| broker.connected())
            .map(|broker| broker.identity().to_string())
            .collect()
    }

    /// Identities of brokers subscribed to the named queue
    pub fn subscribed(&self, queue: &str) -> Vec<String> {
        self.inner
            .brokers
            .lock()
            .unwrap()
            .list
            .iter()
            .filter(|broker| broker.is_subscribed(queue))
            .map(|broker| broker.identity().to_string())
            .collect()
    }

    /// Status summary for every broker in priority order
    pub fn status(&self) -> Vec<BrokerSummary> {
        self.inner
            .brokers
            .lock()
            .unwrap()
            .list
            .iter()
            .map(|broker| broker.summary())
            .collect()
    }

    /// Statistics records; optionally resets the per-broker counters
    pub fn stats(&self, reset: bool) -> Vec<BrokerStats> {
        self.inner
            .brokers
            .lock()
            .unwrap()
            .list
            .iter()
            .map(|broker| broker.stats(reset))
            .collect()
    }

    /// Number of configured brokers
    pub fn broker_count(&self) -> usize {
        self.inner.brokers.lock().unwrap().len()
    }
}

impl std::fmt::Debug for HaBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaBrokerClient")
            .field("brokers", &self.broker_count())
            .field("connected", &self.connected())
            .finish()
    }
}

impl HaInner {
    /// Brokers in usable status, optionally restricted by identity
    fn usable_brokers(&self, filter: Option<&[String]>) -> Vec<Arc<BrokerClient>> {
        self.brokers
            .lock()
            .unwrap()
            .list
            .iter()
            .filter(|broker| broker.usable())
            .filter(|broker| {
                filter
                    .map(|ids| ids.iter().any(|id| id == broker.identity()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Identities currently in `connected` status
    fn connected_set(&self) -> HashSet<String> {
        self.brokers
            .lock()
            .unwrap()
            .list
            .iter()
            .filter(|broker| broker.connected())
            .map(|broker| broker.identity().to_string())
            .collect()
    }

    /// Walk the use order publishing an already-serialized message.
    /// Returns the accepting identities and the full candidate order.
    async fn publish_message(
        &self,
        exchange: &ExchangeSpec,
        packet: &Packet,
        message: &[u8],
        options: &PublishOptions,
    ) -> HaResult<(Vec<String>, Vec<String>)> {
        let order = {
            let set = self.brokers.lock().unwrap();
            select::use_order(
                &set.list,
                options.brokers.as_deref(),
                self.options.order,
                options.order,
            )
        };
        let candidates: Vec<String> = order
            .iter()
            .map(|broker| broker.identity().to_string())
            .collect();

        let mut identities = Vec::new();
        for broker in &order {
            if broker.publish(exchange, packet, message, options).await {
                identities.push(broker.identity().to_string());
                if !options.fanout {
                    break;
                }
            }
        }

        if identities.is_empty() {
            return Err(HaClientError::NoConnectedBrokers);
        }
        Ok((identities, candidates))
    }

    /// Aggregate one per-broker status transition into watcher callbacks
    fn update_status(inner: &Arc<HaInner>, broker: &Arc<BrokerClient>, connected_before: bool) {
        let hook = inner.update_status_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(&broker.summary(), connected_before);
        }

        let identity = broker.identity().to_string();
        let (identities, after, failed): (Vec<String>, HashSet<String>, HashSet<String>) = {
            let set = inner.brokers.lock().unwrap();
            let identities = set
                .list
                .iter()
                .map(|b| b.identity().to_string())
                .collect();
            let after = set
                .list
                .iter()
                .filter(|b| b.connected())
                .map(|b| b.identity().to_string())
                .collect();
            let failed = set
                .list
                .iter()
                .filter(|b| b.failed())
                .map(|b| b.identity().to_string())
                .collect();
            (identities, after, failed)
        };

        let mut before = after.clone();
        if connected_before {
            before.insert(identity.clone());
        } else {
            before.remove(&identity);
        }

        // evaluate under the lock, invoke after releasing it
        let mut fired: Vec<(u64, bool, StatusWatcherCallback, ConnectionStatus)> = Vec::new();
        {
            let mut watchers = inner.watchers.lock().unwrap();
            for (&id, watcher) in watchers.iter() {
                if let Some(filter) = &watcher.options.brokers {
                    if !filter.iter().any(|f| f == &identity) {
                        continue;
                    }
                }
                let relevant: Vec<&String> = match &watcher.options.brokers {
                    Some(filter) => filter.iter().collect(),
                    None => identities.iter().collect(),
                };
                let n = relevant.len();
                let before_count = relevant
                    .iter()
                    .filter(|id| before.contains(id.as_str()))
                    .count();
                let after_count = relevant
                    .iter()
                    .filter(|id| after.contains(id.as_str()))
                    .count();
                let all_failed = !relevant.is_empty()
                    && relevant.iter().all(|id| failed.contains(id.as_str()));

                if let Some(event) =
                    watch::evaluate(watcher.options.boundary, n, before_count, after_count, all_failed)
                {
                    fired.push((
                        id,
                        watcher.options.one_off.is_some(),
                        watcher.callback.clone(),
                        event,
                    ));
                }
            }
            // one-offs unregister before their callback runs so a timer
            // racing in cannot fire them twice
            for (id, one_off, _, _) in &fired {
                if *one_off {
                    if let Some(watcher) = watchers.remove(id) {
                        if let Some(timer) = watcher.timer {
                            timer.abort();
                        }
                    }
                }
            }
        }

        for (_, _, callback, event) in fired {
            callback(event);
        }
    }

    /// Entry point for broker-returned messages; best-effort, any fault is
    /// tracked and suppressed.
    async fn handle_return(
        inner: Arc<HaInner>,
        identity: String,
        to: String,
        reason: String,
        message: Vec<u8>,
    ) {
        if let Err(error) =
            Self::process_return(&inner, &identity, &to, &reason, &message).await
        {
            inner.exceptions.track("return", &error);
        }

        // ACCESS_REFUSED marks the returning broker as stopping. Applied
        // after re-routing so a persistent retry can still reach it.
        if reason == RETURN_ACCESS_REFUSED {
            let broker = inner.brokers.lock().unwrap().get(&identity);
            if let Some(broker) = broker {
                broker.update_status(BrokerStatus::Stopping);
            }
        }
    }

    async fn process_return(
        inner: &Arc<HaInner>,
        identity: &str,
        to: &str,
        reason: &str,
        message: &[u8],
    ) -> HaResult<()> {
        info!(identity, reason, to, "handling returned message");

        let context = inner
            .published
            .lock()
            .unwrap()
            .update(message, |context| context.record_failure(identity));
        let Some(context) = context else {
            // non-serialized, one-way fire-and-forget, or aged out of the
            // cache; nothing to re-route with
            info!(identity, to, "dropping returned message with no delivery context");
            return Ok(());
        };

        let connected = inner.connected_set();
        let remaining: Vec<String> = context
            .brokers
            .iter()
            .filter(|id| !context.failed.contains(*id) && connected.contains(id.as_str()))
            .cloned()
            .collect();

        if !remaining.is_empty() {
            debug!(identity, candidates = remaining.len(), "re-routing returned message");
            let mut options = context.options.clone();
            options.no_serialize = true;
            options.brokers = Some(remaining);
            Self::republish(inner, &context, message, &options).await?;
            return Ok(());
        }

        // Persistent and one-way messages should be able to queue even
        // without consumers, so give the original candidates one more try
        // without the mandatory flag.
        if (context.options.persistent || context.one_way)
            && (reason == RETURN_ACCESS_REFUSED || reason == RETURN_NO_CONSUMERS)
        {
            let retry: Vec<String> = context
                .brokers
                .iter()
                .filter(|id| connected.contains(id.as_str()))
                .cloned()
                .collect();
            if !retry.is_empty() {
                debug!(identity, "retrying returned message without mandatory");
                let mut options = context.options.clone();
                options.mandatory = false;
                options.no_serialize = true;
                options.brokers = Some(retry);
                Self::republish(inner, &context, message, &options).await?;
                return Ok(());
            }
        }

        Self::notify_non_delivery(inner, reason, &context, to);
        Ok(())
    }

    async fn republish(
        inner: &Arc<HaInner>,
        context: &Context,
        message: &[u8],
        options: &PublishOptions,
    ) -> HaResult<Vec<String>> {
        let packet = Packet {
            kind: context.kind.clone().unwrap_or_else(|| "unknown".to_string()),
            name: context.name.clone(),
            from: context.from.clone(),
            token: context.token.clone(),
            one_way: context.one_way,
            tries: Vec::new(),
            payload: Value::Null,
        };
        inner
            .publish_message(&context.exchange, &packet, message, options)
            .await
            .map(|(identities, _)| identities)
    }

    fn notify_non_delivery(inner: &Arc<HaInner>, reason: &str, context: &Context, to: &str) {
        warn!(
            reason,
            to,
            token = ?context.token,
            "message could not be delivered to any broker"
        );
        let callback = inner.non_delivery.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(NonDelivery {
                reason: reason.to_string(),
                kind: context.kind.clone(),
                token: context.token.clone(),
                from: context.from.clone(),
                to: to.to_string(),
            });
        }
    }
}
