// src/rabbitmq/memory.rs
//! Process-local broker.
//!
//! Mirrors the parts of AMQP the messaging layer relies on: durable queue
//! declaration with argument equivalence checks, per-message expiration with
//! dead-lettering through the default exchange, prefetch accounting, and
//! ack/reject bookkeeping. Expired messages are moved by a timer task, so
//! delayed delivery works without broker-side TTL support.
//!
//! Selected with a `memory://` broker URL, and used throughout the tests.
//! Faults can be injected with [`InMemoryBroker::drop_connections`] and
//! [`InMemoryBroker::refuse_connections`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, CloseObserver, DeliveryStream,
    Incoming, MessageProperties, QueueArguments,
};
use super::errors::{RabbitMQError, Result};

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    exchanges: Mutex<HashSet<String>>,
    links: Mutex<Vec<Arc<Link>>>,
    refused: AtomicU32,
    connects: AtomicU32,
    connect_latency_ms: AtomicU64,
    next_message_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    changed: Notify,
}

#[derive(Default)]
struct MemoryQueue {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    acked: u64,
    rejected: u64,
}

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    body: Vec<u8>,
    properties: MessageProperties,
}

/// Liveness of one connection, shared with its channels.
struct Link {
    open: AtomicBool,
    observers: Mutex<Vec<CloseObserver>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connect by `latency`.
    pub fn with_connect_latency(self, latency: Duration) -> Self {
        self.shared
            .connect_latency_ms
            .store(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
        self
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.shared.refused.store(count, Ordering::SeqCst);
    }

    /// Close every open connection as if the broker went away, notifying
    /// their close observers with `reason`.
    pub fn drop_connections(&self, reason: &str) {
        let links: Vec<Arc<Link>> = lock(&self.shared.links).drain(..).collect();
        for link in links {
            let observers = {
                let mut observers = lock(&link.observers);
                if !link.open.swap(false, Ordering::SeqCst) {
                    continue;
                }
                std::mem::take(&mut *observers)
            };
            for observer in observers {
                observer(Some(reason.to_string()));
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Number of connections successfully opened so far.
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Place raw bytes on a declared queue, bypassing serialization.
    pub fn enqueue_raw(&self, queue: &str, body: &[u8]) -> bool {
        let message = self.shared.store(body, MessageProperties::persistent());
        self.shared.route(queue, message)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.shared.queues).contains_key(queue)
    }

    /// Messages ready for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.shared.queues)
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn acked(&self, queue: &str) -> u64 {
        lock(&self.shared.queues).get(queue).map_or(0, |q| q.acked)
    }

    pub fn rejected(&self, queue: &str) -> u64 {
        lock(&self.shared.queues).get(queue).map_or(0, |q| q.rejected)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        lock(&self.shared.queues)
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        lock(&self.shared.exchanges).contains(exchange)
    }
}

impl Shared {
    fn store(&self, body: &[u8], properties: MessageProperties) -> StoredMessage {
        StoredMessage {
            id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            body: body.to_vec(),
            properties,
        }
    }

    /// Default-exchange routing: the routing key names the queue. Messages for
    /// unknown queues are dropped, as AMQP does.
    fn route(&self, queue: &str, message: StoredMessage) -> bool {
        let routed = match lock(&self.queues).get_mut(queue) {
            Some(target) => {
                target.ready.push_back(message);
                true
            }
            None => false,
        };

        if routed {
            self.changed.notify_waiters();
        } else {
            debug!(queue, "Dropping message for undeclared queue");
        }
        routed
    }

    fn expire(&self, queue: &str, message_id: u64) {
        let dead_lettered = {
            let mut queues = lock(&self.queues);
            let Some(source) = queues.get_mut(queue) else {
                return;
            };
            // Already consumed
            let Some(position) = source.ready.iter().position(|m| m.id == message_id) else {
                return;
            };
            let expired = source.ready.remove(position);
            dead_letter_target(&source.arguments).zip(expired)
        };

        if let Some((target, mut message)) = dead_lettered {
            debug!(from = queue, to = %target, "Dead-lettering expired message");
            message.properties.expiration = None;
            self.route(&target, message);
        }
    }
}

/// Queue that expired or rejected messages move to. Only the default
/// exchange is routed.
fn dead_letter_target(arguments: &QueueArguments) -> Option<String> {
    match (
        arguments.dead_letter_exchange.as_deref(),
        arguments.dead_letter_routing_key.as_deref(),
    ) {
        (Some(""), Some(routing_key)) => Some(routing_key.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let latency = self.shared.connect_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let refused = self
            .shared
            .refused
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RabbitMQError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            observers: Mutex::new(Vec::new()),
        });
        lock(&self.shared.links).push(link.clone());
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            link,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    fn on_close(&self, observer: CloseObserver) {
        let mut observers = lock(&self.link.observers);
        if self.link.open.load(Ordering::SeqCst) {
            observers.push(observer);
        } else {
            drop(observers);
            observer(Some("connection already closed".to_string()));
        }
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(RabbitMQError::ChannelError(
                "connection is closed".to_string(),
            ));
        }
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            link: self.link.clone(),
            open: Arc::new(AtomicBool::new(true)),
            prefetch: Arc::new(AtomicU16::new(0)),
            unacked: Arc::new(AtomicUsize::new(0)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.link.open.store(false, Ordering::SeqCst);
        lock(&self.shared.links).retain(|link| !Arc::ptr_eq(link, &self.link));
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    link: Arc<Link>,
    open: Arc<AtomicBool>,
    prefetch: Arc<AtomicU16>,
    unacked: Arc<AtomicUsize>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.link.open.load(Ordering::SeqCst) && self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments) -> Result<()> {
        self.ensure_open()?;
        let mut queues = lock(&self.shared.queues);
        match queues.get(queue) {
            Some(existing) if existing.arguments != *arguments => {
                Err(RabbitMQError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    queue
                )))
            }
            Some(_) => Ok(()),
            None => {
                queues.insert(
                    queue.to_string(),
                    MemoryQueue {
                        arguments: arguments.clone(),
                        ..MemoryQueue::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_direct_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.shared.exchanges).insert(exchange.to_string());
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        let message = self.shared.store(body, properties.clone());
        let message_id = message.id;

        if self.shared.route(queue, message) {
            if let Some(ttl) = properties.expiration {
                let shared = self.shared.clone();
                let queue = queue.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    shared.expire(&queue, message_id);
                });
            }
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        if !lock(&self.shared.queues).contains_key(queue) {
            return Err(RabbitMQError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        debug!(queue, consumer_tag, "Subscribed");

        let subscription = Subscription {
            shared: self.shared.clone(),
            link: self.link.clone(),
            channel_open: self.open.clone(),
            queue: queue.to_string(),
            prefetch: self.prefetch.clone(),
            unacked: self.unacked.clone(),
        };

        let deliveries = futures_lite::stream::unfold(subscription, |subscription| async move {
            let incoming = subscription.next_delivery().await?;
            Some((Ok(incoming), subscription))
        });
        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

struct Subscription {
    shared: Arc<Shared>,
    link: Arc<Link>,
    channel_open: Arc<AtomicBool>,
    queue: String,
    prefetch: Arc<AtomicU16>,
    unacked: Arc<AtomicUsize>,
}

impl Subscription {
    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst) && self.channel_open.load(Ordering::SeqCst)
    }

    fn try_take(&self) -> Option<Incoming> {
        let limit = self.prefetch.load(Ordering::SeqCst) as usize;
        if limit > 0 && self.unacked.load(Ordering::SeqCst) >= limit {
            return None;
        }

        let message = lock(&self.shared.queues)
            .get_mut(&self.queue)?
            .ready
            .pop_front()?;
        self.unacked.fetch_add(1, Ordering::SeqCst);

        let delivery_tag = self.shared.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let body = message.body.clone();
        Some(Incoming::new(
            delivery_tag,
            false,
            body,
            Box::new(MemoryAcker {
                shared: self.shared.clone(),
                link: self.link.clone(),
                queue: self.queue.clone(),
                unacked: self.unacked.clone(),
                settled: AtomicBool::new(false),
                message,
            }),
        ))
    }

    async fn next_delivery(&self) -> Option<Incoming> {
        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_open() {
                return None;
            }
            if let Some(incoming) = self.try_take() {
                return Some(incoming);
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    link: Arc<Link>,
    queue: String,
    unacked: Arc<AtomicUsize>,
    settled: AtomicBool,
    message: StoredMessage,
}

impl MemoryAcker {
    fn claim(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RabbitMQError::AckError(
                "delivery already settled".to_string(),
            ));
        }
        if !self.link.open.load(Ordering::SeqCst) {
            // Unsettled deliveries of a lost connection go back to the queue
            if let Some(queue) = lock(&self.shared.queues).get_mut(&self.queue) {
                queue.ready.push_front(self.message.clone());
            }
            self.release();
            return Err(RabbitMQError::AckError("connection is closed".to_string()));
        }
        Ok(())
    }

    fn release(&self) {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
        self.shared.changed.notify_waiters();
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.claim()?;
        if let Some(queue) = lock(&self.shared.queues).get_mut(&self.queue) {
            queue.acked += 1;
        }
        self.release();
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.claim()?;
        let target = {
            let mut queues = lock(&self.shared.queues);
            queues.get_mut(&self.queue).and_then(|queue| {
                queue.rejected += 1;
                dead_letter_target(&queue.arguments)
            })
        };
        if let Some(target) = target {
            self.shared.route(&target, self.message.clone());
        }
        self.release();
        Ok(())
    }
}
