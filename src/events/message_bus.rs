//! In-process publish/subscribe bus with per-sender failure isolation.
//!
//! Messages go into one unbounded FIFO queue and are dispatched by a single
//! background task, so delivery order is the publish order for the whole bus.
//! Every sender gets its own [`CircuitBreaker`]: subscriber failures count
//! against the sender of the message being handled, and a sender whose
//! breaker is open cannot publish until the breaker recovers.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::message::Message;
use crate::config::BusSettings;
use crate::resilience::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
use crate::utilities::Shutdown;
use crate::vector_clock::{ClockMap, VectorClock};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The sender's breaker is open; nothing was enqueued.
    #[error("circuit breaker open for {sender}")]
    CircuitOpen { sender: String },

    /// The queue has no receiver.
    #[error("message bus closed")]
    Closed,

    /// `start` was called outside a Tokio runtime.
    #[error("no Tokio runtime available to run the dispatch loop")]
    NoRuntime,
}

/// Failure reported by a subscriber; counted against the message's sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl From<String> for SubscriberError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriberError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Receives messages of the types it is registered for.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_message(&self, message: &Message) -> Result<(), SubscriberError>;
}

struct FnSubscriber<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
{
    async fn on_message(&self, message: &Message) -> Result<(), SubscriberError> {
        (self.f)(message.clone()).await
    }
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

struct BusInner {
    settings: BusSettings,
    tx: UnboundedSender<Message>,
    /// Parked receiver while the loop is not running.
    rx: Mutex<Option<UnboundedReceiver<Message>>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn Subscriber>>>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    history: Mutex<VecDeque<Message>>,
    clock: Mutex<VectorClock>,
    published: AtomicU64,
    processed: AtomicU64,
    running: AtomicBool,
    shutdown: Mutex<Shutdown>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Asynchronous publish/subscribe transport.
///
/// Cloning is cheap; clones share the same queue, subscribers and breakers.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("running", &self.is_running())
            .field("published", &self.inner.published.load(Ordering::SeqCst))
            .field("processed", &self.inner.processed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusSettings::default())
    }
}

impl MessageBus {
    pub fn new(settings: BusSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                settings,
                tx,
                rx: Mutex::new(Some(rx)),
                subscribers: RwLock::new(HashMap::new()),
                breakers: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                clock: Mutex::new(VectorClock::new()),
                published: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(Shutdown::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the dispatch loop. Calling it while running is a no-op.
    pub fn start(&self) -> Result<(), BusError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let mut worker = self.inner.worker.lock();
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(rx) = self.inner.rx.lock().take() else {
            // Previous loop still winding down.
            return Ok(());
        };

        let shutdown = Shutdown::new();
        *self.inner.shutdown.lock() = shutdown.clone();
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        *worker = Some(handle.spawn(async move {
            let rx = BusInner::run(inner.clone(), rx, shutdown).await;
            *inner.rx.lock() = Some(rx);
            inner.running.store(false, Ordering::SeqCst);
            log::info!("[MessageBus] dispatch loop stopped");
        }));
        log::info!("[MessageBus] dispatch loop started");
        Ok(())
    }

    /// Signal the loop to exit and wait for it.
    ///
    /// A message already dequeued is dispatched to completion first; queued
    /// messages stay queued for a later `start`.
    pub async fn stop(&self) {
        self.inner.shutdown.lock().trigger();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("[MessageBus] dispatch loop ended abnormally: {}", e);
                self.inner.running.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Publish / subscribe
    // -----------------------------------------------------------------------

    /// Enqueue a message and return its id.
    ///
    /// Fails with [`BusError::CircuitOpen`] when the sender is cut off. Never
    /// waits on subscribers.
    pub fn publish(
        &self,
        sender: &str,
        message_type: &str,
        payload: Value,
        correlation_id: Option<Uuid>,
    ) -> Result<Uuid, BusError> {
        if let Some(breaker) = self.inner.breakers.get(sender) {
            if breaker.state() == CircuitState::Open {
                log::debug!("[MessageBus] rejected {} from {}: breaker open", message_type, sender);
                return Err(BusError::CircuitOpen { sender: sender.to_string() });
            }
        }

        // Stamp and enqueue under the clock lock so clock order matches queue order.
        let mut clock = self.inner.clock.lock();
        let stamp = clock.increment(sender);
        let message = Message::new(sender, message_type, payload, correlation_id).with_vector_clock(stamp);
        let id = message.id;
        self.inner.tx.send(message).map_err(|_| BusError::Closed)?;
        drop(clock);

        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    /// Register a subscriber for every future message of `message_type`.
    pub fn subscribe(&self, message_type: &str, subscriber: Arc<dyn Subscriber>) {
        self.inner
            .subscribers
            .write()
            .entry(message_type.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Register an async closure as a subscriber.
    pub fn subscribe_fn<F, Fut>(&self, message_type: &str, f: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
    {
        self.subscribe(message_type, Arc::new(FnSubscriber { f }));
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Copy of the history log, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn breaker_status(&self, sender: &str) -> Option<CircuitBreakerStatus> {
        self.inner.breakers.get(sender).map(|b| b.status())
    }

    /// Current bus clock.
    pub fn clock(&self) -> ClockMap {
        self.inner.clock.lock().to_map()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn processed_count(&self) -> u64 {
        self.inner.processed.load(Ordering::SeqCst)
    }

    /// Wait until every message published so far has been dispatched.
    ///
    /// Returns `false` on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let target = self.inner.published.load(Ordering::SeqCst);
            if self.inner.processed.load(Ordering::SeqCst) >= target {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl BusInner {
    async fn run(
        inner: Arc<BusInner>,
        mut rx: UnboundedReceiver<Message>,
        shutdown: Shutdown,
    ) -> UnboundedReceiver<Message> {
        let poll = inner.settings.poll_interval();
        while !shutdown.is_triggered() {
            tokio::select! {
                _ = shutdown.notified() => break,
                next = tokio::time::timeout(poll, rx.recv()) => match next {
                    Ok(Some(message)) => inner.dispatch(message).await,
                    Ok(None) => break,
                    Err(_) => continue,
                },
            }
        }
        rx
    }

    async fn dispatch(&self, message: Message) {
        {
            let mut history = self.history.lock();
            history.push_back(message.clone());
            while history.len() > self.settings.max_history {
                history.pop_front();
            }
        }

        let subscribers = self
            .subscribers
            .read()
            .get(&message.message_type)
            .cloned()
            .unwrap_or_default();

        for subscriber in subscribers {
            let outcome = AssertUnwindSafe(subscriber.on_message(&message))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => self.breaker_for(&message.sender).reset(),
                Ok(Err(e)) => {
                    log::warn!(
                        "[MessageBus] subscriber failed on {} ({}) from {}: {}",
                        message.id,
                        message.message_type,
                        message.sender,
                        e
                    );
                    self.record_sender_failure(&message.sender);
                }
                Err(_) => {
                    log::error!(
                        "[MessageBus] subscriber panicked on {} ({}) from {}",
                        message.id,
                        message.message_type,
                        message.sender
                    );
                    self.record_sender_failure(&message.sender);
                }
            }
        }

        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    fn breaker_for(&self, sender: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(sender.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_config(
                    format!("bus:{}", sender),
                    &self.settings.breaker_config(),
                ))
            })
            .clone()
    }

    /// Count a failure; when it opens the breaker, schedule the half-open probe.
    fn record_sender_failure(&self, sender: &str) {
        let breaker = self.breaker_for(sender);
        let was_open = breaker.state() == CircuitState::Open;
        breaker.record_failure();
        if was_open || breaker.state() != CircuitState::Open {
            return;
        }

        log::warn!("[MessageBus] sender {} cut off after repeated failures", sender);
        let delay = self.settings.recovery_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            breaker.try_half_open();
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_settings() -> BusSettings {
        BusSettings {
            failure_threshold: 2,
            recovery_delay_secs: 0.05,
            poll_interval_ms: 20,
            max_history: 100,
        }
    }

    fn recorder(bus: &MessageBus, message_type: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn(message_type, move |msg: Message| {
            let sink = sink.clone();
            async move {
                sink.lock().push(msg.payload);
                Ok(())
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let bus = MessageBus::new(fast_settings());
        let seen = recorder(&bus, "step");
        bus.start().unwrap();

        for i in 1..=3 {
            bus.publish("orchestrator", "step", json!(i), None).unwrap();
        }
        assert!(bus.flush(Duration::from_secs(2)).await);
        assert_eq!(*seen.lock(), vec![json!(1), json!(2), json!(3)]);
        bus.stop().await;
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_all_subscribers_invoked_and_types_routed() {
        let bus = MessageBus::new(fast_settings());
        let first = recorder(&bus, "analysis");
        let second = recorder(&bus, "analysis");
        let other = recorder(&bus, "pricing");
        bus.start().unwrap();

        bus.publish("system_expert", "analysis", json!("a"), None).unwrap();
        assert!(bus.flush(Duration::from_secs(2)).await);
        assert_eq!(first.lock().len(), 1);
        assert_eq!(second.lock().len(), 1);
        assert!(other.lock().is_empty());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_failure_isolated_per_sender() {
        let bus = MessageBus::new(fast_settings());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn("step", move |msg: Message| {
            let sink = sink.clone();
            async move {
                sink.lock().push(msg.payload.clone());
                if msg.payload == json!(2) {
                    Err(SubscriberError::from("cannot handle 2"))
                } else {
                    Ok(())
                }
            }
        });
        bus.start().unwrap();

        bus.publish("flaky", "step", json!(1), None).unwrap();
        bus.publish("flaky", "step", json!(2), None).unwrap();
        bus.publish("steady", "step", json!(3), None).unwrap();
        assert!(bus.flush(Duration::from_secs(2)).await);

        assert_eq!(*seen.lock(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(bus.breaker_status("flaky").unwrap().failure_count, 1);
        assert_eq!(bus.breaker_status("steady").unwrap().failure_count, 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_publish_then_recovers() {
        let bus = MessageBus::new(fast_settings());
        bus.subscribe_fn("boom", |_msg: Message| async { Err(SubscriberError::from("nope")) });
        bus.start().unwrap();

        bus.publish("noisy", "boom", json!(1), None).unwrap();
        bus.publish("noisy", "boom", json!(2), None).unwrap();
        assert!(bus.flush(Duration::from_secs(2)).await);

        assert_eq!(bus.breaker_status("noisy").unwrap().state, CircuitState::Open);
        assert_eq!(
            bus.publish("noisy", "boom", json!(3), None),
            Err(BusError::CircuitOpen { sender: "noisy".into() })
        );
        assert!(bus.publish("quiet", "boom", json!(4), None).is_ok());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bus.breaker_status("noisy").unwrap().state, CircuitState::HalfOpen);
        assert!(bus.publish("noisy", "other", json!(5), None).is_ok());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_subscriber_counts_as_failure() {
        let bus = MessageBus::new(fast_settings());
        bus.subscribe_fn("explode", |_msg: Message| async {
            if true {
                panic!("subscriber bug");
            }
            Ok(())
        });
        let after = recorder(&bus, "after");
        bus.start().unwrap();

        bus.publish("p", "explode", json!(null), None).unwrap();
        bus.publish("p", "after", json!("still delivered"), None).unwrap();
        assert!(bus.flush(Duration::from_secs(2)).await);
        assert_eq!(after.lock().len(), 1);
        // the later success resets the sender's breaker
        assert_eq!(bus.breaker_status("p").unwrap().failure_count, 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_messages_stamped_and_history_bounded() {
        let mut settings = fast_settings();
        settings.max_history = 3;
        let bus = MessageBus::new(settings);
        bus.start().unwrap();

        let first = bus.publish("a", "t", json!(0), None).unwrap();
        for i in 1..5 {
            bus.publish("b", "t", json!(i), Some(first)).unwrap();
        }
        assert!(bus.flush(Duration::from_secs(2)).await);

        let history = bus.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].payload, json!(4));
        assert_eq!(history[2].correlation_id, first);
        assert_eq!(history[2].vector_clock.get("a"), Some(&1));
        assert_eq!(history[2].vector_clock.get("b"), Some(&4));
        assert_eq!(bus.clock().get("b"), Some(&4));
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_prompt_and_restartable() {
        let bus = MessageBus::new(BusSettings::default());
        bus.start().unwrap();
        bus.start().unwrap();
        assert!(bus.is_running());

        let stopped = tokio::time::timeout(Duration::from_millis(500), bus.stop()).await;
        assert!(stopped.is_ok());
        assert!(!bus.is_running());

        let seen = recorder(&bus, "t");
        bus.publish("x", "t", json!("queued while stopped"), None).unwrap();
        bus.start().unwrap();
        assert!(bus.flush(Duration::from_secs(2)).await);
        assert_eq!(seen.lock().len(), 1);
        bus.stop().await;
    }

    #[test]
    fn test_start_without_runtime() {
        let bus = MessageBus::default();
        assert_eq!(bus.start(), Err(BusError::NoRuntime));
    }
}
