//! Message broker: publish, send-and-wait, reply
//!
//! Dispatch is inline by default: `publish` runs every matching handler on the
//! caller's thread, in registration order, before returning. In deferred mode
//! a single dispatcher task drains a FIFO queue instead.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{BrokerConfig, DispatchMode};
use super::handle::BrokerHandle;
use super::messages::{BrokerMetrics, DispatchRequest, MetricCounters};
use super::subscriptions::{MessageHandler, Slot, Subscriber, SubscriptionTable};
use super::waiters::{Waiter, WaiterTable};
use crate::domain::{Message, MessageKind, StreamId, Version};
use crate::error::{BrokerError, BrokerResult};

/// Version of the broker's message interface, checked against module minimums
pub const BROKER_VERSION: Version = Version::new(4, 0);

/// Shared broker state; owned by [`MessageBroker`], observed by [`BrokerHandle`]
pub(crate) struct BrokerInner {
    subscriptions: SubscriptionTable,
    waiters: WaiterTable,
    metrics: MetricCounters,
    reply_timeout_ms: AtomicU64,
    dispatch_tx: Option<mpsc::UnboundedSender<DispatchRequest>>,
    shutdown: AtomicBool,
}

impl BrokerInner {
    fn ensure_running(&self) -> BrokerResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BrokerError::InvalidState("broker has shut down".to_string()));
        }
        Ok(())
    }

    pub(crate) fn subscribe(&self, slot: Slot, module: &str, handler: MessageHandler) -> BrokerResult<()> {
        self.ensure_running()?;
        self.subscriptions.subscribe(slot, module, handler)?;
        Ok(())
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub(crate) fn publish(&self, message: Message) -> BrokerResult<()> {
        debug!(
            id = %message.id(),
            kind = %message.kind(),
            topic = %message.topic(),
            action = %message.action(),
            "MessageBroker::publish: called"
        );
        self.ensure_running()?;

        if message.kind() == MessageKind::Reply {
            self.complete_reply(message);
            return Ok(());
        }

        MetricCounters::bump(&self.metrics.messages_published);
        self.dispatch(message)
    }

    fn dispatch(&self, message: Message) -> BrokerResult<()> {
        match &self.dispatch_tx {
            None => {
                self.deliver(&message);
                Ok(())
            }
            Some(tx) => tx
                .send(DispatchRequest::Deliver(message))
                .map_err(|_| BrokerError::InvalidState("dispatcher stopped".to_string())),
        }
    }

    /// Run every handler on the message's slot, isolating failures per handler
    fn deliver(&self, message: &Message) -> usize {
        let subscribers = self
            .subscriptions
            .lookup(message.kind(), message.topic(), message.action());

        if subscribers.is_empty() {
            debug!(topic = %message.topic(), action = %message.action(), "No subscribers");
            return 0;
        }

        for subscriber in &subscribers {
            self.invoke(subscriber, message);
        }
        subscribers.len()
    }

    fn invoke(&self, subscriber: &Subscriber, message: &Message) {
        let Some(_pass) = subscriber.gate.enter() else {
            debug!(module = %subscriber.module, topic = %message.topic(), "Skipping retired module");
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(message)));
        match outcome {
            Ok(Ok(())) => MetricCounters::bump(&self.metrics.deliveries),
            Ok(Err(e)) => {
                warn!(
                    module = %subscriber.module,
                    topic = %message.topic(),
                    action = %message.action(),
                    error = ?e,
                    "Handler failed"
                );
                MetricCounters::bump(&self.metrics.handler_failures);
            }
            Err(_) => {
                warn!(
                    module = %subscriber.module,
                    topic = %message.topic(),
                    action = %message.action(),
                    "Handler panicked"
                );
                MetricCounters::bump(&self.metrics.handler_failures);
            }
        }
    }

    pub(crate) async fn send_and_wait(&self, message: Message, timeout: Duration) -> BrokerResult<Message> {
        debug!(id = %message.id(), ?timeout, "MessageBroker::send_and_wait: called");
        self.ensure_running()?;
        if message.kind() != MessageKind::Publish {
            return Err(BrokerError::InvalidState(format!(
                "cannot wait on reply message {}",
                message.id()
            )));
        }

        let correlation_id = message.correlation_id().to_string();
        let reply_rx = self
            .waiters
            .register(&correlation_id, message.topic(), message.action())?;

        if let Err(e) = self.publish(message) {
            self.waiters.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::InvalidState(format!(
                "waiter for {} was dropped",
                correlation_id
            ))),
            Err(_) => {
                // A reply racing the timeout finds no waiter and is dropped
                self.waiters.remove(&correlation_id);
                MetricCounters::bump(&self.metrics.wait_timeouts);
                warn!(%correlation_id, ?timeout, "Reply wait timed out");
                Err(BrokerError::Timeout { correlation_id, timeout })
            }
        }
    }

    pub(crate) fn reply(&self, correlation_id: &str, payload: Vec<u8>, stream_id: Option<StreamId>) {
        debug!(%correlation_id, "MessageBroker::reply: called");
        let Some(waiter) = self.waiters.take(correlation_id) else {
            debug!(%correlation_id, "No waiter for reply, dropping");
            MetricCounters::bump(&self.metrics.replies_dropped);
            return;
        };

        let mut reply = Message::reply(correlation_id, waiter.topic.clone(), waiter.action.clone(), payload);
        if let Some(stream_id) = stream_id {
            reply = reply.with_stream(stream_id);
        }
        self.resolve(waiter, reply);
    }

    fn complete_reply(&self, reply: Message) {
        match self.waiters.take(reply.correlation_id()) {
            Some(waiter) => self.resolve(waiter, reply),
            None => {
                debug!(correlation_id = %reply.correlation_id(), "No waiter for reply, dropping");
                MetricCounters::bump(&self.metrics.replies_dropped);
            }
        }
    }

    fn resolve(&self, waiter: Waiter, reply: Message) {
        if waiter.reply_tx.send(Ok(reply.clone())).is_err() {
            MetricCounters::bump(&self.metrics.replies_dropped);
            return;
        }
        MetricCounters::bump(&self.metrics.replies_delivered);

        // Observers of consumed replies
        if let Err(e) = self.dispatch(reply) {
            debug!(error = %e, "Reply observers not notified");
        }
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn metrics(&self) -> BrokerMetrics {
        self.metrics.snapshot(self.waiters.len(), self.subscriptions.len())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Message broker shutting down");

        let failed = self
            .waiters
            .fail_all(|id| BrokerError::InvalidState(format!("broker shut down while waiting for {}", id)));
        if failed > 0 {
            warn!(failed, "Pending waits cancelled by shutdown");
        }

        if let Some(tx) = &self.dispatch_tx {
            let _ = tx.send(DispatchRequest::Shutdown);
        }
    }
}

/// The in-process message broker
///
/// Owned by a single party (normally the engine registry). Modules and
/// handlers get a non-owning [`BrokerHandle`]. Dropping the broker shuts it down.
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    /// Create a broker
    ///
    /// Deferred dispatch spawns its dispatcher on the current Tokio runtime and
    /// fails with `InvalidState` when called outside one.
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        debug!(?config, "MessageBroker::new: called");

        let (dispatch_tx, dispatch_rx) = match config.dispatch {
            DispatchMode::Inline => (None, None),
            DispatchMode::Deferred => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
        };

        let inner = Arc::new(BrokerInner {
            subscriptions: SubscriptionTable::new(),
            waiters: WaiterTable::new(),
            metrics: MetricCounters::default(),
            reply_timeout_ms: AtomicU64::new(config.reply_timeout_ms),
            dispatch_tx,
            shutdown: AtomicBool::new(false),
        });

        if let Some(rx) = dispatch_rx {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                BrokerError::InvalidState("deferred dispatch requires a Tokio runtime".to_string())
            })?;
            runtime.spawn(run_dispatcher(Arc::downgrade(&inner), rx));
        }

        info!(dispatch = ?config.dispatch, version = %BROKER_VERSION, "Message broker created");
        Ok(Self { inner })
    }

    /// Non-owning capability reference for modules and handlers
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(Arc::downgrade(&self.inner))
    }

    /// Register `handler` for publishes on (topic, action) on behalf of `module`
    ///
    /// Use [`ACTION_ANY`](super::ACTION_ANY) as the action to receive every action on the topic.
    pub fn subscribe<F>(&self, topic: &str, action: &str, handler: F, module: &str) -> BrokerResult<()>
    where
        F: Fn(&Message) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_kind(MessageKind::Publish, topic, action, handler, module)
    }

    /// Register `handler` for messages of `kind` on (topic, action)
    pub fn subscribe_kind<F>(
        &self,
        kind: MessageKind,
        topic: &str,
        action: &str,
        handler: F,
        module: &str,
    ) -> BrokerResult<()>
    where
        F: Fn(&Message) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .subscribe(Slot::new(kind, topic, action), module, Arc::new(handler))
    }

    /// Remove `module`'s publish handler on (topic, action)
    pub fn unsubscribe(&self, topic: &str, action: &str, module: &str) -> bool {
        self.inner
            .subscriptions
            .unsubscribe(&Slot::new(MessageKind::Publish, topic, action), module)
    }

    /// Remove every handler owned by `module`
    pub fn unsubscribe_all(&self, module: &str) -> usize {
        self.inner.subscriptions.unsubscribe_all(module)
    }

    /// Remove every handler owned by `module` and stop delivering to it
    ///
    /// Blocks until the module's in-flight handler calls return. Calling this
    /// from one of the module's own handlers deadlocks.
    pub fn retire_module(&self, module: &str) -> usize {
        self.inner.subscriptions.retire_module(module)
    }

    /// Publish handlers for (topic, action) in delivery order
    pub fn lookup(&self, topic: &str, action: &str) -> Vec<Subscriber> {
        self.inner.subscriptions.lookup(MessageKind::Publish, topic, action)
    }

    /// The underlying subscription table
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.inner.subscriptions
    }

    /// Fire-and-forget publish
    ///
    /// A reply-kind message is routed to its waiter instead (or dropped).
    pub fn publish(&self, message: Message) -> BrokerResult<()> {
        self.inner.publish(message)
    }

    /// Publish and wait for the correlated reply
    pub async fn send_and_wait(&self, message: Message, timeout: Duration) -> BrokerResult<Message> {
        self.inner.send_and_wait(message, timeout).await
    }

    /// Publish and wait using the configured reply timeout
    pub async fn send_and_wait_default(&self, message: Message) -> BrokerResult<Message> {
        let timeout = self.inner.reply_timeout();
        self.inner.send_and_wait(message, timeout).await
    }

    /// Answer `correlation_id`; silently dropped when nobody is waiting
    pub fn reply(&self, correlation_id: &str, payload: impl Into<Vec<u8>>) {
        self.inner.reply(correlation_id, payload.into(), None)
    }

    /// Answer `correlation_id` with a stream reference attached
    pub fn reply_with_stream(&self, correlation_id: &str, payload: impl Into<Vec<u8>>, stream_id: StreamId) {
        self.inner.reply(correlation_id, payload.into(), Some(stream_id))
    }

    pub fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout()
    }

    pub fn set_reply_timeout(&self, timeout: Duration) {
        debug!(?timeout, "MessageBroker::set_reply_timeout: called");
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.inner.reply_timeout_ms.store(millis, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> BrokerMetrics {
        self.inner.metrics()
    }

    /// Reject further traffic and cancel pending waits
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Deferred dispatcher task
async fn run_dispatcher(inner: Weak<BrokerInner>, mut rx: mpsc::UnboundedReceiver<DispatchRequest>) {
    info!("Dispatcher started");

    while let Some(req) = rx.recv().await {
        match req {
            DispatchRequest::Deliver(message) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.deliver(&message);
            }
            DispatchRequest::Shutdown => break,
        }
    }

    info!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn broker() -> MessageBroker {
        MessageBroker::new(BrokerConfig::default()).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> MessageHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &str| -> MessageHandler {
                let log = log.clone();
                let name = name.to_string();
                Arc::new(move |msg: &Message| {
                    log.lock().unwrap().push(format!("{}:{}", name, msg.payload_str().unwrap_or("")));
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let broker = broker();
        assert!(broker.publish(Message::new("Nobody", "Listens", "{}")).is_ok());
        assert_eq!(broker.metrics().messages_published, 1);
        assert_eq!(broker.metrics().deliveries, 0);
    }

    #[test]
    fn test_publish_in_registration_order() {
        let broker = broker();
        let (log, make) = recorder();
        for name in ["first", "second", "third"] {
            let handler = make(name);
            broker
                .subscribe("Nav", "Start", move |m| handler(m), name)
                .unwrap();
        }

        broker.publish(Message::new("Nav", "Start", "go")).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first:go", "second:go", "third:go"]);
    }

    #[test]
    fn test_failing_handler_isolated() {
        let broker = broker();
        let (log, make) = recorder();

        broker
            .subscribe("Nav", "Start", |_| Err(eyre::eyre!("boom")), "bad")
            .unwrap();
        broker
            .subscribe("Nav", "Start", |_| panic!("handler panic"), "worse")
            .unwrap();
        let good = make("good");
        broker.subscribe("Nav", "Start", move |m| good(m), "good").unwrap();

        assert!(broker.publish(Message::new("Nav", "Start", "x")).is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["good:x"]);

        let metrics = broker.metrics();
        assert_eq!(metrics.handler_failures, 2);
        assert_eq!(metrics.deliveries, 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let broker = Arc::new(broker());
        let handle = broker.handle();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        broker
            .subscribe(
                "Nav",
                "Start",
                move |_| {
                    calls_in.fetch_add(1, Ordering::SeqCst);
                    // Re-entrant structural change must not deadlock
                    let _ = handle.subscribe("Nav", "Late", |_| Ok(()), "late");
                    Ok(())
                },
                "nav",
            )
            .unwrap();

        broker.publish(Message::new("Nav", "Start", "")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.lookup("Nav", "Late").len(), 1);
    }

    #[tokio::test]
    async fn test_send_and_wait_inline_reply() {
        let broker = broker();
        let handle = broker.handle();
        broker
            .subscribe(
                "Alexa",
                "GetState",
                move |m| {
                    handle.reply(m.correlation_id(), r#"{"state":"IDLE"}"#)?;
                    Ok(())
                },
                "alexa",
            )
            .unwrap();

        let reply = broker
            .send_and_wait(Message::new("Alexa", "GetState", "{}"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.kind(), MessageKind::Reply);
        assert_eq!(reply.topic(), "Alexa");
        assert_eq!(reply.payload_str(), Some(r#"{"state":"IDLE"}"#));
        assert_eq!(broker.metrics().replies_delivered, 1);
        assert_eq!(broker.metrics().pending_waits, 0);
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let broker = broker();
        let msg = Message::with_id("q-1", "Alexa", "GetState", "{}");

        let err = broker
            .send_and_wait(msg, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // Late reply is dropped without error
        broker.reply("q-1", "too late");
        let metrics = broker.metrics();
        assert_eq!(metrics.wait_timeouts, 1);
        assert_eq!(metrics.replies_dropped, 1);
        assert_eq!(metrics.pending_waits, 0);
    }

    #[tokio::test]
    async fn test_duplicate_wait_is_invalid_state() {
        let broker = Arc::new(broker());
        let first = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_wait(Message::with_id("dup", "T", "A", ""), Duration::from_millis(200))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = broker
            .send_and_wait(Message::with_id("dup", "T", "A", ""), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));

        broker.reply("dup", "answer");
        let reply = first.await.unwrap().unwrap();
        assert_eq!(reply.payload(), b"answer");
    }

    #[test]
    fn test_reply_without_waiter_dropped() {
        let broker = broker();
        broker.reply("nobody-waits", "x");
        assert_eq!(broker.metrics().replies_dropped, 1);
    }

    #[tokio::test]
    async fn test_reply_observers_see_consumed_replies() {
        let broker = broker();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = seen.clone();
        broker
            .subscribe_kind(
                MessageKind::Reply,
                "Alexa",
                "GetState",
                move |_| {
                    seen_in.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                "observer",
            )
            .unwrap();

        // Dropped reply: observers never see it
        broker.reply("ghost", "x");
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let handle = broker.handle();
        broker
            .subscribe(
                "Alexa",
                "GetState",
                move |m| {
                    handle.reply(m.correlation_id(), "ok")?;
                    Ok(())
                },
                "alexa",
            )
            .unwrap();
        broker
            .send_and_wait(Message::new("Alexa", "GetState", ""), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_reply_message_resolves_waiter() {
        let broker = Arc::new(broker());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_wait(Message::with_id("q-7", "Nav", "GetState", ""), Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker
            .publish(Message::reply("q-7", "Nav", "GetState", "state"))
            .unwrap();
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.payload(), b"state");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waits_and_rejects_publish() {
        let broker = Arc::new(broker());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_wait(Message::new("Nav", "GetState", ""), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker.shutdown();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
        assert!(broker.publish(Message::new("Nav", "Start", "")).is_err());
        assert!(broker.is_shutdown());
    }

    #[tokio::test]
    async fn test_deferred_dispatch_preserves_order() {
        let broker = MessageBroker::new(BrokerConfig::deferred()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe(
                "Audio",
                "Chunk",
                move |m| {
                    tx.send(m.payload().to_vec())?;
                    Ok(())
                },
                "audio",
            )
            .unwrap();

        for i in 0..10u8 {
            broker.publish(Message::new("Audio", "Chunk", vec![i])).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_deferred_send_and_wait() {
        let broker = MessageBroker::new(BrokerConfig::deferred()).unwrap();
        let handle = broker.handle();
        broker
            .subscribe(
                "Nav",
                "GetState",
                move |m| {
                    handle.reply(m.correlation_id(), "ready")?;
                    Ok(())
                },
                "nav",
            )
            .unwrap();

        let reply = broker
            .send_and_wait_default(Message::new("Nav", "GetState", ""))
            .await
            .unwrap();
        assert_eq!(reply.payload(), b"ready");
    }

    #[test]
    fn test_deferred_requires_runtime() {
        let err = MessageBroker::new(BrokerConfig::deferred()).err().unwrap();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }

    #[test]
    fn test_set_reply_timeout() {
        let broker = broker();
        assert_eq!(broker.reply_timeout(), Duration::from_millis(500));
        broker.set_reply_timeout(Duration::from_secs(3));
        assert_eq!(broker.reply_timeout(), Duration::from_secs(3));
    }
}
