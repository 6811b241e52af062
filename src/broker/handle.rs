//! BrokerHandle - non-owning client interface to the broker
//!
//! Modules and handlers hold a handle, never the broker itself, so the broker's
//! owner controls its lifetime. Every call fails with `InvalidState` once the
//! broker is gone or shut down.
//!
//! Handles given to registering modules are publish-only: a module's handlers
//! must go through its context's staging so they appear only after the module
//! has fully registered.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use super::core::BrokerInner;
use super::messages::BrokerMetrics;
use super::subscriptions::Slot;
use crate::domain::{Message, MessageKind, StreamId};
use crate::error::{BrokerError, BrokerResult};

/// Cloneable, non-owning reference to a [`MessageBroker`](super::MessageBroker)
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Weak<BrokerInner>,
    can_subscribe: bool,
}

impl BrokerHandle {
    pub(crate) fn new(inner: Weak<BrokerInner>) -> Self {
        Self {
            inner,
            can_subscribe: true,
        }
    }

    /// Same broker, with `subscribe`/`unsubscribe` refused
    pub(crate) fn publish_only(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            can_subscribe: false,
        }
    }

    pub fn can_subscribe(&self) -> bool {
        self.can_subscribe
    }

    fn check_subscribe(&self) -> BrokerResult<()> {
        if self.can_subscribe {
            Ok(())
        } else {
            Err(BrokerError::InvalidState(
                "module handles are publish-only; subscribe through ModuleContext".to_string(),
            ))
        }
    }

    fn upgrade(&self) -> BrokerResult<Arc<BrokerInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| BrokerError::InvalidState("broker has been dropped".to_string()))
    }

    /// Whether the broker still exists and accepts traffic
    pub fn is_alive(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| !inner.is_shutdown())
    }

    /// Fire-and-forget publish
    pub fn publish(&self, message: Message) -> BrokerResult<()> {
        self.upgrade()?.publish(message)
    }

    /// Publish and wait for the correlated reply
    pub async fn send_and_wait(&self, message: Message, timeout: Duration) -> BrokerResult<Message> {
        let inner = self.upgrade()?;
        inner.send_and_wait(message, timeout).await
    }

    /// Publish and wait using the broker's configured reply timeout
    pub async fn send_and_wait_default(&self, message: Message) -> BrokerResult<Message> {
        let inner = self.upgrade()?;
        let timeout = inner.reply_timeout();
        inner.send_and_wait(message, timeout).await
    }

    /// Answer `correlation_id`; dropped when nobody is waiting
    pub fn reply(&self, correlation_id: &str, payload: impl Into<Vec<u8>>) -> BrokerResult<()> {
        self.upgrade()?.reply(correlation_id, payload.into(), None);
        Ok(())
    }

    /// Answer `correlation_id` with a stream reference attached
    pub fn reply_with_stream(
        &self,
        correlation_id: &str,
        payload: impl Into<Vec<u8>>,
        stream_id: StreamId,
    ) -> BrokerResult<()> {
        self.upgrade()?.reply(correlation_id, payload.into(), Some(stream_id));
        Ok(())
    }

    /// Register a publish handler on behalf of `module`
    pub fn subscribe<F>(&self, topic: &str, action: &str, handler: F, module: &str) -> BrokerResult<()>
    where
        F: Fn(&Message) -> eyre::Result<()> + Send + Sync + 'static,
    {
        debug!(%topic, %action, %module, "BrokerHandle::subscribe: called");
        self.check_subscribe()?;
        self.upgrade()?
            .subscribe(Slot::new(MessageKind::Publish, topic, action), module, Arc::new(handler))
    }

    /// Remove `module`'s publish handler on (topic, action)
    pub fn unsubscribe(&self, topic: &str, action: &str, module: &str) -> BrokerResult<bool> {
        debug!(%topic, %action, %module, "BrokerHandle::unsubscribe: called");
        self.check_subscribe()?;
        Ok(self
            .upgrade()?
            .subscriptions()
            .unsubscribe(&Slot::new(MessageKind::Publish, topic, action), module))
    }

    pub fn metrics(&self) -> BrokerResult<BrokerMetrics> {
        Ok(self.upgrade()?.metrics())
    }
}
