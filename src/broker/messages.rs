//! Dispatcher requests and broker metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::domain::Message;

/// Work items for the deferred dispatcher task
#[derive(Debug)]
pub(crate) enum DispatchRequest {
    /// Deliver a message to its current subscribers
    Deliver(Message),

    /// Stop the dispatcher
    Shutdown,
}

/// Broker metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerMetrics {
    pub messages_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub replies_delivered: u64,
    pub replies_dropped: u64,
    pub wait_timeouts: u64,
    pub pending_waits: usize,
    pub total_subscriptions: usize,
}

/// Lock-free counters behind [`BrokerMetrics`]
#[derive(Debug, Default)]
pub(crate) struct MetricCounters {
    pub messages_published: AtomicU64,
    pub deliveries: AtomicU64,
    pub handler_failures: AtomicU64,
    pub replies_delivered: AtomicU64,
    pub replies_dropped: AtomicU64,
    pub wait_timeouts: AtomicU64,
}

impl MetricCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_waits: usize, total_subscriptions: usize) -> BrokerMetrics {
        BrokerMetrics {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            replies_delivered: self.replies_delivered.load(Ordering::Relaxed),
            replies_dropped: self.replies_dropped.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            pending_waits,
            total_subscriptions,
        }
    }
}
