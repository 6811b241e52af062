//! Waiter table for send-and-wait correlation
//!
//! One entry per outstanding correlation id. An entry is removed exactly once:
//! by the reply that resolves it, by the timeout that abandons it, or by
//! broker shutdown.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::Message;
use crate::error::{BrokerError, BrokerResult};

/// Completion side of a pending wait
pub(crate) type ReplySender = oneshot::Sender<BrokerResult<Message>>;

/// A registered waiter
pub(crate) struct Waiter {
    pub topic: String,
    pub action: String,
    pub reply_tx: ReplySender,
}

#[derive(Default)]
pub(crate) struct WaiterTable {
    pending: Mutex<HashMap<String, Waiter>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`
    ///
    /// A second registration while the first is pending is an `InvalidState`.
    pub fn register(
        &self,
        correlation_id: &str,
        topic: &str,
        action: &str,
    ) -> BrokerResult<oneshot::Receiver<BrokerResult<Message>>> {
        debug!(%correlation_id, %topic, %action, "WaiterTable::register: called");
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if pending.contains_key(correlation_id) {
            return Err(BrokerError::InvalidState(format!(
                "a wait is already pending for correlation id {}",
                correlation_id
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        pending.insert(
            correlation_id.to_string(),
            Waiter {
                topic: topic.to_string(),
                action: action.to_string(),
                reply_tx,
            },
        );
        Ok(reply_rx)
    }

    /// Remove and return the waiter for `correlation_id`
    pub fn take(&self, correlation_id: &str) -> Option<Waiter> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.remove(correlation_id)
    }

    /// Drop the waiter for `correlation_id`; returns whether one existed
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.take(correlation_id).is_some()
    }

    /// Fail every pending waiter with an error built by `make_err`
    pub fn fail_all(&self, make_err: impl Fn(&str) -> BrokerError) -> usize {
        let drained: Vec<(String, Waiter)> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().collect()
        };

        let count = drained.len();
        for (id, waiter) in drained {
            let _ = waiter.reply_tx.send(Err(make_err(&id)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
