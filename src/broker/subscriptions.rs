//! Subscription table: (kind, topic, action) slots to ordered handler lists
//!
//! Structural changes take the write lock; `lookup` takes the read lock and
//! returns an owned snapshot, so handlers always run outside the lock and a
//! reader never sees a half-applied subscribe or unsubscribe.
//!
//! A snapshot can outlive an unsubscribe, so every subscriber also carries its
//! module's [`ModuleGate`]. Retiring a module closes the gate: handlers from
//! stale snapshots are skipped, and the retire call returns only once calls
//! already inside a handler have finished.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::domain::{Message, MessageKind};
use crate::error::{BrokerError, BrokerResult};

/// Action that matches every action on a topic
pub const ACTION_ANY: &str = "*";

/// Callback invoked for each delivered message
///
/// Errors are logged by the broker and never reach the publisher.
pub type MessageHandler = Arc<dyn Fn(&Message) -> eyre::Result<()> + Send + Sync>;

/// Address of a subscription slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    pub kind: MessageKind,
    pub topic: String,
    pub action: String,
}

impl Slot {
    pub fn new(kind: MessageKind, topic: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            action: action.into(),
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.topic, self.action)
    }
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    in_flight: usize,
}

/// Delivery gate shared by every handler of one module
#[derive(Debug, Default)]
pub struct ModuleGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl ModuleGate {
    pub fn is_open(&self) -> bool {
        !self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// Admit one handler call; `None` once the gate is closed
    ///
    /// Nested calls on the same thread are fine: admission is a counter, not a lock.
    pub(crate) fn enter(&self) -> Option<GatePass<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(GatePass { gate: self })
    }

    /// Close the gate and wait until no handler call is in flight
    ///
    /// Must not be called from inside one of this module's own handlers.
    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        while state.in_flight > 0 {
            state = self.drained.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// An admitted handler call; leaving releases the gate
pub(crate) struct GatePass<'a> {
    gate: &'a ModuleGate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.drained.notify_all();
        }
    }
}

/// A handler as returned by `lookup`
#[derive(Clone)]
pub struct Subscriber {
    /// Registration sequence number; lower registered earlier
    pub seq: u64,
    /// Owning module id
    pub module: String,
    pub handler: MessageHandler,
    pub(crate) gate: Arc<ModuleGate>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("seq", &self.seq)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TableInner {
    slots: HashMap<Slot, Vec<Subscriber>>,
    gates: HashMap<String, Arc<ModuleGate>>,
    next_seq: u64,
}

/// Concurrent subscription table
#[derive(Default)]
pub struct SubscriptionTable {
    inner: RwLock<TableInner>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `slot` for `module`
    ///
    /// Fails with `DuplicateRegistration` if the module already holds this slot,
    /// and with `InvalidState` once the module has been retired.
    pub fn subscribe(&self, slot: Slot, module: &str, handler: MessageHandler) -> BrokerResult<u64> {
        debug!(%slot, %module, "SubscriptionTable::subscribe: called");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let gate = inner.gates.entry(module.to_string()).or_default().clone();
        if !gate.is_open() {
            return Err(BrokerError::InvalidState(format!("module {} has been retired", module)));
        }

        if inner
            .slots
            .get(&slot)
            .is_some_and(|subs| subs.iter().any(|s| s.module == module))
        {
            return Err(BrokerError::DuplicateRegistration {
                topic: slot.topic,
                action: slot.action,
                module: module.to_string(),
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.entry(slot).or_default().push(Subscriber {
            seq,
            module: module.to_string(),
            handler,
            gate,
        });
        Ok(seq)
    }

    /// Remove one module's handler from a slot; returns whether one was removed
    pub fn unsubscribe(&self, slot: &Slot, module: &str) -> bool {
        debug!(%slot, %module, "SubscriptionTable::unsubscribe: called");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let Some(subs) = inner.slots.get_mut(slot) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.module != module);
        let removed = subs.len() != before;
        if subs.is_empty() {
            inner.slots.remove(slot);
        }
        removed
    }

    /// Remove every handler owned by `module`; returns how many were removed
    pub fn unsubscribe_all(&self, module: &str) -> usize {
        debug!(%module, "SubscriptionTable::unsubscribe_all: called");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let mut removed = 0;
        inner.slots.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.module != module);
            removed += before - subs.len();
            !subs.is_empty()
        });
        removed
    }

    /// Remove every handler owned by `module` and close its gate for good
    ///
    /// Returns after any of the module's handler calls already in flight on
    /// other threads have finished; handlers in older `lookup` snapshots are
    /// skipped from then on. Later subscriptions for `module` are rejected.
    pub fn retire_module(&self, module: &str) -> usize {
        debug!(%module, "SubscriptionTable::retire_module: called");
        let (removed, gate) = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut removed = 0;
            inner.slots.retain(|_, subs| {
                let before = subs.len();
                subs.retain(|s| s.module != module);
                removed += before - subs.len();
                !subs.is_empty()
            });
            (removed, inner.gates.entry(module.to_string()).or_default().clone())
        };

        gate.close();
        removed
    }

    /// Handlers for (kind, topic, action) in registration order
    ///
    /// Wildcard (`*`) subscribers on the topic are merged in by registration order.
    pub fn lookup(&self, kind: MessageKind, topic: &str, action: &str) -> Vec<Subscriber> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let exact = inner.slots.get(&Slot::new(kind, topic, action));
        let wildcard = if action == ACTION_ANY {
            None
        } else {
            inner.slots.get(&Slot::new(kind, topic, ACTION_ANY))
        };

        match (exact, wildcard) {
            (None, None) => Vec::new(),
            (Some(subs), None) | (None, Some(subs)) => subs.clone(),
            (Some(a), Some(b)) => merge_by_seq(a, b),
        }
    }

    /// Total number of registered handlers
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.slots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of handlers owned by `module`
    pub fn count_for_module(&self, module: &str) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .slots
            .values()
            .flat_map(|subs| subs.iter())
            .filter(|s| s.module == module)
            .count()
    }
}

fn merge_by_seq(a: &[Subscriber], b: &[Subscriber]) -> Vec<Subscriber> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].seq < b[j].seq {
            merged.push(a[i].clone());
            i += 1;
        } else {
            merged.push(b[j].clone());
            j += 1;
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn noop() -> MessageHandler {
        Arc::new(|_| Ok(()))
    }

    fn publish_slot(topic: &str, action: &str) -> Slot {
        Slot::new(MessageKind::Publish, topic, action)
    }

    fn modules(subs: &[Subscriber]) -> Vec<String> {
        subs.iter().map(|s| s.module.clone()).collect()
    }

    #[test]
    fn test_lookup_registration_order() {
        let table = SubscriptionTable::new();
        for module in ["c", "a", "b"] {
            table.subscribe(publish_slot("Nav", "Start"), module, noop()).unwrap();
        }

        let subs = table.lookup(MessageKind::Publish, "Nav", "Start");
        assert_eq!(modules(&subs), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = SubscriptionTable::new();
        table.subscribe(publish_slot("Nav", "Start"), "nav", noop()).unwrap();

        let err = table.subscribe(publish_slot("Nav", "Start"), "nav", noop()).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateRegistration { .. }));

        // Same module, other action is fine
        table.subscribe(publish_slot("Nav", "Cancel"), "nav", noop()).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unsubscribe_all_removes_only_owner() {
        let table = SubscriptionTable::new();
        table.subscribe(publish_slot("Nav", "Start"), "nav", noop()).unwrap();
        table.subscribe(publish_slot("Nav", "Cancel"), "nav", noop()).unwrap();
        table.subscribe(publish_slot("Nav", "Start"), "ui", noop()).unwrap();

        assert_eq!(table.unsubscribe_all("nav"), 2);
        assert_eq!(modules(&table.lookup(MessageKind::Publish, "Nav", "Start")), vec!["ui"]);
        assert!(table.lookup(MessageKind::Publish, "Nav", "Cancel").is_empty());
        assert_eq!(table.count_for_module("nav"), 0);
    }

    #[test]
    fn test_wildcard_merged_by_registration_order() {
        let table = SubscriptionTable::new();
        table.subscribe(publish_slot("Nav", "Start"), "first", noop()).unwrap();
        table.subscribe(publish_slot("Nav", ACTION_ANY), "logger", noop()).unwrap();
        table.subscribe(publish_slot("Nav", "Start"), "third", noop()).unwrap();

        let subs = table.lookup(MessageKind::Publish, "Nav", "Start");
        assert_eq!(modules(&subs), vec!["first", "logger", "third"]);

        let subs = table.lookup(MessageKind::Publish, "Nav", "Cancel");
        assert_eq!(modules(&subs), vec!["logger"]);
    }

    #[test]
    fn test_kind_separates_slots() {
        let table = SubscriptionTable::new();
        table
            .subscribe(Slot::new(MessageKind::Reply, "Nav", "Start"), "observer", noop())
            .unwrap();

        assert!(table.lookup(MessageKind::Publish, "Nav", "Start").is_empty());
        assert_eq!(table.lookup(MessageKind::Reply, "Nav", "Start").len(), 1);
    }

    #[test]
    fn test_resubscribe_moves_to_back() {
        let table = SubscriptionTable::new();
        table.subscribe(publish_slot("T", "A"), "x", noop()).unwrap();
        table.subscribe(publish_slot("T", "A"), "y", noop()).unwrap();
        assert!(table.unsubscribe(&publish_slot("T", "A"), "x"));
        table.subscribe(publish_slot("T", "A"), "x", noop()).unwrap();

        assert_eq!(modules(&table.lookup(MessageKind::Publish, "T", "A")), vec!["y", "x"]);
    }

    #[test]
    fn test_retired_module_rejected_and_skipped() {
        let table = SubscriptionTable::new();
        table.subscribe(publish_slot("Nav", "Start"), "nav", noop()).unwrap();
        table.subscribe(publish_slot("Nav", "Start"), "ui", noop()).unwrap();
        let stale = table.lookup(MessageKind::Publish, "Nav", "Start");

        assert_eq!(table.retire_module("nav"), 1);

        assert!(stale[0].gate.enter().is_none());
        assert!(stale[1].gate.enter().is_some());
        assert_eq!(modules(&table.lookup(MessageKind::Publish, "Nav", "Start")), vec!["ui"]);

        let err = table.subscribe(publish_slot("Nav", "Cancel"), "nav", noop()).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }

    #[test]
    fn test_retire_waits_for_in_flight_handler() {
        let table = Arc::new(SubscriptionTable::new());
        table.subscribe(publish_slot("Nav", "Start"), "nav", noop()).unwrap();
        let snapshot = table.lookup(MessageKind::Publish, "Nav", "Start");
        let events = Arc::new(Mutex::new(Vec::new()));

        let pass = snapshot[0].gate.enter().unwrap();
        let retirer = {
            let table = table.clone();
            let events = events.clone();
            std::thread::spawn(move || {
                table.retire_module("nav");
                events.lock().unwrap().push("retired");
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        events.lock().unwrap().push("handler done");
        drop(pass);
        retirer.join().unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["handler done", "retired"]);
    }

    #[test]
    fn test_nested_entry_allowed() {
        let gate = ModuleGate::default();
        let outer = gate.enter().unwrap();
        let inner = gate.enter().unwrap();
        drop(inner);
        drop(outer);
        gate.close();
        assert!(!gate.is_open());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(u8),
        Unsubscribe(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..6).prop_map(Op::Subscribe), (0u8..6).prop_map(Op::Unsubscribe)]
    }

    proptest! {
        #[test]
        fn prop_lookup_matches_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let table = SubscriptionTable::new();
            let slot = publish_slot("Topic", "Action");
            let mut model: Vec<String> = Vec::new();

            for op in ops {
                match op {
                    Op::Subscribe(m) => {
                        let module = format!("m{}", m);
                        let result = table.subscribe(slot.clone(), &module, noop());
                        if model.contains(&module) {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            model.push(module);
                        }
                    }
                    Op::Unsubscribe(m) => {
                        let module = format!("m{}", m);
                        let removed = table.unsubscribe(&slot, &module);
                        prop_assert_eq!(removed, model.contains(&module));
                        model.retain(|x| x != &module);
                    }
                }
            }

            prop_assert_eq!(modules(&table.lookup(MessageKind::Publish, "Topic", "Action")), model);
        }
    }
}
