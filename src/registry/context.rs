//! ModuleContext - what a module sees while it registers
//!
//! Subscriptions made here are staged. The registry commits them to the broker
//! only after the module's post-register hook succeeds, so no handler of a
//! module that has not completed registration is ever reachable.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::descriptor::ModuleDescriptor;
use super::enablement::ActionEnablement;
use crate::broker::{BrokerHandle, MessageHandler, Slot};
use crate::domain::{Message, MessageKind, Version};
use crate::error::{BrokerError, BrokerResult};
use crate::stream::StreamManager;

/// Per-module registration context
pub struct ModuleContext {
    descriptor: ModuleDescriptor,
    broker: BrokerHandle,
    streams: Arc<StreamManager>,
    enablement: Arc<dyn ActionEnablement>,
    live_dependencies: HashMap<String, Version>,
    staged: Vec<(Slot, MessageHandler)>,
}

impl ModuleContext {
    pub(crate) fn new(
        descriptor: ModuleDescriptor,
        broker: BrokerHandle,
        streams: Arc<StreamManager>,
        enablement: Arc<dyn ActionEnablement>,
        live_dependencies: HashMap<String, Version>,
    ) -> Self {
        Self {
            descriptor,
            broker,
            streams,
            enablement,
            live_dependencies,
            staged: Vec::new(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    /// Non-owning, publish-only broker reference, safe to move into handlers
    ///
    /// Its `subscribe` fails with `InvalidState`; use [`ModuleContext::subscribe`].
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Version of a registered dependency; `None` for absent or failed optional ones
    pub fn dependency_version(&self, name: &str) -> Option<Version> {
        self.live_dependencies.get(name).copied()
    }

    /// Whether `action` is enabled for this module
    ///
    /// Actions outside the descriptor's conditional list are always enabled.
    pub fn is_action_enabled(&self, action: &str) -> bool {
        if !self.descriptor.declares_action(action) {
            return true;
        }
        self.enablement.is_action_enabled(&self.descriptor.name, action)
    }

    /// The descriptor's conditional actions that are currently enabled
    pub fn enabled_actions(&self) -> Vec<String> {
        self.descriptor
            .actions
            .iter()
            .filter(|a| self.enablement.is_action_enabled(&self.descriptor.name, a))
            .cloned()
            .collect()
    }

    /// Stage a publish handler on (topic, action)
    pub fn subscribe<F>(&mut self, topic: &str, action: &str, handler: F) -> BrokerResult<()>
    where
        F: Fn(&Message) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_kind(MessageKind::Publish, topic, action, handler)
    }

    /// Stage a handler for messages of `kind` on (topic, action)
    pub fn subscribe_kind<F>(&mut self, kind: MessageKind, topic: &str, action: &str, handler: F) -> BrokerResult<()>
    where
        F: Fn(&Message) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let slot = Slot::new(kind, topic, action);
        if self.staged.iter().any(|(s, _)| *s == slot) {
            return Err(BrokerError::DuplicateRegistration {
                topic: topic.to_string(),
                action: action.to_string(),
                module: self.descriptor.name.clone(),
            });
        }

        debug!(module = %self.descriptor.name, %slot, "ModuleContext::subscribe_kind: staged");
        self.staged.push((slot, Arc::new(handler)));
        Ok(())
    }

    /// Number of staged subscriptions
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub(crate) fn take_staged(&mut self) -> Vec<(Slot, MessageHandler)> {
        std::mem::take(&mut self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, MessageBroker};
    use crate::registry::AllEnabled;

    fn context(broker: &MessageBroker, enablement: Arc<dyn ActionEnablement>) -> ModuleContext {
        let descriptor = ModuleDescriptor::new("Navigation", Version::new(1, 0))
            .with_action("StartNavigation")
            .with_action("ShowAlternativeRoutes");
        let mut deps = HashMap::new();
        deps.insert("MessageBroker".to_string(), Version::new(4, 0));
        ModuleContext::new(
            descriptor,
            broker.handle(),
            Arc::new(StreamManager::default()),
            enablement,
            deps,
        )
    }

    #[test]
    fn test_staged_subscriptions_not_live() {
        let broker = MessageBroker::new(BrokerConfig::default()).unwrap();
        let mut ctx = context(&broker, Arc::new(AllEnabled));

        ctx.subscribe("Navigation", "StartNavigation", |_| Ok(())).unwrap();
        assert_eq!(ctx.staged_count(), 1);
        assert!(broker.lookup("Navigation", "StartNavigation").is_empty());
    }

    #[test]
    fn test_duplicate_staged_subscription() {
        let broker = MessageBroker::new(BrokerConfig::default()).unwrap();
        let mut ctx = context(&broker, Arc::new(AllEnabled));

        ctx.subscribe("Navigation", "StartNavigation", |_| Ok(())).unwrap();
        let err = ctx.subscribe("Navigation", "StartNavigation", |_| Ok(())).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateRegistration { .. }));

        // Same slot, different kind, is a different registration
        ctx.subscribe_kind(MessageKind::Reply, "Navigation", "StartNavigation", |_| Ok(()))
            .unwrap();
        assert_eq!(ctx.take_staged().len(), 2);
        assert_eq!(ctx.staged_count(), 0);
    }

    #[test]
    fn test_action_enablement() {
        let broker = MessageBroker::new(BrokerConfig::default()).unwrap();
        let ctx = context(
            &broker,
            Arc::new(|_: &str, action: &str| action != "ShowAlternativeRoutes"),
        );

        assert!(ctx.is_action_enabled("StartNavigation"));
        assert!(!ctx.is_action_enabled("ShowAlternativeRoutes"));
        assert!(ctx.is_action_enabled("NavigationStateChanged"));
        assert_eq!(ctx.enabled_actions(), vec!["StartNavigation"]);
    }

    #[test]
    fn test_dependency_version() {
        let broker = MessageBroker::new(BrokerConfig::default()).unwrap();
        let ctx = context(&broker, Arc::new(AllEnabled));
        assert_eq!(ctx.dependency_version("MessageBroker"), Some(Version::new(4, 0)));
        assert_eq!(ctx.dependency_version("Location"), None);
    }
}
