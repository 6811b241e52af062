//! Runtime action enablement lookup

/// Answers whether a module's conditional action is switched on
///
/// Implemented by [`ModulesConfig`](crate::config::ModulesConfig); closures work too.
pub trait ActionEnablement: Send + Sync {
    fn is_action_enabled(&self, module: &str, action: &str) -> bool;
}

/// Enables every action
#[derive(Debug, Clone, Copy, Default)]
pub struct AllEnabled;

impl ActionEnablement for AllEnabled {
    fn is_action_enabled(&self, _module: &str, _action: &str) -> bool {
        true
    }
}

impl<F> ActionEnablement for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn is_action_enabled(&self, module: &str, action: &str) -> bool {
        self(module, action)
    }
}
