//! Message broker for inter-module communication
//!
//! The broker routes messages addressed by (topic, action) via two primitives:
//! - **Publish:** Deliver to every subscriber, in registration order
//! - **Send-and-wait:** Publish, then wait for the correlated reply or a timeout

mod config;
mod core;
mod handle;
mod messages;
mod subscriptions;
mod waiters;

pub use config::{BrokerConfig, DispatchMode};
pub use self::core::{BROKER_VERSION, MessageBroker};
pub use handle::BrokerHandle;
pub use messages::BrokerMetrics;
pub use subscriptions::{ACTION_ANY, MessageHandler, Slot, Subscriber, SubscriptionTable};
