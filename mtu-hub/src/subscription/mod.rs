//! Subscription layer: subscriber identity, command execution, periodic
//! aggregation, and the manager that wires all three to the RTU link.

pub mod command_handler;
pub mod manager;
pub mod periodic_aggregator;
pub mod subscriber;

pub use command_handler::CommandHandler;
pub use manager::SubscriptionManager;
pub use subscriber::{SubscriberHandle, SubscriberRegistry};
