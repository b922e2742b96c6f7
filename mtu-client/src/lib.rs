//! Client SDK for applications that connect to the MTU correlation hub.
//!
//! Three pieces, composable independently:
//! - [`command_client::CommandClient`]: request/reply round trips against the command server.
//! - [`publisher_client::PublisherClient`]: subscribes to every message the hub publishes.
//! - [`combi_client::CombiClient`]: composes both, routing asynchronous updates that relate to a
//!   prior command back to that command's own callback.

pub mod combi_client;
pub mod command_client;
pub mod publisher_client;

pub use combi_client::CombiClient;
pub use command_client::CommandClient;
pub use publisher_client::PublisherClient;
