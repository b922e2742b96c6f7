//! Shared primitives for the MTU message-correlation hub: the wire message
//! model, the per-point cache, subscription policy, framing codec, and the
//! resilience/config building blocks used by both the hub and its clients.

pub mod cache;
pub mod config;
pub mod error;
pub mod framing;
pub mod model;
pub mod resilience;

pub use error::{MtuError, MtuResult};
