//! Resilience primitives: circuit breaking for RTU sends and reference-number allocation.

pub mod behavior;
pub mod reference;

pub use behavior::{CircuitBreakerBehavior, CircuitBreakerMetrics, CircuitState, RtuCircuitBreaker};
pub use reference::{MtuReferenceAllocator, SubscriberPrefixRegistry};
