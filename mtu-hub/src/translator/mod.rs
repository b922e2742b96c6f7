//! Protocol translator: the component that sits between the raw IEC-104
//! client library and the subscription layer, turning RTU traffic into
//! [`mtu_shared::model::IecMsg`] values and vice versa.

pub mod inbound;
pub mod outbound;
pub mod rtu_link;

pub use inbound::{
    on_confirmation, on_datapoint, on_global_confirmation, on_interrogation_confirmation,
    on_parameter_confirmation,
};
pub use outbound::{mark_dp_sent, mark_param_sent, queue_broadcast, record_broadcast_dispatch};
pub use rtu_link::{InMemoryRtuLink, RtuDataPoint, RtuLink};

use std::sync::Arc;

use mtu_shared::cache::MessageCache;
use mtu_shared::model::SubscriptionPolicy;
use mtu_shared::resilience::MtuReferenceAllocator;

/// Bundles the cache and reference allocator the translator's free functions
/// need, so callers don't have to thread three arguments through every call site.
#[derive(Debug, Clone)]
pub struct ProtocolTranslator {
    pub cache: Arc<MessageCache>,
    pub allocator: Arc<MtuReferenceAllocator>,
}

impl ProtocolTranslator {
    #[must_use]
    pub fn new(cache: Arc<MessageCache>, allocator: Arc<MtuReferenceAllocator>) -> Self {
        Self { cache, allocator }
    }

    pub fn on_datapoint(
        &self,
        policy: &SubscriptionPolicy,
        point: &RtuDataPoint,
        cot: mtu_shared::model::Cot,
    ) -> mtu_shared::error::MtuResult<Option<mtu_shared::model::IecMsg>> {
        inbound::on_datapoint(&self.cache, policy, &self.allocator, point, cot)
    }

    pub fn on_confirmation(
        &self,
        policy: &SubscriptionPolicy,
        coa: mtu_shared::model::Coa,
        ioa: mtu_shared::model::Ioa,
        type_id: mtu_shared::model::TypeId,
        cot: mtu_shared::model::Cot,
        negative: bool,
    ) -> mtu_shared::error::MtuResult<Option<mtu_shared::model::IecMsg>> {
        inbound::on_confirmation(&self.cache, policy, coa, ioa, type_id, cot, negative)
    }

    pub fn on_parameter_confirmation(
        &self,
        policy: &SubscriptionPolicy,
        coa: mtu_shared::model::Coa,
        ioa: mtu_shared::model::Ioa,
        cot: mtu_shared::model::Cot,
        negative: bool,
    ) -> mtu_shared::error::MtuResult<Option<mtu_shared::model::IecMsg>> {
        inbound::on_parameter_confirmation(&self.cache, policy, coa, ioa, cot, negative)
    }

    pub fn on_global_confirmation(
        &self,
        policy: &SubscriptionPolicy,
        rtu_coa: mtu_shared::model::Coa,
        type_id: mtu_shared::model::TypeId,
        cot: mtu_shared::model::Cot,
        negative: bool,
    ) -> mtu_shared::error::MtuResult<Option<mtu_shared::model::IecMsg>> {
        inbound::on_global_confirmation(&self.cache, policy, rtu_coa, type_id, cot, negative)
    }

    pub fn on_interrogation_confirmation(
        &self,
        policy: &SubscriptionPolicy,
        coa: mtu_shared::model::Coa,
        cot: mtu_shared::model::Cot,
        negative: bool,
    ) -> mtu_shared::error::MtuResult<Option<mtu_shared::model::IecMsg>> {
        inbound::on_interrogation_confirmation(&self.cache, policy, coa, cot, negative)
    }
}
