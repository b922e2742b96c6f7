//! Outbound path: reconciles the cache once a command has actually left the
//! wire, including the global-COA fan-out bookkeeping needed so each RTU's
//! individual acknowledgement can still be tracked.

use mtu_shared::cache::{CacheEntry, MessageCache, MsgStatus};
use mtu_shared::model::{Coa, Ioa, TypeId};

/// Marks a per-(COA, IOA) command as having left the wire. Called once the
/// IEC-104 client confirms the send, moving the entry from
/// `WaitingForSend` to `SentNoAck`.
pub fn mark_dp_sent(cache: &MessageCache, coa: Coa, ioa: Ioa) -> bool {
    cache.data_points.update_status(coa, ioa, MsgStatus::SentNoAck)
}

/// Marks a parameter-activation command as having left the wire.
pub fn mark_param_sent(cache: &MessageCache, coa: Coa, ioa: Ioa) {
    cache.parameters.update_status(coa, ioa, MsgStatus::SentNoAck);
}

/// Records that a global-COA broadcast command (general interrogation,
/// clock sync) was actually dispatched to one specific RTU.
///
/// The broadcast entry itself stays queued under `type_id` until every
/// addressed RTU has answered; this only tracks that `rtu_coa`'s leg of the
/// fan-out is now outstanding.
pub fn record_broadcast_dispatch(cache: &MessageCache, rtu_coa: Coa, type_id: TypeId) -> bool {
    if let Some(mut entry) = cache.global.get_broadcast_if_queued(type_id) {
        entry.decrement_msg_max_tries();
        cache.global.store_broadcast(type_id, entry);
        cache.global.mark_rtu_active(rtu_coa, type_id)
    } else {
        false
    }
}

/// Registers a brand-new global broadcast command as queued, to be sent to
/// every connected RTU.
pub fn queue_broadcast(cache: &MessageCache, type_id: TypeId, entry: CacheEntry) {
    cache.global.store_broadcast(type_id, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtu_shared::model::{IecMsg, SysInfoControl};

    fn clock_sync_entry(reference_nr: &str) -> CacheEntry {
        CacheEntry::new(
            IecMsg::SysInfoControl(SysInfoControl {
                coa: mtu_shared::model::GLOBAL_COA,
                type_id: TypeId::C_CS_NA_1,
                reference_nr: reference_nr.to_string(),
                max_tries: 3,
            }),
            MsgStatus::WaitingForSend,
        )
    }

    #[test]
    fn mark_dp_sent_requires_an_active_entry() {
        let cache = MessageCache::new();
        assert!(!mark_dp_sent(&cache, 1, 2));
    }

    #[test]
    fn broadcast_dispatch_tracks_each_rtu_independently() {
        let cache = MessageCache::new();
        queue_broadcast(&cache, TypeId::C_CS_NA_1, clock_sync_entry("MTU_1"));

        assert!(record_broadcast_dispatch(&cache, 14, TypeId::C_CS_NA_1));
        assert!(record_broadcast_dispatch(&cache, 15, TypeId::C_CS_NA_1));
        assert!(cache.global.is_rtu_active(14, TypeId::C_CS_NA_1));
        assert!(cache.global.is_rtu_active(15, TypeId::C_CS_NA_1));
    }

    #[test]
    fn broadcast_dispatch_without_queued_entry_is_a_noop() {
        let cache = MessageCache::new();
        assert!(!record_broadcast_dispatch(&cache, 14, TypeId::C_CS_NA_1));
    }
}
