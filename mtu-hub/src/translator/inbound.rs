//! Inbound path: turns freshly-arrived datapoints and confirmation APDUs
//! into the messages subscribers see.

use tracing::{debug, warn};

use mtu_shared::cache::{CacheEntry, MessageCache, MsgStatus};
use mtu_shared::error::{MtuError, MtuResult};
use mtu_shared::model::{
    Coa, Cot, IecMsg, Ioa, ProcessInfoMonitoring, SubscriptionPolicy, TypeId,
    UNEXPECTED_MSG_REFERENCE_NR,
};
use mtu_shared::resilience::MtuReferenceAllocator;

use super::rtu_link::RtuDataPoint;

/// Handles a single freshly-updated information object, deciding whether (and
/// how) it should be republished to subscribers.
///
/// Mirrors the dispatch in the original `on_dp` handler: quality gating
/// first, then branch on cause of transmission.
pub fn on_datapoint(
    cache: &MessageCache,
    policy: &SubscriptionPolicy,
    allocator: &MtuReferenceAllocator,
    point: &RtuDataPoint,
    cot: Cot,
) -> MtuResult<Option<IecMsg>> {
    if !policy.ignore_quality && !point.quality_good {
        debug!(coa = point.coa, ioa = point.ioa, "dropping datapoint with bad quality");
        return Ok(None);
    }

    if cot == Cot::REQUEST {
        return handle_explicit_read(cache, policy, point, cot);
    }

    if cot == Cot::INTERROGATED_BY_STATION {
        return handle_interrogation_value(cache, point, cot);
    }

    if cot == Cot::SPONTANEOUS {
        let mut val_map = std::collections::HashMap::new();
        val_map.insert(point.ioa, point.value.clone());
        let mut ts_map = std::collections::HashMap::new();
        ts_map.insert(point.ioa, point.updated_at_ms);
        return Ok(Some(IecMsg::ProcessInfoMonitoring(ProcessInfoMonitoring {
            coa: point.coa,
            val_map,
            ts_map,
            type_id: point.type_id,
            cot,
            reference_nr: allocator.next(),
        })));
    }

    if cot == Cot::PERIODIC {
        let mut val_map = std::collections::HashMap::new();
        val_map.insert(point.ioa, point.value.clone());
        let mut ts_map = std::collections::HashMap::new();
        ts_map.insert(point.ioa, point.updated_at_ms);
        return Ok(Some(IecMsg::PeriodicUpdate(mtu_shared::model::PeriodicUpdate {
            coa: point.coa,
            val_map,
            ts_map,
            type_id: point.type_id,
            reference_nr: allocator.next(),
        })));
    }

    check_unhandled(policy, cot)
}

fn handle_explicit_read(
    cache: &MessageCache,
    policy: &SubscriptionPolicy,
    point: &RtuDataPoint,
    cot: Cot,
) -> MtuResult<Option<IecMsg>> {
    if !cache.data_points.is_active(point.coa, point.ioa) {
        warn!(coa = point.coa, ioa = point.ioa, "received read-answer without a pending read");
        let mut val_map = std::collections::HashMap::new();
        val_map.insert(point.ioa, point.value.clone());
        let mut ts_map = std::collections::HashMap::new();
        ts_map.insert(point.ioa, point.updated_at_ms);
        return Ok(Some(IecMsg::ProcessInfoMonitoring(ProcessInfoMonitoring {
            coa: point.coa,
            val_map,
            ts_map,
            type_id: point.type_id,
            cot,
            reference_nr: UNEXPECTED_MSG_REFERENCE_NR.to_string(),
        })));
    }

    if policy.combine_ios {
        return Err(MtuError::PolicyUnsupported(
            "combine_ios is not yet implemented".to_string(),
        ));
    }

    let entry = cache
        .data_points
        .remove_active(point.coa, point.ioa)
        .ok_or_else(|| MtuError::MissingCacheEntry {
            coa: point.coa,
            ioa: point.ioa,
        })?;

    let mut val_map = std::collections::HashMap::new();
    val_map.insert(point.ioa, point.value.clone());
    let mut ts_map = std::collections::HashMap::new();
    ts_map.insert(point.ioa, point.updated_at_ms);
    Ok(Some(IecMsg::ProcessInfoMonitoring(ProcessInfoMonitoring {
        coa: point.coa,
        val_map,
        ts_map,
        type_id: point.type_id,
        cot,
        reference_nr: entry.msg.reference_nr().unwrap_or_default().to_string(),
    })))
}

fn handle_interrogation_value(
    cache: &MessageCache,
    point: &RtuDataPoint,
    cot: Cot,
) -> MtuResult<Option<IecMsg>> {
    let entry = cache
        .interrogations
        .get(point.coa)
        .ok_or(MtuError::MissingCacheEntry {
            coa: point.coa,
            ioa: point.ioa,
        })?;
    if entry.status != MsgStatus::ReceivedAck {
        return Err(MtuError::PolicyUnsupported(format!(
            "datapoint for COA {} arrived before its interrogation reached RECEIVED_ACK (status {:?})",
            point.coa, entry.status
        )));
    }
    cache.interrogations.record_value(point.coa, point.ioa, point.value.clone());

    let mut val_map = std::collections::HashMap::new();
    val_map.insert(point.ioa, point.value.clone());
    let mut ts_map = std::collections::HashMap::new();
    ts_map.insert(point.ioa, point.updated_at_ms);
    Ok(Some(IecMsg::ProcessInfoMonitoring(ProcessInfoMonitoring {
        coa: point.coa,
        val_map,
        ts_map,
        type_id: point.type_id,
        cot,
        reference_nr: entry.msg.reference_nr().unwrap_or_default().to_string(),
    })))
}

fn check_unhandled(policy: &SubscriptionPolicy, cot: Cot) -> MtuResult<Option<IecMsg>> {
    if cot.is_unknown() && policy.ignore_unknown_cot_dp_callbacks {
        warn!(?cot, "ignoring datapoint with unclassifiable cause of transmission");
        return Ok(None);
    }
    Err(MtuError::PolicyUnsupported(format!(
        "no handler for cause of transmission {:?}",
        cot
    )))
}

/// Handles an acknowledgement-class APDU (`ACT_CON`, `ACT_TERM`, `DEACT_CON`,
/// `DEACT_TERM`, or a negative variant) arriving for a per-data-point command
/// the hub already has active, advancing its cache entry through the state
/// machine and producing the confirmation/termination message to publish, if
/// any (gated by [`SubscriptionPolicy::acks`] — the cache still transitions
/// even when the policy suppresses the outbound message).
///
/// Clock-sync commands are the one case that may legitimately receive more
/// than one `ACT_CON` before (or instead of) an `ACT_TERM`, because a
/// broadcast clock-sync fans out to every RTU independently.
pub fn on_confirmation(
    cache: &MessageCache,
    policy: &SubscriptionPolicy,
    coa: Coa,
    ioa: Ioa,
    type_id: TypeId,
    cot: Cot,
    negative: bool,
) -> MtuResult<Option<IecMsg>> {
    on_confirmation_against(&cache.data_points, policy, coa, ioa, type_id, cot, negative)
}

/// Handles a confirmation-class APDU arriving from one RTU's leg of a
/// `GLOBAL_COA` fan-out (general interrogation or clock sync).
///
/// Unlike the per-data-point case, a single broadcast command has many
/// outstanding legs (one per connected RTU). The group is reported
/// terminated only once the last leg answers `ACT_TERM`, per the fan-out
/// rule in the cache's own invariants; an individual RTU's negative ACT_CON
/// only fails the whole group if it was the last one still outstanding.
pub fn on_global_confirmation(
    cache: &MessageCache,
    policy: &SubscriptionPolicy,
    rtu_coa: Coa,
    type_id: TypeId,
    cot: Cot,
    negative: bool,
) -> MtuResult<Option<IecMsg>> {
    if !cache.global.is_rtu_active(rtu_coa, type_id) {
        return Ok(None);
    }

    if negative {
        cache.global.clear_rtu_active(rtu_coa, type_id);
        if cache.global.remaining_active(type_id) > 0 {
            return Ok(None);
        }
        let Some(entry) = cache.global.pop_broadcast(type_id) else {
            return Ok(None);
        };
        return Ok(Some(build_confirmation_fail(&entry, mtu_shared::model::FailReason::Negative)));
    }

    if cot != Cot::ACTIVATION_TERM {
        return Ok(None);
    }

    cache.global.clear_rtu_active(rtu_coa, type_id);
    if cache.global.remaining_active(type_id) > 0 {
        return Ok(None);
    }

    let Some(entry) = cache.global.pop_broadcast(type_id) else {
        return Ok(None);
    };
    Ok(policy.acks.then(|| {
        IecMsg::Confirmation(mtu_shared::model::Confirmation::successful_term(
            entry.msg.reference_nr().unwrap_or_default(),
            0,
        ))
    }))
}

/// Handles `ACT_CON`/`ACT_TERM`/negative-`ACT_CON` for a general or counter
/// interrogation addressed to a single, concrete COA (as opposed to a
/// `GLOBAL_COA` fan-out, handled by [`on_global_confirmation`]).
///
/// `ACT_CON` moves the entry to `ReceivedAck`, which is the gate
/// [`handle_interrogation_value`] checks before accepting any
/// `INTERROGATED_BY_STATION` datapoint for this COA. `ACT_TERM` clears the
/// entry and closes out the interrogation; a negative `ACT_CON` fails it
/// immediately without waiting for a termination.
pub fn on_interrogation_confirmation(
    cache: &MessageCache,
    policy: &SubscriptionPolicy,
    coa: Coa,
    cot: Cot,
    negative: bool,
) -> MtuResult<Option<IecMsg>> {
    if negative {
        let Some(entry) = cache.interrogations.remove(coa) else {
            return Ok(None);
        };
        return Ok(Some(build_confirmation_fail(&entry, mtu_shared::model::FailReason::Negative)));
    }

    match cot {
        Cot::ACTIVATION_CON => {
            if !cache.interrogations.update_status(coa, MsgStatus::ReceivedAck) {
                return Ok(None);
            }
            let Some(entry) = cache.interrogations.get(coa) else {
                return Ok(None);
            };
            Ok(policy.acks.then(|| {
                IecMsg::Confirmation(mtu_shared::model::Confirmation::positive_confirmation(
                    entry.msg.reference_nr().unwrap_or_default(),
                    0,
                ))
            }))
        }
        Cot::ACTIVATION_TERM => {
            let Some(entry) = cache.interrogations.remove(coa) else {
                return Ok(None);
            };
            Ok(policy.acks.then(|| {
                IecMsg::Confirmation(mtu_shared::model::Confirmation::successful_term(
                    entry.msg.reference_nr().unwrap_or_default(),
                    0,
                ))
            }))
        }
        _ => Ok(None),
    }
}

/// Symmetric handler for `DEACT_CON`/`DEACT_TERM` against a pending
/// parameter-activation command.
pub fn on_parameter_confirmation(
    cache: &MessageCache,
    policy: &SubscriptionPolicy,
    coa: Coa,
    ioa: Ioa,
    cot: Cot,
    negative: bool,
) -> MtuResult<Option<IecMsg>> {
    if negative {
        let Some(entry) = cache.parameters.remove(coa, ioa) else {
            return Ok(None);
        };
        return Ok(policy.acks.then(|| build_confirmation_fail(&entry, mtu_shared::model::FailReason::Negative)));
    }

    let next_status = match cot {
        Cot::ACTIVATION_CON | Cot::DEACTIVATION_CON => MsgStatus::ReceivedAck,
        Cot::ACTIVATION_TERM => MsgStatus::ReceivedTerm,
        _ => return Ok(None),
    };

    let Some(entry) = cache.parameters.get_if_active(coa, ioa) else {
        return Ok(None);
    };

    if !entry.status.can_transition_to(next_status, false) {
        return Err(MtuError::PolicyUnsupported(format!(
            "unexpected parameter transition {:?} -> {:?} for {coa}:{ioa}",
            entry.status, next_status
        )));
    }

    if next_status == MsgStatus::ReceivedTerm {
        cache.parameters.remove(coa, ioa);
        return Ok(policy.acks.then(|| {
            IecMsg::Confirmation(mtu_shared::model::Confirmation::successful_term(
                entry.msg.reference_nr().unwrap_or_default(),
                0,
            ))
        }));
    }

    cache.parameters.update_status(coa, ioa, next_status);
    Ok(policy.acks.then(|| {
        IecMsg::Confirmation(mtu_shared::model::Confirmation::positive_confirmation(
            entry.msg.reference_nr().unwrap_or_default(),
            0,
        ))
    }))
}

fn on_confirmation_against(
    store: &mtu_shared::cache::DataPointStore,
    policy: &SubscriptionPolicy,
    coa: Coa,
    ioa: Ioa,
    type_id: TypeId,
    cot: Cot,
    negative: bool,
) -> MtuResult<Option<IecMsg>> {
    let tolerate_repeated_ack = type_id == TypeId::C_CS_NA_1 && policy.independent_clock_sync;

    if negative {
        let Some(entry) = store.remove_active(coa, ioa) else {
            return Ok(None);
        };
        return Ok(Some(build_confirmation_fail(&entry, mtu_shared::model::FailReason::Negative)));
    }

    let next_status = match cot {
        Cot::ACTIVATION_CON | Cot::DEACTIVATION_CON => MsgStatus::ReceivedAck,
        Cot::ACTIVATION_TERM => MsgStatus::ReceivedTerm,
        _ => return Ok(None),
    };

    let Some(entry) = store.get_if_active(coa, ioa) else {
        return Ok(None);
    };

    if !entry.status.can_transition_to(next_status, tolerate_repeated_ack) {
        return Err(MtuError::PolicyUnsupported(format!(
            "unexpected transition {:?} -> {:?} for {coa}:{ioa}",
            entry.status, next_status
        )));
    }

    let reference_nr = entry.msg.reference_nr().unwrap_or_default().to_string();

    if next_status == MsgStatus::ReceivedTerm {
        store.archive_and_promote_next(coa, ioa);
        return Ok(policy
            .acks
            .then(|| IecMsg::Confirmation(mtu_shared::model::Confirmation::successful_term(reference_nr, 0))));
    }

    store.update_status(coa, ioa, next_status);
    Ok(policy
        .acks
        .then(|| IecMsg::Confirmation(mtu_shared::model::Confirmation::positive_confirmation(reference_nr, 0))))
}

fn build_confirmation_fail(entry: &CacheEntry, reason: mtu_shared::model::FailReason) -> IecMsg {
    IecMsg::Confirmation(mtu_shared::model::Confirmation::fail(
        entry.msg.reference_nr().unwrap_or_default(),
        0,
        reason,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtu_shared::cache::CacheEntry as Entry;
    use mtu_shared::model::ReadDatapoint;

    fn cache_with_pending_read(coa: Coa, ioa: Ioa, reference_nr: &str) -> MessageCache {
        let cache = MessageCache::new();
        cache.data_points.store_new_active(
            coa,
            ioa,
            Entry::new(
                IecMsg::ReadDatapoint(ReadDatapoint {
                    coa,
                    ioa,
                    reference_nr: reference_nr.to_string(),
                    max_tries: 3,
                    queue_on_collision: false,
                }),
                MsgStatus::SentNoAck,
            ),
        );
        cache
    }

    fn sample_point(coa: Coa, ioa: Ioa) -> RtuDataPoint {
        RtuDataPoint {
            coa,
            ioa,
            type_id: TypeId::M_SP_NA_1,
            value: serde_json::json!(true),
            quality_good: true,
            updated_at_ms: 1,
        }
    }

    #[test]
    fn explicit_read_reply_resolves_pending_command() {
        let cache = cache_with_pending_read(1, 2, "APP_1");
        let policy = SubscriptionPolicy::default();
        let allocator = MtuReferenceAllocator::new();
        let point = sample_point(1, 2);

        let msg = on_datapoint(&cache, &policy, &allocator, &point, Cot::REQUEST)
            .unwrap()
            .unwrap();
        assert_eq!(msg.reference_nr(), Some("APP_1"));
        assert!(!cache.data_points.is_active(1, 2));
    }

    #[test]
    fn unsolicited_read_reply_is_flagged_unexpected() {
        let cache = MessageCache::new();
        let policy = SubscriptionPolicy::default();
        let allocator = MtuReferenceAllocator::new();
        let point = sample_point(1, 2);

        let msg = on_datapoint(&cache, &policy, &allocator, &point, Cot::REQUEST)
            .unwrap()
            .unwrap();
        assert_eq!(msg.reference_nr(), Some(UNEXPECTED_MSG_REFERENCE_NR));
    }

    #[test]
    fn spontaneous_update_gets_hub_initiated_reference() {
        let cache = MessageCache::new();
        let policy = SubscriptionPolicy::default();
        let allocator = MtuReferenceAllocator::new();
        let point = sample_point(1, 2);

        let msg = on_datapoint(&cache, &policy, &allocator, &point, Cot::SPONTANEOUS)
            .unwrap()
            .unwrap();
        assert!(msg.mtu_initiated());
    }

    #[test]
    fn bad_quality_is_dropped_unless_policy_ignores_it() {
        let cache = MessageCache::new();
        let allocator = MtuReferenceAllocator::new();
        let mut point = sample_point(1, 2);
        point.quality_good = false;

        let policy = SubscriptionPolicy {
            ignore_quality: false,
            ..SubscriptionPolicy::default()
        };
        assert!(on_datapoint(&cache, &policy, &allocator, &point, Cot::SPONTANEOUS)
            .unwrap()
            .is_none());
    }

    #[test]
    fn act_term_archives_entry_and_confirms() {
        let cache = cache_with_pending_read(1, 2, "APP_9");
        cache.data_points.update_status(1, 2, MsgStatus::ReceivedAck);
        let policy = SubscriptionPolicy::default();

        let msg = on_confirmation(
            &cache,
            &policy,
            1,
            2,
            TypeId::C_SC_NA_1,
            Cot::ACTIVATION_TERM,
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(msg.reference_nr(), Some("APP_9"));
        assert!(!cache.data_points.is_active(1, 2));
    }

    #[test]
    fn repeated_act_con_rejected_without_clock_sync_tolerance() {
        let cache = cache_with_pending_read(1, 2, "APP_9");
        cache.data_points.update_status(1, 2, MsgStatus::ReceivedAck);
        let policy = SubscriptionPolicy::default();

        let result = on_confirmation(
            &cache,
            &policy,
            1,
            2,
            TypeId::C_SC_NA_1,
            Cot::ACTIVATION_CON,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn repeated_act_con_tolerated_for_clock_sync_with_policy_enabled() {
        let cache = cache_with_pending_read(1, 2, "APP_9");
        cache.data_points.update_status(1, 2, MsgStatus::ReceivedAck);
        let policy = SubscriptionPolicy {
            independent_clock_sync: true,
            ..SubscriptionPolicy::default()
        };

        let result = on_confirmation(
            &cache,
            &policy,
            1,
            2,
            TypeId::C_CS_NA_1,
            Cot::ACTIVATION_CON,
            false,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn global_confirmation_completes_only_after_last_rtu_terminates() {
        let cache = MessageCache::new();
        let policy = SubscriptionPolicy::default();
        let type_id = TypeId::C_IC_NA_1;

        cache.global.store_broadcast(
            type_id,
            Entry::new(
                IecMsg::SysInfoControl(mtu_shared::model::SysInfoControl {
                    coa: mtu_shared::model::GLOBAL_COA,
                    type_id,
                    reference_nr: "MTU_1".to_string(),
                    max_tries: 1,
                }),
                MsgStatus::WaitingForSend,
            ),
        );
        cache.global.mark_rtu_active(14, type_id);
        cache.global.mark_rtu_active(15, type_id);

        let first = on_global_confirmation(&cache, &policy, 14, type_id, Cot::ACTIVATION_TERM, false).unwrap();
        assert!(first.is_none());
        assert!(cache.global.get_broadcast_if_queued(type_id).is_some());

        let second = on_global_confirmation(&cache, &policy, 15, type_id, Cot::ACTIVATION_TERM, false)
            .unwrap()
            .unwrap();
        assert_eq!(second.reference_nr(), Some("MTU_1"));
        assert!(cache.global.get_broadcast_if_queued(type_id).is_none());
    }

    #[test]
    fn negative_ack_fails_the_command() {
        let cache = cache_with_pending_read(1, 2, "APP_9");
        let policy = SubscriptionPolicy::default();

        let msg = on_confirmation(&cache, &policy, 1, 2, TypeId::C_SC_NA_1, Cot::ACTIVATION_CON, true)
            .unwrap()
            .unwrap();
        match msg {
            IecMsg::Confirmation(c) => {
                assert_eq!(c.result.status, Some(mtu_shared::model::ConfirmationStatus::Fail));
            }
            _ => panic!("expected a Confirmation"),
        }
    }

    fn cache_with_pending_interrogation(coa: Coa, reference_nr: &str) -> MessageCache {
        let cache = MessageCache::new();
        cache.interrogations.store_new(
            coa,
            Entry::new(
                IecMsg::SysInfoControl(mtu_shared::model::SysInfoControl {
                    coa,
                    type_id: TypeId::C_IC_NA_1,
                    reference_nr: reference_nr.to_string(),
                    max_tries: 1,
                }),
                MsgStatus::SentNoAck,
            ),
        );
        cache
    }

    #[test]
    fn datapoint_before_interrogation_act_con_is_rejected() {
        let cache = cache_with_pending_interrogation(163, "MTU_42");
        let policy = SubscriptionPolicy::default();
        let allocator = MtuReferenceAllocator::new();
        let point = sample_point(163, 35110);

        let result = on_datapoint(&cache, &policy, &allocator, &point, Cot::INTERROGATED_BY_STATION);
        assert!(result.is_err());
    }

    #[test]
    fn interrogation_act_con_then_datapoints_then_act_term() {
        let cache = cache_with_pending_interrogation(163, "MTU_42");
        let policy = SubscriptionPolicy::default();
        let allocator = MtuReferenceAllocator::new();

        let act_con = on_interrogation_confirmation(&cache, &policy, 163, Cot::ACTIVATION_CON, false)
            .unwrap()
            .unwrap();
        assert_eq!(act_con.reference_nr(), Some("MTU_42"));

        for ioa in 0..20 {
            let point = sample_point(163, ioa);
            let msg = on_datapoint(&cache, &policy, &allocator, &point, Cot::INTERROGATED_BY_STATION)
                .unwrap()
                .unwrap();
            assert_eq!(msg.reference_nr(), Some("MTU_42"));
        }

        let act_term = on_interrogation_confirmation(&cache, &policy, 163, Cot::ACTIVATION_TERM, false)
            .unwrap()
            .unwrap();
        assert_eq!(act_term.reference_nr(), Some("MTU_42"));
        assert!(cache.interrogations.get(163).is_none());
    }

    #[test]
    fn negative_interrogation_act_con_fails_and_clears_entry() {
        let cache = cache_with_pending_interrogation(163, "MTU_42");
        let policy = SubscriptionPolicy::default();

        let msg = on_interrogation_confirmation(&cache, &policy, 163, Cot::ACTIVATION_CON, true)
            .unwrap()
            .unwrap();
        match msg {
            IecMsg::Confirmation(c) => {
                assert_eq!(c.result.reason, Some(mtu_shared::model::FailReason::Negative));
            }
            _ => panic!("expected a Confirmation"),
        }
        assert!(cache.interrogations.get(163).is_none());
    }
}
