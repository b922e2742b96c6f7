//! The message cache: four independently-locked substores tracking every
//! in-flight command and hub-initiated interrogation.
//!
//! Each substore is backed by a [`dashmap::DashMap`], so locking happens per
//! key-shard rather than globally. The invariant the translator and command
//! handlers must uphold is that no single operation holds two of the four
//! substores' guards at once — reads/writes against, say, the data-point
//! store and the global store always happen as two separate, sequential
//! calls rather than nested under one another.

use dashmap::DashMap;

use crate::model::{Coa, Ioa, TypeId};

use super::entry::CacheEntry;

type DpKey = (Coa, Ioa);

fn dump_entry(entry: &CacheEntry) -> serde_json::Value {
    serde_json::json!({
        "reference_nr": entry.msg.reference_nr(),
        "status": format!("{:?}", entry.status),
    })
}

/// Per-(COA, IOA) active commands and any queued behind a collision.
#[derive(Debug, Default)]
pub struct DataPointStore {
    active: DashMap<DpKey, CacheEntry>,
    queued: DashMap<DpKey, crossbeam::queue::SegQueue<CacheEntry>>,
}

impl DataPointStore {
    #[must_use]
    pub fn is_active(&self, coa: Coa, ioa: Ioa) -> bool {
        self.active.contains_key(&(coa, ioa))
    }

    #[must_use]
    pub fn get_if_active(&self, coa: Coa, ioa: Ioa) -> Option<CacheEntry> {
        self.active.get(&(coa, ioa)).map(|e| e.clone())
    }

    pub fn store_new_active(&self, coa: Coa, ioa: Ioa, entry: CacheEntry) {
        self.active.insert((coa, ioa), entry);
    }

    #[must_use]
    pub fn remove_active(&self, coa: Coa, ioa: Ioa) -> Option<CacheEntry> {
        self.active.remove(&(coa, ioa)).map(|(_, e)| e)
    }

    /// Removes the active entry and, if another command was queued behind it
    /// on collision, promotes it to active and returns it for dispatch.
    #[must_use]
    pub fn archive_and_promote_next(&self, coa: Coa, ioa: Ioa) -> Option<CacheEntry> {
        self.active.remove(&(coa, ioa));
        let next = self.queued.get_mut(&(coa, ioa)).and_then(|q| q.pop())?;
        self.active.insert((coa, ioa), next.clone());
        Some(next)
    }

    pub fn queue_on_collision(&self, coa: Coa, ioa: Ioa, entry: CacheEntry) {
        self.queued.entry((coa, ioa)).or_default().push(entry);
    }

    pub fn update_status(&self, coa: Coa, ioa: Ioa, status: super::entry::MsgStatus) -> bool {
        if let Some(mut e) = self.active.get_mut(&(coa, ioa)) {
            e.status = status;
            true
        } else {
            false
        }
    }

    /// Removes every active and queued entry belonging to `coa`, returning
    /// their reference numbers for a `DisconnectCancelMsgsChange`.
    pub fn clean_for_coa(&self, coa: Coa) -> Vec<String> {
        let mut cancelled = Vec::new();
        let keys: Vec<DpKey> = self
            .active
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.0 == coa)
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.active.remove(&key) {
                if let Some(r) = entry.msg.reference_nr() {
                    cancelled.push(r.to_string());
                }
            }
        }
        let qkeys: Vec<DpKey> = self
            .queued
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.0 == coa)
            .collect();
        for key in qkeys {
            if let Some((_, queue)) = self.queued.remove(&key) {
                while let Some(entry) = queue.pop() {
                    if let Some(r) = entry.msg.reference_nr() {
                        cancelled.push(r.to_string());
                    }
                }
            }
        }
        cancelled
    }

    /// Operational dump keyed by `"coa:ioa"`, active entries only.
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        let active: serde_json::Map<String, serde_json::Value> = self
            .active
            .iter()
            .map(|e| {
                let (coa, ioa) = *e.key();
                (format!("{coa}:{ioa}"), dump_entry(e.value()))
            })
            .collect();
        serde_json::Value::Object(active)
    }
}

/// Global-COA fan-out tracking: the broadcast command itself plus each RTU's
/// individual activation state.
#[derive(Debug, Default)]
pub struct GlobalStore {
    broadcast: DashMap<TypeId, CacheEntry>,
    rtu_activation: DashMap<(Coa, TypeId), bool>,
}

impl GlobalStore {
    #[must_use]
    pub fn get_broadcast_if_queued(&self, type_id: TypeId) -> Option<CacheEntry> {
        self.broadcast.get(&type_id).map(|e| e.clone())
    }

    pub fn store_broadcast(&self, type_id: TypeId, entry: CacheEntry) {
        self.broadcast.insert(type_id, entry);
    }

    #[must_use]
    pub fn pop_broadcast(&self, type_id: TypeId) -> Option<CacheEntry> {
        self.broadcast.remove(&type_id).map(|(_, e)| e)
    }

    /// Marks that `coa` has an in-progress activation for the given
    /// broadcast type, returning `true` iff a broadcast for that type was
    /// actually active (mirrors `global_send_and_active`).
    pub fn mark_rtu_active(&self, coa: Coa, type_id: TypeId) -> bool {
        if !self.broadcast.contains_key(&type_id) {
            return false;
        }
        self.rtu_activation.insert((coa, type_id), true);
        true
    }

    #[must_use]
    pub fn is_rtu_active(&self, coa: Coa, type_id: TypeId) -> bool {
        self.rtu_activation
            .get(&(coa, type_id))
            .map(|v| *v)
            .unwrap_or(false)
    }

    pub fn clear_rtu_active(&self, coa: Coa, type_id: TypeId) {
        self.rtu_activation.remove(&(coa, type_id));
    }

    /// Number of RTUs still carrying an outstanding activation leg for
    /// `type_id`, used to decide whether a fan-out group has fully
    /// terminated once the last one answers.
    #[must_use]
    pub fn remaining_active(&self, type_id: TypeId) -> usize {
        self.rtu_activation
            .iter()
            .filter(|e| e.key().1 == type_id && *e.value())
            .count()
    }

    /// Clears every per-RTU activation leg belonging to `coa`. The broadcast
    /// entries themselves are keyed by type, not by COA, and are left for
    /// the remaining RTUs in the fan-out to still terminate against.
    pub fn clean_for_coa(&self, coa: Coa) -> Vec<String> {
        let keys: Vec<(Coa, TypeId)> = self
            .rtu_activation
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.0 == coa)
            .collect();
        for key in keys {
            self.rtu_activation.remove(&key);
        }
        Vec::new()
    }

    /// Operational dump of every still-queued broadcast, keyed by type-id.
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        let broadcast: serde_json::Map<String, serde_json::Value> = self
            .broadcast
            .iter()
            .map(|e| (format!("{:?}", e.key()), dump_entry(e.value())))
            .collect();
        serde_json::Value::Object(broadcast)
    }
}

/// Per-(COA, IOA) parameter activation/deactivation commands.
#[derive(Debug, Default)]
pub struct ParamStore {
    active: DashMap<DpKey, CacheEntry>,
}

impl ParamStore {
    #[must_use]
    pub fn is_active(&self, coa: Coa, ioa: Ioa) -> bool {
        self.active.contains_key(&(coa, ioa))
    }

    #[must_use]
    pub fn get_if_active(&self, coa: Coa, ioa: Ioa) -> Option<CacheEntry> {
        self.active.get(&(coa, ioa)).map(|e| e.clone())
    }

    pub fn store_new_active(&self, coa: Coa, ioa: Ioa, entry: CacheEntry) {
        self.active.insert((coa, ioa), entry);
    }

    #[must_use]
    pub fn remove(&self, coa: Coa, ioa: Ioa) -> Option<CacheEntry> {
        self.active.remove(&(coa, ioa)).map(|(_, e)| e)
    }

    pub fn update_status(&self, coa: Coa, ioa: Ioa, status: super::entry::MsgStatus) {
        if let Some(mut e) = self.active.get_mut(&(coa, ioa)) {
            e.status = status;
        }
    }

    pub fn clean_for_coa(&self, coa: Coa) -> Vec<String> {
        let mut cancelled = Vec::new();
        let keys: Vec<DpKey> = self
            .active
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.0 == coa)
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.active.remove(&key) {
                if let Some(r) = entry.msg.reference_nr() {
                    cancelled.push(r.to_string());
                }
            }
        }
        cancelled
    }

    /// Operational dump keyed by `"coa:ioa"`.
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        let active: serde_json::Map<String, serde_json::Value> = self
            .active
            .iter()
            .map(|e| {
                let (coa, ioa) = *e.key();
                (format!("{coa}:{ioa}"), dump_entry(e.value()))
            })
            .collect();
        serde_json::Value::Object(active)
    }
}

/// Per-COA accumulator for an in-progress general interrogation: every
/// datapoint reported with `COT::InterrogatedByStation` lands in
/// `entry.io_cache` until the RTU sends `ACT_TERM`.
#[derive(Debug, Default)]
pub struct InterroStore {
    active: DashMap<Coa, CacheEntry>,
}

impl InterroStore {
    #[must_use]
    pub fn get(&self, coa: Coa) -> Option<CacheEntry> {
        self.active.get(&coa).map(|e| e.clone())
    }

    pub fn store_new(&self, coa: Coa, entry: CacheEntry) {
        self.active.insert(coa, entry);
    }

    pub fn record_value(&self, coa: Coa, ioa: Ioa, value: crate::model::PointValue) {
        if let Some(mut e) = self.active.get_mut(&coa) {
            e.io_cache.insert(ioa, value);
        }
    }

    pub fn update_status(&self, coa: Coa, status: super::entry::MsgStatus) -> bool {
        if let Some(mut e) = self.active.get_mut(&coa) {
            e.status = status;
            true
        } else {
            false
        }
    }

    /// An interrogated-by-station datapoint for `coa` is only acceptable
    /// once that COA's interrogation has reached `ReceivedAck`.
    #[must_use]
    pub fn is_ready(&self, coa: Coa) -> bool {
        self.active
            .get(&coa)
            .is_some_and(|e| e.status == super::entry::MsgStatus::ReceivedAck)
    }

    #[must_use]
    pub fn remove(&self, coa: Coa) -> Option<CacheEntry> {
        self.active.remove(&coa).map(|(_, e)| e)
    }

    pub fn clean_for_coa(&self, coa: Coa) -> Vec<String> {
        self.active
            .remove(&coa)
            .and_then(|(_, entry)| entry.msg.reference_nr().map(str::to_string))
            .into_iter()
            .collect()
    }

    /// Operational dump keyed by COA, including each interrogation's
    /// accumulated IOA count so far.
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        let active: serde_json::Map<String, serde_json::Value> = self
            .active
            .iter()
            .map(|e| {
                let mut v = dump_entry(e.value());
                v["io_cache_len"] = serde_json::json!(e.value().io_cache.len());
                (e.key().to_string(), v)
            })
            .collect();
        serde_json::Value::Object(active)
    }
}

/// The complete message cache: one instance shared (via `Arc`) across the
/// translator, subscription manager, and command handlers.
#[derive(Debug, Default)]
pub struct MessageCache {
    pub data_points: DataPointStore,
    pub global: GlobalStore,
    pub parameters: ParamStore,
    pub interrogations: InterroStore,
}

impl MessageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweeps every substore for non-terminal entries belonging to `coa`,
    /// removing them and returning their reference numbers. Called once per
    /// RTU disconnection to build a `DisconnectCancelMsgsChange`.
    ///
    /// Touches each substore's lock in turn, never more than one at a time.
    #[must_use]
    pub fn clean_for_rtu(&self, coa: Coa) -> Vec<String> {
        let mut cancelled = self.data_points.clean_for_coa(coa);
        cancelled.extend(self.parameters.clean_for_coa(coa));
        cancelled.extend(self.interrogations.clean_for_coa(coa));
        cancelled.extend(self.global.clean_for_coa(coa));
        cancelled
    }

    /// Operational dump of every substore, for `MtuCacheReq` replies.
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        serde_json::json!({
            "data_points": self.data_points.dump(),
            "global": self.global.dump(),
            "parameters": self.parameters.dump(),
            "interrogations": self.interrogations.dump(),
        })
    }
}
