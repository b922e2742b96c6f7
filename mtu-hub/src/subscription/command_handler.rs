//! Executes subscriber commands against the cache and the RTU link,
//! producing the confirmation (or reply) to publish back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use mtu_shared::cache::{CacheEntry, MessageCache, MsgStatus};
use mtu_shared::error::MtuResult;
use mtu_shared::model::{
    Coa, Confirmation, ConfirmationResult, ConfirmationStatus, Cot, FailReason, IecMsg, Ioa,
    MtuCacheReply, ParameterActivate, ProcessInfoControl, ReadDatapoint, RtuStatusReply,
    SysInfoControl, TotalInterroReply, TypeId, GLOBAL_COA,
};
use mtu_shared::resilience::{CircuitBreakerBehavior, RtuCircuitBreaker};

use crate::translator::RtuLink;

/// Failure-threshold/recovery-timeout defaults used by [`CommandHandler::new`],
/// matching `HubConfig`'s own `circuit_breaker_failure_threshold`/
/// `circuit_breaker_recovery_seconds` defaults.
const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_RECOVERY: Duration = Duration::from_secs(30);

/// Executes subscriber commands: [`ProcessInfoControl`], [`ReadDatapoint`],
/// [`ParameterActivate`], and [`SysInfoControl`] against the RTU link,
/// checking for per-(COA, IOA) collisions first exactly as the original
/// subscription command handler does.
///
/// Each RTU's repeated send failures are gated by its own
/// [`RtuCircuitBreaker`] (created lazily on first use): once a COA trips its
/// breaker, further sends to it fail fast with `FailReason::Network` instead
/// of burning through `max_tries` against an RTU that is already known down.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    cache: Arc<MessageCache>,
    link: Arc<dyn RtuLink>,
    breakers: Arc<DashMap<Coa, Arc<RtuCircuitBreaker>>>,
    breaker_failure_threshold: u32,
    breaker_recovery: Duration,
}

impl CommandHandler {
    #[must_use]
    pub fn new(cache: Arc<MessageCache>, link: Arc<dyn RtuLink>) -> Self {
        Self::with_breaker_config(cache, link, DEFAULT_BREAKER_FAILURE_THRESHOLD, DEFAULT_BREAKER_RECOVERY)
    }

    #[must_use]
    pub fn with_breaker_config(
        cache: Arc<MessageCache>,
        link: Arc<dyn RtuLink>,
        breaker_failure_threshold: u32,
        breaker_recovery: Duration,
    ) -> Self {
        Self {
            cache,
            link,
            breakers: Arc::new(DashMap::new()),
            breaker_failure_threshold,
            breaker_recovery,
        }
    }

    /// Returns `coa`'s circuit breaker, creating one on first use.
    fn breaker_for(&self, coa: Coa) -> Arc<RtuCircuitBreaker> {
        self.breakers
            .entry(coa)
            .or_insert_with(|| {
                Arc::new(RtuCircuitBreaker::new(
                    format!("rtu-{coa}"),
                    self.breaker_failure_threshold,
                    self.breaker_recovery,
                ))
            })
            .clone()
    }

    /// Checks whether `coa` is reachable at all before considering collision.
    /// Mirrors the network-reachability gate `SubscriptionCommandHandler.handle`
    /// applies before dispatching to any per-message handler upstream.
    async fn check_is_executable(&self, coa: Coa) -> Option<ConfirmationResult> {
        if !self.link.has_server(coa).await {
            return Some(ConfirmationResult {
                status: Some(ConfirmationStatus::Fail),
                reason: Some(FailReason::Coa),
                ..Default::default()
            });
        }
        None
    }

    /// Checks whether a `ProcessInfoControl`/`ReadDatapoint` command would
    /// collide with an already-active command on any of its IOAs, returning
    /// the colliding `(ioa, reference_nr)` if so. The caller decides whether
    /// to queue behind it or fail outright based on `queue_on_collision`.
    fn find_collision(&self, coa: Coa, ioas: &[Ioa]) -> Option<(Ioa, String)> {
        for &ioa in ioas {
            if let Some(entry) = self.cache.data_points.get_if_active(coa, ioa) {
                return Some((ioa, entry.msg.reference_nr().unwrap_or_default().to_string()));
            }
        }
        None
    }

    pub async fn handle_process_info_control(&self, msg: ProcessInfoControl) -> IecMsg {
        if let Some(result) = self.check_is_executable(msg.coa).await {
            return IecMsg::Confirmation(Confirmation::new(result, msg.reference_nr, msg.max_tries));
        }

        let ioas: Vec<Ioa> = msg.val_map.keys().copied().collect();
        if let Some((ioa, collision_reference)) = self.find_collision(msg.coa, &ioas) {
            if msg.queue_on_collision {
                self.cache.data_points.queue_on_collision(
                    msg.coa,
                    ioa,
                    CacheEntry::new(IecMsg::ProcessInfoControl(msg.clone()), MsgStatus::WaitingForSend),
                );
                return IecMsg::Confirmation(Confirmation::queued(
                    msg.reference_nr,
                    msg.max_tries,
                    collision_reference,
                ));
            }
            return IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::Fail),
                    reason: Some(FailReason::Collision),
                    collision_dp: Some(format!("{}:{ioa}", msg.coa)),
                    collision_reference: Some(collision_reference),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ));
        }

        let mut sent_ok = Vec::new();
        for (&ioa, value) in &msg.val_map {
            if !self.link.has_datapoint(msg.coa, ioa).await {
                return IecMsg::Confirmation(Confirmation::new(
                    ConfirmationResult {
                        status: Some(ConfirmationStatus::Fail),
                        reason: Some(FailReason::Ioa),
                        ..Default::default()
                    },
                    msg.reference_nr,
                    msg.max_tries,
                ));
            }

            self.cache.data_points.store_new_active(
                msg.coa,
                ioa,
                CacheEntry::new(
                    IecMsg::ProcessInfoControl(msg.clone()),
                    MsgStatus::WaitingForSend,
                ),
            );
            self.link.update_datapoint(msg.coa, ioa, value.clone()).await;

            let breaker = self.breaker_for(msg.coa);
            let mut remaining = msg.max_tries;
            let mut success = false;
            while !success && remaining > 0 {
                if !breaker.should_allow() {
                    warn!(coa = msg.coa, ioa, "circuit open, skipping send to this RTU");
                    break;
                }
                debug!(coa = msg.coa, ioa, "sending process info control");
                success = self.link.send_command(msg.coa, ioa, Cot::ACTIVATION).await;
                if success {
                    breaker.record_success();
                } else {
                    breaker.record_failure();
                    remaining -= 1;
                }
            }

            if success {
                sent_ok.push(ioa);
                self.cache.data_points.update_status(msg.coa, ioa, MsgStatus::SentNoAck);
            } else {
                self.cache.data_points.remove_active(msg.coa, ioa);
                return IecMsg::Confirmation(Confirmation::new(
                    ConfirmationResult {
                        status: Some(ConfirmationStatus::Fail),
                        reason: Some(FailReason::Network),
                        still_sending: Some(sent_ok),
                        ..Default::default()
                    },
                    msg.reference_nr,
                    msg.max_tries,
                ));
            }
        }

        IecMsg::Confirmation(Confirmation::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::WaitingForSend),
                ..Default::default()
            },
            msg.reference_nr,
            msg.max_tries,
        ))
    }

    pub async fn handle_read_datapoint(&self, msg: ReadDatapoint) -> IecMsg {
        if let Some(result) = self.check_is_executable(msg.coa).await {
            return IecMsg::Confirmation(Confirmation::new(result, msg.reference_nr, msg.max_tries));
        }
        if let Some((ioa, collision_reference)) = self.find_collision(msg.coa, &[msg.ioa]) {
            if msg.queue_on_collision {
                self.cache.data_points.queue_on_collision(
                    msg.coa,
                    ioa,
                    CacheEntry::new(IecMsg::ReadDatapoint(msg.clone()), MsgStatus::WaitingForSend),
                );
                return IecMsg::Confirmation(Confirmation::queued(
                    msg.reference_nr,
                    msg.max_tries,
                    collision_reference,
                ));
            }
            return IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::Fail),
                    reason: Some(FailReason::Collision),
                    collision_dp: Some(format!("{}:{ioa}", msg.coa)),
                    collision_reference: Some(collision_reference),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ));
        }
        if !self.link.has_datapoint(msg.coa, msg.ioa).await {
            return IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::Fail),
                    reason: Some(FailReason::Ioa),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ));
        }

        self.cache.data_points.store_new_active(
            msg.coa,
            msg.ioa,
            CacheEntry::new(IecMsg::ReadDatapoint(msg.clone()), MsgStatus::WaitingForSend),
        );

        let breaker = self.breaker_for(msg.coa);
        let mut remaining = msg.max_tries;
        let mut success = false;
        while !success && remaining > 0 {
            if !breaker.should_allow() {
                warn!(coa = msg.coa, ioa = msg.ioa, "circuit open, skipping read from this RTU");
                break;
            }
            success = self.link.read_datapoint(msg.coa, msg.ioa).await;
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
                remaining -= 1;
            }
        }

        if success {
            self.cache
                .data_points
                .update_status(msg.coa, msg.ioa, MsgStatus::SentNoAck);
            IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::WaitingForSend),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ))
        } else {
            self.cache.data_points.remove_active(msg.coa, msg.ioa);
            IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::Fail),
                    reason: Some(FailReason::Network),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ))
        }
    }

    pub async fn handle_parameter_activate(&self, msg: ParameterActivate) -> IecMsg {
        if !self.link.has_server(msg.coa).await {
            return fail(FailReason::Coa, msg.reference_nr, msg.max_tries);
        }
        if !self.link.has_datapoint(msg.coa, msg.ioa).await {
            return fail(FailReason::Ioa, msg.reference_nr, msg.max_tries);
        }
        if self.cache.parameters.is_active(msg.coa, msg.ioa) {
            return fail(FailReason::Collision, msg.reference_nr, msg.max_tries);
        }

        self.cache.parameters.store_new_active(
            msg.coa,
            msg.ioa,
            CacheEntry::new(IecMsg::ParameterActivate(msg.clone()), MsgStatus::WaitingForSend),
        );

        let cot = if msg.activate { Cot::ACTIVATION } else { Cot::DEACTIVATION };
        let breaker = self.breaker_for(msg.coa);
        let mut remaining = msg.max_tries;
        let mut success = false;
        while !success && remaining > 0 {
            if !breaker.should_allow() {
                warn!(coa = msg.coa, ioa = msg.ioa, "circuit open, skipping parameter send to this RTU");
                break;
            }
            success = self.link.send_parameter_activation(msg.coa, msg.ioa, cot).await;
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
                remaining -= 1;
            }
        }

        if success {
            self.cache
                .parameters
                .update_status(msg.coa, msg.ioa, MsgStatus::SentNoAck);
            IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::WaitingForSend),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ))
        } else {
            self.cache.parameters.remove(msg.coa, msg.ioa);
            fail(FailReason::Network, msg.reference_nr, msg.max_tries)
        }
    }

    pub async fn handle_sys_info_control(&self, msg: SysInfoControl) -> IecMsg {
        if !msg.type_id.global_coa_compatible() {
            return fail(FailReason::TypeUnsupported, msg.reference_nr, msg.max_tries);
        }
        if msg.coa == GLOBAL_COA {
            return self.handle_global_sys_info_control(msg).await;
        }

        // A general/counter interrogation against a single RTU opens an
        // interrogation entry before the send, so the ACT_CON/ACT_TERM that
        // come back (and the INTERROGATED_BY_STATION datapoints in between)
        // have somewhere to land.
        let is_interrogation = msg.type_id.is_interrogation();
        if is_interrogation {
            self.cache.interrogations.store_new(
                msg.coa,
                CacheEntry::new(IecMsg::SysInfoControl(msg.clone()), MsgStatus::WaitingForSend),
            );
        }

        let success = self.link.send_system_info(msg.type_id, msg.coa).await;
        if success {
            if is_interrogation {
                self.cache.interrogations.update_status(msg.coa, MsgStatus::SentNoAck);
            }
            IecMsg::Confirmation(Confirmation::new(
                ConfirmationResult {
                    status: Some(ConfirmationStatus::WaitingForSend),
                    ..Default::default()
                },
                msg.reference_nr,
                msg.max_tries,
            ))
        } else {
            if is_interrogation {
                self.cache.interrogations.remove(msg.coa);
            }
            fail(FailReason::Network, msg.reference_nr, msg.max_tries)
        }
    }

    /// Fans a `GLOBAL_COA` system-info command out to every currently
    /// connected RTU. A single broadcast entry is stored in the global store
    /// under `msg.type_id`; each individual send that actually reaches an RTU
    /// marks that RTU's own activation leg so its eventual `ACT_CON`/`ACT_TERM`
    /// can be resolved back against the right entry.
    async fn handle_global_sys_info_control(&self, msg: SysInfoControl) -> IecMsg {
        crate::translator::queue_broadcast(
            &self.cache,
            msg.type_id,
            CacheEntry::new(
                IecMsg::SysInfoControl(msg.clone()),
                MsgStatus::WaitingForSend,
            ),
        );

        let rtu_status = self.link.rtu_status().await;
        let connected: Vec<Coa> = rtu_status
            .into_iter()
            .filter_map(|(coa, connected)| connected.then_some(coa))
            .collect();

        if connected.is_empty() {
            self.cache.global.pop_broadcast(msg.type_id);
            return fail(FailReason::Network, msg.reference_nr, msg.max_tries);
        }

        let mut any_sent = false;
        for coa in connected {
            if self.link.send_system_info(msg.type_id, coa).await {
                crate::translator::record_broadcast_dispatch(&self.cache, coa, msg.type_id);
                any_sent = true;
            } else {
                warn!(coa, type_id = ?msg.type_id, "global system-info send failed for this RTU");
            }
        }

        if !any_sent {
            self.cache.global.pop_broadcast(msg.type_id);
            return fail(FailReason::Network, msg.reference_nr, msg.max_tries);
        }

        IecMsg::Confirmation(Confirmation::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::WaitingForSend),
                ..Default::default()
            },
            msg.reference_nr,
            msg.max_tries,
        ))
    }

    pub fn handle_total_interro_request(
        &self,
        reference_nr: String,
        rtu_status: HashMap<Coa, bool>,
        datapoints: HashMap<Coa, HashMap<Ioa, mtu_shared::model::PointValue>>,
    ) -> IecMsg {
        IecMsg::TotalInterroReply(TotalInterroReply {
            rtu_status,
            datapoints,
            reference_nr,
        })
    }

    pub fn handle_rtu_status_request(
        &self,
        reference_nr: String,
        rtu_status: HashMap<Coa, bool>,
    ) -> IecMsg {
        IecMsg::RtuStatusReply(RtuStatusReply {
            rtu_status,
            reference_nr,
        })
    }

    pub fn handle_cache_dump_request(&self, reference_nr: String, dump: serde_json::Value) -> IecMsg {
        IecMsg::MtuCacheReply(MtuCacheReply {
            cache_dump: dump,
            reference_nr,
        })
    }

    #[must_use]
    pub fn cache_dump(&self) -> serde_json::Value {
        self.cache.dump()
    }

    pub async fn rtu_status(&self) -> HashMap<Coa, bool> {
        self.link.rtu_status().await
    }

    pub async fn snapshot_datapoints(&self) -> HashMap<Coa, HashMap<Ioa, mtu_shared::model::PointValue>> {
        self.link.snapshot_datapoints().await
    }
}

fn fail(reason: FailReason, reference_nr: String, max_tries: u32) -> IecMsg {
    warn!(?reason, reference_nr, "command failed");
    IecMsg::Confirmation(Confirmation::new(
        ConfirmationResult {
            status: Some(ConfirmationStatus::Fail),
            reason: Some(reason),
            ..Default::default()
        },
        reference_nr,
        max_tries,
    ))
}
