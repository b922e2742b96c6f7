//! Subscription manager: wires the RTU-link collaborator callbacks to the
//! translator, the cache, the periodic aggregator, and the publish fan-out.
//!
//! This is the one component that knows about every other piece: the IEC-104
//! client library (behind [`RtuLink`]) calls into it on every inbound event,
//! and it is the only place that decides what a subscriber ultimately sees.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mtu_shared::cache::{CacheEntry, MessageCache, MsgStatus};
use mtu_shared::error::MtuResult;
use mtu_shared::model::{Coa, Cot, IecMsg, Ioa, PeriodicUpdate, SubscriptionPolicy, TypeId};

use crate::subscription::subscriber::SubscriberRegistry;
use crate::translator::{ProtocolTranslator, RtuDataPoint, RtuLink};

/// Central coordinator between the RTU-link collaborator and the publish fan-out.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    cache: Arc<MessageCache>,
    link: Arc<dyn RtuLink>,
    translator: ProtocolTranslator,
    policy: SubscriptionPolicy,
    subscribers: Arc<SubscriberRegistry>,
    periodic_tx: mpsc::UnboundedSender<PeriodicUpdate>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(
        cache: Arc<MessageCache>,
        link: Arc<dyn RtuLink>,
        translator: ProtocolTranslator,
        policy: SubscriptionPolicy,
        subscribers: Arc<SubscriberRegistry>,
        periodic_tx: mpsc::UnboundedSender<PeriodicUpdate>,
    ) -> Self {
        Self {
            cache,
            link,
            translator,
            policy,
            subscribers,
            periodic_tx,
        }
    }

    fn publish(&self, msg: IecMsg) {
        self.subscribers.broadcast(&msg, |_, _| true);
    }

    /// `on_receive_datapoint` collaborator callback: a single IOA value
    /// arrived on an ASDU. Periodic updates are routed to the aggregator
    /// instead of being published immediately.
    pub fn on_datapoint(&self, point: &RtuDataPoint, cot: Cot) -> MtuResult<()> {
        if cot == Cot::PERIODIC {
            let msg = self.translator.on_datapoint(&self.policy, point, cot)?;
            if let Some(IecMsg::PeriodicUpdate(update)) = msg {
                if self.periodic_tx.send(update).is_err() {
                    warn!("periodic aggregator inbox closed, dropping update");
                }
            }
            return Ok(());
        }

        if let Some(msg) = self.translator.on_datapoint(&self.policy, point, cot)? {
            self.publish(msg);
        }
        Ok(())
    }

    /// `on_send_apdu` collaborator callback: fires synchronously right after
    /// the codec puts an APDU on the wire. Advances the cache entry from
    /// `WaitingForSend` to `SentNoAck` and, for subscriber-originated
    /// commands, republishes a `SUCCESSFUL_SEND` confirmation (this happens
    /// unconditionally — the `acks` policy only gates ACT_CON/ACT_TERM-derived
    /// confirmations, never the initial send acknowledgement).
    pub fn on_send_apdu(&self, coa: Coa, ioa: Ioa, type_id: TypeId, rtu_coa: Coa) {
        if type_id.is_parameter() {
            crate::translator::mark_param_sent(&self.cache, coa, ioa);
            if let Some(entry) = self.cache.parameters.get_if_active(coa, ioa) {
                self.publish_send_ack(&entry);
            }
            return;
        }

        if type_id.global_coa_compatible() && coa == mtu_shared::model::GLOBAL_COA {
            crate::translator::record_broadcast_dispatch(&self.cache, rtu_coa, type_id);
            return;
        }

        if crate::translator::mark_dp_sent(&self.cache, coa, ioa) {
            if let Some(entry) = self.cache.data_points.get_if_active(coa, ioa) {
                self.publish_send_ack(&entry);
            }
        }
    }

    fn publish_send_ack(&self, entry: &CacheEntry) {
        if entry.msg.mtu_initiated() {
            return;
        }
        let Some(reference_nr) = entry.msg.reference_nr() else {
            return;
        };
        self.publish(IecMsg::Confirmation(mtu_shared::model::Confirmation::successful_send(
            reference_nr.to_string(),
            0,
        )));
    }

    /// `on_receive_apdu` collaborator callback: dispatches to the
    /// data-point, parameter, or global-fan-out confirmation handler
    /// depending on the APDU's classification, then publishes whatever the
    /// translator produces and drains the next queued command (if the
    /// transition freed up the (COA, IOA) it was waiting on).
    pub async fn on_receive_apdu(
        &self,
        coa: Coa,
        ioa: Ioa,
        type_id: TypeId,
        cot: Cot,
        negative: bool,
        rtu_coa: Coa,
    ) -> MtuResult<()> {
        let outcome = if type_id.is_parameter() {
            self.translator
                .on_parameter_confirmation(&self.policy, coa, ioa, cot, negative)?
        } else if type_id.is_interrogation() && self.cache.interrogations.get(coa).is_some() {
            self.translator
                .on_interrogation_confirmation(&self.policy, coa, cot, negative)?
        } else if type_id.global_coa_compatible() && self.cache.global.is_rtu_active(rtu_coa, type_id) {
            self.translator
                .on_global_confirmation(&self.policy, rtu_coa, type_id, cot, negative)?
        } else {
            let msg = self
                .translator
                .on_confirmation(&self.policy, coa, ioa, type_id, cot, negative)?;
            if cot == Cot::ACTIVATION_TERM || negative {
                self.dispatch_next_queued(coa, ioa).await;
            }
            msg
        };

        if let Some(msg) = outcome {
            self.publish(msg);
        }
        Ok(())
    }

    /// After a data-point command terminates or is negatively acknowledged,
    /// the cache may have already promoted the next queued command to
    /// active (see `DataPointStore::archive_and_promote_next`). This sends
    /// it over the RTU link exactly as the command handler would have for a
    /// fresh command.
    async fn dispatch_next_queued(&self, coa: Coa, ioa: Ioa) {
        let Some(entry) = self.cache.data_points.get_if_active(coa, ioa) else {
            return;
        };
        if entry.status != MsgStatus::WaitingForSend {
            return;
        }

        let sent = match &entry.msg {
            IecMsg::ProcessInfoControl(m) => {
                let mut ok = false;
                for (&ioa, value) in &m.val_map {
                    self.link.update_datapoint(coa, ioa, value.clone()).await;
                    ok = self.link.send_command(coa, ioa, Cot::ACTIVATION).await;
                }
                ok
            }
            IecMsg::ReadDatapoint(_) => self.link.read_datapoint(coa, ioa).await,
            _ => return,
        };

        if sent {
            debug!(coa, ioa, "dispatched queued command freed by prior termination");
            self.cache.data_points.update_status(coa, ioa, MsgStatus::SentNoAck);
        } else {
            self.cache.data_points.remove_active(coa, ioa);
            let reference_nr = entry.msg.reference_nr().unwrap_or_default().to_string();
            self.publish(IecMsg::Confirmation(mtu_shared::model::Confirmation::fail(
                reference_nr,
                0,
                mtu_shared::model::FailReason::Network,
            )));
        }
    }

    /// `on_connection_change` collaborator callback, edge-triggered: first
    /// publishes the status change itself, then — only on disconnection —
    /// cancels every in-flight command that RTU was still carrying and
    /// reports the cancellation in a single bulk message.
    pub fn on_connection_change(&self, coa: Coa, connected: bool, ip: String, port: u16) {
        self.publish(IecMsg::ConnectionStatusChange(mtu_shared::model::ConnectionStatusChange {
            coa,
            connected,
            ip: ip.clone(),
            port,
            reference_nr: self.translator.allocator.next(),
        }));

        if connected {
            return;
        }

        let cancelled_ref_nrs = self.cache.clean_for_rtu(coa);
        self.publish(IecMsg::DisconnectCancelMsgsChange(
            mtu_shared::model::DisconnectCancelMsgsChange {
                coa,
                ip,
                port,
                reference_nr: self.translator.allocator.next(),
                cancelled_ref_nrs,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::InMemoryRtuLink;
    use mtu_shared::model::ReadDatapoint;
    use mtu_shared::resilience::MtuReferenceAllocator;

    fn manager_with(link: InMemoryRtuLink) -> (SubscriptionManager, Arc<MessageCache>, Arc<SubscriberRegistry>) {
        let cache = Arc::new(MessageCache::new());
        let translator = ProtocolTranslator::new(cache.clone(), Arc::new(MtuReferenceAllocator::new()));
        let subscribers = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = SubscriptionManager::new(
            cache.clone(),
            Arc::new(link),
            translator,
            SubscriptionPolicy::default(),
            subscribers.clone(),
            tx,
        );
        (manager, cache, subscribers)
    }

    #[tokio::test]
    async fn disconnection_cancels_in_flight_commands_and_reports_once() {
        let (manager, cache, subscribers) = manager_with(InMemoryRtuLink::new());
        cache.data_points.store_new_active(
            14,
            100,
            CacheEntry::new(
                IecMsg::ReadDatapoint(ReadDatapoint {
                    coa: 14,
                    ioa: 100,
                    reference_nr: "APP_1".to_string(),
                    max_tries: 3,
                    queue_on_collision: false,
                }),
                MsgStatus::SentNoAck,
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.register("HMI", SubscriptionPolicy::default(), tx);

        manager.on_connection_change(14, false, "10.0.0.1".to_string(), 2404);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, IecMsg::ConnectionStatusChange(_)));
        let second = rx.try_recv().unwrap();
        match second {
            IecMsg::DisconnectCancelMsgsChange(m) => {
                assert_eq!(m.cancelled_ref_nrs, vec!["APP_1".to_string()]);
            }
            _ => panic!("expected a disconnect-cancel message"),
        }
        assert!(!cache.data_points.is_active(14, 100));
    }

    #[tokio::test]
    async fn act_term_dispatches_next_queued_command() {
        let link = InMemoryRtuLink::new();
        link.add_rtu(14, [100]);
        let (manager, cache, subscribers) = manager_with(link);

        cache.data_points.store_new_active(
            14,
            100,
            CacheEntry::new(
                IecMsg::ReadDatapoint(ReadDatapoint {
                    coa: 14,
                    ioa: 100,
                    reference_nr: "APP_1".to_string(),
                    max_tries: 3,
                    queue_on_collision: false,
                }),
                MsgStatus::ReceivedAck,
            ),
        );
        cache.data_points.queue_on_collision(
            14,
            100,
            CacheEntry::new(
                IecMsg::ReadDatapoint(ReadDatapoint {
                    coa: 14,
                    ioa: 100,
                    reference_nr: "APP_2".to_string(),
                    max_tries: 3,
                    queue_on_collision: true,
                }),
                MsgStatus::WaitingForSend,
            ),
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        subscribers.register("HMI", SubscriptionPolicy::default(), tx);

        manager
            .on_receive_apdu(14, 100, TypeId::C_SC_NA_1, Cot::ACTIVATION_TERM, false, 14)
            .await
            .unwrap();

        let promoted = cache.data_points.get_if_active(14, 100).unwrap();
        assert_eq!(promoted.msg.reference_nr(), Some("APP_2"));
        assert_eq!(promoted.status, MsgStatus::SentNoAck);
    }

    #[tokio::test]
    async fn single_coa_interrogation_routes_to_the_interrogation_handler() {
        let link = InMemoryRtuLink::new();
        link.add_rtu(163, [35110]);
        let (manager, cache, subscribers) = manager_with(link);

        cache.interrogations.store_new(
            163,
            CacheEntry::new(
                IecMsg::SysInfoControl(mtu_shared::model::SysInfoControl {
                    coa: 163,
                    type_id: TypeId::C_IC_NA_1,
                    reference_nr: "MTU_42".to_string(),
                    max_tries: 1,
                }),
                MsgStatus::SentNoAck,
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.register("HMI", SubscriptionPolicy::default(), tx);

        manager
            .on_receive_apdu(163, 0, TypeId::C_IC_NA_1, Cot::ACTIVATION_CON, false, 163)
            .await
            .unwrap();
        let act_con = rx.try_recv().unwrap();
        assert_eq!(act_con.reference_nr(), Some("MTU_42"));
        assert!(cache.interrogations.get(163).unwrap().status == MsgStatus::ReceivedAck);

        manager
            .on_datapoint(
                &RtuDataPoint {
                    coa: 163,
                    ioa: 35110,
                    type_id: TypeId::M_SP_NA_1,
                    value: serde_json::json!(true),
                    quality_good: true,
                    updated_at_ms: 1,
                },
                Cot::INTERROGATED_BY_STATION,
            )
            .unwrap();
        let dp_update = rx.try_recv().unwrap();
        assert_eq!(dp_update.reference_nr(), Some("MTU_42"));

        manager
            .on_receive_apdu(163, 0, TypeId::C_IC_NA_1, Cot::ACTIVATION_TERM, false, 163)
            .await
            .unwrap();
        let act_term = rx.try_recv().unwrap();
        assert_eq!(act_term.reference_nr(), Some("MTU_42"));
        assert!(cache.interrogations.get(163).is_none());
    }
}
