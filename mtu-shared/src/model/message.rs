//! The wire message model exchanged between the hub and its subscribers.
//!
//! Every message carries a `reference_nr` that correlates a subscriber's
//! command with the eventual confirmation/termination published back to it.
//! Prefixes starting with `MTU_` are reserved for hub-initiated messages
//! (periodic updates, spontaneous transitions) that no subscriber requested.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{Coa, Cot, Ioa, TypeId};

/// Prefix reserved for hub-initiated reference numbers (`MTU_<n>`).
pub const MTU_REFERENCE_PREFIX: &str = "MTU";

/// Placeholder used when a reply cannot be correlated to any known command.
pub const UNEXPECTED_MSG_REFERENCE_NR: &str = "UNEXPECTED";

/// A decoded information-object value. Kept loosely typed because the
/// concrete representation (bool, float, bitstring, ...) depends on the
/// ASDU type and isn't interesting to the correlation layer.
pub type PointValue = serde_json::Value;

/// Outcome reported in a [`Confirmation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationStatus {
    WaitingForSend,
    SuccessfulSend,
    SuccessfulTerm,
    PositiveConfirmation,
    Fail,
    Queued,
    /// Assigned client-side by the command-client worker pool when a reply
    /// never arrives before the caller re-queues the command locally.
    ClientQueued,
    FinalRespRcvd,
}

/// Why a command could not be (fully) executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    Negative,
    Network,
    Coa,
    Ioa,
    Collision,
    /// Generic RTU-side failure not covered by an explicit negative bit
    /// (e.g. a send-exit callback reporting failure after retries).
    RtuSide,
    TypeUnsupported,
}

/// Result payload embedded in a [`Confirmation`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub status: Option<ConfirmationStatus>,
    pub reason: Option<FailReason>,
    /// Populated on [`FailReason::Collision`]: the `coa:ioa` already active.
    pub collision_dp: Option<String>,
    /// Reference number of the command already occupying that data point.
    pub collision_reference: Option<String>,
    /// IOAs that were sent successfully before a multi-IO command failed partway.
    pub still_sending: Option<Vec<Ioa>>,
}

/// A spontaneous or periodic update for one or more information objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfoMonitoring {
    pub coa: Coa,
    pub val_map: HashMap<Ioa, PointValue>,
    pub ts_map: HashMap<Ioa, i64>,
    pub type_id: TypeId,
    pub cot: Cot,
    pub reference_nr: String,
}

/// Subscriber command to set one or more process information values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfoControl {
    pub coa: Coa,
    pub val_map: HashMap<Ioa, PointValue>,
    pub reference_nr: String,
    pub max_tries: u32,
    /// If a collision is detected, queue behind it instead of failing immediately.
    pub queue_on_collision: bool,
}

/// Subscriber command to explicitly read a single data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDatapoint {
    pub coa: Coa,
    pub ioa: Ioa,
    pub reference_nr: String,
    pub max_tries: u32,
    pub queue_on_collision: bool,
}

/// Request for a station-wide (C_IC_NA_1) general interrogation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalInterroReq {
    pub coa: Coa,
    pub reference_nr: String,
    pub max_tries: u32,
}

/// Snapshot of every known data point in the hub, returned for a general interrogation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalInterroReply {
    pub rtu_status: HashMap<Coa, bool>,
    pub datapoints: HashMap<Coa, HashMap<Ioa, PointValue>>,
    pub reference_nr: String,
}

/// Request for the hub's view of which RTUs are currently connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuStatusReq {
    pub reference_nr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuStatusReply {
    pub rtu_status: HashMap<Coa, bool>,
    pub reference_nr: String,
}

/// Subscriber command to (de)activate a parameter-in-control-direction IOA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterActivate {
    pub coa: Coa,
    pub ioa: Ioa,
    pub activate: bool,
    pub reference_nr: String,
    pub max_tries: u32,
}

/// Subscriber command for station-level system information (interrogation, clock sync).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysInfoControl {
    pub coa: Coa,
    pub type_id: TypeId,
    pub reference_nr: String,
    pub max_tries: u32,
}

/// Hub-initiated periodic value republish, batched by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicUpdate {
    pub coa: Coa,
    pub val_map: HashMap<Ioa, PointValue>,
    pub ts_map: HashMap<Ioa, i64>,
    pub type_id: TypeId,
    pub reference_nr: String,
}

/// Terminal outcome of a command, correlated back via `reference_nr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    pub result: ConfirmationResult,
    pub reference_nr: String,
    pub max_tries: u32,
}

impl Confirmation {
    #[must_use]
    pub fn new(result: ConfirmationResult, reference_nr: impl Into<String>, max_tries: u32) -> Self {
        Self {
            result,
            reference_nr: reference_nr.into(),
            max_tries,
        }
    }

    /// Builds a success confirmation that inherits correlation data from the command it answers.
    #[must_use]
    pub fn successful_send(reference_nr: impl Into<String>, max_tries: u32) -> Self {
        Self::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::SuccessfulSend),
                ..Default::default()
            },
            reference_nr,
            max_tries,
        )
    }

    /// ACT_CON/DEACT_CON arrived positive: the command is accepted, an
    /// ACT_TERM may or may not follow.
    #[must_use]
    pub fn positive_confirmation(reference_nr: impl Into<String>, max_tries: u32) -> Self {
        Self::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::PositiveConfirmation),
                ..Default::default()
            },
            reference_nr,
            max_tries,
        )
    }

    /// ACT_TERM/DEACT_TERM arrived: the command has fully completed.
    #[must_use]
    pub fn successful_term(reference_nr: impl Into<String>, max_tries: u32) -> Self {
        Self::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::SuccessfulTerm),
                ..Default::default()
            },
            reference_nr,
            max_tries,
        )
    }

    /// The RTU rejected the command (negative ACT_CON/DEACT_CON bit set).
    #[must_use]
    pub fn fail(reference_nr: impl Into<String>, max_tries: u32, reason: FailReason) -> Self {
        Self::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::Fail),
                reason: Some(reason),
                ..Default::default()
            },
            reference_nr,
            max_tries,
        )
    }

    /// A command was queued behind a colliding in-flight command on the hub side.
    #[must_use]
    pub fn queued(reference_nr: impl Into<String>, max_tries: u32, collision_reference: impl Into<String>) -> Self {
        Self::new(
            ConfirmationResult {
                status: Some(ConfirmationStatus::Queued),
                collision_reference: Some(collision_reference.into()),
                ..Default::default()
            },
            reference_nr,
            max_tries,
        )
    }
}

/// Debug dump of the hub's internal cache, for operational introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtuCacheReq {
    pub reference_nr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtuCacheReply {
    pub cache_dump: serde_json::Value,
    pub reference_nr: String,
}

/// First message a client sends on the command channel: requests a unique
/// reference-number prefix from the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInitMsg {
    pub requested_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInitReply {
    pub subscriber_id: String,
}

/// Hub-initiated notice that an RTU connected or disconnected, published
/// before any in-flight commands addressed to it are cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatusChange {
    pub coa: Coa,
    pub connected: bool,
    pub ip: String,
    pub port: u16,
    pub reference_nr: String,
}

/// Follows a [`ConnectionStatusChange`] with `connected = false`: every
/// reference number that was in-flight against that RTU and has now been
/// abandoned, reported once in bulk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectCancelMsgsChange {
    pub coa: Coa,
    pub ip: String,
    pub port: u16,
    pub reference_nr: String,
    pub cancelled_ref_nrs: Vec<String>,
}

/// Every message type that can flow between a subscriber and the hub.
///
/// Tagged by `kind` on the wire so a reader doesn't need to guess the
/// variant from shape alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum IecMsg {
    ProcessInfoMonitoring(ProcessInfoMonitoring),
    ProcessInfoControl(ProcessInfoControl),
    ReadDatapoint(ReadDatapoint),
    TotalInterroReq(TotalInterroReq),
    TotalInterroReply(TotalInterroReply),
    RtuStatusReq(RtuStatusReq),
    RtuStatusReply(RtuStatusReply),
    ParameterActivate(ParameterActivate),
    SysInfoControl(SysInfoControl),
    PeriodicUpdate(PeriodicUpdate),
    Confirmation(Confirmation),
    MtuCacheReq(MtuCacheReq),
    MtuCacheReply(MtuCacheReply),
    SubscriptionInitMsg(SubscriptionInitMsg),
    SubscriptionInitReply(SubscriptionInitReply),
    ConnectionStatusChange(ConnectionStatusChange),
    DisconnectCancelMsgsChange(DisconnectCancelMsgsChange),
}

impl IecMsg {
    /// Reference number used to correlate this message with its eventual reply.
    ///
    /// The handshake pair has none; every other message carries one.
    #[must_use]
    pub fn reference_nr(&self) -> Option<&str> {
        match self {
            Self::ProcessInfoMonitoring(m) => Some(&m.reference_nr),
            Self::ProcessInfoControl(m) => Some(&m.reference_nr),
            Self::ReadDatapoint(m) => Some(&m.reference_nr),
            Self::TotalInterroReq(m) => Some(&m.reference_nr),
            Self::TotalInterroReply(m) => Some(&m.reference_nr),
            Self::RtuStatusReq(m) => Some(&m.reference_nr),
            Self::RtuStatusReply(m) => Some(&m.reference_nr),
            Self::ParameterActivate(m) => Some(&m.reference_nr),
            Self::SysInfoControl(m) => Some(&m.reference_nr),
            Self::PeriodicUpdate(m) => Some(&m.reference_nr),
            Self::Confirmation(m) => Some(&m.reference_nr),
            Self::MtuCacheReq(m) => Some(&m.reference_nr),
            Self::MtuCacheReply(m) => Some(&m.reference_nr),
            Self::ConnectionStatusChange(m) => Some(&m.reference_nr),
            Self::DisconnectCancelMsgsChange(m) => Some(&m.reference_nr),
            Self::SubscriptionInitMsg(_) | Self::SubscriptionInitReply(_) => None,
        }
    }

    /// Whether this message was generated by the hub itself rather than in
    /// reply to a subscriber command (reference number carries the `MTU_` prefix).
    #[must_use]
    pub fn mtu_initiated(&self) -> bool {
        self.reference_nr()
            .is_some_and(|r| r.starts_with(MTU_REFERENCE_PREFIX))
    }

    #[must_use]
    pub fn coa(&self) -> Option<Coa> {
        match self {
            Self::ProcessInfoMonitoring(m) => Some(m.coa),
            Self::ProcessInfoControl(m) => Some(m.coa),
            Self::ReadDatapoint(m) => Some(m.coa),
            Self::TotalInterroReq(m) => Some(m.coa),
            Self::ParameterActivate(m) => Some(m.coa),
            Self::SysInfoControl(m) => Some(m.coa),
            Self::PeriodicUpdate(m) => Some(m.coa),
            Self::ConnectionStatusChange(m) => Some(m.coa),
            Self::DisconnectCancelMsgsChange(m) => Some(m.coa),
            _ => None,
        }
    }
}

/// Validates that a client-requested reference-number prefix doesn't collide
/// with the hub's own `MTU_` namespace.
pub fn validate_subscriber_prefix(prefix: &str) -> Result<(), crate::error::MtuError> {
    if prefix.eq_ignore_ascii_case(MTU_REFERENCE_PREFIX) || prefix.is_empty() {
        return Err(crate::error::MtuError::ReservedReferencePrefix(
            prefix.to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_initiated_detected_by_prefix() {
        let msg = IecMsg::PeriodicUpdate(PeriodicUpdate {
            coa: 1,
            val_map: HashMap::new(),
            ts_map: HashMap::new(),
            type_id: TypeId::M_SP_NA_1,
            reference_nr: "MTU_42".to_string(),
        });
        assert!(msg.mtu_initiated());
    }

    #[test]
    fn subscriber_command_is_not_mtu_initiated() {
        let msg = IecMsg::ReadDatapoint(ReadDatapoint {
            coa: 1,
            ioa: 2,
            reference_nr: "APP_3".to_string(),
            max_tries: 2,
            queue_on_collision: false,
        });
        assert!(!msg.mtu_initiated());
    }

    #[test]
    fn roundtrips_through_json() {
        let msg = IecMsg::Confirmation(Confirmation::successful_send("APP_1", 1));
        let json = serde_json::to_string(&msg).unwrap();
        let back: IecMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reference_nr(), Some("APP_1"));
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        assert!(validate_subscriber_prefix("MTU").is_err());
        assert!(validate_subscriber_prefix("mtu").is_err());
        assert!(validate_subscriber_prefix("").is_err());
        assert!(validate_subscriber_prefix("APP").is_ok());
    }
}
