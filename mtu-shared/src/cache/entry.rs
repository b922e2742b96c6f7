//! A single cache entry and the state machine it walks through.

use std::collections::HashMap;

use crate::model::{IecMsg, Ioa, PointValue};

/// Lifecycle of one active command against a single (COA, IOA).
///
/// Success path: `WaitingForSend -> SentNoAck -> ReceivedAck -> ReceivedTerm`.
/// `ReceivedNegAck` is terminal and failing. `InRtuProgress` is an auxiliary
/// state used by the global-COA fan-out while a per-RTU activation is still
/// outstanding after the broadcast command itself left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    WaitingForSend,
    SentNoAck,
    ReceivedAck,
    ReceivedTerm,
    ReceivedNegAck,
    InRtuProgress,
}

impl MsgStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ReceivedTerm | Self::ReceivedNegAck)
    }

    /// Validates a transition against the success-path state machine.
    ///
    /// Clock-sync commands are the one case upstream tolerates repeated
    /// `SentNoAck -> ReceivedAck` edges without an intervening `ReceivedTerm`
    /// (RTUs may answer more than one ACT_CON for a clock-sync broadcast).
    #[must_use]
    pub fn can_transition_to(self, next: MsgStatus, tolerate_repeated_ack: bool) -> bool {
        use MsgStatus::{InRtuProgress, ReceivedAck, ReceivedNegAck, ReceivedTerm, SentNoAck, WaitingForSend};
        match (self, next) {
            (WaitingForSend, SentNoAck) => true,
            (SentNoAck, ReceivedAck | ReceivedNegAck) => true,
            (ReceivedAck, ReceivedTerm | ReceivedNegAck) => true,
            (ReceivedAck, ReceivedAck) => tolerate_repeated_ack,
            (SentNoAck, InRtuProgress) | (InRtuProgress, ReceivedAck) => true,
            _ => false,
        }
    }
}

/// One active command (or hub-initiated update) tracked against a data point,
/// parameter, interrogation, or global-fan-out slot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub msg: IecMsg,
    pub status: MsgStatus,
    /// Accumulator used when a subscriber policy requests combining multiple
    /// IOAs into a single reply. Left empty in practice: `combine_ios` is not
    /// yet implemented (see `SubscriptionPolicy::combine_ios`).
    pub io_cache: HashMap<Ioa, PointValue>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(msg: IecMsg, status: MsgStatus) -> Self {
        Self {
            msg,
            status,
            io_cache: HashMap::new(),
        }
    }

    pub fn decrement_msg_max_tries(&mut self) {
        match &mut self.msg {
            IecMsg::ProcessInfoControl(m) => m.max_tries = m.max_tries.saturating_sub(1),
            IecMsg::ReadDatapoint(m) => m.max_tries = m.max_tries.saturating_sub(1),
            IecMsg::ParameterActivate(m) => m.max_tries = m.max_tries.saturating_sub(1),
            IecMsg::SysInfoControl(m) => m.max_tries = m.max_tries.saturating_sub(1),
            IecMsg::TotalInterroReq(m) => m.max_tries = m.max_tries.saturating_sub(1),
            _ => {}
        }
    }

    /// Always false until `combine_ios` is implemented: without a fixed
    /// expected IOA set there is nothing to compare the accumulator against.
    #[must_use]
    pub fn is_cache_filled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_linear() {
        assert!(MsgStatus::WaitingForSend.can_transition_to(MsgStatus::SentNoAck, false));
        assert!(MsgStatus::SentNoAck.can_transition_to(MsgStatus::ReceivedAck, false));
        assert!(MsgStatus::ReceivedAck.can_transition_to(MsgStatus::ReceivedTerm, false));
    }

    #[test]
    fn repeated_ack_rejected_unless_clock_sync() {
        assert!(!MsgStatus::ReceivedAck.can_transition_to(MsgStatus::ReceivedAck, false));
        assert!(MsgStatus::ReceivedAck.can_transition_to(MsgStatus::ReceivedAck, true));
    }

    #[test]
    fn neg_ack_is_terminal() {
        assert!(MsgStatus::ReceivedNegAck.is_terminal());
        assert!(!MsgStatus::SentNoAck.is_terminal());
    }
}
