//! Per-subscriber policy controlling which APDUs the translator forwards and how.

use serde::{Deserialize, Serialize};

/// Flags a subscriber negotiates at handshake time to shape what the
/// protocol translator forwards and how aggressively it aggregates updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionPolicy {
    /// Forward raw S-format (supervisory) frames.
    pub s_frames: bool,
    /// Forward raw U-format (unnumbered control) frames.
    pub u_frames: bool,
    /// Forward ACT_CON/ACT_TERM/DEACT_CON acknowledgements as their own messages.
    pub acks: bool,
    /// Combine multiple explicitly-read IOAs into a single reply.
    ///
    /// Left unimplemented upstream: accepted by the hub for forward
    /// compatibility, but rejected with [`crate::error::MtuError::PolicyUnsupported`]
    /// if ever actually triggered.
    pub combine_ios: bool,
    /// Batch periodic updates for the same (COA, type) into one message.
    pub combine_periodic_ios: bool,
    /// Allow clock-sync commands to receive more than one ACT_CON before an ACT_TERM.
    pub independent_clock_sync: bool,
    /// Silently drop datapoint callbacks whose COT the hub can't classify instead of erroring.
    pub ignore_unknown_cot_dp_callbacks: bool,
    /// Forward datapoints regardless of their IEC-104 quality descriptor.
    pub ignore_quality: bool,
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self {
            s_frames: false,
            u_frames: false,
            acks: true,
            combine_ios: false,
            combine_periodic_ios: true,
            independent_clock_sync: false,
            ignore_unknown_cot_dp_callbacks: true,
            ignore_quality: true,
        }
    }
}
