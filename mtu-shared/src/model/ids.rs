//! Addressing and protocol identifiers from IEC-60870-5-104.

use serde::{Deserialize, Serialize};

/// Common Address of ASDU: identifies an RTU (or, for [`GLOBAL_COA`], all RTUs at once).
pub type Coa = u32;

/// Information Object Address: identifies a single data point within an RTU.
pub type Ioa = u32;

/// Reserved COA broadcasting a command to every connected RTU (IEC 60870-5-101 §7.2.4).
pub const GLOBAL_COA: Coa = 65535;

/// ASDU type identifier. Ranges follow IEC 60870-5-101 §7.2.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TypeId(pub u8);

impl TypeId {
    pub const M_SP_NA_1: TypeId = TypeId(1); // single-point monitoring
    pub const M_ME_NC_1: TypeId = TypeId(13); // measured value, short float
    pub const C_SC_NA_1: TypeId = TypeId(45); // single command
    pub const C_IC_NA_1: TypeId = TypeId(100); // interrogation command
    pub const C_CI_NA_1: TypeId = TypeId(101); // counter interrogation command
    pub const C_CS_NA_1: TypeId = TypeId(103); // clock synchronization command
    pub const P_ME_NA_1: TypeId = TypeId(110); // parameter of measured value, normalized

    /// Monitoring-direction (process information) types, 1..=40.
    #[must_use]
    pub fn is_monitoring(self) -> bool {
        (1..=40).contains(&self.0)
    }

    /// Control-direction (process information) types, 45..=69.
    #[must_use]
    pub fn is_control(self) -> bool {
        (45..=69).contains(&self.0)
    }

    /// System information types: 70 (end of initialization) and 100..=107 (station commands).
    #[must_use]
    pub fn is_system(self) -> bool {
        self.0 == 70 || (100..=107).contains(&self.0)
    }

    /// Parameter-in-control-direction types, 110..=113.
    #[must_use]
    pub fn is_parameter(self) -> bool {
        (110..=113).contains(&self.0)
    }

    /// Whether an APDU of this type may legally be addressed to [`GLOBAL_COA`].
    ///
    /// Only general/counter interrogation, clock-sync, and reset-process
    /// commands are broadcastable; everything else requires a concrete RTU
    /// (IEC 60870-5-101 §7.2.4).
    #[must_use]
    pub fn global_coa_compatible(self) -> bool {
        matches!(self.0, 100 | 101 | 103 | 105)
    }

    /// Whether this type is a general or counter interrogation command,
    /// i.e. one whose answers accumulate in the per-interrogation cache.
    #[must_use]
    pub fn is_interrogation(self) -> bool {
        matches!(self, Self::C_IC_NA_1 | Self::C_CI_NA_1)
    }

    /// Whether this type carries a parameter modification rather than process data.
    #[must_use]
    pub fn carries_parameter_modification(self) -> bool {
        self.is_parameter()
    }
}

impl TryFrom<u8> for TypeId {
    type Error = std::convert::Infallible;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(TypeId(value))
    }
}

impl From<TypeId> for u8 {
    fn from(value: TypeId) -> Self {
        value.0
    }
}

/// Cause of Transmission, IEC 60870-5-101 §7.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Cot(pub u8);

impl Cot {
    pub const PERIODIC: Cot = Cot(1);
    pub const BACKGROUND_SCAN: Cot = Cot(2);
    pub const SPONTANEOUS: Cot = Cot(3);
    pub const REQUEST: Cot = Cot(5);
    pub const ACTIVATION: Cot = Cot(6);
    pub const ACTIVATION_CON: Cot = Cot(7);
    pub const DEACTIVATION: Cot = Cot(8);
    pub const DEACTIVATION_CON: Cot = Cot(9);
    pub const ACTIVATION_TERM: Cot = Cot(10);
    pub const INTERROGATED_BY_STATION: Cot = Cot(20);
    pub const UNKNOWN_TYPE_ID: Cot = Cot(44);
    pub const UNKNOWN_CAUSE: Cot = Cot(45);
    pub const UNKNOWN_ASDU_ADDRESS: Cot = Cot(46);
    pub const UNKNOWN_INFO_ADDRESS: Cot = Cot(47);

    #[must_use]
    pub fn is_unknown(self) -> bool {
        matches!(self.0, 44..=47)
    }
}

impl TryFrom<u8> for Cot {
    type Error = std::convert::Infallible;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(Cot(value))
    }
}

impl From<Cot> for u8 {
    fn from(value: Cot) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrogation_is_global_compatible() {
        assert!(TypeId::C_IC_NA_1.global_coa_compatible());
        assert!(TypeId::C_CI_NA_1.global_coa_compatible());
        assert!(!TypeId::C_SC_NA_1.global_coa_compatible());
    }

    #[test]
    fn parameter_types_carry_parameter_modification() {
        assert!(TypeId(111).carries_parameter_modification());
        assert!(!TypeId::M_SP_NA_1.carries_parameter_modification());
    }

    #[test]
    fn unknown_cots_are_flagged() {
        assert!(Cot::UNKNOWN_CAUSE.is_unknown());
        assert!(!Cot::SPONTANEOUS.is_unknown());
    }
}
