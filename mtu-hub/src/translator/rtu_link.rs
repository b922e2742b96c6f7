//! The boundary between the hub and the actual IEC-60870-5-104 wire codec.
//!
//! Encoding/decoding APDUs on the wire, keeping TCP connections to RTUs
//! alive, and running the protocol's own ACK/NACK timers are a separate
//! concern owned by the IEC-104 client library the hub is deployed against.
//! `RtuLink` is the narrow surface the translator needs from that library:
//! point lookups and command dispatch. A real deployment wires this to that
//! library's client; tests use [`InMemoryRtuLink`].

use async_trait::async_trait;

use mtu_shared::model::{Coa, Cot, Ioa, PointValue, TypeId};

/// A single information object as currently known to the IEC-104 stack.
#[derive(Debug, Clone)]
pub struct RtuDataPoint {
    pub coa: Coa,
    pub ioa: Ioa,
    pub type_id: TypeId,
    pub value: PointValue,
    pub quality_good: bool,
    pub updated_at_ms: i64,
}

/// Narrow interface onto the IEC-104 client library backing this hub.
#[async_trait]
pub trait RtuLink: Send + Sync + std::fmt::Debug {
    async fn has_server(&self, coa: Coa) -> bool;
    async fn has_datapoint(&self, coa: Coa, ioa: Ioa) -> bool;
    async fn get_datapoint(&self, coa: Coa, ioa: Ioa) -> Option<RtuDataPoint>;
    async fn update_datapoint(&self, coa: Coa, ioa: Ioa, value: PointValue);
    /// Sends a single-command activation for `coa:ioa`. Returns whether the
    /// send itself succeeded (not whether the RTU later ACKs it).
    async fn send_command(&self, coa: Coa, ioa: Ioa, cot: Cot) -> bool;
    async fn send_parameter_activation(&self, coa: Coa, ioa: Ioa, cot: Cot) -> bool;
    async fn send_system_info(&self, type_id: TypeId, coa: Coa) -> bool;
    async fn read_datapoint(&self, coa: Coa, ioa: Ioa) -> bool;
    /// Connectivity snapshot of every known RTU, for `RtuStatusReq`/`TotalInterroReq` replies.
    async fn rtu_status(&self) -> std::collections::HashMap<Coa, bool>;
    /// Full known-value snapshot of every RTU's data points, for `TotalInterroReq` replies.
    async fn snapshot_datapoints(&self) -> std::collections::HashMap<Coa, std::collections::HashMap<Ioa, PointValue>>;
}

/// In-memory double used by the hub's own unit/integration tests: every RTU
/// and datapoint is known in advance, and every send succeeds.
#[derive(Debug, Default)]
pub struct InMemoryRtuLink {
    pub known_coas: dashmap::DashSet<Coa>,
    pub known_ioas: dashmap::DashSet<(Coa, Ioa)>,
    pub fail_sends: dashmap::DashSet<(Coa, Ioa)>,
}

impl InMemoryRtuLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rtu(&self, coa: Coa, ioas: impl IntoIterator<Item = Ioa>) {
        self.known_coas.insert(coa);
        for ioa in ioas {
            self.known_ioas.insert((coa, ioa));
        }
    }
}

#[async_trait]
impl RtuLink for InMemoryRtuLink {
    async fn has_server(&self, coa: Coa) -> bool {
        self.known_coas.contains(&coa)
    }

    async fn has_datapoint(&self, coa: Coa, ioa: Ioa) -> bool {
        self.known_ioas.contains(&(coa, ioa))
    }

    async fn get_datapoint(&self, coa: Coa, ioa: Ioa) -> Option<RtuDataPoint> {
        self.known_ioas.contains(&(coa, ioa)).then(|| RtuDataPoint {
            coa,
            ioa,
            type_id: TypeId::M_SP_NA_1,
            value: serde_json::Value::Null,
            quality_good: true,
            updated_at_ms: 0,
        })
    }

    async fn update_datapoint(&self, _coa: Coa, _ioa: Ioa, _value: PointValue) {}

    async fn send_command(&self, coa: Coa, ioa: Ioa, _cot: Cot) -> bool {
        !self.fail_sends.contains(&(coa, ioa))
    }

    async fn send_parameter_activation(&self, coa: Coa, ioa: Ioa, _cot: Cot) -> bool {
        !self.fail_sends.contains(&(coa, ioa))
    }

    async fn send_system_info(&self, _type_id: TypeId, _coa: Coa) -> bool {
        true
    }

    async fn read_datapoint(&self, coa: Coa, ioa: Ioa) -> bool {
        !self.fail_sends.contains(&(coa, ioa))
    }

    async fn rtu_status(&self) -> std::collections::HashMap<Coa, bool> {
        self.known_coas.iter().map(|coa| (*coa, true)).collect()
    }

    async fn snapshot_datapoints(
        &self,
    ) -> std::collections::HashMap<Coa, std::collections::HashMap<Ioa, PointValue>> {
        let mut out: std::collections::HashMap<Coa, std::collections::HashMap<Ioa, PointValue>> =
            std::collections::HashMap::new();
        for entry in self.known_ioas.iter() {
            let (coa, ioa) = *entry;
            out.entry(coa).or_default().insert(ioa, serde_json::Value::Null);
        }
        out
    }
}
