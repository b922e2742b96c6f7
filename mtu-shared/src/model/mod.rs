//! The message model: addressing, the message envelope, and subscriber policy.

pub mod ids;
pub mod message;
pub mod policy;

pub use ids::{Coa, Cot, Ioa, TypeId, GLOBAL_COA};
pub use message::{
    validate_subscriber_prefix, Confirmation, ConfirmationResult, ConfirmationStatus,
    ConnectionStatusChange, DisconnectCancelMsgsChange, FailReason, IecMsg, MtuCacheReply,
    MtuCacheReq, ParameterActivate, PeriodicUpdate, PointValue, ProcessInfoControl,
    ProcessInfoMonitoring, ReadDatapoint, RtuStatusReply, RtuStatusReq, SubscriptionInitMsg,
    SubscriptionInitReply, SysInfoControl, TotalInterroReply, TotalInterroReq,
    MTU_REFERENCE_PREFIX, UNEXPECTED_MSG_REFERENCE_NR,
};
pub use policy::SubscriptionPolicy;
