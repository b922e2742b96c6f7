//! Telecontrol aggregation hub: correlates IEC-60870-5-104 traffic between
//! one or more RTUs and any number of subscriber applications.
//!
//! The hub is deployed against an external IEC-104 client library, which it
//! consumes only through the narrow [`translator::RtuLink`] surface. Inbound
//! RTU events flow through the [`translator`] into the [`subscription`]
//! manager, which publishes application messages over the [`server`]'s
//! publish socket; subscriber commands arrive on the command socket and are
//! executed through [`subscription::CommandHandler`].

pub mod server;
pub mod subscription;
pub mod translator;
