//! CANopen protocol handlers and node facade
//!
//! This crate implements the application-layer protocols of a CANopen node
//! on top of an abstract frame transport: NMT with heartbeat production and
//! monitoring, EMCY, SYNC, TIME, the PDO engine, an SDO server and client
//! with expedited/segmented/block transfers, and LSS in both the slave and
//! master roles.
//!
//! The stack is single-threaded and cooperative. The host owns the event
//! loop: it feeds received frames to [`Node::receive`] and calls
//! [`Node::process`] with a monotonic microsecond clock; outbound frames
//! flow through the [`canstack_common::CanSender`] passed to `process`.

mod ctx;
mod emcy;
mod events;
mod lss_master;
mod lss_slave;
mod nmt;
mod node;
mod pdo;
mod sdo_client;
mod sdo_server;
mod sync;
#[cfg(test)]
mod test_support;
mod time;

pub use emcy::EmcyError;
pub use events::{EmcyMessage, NodeEvent};
pub use lss_master::{
    InquireKind, LssError, LssRequestHandle, DEFAULT_LSS_TIMEOUT_MS,
};
pub use nmt::{NodeStateHandle, DEFAULT_STATE_REQUEST_TIMEOUT_MS};
pub use node::{ConfigError, Node, NodeConfig};
pub use pdo::PdoError;
pub use sdo_client::{
    RawAbortCode, SdoClientError, SdoRequestOptions, SdoTransferHandle, DEFAULT_SDO_TIMEOUT_MS,
};
pub use sync::SyncError;
pub use time::TimeError;
