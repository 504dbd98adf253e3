//! Shared definitions for the canstack CANopen stack
//!
//! This crate holds the pieces shared between the object dictionary and the
//! protocol handlers: the CAN frame model, the fixed broadcast message types,
//! the SDO and LSS wire codecs, and the data/object type enumerations.

pub mod lss;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;
pub mod types;

pub use messages::CanFrame;
pub use node_id::NodeId;
pub use traits::{CanSendError, CanSender};
