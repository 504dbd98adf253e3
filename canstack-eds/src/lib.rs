//! Object dictionary and EDS file handling for the canstack CANopen stack
//!
//! The [`Eds`] type is the in-memory object dictionary: a typed, indexed
//! store of [`DataObject`]s with an update log, a parameter-name lookup
//! index, semantic accessors for the communication-profile objects, and
//! load/save in the CiA 306 Electronic Data Sheet format.

mod eds;
mod error;
mod file;
mod object;
mod value;

pub use eds::{
    DeviceInfo, DummyUsage, Eds, FileInfo, HeartbeatConsumer, PdoMap, PdoMapEntry, PdoSpec,
    SdoClientParameters, SdoServerParameters, PDO_MAPPING_OFFSET, STANDARD_BAUD_RATES,
};
pub use error::EdsError;
pub use object::{DataObject, LimitViolation, ObjectId, ObjectSpec};
pub use value::{Value, ValueError};
