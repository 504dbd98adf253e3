//! The object dictionary
//!
//! [`Eds`] is the typed, indexed store of a node's parameters. It owns every
//! [`DataObject`], maintains a parameter-name lookup index, records an update
//! log for protocol handlers, and provides semantic accessors for the
//! well-known communication-profile indices.

use std::collections::{BTreeMap, HashMap};

use canstack_common::lss::LssIdentity;
use canstack_common::types::{AccessType, DataType, ObjectCode};

use crate::error::EdsError;
use crate::object::{DataObject, ObjectId, ObjectSpec};
use crate::value::Value;

/// Contents of the FileInfo section of an EDS file
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileInfo {
    pub file_name: String,
    pub file_version: u8,
    pub file_revision: u8,
    pub eds_version: String,
    pub description: String,
    /// Creation time in `HH:MM(AM|PM)` form
    pub creation_time: String,
    /// Creation date in `MM-DD-YYYY` form
    pub creation_date: String,
    pub created_by: String,
    pub modification_time: String,
    pub modification_date: String,
    pub modified_by: String,
}

/// Contents of the DeviceInfo section of an EDS file
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub vendor_name: String,
    pub vendor_number: u32,
    pub product_name: String,
    pub product_number: u32,
    pub revision_number: u32,
    pub order_code: String,
    /// Baud rates the device supports, in kbit/s
    pub baud_rates: Vec<u32>,
    pub simple_boot_up_master: bool,
    pub simple_boot_up_slave: bool,
    /// Granularity of PDO mapping the device supports, in bits
    pub granularity: u8,
    pub dynamic_channels_supported: bool,
    pub group_messaging: bool,
    pub lss_supported: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            vendor_name: String::new(),
            vendor_number: 0,
            product_name: String::new(),
            product_number: 0,
            revision_number: 0,
            order_code: String::new(),
            baud_rates: Vec::new(),
            simple_boot_up_master: false,
            simple_boot_up_slave: false,
            granularity: 8,
            dynamic_channels_supported: false,
            group_messaging: false,
            lss_supported: false,
        }
    }
}

/// The standard baud rates named by DeviceInfo flags, in kbit/s
pub const STANDARD_BAUD_RATES: [u32; 8] = [10, 20, 50, 125, 250, 500, 800, 1000];

/// Contents of the DummyUsage section of an EDS file
///
/// Flags the basic data types (codes 1..=7) which may be used as dummy
/// mapping targets in PDOs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DummyUsage {
    pub supported: [bool; 8],
}

/// A heartbeat consumer entry from object 0x1016
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConsumer {
    /// The node whose heartbeat is monitored
    pub node_id: u8,
    /// The timeout in milliseconds
    pub time_ms: u16,
}

/// An SDO server parameter set from the 0x1200 range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdoServerParameters {
    /// COB-ID the server listens on (client to server)
    pub cob_id_rx: u16,
    /// COB-ID the server responds on (server to client)
    pub cob_id_tx: u16,
    /// Node ID of the peer client, when restricted
    pub client_id: Option<u8>,
}

/// An SDO client parameter set from the 0x1280 range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdoClientParameters {
    /// COB-ID the client transmits on (client to server)
    pub cob_id_tx: u16,
    /// COB-ID the client listens on (server to client)
    pub cob_id_rx: u16,
    /// Node ID of the peer server
    pub server_id: u8,
}

/// One mapped object of a PDO
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoMapEntry {
    /// Index of the mapped object
    pub index: u16,
    /// Sub-index of the mapped object (0 for scalars)
    pub sub: u8,
    /// Length of the mapped object in bits
    pub bit_length: u8,
}

/// A PDO view derived from a communication/mapping parameter pair
#[derive(Clone, Debug, PartialEq)]
pub struct PdoMap {
    /// Index of the communication parameter object this was derived from
    pub comm_index: u16,
    /// The COB-ID the PDO is sent or received on
    pub cob_id: u16,
    /// The transmission type field
    pub transmission_type: u8,
    /// Minimum interval between transmissions, in 100 us units
    pub inhibit_time: u16,
    /// Event timer period in milliseconds (0 = disabled)
    pub event_time: u16,
    /// SYNC counter value which starts this PDO
    pub sync_start: u8,
    /// The mapped objects, in payload order
    pub mapped: Vec<PdoMapEntry>,
    /// Total payload size in bytes
    pub data_size: usize,
}

/// Specification for creating a PDO with [`Eds::add_receive_pdo`] or
/// [`Eds::add_transmit_pdo`]
#[derive(Clone, Debug)]
pub struct PdoSpec {
    /// The COB-ID to send or receive on
    pub cob_id: u16,
    /// The transmission type field
    pub transmission_type: u8,
    /// Minimum interval between transmissions, in 100 us units
    pub inhibit_time: u16,
    /// Event timer period in milliseconds
    pub event_time: u16,
    /// SYNC counter value which starts this PDO
    pub sync_start: u8,
    /// Objects to map, as (index, sub) pairs
    pub mapped: Vec<(u16, Option<u8>)>,
}

const RPDO_COMM_BASE: u16 = 0x1400;
const TPDO_COMM_BASE: u16 = 0x1800;
const PDO_SLOTS: u16 = 0x200;
/// Offset from a PDO communication parameter to its mapping parameter
pub const PDO_MAPPING_OFFSET: u16 = 0x200;

const SDO_SERVER_BASE: u16 = 0x1200;
const SDO_CLIENT_BASE: u16 = 0x1280;
const SDO_SLOTS: u16 = 0x80;

/// The in-memory object dictionary
#[derive(Clone, Debug, Default)]
pub struct Eds {
    /// File metadata carried through load/save
    pub file_info: FileInfo,
    /// Device metadata carried through load/save
    pub device_info: DeviceInfo,
    /// Dummy-mapping flags carried through load/save
    pub dummy_usage: DummyUsage,
    /// Free-form comment lines carried through load/save
    pub comments: Vec<String>,
    objects: BTreeMap<u16, DataObject>,
    name_index: HashMap<String, Vec<u16>>,
    updates: Vec<ObjectId>,
    node_id: Option<u8>,
}

impl Eds {
    /// Create a dictionary holding the mandatory objects and the DEFTYPE
    /// entries for every known data type
    pub fn new() -> Self {
        let mut eds = Self::default();
        eds.file_info.eds_version = "4.0".to_string();

        for data_type in DataType::ALL {
            eds.add_entry(
                data_type as u16,
                ObjectSpec {
                    parameter_name: data_type.deftype_name().to_string(),
                    object_type: ObjectCode::DefType,
                    data_type: Some(data_type),
                    access_type: AccessType::Ro,
                    ..Default::default()
                },
            )
            .expect("DEFTYPE installation cannot conflict in an empty dictionary");
        }

        eds.add_entry(
            0x1000,
            ObjectSpec {
                parameter_name: "Device type".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned32),
                access_type: AccessType::Ro,
                ..Default::default()
            },
        )
        .unwrap();
        eds.add_entry(
            0x1001,
            ObjectSpec {
                parameter_name: "Error register".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned8),
                access_type: AccessType::Ro,
                ..Default::default()
            },
        )
        .unwrap();
        eds.add_entry(
            0x1018,
            ObjectSpec::aggregate("Identity object", ObjectCode::Record),
        )
        .unwrap();
        for (sub, name) in [
            (1, "Vendor-ID"),
            (2, "Product code"),
            (3, "Revision number"),
            (4, "Serial number"),
        ] {
            eds.add_sub_entry(
                0x1018,
                sub,
                ObjectSpec {
                    parameter_name: name.to_string(),
                    object_type: ObjectCode::Var,
                    data_type: Some(DataType::Unsigned32),
                    access_type: AccessType::Ro,
                    ..Default::default()
                },
            )
            .unwrap();
        }

        eds.updates.clear();
        eds
    }

    /// The node ID used to evaluate `$NODEID` expressions, when known
    pub fn node_id(&self) -> Option<u8> {
        self.node_id
    }

    /// Set the node ID used to evaluate `$NODEID` expressions
    pub fn set_node_id(&mut self, node_id: u8) {
        self.node_id = Some(node_id);
    }

    // ------------------------------------------------------------------
    // Core entry management
    // ------------------------------------------------------------------

    /// Add a new object to the dictionary
    ///
    /// Fails if the index already exists or the spec violates the
    /// object-type schema. Aggregate objects get an implicit sub-object 0
    /// tracking the highest populated sub-index; a nonzero `compact_sub_obj`
    /// additionally installs that many identical leaf sub-objects.
    pub fn add_entry(&mut self, index: u16, spec: ObjectSpec) -> Result<&DataObject, EdsError> {
        if self.objects.contains_key(&index) {
            return Err(EdsError::DuplicateIndex { index });
        }

        let compact = spec.compact_sub_obj;
        let compact_template = if compact > 0 { Some(spec.clone()) } else { None };
        let mut object = DataObject::from_spec(index, None, spec)?;

        if object.is_aggregate() {
            object.insert_sub(0, Self::sub0_object(index)?);
            if let Some(template) = compact_template {
                for sub in 1..=compact {
                    let sub_spec = ObjectSpec {
                        parameter_name: format!("{}{}", template.parameter_name, sub),
                        object_type: ObjectCode::Var,
                        compact_sub_obj: 0,
                        ..template.clone()
                    };
                    object.insert_sub(sub, DataObject::from_spec(index, Some(sub), sub_spec)?);
                }
            }
            object.refresh_max_sub_index();
        }

        self.index_name(&object);
        self.objects.insert(index, object);
        self.mark_update(ObjectId::index(index));
        Ok(&self.objects[&index])
    }

    /// Add a sub-object to an existing aggregate object
    pub fn add_sub_entry(
        &mut self,
        index: u16,
        sub: u8,
        spec: ObjectSpec,
    ) -> Result<(), EdsError> {
        if sub == 0 {
            return Err(EdsError::BadSpec {
                index,
                reason: "Sub-object 0 is managed implicitly".to_string(),
            });
        }
        let parent = self
            .objects
            .get_mut(&index)
            .ok_or(EdsError::NoSuchEntry { index })?;
        if !parent.is_aggregate() {
            return Err(EdsError::NotAnAggregate { index });
        }
        if parent.sub(sub).is_some() {
            return Err(EdsError::DuplicateSubIndex { index, sub });
        }
        let object = DataObject::from_spec(index, Some(sub), spec)?;
        parent.insert_sub(sub, object);
        parent.refresh_max_sub_index();
        self.mark_update(ObjectId::index(index));
        Ok(())
    }

    /// Remove an object from the dictionary
    pub fn remove_entry(&mut self, index: u16) -> Result<DataObject, EdsError> {
        let object = self
            .objects
            .remove(&index)
            .ok_or(EdsError::NoSuchEntry { index })?;
        self.unindex_name(&object);
        self.mark_update(ObjectId::index(index));
        Ok(object)
    }

    /// Remove a sub-object from an aggregate object
    pub fn remove_sub_entry(&mut self, index: u16, sub: u8) -> Result<(), EdsError> {
        if sub == 0 {
            return Err(EdsError::BadSpec {
                index,
                reason: "Sub-object 0 is managed implicitly".to_string(),
            });
        }
        let parent = self
            .objects
            .get_mut(&index)
            .ok_or(EdsError::NoSuchEntry { index })?;
        parent
            .remove_sub(sub)
            .ok_or(EdsError::NoSuchSubEntry { index, sub })?;
        parent.refresh_max_sub_index();
        self.mark_update(ObjectId::index(index));
        Ok(())
    }

    /// Get an object by index
    pub fn get_entry(&self, index: u16) -> Option<&DataObject> {
        self.objects.get(&index)
    }

    /// Get a sub-object by index and sub-index
    pub fn get_sub_entry(&self, index: u16, sub: u8) -> Option<&DataObject> {
        self.objects.get(&index)?.sub(sub)
    }

    /// Get every object whose parameter name matches
    pub fn get_entries_by_name(&self, name: &str) -> Vec<&DataObject> {
        match self.name_index.get(name) {
            Some(indices) => indices
                .iter()
                .filter_map(|index| self.objects.get(index))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Get the single object with the given parameter name
    ///
    /// Fails when no object, or more than one object, carries the name.
    pub fn get_entry_by_name(&self, name: &str) -> Result<&DataObject, EdsError> {
        let matches = self.get_entries_by_name(name);
        match matches.len() {
            1 => Ok(matches[0]),
            _ => Err(EdsError::NoSuchName {
                name: name.to_string(),
            }),
        }
    }

    /// Iterate all objects in index order
    pub fn entries(&self) -> impl Iterator<Item = &DataObject> {
        self.objects.values()
    }

    // ------------------------------------------------------------------
    // Raw and cooked accessors
    // ------------------------------------------------------------------

    /// Read the raw storage of a scalar object
    pub fn get_raw(&self, index: u16) -> Result<&[u8], EdsError> {
        let object = self.get_entry(index).ok_or(EdsError::NoSuchEntry { index })?;
        if object.is_aggregate() {
            return Err(EdsError::NotALeaf { index });
        }
        Ok(object.raw())
    }

    /// Read the raw storage of a sub-object
    pub fn get_raw_sub(&self, index: u16, sub: u8) -> Result<&[u8], EdsError> {
        if !self.objects.contains_key(&index) {
            return Err(EdsError::NoSuchEntry { index });
        }
        let object = self
            .get_sub_entry(index, sub)
            .ok_or(EdsError::NoSuchSubEntry { index, sub })?;
        Ok(object.raw())
    }

    /// Write the raw storage of a scalar object
    ///
    /// Fixed-width types require a matching buffer length; variable-width
    /// types take the new length. Emits an update for the object.
    pub fn set_raw(&mut self, index: u16, raw: &[u8]) -> Result<(), EdsError> {
        let object = self
            .objects
            .get_mut(&index)
            .ok_or(EdsError::NoSuchEntry { index })?;
        if object.is_aggregate() {
            return Err(EdsError::NotALeaf { index });
        }
        Self::check_raw_width(index, object, raw)?;
        object.set_raw_direct(raw.to_vec());
        self.mark_update(ObjectId::index(index));
        Ok(())
    }

    /// Write the raw storage of a sub-object
    ///
    /// Emits an update for both the sub-object and its parent.
    pub fn set_raw_sub(&mut self, index: u16, sub: u8, raw: &[u8]) -> Result<(), EdsError> {
        let parent = self
            .objects
            .get_mut(&index)
            .ok_or(EdsError::NoSuchEntry { index })?;
        let object = parent
            .sub_mut(sub)
            .ok_or(EdsError::NoSuchSubEntry { index, sub })?;
        Self::check_raw_width(index, object, raw)?;
        object.set_raw_direct(raw.to_vec());
        self.mark_update(ObjectId::sub(index, sub));
        self.mark_update(ObjectId::index(index));
        Ok(())
    }

    fn check_raw_width(index: u16, object: &DataObject, raw: &[u8]) -> Result<(), EdsError> {
        if let Some(expected) = object.data_type().and_then(|dt| dt.fixed_size()) {
            if raw.len() != expected {
                return Err(EdsError::BadValue {
                    index,
                    source: crate::value::ValueError::WrongSize {
                        data_type: object.data_type().unwrap(),
                        expected,
                        actual: raw.len(),
                    },
                });
            }
        }
        Ok(())
    }

    /// Read the cooked value of a scalar object
    pub fn get_value(&self, index: u16) -> Result<Value, EdsError> {
        let object = self.get_entry(index).ok_or(EdsError::NoSuchEntry { index })?;
        if object.is_aggregate() {
            return Err(EdsError::NotALeaf { index });
        }
        object.value().map_err(|source| EdsError::BadValue { index, source })
    }

    /// Read the cooked value of a sub-object
    pub fn get_value_sub(&self, index: u16, sub: u8) -> Result<Value, EdsError> {
        if !self.objects.contains_key(&index) {
            return Err(EdsError::NoSuchEntry { index });
        }
        let object = self
            .get_sub_entry(index, sub)
            .ok_or(EdsError::NoSuchSubEntry { index, sub })?;
        object.value().map_err(|source| EdsError::BadValue { index, source })
    }

    /// Write the cooked value of a scalar object
    pub fn set_value(&mut self, index: u16, value: Value) -> Result<(), EdsError> {
        let object = self.get_entry(index).ok_or(EdsError::NoSuchEntry { index })?;
        if object.is_aggregate() {
            return Err(EdsError::NotALeaf { index });
        }
        let raw = value
            .to_raw(object.data_type().unwrap_or_default(), object.scale_factor())
            .map_err(|source| EdsError::BadValue { index, source })?;
        self.set_raw(index, &raw)
    }

    /// Write the cooked value of a sub-object
    pub fn set_value_sub(&mut self, index: u16, sub: u8, value: Value) -> Result<(), EdsError> {
        if !self.objects.contains_key(&index) {
            return Err(EdsError::NoSuchEntry { index });
        }
        let object = self
            .get_sub_entry(index, sub)
            .ok_or(EdsError::NoSuchSubEntry { index, sub })?;
        let raw = value
            .to_raw(object.data_type().unwrap_or_default(), object.scale_factor())
            .map_err(|source| EdsError::BadValue { index, source })?;
        self.set_raw_sub(index, sub, &raw)
    }

    // ------------------------------------------------------------------
    // Update log
    // ------------------------------------------------------------------

    /// Drain the update log
    ///
    /// Every raw write records the written object; sub-object writes also
    /// record the parent. Handlers drain this once per processing tick.
    pub fn take_updates(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.updates)
    }

    fn mark_update(&mut self, id: ObjectId) {
        if self.updates.last() != Some(&id) {
            self.updates.push(id);
        }
    }

    fn index_name(&mut self, object: &DataObject) {
        self.name_index
            .entry(object.parameter_name().to_string())
            .or_default()
            .push(object.index());
    }

    fn unindex_name(&mut self, object: &DataObject) {
        if let Some(indices) = self.name_index.get_mut(object.parameter_name()) {
            indices.retain(|i| *i != object.index());
            if indices.is_empty() {
                self.name_index.remove(object.parameter_name());
            }
        }
    }

    fn sub0_object(index: u16) -> Result<DataObject, EdsError> {
        DataObject::from_spec(
            index,
            Some(0),
            ObjectSpec {
                parameter_name: "Highest sub-index supported".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned8),
                access_type: AccessType::Ro,
                ..Default::default()
            },
        )
    }

    // ------------------------------------------------------------------
    // Internal typed helpers for the semantic accessors
    // ------------------------------------------------------------------

    fn unsigned(&self, index: u16) -> Option<u64> {
        self.get_value(index).ok()?.as_unsigned()
    }

    fn unsigned_sub(&self, index: u16, sub: u8) -> Option<u64> {
        self.get_value_sub(index, sub).ok()?.as_unsigned()
    }

    /// Create a scalar config entry if missing, then store an unsigned value
    fn put_config(
        &mut self,
        index: u16,
        name: &str,
        data_type: DataType,
        value: u64,
    ) -> Result<(), EdsError> {
        if self.get_entry(index).is_none() {
            self.add_entry(
                index,
                ObjectSpec {
                    parameter_name: name.to_string(),
                    object_type: ObjectCode::Var,
                    data_type: Some(data_type),
                    access_type: AccessType::Rw,
                    ..Default::default()
                },
            )?;
        }
        self.set_value(index, Value::Unsigned(value))
    }

    /// Read-modify-write of bits in an unsigned scalar config entry
    fn update_config_bits(
        &mut self,
        index: u16,
        name: &str,
        data_type: DataType,
        mask: u64,
        bits: u64,
    ) -> Result<(), EdsError> {
        let current = self.unsigned(index).unwrap_or(0);
        self.put_config(index, name, data_type, (current & !mask) | (bits & mask))
    }

    // ------------------------------------------------------------------
    // SYNC configuration (0x1005, 0x1006, 0x1019)
    // ------------------------------------------------------------------

    /// The COB-ID SYNC is sent or received on
    pub fn sync_cob_id(&self) -> Option<u16> {
        self.unsigned(0x1005).map(|v| (v & 0x7FF) as u16)
    }

    /// True when bit 30 of 0x1005 enables SYNC production
    pub fn sync_generation_enabled(&self) -> bool {
        self.unsigned(0x1005)
            .is_some_and(|v| v & (1 << 30) != 0)
    }

    /// Set the SYNC COB-ID, preserving the generation bit
    pub fn set_sync_cob_id(&mut self, cob_id: u16) -> Result<(), EdsError> {
        check_cob_id(cob_id)?;
        self.update_config_bits(
            0x1005,
            "COB-ID SYNC message",
            DataType::Unsigned32,
            0x7FF,
            cob_id as u64,
        )
    }

    /// Enable or disable SYNC production (bit 30 of 0x1005)
    pub fn set_sync_generation(&mut self, enable: bool) -> Result<(), EdsError> {
        self.update_config_bits(
            0x1005,
            "COB-ID SYNC message",
            DataType::Unsigned32,
            1 << 30,
            (enable as u64) << 30,
        )
    }

    /// The SYNC cycle period in microseconds
    pub fn sync_cycle_period(&self) -> Option<u32> {
        self.unsigned(0x1006).map(|v| v as u32)
    }

    /// Set the SYNC cycle period in microseconds
    pub fn set_sync_cycle_period(&mut self, period_us: u32) -> Result<(), EdsError> {
        self.put_config(
            0x1006,
            "Communication cycle period",
            DataType::Unsigned32,
            period_us as u64,
        )
    }

    /// The synchronous counter overflow value
    pub fn sync_overflow(&self) -> Option<u8> {
        self.unsigned(0x1019).map(|v| v as u8)
    }

    /// Set the synchronous counter overflow value
    pub fn set_sync_overflow(&mut self, overflow: u8) -> Result<(), EdsError> {
        self.put_config(
            0x1019,
            "Synchronous counter overflow value",
            DataType::Unsigned8,
            overflow as u64,
        )
    }

    // ------------------------------------------------------------------
    // TIME configuration (0x1012)
    // ------------------------------------------------------------------

    /// The COB-ID TIME is sent or received on
    pub fn time_cob_id(&self) -> Option<u16> {
        self.unsigned(0x1012).map(|v| (v & 0x7FF) as u16)
    }

    /// True when bit 30 of 0x1012 enables TIME production
    pub fn time_produce_enabled(&self) -> bool {
        self.unsigned(0x1012).is_some_and(|v| v & (1 << 30) != 0)
    }

    /// True when bit 31 of 0x1012 enables TIME consumption
    pub fn time_consume_enabled(&self) -> bool {
        self.unsigned(0x1012).is_some_and(|v| v & (1 << 31) != 0)
    }

    /// Set the TIME COB-ID, preserving the produce/consume bits
    pub fn set_time_cob_id(&mut self, cob_id: u16) -> Result<(), EdsError> {
        check_cob_id(cob_id)?;
        self.update_config_bits(
            0x1012,
            "COB-ID time stamp object",
            DataType::Unsigned32,
            0x7FF,
            cob_id as u64,
        )
    }

    /// Enable or disable TIME production (bit 30 of 0x1012)
    pub fn set_time_produce(&mut self, enable: bool) -> Result<(), EdsError> {
        self.update_config_bits(
            0x1012,
            "COB-ID time stamp object",
            DataType::Unsigned32,
            1 << 30,
            (enable as u64) << 30,
        )
    }

    /// Enable or disable TIME consumption (bit 31 of 0x1012)
    pub fn set_time_consume(&mut self, enable: bool) -> Result<(), EdsError> {
        self.update_config_bits(
            0x1012,
            "COB-ID time stamp object",
            DataType::Unsigned32,
            1 << 31,
            (enable as u64) << 31,
        )
    }

    // ------------------------------------------------------------------
    // EMCY configuration (0x1001, 0x1003, 0x1014, 0x1015, 0x1028)
    // ------------------------------------------------------------------

    /// The error register byte (0x1001)
    pub fn error_register(&self) -> u8 {
        self.unsigned(0x1001).unwrap_or(0) as u8
    }

    /// Set the error register byte (0x1001)
    pub fn set_error_register(&mut self, value: u8) -> Result<(), EdsError> {
        self.set_value(0x1001, Value::Unsigned(value as u64))
    }

    /// The COB-ID emergency messages are produced on
    pub fn emcy_cob_id(&self) -> Option<u16> {
        self.unsigned(0x1014).map(|v| (v & 0x7FF) as u16)
    }

    /// True when emergency production is enabled (bit 31 of 0x1014 clear)
    pub fn emcy_valid(&self) -> bool {
        self.unsigned(0x1014).is_some_and(|v| v & (1 << 31) == 0)
    }

    /// Set the EMCY COB-ID
    ///
    /// A zero COB-ID marks the producer invalid (bit 31 set).
    pub fn set_emcy_cob_id(&mut self, cob_id: u16) -> Result<(), EdsError> {
        check_cob_id(cob_id)?;
        let invalid = if cob_id == 0 { 1u64 << 31 } else { 0 };
        self.put_config(
            0x1014,
            "COB-ID emergency message",
            DataType::Unsigned32,
            cob_id as u64 | invalid,
        )
    }

    /// The EMCY inhibit time in 100 us units
    pub fn emcy_inhibit_time(&self) -> u16 {
        self.unsigned(0x1015).unwrap_or(0) as u16
    }

    /// Set the EMCY inhibit time in 100 us units
    pub fn set_emcy_inhibit_time(&mut self, time: u16) -> Result<(), EdsError> {
        self.put_config(0x1015, "Inhibit time EMCY", DataType::Unsigned16, time as u64)
    }

    /// The COB-IDs of valid entries in the emergency consumer object (0x1028)
    pub fn emcy_consumers(&self) -> Vec<u16> {
        let Some(entry) = self.get_entry(0x1028) else {
            return Vec::new();
        };
        entry
            .subs()
            .filter(|sub| sub.sub_index() != Some(0))
            .filter_map(|sub| sub.value().ok()?.as_unsigned())
            .filter(|v| v & (1 << 31) == 0)
            .map(|v| (v & 0x7FF) as u16)
            .collect()
    }

    /// Add an emergency consumer COB-ID to 0x1028
    pub fn add_emcy_consumer(&mut self, cob_id: u16) -> Result<(), EdsError> {
        check_cob_id(cob_id)?;
        if self.get_entry(0x1028).is_none() {
            self.add_entry(
                0x1028,
                ObjectSpec::aggregate("Emergency consumer object", ObjectCode::Array),
            )?;
        }
        let sub = self.first_free_sub(0x1028);
        self.add_sub_entry(
            0x1028,
            sub,
            ObjectSpec {
                parameter_name: format!("Emergency consumer {sub}"),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned32),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(cob_id as u64)),
                ..Default::default()
            },
        )
    }

    /// Remove an emergency consumer COB-ID from 0x1028
    pub fn remove_emcy_consumer(&mut self, cob_id: u16) -> Result<(), EdsError> {
        let entry = self
            .get_entry(0x1028)
            .ok_or(EdsError::NoSuchEntry { index: 0x1028 })?;
        let sub = entry
            .subs()
            .filter(|sub| sub.sub_index() != Some(0))
            .find(|sub| {
                sub.value()
                    .ok()
                    .and_then(|v| v.as_unsigned())
                    .is_some_and(|v| (v & 0x7FF) as u16 == cob_id)
            })
            .and_then(|sub| sub.sub_index())
            .ok_or(EdsError::NoSuchSubEntry {
                index: 0x1028,
                sub: 0,
            })?;
        self.remove_sub_entry(0x1028, sub)
    }

    /// The stored error history from 0x1003, newest first
    pub fn emcy_history(&self) -> Vec<(u16, u16)> {
        let Some(entry) = self.get_entry(0x1003) else {
            return Vec::new();
        };
        let count = entry
            .sub(0)
            .and_then(|sub0| sub0.value().ok()?.as_unsigned())
            .unwrap_or(0) as u8;
        (1..=count)
            .filter_map(|sub| {
                let v = entry.sub(sub)?.value().ok()?.as_unsigned()?;
                Some(((v & 0xFFFF) as u16, (v >> 16) as u16))
            })
            .collect()
    }

    /// Set the capacity of the error history object (0x1003)
    pub fn set_emcy_history_length(&mut self, length: u8) -> Result<(), EdsError> {
        if self.get_entry(0x1003).is_none() {
            self.add_entry(
                0x1003,
                ObjectSpec::aggregate("Pre-defined error field", ObjectCode::Array),
            )?;
        }
        let current = self.get_entry(0x1003).unwrap().max_sub_index();
        for sub in (length as u16 + 1)..=(current as u16) {
            self.remove_sub_entry(0x1003, sub as u8)?;
        }
        for sub in (current + 1)..=length {
            self.add_sub_entry(
                0x1003,
                sub,
                ObjectSpec {
                    parameter_name: format!("Standard error field {sub}"),
                    object_type: ObjectCode::Var,
                    data_type: Some(DataType::Unsigned32),
                    access_type: AccessType::Ro,
                    ..Default::default()
                },
            )?;
        }
        // Sub 0 of 0x1003 counts stored errors rather than sub-entries
        let stored = self.emcy_history().len().min(length as usize) as u8;
        self.set_raw_sub(0x1003, 0, &[stored])
    }

    /// Push a new error to the front of the history, shifting older entries
    /// down and dropping the oldest when full
    pub fn push_emcy_history(&mut self, code: u16, info: u16) -> Result<(), EdsError> {
        let entry = self
            .get_entry(0x1003)
            .ok_or(EdsError::NoSuchEntry { index: 0x1003 })?;
        let capacity = entry.max_sub_index();
        if capacity == 0 {
            return Ok(());
        }
        let mut history = self.emcy_history();
        history.truncate(capacity as usize - 1);
        history.insert(0, (code, info));

        for (i, (code, info)) in history.iter().enumerate() {
            let raw = ((*info as u32) << 16 | *code as u32).to_le_bytes();
            self.set_raw_sub(0x1003, i as u8 + 1, &raw)?;
        }
        self.set_raw_sub(0x1003, 0, &[history.len() as u8])
    }

    // ------------------------------------------------------------------
    // Heartbeat configuration (0x1016, 0x1017)
    // ------------------------------------------------------------------

    /// The heartbeat producer period in milliseconds
    pub fn heartbeat_producer_time(&self) -> u32 {
        self.unsigned(0x1017).unwrap_or(0) as u32
    }

    /// Set the heartbeat producer period in milliseconds
    pub fn set_heartbeat_producer_time(&mut self, time_ms: u32) -> Result<(), EdsError> {
        self.put_config(
            0x1017,
            "Producer heartbeat time",
            DataType::Unsigned32,
            time_ms as u64,
        )
    }

    /// The configured heartbeat consumers from 0x1016
    ///
    /// Each sub-entry packs the monitored node ID into bits 16..24 and the
    /// timeout in milliseconds into bits 0..16.
    pub fn heartbeat_consumers(&self) -> Vec<HeartbeatConsumer> {
        let Some(entry) = self.get_entry(0x1016) else {
            return Vec::new();
        };
        entry
            .subs()
            .filter(|sub| sub.sub_index() != Some(0))
            .filter_map(|sub| sub.value().ok()?.as_unsigned())
            .filter(|v| *v != 0)
            .map(|v| HeartbeatConsumer {
                node_id: ((v >> 16) & 0xFF) as u8,
                time_ms: (v & 0xFFFF) as u16,
            })
            .filter(|c| c.time_ms > 0)
            .collect()
    }

    /// The timeout configured for one monitored node, if any
    pub fn get_heartbeat_consumer(&self, node_id: u8) -> Option<u16> {
        self.heartbeat_consumers()
            .iter()
            .find(|c| c.node_id == node_id)
            .map(|c| c.time_ms)
    }

    /// Add a heartbeat consumer for a node
    pub fn add_heartbeat_consumer(&mut self, node_id: u8, time_ms: u16) -> Result<(), EdsError> {
        check_node_id(node_id)?;
        if time_ms == 0 {
            return Err(EdsError::RangeError {
                what: "Heartbeat consumer time",
                value: 0,
                min: 1,
                max: u16::MAX as i64,
            });
        }
        if self.get_heartbeat_consumer(node_id).is_some() {
            return Err(EdsError::BadSpec {
                index: 0x1016,
                reason: format!("Node {node_id} is already consumed"),
            });
        }
        if self.get_entry(0x1016).is_none() {
            self.add_entry(
                0x1016,
                ObjectSpec::aggregate("Consumer heartbeat time", ObjectCode::Array),
            )?;
        }
        let sub = self.first_free_sub(0x1016);
        let value = ((node_id as u64) << 16) | time_ms as u64;
        self.add_sub_entry(
            0x1016,
            sub,
            ObjectSpec {
                parameter_name: format!("Consumer heartbeat time {sub}"),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned32),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(value)),
                ..Default::default()
            },
        )
    }

    /// Remove the heartbeat consumer for a node
    pub fn remove_heartbeat_consumer(&mut self, node_id: u8) -> Result<(), EdsError> {
        let entry = self
            .get_entry(0x1016)
            .ok_or(EdsError::NoSuchEntry { index: 0x1016 })?;
        let sub = entry
            .subs()
            .filter(|sub| sub.sub_index() != Some(0))
            .find(|sub| {
                sub.value()
                    .ok()
                    .and_then(|v| v.as_unsigned())
                    .is_some_and(|v| ((v >> 16) & 0xFF) as u8 == node_id)
            })
            .and_then(|sub| sub.sub_index())
            .ok_or(EdsError::NoSuchSubEntry {
                index: 0x1016,
                sub: 0,
            })?;
        self.remove_sub_entry(0x1016, sub)
    }

    // ------------------------------------------------------------------
    // Identity (0x1018)
    // ------------------------------------------------------------------

    /// The node identity from 0x1018
    pub fn identity(&self) -> LssIdentity {
        LssIdentity {
            vendor_id: self.unsigned_sub(0x1018, 1).unwrap_or(0) as u32,
            product_code: self.unsigned_sub(0x1018, 2).unwrap_or(0) as u32,
            revision: self.unsigned_sub(0x1018, 3).unwrap_or(0) as u32,
            serial: self.unsigned_sub(0x1018, 4).unwrap_or(0) as u32,
        }
    }

    /// Write the node identity to 0x1018
    pub fn set_identity(&mut self, identity: LssIdentity) -> Result<(), EdsError> {
        self.set_value_sub(0x1018, 1, Value::Unsigned(identity.vendor_id as u64))?;
        self.set_value_sub(0x1018, 2, Value::Unsigned(identity.product_code as u64))?;
        self.set_value_sub(0x1018, 3, Value::Unsigned(identity.revision as u64))?;
        self.set_value_sub(0x1018, 4, Value::Unsigned(identity.serial as u64))
    }

    /// True when DeviceInfo declares LSS support
    pub fn lss_supported(&self) -> bool {
        self.device_info.lss_supported
    }

    // ------------------------------------------------------------------
    // SDO server / client parameters (0x1200.., 0x1280..)
    // ------------------------------------------------------------------

    /// The SDO server parameter sets from the 0x1200 range
    pub fn sdo_server_parameters(&self) -> Vec<SdoServerParameters> {
        self.collect_sdo_parameters(SDO_SERVER_BASE)
            .into_iter()
            .map(|(rx, tx, peer)| SdoServerParameters {
                cob_id_rx: rx,
                cob_id_tx: tx,
                client_id: peer,
            })
            .collect()
    }

    /// The SDO client parameter sets from the 0x1280 range
    pub fn sdo_client_parameters(&self) -> Vec<SdoClientParameters> {
        self.collect_sdo_parameters(SDO_CLIENT_BASE)
            .into_iter()
            .filter_map(|(tx, rx, peer)| {
                Some(SdoClientParameters {
                    cob_id_tx: tx,
                    cob_id_rx: rx,
                    server_id: peer?,
                })
            })
            .collect()
    }

    fn collect_sdo_parameters(&self, base: u16) -> Vec<(u16, u16, Option<u8>)> {
        let mut out = Vec::new();
        for index in base..base + SDO_SLOTS {
            let Some(entry) = self.get_entry(index) else {
                continue;
            };
            let first = entry
                .sub(1)
                .and_then(|s| s.value().ok()?.as_unsigned())
                .unwrap_or(0);
            let second = entry
                .sub(2)
                .and_then(|s| s.value().ok()?.as_unsigned())
                .unwrap_or(0);
            // Bit 31 marks the parameter set invalid
            if first & (1 << 31) != 0 || second & (1 << 31) != 0 {
                continue;
            }
            let peer = entry
                .sub(3)
                .and_then(|s| s.value().ok()?.as_unsigned())
                .map(|v| v as u8)
                .filter(|v| *v != 0);
            out.push(((first & 0x7FF) as u16, (second & 0x7FF) as u16, peer));
        }
        out
    }

    /// Add an SDO server parameter set
    ///
    /// `client_id` restricts the server to one peer; the conventional COB-IDs
    /// for a node's default server are `0x600 + id` / `0x580 + id`.
    pub fn add_sdo_server_parameter(
        &mut self,
        client_id: u8,
        cob_id_rx: u16,
        cob_id_tx: u16,
    ) -> Result<(), EdsError> {
        check_cob_id(cob_id_rx)?;
        check_cob_id(cob_id_tx)?;
        let index = self.first_free_index(SDO_SERVER_BASE, SDO_SERVER_BASE + SDO_SLOTS)?;
        self.add_entry(
            index,
            ObjectSpec::aggregate("SDO server parameter", ObjectCode::Record),
        )?;
        self.add_u32_sub(index, 1, "COB-ID client to server", cob_id_rx as u64)?;
        self.add_u32_sub(index, 2, "COB-ID server to client", cob_id_tx as u64)?;
        self.add_sub_entry(
            index,
            3,
            ObjectSpec {
                parameter_name: "Node-ID of the SDO client".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned8),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(client_id as u64)),
                ..Default::default()
            },
        )
    }

    /// Remove the SDO server parameter set for a client
    pub fn remove_sdo_server_parameter(&mut self, client_id: u8) -> Result<(), EdsError> {
        let index = self
            .find_sdo_parameter(SDO_SERVER_BASE, client_id)
            .ok_or(EdsError::NoSuchEntry {
                index: SDO_SERVER_BASE,
            })?;
        self.remove_entry(index).map(|_| ())
    }

    /// Add an SDO client parameter set for a server node
    pub fn add_sdo_client_parameter(
        &mut self,
        server_id: u8,
        cob_id_tx: u16,
        cob_id_rx: u16,
    ) -> Result<(), EdsError> {
        check_node_id(server_id)?;
        check_cob_id(cob_id_tx)?;
        check_cob_id(cob_id_rx)?;
        let index = self.first_free_index(SDO_CLIENT_BASE, SDO_CLIENT_BASE + SDO_SLOTS)?;
        self.add_entry(
            index,
            ObjectSpec::aggregate("SDO client parameter", ObjectCode::Record),
        )?;
        self.add_u32_sub(index, 1, "COB-ID client to server", cob_id_tx as u64)?;
        self.add_u32_sub(index, 2, "COB-ID server to client", cob_id_rx as u64)?;
        self.add_sub_entry(
            index,
            3,
            ObjectSpec {
                parameter_name: "Node-ID of the SDO server".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned8),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(server_id as u64)),
                ..Default::default()
            },
        )
    }

    /// Remove the SDO client parameter set for a server
    pub fn remove_sdo_client_parameter(&mut self, server_id: u8) -> Result<(), EdsError> {
        let index = self
            .find_sdo_parameter(SDO_CLIENT_BASE, server_id)
            .ok_or(EdsError::NoSuchEntry {
                index: SDO_CLIENT_BASE,
            })?;
        self.remove_entry(index).map(|_| ())
    }

    fn find_sdo_parameter(&self, base: u16, peer_id: u8) -> Option<u16> {
        (base..base + SDO_SLOTS).find(|index| {
            self.get_entry(*index).is_some_and(|entry| {
                entry
                    .sub(3)
                    .and_then(|s| s.value().ok()?.as_unsigned())
                    .is_some_and(|v| v as u8 == peer_id)
            })
        })
    }

    fn add_u32_sub(&mut self, index: u16, sub: u8, name: &str, value: u64) -> Result<(), EdsError> {
        self.add_sub_entry(
            index,
            sub,
            ObjectSpec {
                parameter_name: name.to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned32),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(value)),
                ..Default::default()
            },
        )
    }

    // ------------------------------------------------------------------
    // PDO configuration (0x1400.., 0x1600.., 0x1800.., 0x1A00..)
    // ------------------------------------------------------------------

    /// The configured receive PDOs
    pub fn receive_pdos(&self) -> Vec<PdoMap> {
        self.collect_pdos(RPDO_COMM_BASE)
    }

    /// The configured transmit PDOs
    pub fn transmit_pdos(&self) -> Vec<PdoMap> {
        self.collect_pdos(TPDO_COMM_BASE)
    }

    fn collect_pdos(&self, base: u16) -> Vec<PdoMap> {
        let mut out = Vec::new();
        for comm_index in base..base + PDO_SLOTS {
            let Some(comm) = self.get_entry(comm_index) else {
                continue;
            };
            let cob = comm
                .sub(1)
                .and_then(|s| s.value().ok()?.as_unsigned())
                .unwrap_or(1 << 31);
            // Bit 31 marks the PDO invalid
            if cob & (1 << 31) != 0 {
                continue;
            }
            let sub_u8 = |sub: u8| {
                comm.sub(sub)
                    .and_then(|s| s.value().ok()?.as_unsigned())
                    .unwrap_or(0) as u8
            };
            let sub_u16 = |sub: u8| {
                comm.sub(sub)
                    .and_then(|s| s.value().ok()?.as_unsigned())
                    .unwrap_or(0) as u16
            };

            let mut mapped = Vec::new();
            let mut data_size = 0;
            if let Some(mapping) = self.get_entry(comm_index + PDO_MAPPING_OFFSET) {
                let count = mapping
                    .sub(0)
                    .and_then(|s| s.value().ok()?.as_unsigned())
                    .unwrap_or(0) as u8;
                for sub in 1..=count {
                    let Some(v) = mapping.sub(sub).and_then(|s| s.value().ok()?.as_unsigned())
                    else {
                        continue;
                    };
                    let entry = PdoMapEntry {
                        index: (v >> 16) as u16,
                        sub: ((v >> 8) & 0xFF) as u8,
                        bit_length: (v & 0xFF) as u8,
                    };
                    data_size += entry.bit_length as usize / 8;
                    mapped.push(entry);
                }
            }

            out.push(PdoMap {
                comm_index,
                cob_id: (cob & 0x7FF) as u16,
                transmission_type: sub_u8(2),
                inhibit_time: sub_u16(3),
                event_time: sub_u16(5),
                sync_start: sub_u8(6),
                mapped,
                data_size,
            });
        }
        out
    }

    /// Create a receive PDO from a spec
    pub fn add_receive_pdo(&mut self, spec: &PdoSpec) -> Result<(), EdsError> {
        self.add_pdo(RPDO_COMM_BASE, spec)
    }

    /// Create a transmit PDO from a spec
    pub fn add_transmit_pdo(&mut self, spec: &PdoSpec) -> Result<(), EdsError> {
        self.add_pdo(TPDO_COMM_BASE, spec)
    }

    /// Remove the receive PDO on a COB-ID
    pub fn remove_receive_pdo(&mut self, cob_id: u16) -> Result<(), EdsError> {
        self.remove_pdo(RPDO_COMM_BASE, cob_id)
    }

    /// Remove the transmit PDO on a COB-ID
    pub fn remove_transmit_pdo(&mut self, cob_id: u16) -> Result<(), EdsError> {
        self.remove_pdo(TPDO_COMM_BASE, cob_id)
    }

    fn add_pdo(&mut self, base: u16, spec: &PdoSpec) -> Result<(), EdsError> {
        check_cob_id(spec.cob_id)?;

        // Resolve and validate the mapped objects before creating anything
        let mut entries = Vec::new();
        let mut total_bits = 0u32;
        for (index, sub) in &spec.mapped {
            let object = match sub {
                Some(sub) => self
                    .get_sub_entry(*index, *sub)
                    .ok_or(EdsError::NoSuchSubEntry {
                        index: *index,
                        sub: *sub,
                    })?,
                None => self.get_entry(*index).ok_or(EdsError::NoSuchEntry { index: *index })?,
            };
            if !object.pdo_mapping() {
                return Err(EdsError::BadSpec {
                    index: *index,
                    reason: "Object is not PDO-mappable".to_string(),
                });
            }
            let bits = object.size() as u32 * 8;
            total_bits += bits;
            entries.push((*index, sub.unwrap_or(0), bits as u8));
        }
        if total_bits > 64 {
            return Err(EdsError::BadSpec {
                index: base,
                reason: format!("Mapped objects span {total_bits} bits, limit is 64"),
            });
        }

        let comm_index = self.first_free_index(base, base + PDO_SLOTS)?;
        let mapping_index = comm_index + PDO_MAPPING_OFFSET;

        let comm_name = if base == RPDO_COMM_BASE {
            "RPDO communication parameter"
        } else {
            "TPDO communication parameter"
        };
        let mapping_name = if base == RPDO_COMM_BASE {
            "RPDO mapping parameter"
        } else {
            "TPDO mapping parameter"
        };

        self.add_entry(comm_index, ObjectSpec::aggregate(comm_name, ObjectCode::Record))?;
        self.add_u32_sub(comm_index, 1, "COB-ID used by PDO", spec.cob_id as u64)?;
        self.add_sub_entry(
            comm_index,
            2,
            ObjectSpec {
                parameter_name: "Transmission type".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned8),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(spec.transmission_type as u64)),
                ..Default::default()
            },
        )?;
        self.add_sub_entry(
            comm_index,
            3,
            ObjectSpec {
                parameter_name: "Inhibit time".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned16),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(spec.inhibit_time as u64)),
                ..Default::default()
            },
        )?;
        self.add_sub_entry(
            comm_index,
            5,
            ObjectSpec {
                parameter_name: "Event timer".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned16),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(spec.event_time as u64)),
                ..Default::default()
            },
        )?;
        self.add_sub_entry(
            comm_index,
            6,
            ObjectSpec {
                parameter_name: "SYNC start value".to_string(),
                object_type: ObjectCode::Var,
                data_type: Some(DataType::Unsigned8),
                access_type: AccessType::Rw,
                default_value: Some(Value::Unsigned(spec.sync_start as u64)),
                ..Default::default()
            },
        )?;

        self.add_entry(
            mapping_index,
            ObjectSpec::aggregate(mapping_name, ObjectCode::Record),
        )?;
        for (i, (index, sub, bits)) in entries.iter().enumerate() {
            let value = ((*index as u64) << 16) | ((*sub as u64) << 8) | *bits as u64;
            self.add_u32_sub(
                mapping_index,
                i as u8 + 1,
                &format!("Application object {}", i + 1),
                value,
            )?;
        }
        Ok(())
    }

    fn remove_pdo(&mut self, base: u16, cob_id: u16) -> Result<(), EdsError> {
        let comm_index = (base..base + PDO_SLOTS)
            .find(|index| {
                self.get_entry(*index).is_some_and(|entry| {
                    entry
                        .sub(1)
                        .and_then(|s| s.value().ok()?.as_unsigned())
                        .is_some_and(|v| (v & 0x7FF) as u16 == cob_id)
                })
            })
            .ok_or(EdsError::NoSuchEntry { index: base })?;
        self.remove_entry(comm_index)?;
        if self.get_entry(comm_index + PDO_MAPPING_OFFSET).is_some() {
            self.remove_entry(comm_index + PDO_MAPPING_OFFSET)?;
        }
        Ok(())
    }

    fn first_free_index(&self, base: u16, end: u16) -> Result<u16, EdsError> {
        (base..end)
            .find(|index| !self.objects.contains_key(index))
            .ok_or(EdsError::BadSpec {
                index: base,
                reason: "No free index in range".to_string(),
            })
    }

    fn first_free_sub(&self, index: u16) -> u8 {
        let Some(entry) = self.get_entry(index) else {
            return 1;
        };
        (1..=255u8)
            .find(|sub| entry.sub(*sub).is_none())
            .unwrap_or(255)
    }
}

fn check_cob_id(cob_id: u16) -> Result<(), EdsError> {
    if cob_id > 0x7FF {
        return Err(EdsError::RangeError {
            what: "COB-ID",
            value: cob_id as i64,
            min: 0,
            max: 0x7FF,
        });
    }
    Ok(())
}

fn check_node_id(node_id: u8) -> Result<(), EdsError> {
    if !(1..=127).contains(&node_id) {
        return Err(EdsError::RangeError {
            what: "Node ID",
            value: node_id as i64,
            min: 1,
            max: 127,
        });
    }
    Ok(())
}
