//! EDS file load and save
//!
//! The Electronic Data Sheet is an INI file per CiA 306: metadata sections
//! (`FileInfo`, `DeviceInfo`, `DummyUsage`, `Comments`), three object lists
//! (`MandatoryObjects`, `OptionalObjects`, `ManufacturerObjects`), and one
//! section per object (`XXXX`) or sub-object (`XXXXsubYY`).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use configparser::ini::Ini;
use log::warn;
use snafu::ResultExt as _;

use canstack_common::types::{AccessType, DataType, ObjectCode};

use crate::eds::{DummyUsage, Eds, FileInfo, STANDARD_BAUD_RATES};
use crate::error::{EdsError, IoSnafu, ParseIntSnafu};
use crate::object::{DataObject, ObjectSpec};
use crate::value::Value;

type IniMap = HashMap<String, HashMap<String, Option<String>>>;

/// View of one INI section with typed field readers
struct Section<'a> {
    map: &'a HashMap<String, Option<String>>,
    section: String,
}

impl<'a> Section<'a> {
    fn from_map(map: &'a IniMap, section: &str) -> Result<Self, EdsError> {
        let section_map = map
            .get(&section.to_lowercase())
            .ok_or_else(|| EdsError::EdsFormat {
                message: format!("Missing required section '{section}'"),
            })?;
        Ok(Self {
            map: section_map,
            section: section.to_string(),
        })
    }

    fn get_string_opt(&self, field: &str) -> Option<String> {
        self.map
            .get(&field.to_lowercase())
            .and_then(|v| v.clone())
            .filter(|v| !v.is_empty())
    }

    fn get_string(&self, field: &str) -> Result<String, EdsError> {
        self.get_string_opt(field).ok_or_else(|| EdsError::EdsFormat {
            message: format!("Missing required field '{}' in '{}'", field, self.section),
        })
    }

    /// Read a field as an unsigned int, accepting decimal or 0x-prefixed hex
    fn get_u32_opt(&self, field: &str) -> Result<Option<u32>, EdsError> {
        let Some(text) = self.get_string_opt(field) else {
            return Ok(None);
        };
        parse_u32(&text)
            .context(ParseIntSnafu {
                field: field.to_string(),
                section: self.section.clone(),
            })
            .map(Some)
    }

    fn get_u32(&self, field: &str) -> Result<u32, EdsError> {
        self.get_u32_opt(field)?.ok_or_else(|| EdsError::EdsFormat {
            message: format!("Missing required field '{}' in '{}'", field, self.section),
        })
    }

    fn get_bool(&self, field: &str) -> Result<bool, EdsError> {
        Ok(self.get_u32_opt(field)?.unwrap_or(0) == 1)
    }
}

fn parse_u32(text: &str) -> Result<u32, std::num::ParseIntError> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    }
}

/// Evaluate a `$NODEID+...` expression against the configured node ID
fn evaluate_node_id_expression(expression: &str, node_id: u8) -> String {
    let substituted = expression.replace("$NODEID", &node_id.to_string());
    substituted
        .split('+')
        .map(str::trim)
        .filter_map(|term| {
            if let Some(hex) = term.strip_prefix("0x").or_else(|| term.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16).ok()
            } else {
                term.parse::<i64>().ok()
            }
        })
        .sum::<i64>()
        .to_string()
}

fn section_is_object(name: &str) -> Option<u16> {
    if name.len() == 4 && name.chars().all(|c| c.is_ascii_hexdigit()) {
        u16::from_str_radix(name, 16).ok()
    } else {
        None
    }
}

fn section_is_sub_object(name: &str) -> Option<(u16, u8)> {
    if name.len() > 7
        && name[4..7].eq_ignore_ascii_case("sub")
        && name[0..4].chars().all(|c| c.is_ascii_hexdigit())
    {
        let index = u16::from_str_radix(&name[0..4], 16).ok()?;
        let sub = u8::from_str_radix(&name[7..], 16).ok()?;
        Some((index, sub))
    } else {
        None
    }
}

/// Build an [`ObjectSpec`] from the keys of an object or sub-object section
fn read_object_spec(
    section: &Section,
    node_id: Option<u8>,
    index: u16,
) -> Result<ObjectSpec, EdsError> {
    let parameter_name = section.get_string("ParameterName")?;
    let object_type = section
        .get_u32_opt("ObjectType")?
        .map(|v| ObjectCode::try_from(v as u8))
        .transpose()
        .map_err(|e| EdsError::EdsFormat {
            message: format!("{}: {e}", section.section),
        })?
        .unwrap_or(ObjectCode::Var);
    let data_type = section
        .get_u32_opt("DataType")?
        .map(|v| DataType::try_from(v as u16))
        .transpose()
        .map_err(|e| EdsError::EdsFormat {
            message: format!("{}: {e}", section.section),
        })?;
    let access_type = match section.get_string_opt("AccessType") {
        Some(text) => AccessType::from_str(&text).map_err(|e| EdsError::EdsFormat {
            message: format!("{}: {e}", section.section),
        })?,
        None => AccessType::default(),
    };

    let parse_value = |field: &str| -> Result<Option<Value>, EdsError> {
        let Some(text) = section.get_string_opt(field) else {
            return Ok(None);
        };
        let Some(data_type) = data_type else {
            return Ok(None);
        };
        let text = if text.contains("$NODEID") {
            match node_id {
                Some(node_id) => evaluate_node_id_expression(&text, node_id),
                None => {
                    warn!(
                        "{}: '{field}' uses $NODEID but no node ID is configured",
                        section.section
                    );
                    evaluate_node_id_expression(&text, 0)
                }
            }
        } else {
            text
        };
        Value::parse(&text, data_type)
            .map(Some)
            .map_err(|source| EdsError::BadValue { index, source })
    };

    Ok(ObjectSpec {
        parameter_name,
        object_type,
        data_type,
        access_type,
        default_value: parse_value("DefaultValue")?,
        low_limit: parse_value("LowLimit")?,
        high_limit: parse_value("HighLimit")?,
        pdo_mapping: section.get_bool("PDOMapping")?,
        compact_sub_obj: section.get_u32_opt("CompactSubObj")?.unwrap_or(0) as u8,
        obj_flags: section.get_u32_opt("ObjFlags")?.unwrap_or(0),
        scale_factor: 1.0,
    })
}

impl Eds {
    /// Load an EDS file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Eds, EdsError> {
        Self::load_with_node_id(path, None)
    }

    /// Load an EDS file, evaluating `$NODEID` expressions against a node ID
    pub fn load_with_node_id<P: AsRef<Path>>(
        path: P,
        node_id: Option<u8>,
    ) -> Result<Eds, EdsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_path_buf(),
        })?;
        Self::from_eds_str(&content, node_id)
    }

    /// Parse an EDS file from a string
    ///
    /// The dictionary starts from [`Eds::new`], so the mandatory objects and
    /// DEFTYPE entries exist even when the file does not spell them out;
    /// objects defined by the file replace the built-in defaults. A malformed
    /// file fails the whole load rather than installing a partial dictionary.
    pub fn from_eds_str(content: &str, node_id: Option<u8>) -> Result<Eds, EdsError> {
        let mut ini = Ini::new();
        let map = ini
            .read(content.to_string())
            .map_err(|message| EdsError::IniFormat { message })?;

        let mut eds = Eds::new();
        if let Some(node_id) = node_id {
            eds.set_node_id(node_id);
        }

        let file_info = Section::from_map(&map, "FileInfo")?;
        eds.file_info = FileInfo {
            file_name: file_info.get_string_opt("FileName").unwrap_or_default(),
            file_version: file_info.get_u32_opt("FileVersion")?.unwrap_or(1) as u8,
            file_revision: file_info.get_u32_opt("FileRevision")?.unwrap_or(1) as u8,
            eds_version: file_info
                .get_string_opt("EDSVersion")
                .unwrap_or_else(|| "4.0".to_string()),
            description: file_info.get_string_opt("Description").unwrap_or_default(),
            creation_time: file_info.get_string_opt("CreationTime").unwrap_or_default(),
            creation_date: file_info.get_string_opt("CreationDate").unwrap_or_default(),
            created_by: file_info.get_string_opt("CreatedBy").unwrap_or_default(),
            modification_time: file_info
                .get_string_opt("ModificationTime")
                .unwrap_or_default(),
            modification_date: file_info
                .get_string_opt("ModificationDate")
                .unwrap_or_default(),
            modified_by: file_info.get_string_opt("ModifiedBy").unwrap_or_default(),
        };

        let device_info = Section::from_map(&map, "DeviceInfo")?;
        eds.device_info.vendor_name = device_info.get_string_opt("VendorName").unwrap_or_default();
        eds.device_info.vendor_number = device_info.get_u32_opt("VendorNumber")?.unwrap_or(0);
        eds.device_info.product_name = device_info.get_string_opt("ProductName").unwrap_or_default();
        eds.device_info.product_number = device_info.get_u32_opt("ProductNumber")?.unwrap_or(0);
        eds.device_info.revision_number = device_info.get_u32_opt("RevisionNumber")?.unwrap_or(0);
        eds.device_info.order_code = device_info.get_string_opt("OrderCode").unwrap_or_default();
        eds.device_info.baud_rates = STANDARD_BAUD_RATES
            .iter()
            .filter(|rate| {
                device_info
                    .get_bool(&format!("BaudRate_{rate}"))
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        eds.device_info.simple_boot_up_master = device_info.get_bool("SimpleBootUpMaster")?;
        eds.device_info.simple_boot_up_slave = device_info.get_bool("SimpleBootUpSlave")?;
        eds.device_info.granularity = device_info.get_u32_opt("Granularity")?.unwrap_or(8) as u8;
        eds.device_info.dynamic_channels_supported =
            device_info.get_bool("DynamicChannelsSupported")?;
        eds.device_info.group_messaging = device_info.get_bool("GroupMessaging")?;
        eds.device_info.lss_supported = device_info.get_bool("LSS_Supported")?;

        if let Ok(dummy) = Section::from_map(&map, "DummyUsage") {
            let mut usage = DummyUsage::default();
            for (code, flag) in usage.supported.iter_mut().enumerate().skip(1) {
                *flag = dummy.get_bool(&format!("Dummy{code:04}")).unwrap_or(false);
            }
            eds.dummy_usage = usage;
        }

        if let Ok(comments) = Section::from_map(&map, "Comments") {
            let lines = comments.get_u32_opt("Lines")?.unwrap_or(0);
            for line in 1..=lines {
                eds.comments
                    .push(comments.get_string_opt(&format!("Line{line}")).unwrap_or_default());
            }
        }

        // Collect object and sub-object sections, sorted so parents are
        // installed before their sub-objects
        let mut objects: Vec<u16> = Vec::new();
        let mut sub_objects: Vec<(u16, u8)> = Vec::new();
        for name in map.keys() {
            if let Some(index) = section_is_object(name) {
                objects.push(index);
            } else if let Some(key) = section_is_sub_object(name) {
                sub_objects.push(key);
            }
        }
        objects.sort_unstable();
        sub_objects.sort_unstable();

        for index in objects {
            let section = Section::from_map(&map, &format!("{index:04x}"))?;
            let spec = read_object_spec(&section, eds.node_id(), index)?;
            // Objects spelled out by the file replace the built-in defaults
            if eds.get_entry(index).is_some() {
                eds.remove_entry(index)?;
            }
            eds.add_entry(index, spec)?;
        }

        for (index, sub) in &sub_objects {
            if *sub == 0 {
                continue;
            }
            let section = Section::from_map(&map, &format!("{index:04x}sub{sub:x}"))?;
            let spec = read_object_spec(&section, eds.node_id(), *index)?;
            eds.add_sub_entry(*index, *sub, spec)?;
        }

        // Sub 0 is installed implicitly with its parent; the stored value is
        // applied last so objects like the error history keep their counter
        for (index, sub) in &sub_objects {
            if *sub != 0 {
                continue;
            }
            let section = Section::from_map(&map, &format!("{index:04x}sub0"))?;
            let spec = read_object_spec(&section, eds.node_id(), *index)?;
            if let Some(value) = spec.default_value {
                let raw = value
                    .to_raw(DataType::Unsigned8, 1.0)
                    .map_err(|source| EdsError::BadValue { index: *index, source })?;
                eds.set_raw_sub(*index, 0, &raw)?;
            }
        }

        eds.take_updates();
        Ok(eds)
    }

    /// Serialize the dictionary to EDS text
    pub fn to_eds_string(&self) -> String {
        let mut out = String::new();
        let w = &mut out;

        writeln!(w, "[FileInfo]").unwrap();
        writeln!(w, "FileName={}", self.file_info.file_name).unwrap();
        writeln!(w, "FileVersion={}", self.file_info.file_version).unwrap();
        writeln!(w, "FileRevision={}", self.file_info.file_revision).unwrap();
        writeln!(w, "EDSVersion={}", self.file_info.eds_version).unwrap();
        writeln!(w, "Description={}", self.file_info.description).unwrap();
        writeln!(w, "CreationTime={}", self.file_info.creation_time).unwrap();
        writeln!(w, "CreationDate={}", self.file_info.creation_date).unwrap();
        writeln!(w, "CreatedBy={}", self.file_info.created_by).unwrap();
        writeln!(w, "ModificationTime={}", self.file_info.modification_time).unwrap();
        writeln!(w, "ModificationDate={}", self.file_info.modification_date).unwrap();
        writeln!(w, "ModifiedBy={}", self.file_info.modified_by).unwrap();
        writeln!(w).unwrap();

        writeln!(w, "[DeviceInfo]").unwrap();
        writeln!(w, "VendorName={}", self.device_info.vendor_name).unwrap();
        writeln!(w, "VendorNumber={}", self.device_info.vendor_number).unwrap();
        writeln!(w, "ProductName={}", self.device_info.product_name).unwrap();
        writeln!(w, "ProductNumber={}", self.device_info.product_number).unwrap();
        writeln!(w, "RevisionNumber={}", self.device_info.revision_number).unwrap();
        writeln!(w, "OrderCode={}", self.device_info.order_code).unwrap();
        for rate in STANDARD_BAUD_RATES {
            writeln!(
                w,
                "BaudRate_{rate}={}",
                self.device_info.baud_rates.contains(&rate) as u8
            )
            .unwrap();
        }
        writeln!(
            w,
            "SimpleBootUpMaster={}",
            self.device_info.simple_boot_up_master as u8
        )
        .unwrap();
        writeln!(
            w,
            "SimpleBootUpSlave={}",
            self.device_info.simple_boot_up_slave as u8
        )
        .unwrap();
        writeln!(w, "Granularity={}", self.device_info.granularity).unwrap();
        writeln!(
            w,
            "DynamicChannelsSupported={}",
            self.device_info.dynamic_channels_supported as u8
        )
        .unwrap();
        writeln!(w, "GroupMessaging={}", self.device_info.group_messaging as u8).unwrap();
        writeln!(w, "NrOfRXPDO={}", self.receive_pdos().len()).unwrap();
        writeln!(w, "NrOfTXPDO={}", self.transmit_pdos().len()).unwrap();
        writeln!(w, "LSS_Supported={}", self.device_info.lss_supported as u8).unwrap();
        writeln!(w).unwrap();

        writeln!(w, "[DummyUsage]").unwrap();
        for (code, flag) in self.dummy_usage.supported.iter().enumerate().skip(1) {
            writeln!(w, "Dummy{code:04}={}", *flag as u8).unwrap();
        }
        writeln!(w).unwrap();

        writeln!(w, "[Comments]").unwrap();
        writeln!(w, "Lines={}", self.comments.len()).unwrap();
        for (i, line) in self.comments.iter().enumerate() {
            writeln!(w, "Line{}={}", i + 1, line).unwrap();
        }
        writeln!(w).unwrap();

        // Split the real objects into the three standard lists; DEFTYPE
        // entries below 0x1000 stay implicit
        let mandatory: Vec<u16> = [0x1000u16, 0x1001, 0x1018]
            .iter()
            .filter(|index| self.get_entry(**index).is_some())
            .copied()
            .collect();
        let optional: Vec<u16> = self
            .entries()
            .map(|o| o.index())
            .filter(|i| {
                ((0x1000..0x2000).contains(i) || *i >= 0x6000) && !mandatory.contains(i)
            })
            .collect();
        let manufacturer: Vec<u16> = self
            .entries()
            .map(|o| o.index())
            .filter(|i| (0x2000..0x6000).contains(i))
            .collect();

        for (name, list) in [
            ("MandatoryObjects", &mandatory),
            ("OptionalObjects", &optional),
            ("ManufacturerObjects", &manufacturer),
        ] {
            writeln!(w, "[{name}]").unwrap();
            writeln!(w, "SupportedObjects={}", list.len()).unwrap();
            for (i, index) in list.iter().enumerate() {
                writeln!(w, "{}=0x{index:04X}", i + 1).unwrap();
            }
            writeln!(w).unwrap();

            for index in list {
                self.write_object(w, self.get_entry(*index).unwrap());
            }
        }

        out
    }

    fn write_object(&self, w: &mut String, object: &DataObject) {
        writeln!(w, "[{:04X}]", object.index()).unwrap();
        writeln!(w, "ParameterName={}", object.parameter_name()).unwrap();
        writeln!(w, "ObjectType=0x{:X}", object.object_type() as u8).unwrap();
        if object.is_aggregate() && object.compact_sub_obj() == 0 {
            writeln!(w, "SubNumber={}", object.sub_number()).unwrap();
        }
        if object.compact_sub_obj() > 0 {
            writeln!(w, "CompactSubObj={}", object.compact_sub_obj()).unwrap();
        }
        Self::write_leaf_fields(w, object);
        writeln!(w).unwrap();

        if object.is_aggregate() && object.compact_sub_obj() == 0 {
            for sub in object.subs() {
                writeln!(w, "[{:04X}sub{:X}]", object.index(), sub.sub_index().unwrap()).unwrap();
                writeln!(w, "ParameterName={}", sub.parameter_name()).unwrap();
                writeln!(w, "ObjectType=0x{:X}", sub.object_type() as u8).unwrap();
                Self::write_leaf_fields(w, sub);
                writeln!(w).unwrap();
            }
        }
    }

    fn write_leaf_fields(w: &mut String, object: &DataObject) {
        if object.is_aggregate() && object.compact_sub_obj() == 0 {
            return;
        }
        if let Some(data_type) = object.data_type() {
            writeln!(w, "DataType=0x{:04X}", data_type as u16).unwrap();
        }
        writeln!(w, "AccessType={}", object.access_type().as_str()).unwrap();
        // Current raw content is persisted as the default value; compact
        // aggregates have no raw of their own and keep their template default
        if let Ok(value) = object.value() {
            writeln!(w, "DefaultValue={}", value.to_eds_string()).unwrap();
        } else if let Some(value) = object.default_value() {
            writeln!(w, "DefaultValue={}", value.to_eds_string()).unwrap();
        }
        if let Some(low) = object.low_limit() {
            writeln!(w, "LowLimit={}", low.to_eds_string()).unwrap();
        }
        if let Some(high) = object.high_limit() {
            writeln!(w, "HighLimit={}", high.to_eds_string()).unwrap();
        }
        writeln!(w, "PDOMapping={}", object.pdo_mapping() as u8).unwrap();
        if object.obj_flags() != 0 {
            writeln!(w, "ObjFlags=0x{:X}", object.obj_flags()).unwrap();
        }
    }

    /// Save the dictionary to an EDS file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), EdsError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_eds_string()).context(IoSnafu {
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eds::PdoSpec;
    use canstack_common::lss::LssIdentity;

    fn populated_eds() -> Eds {
        let mut eds = Eds::new();
        eds.file_info.file_name = "test.eds".to_string();
        eds.file_info.description = "Test device".to_string();
        eds.file_info.creation_time = "10:45AM".to_string();
        eds.file_info.creation_date = "01-15-2026".to_string();
        eds.device_info.vendor_name = "Acme".to_string();
        eds.device_info.product_name = "Widget".to_string();
        eds.device_info.baud_rates = vec![125, 250, 1000];
        eds.device_info.lss_supported = true;
        eds.comments.push("A test dictionary".to_string());

        eds.set_identity(LssIdentity::new(0x1234, 2, 3, 4)).unwrap();
        eds.set_heartbeat_producer_time(500).unwrap();
        eds.add_heartbeat_consumer(9, 200).unwrap();
        eds.add_entry(
            0x2000,
            ObjectSpec::var_with_value("Velocity", DataType::Integer16, Value::Integer(-77))
                .mappable(),
        )
        .unwrap();
        eds.add_entry(
            0x2001,
            ObjectSpec::var_with_value(
                "Device string",
                DataType::VisibleString,
                Value::VisibleString("Hello".to_string()),
            ),
        )
        .unwrap();
        eds.add_transmit_pdo(&PdoSpec {
            cob_id: 0x181,
            transmission_type: 0xFE,
            inhibit_time: 10,
            event_time: 100,
            sync_start: 0,
            mapped: vec![(0x2000, None)],
        })
        .unwrap();
        eds
    }

    #[test]
    fn test_save_load_round_trip() {
        let eds = populated_eds();
        let text = eds.to_eds_string();
        let loaded = Eds::from_eds_str(&text, None).unwrap();

        let original_indices: Vec<u16> = eds.entries().map(|o| o.index()).collect();
        let loaded_indices: Vec<u16> = loaded.entries().map(|o| o.index()).collect();
        assert_eq!(original_indices, loaded_indices);

        for object in eds.entries() {
            let other = loaded.get_entry(object.index()).unwrap();
            assert_eq!(object.raw(), other.raw(), "0x{:04X}", object.index());
            assert_eq!(object.access_type(), other.access_type());
            assert_eq!(object.data_type(), other.data_type());
            for sub in object.subs() {
                let other_sub = other.sub(sub.sub_index().unwrap()).unwrap();
                assert_eq!(sub.raw(), other_sub.raw(), "{}", sub.id());
            }
        }

        assert_eq!(eds.file_info, loaded.file_info);
        assert_eq!(eds.device_info, loaded.device_info);
        assert_eq!(eds.comments, loaded.comments);
        assert_eq!(eds.transmit_pdos(), loaded.transmit_pdos());
    }

    #[test]
    fn test_save_load_file() {
        let eds = populated_eds();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.eds");
        eds.save(&path).unwrap();
        let loaded = Eds::load(&path).unwrap();
        assert_eq!(loaded.identity(), LssIdentity::new(0x1234, 2, 3, 4));
        assert_eq!(loaded.get_heartbeat_consumer(9), Some(200));
    }

    #[test]
    fn test_node_id_expression() {
        let content = "\
[FileInfo]
FileName=min.eds

[DeviceInfo]
VendorName=Acme

[1200]
ParameterName=SDO server parameter
ObjectType=0x9
SubNumber=3

[1200sub0]
ParameterName=Highest sub-index supported
ObjectType=0x7
DataType=0x0005
AccessType=ro
DefaultValue=2

[1200sub1]
ParameterName=COB-ID client to server
ObjectType=0x7
DataType=0x0007
AccessType=ro
DefaultValue=$NODEID+0x600

[1200sub2]
ParameterName=COB-ID server to client
ObjectType=0x7
DataType=0x0007
AccessType=ro
DefaultValue=$NODEID+0x580
";
        let eds = Eds::from_eds_str(content, Some(0x0A)).unwrap();
        let servers = eds.sdo_server_parameters();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].cob_id_rx, 0x60A);
        assert_eq!(servers[0].cob_id_tx, 0x58A);
    }

    #[test]
    fn test_malformed_file_rejected() {
        // DataType missing on a VAR
        let content = "\
[FileInfo]
FileName=bad.eds

[DeviceInfo]
VendorName=Acme

[2000]
ParameterName=Broken
ObjectType=0x7
AccessType=rw
";
        assert!(Eds::from_eds_str(content, None).is_err());
    }
}
