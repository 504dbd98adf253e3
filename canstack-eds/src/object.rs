//! Dictionary object model

use std::collections::BTreeMap;

use canstack_common::types::{AccessType, DataType, ObjectCode};

use crate::error::EdsError;
use crate::value::{Value, ValueError};

/// Identifies an object or sub-object in the dictionary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId {
    /// The 16-bit object index
    pub index: u16,
    /// The sub-index, absent for scalar objects
    pub sub: Option<u8>,
}

impl ObjectId {
    /// Identify a scalar object
    pub fn index(index: u16) -> Self {
        Self { index, sub: None }
    }

    /// Identify a sub-object
    pub fn sub(index: u16, sub: u8) -> Self {
        Self {
            index,
            sub: Some(sub),
        }
    }
}

impl core::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.sub {
            Some(sub) => write!(f, "0x{:04X}sub{}", self.index, sub),
            None => write!(f, "0x{:04X}", self.index),
        }
    }
}

/// Specification of an object to be added to the dictionary
///
/// This mirrors the per-object key set of an EDS file section.
#[derive(Clone, Debug)]
pub struct ObjectSpec {
    /// Human-readable object name
    pub parameter_name: String,
    /// The object code
    pub object_type: ObjectCode,
    /// The data type; required for VAR/DEFTYPE, forbidden on aggregates
    /// unless `compact_sub_obj` is nonzero
    pub data_type: Option<DataType>,
    /// Access permissions
    pub access_type: AccessType,
    /// Initial value; the raw buffer is seeded from this
    pub default_value: Option<Value>,
    /// Lowest permitted downloaded value
    pub low_limit: Option<Value>,
    /// Highest permitted downloaded value
    pub high_limit: Option<Value>,
    /// True if this object may be mapped into a PDO
    pub pdo_mapping: bool,
    /// When nonzero on an ARRAY, the object describes `compact_sub_obj`
    /// identical sub-objects instead of carrying explicit sub sections
    pub compact_sub_obj: u8,
    /// Raw EDS ObjFlags word, carried through save
    pub obj_flags: u32,
    /// Multiplier applied when cooking the raw value
    pub scale_factor: f64,
}

impl Default for ObjectSpec {
    fn default() -> Self {
        Self {
            parameter_name: String::new(),
            object_type: ObjectCode::Var,
            data_type: None,
            access_type: AccessType::default(),
            default_value: None,
            low_limit: None,
            high_limit: None,
            pdo_mapping: false,
            compact_sub_obj: 0,
            obj_flags: 0,
            scale_factor: 1.0,
        }
    }
}

impl ObjectSpec {
    /// Shorthand for a read-write VAR of the given type
    pub fn var(name: &str, data_type: DataType) -> Self {
        Self {
            parameter_name: name.to_string(),
            object_type: ObjectCode::Var,
            data_type: Some(data_type),
            access_type: AccessType::Rw,
            ..Default::default()
        }
    }

    /// Shorthand for a VAR with an initial value
    pub fn var_with_value(name: &str, data_type: DataType, value: Value) -> Self {
        Self {
            default_value: Some(value),
            ..Self::var(name, data_type)
        }
    }

    /// Shorthand for an aggregate object with no leaf fields
    pub fn aggregate(name: &str, object_type: ObjectCode) -> Self {
        Self {
            parameter_name: name.to_string(),
            object_type,
            ..Default::default()
        }
    }

    /// Set the access type
    pub fn access(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }

    /// Set the value limits
    pub fn limits(mut self, low: Option<Value>, high: Option<Value>) -> Self {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    /// Mark the object PDO-mappable
    pub fn mappable(mut self) -> Self {
        self.pdo_mapping = true;
        self
    }
}

/// Result of comparing a candidate raw value against an object's limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitViolation {
    /// The candidate exceeds the high limit
    High,
    /// The candidate is below the low limit
    Low,
}

/// A single dictionary object or sub-object
///
/// Leaf objects (VAR, DEFTYPE, DOMAIN) carry a raw byte buffer; aggregate
/// objects (ARRAY, RECORD, DEFSTRUCT) carry an ordered map of sub-objects
/// and no buffer of their own. Sub-object 0 of an aggregate is always
/// UNSIGNED8 and holds the highest populated sub-index.
#[derive(Clone, Debug, PartialEq)]
pub struct DataObject {
    index: u16,
    sub_index: Option<u8>,
    parameter_name: String,
    object_type: ObjectCode,
    data_type: Option<DataType>,
    access_type: AccessType,
    pdo_mapping: bool,
    compact_sub_obj: u8,
    obj_flags: u32,
    low_limit: Option<Value>,
    high_limit: Option<Value>,
    default_value: Option<Value>,
    scale_factor: f64,
    raw: Vec<u8>,
    subs: BTreeMap<u8, DataObject>,
}

impl DataObject {
    /// Build an object from a spec, validating the type-specific schema rules
    pub(crate) fn from_spec(
        index: u16,
        sub_index: Option<u8>,
        spec: ObjectSpec,
    ) -> Result<Self, EdsError> {
        let bad_spec = |reason: String| EdsError::BadSpec { index, reason };

        if spec.parameter_name.is_empty() {
            return Err(bad_spec("ParameterName is required".to_string()));
        }
        if let (Some(low), Some(high)) = (&spec.low_limit, &spec.high_limit) {
            if let (Some(low), Some(high)) = (low.as_float(), high.as_float()) {
                if low > high {
                    return Err(bad_spec(format!("LowLimit {low} exceeds HighLimit {high}")));
                }
            }
        }

        let is_aggregate = spec.object_type.is_aggregate() && sub_index.is_none();
        if is_aggregate && spec.compact_sub_obj == 0 {
            if spec.data_type.is_some()
                || spec.default_value.is_some()
                || spec.low_limit.is_some()
                || spec.high_limit.is_some()
            {
                return Err(bad_spec(format!(
                    "{:?} objects carry their data on sub-objects",
                    spec.object_type
                )));
            }
        }

        let data_type = match spec.object_type {
            ObjectCode::Var | ObjectCode::DefType => {
                if spec.data_type.is_none() && sub_index != Some(0) {
                    return Err(bad_spec(format!(
                        "{:?} objects require a DataType",
                        spec.object_type
                    )));
                }
                spec.data_type
            }
            ObjectCode::Domain => Some(spec.data_type.unwrap_or(DataType::Domain)),
            _ if is_aggregate => spec.data_type,
            _ => spec.data_type,
        };

        // Seed the raw buffer from the default value, or zeros of the fixed
        // width of the type
        let raw = if is_aggregate {
            Vec::new()
        } else {
            let data_type = data_type.unwrap_or_default();
            match &spec.default_value {
                Some(value) => value
                    .to_raw(data_type, spec.scale_factor)
                    .map_err(|source| EdsError::BadValue { index, source })?,
                None => vec![0; data_type.fixed_size().unwrap_or(0)],
            }
        };

        Ok(Self {
            index,
            sub_index,
            parameter_name: spec.parameter_name,
            object_type: spec.object_type,
            data_type,
            access_type: spec.access_type,
            pdo_mapping: spec.pdo_mapping,
            compact_sub_obj: spec.compact_sub_obj,
            obj_flags: spec.obj_flags,
            low_limit: spec.low_limit,
            high_limit: spec.high_limit,
            default_value: spec.default_value,
            scale_factor: spec.scale_factor,
            raw,
            subs: BTreeMap::new(),
        })
    }

    /// The object index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// The sub-index, when this is a sub-object
    pub fn sub_index(&self) -> Option<u8> {
        self.sub_index
    }

    /// The identifier of this object
    pub fn id(&self) -> ObjectId {
        ObjectId {
            index: self.index,
            sub: self.sub_index,
        }
    }

    /// The human-readable object name
    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    /// The object code
    pub fn object_type(&self) -> ObjectCode {
        self.object_type
    }

    /// The data type of a leaf object
    pub fn data_type(&self) -> Option<DataType> {
        self.data_type
    }

    /// Access permissions
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// True if this object may be mapped into a PDO
    pub fn pdo_mapping(&self) -> bool {
        self.pdo_mapping
    }

    /// The CompactSubObj count, 0 when not compact
    pub fn compact_sub_obj(&self) -> u8 {
        self.compact_sub_obj
    }

    /// The raw EDS ObjFlags word
    pub fn obj_flags(&self) -> u32 {
        self.obj_flags
    }

    /// The configured low limit
    pub fn low_limit(&self) -> Option<&Value> {
        self.low_limit.as_ref()
    }

    /// The configured high limit
    pub fn high_limit(&self) -> Option<&Value> {
        self.high_limit.as_ref()
    }

    /// The configured default value
    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// The scale factor applied when cooking values
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// True when this object carries sub-objects rather than a raw buffer
    pub fn is_aggregate(&self) -> bool {
        self.object_type.is_aggregate() && self.sub_index.is_none()
    }

    /// The raw little-endian storage of a leaf object
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The current size of the raw storage in bytes
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// The cooked value: `raw` decoded by the data type, multiplied by the
    /// scale factor
    pub fn value(&self) -> Result<Value, ValueError> {
        let data_type = self.data_type.unwrap_or_default();
        Value::from_raw(&self.raw, data_type, self.scale_factor)
    }

    /// Get a sub-object
    pub fn sub(&self, sub: u8) -> Option<&DataObject> {
        self.subs.get(&sub)
    }

    /// Iterate the populated sub-objects in sub-index order
    pub fn subs(&self) -> impl Iterator<Item = &DataObject> {
        self.subs.values()
    }

    /// The number of populated sub-objects, including sub 0
    pub fn sub_number(&self) -> u8 {
        self.subs.len() as u8
    }

    /// The highest populated sub-index
    pub fn max_sub_index(&self) -> u8 {
        self.subs.keys().next_back().copied().unwrap_or(0)
    }

    /// Compare a candidate raw value against the configured limits
    ///
    /// Only numeric leaf objects have limits; everything else always passes.
    pub fn check_limits(&self, raw: &[u8]) -> Option<LimitViolation> {
        let data_type = self.data_type?;
        let candidate = Value::from_raw(raw, data_type, 1.0).ok()?.as_float()?;
        if let Some(high) = self.high_limit.as_ref().and_then(Value::as_float) {
            if candidate > high {
                return Some(LimitViolation::High);
            }
        }
        if let Some(low) = self.low_limit.as_ref().and_then(Value::as_float) {
            if candidate < low {
                return Some(LimitViolation::Low);
            }
        }
        None
    }

    pub(crate) fn set_raw_direct(&mut self, raw: Vec<u8>) {
        self.raw = raw;
    }

    pub(crate) fn sub_mut(&mut self, sub: u8) -> Option<&mut DataObject> {
        self.subs.get_mut(&sub)
    }

    pub(crate) fn insert_sub(&mut self, sub: u8, object: DataObject) {
        self.subs.insert(sub, object);
    }

    pub(crate) fn remove_sub(&mut self, sub: u8) -> Option<DataObject> {
        self.subs.remove(&sub)
    }

    /// Rewrite sub-object 0 to hold the highest populated sub-index
    pub(crate) fn refresh_max_sub_index(&mut self) {
        let max = self.max_sub_index();
        if let Some(sub0) = self.subs.get_mut(&0) {
            sub0.raw = vec![max];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_requires_data_type() {
        let spec = ObjectSpec {
            parameter_name: "Broken".to_string(),
            object_type: ObjectCode::Var,
            ..Default::default()
        };
        assert!(matches!(
            DataObject::from_spec(0x2000, None, spec),
            Err(EdsError::BadSpec { .. })
        ));
    }

    #[test]
    fn test_aggregate_rejects_leaf_fields() {
        let spec = ObjectSpec {
            parameter_name: "Broken".to_string(),
            object_type: ObjectCode::Record,
            data_type: Some(DataType::Unsigned8),
            ..Default::default()
        };
        assert!(matches!(
            DataObject::from_spec(0x2000, None, spec),
            Err(EdsError::BadSpec { .. })
        ));
    }

    #[test]
    fn test_inverted_limits_rejected() {
        let spec = ObjectSpec::var("Limited", DataType::Unsigned8)
            .limits(Some(Value::Unsigned(10)), Some(Value::Unsigned(5)));
        assert!(matches!(
            DataObject::from_spec(0x2000, None, spec),
            Err(EdsError::BadSpec { .. })
        ));
    }

    #[test]
    fn test_raw_seeded_from_default() {
        let spec = ObjectSpec::var_with_value("Seeded", DataType::Unsigned32, Value::Unsigned(7));
        let obj = DataObject::from_spec(0x2000, None, spec).unwrap();
        assert_eq!(obj.raw(), &[7, 0, 0, 0]);
        assert_eq!(obj.value().unwrap(), Value::Unsigned(7));
    }

    #[test]
    fn test_limit_check() {
        let spec = ObjectSpec::var("Limited", DataType::Unsigned8)
            .limits(Some(Value::Unsigned(5)), Some(Value::Unsigned(10)));
        let obj = DataObject::from_spec(0x2000, None, spec).unwrap();
        assert_eq!(obj.check_limits(&[7]), None);
        assert_eq!(obj.check_limits(&[11]), Some(LimitViolation::High));
        assert_eq!(obj.check_limits(&[4]), Some(LimitViolation::Low));
    }
}
