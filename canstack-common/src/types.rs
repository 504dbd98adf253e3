//! CANopen data and object type enumerations
//!
//! These are shared between the object dictionary, the EDS file format, and
//! the protocol handlers.

use snafu::Snafu;

/// The CANopen scalar and structural data types
///
/// The discriminants are the standard type codes, which are also the object
/// indices of the matching DEFTYPE entries in the dictionary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    Boolean = 0x01,
    Integer8 = 0x02,
    Integer16 = 0x03,
    #[default]
    Integer32 = 0x04,
    Unsigned8 = 0x05,
    Unsigned16 = 0x06,
    Unsigned32 = 0x07,
    Real32 = 0x08,
    VisibleString = 0x09,
    OctetString = 0x0A,
    UnicodeString = 0x0B,
    TimeOfDay = 0x0C,
    TimeDifference = 0x0D,
    Domain = 0x0F,
    Integer24 = 0x10,
    Real64 = 0x11,
    Integer40 = 0x12,
    Integer48 = 0x13,
    Integer56 = 0x14,
    Integer64 = 0x15,
    Unsigned24 = 0x16,
    Unsigned40 = 0x18,
    Unsigned48 = 0x19,
    Unsigned56 = 0x1A,
    Unsigned64 = 0x1B,
    PdoParameter = 0x20,
    PdoMapping = 0x21,
    SdoParameter = 0x22,
    Identity = 0x23,
}

/// An error for [`DataType::try_from`]
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
#[snafu(display("Unknown data type code 0x{code:04X}"))]
pub struct UnknownDataTypeError {
    /// The unrecognized type code
    pub code: u16,
}

impl TryFrom<u16> for DataType {
    type Error = UnknownDataTypeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use DataType::*;
        match value {
            0x01 => Ok(Boolean),
            0x02 => Ok(Integer8),
            0x03 => Ok(Integer16),
            0x04 => Ok(Integer32),
            0x05 => Ok(Unsigned8),
            0x06 => Ok(Unsigned16),
            0x07 => Ok(Unsigned32),
            0x08 => Ok(Real32),
            0x09 => Ok(VisibleString),
            0x0A => Ok(OctetString),
            0x0B => Ok(UnicodeString),
            0x0C => Ok(TimeOfDay),
            0x0D => Ok(TimeDifference),
            0x0F => Ok(Domain),
            0x10 => Ok(Integer24),
            0x11 => Ok(Real64),
            0x12 => Ok(Integer40),
            0x13 => Ok(Integer48),
            0x14 => Ok(Integer56),
            0x15 => Ok(Integer64),
            0x16 => Ok(Unsigned24),
            0x18 => Ok(Unsigned40),
            0x19 => Ok(Unsigned48),
            0x1A => Ok(Unsigned56),
            0x1B => Ok(Unsigned64),
            0x20 => Ok(PdoParameter),
            0x21 => Ok(PdoMapping),
            0x22 => Ok(SdoParameter),
            0x23 => Ok(Identity),
            code => Err(UnknownDataTypeError { code }),
        }
    }
}

impl DataType {
    /// All known data types, in type-code order
    pub const ALL: [DataType; 29] = [
        DataType::Boolean,
        DataType::Integer8,
        DataType::Integer16,
        DataType::Integer32,
        DataType::Unsigned8,
        DataType::Unsigned16,
        DataType::Unsigned32,
        DataType::Real32,
        DataType::VisibleString,
        DataType::OctetString,
        DataType::UnicodeString,
        DataType::TimeOfDay,
        DataType::TimeDifference,
        DataType::Domain,
        DataType::Integer24,
        DataType::Real64,
        DataType::Integer40,
        DataType::Integer48,
        DataType::Integer56,
        DataType::Integer64,
        DataType::Unsigned24,
        DataType::Unsigned40,
        DataType::Unsigned48,
        DataType::Unsigned56,
        DataType::Unsigned64,
        DataType::PdoParameter,
        DataType::PdoMapping,
        DataType::SdoParameter,
        DataType::Identity,
    ];

    /// The fixed byte width of the type, or None for variable-width types
    pub fn fixed_size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Integer8 | Unsigned8 => Some(1),
            Integer16 | Unsigned16 => Some(2),
            Integer24 | Unsigned24 => Some(3),
            Integer32 | Unsigned32 | Real32 => Some(4),
            Integer40 | Unsigned40 => Some(5),
            Integer48 | Unsigned48 | TimeOfDay | TimeDifference => Some(6),
            Integer56 | Unsigned56 => Some(7),
            Integer64 | Unsigned64 | Real64 => Some(8),
            VisibleString | OctetString | UnicodeString | Domain => None,
            PdoParameter | PdoMapping | SdoParameter | Identity => None,
        }
    }

    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }

    /// Returns true for the signed integer types
    pub fn is_signed(&self) -> bool {
        use DataType::*;
        matches!(
            self,
            Integer8 | Integer16 | Integer24 | Integer32 | Integer40 | Integer48 | Integer56
                | Integer64
        )
    }

    /// Returns true for the unsigned integer types (including Boolean)
    pub fn is_unsigned(&self) -> bool {
        use DataType::*;
        matches!(
            self,
            Boolean
                | Unsigned8
                | Unsigned16
                | Unsigned24
                | Unsigned32
                | Unsigned40
                | Unsigned48
                | Unsigned56
                | Unsigned64
        )
    }

    /// Returns true for REAL32 and REAL64
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Real32 | Self::Real64)
    }

    /// Standard parameter name used for the DEFTYPE dictionary entry of this type
    pub fn deftype_name(&self) -> &'static str {
        use DataType::*;
        match self {
            Boolean => "BOOLEAN",
            Integer8 => "INTEGER8",
            Integer16 => "INTEGER16",
            Integer32 => "INTEGER32",
            Unsigned8 => "UNSIGNED8",
            Unsigned16 => "UNSIGNED16",
            Unsigned32 => "UNSIGNED32",
            Real32 => "REAL32",
            VisibleString => "VISIBLE_STRING",
            OctetString => "OCTET_STRING",
            UnicodeString => "UNICODE_STRING",
            TimeOfDay => "TIME_OF_DAY",
            TimeDifference => "TIME_DIFFERENCE",
            Domain => "DOMAIN",
            Integer24 => "INTEGER24",
            Real64 => "REAL64",
            Integer40 => "INTEGER40",
            Integer48 => "INTEGER48",
            Integer56 => "INTEGER56",
            Integer64 => "INTEGER64",
            Unsigned24 => "UNSIGNED24",
            Unsigned40 => "UNSIGNED40",
            Unsigned48 => "UNSIGNED48",
            Unsigned56 => "UNSIGNED56",
            Unsigned64 => "UNSIGNED64",
            PdoParameter => "PDO_PARAMETER",
            PdoMapping => "PDO_MAPPING",
            SdoParameter => "SDO_PARAMETER",
            Identity => "IDENTITY",
        }
    }
}

/// The CANopen object codes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    Null = 0,
    Domain = 2,
    DefType = 5,
    DefStruct = 6,
    #[default]
    Var = 7,
    Array = 8,
    Record = 9,
}

impl ObjectCode {
    /// Returns true for the object codes which carry sub-objects
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Array | Self::Record | Self::DefStruct)
    }
}

/// An error for [`ObjectCode::try_from`]
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
#[snafu(display("Unknown object code {code}"))]
pub struct UnknownObjectCodeError {
    /// The unrecognized object code
    pub code: u8,
}

impl TryFrom<u8> for ObjectCode {
    type Error = UnknownObjectCodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            code => Err(UnknownObjectCodeError { code }),
        }
    }
}

/// Access permissions of a dictionary sub-object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and also will never be changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if the object may be read over the network
    pub fn is_readable(&self) -> bool {
        !matches!(self, Self::Wo)
    }

    /// Returns true if the object may be written over the network
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Rw | Self::Wo)
    }

    /// The keyword used in EDS files for this access type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ro => "ro",
            Self::Wo => "wo",
            Self::Rw => "rw",
            Self::Const => "const",
        }
    }
}

/// An error for [`AccessType::from_str`]
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(display("Invalid access type: '{value}'"))]
pub struct InvalidAccessTypeError {
    /// The unrecognized keyword
    pub value: String,
}

impl core::str::FromStr for AccessType {
    type Err = InvalidAccessTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Ok(Self::Ro),
            "wo" => Ok(Self::Wo),
            "rw" => Ok(Self::Rw),
            // rwr/rww grant full read-write plus PDO mapping direction hints,
            // which the dictionary tracks separately
            "rwr" | "rww" => Ok(Self::Rw),
            "const" => Ok(Self::Const),
            _ => Err(InvalidAccessTypeError {
                value: s.to_string(),
            }),
        }
    }
}

/// Milliseconds between the Unix epoch and the CANopen epoch (1984-01-01)
pub const CANOPEN_EPOCH_OFFSET_MS: u64 = 441_763_200_000;

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// The 48-bit timestamp carried by TIME_OF_DAY and TIME_DIFFERENCE values
///
/// Wire layout is 6 bytes: a 4-byte little-endian count of milliseconds since
/// midnight (only the low 28 bits are significant) followed by a 2-byte
/// little-endian count of days since 1984-01-01.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeStamp {
    /// Days since the CANopen epoch
    pub days: u16,
    /// Milliseconds since midnight
    pub millis: u32,
}

impl TimeStamp {
    /// Serialize to the 6-byte wire layout
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        bytes[0..4].copy_from_slice(&(self.millis & 0x0FFF_FFFF).to_le_bytes());
        bytes[4..6].copy_from_slice(&self.days.to_le_bytes());
        bytes
    }

    /// Parse from the 6-byte wire layout
    ///
    /// Returns None if fewer than 6 bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let millis = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) & 0x0FFF_FFFF;
        let days = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        Some(Self { days, millis })
    }

    /// Create a timestamp from a count of milliseconds since the Unix epoch
    ///
    /// Returns None for instants before the CANopen epoch.
    pub fn from_unix_millis(unix_ms: u64) -> Option<Self> {
        let since_epoch = unix_ms.checked_sub(CANOPEN_EPOCH_OFFSET_MS)?;
        Some(Self {
            days: (since_epoch / MS_PER_DAY) as u16,
            millis: (since_epoch % MS_PER_DAY) as u32,
        })
    }

    /// Convert to a count of milliseconds since the Unix epoch
    pub fn to_unix_millis(&self) -> u64 {
        CANOPEN_EPOCH_OFFSET_MS + self.days as u64 * MS_PER_DAY + self.millis as u64
    }

    /// Create a timestamp holding the current wall-clock time
    pub fn now() -> Self {
        let unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::from_unix_millis(unix_ms).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_codes_round_trip() {
        for dt in DataType::ALL {
            assert_eq!(DataType::try_from(dt as u16), Ok(dt));
        }
        assert!(DataType::try_from(0x17).is_err());
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(DataType::Boolean.fixed_size(), Some(1));
        assert_eq!(DataType::Integer24.fixed_size(), Some(3));
        assert_eq!(DataType::Unsigned56.fixed_size(), Some(7));
        assert_eq!(DataType::TimeOfDay.fixed_size(), Some(6));
        assert_eq!(DataType::VisibleString.fixed_size(), None);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = TimeStamp {
            days: 15000,
            millis: 12_345_678,
        };
        assert_eq!(TimeStamp::from_bytes(&ts.to_bytes()), Some(ts));
    }

    #[test]
    fn test_timestamp_epoch() {
        // 1984-01-01T00:00:00Z itself
        let ts = TimeStamp::from_unix_millis(CANOPEN_EPOCH_OFFSET_MS).unwrap();
        assert_eq!(ts, TimeStamp { days: 0, millis: 0 });
        assert_eq!(ts.to_unix_millis(), CANOPEN_EPOCH_OFFSET_MS);

        // Instants before the epoch are unrepresentable
        assert!(TimeStamp::from_unix_millis(CANOPEN_EPOCH_OFFSET_MS - 1).is_none());
    }
}
