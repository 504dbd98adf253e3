//! Typed value codecs
//!
//! Conversion between little-endian raw byte buffers and typed values for
//! every CANopen data type, including optional numeric scaling.

use canstack_common::types::{DataType, TimeStamp};
use snafu::Snafu;

/// Error returned by value encode/decode operations
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ValueError {
    /// The raw buffer does not have the width required by the data type
    #[snafu(display("Raw buffer has {actual} bytes, expected {expected} for {data_type:?}"))]
    WrongSize {
        /// The data type being decoded
        data_type: DataType,
        /// The width the type requires
        expected: usize,
        /// The width that was supplied
        actual: usize,
    },
    /// The value kind does not match the requested data type
    #[snafu(display("Value kind does not match data type {data_type:?}"))]
    KindMismatch {
        /// The requested data type
        data_type: DataType,
    },
    /// A textual value could not be parsed for the data type
    #[snafu(display("Cannot parse '{text}' as {data_type:?}"))]
    Unparseable {
        /// The rejected text
        text: String,
        /// The requested data type
        data_type: DataType,
    },
    /// The value does not fit the numeric range of the data type
    #[snafu(display("{value} does not fit in {data_type:?}"))]
    OutOfRange {
        /// The rejected value
        value: i128,
        /// The requested data type
        data_type: DataType,
    },
    /// The data type is structural and has no scalar codec
    #[snafu(display("No scalar codec for structural type {data_type:?}"))]
    NotScalar {
        /// The requested data type
        data_type: DataType,
    },
}

/// A cooked dictionary value
///
/// Scaled integers decode to `Float`, because a scale factor generally
/// produces a non-integral result.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    VisibleString(String),
    OctetString(Vec<u8>),
    UnicodeString(String),
    TimeOfDay(TimeStamp),
    TimeDifference(TimeStamp),
    Domain(Vec<u8>),
}

fn sign_extend(raw: &[u8]) -> i64 {
    let mut buf = if raw.last().is_some_and(|b| b & 0x80 != 0) {
        [0xFF; 8]
    } else {
        [0; 8]
    };
    buf[0..raw.len()].copy_from_slice(raw);
    i64::from_le_bytes(buf)
}

fn zero_extend(raw: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf[0..raw.len()].copy_from_slice(raw);
    u64::from_le_bytes(buf)
}

fn signed_range(width: usize) -> (i128, i128) {
    let bits = width as u32 * 8;
    (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
}

fn unsigned_max(width: usize) -> i128 {
    (1i128 << (width as u32 * 8)) - 1
}

/// Trim a byte buffer at the first NUL byte
fn trim_nul(raw: &[u8]) -> &[u8] {
    match raw.iter().position(|b| *b == 0) {
        Some(pos) => &raw[0..pos],
        None => raw,
    }
}

fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

impl Value {
    /// Decode a raw little-endian buffer into a typed value
    ///
    /// Numeric scaling multiplies on decode; a scale factor other than 1
    /// turns integer types into `Float`. Strings are trimmed at the first
    /// NUL.
    pub fn from_raw(raw: &[u8], data_type: DataType, scale: f64) -> Result<Value, ValueError> {
        if let Some(expected) = data_type.fixed_size() {
            if raw.len() != expected {
                return Err(ValueError::WrongSize {
                    data_type,
                    expected,
                    actual: raw.len(),
                });
            }
        }

        use DataType::*;
        let value = match data_type {
            Boolean => Value::Boolean(raw[0] != 0),
            Integer8 | Integer16 | Integer24 | Integer32 | Integer40 | Integer48 | Integer56
            | Integer64 => {
                let v = sign_extend(raw);
                if scale != 1.0 {
                    // 64-bit values exceed f64 integer precision; go through
                    // i128 before the final float conversion
                    Value::Float((v as i128) as f64 * scale)
                } else {
                    Value::Integer(v)
                }
            }
            Unsigned8 | Unsigned16 | Unsigned24 | Unsigned32 | Unsigned40 | Unsigned48
            | Unsigned56 | Unsigned64 => {
                let v = zero_extend(raw);
                if scale != 1.0 {
                    Value::Float((v as u128) as f64 * scale)
                } else {
                    Value::Unsigned(v)
                }
            }
            Real32 => {
                let v = f32::from_le_bytes(raw.try_into().unwrap()) as f64;
                Value::Float(v * scale)
            }
            Real64 => {
                let v = f64::from_le_bytes(raw.try_into().unwrap());
                Value::Float(v * scale)
            }
            VisibleString => {
                Value::VisibleString(String::from_utf8_lossy(trim_nul(raw)).into_owned())
            }
            OctetString => Value::OctetString(raw.to_vec()),
            UnicodeString => Value::UnicodeString(decode_utf16le(raw)),
            TimeOfDay => Value::TimeOfDay(TimeStamp::from_bytes(raw).unwrap()),
            TimeDifference => Value::TimeDifference(TimeStamp::from_bytes(raw).unwrap()),
            Domain => Value::Domain(raw.to_vec()),
            PdoParameter | PdoMapping | SdoParameter | Identity => {
                return Err(ValueError::NotScalar { data_type })
            }
        };
        Ok(value)
    }

    /// Encode a typed value into its raw little-endian representation
    ///
    /// Numeric scaling divides on encode. VISIBLE_STRING content is trimmed
    /// at the first NUL.
    pub fn to_raw(&self, data_type: DataType, scale: f64) -> Result<Vec<u8>, ValueError> {
        use DataType::*;

        // Integer encode path shared by all widths; applies inverse scaling
        // through i128 so scaled 64-bit values stay exact where possible
        let as_scaled_int = |value: &Value| -> Result<i128, ValueError> {
            let v = match value {
                Value::Boolean(b) => *b as i128,
                Value::Integer(v) => {
                    if scale != 1.0 {
                        ((*v as f64) / scale).round() as i128
                    } else {
                        *v as i128
                    }
                }
                Value::Unsigned(v) => {
                    if scale != 1.0 {
                        ((*v as f64) / scale).round() as i128
                    } else {
                        *v as i128
                    }
                }
                Value::Float(v) => (v / scale).round() as i128,
                _ => return Err(ValueError::KindMismatch { data_type }),
            };
            Ok(v)
        };

        let encode_int = |width: usize, signed: bool| -> Result<Vec<u8>, ValueError> {
            let v = as_scaled_int(self)?;
            let (min, max) = if signed {
                signed_range(width)
            } else {
                (0, unsigned_max(width))
            };
            if v < min || v > max {
                return Err(ValueError::OutOfRange {
                    value: v,
                    data_type,
                });
            }
            Ok((v as i64).to_le_bytes()[0..width].to_vec())
        };

        match data_type {
            Boolean => match self {
                Value::Boolean(b) => Ok(vec![*b as u8]),
                _ => encode_int(1, false),
            },
            Integer8 => encode_int(1, true),
            Integer16 => encode_int(2, true),
            Integer24 => encode_int(3, true),
            Integer32 => encode_int(4, true),
            Integer40 => encode_int(5, true),
            Integer48 => encode_int(6, true),
            Integer56 => encode_int(7, true),
            Integer64 => encode_int(8, true),
            Unsigned8 => encode_int(1, false),
            Unsigned16 => encode_int(2, false),
            Unsigned24 => encode_int(3, false),
            Unsigned32 => encode_int(4, false),
            Unsigned40 => encode_int(5, false),
            Unsigned48 => encode_int(6, false),
            Unsigned56 => encode_int(7, false),
            Unsigned64 => {
                // u64 values above i64::MAX are still valid here
                match self {
                    Value::Unsigned(v) if scale == 1.0 => Ok(v.to_le_bytes().to_vec()),
                    _ => encode_int(8, false),
                }
            }
            Real32 => {
                let v = self.as_float().ok_or(ValueError::KindMismatch { data_type })?;
                Ok(((v / scale) as f32).to_le_bytes().to_vec())
            }
            Real64 => {
                let v = self.as_float().ok_or(ValueError::KindMismatch { data_type })?;
                Ok((v / scale).to_le_bytes().to_vec())
            }
            VisibleString => match self {
                Value::VisibleString(s) => Ok(trim_nul(s.as_bytes()).to_vec()),
                _ => Err(ValueError::KindMismatch { data_type }),
            },
            OctetString => match self {
                Value::OctetString(bytes) => Ok(bytes.clone()),
                _ => Err(ValueError::KindMismatch { data_type }),
            },
            UnicodeString => match self {
                Value::UnicodeString(s) => Ok(encode_utf16le(s)),
                _ => Err(ValueError::KindMismatch { data_type }),
            },
            TimeOfDay => match self {
                Value::TimeOfDay(ts) => Ok(ts.to_bytes().to_vec()),
                _ => Err(ValueError::KindMismatch { data_type }),
            },
            TimeDifference => match self {
                Value::TimeDifference(ts) => Ok(ts.to_bytes().to_vec()),
                _ => Err(ValueError::KindMismatch { data_type }),
            },
            Domain => match self {
                Value::Domain(bytes) | Value::OctetString(bytes) => Ok(bytes.clone()),
                _ => Err(ValueError::KindMismatch { data_type }),
            },
            PdoParameter | PdoMapping | SdoParameter | Identity => {
                Err(ValueError::NotScalar { data_type })
            }
        }
    }

    /// Parse a value from its EDS textual form
    ///
    /// Numeric values may be decimal or `0x`-prefixed hex; octet strings and
    /// domains are hex strings.
    pub fn parse(text: &str, data_type: DataType) -> Result<Value, ValueError> {
        use DataType::*;

        let text = text.trim();
        let unparseable = || ValueError::Unparseable {
            text: text.to_string(),
            data_type,
        };

        let parse_u64 = |s: &str| -> Result<u64, ValueError> {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).map_err(|_| unparseable())
            } else {
                s.parse().map_err(|_| unparseable())
            }
        };
        let parse_i64 = |s: &str| -> Result<i64, ValueError> {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).map(|v| v as i64).map_err(|_| unparseable())
            } else if let Some(hex) = s.strip_prefix("-0x").or_else(|| s.strip_prefix("-0X")) {
                i64::from_str_radix(hex, 16).map(|v| -v).map_err(|_| unparseable())
            } else {
                s.parse().map_err(|_| unparseable())
            }
        };

        match data_type {
            Boolean => Ok(Value::Boolean(parse_u64(text)? != 0)),
            Integer8 | Integer16 | Integer24 | Integer32 | Integer40 | Integer48 | Integer56
            | Integer64 => Ok(Value::Integer(parse_i64(text)?)),
            Unsigned8 | Unsigned16 | Unsigned24 | Unsigned32 | Unsigned40 | Unsigned48
            | Unsigned56 | Unsigned64 => Ok(Value::Unsigned(parse_u64(text)?)),
            Real32 | Real64 => Ok(Value::Float(text.parse().map_err(|_| unparseable())?)),
            VisibleString => Ok(Value::VisibleString(text.to_string())),
            UnicodeString => Ok(Value::UnicodeString(text.to_string())),
            OctetString => Ok(Value::OctetString(parse_hex_bytes(text).ok_or_else(unparseable)?)),
            Domain => Ok(Value::Domain(parse_hex_bytes(text).ok_or_else(unparseable)?)),
            TimeOfDay => Ok(Value::TimeOfDay(timestamp_from_u64(parse_u64(text)?))),
            TimeDifference => Ok(Value::TimeDifference(timestamp_from_u64(parse_u64(text)?))),
            PdoParameter | PdoMapping | SdoParameter | Identity => {
                Err(ValueError::NotScalar { data_type })
            }
        }
    }

    /// Format a value into its EDS textual form
    pub fn to_eds_string(&self) -> String {
        match self {
            Value::Boolean(b) => format!("{}", *b as u8),
            Value::Integer(v) => format!("{v}"),
            Value::Unsigned(v) => format!("0x{v:X}"),
            Value::Float(v) => format!("{v}"),
            Value::VisibleString(s) | Value::UnicodeString(s) => s.clone(),
            Value::OctetString(bytes) | Value::Domain(bytes) => {
                let mut s = String::from("0x");
                for b in bytes {
                    s.push_str(&format!("{b:02X}"));
                }
                s
            }
            Value::TimeOfDay(ts) | Value::TimeDifference(ts) => {
                format!("0x{:012X}", timestamp_to_u64(ts))
            }
        }
    }

    /// Get the value as an unsigned integer, when it holds one
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Value::Boolean(b) => Some(*b as u64),
            Value::Unsigned(v) => Some(*v),
            Value::Integer(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Get the value as a signed integer, when it holds one
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Boolean(b) => Some(*b as i64),
            Value::Integer(v) => Some(*v),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get the value as a float, when it holds a numeric kind
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Boolean(b) => Some(*b as u8 as f64),
            Value::Integer(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as a string slice, when it holds a string kind
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::VisibleString(s) | Value::UnicodeString(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as raw bytes, when it holds a byte-buffer kind
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::OctetString(bytes) | Value::Domain(bytes) => Some(bytes),
            _ => None,
        }
    }
}

fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if hex.is_empty() {
        return Some(Vec::new());
    }
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn timestamp_from_u64(v: u64) -> TimeStamp {
    TimeStamp::from_bytes(&v.to_le_bytes()[0..6]).unwrap()
}

fn timestamp_to_u64(ts: &TimeStamp) -> u64 {
    let mut buf = [0u8; 8];
    buf[0..6].copy_from_slice(&ts.to_bytes());
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_integers() {
        let cases: &[(DataType, Value)] = &[
            (DataType::Boolean, Value::Boolean(true)),
            (DataType::Integer8, Value::Integer(-100)),
            (DataType::Integer16, Value::Integer(-30000)),
            (DataType::Integer24, Value::Integer(-(1 << 23))),
            (DataType::Integer32, Value::Integer(-2_000_000_000)),
            (DataType::Integer40, Value::Integer(-(1 << 39))),
            (DataType::Integer48, Value::Integer((1 << 47) - 1)),
            (DataType::Integer56, Value::Integer(-(1 << 55))),
            (DataType::Integer64, Value::Integer(i64::MIN)),
            (DataType::Unsigned8, Value::Unsigned(0xFF)),
            (DataType::Unsigned16, Value::Unsigned(0xFFFF)),
            (DataType::Unsigned24, Value::Unsigned(0xFF_FFFF)),
            (DataType::Unsigned32, Value::Unsigned(0xDEAD_BEEF)),
            (DataType::Unsigned40, Value::Unsigned(0xFF_FFFF_FFFF)),
            (DataType::Unsigned48, Value::Unsigned(0xFFFF_FFFF_FFFF)),
            (DataType::Unsigned56, Value::Unsigned(0xFF_FFFF_FFFF_FFFF)),
            (DataType::Unsigned64, Value::Unsigned(u64::MAX)),
        ];
        for (dt, value) in cases {
            let raw = value.to_raw(*dt, 1.0).unwrap();
            assert_eq!(raw.len(), dt.fixed_size().unwrap());
            assert_eq!(&Value::from_raw(&raw, *dt, 1.0).unwrap(), value, "{dt:?}");
        }
    }

    #[test]
    fn test_round_trip_floats() {
        let raw = Value::Float(1.5).to_raw(DataType::Real32, 1.0).unwrap();
        assert_eq!(Value::from_raw(&raw, DataType::Real32, 1.0).unwrap(), Value::Float(1.5));

        let raw = Value::Float(core::f64::consts::PI).to_raw(DataType::Real64, 1.0).unwrap();
        assert_eq!(
            Value::from_raw(&raw, DataType::Real64, 1.0).unwrap(),
            Value::Float(core::f64::consts::PI)
        );
    }

    #[test]
    fn test_strings_trim_at_nul() {
        let raw = b"Hello\0world";
        assert_eq!(
            Value::from_raw(raw, DataType::VisibleString, 1.0).unwrap(),
            Value::VisibleString("Hello".to_string())
        );

        let encoded = Value::VisibleString("Hi\0dden".to_string())
            .to_raw(DataType::VisibleString, 1.0)
            .unwrap();
        assert_eq!(encoded, b"Hi");
    }

    #[test]
    fn test_unicode_string() {
        let value = Value::UnicodeString("héllo".to_string());
        let raw = value.to_raw(DataType::UnicodeString, 1.0).unwrap();
        assert_eq!(raw.len(), 10);
        assert_eq!(Value::from_raw(&raw, DataType::UnicodeString, 1.0).unwrap(), value);
    }

    #[test]
    fn test_time_of_day() {
        let ts = TimeStamp {
            days: 10000,
            millis: 43_200_000,
        };
        let raw = Value::TimeOfDay(ts).to_raw(DataType::TimeOfDay, 1.0).unwrap();
        assert_eq!(raw.len(), 6);
        assert_eq!(
            Value::from_raw(&raw, DataType::TimeOfDay, 1.0).unwrap(),
            Value::TimeOfDay(ts)
        );
    }

    #[test]
    fn test_scaling() {
        // Decode multiplies
        let raw = 100u16.to_le_bytes();
        assert_eq!(
            Value::from_raw(&raw, DataType::Unsigned16, 0.5).unwrap(),
            Value::Float(50.0)
        );
        // Encode divides
        let encoded = Value::Float(50.0).to_raw(DataType::Unsigned16, 0.5).unwrap();
        assert_eq!(encoded, 100u16.to_le_bytes());
    }

    #[test]
    fn test_out_of_range() {
        assert!(matches!(
            Value::Integer(300).to_raw(DataType::Unsigned8, 1.0),
            Err(ValueError::OutOfRange { .. })
        ));
        assert!(matches!(
            Value::Integer(-1).to_raw(DataType::Unsigned32, 1.0),
            Err(ValueError::OutOfRange { .. })
        ));
        assert!(matches!(
            Value::Integer(128).to_raw(DataType::Integer8, 1.0),
            Err(ValueError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(
            Value::parse("0x1234", DataType::Unsigned16).unwrap(),
            Value::Unsigned(0x1234)
        );
        assert_eq!(
            Value::parse("-42", DataType::Integer8).unwrap(),
            Value::Integer(-42)
        );
        assert_eq!(
            Value::parse("name", DataType::VisibleString).unwrap(),
            Value::VisibleString("name".to_string())
        );
        assert_eq!(
            Value::parse("0xDEADBE", DataType::OctetString).unwrap(),
            Value::OctetString(vec![0xDE, 0xAD, 0xBE])
        );
    }
}
