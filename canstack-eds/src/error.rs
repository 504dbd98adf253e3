//! Error types for dictionary and EDS file operations

use std::path::PathBuf;

use snafu::Snafu;

use crate::value::ValueError;

/// Error returned by dictionary operations and EDS file load/save
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EdsError {
    /// An object with this index already exists
    #[snafu(display("Object 0x{index:04X} already exists"))]
    DuplicateIndex {
        /// The conflicting index
        index: u16,
    },
    /// A sub-object with this sub-index already exists
    #[snafu(display("Sub-object {sub} of object 0x{index:04X} already exists"))]
    DuplicateSubIndex {
        /// The object index
        index: u16,
        /// The conflicting sub-index
        sub: u8,
    },
    /// No object with this index exists
    #[snafu(display("Object 0x{index:04X} does not exist"))]
    NoSuchEntry {
        /// The missing index
        index: u16,
    },
    /// No sub-object with this sub-index exists
    #[snafu(display("Sub-object {sub} of object 0x{index:04X} does not exist"))]
    NoSuchSubEntry {
        /// The object index
        index: u16,
        /// The missing sub-index
        sub: u8,
    },
    /// The object does not hold sub-objects
    #[snafu(display("Object 0x{index:04X} does not hold sub-objects"))]
    NotAnAggregate {
        /// The object index
        index: u16,
    },
    /// The object holds sub-objects and carries no raw value of its own
    #[snafu(display("Object 0x{index:04X} holds sub-objects and has no value of its own"))]
    NotALeaf {
        /// The object index
        index: u16,
    },
    /// The supplied object specification violates the schema
    #[snafu(display("Bad specification for object 0x{index:04X}: {reason}"))]
    BadSpec {
        /// The object index
        index: u16,
        /// Human-readable description of the violation
        reason: String,
    },
    /// No object matches the given parameter name
    #[snafu(display("No object named '{name}'"))]
    NoSuchName {
        /// The name which was looked up
        name: String,
    },
    /// A caller-supplied parameter was outside its permitted range
    #[snafu(display("{what} {value} is outside the range {min}..={max}"))]
    RangeError {
        /// What the parameter is
        what: &'static str,
        /// The rejected value
        value: i64,
        /// Lowest permitted value
        min: i64,
        /// Highest permitted value
        max: i64,
    },
    /// A value could not be encoded or decoded for an object
    #[snafu(display("Value error on object 0x{index:04X}: {source}"))]
    BadValue {
        /// The object index
        index: u16,
        /// The underlying codec error
        source: ValueError,
    },
    /// The INI layer rejected the file
    #[snafu(display("INI format error: {message}"))]
    IniFormat {
        /// The parser's message
        message: String,
    },
    /// The file parsed as INI but violates the EDS schema
    #[snafu(display("EDS format error: {message}"))]
    EdsFormat {
        /// Description of the violation
        message: String,
    },
    /// A numeric field could not be parsed
    #[snafu(display("Failed parsing '{field}' in section '{section}'"))]
    ParseInt {
        /// The field name
        field: String,
        /// The section holding the field
        section: String,
        /// The underlying parse error
        source: std::num::ParseIntError,
    },
    /// File system access failed
    #[snafu(display("I/O error accessing '{}'", path.display()))]
    Io {
        /// The path being accessed
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },
}
