//! Node ID newtype

use snafu::Snafu;

/// The ID of a CANopen node
///
/// Node IDs are restricted to the range 1..=127.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

/// An error for out-of-range node IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Node ID {value} is outside the range 1..=127"))]
pub struct InvalidNodeIdError {
    /// The rejected value
    pub value: u8,
}

impl NodeId {
    /// Create a new node ID, validating the range
    pub fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if (1..=127).contains(&value) {
            Ok(NodeId(value))
        } else {
            Err(InvalidNodeIdError { value })
        }
    }

    /// Get the raw ID value
    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(128).is_err());
        assert_eq!(NodeId::new(1).unwrap().raw(), 1);
        assert_eq!(NodeId::new(127).unwrap().raw(), 127);
    }
}
