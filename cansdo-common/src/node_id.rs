use snafu::Snafu;

/// The ID of a configured CANopen node, in the range 1..=127
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u8);

impl NodeId {
    /// Create a node ID, failing if `value` is outside 1..=127
    pub fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value > 0 && value < 128 {
            Ok(NodeId(value))
        } else {
            InvalidNodeIdSnafu { value }.fail()
        }
    }

    /// Get the raw ID value
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Returned when constructing a [`NodeId`] from an out of range value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Invalid node ID {value}"))]
pub struct InvalidNodeIdError {
    value: u8,
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
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
