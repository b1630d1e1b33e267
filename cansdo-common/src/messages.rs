//! CAN message types and the COB-ID layout used by the SDO and NMT services
use snafu::Snafu;

/// A CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// A 29-bit extended identifier
    Extended(u32),
    /// An 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw numeric value of the ID
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for extended IDs
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

impl core::fmt::Display for CanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanId::Extended(id) => write!(f, "{id:#010x}"),
            CanId::Std(id) => write!(f, "{id:#05x}"),
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame with up to 8 data bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Frame data. Bytes beyond `dlc` are zero.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid bytes in `data`
    pub dlc: u8,
    /// The frame identifier
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a new message
    ///
    /// Fails if `data` is longer than 8 bytes
    pub fn try_new(id: CanId, data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > MAX_DATA_LENGTH {
            return DataTooLongSnafu { len: data.len() }.fail();
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// Create a new message carrying a full 8-byte payload
    pub fn new(id: CanId, data: [u8; MAX_DATA_LENGTH]) -> Self {
        Self {
            id,
            dlc: MAX_DATA_LENGTH as u8,
            data,
        }
    }

    /// Get the message ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid data bytes of the message
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// COB-ID used for NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Base COB-ID for NMT error control (heartbeat and boot-up) messages
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// COB-ID on which a client sends requests to the server on `node_id`
pub const fn sdo_request_id(node_id: u8) -> CanId {
    CanId::Std(SDO_REQ_BASE + node_id as u16)
}

/// COB-ID on which the server on `node_id` sends its responses
pub const fn sdo_response_id(node_id: u8) -> CanId {
    CanId::Std(SDO_RESP_BASE + node_id as u16)
}

/// Returns true if `can_id` is an SDO request addressed to `node_id`
pub fn is_std_sdo_request(can_id: CanId, node_id: u8) -> bool {
    if let CanId::Std(id) = can_id {
        let base = id & 0xff80;
        let msg_id = id & 0x7f;
        if base == SDO_REQ_BASE && msg_id == node_id as u16 {
            return true;
        }
    }
    false
}

/// Errors which can occur while interpreting a [`CanMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// The message has fewer bytes than the message type requires
    #[snafu(display("Message too short"))]
    MessageTooShort,
    /// More than 8 bytes of data were given for a CAN frame
    #[snafu(display("CAN frame data too long: {len} bytes"))]
    DataTooLong {
        /// Number of bytes given
        len: usize,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The ID of the message
        cob_id: CanId,
        /// The ID expected
        expected: CanId,
    },
    /// The NMT command byte is not a known command
    #[snafu(display("Unknown NMT command {value:#04x}"))]
    UnknownNmtCommand {
        /// The raw command byte
        value: u8,
    },
}
