//! SDO frame definitions and the wire codec
//!
//! Every SDO frame is exactly 8 bytes. The first byte carries a command specifier in its upper
//! three bits and mode flags in the lower bits, following the CiA 301 layout. Requests flow from
//! client to server on COB-ID `0x600 + node`, responses on `0x580 + node`.
//!
//! Block segments are the exception: their first byte is `c | seqnum`, with no command specifier.
//! They can only be interpreted by a receiver which knows it is in the middle of a sub-block, and
//! so they are decoded separately via [`BlockSegment`].
use snafu::Snafu;

/// Largest number of segments allowed in a single sub-block
pub const MAX_BLOCK_SIZE: u8 = 127;

/// Largest block size at which an initiate request can never be taken for a block segment
///
/// The command byte of every initiate request reads as a sequence number of 32 or more.
pub const UNAMBIGUOUS_BLOCK_SIZE: u8 = 31;

/// Number of data bytes carried by a segment frame
pub const SEGMENT_SIZE: usize = 7;

/// Number of data bytes which can be carried by an expedited transfer
pub const EXPEDITED_MAX: usize = 4;

/// Errors raised when a frame cannot be interpreted
///
/// All of these describe a malformed frame. A malformed frame is dropped by the receiver without
/// changing its transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum FrameError {
    /// SDO frames are always 8 bytes long
    #[snafu(display("Malformed SDO frame: expected 8 bytes, got {len}"))]
    BadLength {
        /// Length of the rejected frame
        len: usize,
    },
    /// The command specifier is not one of the known opcodes
    #[snafu(display("Malformed SDO frame: unknown command specifier in {byte0:#04x}"))]
    UnknownCommand {
        /// First byte of the rejected frame
        byte0: u8,
    },
    /// A field holds a value outside its legal range
    #[snafu(display("Malformed SDO frame: {field} out of range"))]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
    },
}

/// Client command specifier (CCS) values, found in the top three bits of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate a download (expedited or segmented)
    InitiateDownload = 1,
    /// Initiate an upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort the transfer
    Abort = 4,
    /// Any of the block upload sub-commands
    BlockUpload = 5,
    /// Any of the block download sub-commands
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value >> 5 {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => UnknownCommandSnafu { byte0: value }.fail(),
        }
    }
}

/// Server command specifier (SCS) values, found in the top three bits of every response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerCommand {
    /// A segment of upload data
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Acknowledge an upload initiate
    Upload = 2,
    /// Acknowledge a download initiate
    Download = 3,
    /// Abort the transfer
    Abort = 4,
    /// Any of the block download sub-responses
    BlockDownload = 5,
    /// Any of the block upload sub-responses
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value >> 5 {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => UnknownCommandSnafu { byte0: value }.fail(),
        }
    }
}

/// The closed set of SDO operations, independent of which side sends the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Opcode {
    DownloadInitiate,
    UploadInitiate,
    DownloadSegment,
    UploadSegment,
    DownloadBlockInitiate,
    UploadBlockInitiate,
    DownloadBlockSubblock,
    DownloadBlockEnd,
    UploadBlockSubblock,
    UploadBlockEnd,
    Abort,
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Opcode::DownloadInitiate => "download-initiate",
            Opcode::UploadInitiate => "upload-initiate",
            Opcode::DownloadSegment => "download-segment",
            Opcode::UploadSegment => "upload-segment",
            Opcode::DownloadBlockInitiate => "download-block-initiate",
            Opcode::UploadBlockInitiate => "upload-block-initiate",
            Opcode::DownloadBlockSubblock => "download-block-subblock",
            Opcode::DownloadBlockEnd => "download-block-end",
            Opcode::UploadBlockSubblock => "upload-block-subblock",
            Opcode::UploadBlockEnd => "upload-block-end",
            Opcode::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// SDO abort codes, as defined by CiA 301
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC Error (block mode only )
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Resource not available: SDO connection
    ///
    /// Sent when an initiate request arrives while another transfer is in progress
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored to the application because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No data available
    NoData = 0x0800_0024,
}

impl AbortCode {
    /// All known abort codes
    pub const ALL: [AbortCode; 23] = [
        AbortCode::ToggleNotAlternated,
        AbortCode::SdoTimeout,
        AbortCode::InvalidCommandSpecifier,
        AbortCode::InvalidBlockSize,
        AbortCode::InvalidSequenceNumber,
        AbortCode::CrcError,
        AbortCode::OutOfMemory,
        AbortCode::UnsupportedAccess,
        AbortCode::WriteOnly,
        AbortCode::ReadOnly,
        AbortCode::NoSuchObject,
        AbortCode::IncompatibleParameter,
        AbortCode::HardwareError,
        AbortCode::DataTypeMismatch,
        AbortCode::DataTypeMismatchLengthHigh,
        AbortCode::DataTypeMismatchLengthLow,
        AbortCode::NoSuchSubIndex,
        AbortCode::InvalidValue,
        AbortCode::ResourceNotAvailable,
        AbortCode::GeneralError,
        AbortCode::CantStore,
        AbortCode::CantStoreDeviceState,
        AbortCode::NoData,
    ];
}

impl TryFrom<u32> for AbortCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        AbortCode::ALL
            .iter()
            .copied()
            .find(|code| *code as u32 == value)
            .ok_or(value)
    }
}

/// An abort code received over the wire, which may not be one of the known [`AbortCode`]s
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(raw) => RawAbortCode::Unknown(raw),
        }
    }
}

impl From<AbortCode> for RawAbortCode {
    fn from(value: AbortCode) -> Self {
        RawAbortCode::Valid(value)
    }
}

/// Requests sent by an SDO client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Begin a download. With `e` set, the value is carried inline.
    InitiateDownload {
        /// Number of unused bytes in data (valid when e=1 and s=1)
        n: u8,
        /// Expedited
        e: bool,
        /// Size valid
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value when e=1, size when e=0 and s=1
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Begin a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, contains the number of bytes to be downloaded
        size: u32,
    },
    /// Finish a block download
    EndBlockDownload {
        /// Number of bytes in the last segment which do not contain data
        n: u8,
        /// CRC of all downloaded data
        crc: u16,
    },
    /// Begin a block upload
    InitiateBlockUpload {
        /// Client CRC supported flag
        cc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per sub-block the client can accept
        blksize: u8,
        /// Protocol switch threshold. If the value is no larger than this, the server may
        /// answer with a regular upload instead. 0 disables switching.
        pst: u8,
    },
    /// Tell the server to start sending sub-blocks
    StartBlockUpload,
    /// Acknowledge an upload sub-block
    ConfirmBlock {
        /// Highest sequence number received in order
        ackseq: u8,
        /// Number of segments for the next sub-block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUpload,
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Raw abort code
        abort_code: u32,
    },
}

fn write_address(payload: &mut [u8; 8], index: u16, sub: u8) {
    payload[1..3].copy_from_slice(&index.to_le_bytes());
    payload[3] = sub;
}

fn read_address(value: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([value[1], value[2]]), value[3])
}

fn read_u32(value: &[u8]) -> u32 {
    u32::from_le_bytes([value[4], value[5], value[6], value[7]])
}

fn check_len(value: &[u8]) -> Result<(), FrameError> {
    if value.len() != 8 {
        BadLengthSnafu { len: value.len() }.fail()
    } else {
        Ok(())
    }
}

fn check_blksize(blksize: u8) -> Result<u8, FrameError> {
    if blksize == 0 || blksize > MAX_BLOCK_SIZE {
        InvalidFieldSnafu { field: "blksize" }.fail()
    } else {
        Ok(blksize)
    }
}

fn check_ackseq(ackseq: u8) -> Result<u8, FrameError> {
    if ackseq > MAX_BLOCK_SIZE {
        InvalidFieldSnafu { field: "ackseq" }.fail()
    } else {
        Ok(ackseq)
    }
}

/// Copy the first `len` bytes of a segment, leaving the remainder zeroed
fn segment_data(src: &[u8], len: usize) -> [u8; 7] {
    let mut data = [0; 7];
    data[..len].copy_from_slice(&src[..len]);
    data
}

/// Number of valid bytes in the data field of an initiate frame
fn initiate_len(n: u8, e: bool, s: bool) -> usize {
    match (e, s) {
        (true, true) => EXPEDITED_MAX - n as usize,
        (true, false) => EXPEDITED_MAX,
        (false, true) => EXPEDITED_MAX,
        (false, false) => 0,
    }
}

fn initiate_data(src: &[u8], n: u8, e: bool, s: bool) -> [u8; 4] {
    let len = initiate_len(n, e, s);
    let mut data = [0; 4];
    data[..len].copy_from_slice(&src[..len]);
    data
}

impl SdoRequest {
    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download message for a segmented download
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create an expedited download message
    ///
    /// Fails if `data` is empty or longer than 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() || data.len() > EXPEDITED_MAX {
            return InvalidFieldSnafu {
                field: "expedited data length",
            }
            .fail();
        }
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        Ok(SdoRequest::InitiateDownload {
            n: (EXPEDITED_MAX - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        })
    }

    /// Create a download segment message
    ///
    /// `segment_data` must be at most 7 bytes
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: (SEGMENT_SIZE - segment_data.len()) as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download message
    pub fn initiate_block_download(index: u16, sub: u8, crc_supported: bool, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: crc_supported,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download message
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload message
    pub fn initiate_block_upload(index: u16, sub: u8, crc_supported: bool, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc: crc_supported,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Get the operation this request belongs to
    pub fn opcode(&self) -> Opcode {
        match self {
            SdoRequest::InitiateDownload { .. } => Opcode::DownloadInitiate,
            SdoRequest::DownloadSegment { .. } => Opcode::DownloadSegment,
            SdoRequest::InitiateUpload { .. } => Opcode::UploadInitiate,
            SdoRequest::ReqUploadSegment { .. } => Opcode::UploadSegment,
            SdoRequest::InitiateBlockDownload { .. } => Opcode::DownloadBlockInitiate,
            SdoRequest::EndBlockDownload { .. } => Opcode::DownloadBlockEnd,
            SdoRequest::InitiateBlockUpload { .. } => Opcode::UploadBlockInitiate,
            SdoRequest::StartBlockUpload => Opcode::UploadBlockInitiate,
            SdoRequest::ConfirmBlock { .. } => Opcode::UploadBlockSubblock,
            SdoRequest::EndBlockUpload => Opcode::UploadBlockEnd,
            SdoRequest::Abort { .. } => Opcode::Abort,
        }
    }

    /// Returns the object address if this request opens a new transfer
    pub fn initiate_address(&self) -> Option<(u16, u8)> {
        match *self {
            SdoRequest::InitiateDownload { index, sub, .. }
            | SdoRequest::InitiateUpload { index, sub }
            | SdoRequest::InitiateBlockDownload { index, sub, .. }
            | SdoRequest::InitiateBlockUpload { index, sub, .. } => Some((index, sub)),
            _ => None,
        }
    }

    /// Serialize the request into an 8-byte frame
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let n = if e && s { n & 0x3 } else { 0 };
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | (n << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                write_address(&mut payload, index, sub);
                let len = initiate_len(n, e, s);
                payload[4..4 + len].copy_from_slice(&data[..len]);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                let n = n & 0x7;
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | n << 1
                    | (c as u8);
                let len = SEGMENT_SIZE - n as usize;
                payload[1..1 + len].copy_from_slice(&data[..len]);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                write_address(&mut payload, index, sub);
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ClientCommand::BlockDownload as u8) << 5 | (cc as u8) << 2 | (s as u8) << 1;
                write_address(&mut payload, index, sub);
                if s {
                    payload[4..8].copy_from_slice(&size.to_le_bytes());
                }
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = (ClientCommand::BlockDownload as u8) << 5 | (n & 0x7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | (cc as u8) << 2;
                write_address(&mut payload, index, sub);
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 3;
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 1;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                write_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }

        payload
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = FrameError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_len(value)?;
        let ccs = ClientCommand::try_from(value[0])?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & (1 << 0)) != 0;
                let data = segment_data(&value[1..8], SEGMENT_SIZE - n as usize);
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let n = if e && s { (value[0] >> 2) & 0x3 } else { 0 };
                let (index, sub) = read_address(value);
                let data = initiate_data(&value[4..8], n, e, s);
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let (index, sub) = read_address(value);
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let (index, sub) = read_address(value);
                let abort_code = read_u32(value);
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::BlockUpload => match value[0] & 0x3 {
                0 => {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let (index, sub) = read_address(value);
                    Ok(SdoRequest::InitiateBlockUpload {
                        cc,
                        index,
                        sub,
                        blksize: check_blksize(value[4])?,
                        pst: value[5],
                    })
                }
                1 => Ok(SdoRequest::EndBlockUpload),
                2 => Ok(SdoRequest::ConfirmBlock {
                    ackseq: check_ackseq(value[1])?,
                    blksize: check_blksize(value[2])?,
                }),
                _ => Ok(SdoRequest::StartBlockUpload),
            },
            ClientCommand::BlockDownload => {
                if value[0] & 1 == 0 {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let (index, sub) = read_address(value);
                    let size = if s { read_u32(value) } else { 0 };
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes([value[1], value[2]]);
                    Ok(SdoRequest::EndBlockDownload { n, crc })
                }
            }
        }
    }
}

/// Responses sent by an SDO server
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Acknowledge an upload initiate, carrying the value if expedited
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Acknowledge a download initiate
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Acknowledge a download segment
    ConfirmDownloadSegment {
        /// Toggle flag of the acknowledged segment
        t: bool,
    },
    /// Accept a block download
    ConfirmBlockDownload {
        /// Server CRC supported flag
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per sub-block
        blksize: u8,
    },
    /// Acknowledge a download sub-block
    ConfirmBlock {
        /// Highest sequence number received in order
        ackseq: u8,
        /// Number of segments for the next sub-block
        blksize: u8,
    },
    /// Acknowledge the end of a block download
    ConfirmBlockDownloadEnd,
    /// Accept a block upload
    ConfirmBlockUpload {
        /// Server CRC supported flag
        sc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Size of the value to be uploaded, if s=1
        size: u32,
    },
    /// Finish a block upload
    EndBlockUpload {
        /// Number of bytes in the last segment which do not contain data
        n: u8,
        /// CRC of all uploaded data
        crc: u16,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Raw abort code
        abort_code: u32,
    },
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = FrameError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_len(value)?;
        let command = ServerCommand::try_from(value[0])?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 7;
                let c = (value[0] & (1 << 0)) != 0;
                let data = segment_data(&value[1..8], SEGMENT_SIZE - n as usize);
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let n = if e && s { (value[0] >> 2) & 0x3 } else { 0 };
                let (index, sub) = read_address(value);
                let data = initiate_data(&value[4..8], n, e, s);
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let (index, sub) = read_address(value);
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::Abort => {
                let (index, sub) = read_address(value);
                let abort_code = read_u32(value);
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ServerCommand::BlockDownload => match value[0] & 0x3 {
                0 => {
                    let sc = (value[0] & (1 << 2)) != 0;
                    let (index, sub) = read_address(value);
                    Ok(SdoResponse::ConfirmBlockDownload {
                        sc,
                        index,
                        sub,
                        blksize: check_blksize(value[4])?,
                    })
                }
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: check_ackseq(value[1])?,
                    blksize: check_blksize(value[2])?,
                }),
                _ => UnknownCommandSnafu { byte0: value[0] }.fail(),
            },
            ServerCommand::BlockUpload => {
                if value[0] & 1 == 0 {
                    let sc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let (index, sub) = read_address(value);
                    let size = if s { read_u32(value) } else { 0 };
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes([value[1], value[2]]);
                    Ok(SdoResponse::EndBlockUpload { n, crc })
                }
            }
        }
    }
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// Fails if `data` is empty or longer than 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Result<SdoResponse, FrameError> {
        if data.is_empty() || data.len() > EXPEDITED_MAX {
            return InvalidFieldSnafu {
                field: "expedited data length",
            }
            .fail();
        }

        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        Ok(SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: (EXPEDITED_MAX - data.len()) as u8,
            data: msg_data,
        })
    }

    /// Create a response accepting a segmented upload of `size` bytes
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment response
    ///
    /// `data` must be at most 7 bytes
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let n = (SEGMENT_SIZE - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a download acknowledgement
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledgement
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a response accepting a block download
    pub fn block_download_acknowledge(sc: bool, index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc,
            index,
            sub,
            blksize,
        }
    }

    /// Create a response accepting a block upload
    pub fn block_upload_acknowledge(sc: bool, index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmBlockUpload {
            sc,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        let abort_code = abort_code as u32;
        SdoResponse::Abort {
            index,
            sub,
            abort_code,
        }
    }

    /// Get the operation this response belongs to
    pub fn opcode(&self) -> Opcode {
        match self {
            SdoResponse::ConfirmUpload { .. } => Opcode::UploadInitiate,
            SdoResponse::UploadSegment { .. } => Opcode::UploadSegment,
            SdoResponse::ConfirmDownload { .. } => Opcode::DownloadInitiate,
            SdoResponse::ConfirmDownloadSegment { .. } => Opcode::DownloadSegment,
            SdoResponse::ConfirmBlockDownload { .. } => Opcode::DownloadBlockInitiate,
            SdoResponse::ConfirmBlock { .. } => Opcode::DownloadBlockSubblock,
            SdoResponse::ConfirmBlockDownloadEnd => Opcode::DownloadBlockEnd,
            SdoResponse::ConfirmBlockUpload { .. } => Opcode::UploadBlockInitiate,
            SdoResponse::EndBlockUpload { .. } => Opcode::UploadBlockEnd,
            SdoResponse::Abort { .. } => Opcode::Abort,
        }
    }

    /// Serialize the response into an 8-byte frame
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let n = if e && s { n & 0x3 } else { 0 };
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | (n << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                write_address(&mut payload, index, sub);
                let len = initiate_len(n, e, s);
                payload[4..4 + len].copy_from_slice(&data[..len]);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                let n = n & 0x7;
                payload[0] =
                    (ServerCommand::SegmentUpload as u8) << 5 | (t as u8) << 4 | n << 1 | c as u8;
                let len = SEGMENT_SIZE - n as usize;
                payload[1..1 + len].copy_from_slice(&data[..len]);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                write_address(&mut payload, index, sub);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | (sc as u8) << 2;
                write_address(&mut payload, index, sub);
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 1;
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ServerCommand::BlockUpload as u8) << 5 | (sc as u8) << 2 | (s as u8) << 1;
                write_address(&mut payload, index, sub);
                if s {
                    payload[4..8].copy_from_slice(&size.to_le_bytes());
                }
            }
            SdoResponse::EndBlockUpload { n, crc } => {
                payload[0] = (ServerCommand::BlockUpload as u8) << 5 | (n & 0x7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                write_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }
}

/// A segment of data sent during a block transfer sub-block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSegment {
    /// Set on the last segment of the whole transfer
    pub c: bool,
    /// Sequence number within the sub-block, 1..=127
    pub seqnum: u8,
    /// Segment data. Unused bytes of the final segment are zero.
    pub data: [u8; 7],
}

impl BlockSegment {
    /// Serialize the segment into an 8-byte frame
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];
        payload[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7f);
        payload[1..8].copy_from_slice(&self.data);
        payload
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = FrameError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_len(value)?;
        let c = (value[0] & (1 << 7)) != 0;
        let seqnum = value[0] & 0x7f;
        if seqnum == 0 {
            return InvalidFieldSnafu { field: "seqnum" }.fail();
        }
        let data = segment_data(&value[1..8], SEGMENT_SIZE);
        Ok(BlockSegment { c, seqnum, data })
    }
}

/// Returns true if the frame is an abort
///
/// Used by receivers in a sub-block receive phase, where every other frame is a block segment.
/// An abort frame is unambiguous there: it would decode as a segment with seqnum 0, which is not
/// allowed.
pub fn is_abort_frame(value: &[u8]) -> bool {
    value.len() == 8 && value[0] == (ClientCommand::Abort as u8) << 5
}
