//! The record of one in-progress SDO transfer
//!
//! Both the client and the server hold at most one [`TransferContext`]. It is created when a
//! transfer is initiated and dropped when the transfer completes or aborts, so nothing from an
//! old transfer can leak into the next one.
use crate::block::{BlockReceiver, BlockSender};
use crate::objects::ObjectId;
use crate::segmented::{SegmentReassembler, SegmentWriter};

/// Which side of the transfer a machine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends requests
    Client,
    /// Answers requests using the object dictionary
    Server,
}

/// Direction of data flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to client
    Upload,
    /// Client to server
    Download,
}

/// The three SDO transfer modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Up to 4 bytes inside the initiate exchange
    Expedited,
    /// 7-byte segments with a toggle bit
    Segmented,
    /// Sub-blocks of sequence numbered segments
    Block,
}

/// Progress of the sending side of a block transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPhase {
    /// Negotiating; no segment sent yet
    Initiate,
    /// Sub-blocks are being sent and acknowledged
    SubBlock,
    /// End frame sent, waiting for its confirmation
    End,
}

/// Mode specific state of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeState {
    /// Client upload waiting for the server to choose the mode
    ///
    /// Holds the requested block size when a block upload was requested.
    UploadInitiate {
        /// Block size offered to the server, if block mode was requested
        block_size: Option<u8>,
    },
    /// Expedited download waiting for its confirmation
    Expedited,
    /// Sending segments. Until the first segment is produced the initiate exchange is pending.
    SegmentedSend(SegmentWriter),
    /// Receiving segments
    SegmentedReceive(SegmentReassembler),
    /// Sending sub-blocks
    BlockSend {
        /// Segment source
        sender: BlockSender,
        /// Where the exchange stands
        phase: BlockPhase,
    },
    /// Receiving sub-blocks. Once the last segment is in, the end frame is pending.
    BlockReceive(BlockReceiver),
}

impl ModeState {
    /// The transfer mode, if it has been settled
    pub fn mode(&self) -> Option<TransferMode> {
        match self {
            ModeState::UploadInitiate { .. } => None,
            ModeState::Expedited => Some(TransferMode::Expedited),
            ModeState::SegmentedSend(_) | ModeState::SegmentedReceive(_) => {
                Some(TransferMode::Segmented)
            }
            ModeState::BlockSend { .. } | ModeState::BlockReceive(_) => Some(TransferMode::Block),
        }
    }
}

/// One in-progress transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferContext {
    /// The role of the machine owning this context
    pub role: Role,
    /// Data flow direction
    pub direction: Direction,
    /// Object index
    pub index: u16,
    /// Object sub index
    pub sub: u8,
    /// Size announced during initiate, if any
    pub total_size: Option<u32>,
    /// Mode specific state
    pub mode: ModeState,
}

impl TransferContext {
    /// Create a new context
    pub fn new(role: Role, direction: Direction, id: ObjectId, mode: ModeState) -> Self {
        Self {
            role,
            direction,
            index: id.index,
            sub: id.sub,
            total_size: None,
            mode,
        }
    }

    /// Set the announced size
    pub fn with_size(mut self, size: Option<u32>) -> Self {
        self.total_size = size;
        self
    }

    /// The address of the object being transferred
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.index, self.sub)
    }

    /// Returns true if `index` and `sub` address this transfer
    pub fn addresses(&self, index: u16, sub: u8) -> bool {
        self.index == index && self.sub == sub
    }

    /// The toggle value expected on the next segment, for segmented transfers
    pub fn toggle(&self) -> Option<bool> {
        match &self.mode {
            ModeState::SegmentedSend(writer) => Some(writer.toggle()),
            ModeState::SegmentedReceive(reassembler) => Some(reassembler.toggle()),
            _ => None,
        }
    }

    /// The next sequence number, for block transfers
    pub fn next_seq(&self) -> Option<u8> {
        match &self.mode {
            ModeState::BlockSend { sender, .. } => Some(sender.next_seq()),
            ModeState::BlockReceive(receiver) => Some(receiver.next_seq()),
            _ => None,
        }
    }

    /// The negotiated block size, for block transfers
    pub fn block_size(&self) -> Option<u8> {
        match &self.mode {
            ModeState::UploadInitiate { block_size } => *block_size,
            ModeState::BlockSend { sender, .. } => Some(sender.block_size()),
            ModeState::BlockReceive(receiver) => Some(receiver.block_size()),
            _ => None,
        }
    }

    /// Number of bytes moved so far
    pub fn bytes_transferred(&self) -> usize {
        match &self.mode {
            ModeState::UploadInitiate { .. } | ModeState::Expedited => 0,
            ModeState::SegmentedSend(writer) => writer.bytes_sent(),
            ModeState::SegmentedReceive(reassembler) => reassembler.bytes_received(),
            ModeState::BlockSend { sender, .. } => sender.bytes_acknowledged(),
            ModeState::BlockReceive(receiver) => receiver.bytes_received(),
        }
    }
}
