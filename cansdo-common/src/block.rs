//! Block transfer: sub-blocks of sequence-numbered segments, acknowledged in bulk
//!
//! Both directions share these types. For a block download the client owns a [`BlockSender`] and
//! the server a [`BlockReceiver`]; for a block upload the roles are swapped.
//!
//! Each sub-block carries up to `block_size` segments numbered from 1. The receiver accepts them
//! only in contiguous order, and acknowledges once per sub-block with the highest sequence number
//! it holds. If that is short of the sub-block's last segment, the sender re-sends the tail of the
//! same sub-block, keeping the original sequence numbers. Segments are never sent twice once
//! acknowledged.
use snafu::Snafu;

use crate::sdo::{BlockSegment, MAX_BLOCK_SIZE, SEGMENT_SIZE};

/// Compute the CRC used by block transfers (CRC-16/XMODEM)
pub fn crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Errors raised by the block transfer algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum BlockError {
    /// Block size outside 1..=127
    #[snafu(display("Invalid block size {block_size}"))]
    InvalidBlockSize {
        /// The rejected block size
        block_size: u8,
    },
    /// An acknowledgement named a segment which was never sent
    #[snafu(display("Invalid sequence number {seqnum}"))]
    InvalidSequence {
        /// The rejected sequence number
        seqnum: u8,
    },
    /// The CRC in the end frame does not match the received data
    #[snafu(display("Block CRC mismatch: expected {expected:#06x}, computed {computed:#06x}"))]
    CrcMismatch {
        /// CRC from the end frame
        expected: u16,
        /// CRC computed over the received data
        computed: u16,
    },
    /// The received byte count disagrees with the announced size
    #[snafu(display("Block transfer size mismatch: announced {expected}, received {actual}"))]
    SizeMismatch {
        /// Size announced at initiate
        expected: u32,
        /// Number of bytes received
        actual: usize,
    },
    /// The end frame arrived before the final segment
    #[snafu(display("Block transfer ended before the last segment"))]
    Incomplete,
    /// The data exceeds the receiver's buffer limit
    #[snafu(display("Block transfer exceeds {limit} bytes"))]
    TooLarge {
        /// The receiver's limit
        limit: usize,
    },
}

fn check_block_size(block_size: u8) -> Result<u8, BlockError> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        InvalidBlockSizeSnafu { block_size }.fail()
    } else {
        Ok(block_size)
    }
}

/// What a [`BlockSender`] should do after an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Some segments of the sub-block were lost; send the tail again
    Retransmit,
    /// The sub-block was received; send the next one
    NextSubBlock,
    /// All data was received; send the end frame
    Finished,
}

/// The sending half of a block transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSender {
    data: Vec<u8>,
    crc: u16,
    block_size: u8,
    /// Index of the first segment of the current sub-block
    base: usize,
    /// Number of segments of the current sub-block the receiver holds
    acked: u8,
}

impl BlockSender {
    /// Create a sender for `data` with the negotiated block size
    pub fn new(data: Vec<u8>, block_size: u8) -> Result<Self, BlockError> {
        let block_size = check_block_size(block_size)?;
        Ok(Self {
            crc: crc(&data),
            data,
            block_size,
            base: 0,
            acked: 0,
        })
    }

    /// Total number of segments in the transfer
    ///
    /// Empty data still takes one (empty) segment
    pub fn total_segments(&self) -> usize {
        self.data.len().div_ceil(SEGMENT_SIZE).max(1)
    }

    fn sub_block_len(&self) -> u8 {
        let remaining = self.total_segments().saturating_sub(self.base);
        remaining.min(self.block_size as usize) as u8
    }

    fn segment(&self, seqnum: u8) -> BlockSegment {
        let idx = self.base + seqnum as usize - 1;
        let start = idx * SEGMENT_SIZE;
        let end = (start + SEGMENT_SIZE).min(self.data.len());
        let mut data = [0; SEGMENT_SIZE];
        if start < end {
            data[..end - start].copy_from_slice(&self.data[start..end]);
        }
        BlockSegment {
            c: idx + 1 == self.total_segments(),
            seqnum,
            data,
        }
    }

    /// The segments which are due to be sent
    ///
    /// After a partial acknowledgement this is only the unacknowledged tail of the sub-block.
    pub fn sub_block(&self) -> Vec<BlockSegment> {
        (self.acked + 1..=self.sub_block_len())
            .map(|seq| self.segment(seq))
            .collect()
    }

    /// Process an acknowledgement from the receiver
    ///
    /// `ackseq` is the highest sequence number held by the receiver. `next_block_size` applies
    /// from the next sub-block on.
    pub fn acknowledge(&mut self, ackseq: u8, next_block_size: u8) -> Result<AckOutcome, BlockError> {
        let len = self.sub_block_len();
        if ackseq > len {
            return InvalidSequenceSnafu { seqnum: ackseq }.fail();
        }
        if ackseq < len {
            self.acked = self.acked.max(ackseq);
            return Ok(AckOutcome::Retransmit);
        }
        let next_block_size = check_block_size(next_block_size)?;
        self.base += len as usize;
        self.acked = 0;
        self.block_size = next_block_size;
        if self.is_finished() {
            Ok(AckOutcome::Finished)
        } else {
            Ok(AckOutcome::NextSubBlock)
        }
    }

    /// Change the block size before the first sub-block is sent
    ///
    /// Used by a client, which only learns the block size from the server's initiate response.
    pub fn set_block_size(&mut self, block_size: u8) -> Result<(), BlockError> {
        self.block_size = check_block_size(block_size)?;
        Ok(())
    }

    /// Returns true once every segment has been acknowledged
    pub fn is_finished(&self) -> bool {
        self.base >= self.total_segments()
    }

    /// The `n` and CRC values for the end frame
    ///
    /// `n` is the number of bytes in the last segment which do not carry data
    pub fn end_frame_info(&self) -> (u8, u16) {
        let used = self.data.len() - (self.total_segments() - 1) * SEGMENT_SIZE;
        ((SEGMENT_SIZE - used) as u8, self.crc)
    }

    /// Number of segments per sub-block currently in effect
    pub fn block_size(&self) -> u8 {
        self.block_size
    }

    /// Sequence number of the next segment to be sent
    pub fn next_seq(&self) -> u8 {
        self.acked + 1
    }

    /// Number of data bytes acknowledged by the receiver
    pub fn bytes_acknowledged(&self) -> usize {
        ((self.base + self.acked as usize) * SEGMENT_SIZE).min(self.data.len())
    }

    /// Total size of the data
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the data is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of feeding one segment to a [`BlockReceiver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEvent {
    /// Segment accepted, more are expected in this sub-block
    Continue,
    /// Segment out of order or after the last segment; discarded
    Ignored,
    /// The sub-block is over from the receiver's point of view and an acknowledgement must be
    /// sent
    AckDue {
        /// Highest sequence number held
        ackseq: u8,
        /// Set when the last segment of the transfer has been received
        complete: bool,
    },
}

/// The receiving half of a block transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReceiver {
    buf: Vec<u8>,
    block_size: u8,
    /// Highest contiguous sequence number held in the current sub-block
    received: u8,
    /// Closing segment of the previous sub-block and the ackseq sent for it
    last_closing: Option<(BlockSegment, u8)>,
    complete: bool,
    expected_size: Option<u32>,
    limit: Option<usize>,
}

impl BlockReceiver {
    /// Create a receiver
    ///
    /// `block_size` is the number of segments per sub-block announced to the sender.
    pub fn new(
        block_size: u8,
        expected_size: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Self, BlockError> {
        let block_size = check_block_size(block_size)?;
        if let (Some(expected), Some(limit)) = (expected_size, limit) {
            if expected as usize > limit {
                return TooLargeSnafu { limit }.fail();
            }
        }
        Ok(Self {
            buf: Vec::new(),
            block_size,
            received: 0,
            last_closing: None,
            complete: false,
            expected_size,
            limit,
        })
    }

    /// Feed one segment
    pub fn accept(&mut self, segment: &BlockSegment) -> Result<BlockEvent, BlockError> {
        // A repeat of the previous closing segment means our ack was lost. While more data is
        // expected, segment 1 always opens a new sub-block.
        if self.received == 0 && (self.complete || segment.seqnum > 1) {
            if let Some((closing, ackseq)) = self.last_closing {
                if closing == *segment {
                    return Ok(BlockEvent::AckDue {
                        ackseq,
                        complete: self.complete,
                    });
                }
            }
        }
        if self.complete {
            return Ok(BlockEvent::Ignored);
        }

        if segment.seqnum == self.received + 1 {
            if let Some(limit) = self.limit {
                if self.buf.len() >= limit {
                    return TooLargeSnafu { limit }.fail();
                }
            }
            self.buf.extend_from_slice(&segment.data);
            self.received = segment.seqnum;
        }

        let closes_sub_block = segment.seqnum == self.block_size || segment.c;
        if !closes_sub_block {
            return Ok(if self.received == segment.seqnum {
                BlockEvent::Continue
            } else {
                BlockEvent::Ignored
            });
        }

        let ackseq = self.received;
        let complete = segment.c && ackseq == segment.seqnum;
        if complete {
            self.complete = true;
        }
        if ackseq == segment.seqnum {
            self.last_closing = Some((*segment, ackseq));
            self.received = 0;
        }
        Ok(BlockEvent::AckDue { ackseq, complete })
    }

    /// Check the end frame and return the received data
    pub fn finish(self, n: u8, crc_value: Option<u16>) -> Result<Vec<u8>, BlockError> {
        if !self.complete {
            return IncompleteSnafu.fail();
        }
        let mut buf = self.buf;
        let n = (n as usize).min(SEGMENT_SIZE).min(buf.len());
        buf.truncate(buf.len() - n);

        if let Some(expected) = self.expected_size {
            if buf.len() != expected as usize {
                return SizeMismatchSnafu {
                    expected,
                    actual: buf.len(),
                }
                .fail();
            }
        }
        if let Some(expected) = crc_value {
            let computed = crc(&buf);
            if computed != expected {
                return CrcMismatchSnafu { expected, computed }.fail();
            }
        }
        Ok(buf)
    }

    /// Number of segments per sub-block announced to the sender
    pub fn block_size(&self) -> u8 {
        self.block_size
    }

    /// Sequence number expected on the next segment
    pub fn next_seq(&self) -> u8 {
        self.received + 1
    }

    /// Number of bytes received so far, including padding of the last segment
    pub fn bytes_received(&self) -> usize {
        self.buf.len()
    }

    /// Returns true once the last segment of the transfer has been received
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}
