//! Segmented transfer: 7-byte segments with an alternating toggle bit
//!
//! The sending side is driven by [`SegmentWriter`], the receiving side by [`SegmentReassembler`].
//! A receiver which sees a segment with the wrong toggle treats it as a repeat of the previous
//! segment, and the caller re-sends its last response.
use snafu::Snafu;

use crate::sdo::SEGMENT_SIZE;

/// One segment of a segmented transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Toggle bit. Starts at false and alternates with each segment.
    pub toggle: bool,
    /// Set on the final segment
    pub complete: bool,
    /// Up to 7 bytes of data
    pub data: heapless::Vec<u8, SEGMENT_SIZE>,
}

impl Segment {
    fn new(toggle: bool, complete: bool, chunk: &[u8]) -> Self {
        let mut data = heapless::Vec::new();
        // chunk is never longer than SEGMENT_SIZE
        let _ = data.extend_from_slice(chunk);
        Self {
            toggle,
            complete,
            data,
        }
    }
}

/// Split `data` into segments
///
/// Yields `ceil(len / 7)` segments. An empty slice yields nothing; [`SegmentWriter`] covers the
/// empty case on the wire with a single empty segment.
pub fn segments(data: &[u8]) -> impl Iterator<Item = Segment> + '_ {
    let count = data.len().div_ceil(SEGMENT_SIZE);
    data.chunks(SEGMENT_SIZE)
        .enumerate()
        .map(move |(i, chunk)| Segment::new(i % 2 == 1, i + 1 == count, chunk))
}

/// Reassemble segments produced by [`segments`]
pub fn reassemble<I: IntoIterator<Item = Segment>>(segments: I) -> Result<Vec<u8>, SegmentError> {
    let mut reassembler = SegmentReassembler::new(None, None);
    for seg in segments {
        match reassembler.accept(seg.toggle, seg.complete, &seg.data)? {
            SegmentOutcome::Complete => break,
            SegmentOutcome::InProgress | SegmentOutcome::Duplicate => (),
        }
    }
    Ok(reassembler.into_data())
}

/// Errors raised while reassembling a segmented transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SegmentError {
    /// The received byte count disagrees with the size announced at initiate
    #[snafu(display("Segmented transfer size mismatch: announced {expected}, received {actual}"))]
    SizeMismatch {
        /// Size announced at initiate
        expected: u32,
        /// Number of bytes received
        actual: usize,
    },
    /// The data exceeds the receiver's buffer limit
    #[snafu(display("Segmented transfer exceeds {limit} bytes"))]
    TooLarge {
        /// The receiver's limit
        limit: usize,
    },
}

/// Result of feeding one segment to a [`SegmentReassembler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// The segment was appended and more are expected
    InProgress,
    /// The segment was appended and completed the transfer
    Complete,
    /// The toggle did not match; the segment was discarded
    Duplicate,
}

/// The receiving half of a segmented transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReassembler {
    buf: Vec<u8>,
    toggle: bool,
    expected_size: Option<u32>,
    limit: Option<usize>,
    complete: bool,
}

impl SegmentReassembler {
    /// Create a reassembler
    ///
    /// `expected_size` is the size announced at initiate, if any. `limit` caps the number of bytes
    /// which will be buffered.
    pub fn new(expected_size: Option<u32>, limit: Option<usize>) -> Self {
        Self {
            buf: Vec::new(),
            toggle: false,
            expected_size,
            limit,
            complete: false,
        }
    }

    /// Feed one segment
    pub fn accept(
        &mut self,
        toggle: bool,
        complete: bool,
        data: &[u8],
    ) -> Result<SegmentOutcome, SegmentError> {
        if self.complete || toggle != self.toggle {
            return Ok(SegmentOutcome::Duplicate);
        }

        let new_len = self.buf.len() + data.len();
        if let Some(limit) = self.limit {
            if new_len > limit {
                return TooLargeSnafu { limit }.fail();
            }
        }
        if let Some(expected) = self.expected_size {
            let overrun = new_len > expected as usize;
            let short = complete && new_len != expected as usize;
            if overrun || short {
                return SizeMismatchSnafu {
                    expected,
                    actual: new_len,
                }
                .fail();
            }
        }

        self.buf.extend_from_slice(data);
        self.toggle = !self.toggle;
        if complete {
            self.complete = true;
            Ok(SegmentOutcome::Complete)
        } else {
            Ok(SegmentOutcome::InProgress)
        }
    }

    /// The toggle value expected on the next segment
    pub fn toggle(&self) -> bool {
        self.toggle
    }

    /// Number of bytes accepted so far
    pub fn bytes_received(&self) -> usize {
        self.buf.len()
    }

    /// Returns true once the final segment has been accepted
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume the reassembler, returning the received data
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}

/// The sending half of a segmented transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentWriter {
    data: Vec<u8>,
    pos: usize,
    toggle: bool,
    started: bool,
}

impl SegmentWriter {
    /// Create a writer for `data`
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            toggle: false,
            started: false,
        }
    }

    /// Produce the next segment, or None when all data has been sent
    pub fn next_segment(&mut self) -> Option<Segment> {
        if self.is_finished() {
            return None;
        }
        let end = (self.pos + SEGMENT_SIZE).min(self.data.len());
        let complete = end == self.data.len();
        let seg = Segment::new(self.toggle, complete, &self.data[self.pos..end]);
        self.pos = end;
        self.toggle = !self.toggle;
        self.started = true;
        Some(seg)
    }

    /// Toggle value of the most recently produced segment
    pub fn last_toggle(&self) -> bool {
        !self.toggle
    }

    /// Toggle value the next segment will carry
    pub fn toggle(&self) -> bool {
        self.toggle
    }

    /// Number of bytes handed out so far
    pub fn bytes_sent(&self) -> usize {
        self.pos
    }

    /// Total number of bytes to send
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if there is no data to send
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true once the first segment has been produced
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Returns true once every segment has been produced
    pub fn is_finished(&self) -> bool {
        self.started && self.pos >= self.data.len()
    }
}
