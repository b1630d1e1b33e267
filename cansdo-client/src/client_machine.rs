//! The client side SDO state machine
//!
//! [`ClientMachine`] holds no I/O. Frames it wants to send are handed to a `send` callback, and
//! every frame received from the server is passed to [`ClientMachine::handle_frame`]. The async
//! [`SdoClient`](crate::SdoClient) drives it over a real bus, but it can just as well be driven
//! by hand.
use snafu::Snafu;

use crate::common::{
    block::{AckOutcome, BlockError, BlockEvent, BlockReceiver, BlockSender},
    objects::ObjectId,
    observer::{LogObserver, TransferEvent, TransferObserver},
    sdo::{
        is_abort_frame, AbortCode, BlockSegment, RawAbortCode, SdoRequest, SdoResponse,
        EXPEDITED_MAX, SEGMENT_SIZE,
    },
    segmented::{SegmentError, SegmentOutcome, SegmentReassembler, SegmentWriter},
    transfer::{BlockPhase, Direction, ModeState, Role, TransferContext, TransferMode},
};
use crate::config::SdoClientConfig;

/// Returned when a transfer cannot be started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MachineError {
    /// Another transfer is still active
    #[snafu(display("A transfer is already in progress"))]
    Busy,
    /// The value does not fit in the 32-bit size field
    #[snafu(display("Value of {len} bytes is too large to transfer"))]
    TooLarge {
        /// Size of the value
        len: usize,
    },
}

/// Identifies a transfer started by [`ClientMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHandle {
    /// The object being transferred
    pub id: ObjectId,
    /// Direction of the transfer
    pub direction: Direction,
}

/// Why a transfer ended without completing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAbort {
    /// The server sent an abort
    Server {
        /// Index in the abort frame
        index: u16,
        /// Sub index in the abort frame
        sub: u8,
        /// The abort code sent by the server
        code: RawAbortCode,
    },
    /// The client aborted the transfer, and sent this code to the server
    Local {
        /// The abort code sent
        code: AbortCode,
    },
}

/// Result of feeding a frame to a [`ClientMachine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// No transfer is active. The frame was ignored.
    Idle,
    /// The transfer continues
    InProgress,
    /// The transfer finished. Holds the uploaded value, or nothing for a download.
    Complete(Vec<u8>),
    /// The transfer ended early
    Aborted(ClientAbort),
}

fn segment_abort(err: SegmentError) -> AbortCode {
    match err {
        SegmentError::SizeMismatch { .. } => AbortCode::DataTypeMismatch,
        SegmentError::TooLarge { .. } => AbortCode::OutOfMemory,
    }
}

fn block_abort(err: BlockError) -> AbortCode {
    match err {
        BlockError::InvalidBlockSize { .. } => AbortCode::InvalidBlockSize,
        BlockError::InvalidSequence { .. } => AbortCode::InvalidSequenceNumber,
        BlockError::CrcMismatch { .. } => AbortCode::CrcError,
        BlockError::SizeMismatch { .. } => AbortCode::DataTypeMismatch,
        BlockError::Incomplete => AbortCode::InvalidCommandSpecifier,
        BlockError::TooLarge { .. } => AbortCode::OutOfMemory,
    }
}

/// Internal result of handling one response
enum Step {
    Continue,
    Ignore,
    Done(Vec<u8>),
}

/// SDO client state machine
///
/// Runs at most one transfer at a time. The phases are `Idle`, `Initiate`, then segments or
/// sub-blocks, then (for block transfers) the end exchange, back to `Idle`. An abort ends the
/// transfer from any phase.
pub struct ClientMachine {
    config: SdoClientConfig,
    ctx: Option<TransferContext>,
    last_frame: Option<[u8; 8]>,
    crc_enabled: bool,
    /// Count of frames which moved the active transfer forward
    progress: u32,
    observer: Box<dyn TransferObserver>,
}

impl core::fmt::Debug for ClientMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientMachine")
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl ClientMachine {
    /// Create a machine which logs its events
    pub fn new(config: SdoClientConfig) -> Self {
        Self::with_observer(config, Box::new(LogObserver))
    }

    /// Create a machine reporting events to `observer`
    pub fn with_observer(config: SdoClientConfig, observer: Box<dyn TransferObserver>) -> Self {
        Self {
            config,
            ctx: None,
            last_frame: None,
            crc_enabled: false,
            progress: 0,
            observer,
        }
    }

    /// The configuration in use
    pub fn config(&self) -> &SdoClientConfig {
        &self.config
    }

    /// The active transfer, if any
    pub fn context(&self) -> Option<&TransferContext> {
        self.ctx.as_ref()
    }

    /// Returns true if no transfer is active
    pub fn is_idle(&self) -> bool {
        self.ctx.is_none()
    }

    /// A counter which changes whenever a received frame advances the active transfer
    ///
    /// Stale duplicates, malformed frames and aborts meant for other objects leave it unchanged.
    pub fn progress(&self) -> u32 {
        self.progress
    }

    /// Start reading an object
    ///
    /// Requests a block upload when the config prefers block transfers, otherwise a regular
    /// upload. The server decides between expedited and segmented.
    pub fn request_upload(
        &mut self,
        index: u16,
        sub: u8,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<TransferHandle, MachineError> {
        self.start_upload(index, sub, self.config.prefer_block, send)
    }

    /// Start reading an object with a block upload
    pub fn request_block_upload(
        &mut self,
        index: u16,
        sub: u8,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<TransferHandle, MachineError> {
        self.start_upload(index, sub, true, send)
    }

    /// Start writing an object
    ///
    /// Values of up to 4 bytes are sent expedited. Larger values use a block transfer if the
    /// config prefers it, and a segmented transfer otherwise.
    pub fn request_download(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<TransferHandle, MachineError> {
        self.start_download(index, sub, data, self.config.prefer_block, send)
    }

    /// Start writing an object with a block download, unless it fits in an expedited transfer
    pub fn request_block_download(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<TransferHandle, MachineError> {
        self.start_download(index, sub, data, true, send)
    }

    fn start_upload(
        &mut self,
        index: u16,
        sub: u8,
        block: bool,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<TransferHandle, MachineError> {
        if self.ctx.is_some() {
            return BusySnafu.fail();
        }
        let id = ObjectId::new(index, sub);
        let (block_size, req) = if block {
            let block_size = self.config.block_size;
            let req = SdoRequest::initiate_block_upload(
                index,
                sub,
                self.config.crc,
                block_size,
                self.config.pst,
            );
            (Some(block_size), req)
        } else {
            (None, SdoRequest::initiate_upload(index, sub))
        };
        self.start(
            TransferContext::new(
                Role::Client,
                Direction::Upload,
                id,
                ModeState::UploadInitiate { block_size },
            ),
            req,
            send,
        );
        Ok(TransferHandle {
            id,
            direction: Direction::Upload,
        })
    }

    fn start_download(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        block: bool,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<TransferHandle, MachineError> {
        if self.ctx.is_some() {
            return BusySnafu.fail();
        }
        let size = u32::try_from(data.len()).map_err(|_| MachineError::TooLarge { len: data.len() })?;
        let id = ObjectId::new(index, sub);

        let (mode, req) = if !data.is_empty() && data.len() <= EXPEDITED_MAX {
            let req = SdoRequest::expedited_download(index, sub, data)
                .map_err(|_| MachineError::TooLarge { len: data.len() })?;
            (ModeState::Expedited, req)
        } else if block && !data.is_empty() {
            let sender = BlockSender::new(data.to_vec(), self.config.block_size)
                .map_err(|_| MachineError::TooLarge { len: data.len() })?;
            let req = SdoRequest::initiate_block_download(index, sub, self.config.crc, size);
            (
                ModeState::BlockSend {
                    sender,
                    phase: BlockPhase::Initiate,
                },
                req,
            )
        } else {
            // An empty value can only be sent segmented
            (
                ModeState::SegmentedSend(SegmentWriter::new(data.to_vec())),
                SdoRequest::initiate_download(index, sub, Some(size)),
            )
        };

        let ctx = TransferContext::new(Role::Client, Direction::Download, id, mode)
            .with_size(Some(size));
        self.start(ctx, req, send);
        Ok(TransferHandle {
            id,
            direction: Direction::Download,
        })
    }

    fn start(&mut self, ctx: TransferContext, req: SdoRequest, send: &mut dyn FnMut([u8; 8])) {
        self.observer.on_event(&TransferEvent::Started {
            role: Role::Client,
            direction: ctx.direction,
            id: ctx.object_id(),
        });
        if let Some(mode) = ctx.mode.mode() {
            self.mode_selected(mode);
        }
        self.ctx = Some(ctx);
        self.crc_enabled = false;
        self.send(req.to_bytes(), send);
    }

    fn mode_selected(&self, mode: TransferMode) {
        self.observer.on_event(&TransferEvent::ModeSelected {
            role: Role::Client,
            mode,
        });
    }

    fn send(&mut self, frame: [u8; 8], send: &mut dyn FnMut([u8; 8])) {
        self.last_frame = Some(frame);
        send(frame);
    }

    fn reset(&mut self) {
        self.ctx = None;
        self.last_frame = None;
        self.crc_enabled = false;
    }

    /// Send the last frame again
    ///
    /// Called when no response arrived in time. Returns false if there is nothing to re-send.
    ///
    /// While part of a block upload sub-block has been received, an acknowledgement of the
    /// received segments is sent instead, so the server re-sends whatever is missing.
    pub fn retransmit(&mut self, send: &mut dyn FnMut([u8; 8])) -> bool {
        let Some(ctx) = self.ctx.as_ref() else {
            return false;
        };
        let Some(mut frame) = self.last_frame else {
            return false;
        };
        if let ModeState::BlockReceive(receiver) = &ctx.mode {
            // Part of a sub-block arrived: ack what we hold so the server re-sends the tail
            let received = receiver.next_seq() - 1;
            if received > 0 && !receiver.is_complete() {
                frame = SdoRequest::ConfirmBlock {
                    ackseq: received,
                    blksize: self.config.block_size,
                }
                .to_bytes();
            }
        }
        if let Ok(req) = SdoRequest::try_from(frame.as_slice()) {
            self.observer.on_event(&TransferEvent::Retransmit {
                role: Role::Client,
                opcode: req.opcode(),
            });
        }
        self.send(frame, send);
        true
    }

    /// Abort the active transfer
    ///
    /// An abort frame is sent to the server and the machine returns to idle. Does nothing if no
    /// transfer is active.
    pub fn abort(&mut self, code: AbortCode, send: &mut dyn FnMut([u8; 8])) {
        if let Some(ctx) = self.ctx.take() {
            self.observer.on_event(&TransferEvent::Aborted {
                role: Role::Client,
                id: ctx.object_id(),
                code: code.into(),
                remote: false,
            });
            send(SdoRequest::abort(ctx.index, ctx.sub, code).to_bytes());
        }
        self.reset();
    }

    fn local_abort(&mut self, code: AbortCode, send: &mut dyn FnMut([u8; 8])) -> TransferStatus {
        self.abort(code, send);
        TransferStatus::Aborted(ClientAbort::Local { code })
    }

    /// Handle a raw frame received from the server
    ///
    /// While a block upload sub-block is being received, frames are block segments. Otherwise
    /// they are decoded as responses.
    pub fn handle_frame(&mut self, frame: &[u8], send: &mut dyn FnMut([u8; 8])) -> TransferStatus {
        if let Some(ModeState::BlockReceive(receiver)) = self.ctx.as_mut().map(|c| &mut c.mode) {
            if !is_abort_frame(frame) {
                let in_sub_block = !receiver.is_complete();
                match BlockSegment::try_from(frame) {
                    Ok(segment) => {
                        let event = receiver.accept(&segment);
                        // After the last segment, only a repeated closing segment is still a
                        // segment; anything else is a response
                        if in_sub_block || matches!(event, Ok(BlockEvent::AckDue { .. })) {
                            return self.block_event(event, send);
                        }
                    }
                    Err(error) if in_sub_block => {
                        self.observer.on_event(&TransferEvent::Malformed {
                            role: Role::Client,
                            error,
                        });
                        return TransferStatus::InProgress;
                    }
                    Err(_) => (),
                }
            }
        }

        match SdoResponse::try_from(frame) {
            Ok(response) => self.poll_response(response, send),
            Err(error) => {
                self.observer.on_event(&TransferEvent::Malformed {
                    role: Role::Client,
                    error,
                });
                if self.ctx.is_some() {
                    TransferStatus::InProgress
                } else {
                    TransferStatus::Idle
                }
            }
        }
    }

    /// Handle a block upload segment
    pub fn poll_segment(
        &mut self,
        segment: BlockSegment,
        send: &mut dyn FnMut([u8; 8]),
    ) -> TransferStatus {
        match self.ctx.as_mut().map(|c| &mut c.mode) {
            Some(ModeState::BlockReceive(receiver)) => {
                let event = receiver.accept(&segment);
                self.block_event(event, send)
            }
            Some(_) => self.local_abort(AbortCode::InvalidCommandSpecifier, send),
            None => TransferStatus::Idle,
        }
    }

    fn block_event(
        &mut self,
        event: Result<BlockEvent, BlockError>,
        send: &mut dyn FnMut([u8; 8]),
    ) -> TransferStatus {
        match event {
            Ok(BlockEvent::Continue) => {
                self.progress = self.progress.wrapping_add(1);
                TransferStatus::InProgress
            }
            Ok(BlockEvent::Ignored) => TransferStatus::InProgress,
            Ok(BlockEvent::AckDue { ackseq, .. }) => {
                self.progress = self.progress.wrapping_add(1);
                let blksize = self.config.block_size;
                self.send(SdoRequest::ConfirmBlock { ackseq, blksize }.to_bytes(), send);
                TransferStatus::InProgress
            }
            Err(err) => self.local_abort(block_abort(err), send),
        }
    }

    /// Handle a decoded response from the server
    pub fn poll_response(
        &mut self,
        response: SdoResponse,
        send: &mut dyn FnMut([u8; 8]),
    ) -> TransferStatus {
        let Some(mut ctx) = self.ctx.take() else {
            return TransferStatus::Idle;
        };

        if let SdoResponse::Abort {
            index,
            sub,
            abort_code,
        } = response
        {
            if ctx.addresses(index, sub) || (index == 0 && sub == 0) {
                let code = RawAbortCode::from(abort_code);
                self.observer.on_event(&TransferEvent::Aborted {
                    role: Role::Client,
                    id: ctx.object_id(),
                    code,
                    remote: true,
                });
                self.reset();
                return TransferStatus::Aborted(ClientAbort::Server { index, sub, code });
            }
            self.observer.on_event(&TransferEvent::Ignored {
                role: Role::Client,
                opcode: response.opcode(),
            });
            self.ctx = Some(ctx);
            return TransferStatus::InProgress;
        }

        match self.step(&mut ctx, response, send) {
            Ok(Step::Continue) => {
                self.progress = self.progress.wrapping_add(1);
                self.ctx = Some(ctx);
                TransferStatus::InProgress
            }
            Ok(Step::Ignore) => {
                self.observer.on_event(&TransferEvent::Ignored {
                    role: Role::Client,
                    opcode: response.opcode(),
                });
                self.ctx = Some(ctx);
                TransferStatus::InProgress
            }
            Ok(Step::Done(data)) => {
                self.observer.on_event(&TransferEvent::Completed {
                    role: Role::Client,
                    id: ctx.object_id(),
                    size: ctx.total_size.map_or(data.len(), |size| size as usize),
                });
                self.reset();
                TransferStatus::Complete(data)
            }
            Err(code) => {
                self.ctx = Some(ctx);
                self.local_abort(code, send)
            }
        }
    }

    fn step(
        &mut self,
        ctx: &mut TransferContext,
        response: SdoResponse,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<Step, AbortCode> {
        let object = ctx.object_id();
        let initiate_matches = |index: u16, sub: u8| {
            if object == ObjectId::new(index, sub) {
                Ok(())
            } else {
                Err(AbortCode::InvalidCommandSpecifier)
            }
        };

        match (&mut ctx.mode, response) {
            // Download
            (ModeState::Expedited, SdoResponse::ConfirmDownload { index, sub }) => {
                initiate_matches(index, sub)?;
                Ok(Step::Done(Vec::new()))
            }
            (ModeState::SegmentedSend(writer), SdoResponse::ConfirmDownload { index, sub }) => {
                if writer.has_started() {
                    return Ok(Step::Ignore);
                }
                initiate_matches(index, sub)?;
                let Some(segment) = writer.next_segment() else {
                    return Err(AbortCode::GeneralError);
                };
                let req = SdoRequest::download_segment(segment.toggle, segment.complete, &segment.data);
                self.send(req.to_bytes(), send);
                Ok(Step::Continue)
            }
            (ModeState::SegmentedSend(writer), SdoResponse::ConfirmDownloadSegment { t }) => {
                if !writer.has_started() {
                    return Err(AbortCode::InvalidCommandSpecifier);
                }
                if t != writer.last_toggle() {
                    return Ok(Step::Ignore);
                }
                if writer.is_finished() {
                    return Ok(Step::Done(Vec::new()));
                }
                let Some(segment) = writer.next_segment() else {
                    return Err(AbortCode::GeneralError);
                };
                let req = SdoRequest::download_segment(segment.toggle, segment.complete, &segment.data);
                self.send(req.to_bytes(), send);
                Ok(Step::Continue)
            }
            (
                ModeState::BlockSend { sender, phase },
                SdoResponse::ConfirmBlockDownload {
                    sc,
                    index,
                    sub,
                    blksize,
                },
            ) => {
                if *phase != BlockPhase::Initiate {
                    return Ok(Step::Ignore);
                }
                initiate_matches(index, sub)?;
                sender.set_block_size(blksize).map_err(block_abort)?;
                self.crc_enabled = self.config.crc && sc;
                *phase = BlockPhase::SubBlock;
                self.send_segments(&sender.sub_block(), send);
                Ok(Step::Continue)
            }
            (ModeState::BlockSend { sender, phase }, SdoResponse::ConfirmBlock { ackseq, blksize }) => {
                match phase {
                    BlockPhase::Initiate => Err(AbortCode::InvalidCommandSpecifier),
                    // A repeated ack for the last sub-block
                    BlockPhase::End => Ok(Step::Ignore),
                    BlockPhase::SubBlock => {
                        match sender.acknowledge(ackseq, blksize).map_err(block_abort)? {
                            AckOutcome::Retransmit => {
                                self.observer.on_event(&TransferEvent::Retransmit {
                                    role: Role::Client,
                                    opcode: response.opcode(),
                                });
                                self.send_segments(&sender.sub_block(), send);
                            }
                            AckOutcome::NextSubBlock => self.send_segments(&sender.sub_block(), send),
                            AckOutcome::Finished => {
                                let (n, crc) = sender.end_frame_info();
                                let crc = if self.crc_enabled { crc } else { 0 };
                                *phase = BlockPhase::End;
                                self.send(SdoRequest::end_block_download(n, crc).to_bytes(), send);
                            }
                        }
                        Ok(Step::Continue)
                    }
                }
            }
            (ModeState::BlockSend { phase, .. }, SdoResponse::ConfirmBlockDownloadEnd) => {
                if *phase != BlockPhase::End {
                    return Err(AbortCode::InvalidCommandSpecifier);
                }
                Ok(Step::Done(Vec::new()))
            }

            // Upload
            (
                ModeState::UploadInitiate { .. },
                SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                },
            ) => {
                initiate_matches(index, sub)?;
                if e {
                    self.mode_selected(TransferMode::Expedited);
                    let len = if s { EXPEDITED_MAX - n as usize } else { EXPEDITED_MAX };
                    return Ok(Step::Done(data[..len].to_vec()));
                }
                let size = s.then(|| u32::from_le_bytes(data));
                ctx.total_size = size;
                ctx.mode = ModeState::SegmentedReceive(SegmentReassembler::new(size, None));
                self.mode_selected(TransferMode::Segmented);
                self.send(SdoRequest::upload_segment_request(false).to_bytes(), send);
                Ok(Step::Continue)
            }
            (ModeState::SegmentedReceive(_), SdoResponse::ConfirmUpload { .. }) => Ok(Step::Ignore),
            (ModeState::SegmentedReceive(reassembler), SdoResponse::UploadSegment { t, n, c, data }) => {
                let len = SEGMENT_SIZE - n as usize;
                match reassembler.accept(t, c, &data[..len]).map_err(segment_abort)? {
                    // Left unanswered; a lost request is recovered by the retry timeout
                    SegmentOutcome::Duplicate => Ok(Step::Ignore),
                    SegmentOutcome::InProgress => {
                        let t = reassembler.toggle();
                        self.send(SdoRequest::upload_segment_request(t).to_bytes(), send);
                        Ok(Step::Continue)
                    }
                    SegmentOutcome::Complete => {
                        let ModeState::SegmentedReceive(reassembler) =
                            core::mem::replace(&mut ctx.mode, ModeState::Expedited)
                        else {
                            return Err(AbortCode::GeneralError);
                        };
                        Ok(Step::Done(reassembler.into_data()))
                    }
                }
            }
            (
                ModeState::UploadInitiate {
                    block_size: Some(block_size),
                },
                SdoResponse::ConfirmBlockUpload {
                    sc,
                    s,
                    index,
                    sub,
                    size,
                },
            ) => {
                initiate_matches(index, sub)?;
                let size = s.then_some(size);
                let receiver = BlockReceiver::new(*block_size, size, None).map_err(block_abort)?;
                ctx.total_size = size;
                ctx.mode = ModeState::BlockReceive(receiver);
                self.crc_enabled = self.config.crc && sc;
                self.mode_selected(TransferMode::Block);
                self.send(SdoRequest::StartBlockUpload.to_bytes(), send);
                Ok(Step::Continue)
            }
            (ModeState::BlockReceive(_), SdoResponse::ConfirmBlockUpload { .. }) => Ok(Step::Ignore),
            (ModeState::BlockReceive(_), SdoResponse::EndBlockUpload { n, crc }) => {
                let ModeState::BlockReceive(receiver) =
                    core::mem::replace(&mut ctx.mode, ModeState::Expedited)
                else {
                    return Err(AbortCode::GeneralError);
                };
                let crc = self.crc_enabled.then_some(crc);
                let data = receiver.finish(n, crc).map_err(block_abort)?;
                self.send(SdoRequest::EndBlockUpload.to_bytes(), send);
                Ok(Step::Done(data))
            }

            // A response which belongs to a different direction or mode
            _ => Err(AbortCode::InvalidCommandSpecifier),
        }
    }

    fn send_segments(&mut self, segments: &[BlockSegment], send: &mut dyn FnMut([u8; 8])) {
        for segment in segments {
            self.send(segment.to_bytes(), send);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{block::crc, observer::RecordingObserver};

    const INDEX: u16 = 0x2000;

    struct Harness {
        machine: ClientMachine,
        events: RecordingObserver,
    }

    impl Harness {
        fn new(config: SdoClientConfig) -> Self {
            let events = RecordingObserver::new();
            Self {
                machine: ClientMachine::with_observer(config, Box::new(events.clone())),
                events,
            }
        }

        fn respond(&mut self, resp: SdoResponse) -> (TransferStatus, Vec<[u8; 8]>) {
            let mut sent = Vec::new();
            let status = self.machine.handle_frame(&resp.to_bytes(), &mut |f| sent.push(f));
            (status, sent)
        }

        fn segment(&mut self, seg: BlockSegment) -> (TransferStatus, Vec<[u8; 8]>) {
            let mut sent = Vec::new();
            let status = self.machine.handle_frame(&seg.to_bytes(), &mut |f| sent.push(f));
            (status, sent)
        }
    }

    fn req(frame: &[u8; 8]) -> SdoRequest {
        SdoRequest::try_from(frame.as_slice()).unwrap()
    }

    #[test]
    fn test_expedited_download() {
        let mut h = Harness::new(SdoClientConfig::default());
        let mut sent = Vec::new();
        let handle = h
            .machine
            .request_download(0x1234, 1, &0xAABBCCDDu32.to_le_bytes(), &mut |f| sent.push(f))
            .unwrap();
        assert_eq!(ObjectId::new(0x1234, 1), handle.id);
        assert_eq!(
            vec![SdoRequest::expedited_download(0x1234, 1, &[0xDD, 0xCC, 0xBB, 0xAA])
                .unwrap()
                .to_bytes()],
            sent
        );

        // Only one transfer at a time
        assert_eq!(
            Err(MachineError::Busy),
            h.machine.request_upload(0x1234, 2, &mut |_| ())
        );

        let (status, sent) = h.respond(SdoResponse::download_acknowledge(0x1234, 1));
        assert_eq!(TransferStatus::Complete(vec![]), status);
        assert!(sent.is_empty());
        assert!(h.machine.is_idle());

        // Afterwards, frames are ignored
        let (status, _) = h.respond(SdoResponse::download_acknowledge(0x1234, 1));
        assert_eq!(TransferStatus::Idle, status);
    }

    #[test]
    fn test_segmented_upload() {
        let mut h = Harness::new(SdoClientConfig::default());
        let data = Vec::from_iter(0..20u8);
        let mut sent = Vec::new();
        h.machine
            .request_upload(INDEX, 0, &mut |f| sent.push(f))
            .unwrap();
        assert_eq!(SdoRequest::initiate_upload(INDEX, 0), req(&sent[0]));

        let (status, sent) = h.respond(SdoResponse::upload_acknowledge(INDEX, 0, 20));
        assert_eq!(TransferStatus::InProgress, status);
        assert_eq!(vec![SdoRequest::upload_segment_request(false).to_bytes()], sent);

        let (_, sent) = h.respond(SdoResponse::upload_segment(false, false, &data[0..7]));
        assert_eq!(vec![SdoRequest::upload_segment_request(true).to_bytes()], sent);
        assert_eq!(Some(true), h.machine.context().unwrap().toggle());

        // A stale segment changes nothing
        let progress = h.machine.progress();
        let (status, sent) = h.respond(SdoResponse::upload_segment(false, false, &data[0..7]));
        assert_eq!(TransferStatus::InProgress, status);
        assert!(sent.is_empty());
        assert_eq!(7, h.machine.context().unwrap().bytes_transferred());
        assert_eq!(progress, h.machine.progress());
        h.respond(SdoResponse::upload_acknowledge(INDEX, 0, 20));
        assert_eq!(progress, h.machine.progress());

        let (_, sent) = h.respond(SdoResponse::upload_segment(true, false, &data[7..14]));
        assert_eq!(vec![SdoRequest::upload_segment_request(false).to_bytes()], sent);
        assert_ne!(progress, h.machine.progress());
        let (status, sent) = h.respond(SdoResponse::upload_segment(false, true, &data[14..20]));
        assert_eq!(TransferStatus::Complete(data), status);
        assert!(sent.is_empty());
        assert!(h.machine.is_idle());
    }

    #[test]
    fn test_segmented_download() {
        let mut h = Harness::new(SdoClientConfig::default());
        let data = Vec::from_iter(0..10u8);
        let mut sent = Vec::new();
        h.machine
            .request_download(INDEX, 0, &data, &mut |f| sent.push(f))
            .unwrap();
        assert_eq!(
            SdoRequest::initiate_download(INDEX, 0, Some(10)),
            req(&sent[0])
        );

        let (_, sent) = h.respond(SdoResponse::download_acknowledge(INDEX, 0));
        assert_eq!(
            vec![SdoRequest::download_segment(false, false, &data[0..7]).to_bytes()],
            sent
        );
        // Repeated initiate response
        let (status, sent) = h.respond(SdoResponse::download_acknowledge(INDEX, 0));
        assert_eq!(TransferStatus::InProgress, status);
        assert!(sent.is_empty());

        let (_, sent) = h.respond(SdoResponse::download_segment_acknowledge(false));
        assert_eq!(
            vec![SdoRequest::download_segment(true, true, &data[7..]).to_bytes()],
            sent
        );
        // Stale ack
        let (status, sent) = h.respond(SdoResponse::download_segment_acknowledge(false));
        assert_eq!(TransferStatus::InProgress, status);
        assert!(sent.is_empty());

        let (status, _) = h.respond(SdoResponse::download_segment_acknowledge(true));
        assert_eq!(TransferStatus::Complete(vec![]), status);
    }

    #[test]
    fn test_empty_download_is_segmented() {
        let mut h = Harness::new(SdoClientConfig {
            prefer_block: true,
            ..Default::default()
        });
        let mut sent = Vec::new();
        h.machine
            .request_download(INDEX, 0, &[], &mut |f| sent.push(f))
            .unwrap();
        assert_eq!(SdoRequest::initiate_download(INDEX, 0, Some(0)), req(&sent[0]));
        let (_, sent) = h.respond(SdoResponse::download_acknowledge(INDEX, 0));
        assert_eq!(vec![SdoRequest::download_segment(false, true, &[]).to_bytes()], sent);
        let (status, _) = h.respond(SdoResponse::download_segment_acknowledge(false));
        assert_eq!(TransferStatus::Complete(vec![]), status);
    }

    #[test]
    fn test_server_abort() {
        let mut h = Harness::new(SdoClientConfig::default());
        h.machine.request_upload(INDEX, 1, &mut |_| ()).unwrap();

        // An abort for some other object is not ours
        let (status, _) = h.respond(SdoResponse::abort(0x3000, 0, AbortCode::GeneralError));
        assert_eq!(TransferStatus::InProgress, status);

        let (status, sent) = h.respond(SdoResponse::Abort {
            index: INDEX,
            sub: 1,
            abort_code: 0x1234_5678,
        });
        assert_eq!(
            TransferStatus::Aborted(ClientAbort::Server {
                index: INDEX,
                sub: 1,
                code: RawAbortCode::Unknown(0x1234_5678),
            }),
            status
        );
        assert!(sent.is_empty());
        assert!(h.machine.is_idle());
        assert!(h.events.events().iter().any(|e| matches!(
            e,
            TransferEvent::Aborted {
                remote: true,
                ..
            }
        )));

        // A broadcast abort also ends the transfer
        h.machine.request_upload(INDEX, 1, &mut |_| ()).unwrap();
        let (status, _) = h.respond(SdoResponse::abort(0, 0, AbortCode::GeneralError));
        assert!(matches!(status, TransferStatus::Aborted(_)));
    }

    #[test]
    fn test_protocol_violation() {
        let mut h = Harness::new(SdoClientConfig::default());
        h.machine.request_upload(INDEX, 1, &mut |_| ()).unwrap();
        let (status, sent) = h.respond(SdoResponse::download_segment_acknowledge(false));
        assert_eq!(
            TransferStatus::Aborted(ClientAbort::Local {
                code: AbortCode::InvalidCommandSpecifier
            }),
            status
        );
        assert_eq!(
            vec![SdoRequest::abort(INDEX, 1, AbortCode::InvalidCommandSpecifier).to_bytes()],
            sent
        );
        assert!(h.machine.is_idle());

        // Initiate response for the wrong object
        h.machine.request_upload(INDEX, 1, &mut |_| ()).unwrap();
        let (status, _) = h.respond(SdoResponse::expedited_upload(INDEX, 2, &[1]).unwrap());
        assert!(matches!(status, TransferStatus::Aborted(ClientAbort::Local { .. })));
    }

    #[test]
    fn test_upload_size_mismatch() {
        let mut h = Harness::new(SdoClientConfig::default());
        h.machine.request_upload(INDEX, 1, &mut |_| ()).unwrap();
        h.respond(SdoResponse::upload_acknowledge(INDEX, 1, 10));
        let (status, sent) = h.respond(SdoResponse::upload_segment(false, true, &[1, 2, 3]));
        assert_eq!(
            TransferStatus::Aborted(ClientAbort::Local {
                code: AbortCode::DataTypeMismatch
            }),
            status
        );
        assert_eq!(
            vec![SdoRequest::abort(INDEX, 1, AbortCode::DataTypeMismatch).to_bytes()],
            sent
        );
    }

    #[test]
    fn test_retransmit_and_abort() {
        let mut h = Harness::new(SdoClientConfig::default());
        let mut sent = Vec::new();
        assert!(!h.machine.retransmit(&mut |f| sent.push(f)));

        h.machine
            .request_download(INDEX, 0, &[0; 10], &mut |f| sent.push(f))
            .unwrap();
        h.machine.handle_frame(
            &SdoResponse::download_acknowledge(INDEX, 0).to_bytes(),
            &mut |f| sent.push(f),
        );
        assert!(h.machine.retransmit(&mut |f| sent.push(f)));
        assert_eq!(3, sent.len());
        assert_eq!(sent[1], sent[2]);

        h.machine.abort(AbortCode::SdoTimeout, &mut |f| sent.push(f));
        assert_eq!(
            SdoRequest::abort(INDEX, 0, AbortCode::SdoTimeout),
            req(&sent[3])
        );
        assert!(h.machine.is_idle());
    }

    #[test]
    fn test_block_download() {
        let mut h = Harness::new(SdoClientConfig {
            prefer_block: true,
            ..Default::default()
        });
        let data = Vec::from_iter(0..30u8);
        let mut sent = Vec::new();
        h.machine
            .request_download(INDEX, 0, &data, &mut |f| sent.push(f))
            .unwrap();
        assert_eq!(
            SdoRequest::initiate_block_download(INDEX, 0, true, 30),
            req(&sent[0])
        );

        // The server picks a block size of 3
        let (_, sent) = h.respond(SdoResponse::block_download_acknowledge(true, INDEX, 0, 3));
        assert_eq!(3, sent.len());
        assert_eq!(1, sent[0][0]);
        assert_eq!(3, sent[2][0]);

        // Only the first segment made it
        let (_, sent) = h.respond(SdoResponse::ConfirmBlock {
            ackseq: 1,
            blksize: 3,
        });
        assert_eq!(vec![2, 3], sent.iter().map(|f| f[0]).collect::<Vec<_>>());

        let (_, sent) = h.respond(SdoResponse::ConfirmBlock {
            ackseq: 3,
            blksize: 3,
        });
        // 5 segments in all; the last one is flagged
        assert_eq!(vec![1, 0x82], sent.iter().map(|f| f[0]).collect::<Vec<_>>());

        let (_, sent) = h.respond(SdoResponse::ConfirmBlock {
            ackseq: 2,
            blksize: 3,
        });
        assert_eq!(
            vec![SdoRequest::end_block_download(5, crc(&data)).to_bytes()],
            sent
        );
        let (status, _) = h.respond(SdoResponse::ConfirmBlockDownloadEnd);
        assert_eq!(TransferStatus::Complete(vec![]), status);
    }

    #[test]
    fn test_block_upload() {
        let mut h = Harness::new(SdoClientConfig {
            prefer_block: true,
            block_size: 2,
            ..Default::default()
        });
        let data = Vec::from_iter(0..20u8);
        let mut sent = Vec::new();
        h.machine
            .request_upload(INDEX, 0, &mut |f| sent.push(f))
            .unwrap();
        assert_eq!(
            SdoRequest::initiate_block_upload(INDEX, 0, true, 2, 0),
            req(&sent[0])
        );

        let (_, sent) = h.respond(SdoResponse::block_upload_acknowledge(true, INDEX, 0, 20));
        assert_eq!(vec![SdoRequest::StartBlockUpload.to_bytes()], sent);

        let seg = |c, seqnum, range: core::ops::Range<usize>| {
            let mut chunk = [0; 7];
            chunk[..range.len()].copy_from_slice(&data[range]);
            BlockSegment {
                c,
                seqnum,
                data: chunk,
            }
        };
        let ack = |ackseq| {
            SdoRequest::ConfirmBlock {
                ackseq,
                blksize: 2,
            }
            .to_bytes()
        };

        let (_, sent) = h.segment(seg(false, 1, 0..7));
        assert!(sent.is_empty());
        let (_, sent) = h.segment(seg(false, 2, 7..14));
        assert_eq!(vec![ack(2)], sent);

        // Nothing of the next sub-block has arrived, so the last ack is repeated
        let mut sent = Vec::new();
        h.machine.retransmit(&mut |f| sent.push(f));
        assert_eq!(vec![ack(2)], sent);
        // A repeat of the closing segment is acknowledged again
        let (_, sent) = h.segment(seg(false, 2, 7..14));
        assert_eq!(vec![ack(2)], sent);

        let (_, sent) = h.segment(seg(true, 1, 14..20));
        assert_eq!(vec![ack(1)], sent);

        let (status, sent) = h.respond(SdoResponse::EndBlockUpload {
            n: 1,
            crc: crc(&data),
        });
        assert_eq!(vec![SdoRequest::EndBlockUpload.to_bytes()], sent);
        assert_eq!(TransferStatus::Complete(data), status);
    }

    #[test]
    fn test_block_upload_partial_retransmit() {
        let mut h = Harness::new(SdoClientConfig {
            block_size: 3,
            ..Default::default()
        });
        let data = Vec::from_iter(100..118u8);
        h.machine
            .request_block_upload(INDEX, 0, &mut |_| ())
            .unwrap();
        h.respond(SdoResponse::block_upload_acknowledge(false, INDEX, 0, 18));

        let mut chunks = [[0u8; 7]; 3];
        for (i, chunk) in data.chunks(7).enumerate() {
            chunks[i][..chunk.len()].copy_from_slice(chunk);
        }
        let seg = |c, seqnum: u8| BlockSegment {
            c,
            seqnum,
            data: chunks[seqnum as usize - 1],
        };

        h.segment(seg(false, 1));
        // Segment 2 is lost, so segment 3 closes the sub-block early
        let (_, sent) = h.segment(seg(true, 3));
        assert_eq!(
            vec![SdoRequest::ConfirmBlock {
                ackseq: 1,
                blksize: 3
            }
            .to_bytes()],
            sent
        );

        // The re-sent tail loses segment 3 as well; a retransmit acks only what is held
        h.segment(seg(false, 2));
        let mut sent = Vec::new();
        assert!(h.machine.retransmit(&mut |f| sent.push(f)));
        assert_eq!(
            vec![SdoRequest::ConfirmBlock {
                ackseq: 2,
                blksize: 3
            }
            .to_bytes()],
            sent
        );

        let (_, sent) = h.segment(seg(true, 3));
        assert_eq!(
            vec![SdoRequest::ConfirmBlock {
                ackseq: 3,
                blksize: 3
            }
            .to_bytes()],
            sent
        );
        // CRC is not in use, so the CRC field is ignored
        let (status, _) = h.respond(SdoResponse::EndBlockUpload { n: 3, crc: 0 });
        assert_eq!(TransferStatus::Complete(data), status);
    }

    #[test]
    fn test_block_upload_crc_error() {
        let mut h = Harness::new(SdoClientConfig::default());
        h.machine
            .request_block_upload(INDEX, 0, &mut |_| ())
            .unwrap();
        h.respond(SdoResponse::block_upload_acknowledge(true, INDEX, 0, 3));
        h.segment(BlockSegment {
            c: true,
            seqnum: 1,
            data: [1, 2, 3, 0, 0, 0, 0],
        });
        let (status, sent) = h.respond(SdoResponse::EndBlockUpload { n: 4, crc: 0 });
        assert_eq!(
            TransferStatus::Aborted(ClientAbort::Local {
                code: AbortCode::CrcError
            }),
            status
        );
        assert_eq!(
            vec![SdoRequest::abort(INDEX, 0, AbortCode::CrcError).to_bytes()],
            sent
        );
    }

    #[test]
    fn test_block_upload_protocol_switch() {
        let mut h = Harness::new(SdoClientConfig {
            prefer_block: true,
            pst: 10,
            ..Default::default()
        });
        h.machine.request_upload(INDEX, 0, &mut |_| ()).unwrap();
        let (status, _) = h.respond(SdoResponse::expedited_upload(INDEX, 0, &[9, 8]).unwrap());
        assert_eq!(TransferStatus::Complete(vec![9, 8]), status);

        h.machine.request_upload(INDEX, 0, &mut |_| ()).unwrap();
        let (_, sent) = h.respond(SdoResponse::upload_acknowledge(INDEX, 0, 8));
        assert_eq!(vec![SdoRequest::upload_segment_request(false).to_bytes()], sent);
    }
}
