use crate::common::{
    block::{AckOutcome, BlockError, BlockEvent, BlockReceiver, BlockSender},
    objects::ObjectId,
    observer::{LogObserver, TransferEvent, TransferObserver},
    sdo::{
        is_abort_frame, AbortCode, BlockSegment, SdoRequest, SdoResponse, EXPEDITED_MAX,
        MAX_BLOCK_SIZE, SEGMENT_SIZE, UNAMBIGUOUS_BLOCK_SIZE,
    },
    segmented::{SegmentError, SegmentOutcome, SegmentReassembler, SegmentWriter},
    transfer::{BlockPhase, Direction, ModeState, Role, TransferContext},
};

use crate::object_dict::ObjectDictionary;

/// Number of microseconds to wait for a message before timing out an SDO transaction
///
/// Longer than a client with default settings keeps retrying (3 attempts of 50 ms), so the client
/// always gives up first.
const SDO_TIMEOUT_US: u32 = 200_000;

/// Largest value the server will buffer for a download, by default
const MAX_TRANSFER_SIZE: usize = 64 * 1024;

/// Tunables for an [`SdoServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoServerConfig {
    /// Segments per sub-block requested from clients during block downloads (1..=127)
    ///
    /// Above [`UNAMBIGUOUS_BLOCK_SIZE`], an initiate from another client which arrives in the
    /// middle of a sub-block may be read as a segment instead of being rejected as busy.
    pub block_size: u8,
    /// Abort an active transfer after this long without a request from the client
    ///
    /// Should exceed the client's total retry time (attempts times response timeout).
    pub timeout_us: u32,
    /// Largest download which will be accepted
    pub max_transfer_size: usize,
}

impl Default for SdoServerConfig {
    fn default() -> Self {
        Self {
            block_size: UNAMBIGUOUS_BLOCK_SIZE,
            timeout_us: SDO_TIMEOUT_US,
            max_transfer_size: MAX_TRANSFER_SIZE,
        }
    }
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

/// Outcome of processing one request while a transfer is active
enum Step {
    /// Transfer continues
    Continue,
    /// Transfer finished; the context is dropped
    Done(Option<ObjectId>),
}

/// Implements an SDO server
///
/// A single SDO server can be controlled by a single SDO client (at one time). This struct wraps up
/// the state and implements handling of SDO requests. A node implementing multiple SDO servers can
/// instantiate multiple instances of `SdoServer` to track each.
///
/// The server is driven by two calls: [`SdoServer::handle_frame`] for every request received
/// from the client, and [`SdoServer::process`] periodically to run the timeout. Responses are
/// passed to the `send` callback as raw 8-byte payloads; the caller adds the COB-ID.
pub struct SdoServer {
    config: SdoServerConfig,
    ctx: Option<TransferContext>,
    /// The request which opened the active transfer, kept until the transfer makes progress
    opening: Option<[u8; 8]>,
    /// Most recent frame sent, for answering retransmitted requests
    last_response: Option<[u8; 8]>,
    /// True when both sides agreed to check a CRC on block transfers
    crc_enabled: bool,
    timer_us: u32,
    observer: Box<dyn TransferObserver>,
}

impl core::fmt::Debug for SdoServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoServer")
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .field("timer_us", &self.timer_us)
            .finish_non_exhaustive()
    }
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new(SdoServerConfig::default())
    }
}

impl SdoServer {
    /// Create a new SDO server which logs its events
    pub fn new(config: SdoServerConfig) -> Self {
        Self::with_observer(config, Box::new(LogObserver))
    }

    /// Create a new SDO server reporting events to `observer`
    pub fn with_observer(config: SdoServerConfig, observer: Box<dyn TransferObserver>) -> Self {
        let block_size = config.block_size.clamp(1, MAX_BLOCK_SIZE);
        Self {
            config: SdoServerConfig {
                block_size,
                ..config
            },
            ctx: None,
            opening: None,
            last_response: None,
            crc_enabled: false,
            timer_us: 0,
            observer,
        }
    }

    /// The active transfer, if any
    pub fn context(&self) -> Option<&TransferContext> {
        self.ctx.as_ref()
    }

    /// Returns true if no transfer is active
    pub fn is_idle(&self) -> bool {
        self.ctx.is_none()
    }

    /// Handle an incoming SDO request
    ///
    /// This will process the request, update server state and the object dictionary accordingly,
    /// and send any responses. Returns the address of the updated object when a download is
    /// completed.
    pub fn handle_frame(
        &mut self,
        frame: &[u8],
        od: &dyn ObjectDictionary,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Option<ObjectId> {
        if let Some(ModeState::BlockReceive(receiver)) = self.ctx.as_mut().map(|c| &mut c.mode) {
            if !is_abort_frame(frame) && !initiate_outside_sub_block(frame, receiver.block_size()) {
                let in_sub_block = !receiver.is_complete();
                match BlockSegment::try_from(frame) {
                    Ok(segment) => {
                        let event = receiver.accept(&segment);
                        // After the last segment, only a repeated closing segment is still a
                        // segment; anything else is a request
                        if in_sub_block || matches!(event, Ok(BlockEvent::AckDue { .. })) {
                            self.timer_us = 0;
                            self.block_event(event, send);
                            return None;
                        }
                    }
                    Err(error) if in_sub_block => {
                        self.observer.on_event(&TransferEvent::Malformed {
                            role: Role::Server,
                            error,
                        });
                        return None;
                    }
                    Err(_) => (),
                }
            }
        }

        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(error) => {
                self.observer.on_event(&TransferEvent::Malformed {
                    role: Role::Server,
                    error,
                });
                return None;
            }
        };

        let Some(mut ctx) = self.ctx.take() else {
            return self.idle(req, frame, od, send);
        };
        self.timer_us = 0;
        let id = ctx.object_id();

        if let SdoRequest::Abort { abort_code, .. } = req {
            self.observer.on_event(&TransferEvent::Aborted {
                role: Role::Server,
                id,
                code: abort_code.into(),
                remote: true,
            });
            self.reset();
            return None;
        }

        if let Some((index, sub)) = req.initiate_address() {
            self.ctx = Some(ctx);
            self.busy(index, sub, frame, send);
            return None;
        }

        match self.step(&mut ctx, req, od, send) {
            Ok(Step::Continue) => {
                self.ctx = Some(ctx);
                None
            }
            Ok(Step::Done(updated)) => {
                self.reset();
                updated
            }
            Err(code) => {
                self.abort_transfer(id, code, send);
                None
            }
        }
    }

    /// Run the transfer timeout
    ///
    /// Should be called periodically with the time elapsed since the previous call. An active
    /// transfer is aborted once the client has been silent for longer than the configured
    /// timeout.
    pub fn process(&mut self, elapsed_us: u32, send: &mut dyn FnMut([u8; 8])) {
        if self.ctx.is_none() {
            return;
        }
        self.timer_us = self.timer_us.saturating_add(elapsed_us);
        if self.timer_us > self.config.timeout_us {
            self.abort(AbortCode::SdoTimeout, send);
        }
    }

    fn respond(&mut self, response: SdoResponse, send: &mut dyn FnMut([u8; 8])) {
        let bytes = response.to_bytes();
        self.last_response = Some(bytes);
        send(bytes);
    }

    fn resend_last(&mut self, send: &mut dyn FnMut([u8; 8])) {
        if let Some(bytes) = self.last_response {
            if let Ok(response) = SdoResponse::try_from(bytes.as_slice()) {
                self.observer.on_event(&TransferEvent::Retransmit {
                    role: Role::Server,
                    opcode: response.opcode(),
                });
            }
            send(bytes);
        }
    }

    fn reset(&mut self) {
        self.ctx = None;
        self.opening = None;
        self.last_response = None;
        self.crc_enabled = false;
        self.timer_us = 0;
    }

    fn abort(&mut self, code: AbortCode, send: &mut dyn FnMut([u8; 8])) {
        if let Some(ctx) = self.ctx.take() {
            self.abort_transfer(ctx.object_id(), code, send);
        }
        self.reset();
    }

    fn abort_transfer(&mut self, id: ObjectId, code: AbortCode, send: &mut dyn FnMut([u8; 8])) {
        self.observer.on_event(&TransferEvent::Aborted {
            role: Role::Server,
            id,
            code: code.into(),
            remote: false,
        });
        send(SdoResponse::abort(id.index, id.sub, code).to_bytes());
        self.reset();
    }

    /// Reject a request without creating a transfer
    fn reject(&mut self, index: u16, sub: u8, code: AbortCode, send: &mut dyn FnMut([u8; 8])) {
        self.abort_transfer(ObjectId::new(index, sub), code, send);
    }

    fn busy(&mut self, index: u16, sub: u8, frame: &[u8], send: &mut dyn FnMut([u8; 8])) {
        // The client may not have seen our initiate response
        if self.opening.is_some_and(|opening| opening.as_slice() == frame) {
            self.resend_last(send);
            return;
        }
        self.observer.on_event(&TransferEvent::Busy {
            id: ObjectId::new(index, sub),
        });
        send(SdoResponse::abort(index, sub, AbortCode::ResourceNotAvailable).to_bytes());
    }

    fn start(&mut self, ctx: TransferContext, frame: &[u8]) {
        self.observer.on_event(&TransferEvent::Started {
            role: Role::Server,
            direction: ctx.direction,
            id: ctx.object_id(),
        });
        if let Some(mode) = ctx.mode.mode() {
            self.observer.on_event(&TransferEvent::ModeSelected {
                role: Role::Server,
                mode,
            });
        }
        let mut opening = [0; 8];
        opening.copy_from_slice(frame);
        self.opening = Some(opening);
        self.timer_us = 0;
        self.ctx = Some(ctx);
    }

    fn complete(&mut self, id: ObjectId, size: usize) {
        self.observer.on_event(&TransferEvent::Completed {
            role: Role::Server,
            id,
            size,
        });
    }

    fn idle(
        &mut self,
        req: SdoRequest,
        frame: &[u8],
        od: &dyn ObjectDictionary,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Option<ObjectId> {
        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let id = ObjectId::new(index, sub);
                if e {
                    // Doing an expedited download
                    let dl_size = if s { EXPEDITED_MAX - n as usize } else { EXPEDITED_MAX };
                    if let Err(err) = od.write(index, sub, &data[0..dl_size]) {
                        self.reject(index, sub, err.into(), send);
                        return None;
                    }
                    self.respond(SdoResponse::download_acknowledge(index, sub), send);
                    self.complete(id, dl_size);
                    self.last_response = None;
                    Some(id)
                } else {
                    // starting a segmented download
                    let size = s.then(|| u32::from_le_bytes(data));
                    if let Err(code) = self.check_download(od, index, sub, size) {
                        self.reject(index, sub, code, send);
                        return None;
                    }
                    let reassembler =
                        SegmentReassembler::new(size, Some(self.config.max_transfer_size));
                    let ctx = TransferContext::new(
                        Role::Server,
                        Direction::Download,
                        id,
                        ModeState::SegmentedReceive(reassembler),
                    )
                    .with_size(size);
                    self.start(ctx, frame);
                    self.respond(SdoResponse::download_acknowledge(index, sub), send);
                    None
                }
            }
            SdoRequest::InitiateUpload { index, sub } => {
                self.start_upload(index, sub, frame, od, send);
                None
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let size = s.then_some(size);
                if let Err(code) = self.check_download(od, index, sub, size) {
                    self.reject(index, sub, code, send);
                    return None;
                }
                let receiver = match BlockReceiver::new(
                    self.config.block_size,
                    size,
                    Some(self.config.max_transfer_size),
                ) {
                    Ok(receiver) => receiver,
                    Err(err) => {
                        self.reject(index, sub, block_abort(err), send);
                        return None;
                    }
                };
                let ctx = TransferContext::new(
                    Role::Server,
                    Direction::Download,
                    ObjectId::new(index, sub),
                    ModeState::BlockReceive(receiver),
                )
                .with_size(size);
                self.start(ctx, frame);
                self.crc_enabled = cc;
                self.respond(
                    SdoResponse::block_download_acknowledge(
                        true,
                        index,
                        sub,
                        self.config.block_size,
                    ),
                    send,
                );
                None
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                let data = match od.read(index, sub) {
                    Ok(data) => data,
                    Err(err) => {
                        self.reject(index, sub, err.into(), send);
                        return None;
                    }
                };
                if pst > 0 && data.len() <= pst as usize {
                    // Small enough that the client would rather have a regular upload
                    self.upload_with(index, sub, data, frame, send);
                    return None;
                }
                let size = data.len() as u32;
                let sender = match BlockSender::new(data, blksize) {
                    Ok(sender) => sender,
                    Err(err) => {
                        self.reject(index, sub, block_abort(err), send);
                        return None;
                    }
                };
                let ctx = TransferContext::new(
                    Role::Server,
                    Direction::Upload,
                    ObjectId::new(index, sub),
                    ModeState::BlockSend {
                        sender,
                        phase: BlockPhase::Initiate,
                    },
                )
                .with_size(Some(size));
                self.start(ctx, frame);
                self.crc_enabled = cc;
                self.respond(
                    SdoResponse::block_upload_acknowledge(true, index, sub, size),
                    send,
                );
                None
            }
            SdoRequest::Abort { .. } => None,
            _ => {
                self.observer.on_event(&TransferEvent::Ignored {
                    role: Role::Server,
                    opcode: req.opcode(),
                });
                None
            }
        }
    }

    fn check_download(
        &self,
        od: &dyn ObjectDictionary,
        index: u16,
        sub: u8,
        size: Option<u32>,
    ) -> Result<(), AbortCode> {
        od.check_write(index, sub, size.map(|s| s as usize))?;
        if size.is_some_and(|s| s as usize > self.config.max_transfer_size) {
            return Err(AbortCode::OutOfMemory);
        }
        Ok(())
    }

    fn start_upload(
        &mut self,
        index: u16,
        sub: u8,
        frame: &[u8],
        od: &dyn ObjectDictionary,
        send: &mut dyn FnMut([u8; 8]),
    ) {
        match od.read(index, sub) {
            Ok(data) => self.upload_with(index, sub, data, frame, send),
            Err(err) => self.reject(index, sub, err.into(), send),
        }
    }

    /// Answer an upload request with an expedited or segmented transfer of `data`
    fn upload_with(
        &mut self,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        frame: &[u8],
        send: &mut dyn FnMut([u8; 8]),
    ) {
        let id = ObjectId::new(index, sub);
        if let Ok(response) = SdoResponse::expedited_upload(index, sub, &data) {
            self.respond(response, send);
            self.complete(id, data.len());
            self.last_response = None;
            return;
        }

        let size = data.len() as u32;
        let ctx = TransferContext::new(
            Role::Server,
            Direction::Upload,
            id,
            ModeState::SegmentedSend(SegmentWriter::new(data)),
        )
        .with_size(Some(size));
        self.start(ctx, frame);
        self.respond(SdoResponse::upload_acknowledge(index, sub, size), send);
    }

    fn step(
        &mut self,
        ctx: &mut TransferContext,
        req: SdoRequest,
        od: &dyn ObjectDictionary,
        send: &mut dyn FnMut([u8; 8]),
    ) -> Result<Step, AbortCode> {
        let id = ctx.object_id();

        match (&mut ctx.mode, req) {
            (
                ModeState::SegmentedReceive(reassembler),
                SdoRequest::DownloadSegment { t, n, c, data },
            ) => {
                let len = SEGMENT_SIZE - n as usize;
                match reassembler.accept(t, c, &data[..len]).map_err(segment_abort)? {
                    SegmentOutcome::Duplicate => self.resend_last(send),
                    SegmentOutcome::InProgress => {
                        self.opening = None;
                        self.respond(SdoResponse::download_segment_acknowledge(t), send);
                    }
                    SegmentOutcome::Complete => {
                        let ModeState::SegmentedReceive(reassembler) = take_mode(ctx) else {
                            return Err(AbortCode::GeneralError);
                        };
                        let data = reassembler.into_data();
                        // Nothing is stored until the whole value has arrived
                        od.write(id.index, id.sub, &data)?;
                        self.respond(SdoResponse::download_segment_acknowledge(t), send);
                        self.complete(id, data.len());
                        return Ok(Step::Done(Some(id)));
                    }
                }
                Ok(Step::Continue)
            }
            (ModeState::SegmentedSend(writer), SdoRequest::ReqUploadSegment { t }) => {
                if t != writer.toggle() {
                    self.resend_last(send);
                    return Ok(Step::Continue);
                }
                let size = writer.len();
                let Some(segment) = writer.next_segment() else {
                    return Err(AbortCode::GeneralError);
                };
                self.opening = None;
                self.respond(
                    SdoResponse::upload_segment(segment.toggle, segment.complete, &segment.data),
                    send,
                );
                if segment.complete {
                    self.complete(id, size);
                    Ok(Step::Done(None))
                } else {
                    Ok(Step::Continue)
                }
            }
            (ModeState::BlockReceive(_), SdoRequest::EndBlockDownload { n, crc }) => {
                let ModeState::BlockReceive(receiver) = take_mode(ctx) else {
                    return Err(AbortCode::GeneralError);
                };
                let crc = self.crc_enabled.then_some(crc);
                let data = receiver.finish(n, crc).map_err(block_abort)?;
                od.write(id.index, id.sub, &data)?;
                self.respond(SdoResponse::ConfirmBlockDownloadEnd, send);
                self.complete(id, data.len());
                Ok(Step::Done(Some(id)))
            }
            (ModeState::BlockSend { sender, phase }, SdoRequest::StartBlockUpload) => {
                if *phase == BlockPhase::End {
                    return Err(AbortCode::InvalidCommandSpecifier);
                }
                // A repeated start means the first sub-block was lost
                *phase = BlockPhase::SubBlock;
                self.opening = None;
                self.send_segments(&sender.sub_block(), send);
                Ok(Step::Continue)
            }
            (
                ModeState::BlockSend { sender, phase },
                SdoRequest::ConfirmBlock { ackseq, blksize },
            ) => match phase {
                BlockPhase::Initiate => Err(AbortCode::InvalidCommandSpecifier),
                BlockPhase::SubBlock => {
                    match sender.acknowledge(ackseq, blksize).map_err(block_abort)? {
                        AckOutcome::Retransmit => {
                            self.observer.on_event(&TransferEvent::Retransmit {
                                role: Role::Server,
                                opcode: req.opcode(),
                            });
                            self.send_segments(&sender.sub_block(), send);
                        }
                        AckOutcome::NextSubBlock => {
                            self.send_segments(&sender.sub_block(), send);
                        }
                        AckOutcome::Finished => {
                            let (n, crc) = sender.end_frame_info();
                            *phase = BlockPhase::End;
                            self.respond(SdoResponse::EndBlockUpload { n, crc }, send);
                        }
                    }
                    Ok(Step::Continue)
                }
                BlockPhase::End => {
                    // The client did not get our end frame
                    self.resend_last(send);
                    Ok(Step::Continue)
                }
            },
            (ModeState::BlockSend { sender, phase }, SdoRequest::EndBlockUpload) => {
                if *phase != BlockPhase::End {
                    return Err(AbortCode::InvalidCommandSpecifier);
                }
                self.complete(id, sender.len());
                Ok(Step::Done(None))
            }
            (_, req) => {
                self.observer.on_event(&TransferEvent::Ignored {
                    role: Role::Server,
                    opcode: req.opcode(),
                });
                Err(AbortCode::InvalidCommandSpecifier)
            }
        }
    }

    fn send_segments(&mut self, segments: &[BlockSegment], send: &mut dyn FnMut([u8; 8])) {
        for segment in segments {
            let bytes = segment.to_bytes();
            self.last_response = Some(bytes);
            send(bytes);
        }
    }

    fn block_event(
        &mut self,
        event: Result<BlockEvent, BlockError>,
        send: &mut dyn FnMut([u8; 8]),
    ) {
        match event {
            Ok(BlockEvent::Continue) => self.opening = None,
            Ok(BlockEvent::Ignored) => (),
            Ok(BlockEvent::AckDue { ackseq, .. }) => {
                self.opening = None;
                let blksize = self.config.block_size;
                self.respond(SdoResponse::ConfirmBlock { ackseq, blksize }, send);
            }
            Err(err) => self.abort(block_abort(err), send),
        }
    }
}

/// True if `frame` is an initiate request which cannot be a segment of a sub-block of
/// `block_size` segments
fn initiate_outside_sub_block(frame: &[u8], block_size: u8) -> bool {
    frame.first().is_some_and(|b| b & 0x7f > block_size)
        && SdoRequest::try_from(frame).is_ok_and(|req| req.initiate_address().is_some())
}

fn take_mode(ctx: &mut TransferContext) -> ModeState {
    core::mem::replace(&mut ctx.mode, ModeState::Expedited)
}
