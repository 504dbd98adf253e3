//! SDO server
//!
//! Serves expedited, segmented, and block-mode transfers against the local
//! object dictionary. One channel exists per configured server parameter set
//! (plus the default node-ID pair); each channel talks to a single client at
//! a time.

use canstack_common::messages::{CanFrame, SDO_REQUEST_BASE, SDO_RESPONSE_BASE};
use canstack_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};
use canstack_common::types::AccessType;
use canstack_eds::{DataObject, Eds, LimitViolation};
use crc16::State as CrcState;
use crc16::XMODEM;
use log::debug;

use crate::ctx::Ctx;

/// Number of segments per block; always the protocol maximum
const BLKSIZE: u8 = 127;

/// Idle time after which an open transfer is aborted
const SERVER_TIMEOUT_US: u64 = 30_000;

/// Initial pacing interval for block upload segments
const BLOCK_INTERVAL_START_US: u64 = 1000;
/// Upper bound for the pacing interval after send failures
const BLOCK_INTERVAL_MAX_US: u64 = 1_000_000;

/// Look up the leaf object addressed by an SDO request
fn lookup<'a>(eds: &'a Eds, index: u16, sub: u8) -> Result<&'a DataObject, AbortCode> {
    let entry = eds.get_entry(index).ok_or(AbortCode::NoSuchObject)?;
    if entry.is_aggregate() {
        entry.sub(sub).ok_or(AbortCode::NoSuchSubIndex)
    } else if sub == 0 {
        Ok(entry)
    } else {
        Err(AbortCode::NoSuchSubIndex)
    }
}

fn check_readable(object: &DataObject) -> Result<(), AbortCode> {
    if !object.access_type().is_readable() {
        return Err(AbortCode::WriteOnly);
    }
    Ok(())
}

fn check_writable(object: &DataObject) -> Result<(), AbortCode> {
    match object.access_type() {
        AccessType::Rw | AccessType::Wo => Ok(()),
        AccessType::Ro | AccessType::Const => Err(AbortCode::ReadOnly),
    }
}

/// Verify a download size against the fixed width of the target's type
///
/// Variable-width types (strings, domains) accept any length.
fn validate_download_size(object: &DataObject, dl_size: usize) -> Result<(), AbortCode> {
    let Some(fixed) = object.data_type().and_then(|dt| dt.fixed_size()) else {
        return Ok(());
    };
    if dl_size < fixed {
        Err(AbortCode::DataTypeMismatchLengthLow)
    } else if dl_size > fixed {
        Err(AbortCode::DataTypeMismatchLengthHigh)
    } else {
        Ok(())
    }
}

/// Validate and store completed download data into the dictionary
fn store(eds: &mut Eds, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
    let object = lookup(eds, index, sub)?;
    check_writable(object)?;
    validate_download_size(object, data.len())?;
    match object.check_limits(data) {
        Some(LimitViolation::High) => return Err(AbortCode::ValueTooHigh),
        Some(LimitViolation::Low) => return Err(AbortCode::ValueTooLow),
        None => {}
    }
    let aggregate = eds.get_entry(index).is_some_and(|o| o.is_aggregate());
    let result = if aggregate {
        eds.set_raw_sub(index, sub, data)
    } else {
        eds.set_raw(index, data)
    };
    result.map_err(|_| AbortCode::GeneralError)
}

struct BlockDownload {
    index: u16,
    sub: u8,
    crc_enabled: bool,
    announced: Option<usize>,
    /// Bytes from fully acknowledged blocks
    data: Vec<u8>,
    /// Bytes from in-sequence segments of the current block
    block: Vec<u8>,
    expected_seq: u8,
    /// The accepted final segment's complete flag was seen
    finished: bool,
}

struct BlockUpload {
    index: u16,
    sub: u8,
    crc_enabled: bool,
    data: Vec<u8>,
    /// Offset of the current block's first byte
    pos: usize,
    /// Next segment sequence number to send (1-based)
    seq: u8,
    blksize: u8,
    interval_us: u64,
    next_segment_us: u64,
}

enum ServerState {
    Idle,
    DownloadSegments {
        index: u16,
        sub: u8,
        toggle: bool,
        data: Vec<u8>,
        announced: Option<usize>,
    },
    UploadSegments {
        index: u16,
        sub: u8,
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
    },
    BlockDownload(BlockDownload),
    /// Waiting for the end-of-transfer request after the final block
    BlockDownloadEnd(BlockDownload),
    /// Waiting for the client's start command
    BlockUploadStart(BlockUpload),
    /// Streaming segments of the current block
    BlockUploadStream(BlockUpload),
    /// Waiting for the client's block confirmation
    BlockUploadConfirm(BlockUpload),
    /// Waiting for the client's end-of-transfer confirmation
    BlockUploadEnd { index: u16, sub: u8 },
}

struct ServerChannel {
    cob_id_rx: u16,
    cob_id_tx: u16,
    state: ServerState,
    deadline_us: u64,
}

impl ServerChannel {
    fn new(cob_id_rx: u16, cob_id_tx: u16) -> Self {
        Self {
            cob_id_rx,
            cob_id_tx,
            state: ServerState::Idle,
            deadline_us: 0,
        }
    }

    fn respond(&mut self, response: SdoResponse, ctx: &mut Ctx) {
        ctx.send(response.to_frame(self.cob_id_tx));
    }

    fn abort(&mut self, index: u16, sub: u8, code: AbortCode, ctx: &mut Ctx) {
        debug!("SDO server aborting 0x{index:04X}sub{sub}: {code}");
        self.state = ServerState::Idle;
        self.respond(SdoResponse::abort(index, sub, code), ctx);
    }

    fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        self.deadline_us = ctx.now_us + SERVER_TIMEOUT_US;

        // During block reception, frames carry raw segments without a
        // command specifier
        if matches!(self.state, ServerState::BlockDownload(_)) {
            self.handle_block_segment(frame, ctx);
            return;
        }

        let request = match SdoRequest::try_from(frame.data()) {
            Ok(request) => request,
            Err(code) => {
                self.abort(0, 0, code, ctx);
                return;
            }
        };

        if let SdoRequest::Abort { index, sub, abort_code } = request {
            debug!(
                "SDO client aborted 0x{index:04X}sub{sub}: 0x{abort_code:08X}"
            );
            self.state = ServerState::Idle;
            return;
        }

        match std::mem::replace(&mut self.state, ServerState::Idle) {
            ServerState::Idle => self.handle_idle_request(request, ctx),
            ServerState::DownloadSegments {
                index,
                sub,
                toggle,
                data,
                announced,
            } => self.handle_download_segment(request, index, sub, toggle, data, announced, ctx),
            ServerState::UploadSegments {
                index,
                sub,
                toggle,
                data,
                pos,
            } => self.handle_upload_segment(request, index, sub, toggle, data, pos, ctx),
            ServerState::BlockDownload(_) => unreachable!("handled above"),
            ServerState::BlockDownloadEnd(block) => self.handle_block_download_end(request, block, ctx),
            ServerState::BlockUploadStart(block) => match request {
                SdoRequest::StartBlockUpload => {
                    self.state = ServerState::BlockUploadStream(block);
                }
                _ => self.abort(block.index, block.sub, AbortCode::InvalidCommandSpecifier, ctx),
            },
            ServerState::BlockUploadStream(block) | ServerState::BlockUploadConfirm(block) => {
                self.handle_block_upload_confirm(request, block, ctx)
            }
            ServerState::BlockUploadEnd { index, sub } => match request {
                SdoRequest::EndBlockUpload => {}
                _ => self.abort(index, sub, AbortCode::InvalidCommandSpecifier, ctx),
            },
        }
    }

    fn handle_idle_request(&mut self, request: SdoRequest, ctx: &mut Ctx) {
        match request {
            SdoRequest::InitiateUpload { index, sub } => {
                let data = match lookup(ctx.eds, index, sub)
                    .and_then(|object| check_readable(object).map(|()| object.raw().to_vec()))
                {
                    Ok(data) => data,
                    Err(code) => return self.abort(index, sub, code, ctx),
                };
                if data.len() <= 4 {
                    self.respond(SdoResponse::expedited_upload(index, sub, &data), ctx);
                } else {
                    self.respond(
                        SdoResponse::upload_acknowledge(index, sub, data.len() as u32),
                        ctx,
                    );
                    self.state = ServerState::UploadSegments {
                        index,
                        sub,
                        toggle: false,
                        data,
                        pos: 0,
                    };
                }
            }
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                if e {
                    let dl_size = 4 - n as usize;
                    match store(ctx.eds, index, sub, &data[0..dl_size]) {
                        Ok(()) => self.respond(SdoResponse::download_acknowledge(index, sub), ctx),
                        Err(code) => self.abort(index, sub, code, ctx),
                    }
                } else {
                    let announced = s.then(|| u32::from_le_bytes(data) as usize);
                    let check = lookup(ctx.eds, index, sub).and_then(|object| {
                        check_writable(object)?;
                        if let Some(announced) = announced {
                            validate_download_size(object, announced)?;
                        }
                        Ok(())
                    });
                    if let Err(code) = check {
                        return self.abort(index, sub, code, ctx);
                    }
                    self.respond(SdoResponse::download_acknowledge(index, sub), ctx);
                    self.state = ServerState::DownloadSegments {
                        index,
                        sub,
                        toggle: false,
                        data: Vec::new(),
                        announced,
                    };
                }
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let announced = s.then_some(size as usize);
                let check = lookup(ctx.eds, index, sub).and_then(|object| {
                    check_writable(object)?;
                    if let Some(announced) = announced {
                        validate_download_size(object, announced)?;
                    }
                    Ok(())
                });
                if let Err(code) = check {
                    return self.abort(index, sub, code, ctx);
                }
                self.respond(
                    SdoResponse::block_download_acknowledge(true, index, sub, BLKSIZE),
                    ctx,
                );
                self.state = ServerState::BlockDownload(BlockDownload {
                    index,
                    sub,
                    crc_enabled: cc,
                    announced,
                    data: Vec::new(),
                    block: Vec::new(),
                    expected_seq: 1,
                    finished: false,
                });
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst: _,
            } => {
                if blksize == 0 || blksize > 127 {
                    return self.abort(index, sub, AbortCode::InvalidBlockSize, ctx);
                }
                let data = match lookup(ctx.eds, index, sub)
                    .and_then(|object| check_readable(object).map(|()| object.raw().to_vec()))
                {
                    Ok(data) => data,
                    Err(code) => return self.abort(index, sub, code, ctx),
                };
                self.respond(
                    SdoResponse::block_upload_acknowledge(true, index, sub, data.len() as u32),
                    ctx,
                );
                self.state = ServerState::BlockUploadStart(BlockUpload {
                    index,
                    sub,
                    crc_enabled: cc,
                    data,
                    pos: 0,
                    seq: 1,
                    blksize,
                    interval_us: BLOCK_INTERVAL_START_US,
                    next_segment_us: ctx.now_us,
                });
            }
            _ => self.abort(0, 0, AbortCode::InvalidCommandSpecifier, ctx),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_download_segment(
        &mut self,
        request: SdoRequest,
        index: u16,
        sub: u8,
        toggle: bool,
        mut data: Vec<u8>,
        announced: Option<usize>,
        ctx: &mut Ctx,
    ) {
        let SdoRequest::DownloadSegment { t, n, c, data: segment } = request else {
            return self.abort(index, sub, AbortCode::InvalidCommandSpecifier, ctx);
        };
        if t != toggle {
            return self.abort(index, sub, AbortCode::ToggleNotAlternated, ctx);
        }
        data.extend_from_slice(&segment[0..7 - n as usize]);

        if c {
            if let Some(announced) = announced {
                if data.len() != announced {
                    return self.abort(index, sub, AbortCode::DataTypeMismatch, ctx);
                }
            }
            if let Err(code) = store(ctx.eds, index, sub, &data) {
                return self.abort(index, sub, code, ctx);
            }
        } else {
            self.state = ServerState::DownloadSegments {
                index,
                sub,
                toggle: !toggle,
                data,
                announced,
            };
        }
        self.respond(SdoResponse::download_segment_acknowledge(t), ctx);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_upload_segment(
        &mut self,
        request: SdoRequest,
        index: u16,
        sub: u8,
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
        ctx: &mut Ctx,
    ) {
        let SdoRequest::ReqUploadSegment { t } = request else {
            return self.abort(index, sub, AbortCode::InvalidCommandSpecifier, ctx);
        };
        if t != toggle {
            return self.abort(index, sub, AbortCode::ToggleNotAlternated, ctx);
        }
        let segment_size = (data.len() - pos).min(7);
        let c = pos + segment_size == data.len();
        let response = SdoResponse::upload_segment(t, c, &data[pos..pos + segment_size]);
        if !c {
            self.state = ServerState::UploadSegments {
                index,
                sub,
                toggle: !toggle,
                data,
                pos: pos + segment_size,
            };
        }
        self.respond(response, ctx);
    }

    fn handle_block_segment(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        // During block reception every frame is a raw segment; aborts are
        // not expressible until the next protocol boundary
        let Ok(segment) = BlockSegment::try_from(frame.data()) else {
            return;
        };

        let mut bad_sequence = None;
        let mut response = None;
        if let ServerState::BlockDownload(ref mut block) = self.state {
            if segment.seqnum == 0 {
                bad_sequence = Some((block.index, block.sub));
            } else {
                if segment.seqnum == block.expected_seq {
                    block.block.extend_from_slice(&segment.data);
                    block.expected_seq += 1;
                    if segment.c {
                        block.finished = true;
                    }
                }

                // A block round ends at the final segment or at the block
                // size; out-of-sequence frames at the boundary trigger
                // retransmission via the acknowledged sequence number
                if segment.c || segment.seqnum >= BLKSIZE {
                    let ackseq = block.expected_seq - 1;
                    block.data.append(&mut block.block);
                    if block.finished && segment.seqnum == ackseq {
                        response = Some((ackseq, true));
                    } else {
                        // Retransmitted segments keep their numbering unless
                        // a whole block was acknowledged
                        block.expected_seq = if ackseq >= BLKSIZE { 1 } else { ackseq + 1 };
                        block.finished = false;
                        response = Some((ackseq, false));
                    }
                }
            }
        }

        if let Some((index, sub)) = bad_sequence {
            return self.abort(index, sub, AbortCode::InvalidSequenceNumber, ctx);
        }
        if let Some((ackseq, complete)) = response {
            if complete {
                if let ServerState::BlockDownload(block) =
                    std::mem::replace(&mut self.state, ServerState::Idle)
                {
                    self.state = ServerState::BlockDownloadEnd(block);
                }
            }
            self.respond(SdoResponse::confirm_block(ackseq, BLKSIZE), ctx);
        }
    }

    fn handle_block_download_end(
        &mut self,
        request: SdoRequest,
        mut block: BlockDownload,
        ctx: &mut Ctx,
    ) {
        let SdoRequest::EndBlockDownload { n, crc } = request else {
            return self.abort(block.index, block.sub, AbortCode::InvalidCommandSpecifier, ctx);
        };
        // Strip the padding bytes of the final segment
        block
            .data
            .truncate(block.data.len().saturating_sub(n as usize));

        if let Some(announced) = block.announced {
            if block.data.len() > announced {
                return self.abort(block.index, block.sub, AbortCode::DataTypeMismatchLengthHigh, ctx);
            }
            if block.data.len() < announced {
                return self.abort(block.index, block.sub, AbortCode::DataTypeMismatchLengthLow, ctx);
            }
        }
        if block.crc_enabled && CrcState::<XMODEM>::calculate(&block.data) != crc {
            return self.abort(block.index, block.sub, AbortCode::CrcError, ctx);
        }
        if let Err(code) = store(ctx.eds, block.index, block.sub, &block.data) {
            return self.abort(block.index, block.sub, code, ctx);
        }
        self.respond(SdoResponse::ConfirmBlockDownloadEnd, ctx);
    }

    fn handle_block_upload_confirm(
        &mut self,
        request: SdoRequest,
        mut block: BlockUpload,
        ctx: &mut Ctx,
    ) {
        let SdoRequest::ConfirmBlock { ackseq, blksize } = request else {
            return self.abort(block.index, block.sub, AbortCode::InvalidCommandSpecifier, ctx);
        };
        if blksize == 0 || blksize > 127 {
            return self.abort(block.index, block.sub, AbortCode::InvalidBlockSize, ctx);
        }
        block.pos += ackseq as usize * 7;
        if block.pos >= block.data.len() {
            let n = ((7 - block.data.len() % 7) % 7) as u8;
            let crc = if block.crc_enabled {
                CrcState::<XMODEM>::calculate(&block.data)
            } else {
                0
            };
            self.respond(SdoResponse::block_upload_end(n, crc), ctx);
            self.state = ServerState::BlockUploadEnd {
                index: block.index,
                sub: block.sub,
            };
        } else {
            block.seq = 1;
            block.blksize = blksize;
            block.next_segment_us = ctx.now_us;
            self.state = ServerState::BlockUploadStream(block);
        }
    }

    fn process(&mut self, ctx: &mut Ctx) {
        if matches!(self.state, ServerState::Idle) {
            return;
        }

        if ctx.now_us >= self.deadline_us {
            let (index, sub) = match &self.state {
                ServerState::DownloadSegments { index, sub, .. }
                | ServerState::UploadSegments { index, sub, .. }
                | ServerState::BlockUploadEnd { index, sub } => (*index, *sub),
                ServerState::BlockDownload(b) | ServerState::BlockDownloadEnd(b) => {
                    (b.index, b.sub)
                }
                ServerState::BlockUploadStart(b)
                | ServerState::BlockUploadStream(b)
                | ServerState::BlockUploadConfirm(b) => (b.index, b.sub),
                ServerState::Idle => unreachable!(),
            };
            self.abort(index, sub, AbortCode::SdoTimeout, ctx);
            return;
        }

        // Stream block upload segments, paced by the self-tuning interval
        let cob_id_tx = self.cob_id_tx;
        let mut sent_any = false;
        let mut block_done = false;
        if let ServerState::BlockUploadStream(ref mut block) = self.state {
            while ctx.now_us >= block.next_segment_us {
                let offset = block.pos + (block.seq as usize - 1) * 7;
                let len = (block.data.len() - offset).min(7);
                let c = offset + len == block.data.len();
                let mut segment = [0u8; 7];
                segment[0..len].copy_from_slice(&block.data[offset..offset + len]);
                let frame = BlockSegment {
                    c,
                    seqnum: block.seq,
                    data: segment,
                }
                .to_frame(cob_id_tx);

                if ctx.try_send(frame).is_ok() {
                    sent_any = true;
                    block.interval_us /= 2;
                    block.next_segment_us = ctx.now_us + block.interval_us;
                    block.seq += 1;
                    if c || block.seq > block.blksize {
                        block_done = true;
                        break;
                    }
                } else {
                    block.interval_us = (block.interval_us * 256).min(BLOCK_INTERVAL_MAX_US);
                    block.next_segment_us = ctx.now_us + block.interval_us;
                    break;
                }
            }
        }
        if sent_any {
            self.deadline_us = ctx.now_us + SERVER_TIMEOUT_US;
        }
        if block_done {
            if let ServerState::BlockUploadStream(block) =
                std::mem::replace(&mut self.state, ServerState::Idle)
            {
                self.state = ServerState::BlockUploadConfirm(block);
            }
        }
    }
}

pub(crate) struct SdoServer {
    channels: Vec<ServerChannel>,
    running: bool,
}

impl SdoServer {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            running: false,
        }
    }

    /// Rebuild the channel set from the 0x1200 range and the default
    /// node-ID pair
    pub fn start(&mut self, eds: &Eds, node_id: u8) {
        let default_rx = SDO_REQUEST_BASE + node_id as u16;
        let default_tx = SDO_RESPONSE_BASE + node_id as u16;
        self.channels = vec![ServerChannel::new(default_rx, default_tx)];
        for params in eds.sdo_server_parameters() {
            if params.cob_id_rx != default_rx {
                self.channels
                    .push(ServerChannel::new(params.cob_id_rx, params.cob_id_tx));
            }
        }
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        for channel in &mut self.channels {
            channel.state = ServerState::Idle;
        }
    }

    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if !self.running || frame.data().len() < 8 {
            return;
        }
        if let Some(channel) = self
            .channels
            .iter_mut()
            .find(|c| c.cob_id_rx == frame.cob_id())
        {
            channel.handle_frame(frame, ctx);
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.running {
            return;
        }
        for channel in &mut self.channels {
            channel.process(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;
    use canstack_common::types::DataType;
    use canstack_eds::{ObjectSpec, Value};

    fn server_harness() -> (TestHarness, SdoServer) {
        let mut harness = TestHarness::new(0x0A);
        harness
            .eds
            .add_entry(0x2000, ObjectSpec::var("Scratch u32", DataType::Unsigned32))
            .unwrap();
        harness
            .eds
            .add_entry(
                0x2001,
                ObjectSpec::var_with_value(
                    "Greeting",
                    DataType::VisibleString,
                    Value::VisibleString("Hello, world!".to_string()),
                ),
            )
            .unwrap();
        harness
            .eds
            .add_entry(0x2002, ObjectSpec::var("Blob", DataType::OctetString))
            .unwrap();
        harness
            .eds
            .add_entry(
                0x2003,
                ObjectSpec::var("Bounded", DataType::Unsigned8)
                    .limits(Some(Value::Unsigned(5)), Some(Value::Unsigned(10))),
            )
            .unwrap();
        let mut server = SdoServer::new();
        server.start(&harness.eds, 0x0A);
        (harness, server)
    }

    fn request(harness: &mut TestHarness, server: &mut SdoServer, payload: [u8; 8]) {
        let frame = CanFrame::new(0x60A, &payload);
        harness.with_ctx(0, |ctx| server.handle_frame(&frame, ctx));
    }

    fn last_response(harness: &TestHarness) -> SdoResponse {
        let frame = harness.sent.last().expect("No response sent");
        assert_eq!(frame.cob_id(), 0x58A);
        SdoResponse::try_from(frame.data()).unwrap()
    }

    #[test]
    fn test_expedited_download_wire_trace() {
        let (mut harness, mut server) = server_harness();
        request(
            &mut harness,
            &mut server,
            [0x23, 0x00, 0x20, 0x00, 0xEF, 0xBE, 0xAD, 0xDE],
        );
        assert_eq!(
            harness.sent.last().unwrap().data(),
            &[0x60, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            harness.eds.get_value(0x2000).unwrap(),
            Value::Unsigned(0xDEAD_BEEF)
        );
    }

    #[test]
    fn test_expedited_upload() {
        let (mut harness, mut server) = server_harness();
        harness.eds.set_raw(0x2000, &[1, 2, 3, 4]).unwrap();
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_upload(0x2000, 0).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::expedited_upload(0x2000, 0, &[1, 2, 3, 4])
        );
    }

    #[test]
    fn test_segmented_upload_of_string() {
        let (mut harness, mut server) = server_harness();
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_upload(0x2001, 0).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::upload_acknowledge(0x2001, 0, 13)
        );

        let mut collected = Vec::new();
        let mut toggle = false;
        loop {
            request(
                &mut harness,
                &mut server,
                SdoRequest::upload_segment_request(toggle).to_bytes(),
            );
            let SdoResponse::UploadSegment { t, n, c, data } = last_response(&harness) else {
                panic!("Expected segment");
            };
            assert_eq!(t, toggle);
            collected.extend_from_slice(&data[0..7 - n as usize]);
            if c {
                break;
            }
            toggle = !toggle;
        }
        assert_eq!(collected, b"Hello, world!");
    }

    #[test]
    fn test_segmented_download() {
        let (mut harness, mut server) = server_harness();
        let payload = b"A somewhat longer value";
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_download(0x2002, 0, Some(payload.len() as u32)).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::download_acknowledge(0x2002, 0)
        );

        let mut toggle = false;
        for (i, chunk) in payload.chunks(7).enumerate() {
            let last = (i + 1) * 7 >= payload.len();
            request(
                &mut harness,
                &mut server,
                SdoRequest::download_segment(toggle, last, chunk).to_bytes(),
            );
            assert_eq!(
                last_response(&harness),
                SdoResponse::download_segment_acknowledge(toggle)
            );
            toggle = !toggle;
        }
        assert_eq!(harness.eds.get_raw(0x2002).unwrap(), payload);
    }

    #[test]
    fn test_toggle_mismatch_aborts() {
        let (mut harness, mut server) = server_harness();
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_download(0x2002, 0, None).to_bytes(),
        );
        request(
            &mut harness,
            &mut server,
            SdoRequest::download_segment(true, false, &[0; 7]).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::abort(0x2002, 0, AbortCode::ToggleNotAlternated)
        );
    }

    #[test]
    fn test_limit_violations_abort() {
        let (mut harness, mut server) = server_harness();
        request(
            &mut harness,
            &mut server,
            SdoRequest::expedited_download(0x2003, 0, &[11]).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::abort(0x2003, 0, AbortCode::ValueTooHigh)
        );
        request(
            &mut harness,
            &mut server,
            SdoRequest::expedited_download(0x2003, 0, &[4]).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::abort(0x2003, 0, AbortCode::ValueTooLow)
        );
        request(
            &mut harness,
            &mut server,
            SdoRequest::expedited_download(0x2003, 0, &[7]).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::download_acknowledge(0x2003, 0)
        );
    }

    #[test]
    fn test_missing_object_aborts() {
        let (mut harness, mut server) = server_harness();
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_upload(0x5555, 0).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::abort(0x5555, 0, AbortCode::NoSuchObject)
        );

        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_upload(0x1018, 9).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::abort(0x1018, 9, AbortCode::NoSuchSubIndex)
        );
    }

    fn run_block_download(
        harness: &mut TestHarness,
        server: &mut SdoServer,
        data: &[u8],
        corrupt: bool,
    ) -> SdoResponse {
        request(
            harness,
            server,
            SdoRequest::initiate_block_download(0x2002, 0, true, data.len() as u32).to_bytes(),
        );
        assert_eq!(
            last_response(harness),
            SdoResponse::block_download_acknowledge(true, 0x2002, 0, 127)
        );

        let mut seqnum = 0;
        let total_segments = data.len().div_ceil(7);
        for (i, chunk) in data.chunks(7).enumerate() {
            seqnum += 1;
            let mut segment = [0u8; 7];
            segment[0..chunk.len()].copy_from_slice(chunk);
            if corrupt && i == 3 {
                segment[0] ^= 0xFF;
            }
            let c = i + 1 == total_segments;
            request(
                harness,
                server,
                BlockSegment {
                    c,
                    seqnum,
                    data: segment,
                }
                .to_bytes(),
            );
            if seqnum == 127 && !c {
                assert_eq!(last_response(harness), SdoResponse::confirm_block(127, 127));
                seqnum = 0;
            }
        }

        let n = ((7 - data.len() % 7) % 7) as u8;
        let crc = CrcState::<XMODEM>::calculate(data);
        request(harness, server, SdoRequest::end_block_download(n, crc).to_bytes());
        last_response(harness)
    }

    #[test]
    fn test_block_download_with_crc() {
        let (mut harness, mut server) = server_harness();
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let response = run_block_download(&mut harness, &mut server, &data, false);
        assert_eq!(response, SdoResponse::ConfirmBlockDownloadEnd);
        assert_eq!(harness.eds.get_raw(0x2002).unwrap(), data);
    }

    #[test]
    fn test_block_download_crc_mismatch_aborts() {
        let (mut harness, mut server) = server_harness();
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let response = run_block_download(&mut harness, &mut server, &data, true);
        assert_eq!(response, SdoResponse::abort(0x2002, 0, AbortCode::CrcError));
    }

    #[test]
    fn test_block_download_retransmission() {
        let (mut harness, mut server) = server_harness();
        let data: Vec<u8> = (0..21).collect();
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_block_download(0x2002, 0, true, 21).to_bytes(),
        );

        let seg = |seqnum: u8, c: bool, chunk: &[u8]| {
            let mut segment = [0u8; 7];
            segment[0..chunk.len()].copy_from_slice(chunk);
            BlockSegment {
                c,
                seqnum,
                data: segment,
            }
            .to_bytes()
        };

        // Skip segment 2; the boundary confirm acknowledges only segment 1
        request(&mut harness, &mut server, seg(1, false, &data[0..7]));
        request(&mut harness, &mut server, seg(3, true, &data[14..21]));
        assert_eq!(last_response(&harness), SdoResponse::confirm_block(1, 127));

        // Retransmit from segment 2
        request(&mut harness, &mut server, seg(2, false, &data[7..14]));
        request(&mut harness, &mut server, seg(3, true, &data[14..21]));
        assert_eq!(last_response(&harness), SdoResponse::confirm_block(3, 127));

        let crc = CrcState::<XMODEM>::calculate(&data);
        request(&mut harness, &mut server, SdoRequest::end_block_download(0, crc).to_bytes());
        assert_eq!(last_response(&harness), SdoResponse::ConfirmBlockDownloadEnd);
        assert_eq!(harness.eds.get_raw(0x2002).unwrap(), data);
    }

    #[test]
    fn test_block_upload() {
        let (mut harness, mut server) = server_harness();
        let data: Vec<u8> = (0..100).collect();
        harness.eds.set_raw(0x2002, &data).unwrap();

        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_block_upload(0x2002, 0, true, 127).to_bytes(),
        );
        assert_eq!(
            last_response(&harness),
            SdoResponse::block_upload_acknowledge(true, 0x2002, 0, 100)
        );

        request(&mut harness, &mut server, SdoRequest::StartBlockUpload.to_bytes());
        harness.sent.clear();

        // All 15 segments stream out as the pacing interval collapses
        for now in (0..15_000).step_by(1000) {
            harness.with_ctx(now, |ctx| server.process(ctx));
        }
        assert_eq!(harness.sent.len(), 15);
        let mut collected = Vec::new();
        let mut last_c = false;
        for (i, frame) in harness.sent.iter().enumerate() {
            let segment = BlockSegment::try_from(frame.data()).unwrap();
            assert_eq!(segment.seqnum as usize, i + 1);
            collected.extend_from_slice(&segment.data);
            last_c = segment.c;
        }
        assert!(last_c);
        collected.truncate(100);
        assert_eq!(collected, data);

        request(&mut harness, &mut server, SdoRequest::confirm_block(15, 127).to_bytes());
        let response = last_response(&harness);
        let n = ((7 - 100 % 7) % 7) as u8;
        assert_eq!(
            response,
            SdoResponse::block_upload_end(n, CrcState::<XMODEM>::calculate(&data))
        );

        request(&mut harness, &mut server, SdoRequest::EndBlockUpload.to_bytes());
    }

    #[test]
    fn test_timeout_aborts_open_transfer() {
        let (mut harness, mut server) = server_harness();
        request(
            &mut harness,
            &mut server,
            SdoRequest::initiate_download(0x2002, 0, None).to_bytes(),
        );
        harness.with_ctx(10_000, |ctx| server.process(ctx));
        assert_eq!(
            last_response(&harness),
            SdoResponse::download_acknowledge(0x2002, 0)
        );

        harness.with_ctx(100_000, |ctx| server.process(ctx));
        assert_eq!(
            last_response(&harness),
            SdoResponse::abort(0x2002, 0, AbortCode::SdoTimeout)
        );
    }
}
