//! SDO client
//!
//! Initiates expedited, segmented, and block-mode transfers against remote
//! servers. One link exists per SDO client parameter set in the 0x1280
//! range; requests to the same server are strictly serialized through a FIFO
//! queue, while requests to different servers may overlap.

use std::collections::VecDeque;

use canstack_common::messages::CanFrame;
use canstack_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};
use canstack_eds::Eds;
use crc16::State as CrcState;
use crc16::XMODEM;
use crossbeam::channel::{bounded, Receiver, Sender};
use log::debug;
use snafu::Snafu;

use crate::ctx::Ctx;

/// Default reply timeout for a transfer, in milliseconds
pub const DEFAULT_SDO_TIMEOUT_MS: u16 = 30;

/// Number of segments per block requested from servers
const CLIENT_BLKSIZE: u8 = 127;

/// Initial pacing interval for block download segments
const BLOCK_INTERVAL_START_US: u64 = 1000;
/// Upper bound for the pacing interval after send failures
const BLOCK_INTERVAL_MAX_US: u64 = 1_000_000;

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to
/// receive other values and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code}"),
            RawAbortCode::Unknown(code) => write!(f, "unknown code 0x{code:08X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Error returned by SDO client transfers
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// The server aborted the transfer
    #[snafu(display("Server aborted access to 0x{index:04X}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Index of the aborted access
        index: u16,
        /// Sub-index of the aborted access
        sub: u8,
        /// Reason reported by the server
        abort_code: RawAbortCode,
    },
    /// The client aborted the transfer and notified the server
    #[snafu(display("Aborted access to 0x{index:04X}sub{sub}: {abort_code}"))]
    LocalAbort {
        /// Index of the aborted access
        index: u16,
        /// Sub-index of the aborted access
        sub: u8,
        /// The abort reason sent to the server
        abort_code: AbortCode,
    },
    /// No SDO client parameter set exists for the server node
    #[snafu(display("No SDO client parameters for server node {server_id}"))]
    UnknownServer {
        /// The requested server node ID
        server_id: u8,
    },
    /// A server shrank the block size below the already-delivered segments
    /// while requesting retransmission
    BlockSizeChangedTooSmall,
}

/// Per-call options for SDO transfers
#[derive(Clone, Copy, Debug)]
pub struct SdoRequestOptions {
    /// Reply timeout in milliseconds
    pub timeout_ms: u16,
    /// Use the block protocol instead of the segmented protocol
    pub block_transfer: bool,
    /// Offer CRC verification when using the block protocol
    pub block_crc: bool,
}

impl Default for SdoRequestOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SDO_TIMEOUT_MS,
            block_transfer: false,
            block_crc: true,
        }
    }
}

/// Handle to a pending SDO transfer
///
/// Uploads resolve with the uploaded bytes; downloads resolve with an empty
/// buffer.
#[derive(Debug)]
pub struct SdoTransferHandle {
    rx: Receiver<Result<Vec<u8>, SdoClientError>>,
}

impl SdoTransferHandle {
    /// The outcome, once the transfer has resolved
    pub fn try_result(&self) -> Option<Result<Vec<u8>, SdoClientError>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TransferKind {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TransferState {
    DownloadInit { expedited: bool },
    DownloadSegments,
    UploadInit,
    UploadSegments,
    BlockDownloadInit,
    BlockDownloadStream,
    BlockDownloadConfirm,
    BlockDownloadEnd,
    BlockUploadInit,
    BlockUploadStream,
    BlockUploadEnd,
}

struct Transfer {
    kind: TransferKind,
    index: u16,
    sub: u8,
    state: TransferState,
    /// Accumulated upload bytes, or the outgoing download payload
    data: Vec<u8>,
    /// Expected total size, when announced
    size: Option<usize>,
    toggle: bool,
    timeout_us: u64,
    deadline_us: u64,
    resolver: Sender<Result<Vec<u8>, SdoClientError>>,
    // Block mode state
    crc_enabled: bool,
    blksize: u8,
    /// Next outgoing sequence number within the current block
    seqnum: u8,
    /// Next segment of `data` to send
    segment_num: usize,
    /// First segment of the current block
    block_start: usize,
    /// Expected incoming sequence number (block upload)
    expected_seq: u8,
    /// In-sequence bytes of the current incoming block
    block_buf: Vec<u8>,
    /// The final segment of an incoming block transfer was accepted
    finished: bool,
    interval_us: u64,
    next_segment_us: u64,
}

impl Transfer {
    fn total_segments(&self) -> usize {
        self.data.len().div_ceil(7)
    }

    fn refresh(&mut self, now_us: u64) {
        self.deadline_us = now_us + self.timeout_us;
    }
}

struct QueuedRequest {
    kind: TransferKind,
    index: u16,
    sub: u8,
    data: Vec<u8>,
    options: SdoRequestOptions,
    resolver: Sender<Result<Vec<u8>, SdoClientError>>,
}

struct ServerLink {
    server_id: u8,
    cob_id_tx: u16,
    cob_id_rx: u16,
    queue: VecDeque<QueuedRequest>,
    active: Option<Transfer>,
}

impl ServerLink {
    fn start_next(&mut self, ctx: &mut Ctx) {
        if self.active.is_some() {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };

        let mut transfer = Transfer {
            kind: request.kind,
            index: request.index,
            sub: request.sub,
            state: TransferState::UploadInit,
            data: request.data,
            size: None,
            toggle: false,
            timeout_us: request.options.timeout_ms as u64 * 1000,
            deadline_us: 0,
            resolver: request.resolver,
            crc_enabled: request.options.block_crc,
            blksize: CLIENT_BLKSIZE,
            seqnum: 1,
            segment_num: 0,
            block_start: 0,
            expected_seq: 1,
            block_buf: Vec::new(),
            finished: false,
            interval_us: BLOCK_INTERVAL_START_US,
            next_segment_us: 0,
        };
        transfer.refresh(ctx.now_us);

        let init = match (request.kind, request.options.block_transfer) {
            (TransferKind::Download, false) => {
                if transfer.data.is_empty() {
                    // A zero-length write cannot express its size through
                    // the 2-bit n field; send it with the size flag clear
                    transfer.state = TransferState::DownloadInit { expedited: true };
                    SdoRequest::InitiateDownload {
                        n: 0,
                        e: true,
                        s: false,
                        index: transfer.index,
                        sub: transfer.sub,
                        data: [0; 4],
                    }
                } else if transfer.data.len() <= 4 {
                    transfer.state = TransferState::DownloadInit { expedited: true };
                    SdoRequest::expedited_download(transfer.index, transfer.sub, &transfer.data)
                } else {
                    transfer.state = TransferState::DownloadInit { expedited: false };
                    SdoRequest::initiate_download(
                        transfer.index,
                        transfer.sub,
                        Some(transfer.data.len() as u32),
                    )
                }
            }
            (TransferKind::Download, true) => {
                transfer.state = TransferState::BlockDownloadInit;
                SdoRequest::initiate_block_download(
                    transfer.index,
                    transfer.sub,
                    request.options.block_crc,
                    transfer.data.len() as u32,
                )
            }
            (TransferKind::Upload, false) => {
                transfer.state = TransferState::UploadInit;
                SdoRequest::initiate_upload(transfer.index, transfer.sub)
            }
            (TransferKind::Upload, true) => {
                transfer.state = TransferState::BlockUploadInit;
                SdoRequest::initiate_block_upload(
                    transfer.index,
                    transfer.sub,
                    request.options.block_crc,
                    CLIENT_BLKSIZE,
                )
            }
        };
        ctx.send(init.to_frame(self.cob_id_tx));
        self.active = Some(transfer);
    }

    fn resolve(&mut self, result: Result<Vec<u8>, SdoClientError>) {
        if let Some(transfer) = self.active.take() {
            transfer.resolver.try_send(result).ok();
        }
    }

    /// Abort the active transfer: notify the server, reject the caller
    fn local_abort(&mut self, abort_code: AbortCode, ctx: &mut Ctx) {
        if let Some(transfer) = self.active.take() {
            debug!(
                "SDO client aborting 0x{:04X}sub{}: {abort_code}",
                transfer.index, transfer.sub
            );
            ctx.send(
                SdoRequest::abort(transfer.index, transfer.sub, abort_code)
                    .to_frame(self.cob_id_tx),
            );
            transfer
                .resolver
                .try_send(Err(SdoClientError::LocalAbort {
                    index: transfer.index,
                    sub: transfer.sub,
                    abort_code,
                }))
                .ok();
        }
    }

    fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        let Some(transfer) = self.active.as_mut() else {
            return;
        };
        transfer.refresh(ctx.now_us);

        if transfer.state == TransferState::BlockUploadStream {
            self.handle_block_segment(frame, ctx);
            return;
        }

        let Ok(response) = SdoResponse::try_from(frame.data()) else {
            return self.local_abort(AbortCode::InvalidCommandSpecifier, ctx);
        };

        if let SdoResponse::Abort {
            index,
            sub,
            abort_code,
        } = response
        {
            self.resolve(Err(SdoClientError::ServerAbort {
                index,
                sub,
                abort_code: abort_code.into(),
            }));
            return;
        }

        match transfer.state {
            TransferState::DownloadInit { expedited } => match response {
                SdoResponse::ConfirmDownload { .. } => {
                    if expedited {
                        self.resolve(Ok(Vec::new()));
                    } else {
                        self.send_download_segment(ctx);
                    }
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::DownloadSegments => match response {
                SdoResponse::ConfirmDownloadSegment { t } => {
                    if t != transfer.toggle {
                        return self.local_abort(AbortCode::ToggleNotAlternated, ctx);
                    }
                    transfer.toggle = !transfer.toggle;
                    transfer.segment_num += 1;
                    if transfer.segment_num >= transfer.total_segments() {
                        self.resolve(Ok(Vec::new()));
                    } else {
                        self.send_download_segment(ctx);
                    }
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::UploadInit => match response {
                SdoResponse::ConfirmUpload { n, e, s, data, .. } => {
                    if e {
                        let len = if s { 4 - n as usize } else { 0 };
                        self.resolve(Ok(data[0..len].to_vec()));
                    } else {
                        transfer.size = s.then(|| u32::from_le_bytes(data) as usize);
                        transfer.state = TransferState::UploadSegments;
                        let toggle = transfer.toggle;
                        ctx.send(
                            SdoRequest::upload_segment_request(toggle).to_frame(self.cob_id_tx),
                        );
                    }
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::UploadSegments => match response {
                SdoResponse::UploadSegment { t, n, c, data } => {
                    if t != transfer.toggle {
                        return self.local_abort(AbortCode::ToggleNotAlternated, ctx);
                    }
                    transfer.data.extend_from_slice(&data[0..7 - n as usize]);
                    if c {
                        if let Some(size) = transfer.size {
                            if transfer.data.len() != size {
                                return self.local_abort(AbortCode::DataTypeMismatch, ctx);
                            }
                        }
                        let data = std::mem::take(&mut transfer.data);
                        self.resolve(Ok(data));
                    } else {
                        transfer.toggle = !transfer.toggle;
                        let toggle = transfer.toggle;
                        ctx.send(
                            SdoRequest::upload_segment_request(toggle).to_frame(self.cob_id_tx),
                        );
                    }
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::BlockDownloadInit => match response {
                SdoResponse::ConfirmBlockDownload {
                    sc,
                    index,
                    sub,
                    blksize,
                } => {
                    if index != transfer.index || sub != transfer.sub {
                        return self.local_abort(AbortCode::GeneralError, ctx);
                    }
                    if blksize == 0 || blksize > 127 {
                        return self.local_abort(AbortCode::InvalidBlockSize, ctx);
                    }
                    transfer.crc_enabled &= sc;
                    transfer.blksize = blksize;
                    transfer.state = TransferState::BlockDownloadStream;
                    transfer.next_segment_us = ctx.now_us;
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::BlockDownloadStream | TransferState::BlockDownloadConfirm => {
                match response {
                    SdoResponse::ConfirmBlock { ackseq, blksize } => {
                        transfer.segment_num = transfer.block_start + ackseq as usize;
                        if transfer.segment_num >= transfer.total_segments() {
                            let n = ((7 - transfer.data.len() % 7) % 7) as u8;
                            let crc = if transfer.crc_enabled {
                                CrcState::<XMODEM>::calculate(&transfer.data)
                            } else {
                                0
                            };
                            transfer.state = TransferState::BlockDownloadEnd;
                            ctx.send(
                                SdoRequest::end_block_download(n, crc).to_frame(self.cob_id_tx),
                            );
                        } else {
                            if blksize == 0 || blksize > 127 {
                                return self.local_abort(AbortCode::InvalidBlockSize, ctx);
                            }
                            if ackseq == transfer.blksize {
                                // Whole block acknowledged; the next one
                                // restarts its numbering
                                transfer.block_start = transfer.segment_num;
                                transfer.seqnum = 1;
                            } else {
                                // Retransmit unacknowledged segments with
                                // continued numbering
                                if blksize < ackseq {
                                    let result = Err(SdoClientError::BlockSizeChangedTooSmall);
                                    return self.resolve(result);
                                }
                                transfer.seqnum = ackseq + 1;
                            }
                            transfer.blksize = blksize;
                            transfer.state = TransferState::BlockDownloadStream;
                            transfer.next_segment_us = ctx.now_us;
                        }
                    }
                    _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
                }
            }
            TransferState::BlockDownloadEnd => match response {
                SdoResponse::ConfirmBlockDownloadEnd => self.resolve(Ok(Vec::new())),
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::BlockUploadInit => match response {
                SdoResponse::ConfirmBlockUpload { sc, s, size, .. } => {
                    transfer.crc_enabled &= sc;
                    transfer.size = s.then_some(size as usize);
                    transfer.state = TransferState::BlockUploadStream;
                    ctx.send(SdoRequest::StartBlockUpload.to_frame(self.cob_id_tx));
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
            TransferState::BlockUploadStream => unreachable!("handled above"),
            TransferState::BlockUploadEnd => match response {
                SdoResponse::BlockUploadEnd { n, crc } => {
                    let stripped = transfer.data.len().saturating_sub(n as usize);
                    transfer.data.truncate(stripped);
                    if let Some(size) = transfer.size {
                        if transfer.data.len() > size {
                            return self.local_abort(AbortCode::DataTypeMismatchLengthHigh, ctx);
                        }
                        if transfer.data.len() < size {
                            return self.local_abort(AbortCode::DataTypeMismatchLengthLow, ctx);
                        }
                    }
                    if transfer.crc_enabled
                        && CrcState::<XMODEM>::calculate(&transfer.data) != crc
                    {
                        return self.local_abort(AbortCode::CrcError, ctx);
                    }
                    ctx.send(SdoRequest::EndBlockUpload.to_frame(self.cob_id_tx));
                    let data = std::mem::take(&mut transfer.data);
                    self.resolve(Ok(data));
                }
                _ => self.local_abort(AbortCode::InvalidCommandSpecifier, ctx),
            },
        }
    }

    /// Handle a raw block segment during a block upload
    fn handle_block_segment(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        let Ok(segment) = BlockSegment::try_from(frame.data()) else {
            return;
        };
        let Some(transfer) = self.active.as_mut() else {
            return;
        };
        if segment.seqnum == 0 {
            return self.local_abort(AbortCode::InvalidSequenceNumber, ctx);
        }

        if segment.seqnum == transfer.expected_seq {
            transfer.block_buf.extend_from_slice(&segment.data);
            transfer.expected_seq += 1;
            if segment.c {
                transfer.finished = true;
            }
        }

        if segment.c || segment.seqnum >= transfer.blksize {
            let ackseq = transfer.expected_seq - 1;
            let blksize = transfer.blksize;
            transfer.data.append(&mut transfer.block_buf);
            let complete = transfer.finished && segment.seqnum == ackseq;
            if complete {
                transfer.state = TransferState::BlockUploadEnd;
            } else {
                transfer.expected_seq = if ackseq >= blksize { 1 } else { ackseq + 1 };
                transfer.finished = false;
            }
            ctx.send(SdoRequest::confirm_block(ackseq, blksize).to_frame(self.cob_id_tx));
        }
    }

    fn send_download_segment(&mut self, ctx: &mut Ctx) {
        let Some(transfer) = self.active.as_mut() else {
            return;
        };
        let pos = transfer.segment_num * 7;
        let len = (transfer.data.len() - pos).min(7);
        let last = pos + len == transfer.data.len();
        let request = SdoRequest::download_segment(
            transfer.toggle,
            last,
            &transfer.data[pos..pos + len],
        );
        transfer.state = TransferState::DownloadSegments;
        ctx.send(request.to_frame(self.cob_id_tx));
    }

    fn process(&mut self, ctx: &mut Ctx) {
        self.start_next(ctx);

        let Some(transfer) = self.active.as_mut() else {
            return;
        };

        if ctx.now_us >= transfer.deadline_us {
            return self.local_abort(AbortCode::SdoTimeout, ctx);
        }

        // Stream block download segments, paced by the self-tuning interval
        if transfer.state == TransferState::BlockDownloadStream {
            let mut boundary = false;
            let mut sent_any = false;
            while ctx.now_us >= transfer.next_segment_us {
                let pos = transfer.segment_num * 7;
                let len = (transfer.data.len() - pos).min(7);
                let c = pos + len == transfer.data.len();
                let mut segment = [0u8; 7];
                segment[0..len].copy_from_slice(&transfer.data[pos..pos + len]);
                let frame = BlockSegment {
                    c,
                    seqnum: transfer.seqnum,
                    data: segment,
                }
                .to_frame(self.cob_id_tx);

                if ctx.try_send(frame).is_ok() {
                    sent_any = true;
                    // Halve the pacing interval on success so sustained
                    // transfers are not gated by the caller's tick rate
                    transfer.interval_us /= 2;
                    transfer.next_segment_us = ctx.now_us + transfer.interval_us;
                    if c || transfer.seqnum == transfer.blksize {
                        boundary = true;
                        break;
                    }
                    transfer.seqnum += 1;
                    transfer.segment_num += 1;
                } else {
                    // Back off hard on transport pushback
                    transfer.interval_us =
                        (transfer.interval_us * 256).min(BLOCK_INTERVAL_MAX_US);
                    transfer.next_segment_us = ctx.now_us + transfer.interval_us;
                    break;
                }
            }
            if sent_any {
                transfer.refresh(ctx.now_us);
            }
            if boundary {
                transfer.state = TransferState::BlockDownloadConfirm;
            }
        }
    }
}

pub(crate) struct SdoClient {
    links: Vec<ServerLink>,
    running: bool,
}

impl SdoClient {
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            running: false,
        }
    }

    /// Rebuild the server map from the 0x1280 range
    pub fn start(&mut self, eds: &Eds) {
        self.links = eds
            .sdo_client_parameters()
            .iter()
            .map(|params| ServerLink {
                server_id: params.server_id,
                cob_id_tx: params.cob_id_tx,
                cob_id_rx: params.cob_id_rx,
                queue: VecDeque::new(),
                active: None,
            })
            .collect();
        self.running = true;
    }

    /// Abort every active and queued transfer and stop serving requests
    pub fn stop(&mut self, ctx: &mut Ctx) {
        self.running = false;
        for link in &mut self.links {
            link.local_abort(AbortCode::CantStoreDeviceState, ctx);
            for request in link.queue.drain(..) {
                request
                    .resolver
                    .try_send(Err(SdoClientError::LocalAbort {
                        index: request.index,
                        sub: request.sub,
                        abort_code: AbortCode::CantStoreDeviceState,
                    }))
                    .ok();
            }
        }
    }

    /// Queue an upload (remote read) from a server
    pub fn upload(
        &mut self,
        server_id: u8,
        index: u16,
        sub: u8,
        options: SdoRequestOptions,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        self.request(server_id, TransferKind::Upload, index, sub, Vec::new(), options)
    }

    /// Queue a download (remote write) to a server
    pub fn download(
        &mut self,
        server_id: u8,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        options: SdoRequestOptions,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        self.request(server_id, TransferKind::Download, index, sub, data, options)
    }

    fn request(
        &mut self,
        server_id: u8,
        kind: TransferKind,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        options: SdoRequestOptions,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        let link = self
            .links
            .iter_mut()
            .find(|link| link.server_id == server_id)
            .ok_or(SdoClientError::UnknownServer { server_id })?;
        let (tx, rx) = bounded(1);
        link.queue.push_back(QueuedRequest {
            kind,
            index,
            sub,
            data,
            options,
            resolver: tx,
        });
        Ok(SdoTransferHandle { rx })
    }

    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if !self.running || frame.data().len() < 8 {
            return;
        }
        if let Some(link) = self
            .links
            .iter_mut()
            .find(|link| link.cob_id_rx == frame.cob_id())
        {
            link.handle_frame(frame, ctx);
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.running {
            return;
        }
        for link in &mut self.links {
            link.process(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    fn client_harness() -> (TestHarness, SdoClient) {
        let mut harness = TestHarness::new(0x0B);
        harness
            .eds
            .add_sdo_client_parameter(0x0A, 0x60A, 0x58A)
            .unwrap();
        let mut client = SdoClient::new();
        client.start(&harness.eds);
        (harness, client)
    }

    fn deliver(harness: &mut TestHarness, client: &mut SdoClient, now: u64, payload: [u8; 8]) {
        let frame = CanFrame::new(0x58A, &payload);
        harness.with_ctx(now, |ctx| client.handle_frame(&frame, ctx));
    }

    #[test]
    fn test_expedited_download_wire_trace() {
        let (mut harness, mut client) = client_harness();
        let handle = client
            .download(
                0x0A,
                0x2000,
                0,
                0xDEADBEEFu32.to_le_bytes().to_vec(),
                SdoRequestOptions::default(),
            )
            .unwrap();

        harness.with_ctx(0, |ctx| client.process(ctx));
        assert_eq!(harness.sent.len(), 1);
        assert_eq!(harness.sent[0].cob_id(), 0x60A);
        assert_eq!(
            harness.sent[0].data(),
            &[0x23, 0x00, 0x20, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]
        );
        assert!(handle.try_result().is_none());

        deliver(
            &mut harness,
            &mut client,
            1000,
            [0x60, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
        assert_eq!(handle.try_result(), Some(Ok(Vec::new())));
    }

    #[test]
    fn test_unknown_server_rejected() {
        let (_harness, mut client) = client_harness();
        assert!(matches!(
            client.upload(0x55, 0x2000, 0, SdoRequestOptions::default()),
            Err(SdoClientError::UnknownServer { server_id: 0x55 })
        ));
    }

    #[test]
    fn test_segmented_upload() {
        let (mut harness, mut client) = client_harness();
        let handle = client
            .upload(0x0A, 0x2001, 0, SdoRequestOptions::default())
            .unwrap();
        harness.with_ctx(0, |ctx| client.process(ctx));
        assert_eq!(
            harness.sent[0].data(),
            &SdoRequest::initiate_upload(0x2001, 0).to_bytes()
        );

        // Size 13, segmented
        deliver(
            &mut harness,
            &mut client,
            100,
            SdoResponse::upload_acknowledge(0x2001, 0, 13).to_bytes(),
        );
        assert_eq!(
            harness.sent[1].data(),
            &SdoRequest::upload_segment_request(false).to_bytes()
        );

        deliver(
            &mut harness,
            &mut client,
            200,
            SdoResponse::upload_segment(false, false, b"Hello, ").to_bytes(),
        );
        deliver(
            &mut harness,
            &mut client,
            300,
            SdoResponse::upload_segment(true, true, b"world!").to_bytes(),
        );
        assert_eq!(handle.try_result(), Some(Ok(b"Hello, world!".to_vec())));
    }

    #[test]
    fn test_upload_toggle_mismatch_aborts() {
        let (mut harness, mut client) = client_harness();
        let handle = client
            .upload(0x0A, 0x2001, 0, SdoRequestOptions::default())
            .unwrap();
        harness.with_ctx(0, |ctx| client.process(ctx));
        deliver(
            &mut harness,
            &mut client,
            100,
            SdoResponse::upload_acknowledge(0x2001, 0, 13).to_bytes(),
        );
        // Wrong toggle on the first segment
        deliver(
            &mut harness,
            &mut client,
            200,
            SdoResponse::upload_segment(true, false, b"Hello, ").to_bytes(),
        );
        assert_eq!(
            handle.try_result(),
            Some(Err(SdoClientError::LocalAbort {
                index: 0x2001,
                sub: 0,
                abort_code: AbortCode::ToggleNotAlternated
            }))
        );
        // The abort was also sent to the server
        let last = harness.sent.last().unwrap();
        assert_eq!(
            SdoRequest::try_from(last.data()),
            Ok(SdoRequest::abort(0x2001, 0, AbortCode::ToggleNotAlternated))
        );
    }

    #[test]
    fn test_server_abort_rejects() {
        let (mut harness, mut client) = client_harness();
        let handle = client
            .upload(0x0A, 0x2000, 0, SdoRequestOptions::default())
            .unwrap();
        harness.with_ctx(0, |ctx| client.process(ctx));
        deliver(
            &mut harness,
            &mut client,
            100,
            SdoResponse::abort(0x2000, 0, AbortCode::NoSuchObject).to_bytes(),
        );
        assert_eq!(
            handle.try_result(),
            Some(Err(SdoClientError::ServerAbort {
                index: 0x2000,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject)
            }))
        );
    }

    #[test]
    fn test_timeout_aborts() {
        let (mut harness, mut client) = client_harness();
        let handle = client
            .upload(0x0A, 0x2000, 0, SdoRequestOptions::default())
            .unwrap();
        harness.with_ctx(0, |ctx| client.process(ctx));
        // Default timeout is 30 ms
        harness.with_ctx(29_000, |ctx| client.process(ctx));
        assert!(handle.try_result().is_none());
        harness.with_ctx(31_000, |ctx| client.process(ctx));
        assert_eq!(
            handle.try_result(),
            Some(Err(SdoClientError::LocalAbort {
                index: 0x2000,
                sub: 0,
                abort_code: AbortCode::SdoTimeout
            }))
        );
    }

    #[test]
    fn test_requests_to_same_server_are_serialized() {
        let (mut harness, mut client) = client_harness();
        let first = client
            .download(0x0A, 0x2000, 0, vec![1], SdoRequestOptions::default())
            .unwrap();
        let second = client
            .download(0x0A, 0x2001, 0, vec![2], SdoRequestOptions::default())
            .unwrap();

        harness.with_ctx(0, |ctx| client.process(ctx));
        // Only the first request went to the wire
        assert_eq!(harness.sent.len(), 1);
        assert_eq!(harness.sent[0].data()[1..4], [0x00, 0x20, 0x00]);

        deliver(
            &mut harness,
            &mut client,
            100,
            SdoResponse::download_acknowledge(0x2000, 0).to_bytes(),
        );
        assert_eq!(first.try_result(), Some(Ok(Vec::new())));

        // The successor starts on the next tick
        harness.with_ctx(200, |ctx| client.process(ctx));
        assert_eq!(harness.sent.len(), 2);
        assert_eq!(harness.sent[1].data()[1..4], [0x01, 0x20, 0x00]);
        assert!(second.try_result().is_none());
    }

    #[test]
    fn test_stop_rejects_all() {
        let (mut harness, mut client) = client_harness();
        let first = client
            .upload(0x0A, 0x2000, 0, SdoRequestOptions::default())
            .unwrap();
        let second = client
            .upload(0x0A, 0x2001, 0, SdoRequestOptions::default())
            .unwrap();
        harness.with_ctx(0, |ctx| client.process(ctx));
        harness.with_ctx(100, |ctx| client.stop(ctx));

        for (handle, index) in [(first, 0x2000), (second, 0x2001)] {
            assert_eq!(
                handle.try_result(),
                Some(Err(SdoClientError::LocalAbort {
                    index,
                    sub: 0,
                    abort_code: AbortCode::CantStoreDeviceState
                }))
            );
        }
    }
}
