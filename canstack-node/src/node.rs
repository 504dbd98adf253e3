//! The node facade
//!
//! [`Node`] owns the object dictionary and every protocol handler,
//! demultiplexes inbound frames by COB-ID, runs the handlers' timers, and
//! applies the NMT-state-dependent subsystem lifecycle. The host feeds it
//! received frames with [`Node::receive`] and drives it by calling
//! [`Node::process`] with a monotonic microsecond clock.

use std::collections::VecDeque;

use canstack_common::messages::{NmtCommand, NmtCommandSpecifier, NmtState, NMT_COB_ID};
use canstack_common::node_id::InvalidNodeIdError;
use canstack_common::types::TimeStamp;
use canstack_common::{CanFrame, CanSendError, CanSender, NodeId};
use canstack_eds::Eds;
use log::{info, trace};
use snafu::{ResultExt as _, Snafu};

use crate::ctx::Ctx;
use crate::emcy::{Emcy, EmcyError};
use crate::events::NodeEvent;
use crate::lss_master::{InquireKind, LssMaster, LssRequestHandle, DEFAULT_LSS_TIMEOUT_MS};
use crate::lss_slave::LssSlave;
use crate::nmt::{Nmt, NodeStateHandle, DEFAULT_STATE_REQUEST_TIMEOUT_MS};
use crate::pdo::{Pdo, PdoError};
use crate::sdo_client::{SdoClient, SdoClientError, SdoRequestOptions, SdoTransferHandle};
use crate::sdo_server::SdoServer;
use crate::sync::{SyncError, SyncHandler};
use crate::time::{TimeError, TimeHandler};
use canstack_common::lss::{LssIdentity, LssState};

/// Error returned by [`Node::new`]
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The configured node ID is out of range
    #[snafu(display("Invalid node configuration"))]
    InvalidNodeId {
        /// The underlying range error
        source: InvalidNodeIdError,
    },
}

/// Configuration for a [`Node`]
pub struct NodeConfig {
    /// The node ID, in 1..=127
    pub id: u8,
    /// The object dictionary the node serves
    pub eds: Eds,
    /// Feed outbound frames back into the receive path on the next tick
    pub loopback: bool,
    /// Enable the LSS handlers; defaults to the dictionary's LSS_Supported
    /// flag
    pub enable_lss: Option<bool>,
}

/// Sender wrapper that records successfully sent frames for loopback
struct LoopbackSink<'a> {
    inner: &'a mut dyn CanSender,
    log: Option<&'a mut Vec<CanFrame>>,
}

impl CanSender for LoopbackSink<'_> {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanSendError> {
        let result = self.inner.send(frame);
        if result.is_ok() {
            if let Some(log) = self.log.as_mut() {
                log.push(frame);
            }
        }
        result
    }
}

/// Sender that drops every frame; used for frameless internal shutdown
struct NullSender;

impl CanSender for NullSender {
    fn send(&mut self, _frame: CanFrame) -> Result<(), CanSendError> {
        Ok(())
    }
}

/// One logical CANopen node
pub struct Node {
    id: NodeId,
    eds: Eds,
    nmt: Nmt,
    emcy: Emcy,
    sync: SyncHandler,
    time: TimeHandler,
    pdo: Pdo,
    sdo_server: SdoServer,
    sdo_client: SdoClient,
    lss_slave: LssSlave,
    lss_master: LssMaster,
    lss_enabled: bool,
    loopback: bool,
    rx: VecDeque<CanFrame>,
    events: VecDeque<NodeEvent>,
    started: bool,
    pending_start: bool,
    applied_state: NmtState,
    last_now_us: u64,
}

impl Node {
    /// Create a node from its configuration
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        let id = NodeId::new(config.id).context(InvalidNodeIdSnafu)?;
        let mut eds = config.eds;
        eds.set_node_id(id.raw());
        let lss_enabled = config.enable_lss.unwrap_or(eds.lss_supported());

        Ok(Self {
            id,
            eds,
            nmt: Nmt::new(),
            emcy: Emcy::new(),
            sync: SyncHandler::new(),
            time: TimeHandler::new(),
            pdo: Pdo::new(),
            sdo_server: SdoServer::new(),
            sdo_client: SdoClient::new(),
            lss_slave: LssSlave::new(),
            lss_master: LssMaster::new(),
            lss_enabled,
            loopback: config.loopback,
            rx: VecDeque::new(),
            events: VecDeque::new(),
            started: false,
            pending_start: false,
            applied_state: NmtState::Initializing,
            last_now_us: 0,
        })
    }

    /// The node's ID
    pub fn id(&self) -> u8 {
        self.id.raw()
    }

    /// The object dictionary
    pub fn eds(&self) -> &Eds {
        &self.eds
    }

    /// Mutable access to the object dictionary
    ///
    /// Writes made here are observed by the protocol handlers on the next
    /// `process` tick, exactly like writes arriving over SDO.
    pub fn eds_mut(&mut self) -> &mut Eds {
        &mut self.eds
    }

    /// This node's NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// Begin operation
    ///
    /// The transition from Initializing to PreOperational, the boot-up
    /// heartbeat, and the subsystem starts happen on the next `process`
    /// tick.
    pub fn start(&mut self) {
        info!("Starting node {}", self.id);
        self.started = true;
        self.pending_start = true;
    }

    /// Halt operation: stop every handler, clear all timers, and abort
    /// active SDO transfers
    pub fn stop(&mut self) {
        info!("Stopping node {}", self.id);
        self.started = false;
        self.pending_start = false;

        let mut sender = NullSender;
        let mut ctx = Ctx {
            eds: &mut self.eds,
            node_id: self.id,
            now_us: 0,
            tx: &mut sender,
            events: &mut self.events,
        };
        self.sdo_client.stop(&mut ctx);
        self.sdo_server.stop();
        self.pdo.stop();
        self.emcy.stop();
        self.sync.stop();
        self.time.stop();
        self.lss_master.stop();
        self.nmt.stop(&mut ctx);
        self.applied_state = NmtState::Initializing;
    }

    /// Enqueue a received frame for the next `process` tick
    pub fn receive(&mut self, frame: CanFrame) {
        self.rx.push_back(frame);
    }

    /// Drain one observable event
    pub fn pop_event(&mut self) -> Option<NodeEvent> {
        self.events.pop_front()
    }

    /// Run one processing tick
    ///
    /// Handles every enqueued frame in arrival order, dispatches dictionary
    /// update notifications, runs all timers against `now_us`, and emits
    /// outbound frames through `sender`.
    pub fn process(&mut self, now_us: u64, sender: &mut dyn CanSender) {
        self.last_now_us = now_us;
        let mut loopback_frames = Vec::new();
        let mut sink = LoopbackSink {
            inner: sender,
            log: if self.loopback {
                Some(&mut loopback_frames)
            } else {
                None
            },
        };

        let Node {
            id,
            eds,
            nmt,
            emcy,
            sync,
            time,
            pdo,
            sdo_server,
            sdo_client,
            lss_slave,
            lss_master,
            lss_enabled,
            rx,
            events,
            started,
            pending_start,
            applied_state,
            ..
        } = self;

        let mut ctx = Ctx {
            eds,
            node_id: *id,
            now_us,
            tx: &mut sink,
            events,
        };

        if std::mem::take(pending_start) {
            nmt.start(&mut ctx);
        }

        while let Some(frame) = rx.pop_front() {
            if frame.cob_id() == NMT_COB_ID {
                match NmtCommand::try_from(&frame) {
                    Ok(cmd) => nmt.handle_command(cmd, &mut ctx),
                    Err(e) => trace!("Dropping malformed NMT command: {e}"),
                }
            } else {
                // Fan out; every handler filters by its own COB-ID set
                nmt.handle_frame(&frame, &mut ctx);
                emcy.handle_frame(&frame, &mut ctx);
                if let Some(message) = sync.handle_frame(&frame, &mut ctx) {
                    pdo.on_sync(message.counter, &mut ctx);
                }
                time.handle_frame(&frame, &mut ctx);
                sdo_server.handle_frame(&frame, &mut ctx);
                sdo_client.handle_frame(&frame, &mut ctx);
                if *lss_enabled {
                    lss_slave.handle_frame(&frame, &mut ctx);
                    lss_master.handle_frame(&frame);
                }
                pdo.handle_frame(&frame, &mut ctx);
            }
        }

        dispatch_od_updates(&mut ctx, nmt, emcy, sync, time, pdo);
        apply_lifecycle(
            &mut ctx, *started, pending_start, applied_state, nmt, emcy, sync, time, pdo,
            sdo_server, sdo_client, lss_slave, *lss_enabled,
        );

        nmt.process(&mut ctx);
        emcy.process(&mut ctx);
        sync.process(&mut ctx);
        time.process(&mut ctx);
        pdo.process(&mut ctx);
        sdo_server.process(&mut ctx);
        sdo_client.process(&mut ctx);
        if *lss_enabled {
            lss_master.process(&mut ctx);
        }

        dispatch_od_updates(&mut ctx, nmt, emcy, sync, time, pdo);

        // A node ID assigned over LSS takes effect through a comm reset
        if let Some(new_id) = lss_slave.take_pending_node_id() {
            if let Ok(new_id) = NodeId::new(new_id) {
                info!("Node ID changed from {} to {}", *id, new_id);
                *id = new_id;
                ctx.node_id = new_id;
                ctx.eds.set_node_id(new_id.raw());
                nmt.set_state(NmtState::Initializing, &mut ctx);
            }
        }

        apply_lifecycle(
            &mut ctx, *started, pending_start, applied_state, nmt, emcy, sync, time, pdo,
            sdo_server, sdo_client, lss_slave, *lss_enabled,
        );

        for frame in loopback_frames {
            rx.push_back(frame);
        }
    }

    // ------------------------------------------------------------------
    // NMT
    // ------------------------------------------------------------------

    /// Send an NMT command to the bus (0 targets every node)
    pub fn send_nmt_command(&mut self, cs: NmtCommandSpecifier, target: u8) {
        self.nmt.queue_command(cs, target);
    }

    /// The last NMT state reported by a monitored node's heartbeat
    pub fn node_state(&self, node_id: u8) -> Option<NmtState> {
        self.nmt.node_state(node_id)
    }

    /// Request a fresh state report from a remote node
    ///
    /// Resolves with the state carried by the node's next heartbeat, or
    /// None if no heartbeat arrives within the timeout.
    pub fn request_node_state(&mut self, node_id: u8, timeout_ms: Option<u16>) -> NodeStateHandle {
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_STATE_REQUEST_TIMEOUT_MS);
        // The timeout is anchored on the most recent tick's clock
        self.nmt.request_state(node_id, timeout_ms, self.last_now_us)
    }

    // ------------------------------------------------------------------
    // SDO
    // ------------------------------------------------------------------

    /// Read a remote dictionary entry over SDO
    pub fn sdo_upload(
        &mut self,
        server_id: u8,
        index: u16,
        sub: u8,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        self.sdo_client
            .upload(server_id, index, sub, SdoRequestOptions::default())
    }

    /// Read a remote dictionary entry over SDO with explicit options
    pub fn sdo_upload_with(
        &mut self,
        server_id: u8,
        index: u16,
        sub: u8,
        options: SdoRequestOptions,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        self.sdo_client.upload(server_id, index, sub, options)
    }

    /// Write a remote dictionary entry over SDO
    pub fn sdo_download(
        &mut self,
        server_id: u8,
        index: u16,
        sub: u8,
        data: Vec<u8>,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        self.sdo_client
            .download(server_id, index, sub, data, SdoRequestOptions::default())
    }

    /// Write a remote dictionary entry over SDO with explicit options
    pub fn sdo_download_with(
        &mut self,
        server_id: u8,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        options: SdoRequestOptions,
    ) -> Result<SdoTransferHandle, SdoClientError> {
        self.sdo_client.download(server_id, index, sub, data, options)
    }

    // ------------------------------------------------------------------
    // EMCY / SYNC / TIME / PDO
    // ------------------------------------------------------------------

    /// Produce an emergency message
    pub fn emcy_write(&mut self, code: u16, info: Option<[u8; 5]>) -> Result<(), EmcyError> {
        self.emcy
            .write(&mut self.eds, code, info.unwrap_or_default())
    }

    /// Produce a single out-of-cycle SYNC
    pub fn sync_write(&mut self) -> Result<(), SyncError> {
        self.sync.write()
    }

    /// Produce a TIME broadcast; None stamps the current wall-clock time
    pub fn time_write(&mut self, timestamp: Option<TimeStamp>) -> Result<(), TimeError> {
        self.time.write(timestamp.unwrap_or_else(TimeStamp::now))
    }

    /// Request transmission of the TPDO configured on a COB-ID
    pub fn pdo_write(&mut self, cob_id: u16) -> Result<(), PdoError> {
        self.pdo.write(cob_id)
    }

    // ------------------------------------------------------------------
    // LSS master services
    // ------------------------------------------------------------------

    /// Switch the LSS mode of every slave on the bus
    pub fn lss_switch_mode_global(&mut self, mode: LssState) -> LssRequestHandle<()> {
        self.lss_master.switch_mode_global(mode)
    }

    /// Put the slave with the given identity into configuration mode
    pub fn lss_switch_mode_select(
        &mut self,
        identity: LssIdentity,
        timeout_ms: Option<u16>,
    ) -> LssRequestHandle<()> {
        self.lss_master
            .switch_mode_select(identity, timeout_ms.unwrap_or(DEFAULT_LSS_TIMEOUT_MS))
    }

    /// Assign a node ID to the slave in configuration mode
    pub fn lss_configure_node_id(
        &mut self,
        node_id: u8,
        timeout_ms: Option<u16>,
    ) -> LssRequestHandle<()> {
        self.lss_master
            .configure_node_id(node_id, timeout_ms.unwrap_or(DEFAULT_LSS_TIMEOUT_MS))
    }

    /// Request a bit timing change on the slave in configuration mode
    pub fn lss_configure_bit_timing(
        &mut self,
        table: u8,
        index: u8,
        timeout_ms: Option<u16>,
    ) -> LssRequestHandle<()> {
        self.lss_master
            .configure_bit_timing(table, index, timeout_ms.unwrap_or(DEFAULT_LSS_TIMEOUT_MS))
    }

    /// Command slaves to activate a previously configured bit timing
    pub fn lss_activate_bit_timing(&mut self, delay_ms: u16) -> LssRequestHandle<()> {
        self.lss_master.activate_bit_timing(delay_ms)
    }

    /// Command the slave in configuration mode to store its configuration
    pub fn lss_store_configuration(&mut self, timeout_ms: Option<u16>) -> LssRequestHandle<()> {
        self.lss_master
            .store_configuration(timeout_ms.unwrap_or(DEFAULT_LSS_TIMEOUT_MS))
    }

    /// Read an identity word or the node ID of the slave in configuration
    /// mode
    pub fn lss_inquire(
        &mut self,
        kind: InquireKind,
        timeout_ms: Option<u16>,
    ) -> LssRequestHandle<u32> {
        self.lss_master
            .inquire(kind, timeout_ms.unwrap_or(DEFAULT_LSS_TIMEOUT_MS))
    }

    /// Discover the identity of one unconfigured slave by Fastscan
    pub fn lss_fastscan(
        &mut self,
        timeout_ms: Option<u16>,
    ) -> LssRequestHandle<Option<LssIdentity>> {
        self.lss_master
            .fastscan(timeout_ms.unwrap_or(DEFAULT_LSS_TIMEOUT_MS))
    }

    /// Check that LSS services are enabled
    pub fn lss_enabled(&self) -> bool {
        self.lss_enabled
    }
}

fn dispatch_od_updates(
    ctx: &mut Ctx,
    nmt: &mut Nmt,
    emcy: &mut Emcy,
    sync: &mut SyncHandler,
    time: &mut TimeHandler,
    pdo: &mut Pdo,
) {
    let updates = ctx.eds.take_updates();
    for id in updates {
        nmt.handle_od_update(id, ctx.eds);
        emcy.handle_od_update(id, ctx.eds);
        sync.handle_od_update(id, ctx.eds);
        time.handle_od_update(id, ctx.eds);
        pdo.handle_od_update(id, ctx.eds, ctx.now_us);
    }
}

/// Start and stop subsystems according to the NMT state
///
/// PreOperational runs everything except the PDO engine; Operational adds
/// it; Stopped halts everything except NMT itself. A fall back to
/// Initializing (reset or LSS node-ID change) stops everything and schedules
/// a fresh start on the next tick.
#[allow(clippy::too_many_arguments)]
fn apply_lifecycle(
    ctx: &mut Ctx,
    started: bool,
    pending_start: &mut bool,
    applied_state: &mut NmtState,
    nmt: &mut Nmt,
    emcy: &mut Emcy,
    sync: &mut SyncHandler,
    time: &mut TimeHandler,
    pdo: &mut Pdo,
    sdo_server: &mut SdoServer,
    sdo_client: &mut SdoClient,
    lss_slave: &mut LssSlave,
    lss_enabled: bool,
) {
    let state = nmt.state();
    if state == *applied_state {
        return;
    }
    let previous = *applied_state;
    *applied_state = state;

    let start_services = |ctx: &mut Ctx,
                          emcy: &mut Emcy,
                          sync: &mut SyncHandler,
                          time: &mut TimeHandler,
                          sdo_server: &mut SdoServer,
                          sdo_client: &mut SdoClient,
                          lss_slave: &mut LssSlave| {
        emcy.start(ctx.eds);
        sync.start(ctx.eds, ctx.now_us);
        time.start(ctx.eds);
        sdo_server.start(ctx.eds, ctx.node_id.raw());
        sdo_client.start(ctx.eds);
        if lss_enabled {
            lss_slave.start(ctx.eds.identity());
        }
    };

    match state {
        NmtState::PreOperational => {
            // Coming down from Operational the services keep running; only
            // process data stops
            if previous != NmtState::Operational {
                start_services(ctx, emcy, sync, time, sdo_server, sdo_client, lss_slave);
            }
            pdo.stop();
        }
        NmtState::Operational => {
            if previous != NmtState::PreOperational {
                start_services(ctx, emcy, sync, time, sdo_server, sdo_client, lss_slave);
            }
            pdo.start(ctx.eds, ctx.now_us);
        }
        NmtState::Stopped => {
            pdo.stop();
            emcy.stop();
            sync.stop();
            time.stop();
            sdo_server.stop();
            sdo_client.stop(ctx);
        }
        NmtState::Initializing => {
            pdo.stop();
            emcy.stop();
            sync.stop();
            time.stop();
            sdo_server.stop();
            sdo_client.stop(ctx);
            nmt.stop(ctx);
            if started {
                // Restart the cycle; heartbeat production resumes only after
                // the PreOperational transition on the next tick
                *pending_start = true;
            }
        }
    }
}
