//! Network management
//!
//! Owns this node's NMT state machine, produces the heartbeat, monitors
//! consumed heartbeats from object 0x1016, and handles NMT commands on
//! COB-ID 0.

use std::collections::{HashMap, VecDeque};

use canstack_common::messages::{
    CanFrame, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState, HEARTBEAT_BASE,
};
use canstack_eds::{Eds, ObjectId};
use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, info};

use crate::ctx::Ctx;
use crate::events::NodeEvent;

/// Default window for [`crate::Node::request_node_state`], in milliseconds
pub const DEFAULT_STATE_REQUEST_TIMEOUT_MS: u16 = 1000;

/// Handle to a pending remote-state request
///
/// Resolves with the state reported by the next heartbeat of the requested
/// node, or None when no heartbeat arrives within the timeout.
#[derive(Debug)]
pub struct NodeStateHandle {
    rx: Receiver<Option<NmtState>>,
}

impl NodeStateHandle {
    /// The result, once the request has resolved
    pub fn try_result(&self) -> Option<Option<NmtState>> {
        self.rx.try_recv().ok()
    }
}

struct HeartbeatMonitor {
    time_ms: u16,
    /// Armed by the first heartbeat, refreshed by every subsequent one
    deadline_us: Option<u64>,
    last_state: Option<NmtState>,
}

struct StateRequest {
    node_id: u8,
    deadline_us: u64,
    resolver: Sender<Option<NmtState>>,
}

pub(crate) struct Nmt {
    state: NmtState,
    producer_time_ms: u32,
    next_heartbeat_us: u64,
    monitors: HashMap<u8, HeartbeatMonitor>,
    state_requests: Vec<StateRequest>,
    command_queue: VecDeque<NmtCommand>,
    running: bool,
}

impl Nmt {
    pub fn new() -> Self {
        Self {
            state: NmtState::Initializing,
            producer_time_ms: 0,
            next_heartbeat_us: 0,
            monitors: HashMap::new(),
            state_requests: Vec::new(),
            command_queue: VecDeque::new(),
            running: false,
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    /// The last state reported by a monitored node's heartbeat
    pub fn node_state(&self, node_id: u8) -> Option<NmtState> {
        self.monitors.get(&node_id)?.last_state
    }

    /// Begin operation: leave Initializing and start heartbeat production
    pub fn start(&mut self, ctx: &mut Ctx) {
        self.running = true;
        self.reload(ctx.eds);
        // Boot-up message precedes the first periodic heartbeat
        ctx.send(
            Heartbeat {
                node: ctx.node_id.raw(),
                state: NmtState::Initializing,
            }
            .into(),
        );
        self.next_heartbeat_us = ctx.now_us + self.producer_time_ms as u64 * 1000;
        self.set_state(NmtState::PreOperational, ctx);
    }

    /// Halt operation: clear all timers and return to Initializing
    pub fn stop(&mut self, ctx: &mut Ctx) {
        self.running = false;
        for monitor in self.monitors.values_mut() {
            monitor.deadline_us = None;
            monitor.last_state = None;
        }
        for request in self.state_requests.drain(..) {
            request.resolver.try_send(None).ok();
        }
        self.set_state(NmtState::Initializing, ctx);
    }

    fn reload(&mut self, eds: &Eds) {
        self.producer_time_ms = eds.heartbeat_producer_time();
        let consumers = eds.heartbeat_consumers();
        self.monitors.retain(|id, _| {
            consumers.iter().any(|c| c.node_id == *id)
        });
        for consumer in consumers {
            self.monitors
                .entry(consumer.node_id)
                .or_insert(HeartbeatMonitor {
                    time_ms: consumer.time_ms,
                    deadline_us: None,
                    last_state: None,
                })
                .time_ms = consumer.time_ms;
        }
    }

    pub fn set_state(&mut self, state: NmtState, ctx: &mut Ctx) {
        if state != self.state {
            debug!("NMT state changed from {} to {}", self.state, state);
            self.state = state;
            ctx.emit(NodeEvent::StateChange { state });
        }
    }

    /// Queue an NMT command for transmission to the bus
    pub fn queue_command(&mut self, cs: NmtCommandSpecifier, node_id: u8) {
        self.command_queue.push_back(NmtCommand { cs, node: node_id });
    }

    /// Register a request for a remote node's next reported state
    pub fn request_state(&mut self, node_id: u8, timeout_ms: u16, now_us: u64) -> NodeStateHandle {
        let (tx, rx) = bounded(1);
        self.state_requests.push(StateRequest {
            node_id,
            deadline_us: now_us + timeout_ms as u64 * 1000,
            resolver: tx,
        });
        NodeStateHandle { rx }
    }

    /// Handle an NMT command addressed to this node or broadcast
    pub fn handle_command(&mut self, cmd: NmtCommand, ctx: &mut Ctx) {
        if !self.running {
            return;
        }
        if cmd.node != 0 && cmd.node != ctx.node_id.raw() {
            return;
        }
        debug!("Received NMT command {:?}", cmd.cs);
        match cmd.cs {
            NmtCommandSpecifier::Start => self.set_state(NmtState::Operational, ctx),
            NmtCommandSpecifier::Stop => self.set_state(NmtState::Stopped, ctx),
            NmtCommandSpecifier::EnterPreOp => self.set_state(NmtState::PreOperational, ctx),
            NmtCommandSpecifier::ResetApp => {
                ctx.emit(NodeEvent::Reset { application: true });
                self.set_state(NmtState::Initializing, ctx);
            }
            NmtCommandSpecifier::ResetComm => {
                ctx.emit(NodeEvent::Reset { application: false });
                self.set_state(NmtState::Initializing, ctx);
            }
        }
    }

    /// Handle a frame in the heartbeat COB-ID range
    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if frame.cob_id() & !0x7F != HEARTBEAT_BASE {
            return;
        }
        let Ok(heartbeat) = Heartbeat::try_from(frame) else {
            return;
        };

        self.state_requests.retain(|request| {
            if request.node_id == heartbeat.node {
                request.resolver.try_send(Some(heartbeat.state)).ok();
                false
            } else {
                true
            }
        });

        if let Some(monitor) = self.monitors.get_mut(&heartbeat.node) {
            monitor.last_state = Some(heartbeat.state);
            monitor.deadline_us = Some(ctx.now_us + monitor.time_ms as u64 * 1000);
            ctx.emit(NodeEvent::Heartbeat {
                node_id: heartbeat.node,
                state: heartbeat.state,
            });
        }
    }

    pub fn handle_od_update(&mut self, id: ObjectId, eds: &Eds) {
        if id.index == 0x1016 || id.index == 0x1017 {
            self.reload(eds);
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.running {
            return;
        }

        if self.producer_time_ms != 0 && ctx.now_us >= self.next_heartbeat_us {
            ctx.send(
                Heartbeat {
                    node: ctx.node_id.raw(),
                    state: self.state,
                }
                .into(),
            );
            self.next_heartbeat_us = ctx.now_us + self.producer_time_ms as u64 * 1000;
        }

        for (node_id, monitor) in self.monitors.iter_mut() {
            if let Some(deadline) = monitor.deadline_us {
                if ctx.now_us >= deadline {
                    info!("Heartbeat from node {node_id} timed out");
                    // Disarmed until a fresh first heartbeat arrives
                    monitor.deadline_us = None;
                    monitor.last_state = None;
                    ctx.events.push_back(NodeEvent::HeartbeatTimeout { node_id: *node_id });
                }
            }
        }

        for request in std::mem::take(&mut self.state_requests) {
            if ctx.now_us >= request.deadline_us {
                request.resolver.try_send(None).ok();
            } else {
                self.state_requests.push(request);
            }
        }

        while let Some(cmd) = self.command_queue.pop_front() {
            ctx.send(cmd.into());
        }
    }
}
