//! Shared helpers for handler unit tests

use std::collections::VecDeque;

use canstack_common::{CanFrame, CanSendError, NodeId};
use canstack_eds::Eds;

use crate::ctx::Ctx;
use crate::events::NodeEvent;

/// Fixture bundling an Eds, an event queue, and a frame-capturing sender
pub struct TestHarness {
    pub eds: Eds,
    pub sent: Vec<CanFrame>,
    pub events: VecDeque<NodeEvent>,
    /// When set, the sender rejects every frame
    pub fail_sends: bool,
    node_id: NodeId,
}

impl TestHarness {
    pub fn new(node_id: u8) -> Self {
        let mut eds = Eds::new();
        eds.set_node_id(node_id);
        Self {
            eds,
            sent: Vec::new(),
            events: VecDeque::new(),
            fail_sends: false,
            node_id: NodeId::new(node_id).unwrap(),
        }
    }

    /// Run a closure with a context borrowing this harness
    pub fn with_ctx<R>(&mut self, now_us: u64, f: impl FnOnce(&mut Ctx) -> R) -> R {
        let fail = self.fail_sends;
        let sent = &mut self.sent;
        let mut sender = |frame: CanFrame| {
            if fail {
                Err(CanSendError)
            } else {
                sent.push(frame);
                Ok(())
            }
        };
        let mut ctx = Ctx {
            eds: &mut self.eds,
            node_id: self.node_id,
            now_us,
            tx: &mut sender,
            events: &mut self.events,
        };
        f(&mut ctx)
    }
}

pub fn drain_events(events: &mut VecDeque<NodeEvent>) -> Vec<NodeEvent> {
    events.drain(..).collect()
}
