//! Shared handler context
//!
//! Every protocol handler runs inside one `process` invocation of the node;
//! the context bundles the borrows they all need.

use std::collections::VecDeque;

use canstack_common::{CanFrame, CanSendError, CanSender, NodeId};
use canstack_eds::Eds;
use log::warn;

use crate::events::NodeEvent;

pub(crate) struct Ctx<'a> {
    pub eds: &'a mut Eds,
    pub node_id: NodeId,
    pub now_us: u64,
    pub tx: &'a mut dyn CanSender,
    pub events: &'a mut VecDeque<NodeEvent>,
}

impl Ctx<'_> {
    /// Send a frame, logging failures
    ///
    /// Most callers do not care about individual send failures; the block
    /// transfer pacing paths use [`Ctx::try_send`] instead.
    pub fn send(&mut self, frame: CanFrame) {
        if self.tx.send(frame).is_err() {
            warn!("Transport rejected frame on COB-ID 0x{:03X}", frame.cob_id());
        }
    }

    /// Send a frame, reporting the outcome to the caller
    pub fn try_send(&mut self, frame: CanFrame) -> Result<(), CanSendError> {
        self.tx.send(frame)
    }

    /// Publish an event to the host
    pub fn emit(&mut self, event: NodeEvent) {
        self.events.push_back(event);
    }
}
