//! A simulated CAN bus
//!
//! Connects several nodes in one process and drives them with a simulated
//! microsecond clock. Frames sent by one node are delivered to every other
//! node; everything is recorded in a log for assertions.

use canstack_common::{CanFrame, CanSendError};
use canstack_node::Node;

/// Simulation tick width in microseconds
pub const TICK_US: u64 = 1000;

#[derive(Default)]
pub struct SimBus {
    /// Every frame observed on the bus, in transmission order
    pub log: Vec<CanFrame>,
    now_us: u64,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current simulated time
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Run one processing tick: every node processes once, and its output is
    /// delivered to all the other nodes
    pub fn step(&mut self, nodes: &mut [&mut Node]) {
        for i in 0..nodes.len() {
            let mut sent: Vec<CanFrame> = Vec::new();
            let mut sender = |frame: CanFrame| -> Result<(), CanSendError> {
                sent.push(frame);
                Ok(())
            };
            nodes[i].process(self.now_us, &mut sender);

            self.log.extend(sent.iter().copied());
            for (j, node) in nodes.iter_mut().enumerate() {
                if j != i {
                    for frame in &sent {
                        node.receive(*frame);
                    }
                }
            }
        }
        self.now_us += TICK_US;
    }

    /// Advance the simulation by a duration
    pub fn run_for(&mut self, nodes: &mut [&mut Node], duration_us: u64) {
        let end = self.now_us + duration_us;
        while self.now_us < end {
            self.step(nodes);
        }
    }

    /// Frames on one COB-ID from the log
    pub fn frames_on(&self, cob_id: u16) -> Vec<CanFrame> {
        self.log
            .iter()
            .filter(|f| f.cob_id() == cob_id)
            .copied()
            .collect()
    }

    /// Deliver a raw frame to every node, as if sent by an external device
    pub fn inject(&mut self, nodes: &mut [&mut Node], frame: CanFrame) {
        self.log.push(frame);
        for node in nodes.iter_mut() {
            node.receive(frame);
        }
    }
}
