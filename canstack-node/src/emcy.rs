//! Emergency protocol
//!
//! Produces EMCY frames on the COB-ID configured in 0x1014, throttled by the
//! inhibit time in 0x1015, and consumes emergencies from the producers listed
//! in 0x1028. Every produced emergency is also recorded in the 0x1003 error
//! history.

use std::collections::VecDeque;

use canstack_common::messages::CanFrame;
use canstack_eds::{Eds, ObjectId};
use log::warn;
use snafu::Snafu;

use crate::ctx::Ctx;
use crate::events::{EmcyMessage, NodeEvent};

/// Error returned by [`crate::Node::emcy_write`]
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum EmcyError {
    /// Emergency production is disabled: 0x1014 is missing, marked invalid,
    /// or holds a zero COB-ID
    #[snafu(display("Emergency production is disabled"))]
    ProductionDisabled,
}

pub(crate) struct Emcy {
    cob_id: u16,
    valid: bool,
    inhibit_100us: u16,
    consumers: Vec<u16>,
    queue: VecDeque<EmcyMessage>,
    next_send_us: u64,
    running: bool,
}

impl Emcy {
    pub fn new() -> Self {
        Self {
            cob_id: 0,
            valid: false,
            inhibit_100us: 0,
            consumers: Vec::new(),
            queue: VecDeque::new(),
            next_send_us: 0,
            running: false,
        }
    }

    pub fn start(&mut self, eds: &Eds) {
        self.running = true;
        self.reload(eds);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.queue.clear();
        self.next_send_us = 0;
    }

    fn reload(&mut self, eds: &Eds) {
        self.cob_id = eds.emcy_cob_id().unwrap_or(0);
        self.valid = eds.emcy_valid();
        self.inhibit_100us = eds.emcy_inhibit_time();
        self.consumers = eds.emcy_consumers();
    }

    /// Compose an emergency and queue it for transmission
    ///
    /// The error register byte is read from 0x1001 and the error is pushed
    /// onto the 0x1003 history. The frame leaves on the next `process` tick,
    /// paced by the inhibit time when one is configured.
    pub fn write(&mut self, eds: &mut Eds, code: u16, info: [u8; 5]) -> Result<(), EmcyError> {
        if !self.valid || self.cob_id == 0 {
            return Err(EmcyError::ProductionDisabled);
        }
        let message = EmcyMessage {
            code,
            register: eds.error_register(),
            info,
        };
        let history_info = u16::from_le_bytes([info[0], info[1]]);
        if eds.get_entry(0x1003).is_some() {
            if let Err(e) = eds.push_emcy_history(code, history_info) {
                warn!("Failed to record emergency in history: {e}");
            }
        }
        self.queue.push_back(message);
        Ok(())
    }

    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if !self.running || !self.consumers.contains(&frame.cob_id()) {
            return;
        }
        let Some(message) = EmcyMessage::from_payload(frame.data()) else {
            return;
        };
        ctx.emit(NodeEvent::Emergency {
            cob_id: frame.cob_id(),
            message,
        });
    }

    pub fn handle_od_update(&mut self, id: ObjectId, eds: &Eds) {
        if matches!(id.index, 0x1014 | 0x1015 | 0x1028) {
            self.reload(eds);
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.running {
            return;
        }
        while let Some(message) = self.queue.front() {
            if self.inhibit_100us != 0 && ctx.now_us < self.next_send_us {
                break;
            }
            ctx.send(CanFrame::new(self.cob_id, &message.to_payload()));
            self.queue.pop_front();
            self.next_send_us = ctx.now_us + self.inhibit_100us as u64 * 100;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, TestHarness};

    #[test]
    fn test_write_composes_payload() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.set_emcy_cob_id(0x8A).unwrap();
        harness.eds.set_emcy_history_length(4).unwrap();
        harness.eds.set_raw(0x1001, &[0x11]).unwrap();

        let mut emcy = Emcy::new();
        emcy.start(&harness.eds);
        emcy.write(&mut harness.eds, 0x3100, [1, 2, 3, 4, 5]).unwrap();
        harness.with_ctx(0, |ctx| emcy.process(ctx));

        assert_eq!(harness.sent.len(), 1);
        assert_eq!(harness.sent[0].cob_id(), 0x8A);
        assert_eq!(
            harness.sent[0].data(),
            &[0x00, 0x31, 0x11, 1, 2, 3, 4, 5]
        );
        assert_eq!(harness.eds.emcy_history(), vec![(0x3100, 0x0201)]);
    }

    #[test]
    fn test_write_disabled_without_cob_id() {
        let mut harness = TestHarness::new(0x0A);
        let mut emcy = Emcy::new();
        emcy.start(&harness.eds);
        assert_eq!(
            emcy.write(&mut harness.eds, 0x1000, [0; 5]),
            Err(EmcyError::ProductionDisabled)
        );

        // COB-ID of zero marks the producer invalid
        harness.eds.set_emcy_cob_id(0).unwrap();
        emcy.start(&harness.eds);
        assert_eq!(
            emcy.write(&mut harness.eds, 0x1000, [0; 5]),
            Err(EmcyError::ProductionDisabled)
        );
    }

    #[test]
    fn test_inhibit_time_paces_queue() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.set_emcy_cob_id(0x8A).unwrap();
        // 50 ms in 100 us units
        harness.eds.set_emcy_inhibit_time(500).unwrap();

        let mut emcy = Emcy::new();
        emcy.start(&harness.eds);
        emcy.write(&mut harness.eds, 0x1000, [0; 5]).unwrap();
        emcy.write(&mut harness.eds, 0x2000, [0; 5]).unwrap();

        harness.with_ctx(0, |ctx| emcy.process(ctx));
        assert_eq!(harness.sent.len(), 1);

        harness.with_ctx(10_000, |ctx| emcy.process(ctx));
        assert_eq!(harness.sent.len(), 1);

        harness.with_ctx(50_000, |ctx| emcy.process(ctx));
        assert_eq!(harness.sent.len(), 2);
        assert_eq!(harness.sent[1].data()[0..2], [0x00, 0x20]);
    }

    #[test]
    fn test_consumer_event() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.add_emcy_consumer(0x8B).unwrap();
        let mut emcy = Emcy::new();
        emcy.start(&harness.eds);

        let frame = CanFrame::new(0x8B, &[0x00, 0x10, 0x01, 9, 8, 7, 6, 5]);
        harness.with_ctx(0, |ctx| emcy.handle_frame(&frame, ctx));
        assert_eq!(
            drain_events(&mut harness.events),
            vec![NodeEvent::Emergency {
                cob_id: 0x8B,
                message: EmcyMessage {
                    code: 0x1000,
                    register: 1,
                    info: [9, 8, 7, 6, 5]
                }
            }]
        );

        // Frames from unconsumed producers are ignored
        let other = CanFrame::new(0x8C, &[0; 8]);
        harness.with_ctx(0, |ctx| emcy.handle_frame(&other, ctx));
        assert!(drain_events(&mut harness.events).is_empty());
    }
}
