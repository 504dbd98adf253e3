//! TIME stamp protocol
//!
//! Produces TIME_OF_DAY broadcasts when 0x1012 bit 30 is set, and consumes
//! them when bit 31 is set.

use canstack_common::messages::{CanFrame, TimeMessage, TIME_COB_ID};
use canstack_common::types::TimeStamp;
use canstack_eds::{Eds, ObjectId};
use snafu::Snafu;

use crate::ctx::Ctx;
use crate::events::NodeEvent;

/// Error returned by [`crate::Node::time_write`]
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum TimeError {
    /// TIME production is not enabled in 0x1012
    #[snafu(display("TIME production is disabled"))]
    ProductionDisabled,
}

pub(crate) struct TimeHandler {
    cob_id: u16,
    produce: bool,
    consume: bool,
    pending: Option<TimeStamp>,
    running: bool,
}

impl TimeHandler {
    pub fn new() -> Self {
        Self {
            cob_id: TIME_COB_ID,
            produce: false,
            consume: false,
            pending: None,
            running: false,
        }
    }

    pub fn start(&mut self, eds: &Eds) {
        self.running = true;
        self.reload(eds);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.pending = None;
    }

    fn reload(&mut self, eds: &Eds) {
        self.cob_id = eds.time_cob_id().unwrap_or(TIME_COB_ID);
        self.produce = eds.time_produce_enabled();
        self.consume = eds.time_consume_enabled();
    }

    /// Queue a timestamp broadcast
    pub fn write(&mut self, timestamp: TimeStamp) -> Result<(), TimeError> {
        if !self.produce {
            return Err(TimeError::ProductionDisabled);
        }
        self.pending = Some(timestamp);
        Ok(())
    }

    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if !self.running || !self.consume || frame.cob_id() != self.cob_id {
            return;
        }
        let Ok(message) = TimeMessage::from_frame(frame) else {
            return;
        };
        ctx.emit(NodeEvent::Time {
            timestamp: message.timestamp,
        });
    }

    pub fn handle_od_update(&mut self, id: ObjectId, eds: &Eds) {
        if id.index == 0x1012 {
            self.reload(eds);
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.running {
            return;
        }
        if let Some(timestamp) = self.pending.take() {
            ctx.send(TimeMessage { timestamp }.to_frame(self.cob_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, TestHarness};

    #[test]
    fn test_produce() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.set_time_cob_id(0x100).unwrap();
        harness.eds.set_time_produce(true).unwrap();

        let mut time = TimeHandler::new();
        time.start(&harness.eds);

        let ts = TimeStamp {
            days: 15340,
            millis: 1234,
        };
        time.write(ts).unwrap();
        harness.with_ctx(0, |ctx| time.process(ctx));
        assert_eq!(harness.sent.len(), 1);
        assert_eq!(harness.sent[0].cob_id(), 0x100);
        assert_eq!(harness.sent[0].data(), ts.to_bytes());
    }

    #[test]
    fn test_produce_disabled() {
        let harness = TestHarness::new(0x0A);
        let mut time = TimeHandler::new();
        time.start(&harness.eds);
        assert_eq!(
            time.write(TimeStamp::default()),
            Err(TimeError::ProductionDisabled)
        );
    }

    #[test]
    fn test_consume() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.set_time_consume(true).unwrap();
        let mut time = TimeHandler::new();
        time.start(&harness.eds);

        let ts = TimeStamp {
            days: 100,
            millis: 42,
        };
        let frame = CanFrame::new(0x100, &ts.to_bytes());
        harness.with_ctx(0, |ctx| time.handle_frame(&frame, ctx));
        assert_eq!(
            drain_events(&mut harness.events),
            vec![NodeEvent::Time { timestamp: ts }]
        );
    }
}
