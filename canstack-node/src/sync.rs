//! SYNC protocol
//!
//! Produces the periodic SYNC broadcast when 0x1005 bit 30 is set and 0x1006
//! holds a nonzero cycle period, carrying a wrapping counter byte when 0x1019
//! configures an overflow. Consumes SYNC frames on the configured COB-ID.

use canstack_common::messages::{CanFrame, SyncMessage, SYNC_COB_ID};
use canstack_eds::{Eds, ObjectId};
use snafu::Snafu;

use crate::ctx::Ctx;
use crate::events::NodeEvent;

/// Error returned by [`crate::Node::sync_write`]
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum SyncError {
    /// SYNC production is not enabled in 0x1005
    #[snafu(display("SYNC generation is disabled"))]
    GenerationDisabled,
}

pub(crate) struct SyncHandler {
    cob_id: u16,
    generate: bool,
    period_us: u32,
    overflow: u8,
    counter: u8,
    next_sync_us: u64,
    pending_write: bool,
    running: bool,
}

impl SyncHandler {
    pub fn new() -> Self {
        Self {
            cob_id: SYNC_COB_ID,
            generate: false,
            period_us: 0,
            overflow: 0,
            counter: 1,
            next_sync_us: 0,
            pending_write: false,
            running: false,
        }
    }

    pub fn start(&mut self, eds: &Eds, now_us: u64) {
        self.running = true;
        self.reload(eds);
        self.counter = 1;
        self.next_sync_us = now_us + self.period_us as u64;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.pending_write = false;
    }

    fn reload(&mut self, eds: &Eds) {
        self.cob_id = eds.sync_cob_id().unwrap_or(SYNC_COB_ID);
        self.generate = eds.sync_generation_enabled();
        self.period_us = eds.sync_cycle_period().unwrap_or(0);
        self.overflow = eds.sync_overflow().unwrap_or(0);
    }

    /// Request a single out-of-cycle SYNC transmission
    pub fn write(&mut self) -> Result<(), SyncError> {
        if !self.generate {
            return Err(SyncError::GenerationDisabled);
        }
        self.pending_write = true;
        Ok(())
    }

    /// Handle a received SYNC, returning its counter for the PDO engine
    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) -> Option<SyncMessage> {
        if !self.running || frame.cob_id() != self.cob_id {
            return None;
        }
        let message = SyncMessage::from_frame(frame);
        ctx.emit(NodeEvent::Sync {
            counter: message.counter,
        });
        Some(message)
    }

    pub fn handle_od_update(&mut self, id: ObjectId, eds: &Eds) {
        if matches!(id.index, 0x1005 | 0x1006 | 0x1019) {
            self.reload(eds);
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.running {
            return;
        }
        let periodic_due =
            self.generate && self.period_us != 0 && ctx.now_us >= self.next_sync_us;
        if periodic_due || self.pending_write {
            let counter = if self.overflow != 0 {
                let counter = self.counter;
                self.counter = if counter >= self.overflow { 1 } else { counter + 1 };
                Some(counter)
            } else {
                None
            };
            ctx.send(SyncMessage { counter }.to_frame(self.cob_id));
            self.pending_write = false;
            if periodic_due {
                self.next_sync_us = ctx.now_us + self.period_us as u64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, TestHarness};

    #[test]
    fn test_periodic_production_with_counter() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.set_sync_cob_id(0x80).unwrap();
        harness.eds.set_sync_generation(true).unwrap();
        harness.eds.set_sync_cycle_period(10_000).unwrap();
        harness.eds.set_sync_overflow(2).unwrap();

        let mut sync = SyncHandler::new();
        sync.start(&harness.eds, 0);

        harness.with_ctx(10_000, |ctx| sync.process(ctx));
        harness.with_ctx(20_000, |ctx| sync.process(ctx));
        harness.with_ctx(30_000, |ctx| sync.process(ctx));
        let counters: Vec<&[u8]> = harness.sent.iter().map(|f| f.data()).collect();
        assert_eq!(counters, vec![&[1][..], &[2][..], &[1][..]]);
    }

    #[test]
    fn test_no_counter_without_overflow() {
        let mut harness = TestHarness::new(0x0A);
        harness.eds.set_sync_generation(true).unwrap();
        harness.eds.set_sync_cycle_period(10_000).unwrap();

        let mut sync = SyncHandler::new();
        sync.start(&harness.eds, 0);
        harness.with_ctx(10_000, |ctx| sync.process(ctx));
        assert_eq!(harness.sent.len(), 1);
        assert!(harness.sent[0].data().is_empty());
    }

    #[test]
    fn test_manual_write_requires_generation() {
        let harness = TestHarness::new(0x0A);
        let mut sync = SyncHandler::new();
        sync.start(&harness.eds, 0);
        assert_eq!(sync.write(), Err(SyncError::GenerationDisabled));
    }

    #[test]
    fn test_consumer_event() {
        let mut harness = TestHarness::new(0x0A);
        let mut sync = SyncHandler::new();
        sync.start(&harness.eds, 0);

        let frame = CanFrame::new(0x80, &[7]);
        let message = harness.with_ctx(0, |ctx| sync.handle_frame(&frame, ctx));
        assert_eq!(message.unwrap().counter, Some(7));
        assert_eq!(
            drain_events(&mut harness.events),
            vec![NodeEvent::Sync { counter: Some(7) }]
        );
    }
}
