//! PDO engine
//!
//! Binds dictionary entries to broadcast frames. Transmit PDOs are driven by
//! SYNC counting, event timers, or dictionary updates with inhibit-time
//! coalescing; receive PDOs slice incoming payloads into their mapped
//! entries.

use canstack_common::messages::CanFrame;
use canstack_eds::{Eds, ObjectId, PdoMap};
use log::warn;
use snafu::Snafu;

use crate::ctx::Ctx;
use crate::events::NodeEvent;

/// Error returned by [`crate::Node::pdo_write`]
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum PdoError {
    /// No transmit PDO is configured on the COB-ID
    #[snafu(display("No transmit PDO on COB-ID 0x{cob_id:03X}"))]
    NoSuchPdo {
        /// The requested COB-ID
        cob_id: u16,
    },
}

/// Highest transmission type driven by SYNC counting
const MAX_SYNC_TRANSMISSION_TYPE: u8 = 0xF0;
/// Event-driven transmission type
const EVENT_DRIVEN: u8 = 0xFE;

struct TpdoState {
    map: PdoMap,
    /// SYNCs seen since the last transmission
    sync_counter: u8,
    /// Cleared until the SYNC counter reaches sync_start
    started: bool,
    /// A mapped entry changed since the last SYNC (acyclic type 0)
    data_changed: bool,
    /// An event-driven transmission is due, possibly held by inhibit time
    pending: bool,
    next_event_us: Option<u64>,
    inhibit_until_us: u64,
}

impl TpdoState {
    fn new(map: PdoMap, now_us: u64) -> Self {
        let next_event_us = if map.transmission_type == EVENT_DRIVEN && map.event_time > 0 {
            Some(now_us + map.event_time as u64 * 1000)
        } else {
            None
        };
        Self {
            map,
            sync_counter: 0,
            started: false,
            data_changed: false,
            pending: false,
            next_event_us,
            inhibit_until_us: 0,
        }
    }

    fn maps_object(&self, id: ObjectId) -> bool {
        let sub = id.sub.unwrap_or(0);
        self.map
            .mapped
            .iter()
            .any(|m| m.index == id.index && m.sub == sub)
    }
}

pub(crate) struct Pdo {
    rpdos: Vec<PdoMap>,
    tpdos: Vec<TpdoState>,
    enabled: bool,
}

impl Pdo {
    pub fn new() -> Self {
        Self {
            rpdos: Vec::new(),
            tpdos: Vec::new(),
            enabled: false,
        }
    }

    /// Build the receive and transmit maps and begin exchanging process data
    pub fn start(&mut self, eds: &Eds, now_us: u64) {
        self.rpdos = eds.receive_pdos();
        self.tpdos = eds
            .transmit_pdos()
            .into_iter()
            .inspect(|map| {
                if map.transmission_type > MAX_SYNC_TRANSMISSION_TYPE
                    && map.transmission_type != EVENT_DRIVEN
                {
                    warn!(
                        "TPDO 0x{:03X} has unsupported transmission type {}",
                        map.cob_id, map.transmission_type
                    );
                }
            })
            .map(|map| TpdoState::new(map, now_us))
            .collect();
        self.enabled = true;
    }

    /// Stop exchanging process data and drop all timers
    pub fn stop(&mut self) {
        self.enabled = false;
        self.rpdos.clear();
        self.tpdos.clear();
    }

    /// Request transmission of the TPDO on a COB-ID
    pub fn write(&mut self, cob_id: u16) -> Result<(), PdoError> {
        let tpdo = self
            .tpdos
            .iter_mut()
            .find(|t| t.map.cob_id == cob_id)
            .ok_or(PdoError::NoSuchPdo { cob_id })?;
        tpdo.pending = true;
        Ok(())
    }

    /// Drive synchronous TPDOs from a received SYNC
    pub fn on_sync(&mut self, counter: Option<u8>, ctx: &mut Ctx) {
        if !self.enabled {
            return;
        }
        for tpdo in &mut self.tpdos {
            let tt = tpdo.map.transmission_type;
            if tt > MAX_SYNC_TRANSMISSION_TYPE {
                continue;
            }
            if !tpdo.started {
                // Hold until the counter passes the configured start value
                if tpdo.map.sync_start == 0 || counter == Some(tpdo.map.sync_start) {
                    tpdo.started = true;
                } else {
                    continue;
                }
            }
            if tt == 0 {
                // Acyclic: transmit on SYNC only when the data changed
                if tpdo.data_changed {
                    tpdo.data_changed = false;
                    transmit(&tpdo.map, ctx);
                }
            } else {
                tpdo.sync_counter += 1;
                if tpdo.sync_counter >= tt {
                    tpdo.sync_counter = 0;
                    transmit(&tpdo.map, ctx);
                }
            }
        }
    }

    /// Handle a frame matching one of the receive PDOs
    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if !self.enabled {
            return;
        }
        let Some(rpdo) = self.rpdos.iter().find(|r| r.cob_id == frame.cob_id()) else {
            return;
        };

        let mut changed = false;
        let mut offset = 0;
        for entry in &rpdo.mapped {
            let len = entry.bit_length as usize / 8;
            if offset + len > frame.data().len() {
                warn!(
                    "RPDO 0x{:03X} payload shorter than its mapping",
                    frame.cob_id()
                );
                break;
            }
            let slice = &frame.data()[offset..offset + len];
            offset += len;

            let target_is_aggregate = ctx
                .eds
                .get_entry(entry.index)
                .is_some_and(|o| o.is_aggregate());
            let previous = if target_is_aggregate {
                ctx.eds.get_raw_sub(entry.index, entry.sub).map(|r| r.to_vec())
            } else {
                ctx.eds.get_raw(entry.index).map(|r| r.to_vec())
            };
            if matches!(&previous, Ok(p) if p.as_slice() == slice) {
                continue;
            }
            let result = if target_is_aggregate {
                ctx.eds.set_raw_sub(entry.index, entry.sub, slice)
            } else {
                ctx.eds.set_raw(entry.index, slice)
            };
            match result {
                Ok(()) => changed = true,
                Err(e) => warn!("RPDO write to 0x{:04X} failed: {e}", entry.index),
            }
        }

        if changed {
            ctx.emit(NodeEvent::Pdo {
                cob_id: frame.cob_id(),
            });
        }
    }

    /// React to dictionary updates: mark mapped TPDOs changed, rebuild on
    /// configuration changes
    pub fn handle_od_update(&mut self, id: ObjectId, eds: &Eds, now_us: u64) {
        if !self.enabled {
            return;
        }
        // A write to the PDO configuration ranges invalidates the maps
        if (0x1400..0x1C00).contains(&id.index) {
            let rpdos = eds.receive_pdos();
            let tpdos = eds.transmit_pdos();
            self.rpdos = rpdos;
            self.tpdos = tpdos
                .into_iter()
                .map(|map| TpdoState::new(map, now_us))
                .collect();
            return;
        }
        for tpdo in &mut self.tpdos {
            if tpdo.maps_object(id) {
                tpdo.data_changed = true;
                if tpdo.map.transmission_type == EVENT_DRIVEN && tpdo.map.event_time == 0 {
                    tpdo.pending = true;
                }
            }
        }
    }

    pub fn process(&mut self, ctx: &mut Ctx) {
        if !self.enabled {
            return;
        }
        for tpdo in &mut self.tpdos {
            if let Some(next_event) = tpdo.next_event_us {
                if ctx.now_us >= next_event {
                    tpdo.next_event_us = Some(ctx.now_us + tpdo.map.event_time as u64 * 1000);
                    transmit(&tpdo.map, ctx);
                }
            }
            if tpdo.pending && ctx.now_us >= tpdo.inhibit_until_us {
                tpdo.pending = false;
                tpdo.data_changed = false;
                tpdo.inhibit_until_us = ctx.now_us + tpdo.map.inhibit_time as u64 * 100;
                transmit(&tpdo.map, ctx);
            }
        }
    }
}

/// Concatenate the mapped raw buffers into one payload and send it
fn transmit(map: &PdoMap, ctx: &mut Ctx) {
    let mut payload = Vec::with_capacity(map.data_size);
    for entry in &map.mapped {
        let raw = if ctx
            .eds
            .get_entry(entry.index)
            .is_some_and(|o| o.is_aggregate())
        {
            ctx.eds.get_raw_sub(entry.index, entry.sub)
        } else {
            ctx.eds.get_raw(entry.index)
        };
        match raw {
            Ok(raw) => payload.extend_from_slice(&raw[0..(entry.bit_length as usize / 8).min(raw.len())]),
            Err(e) => {
                warn!("TPDO read of 0x{:04X} failed: {e}", entry.index);
                return;
            }
        }
    }
    payload.resize(map.data_size, 0);
    ctx.send(CanFrame::new(map.cob_id, &payload));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, TestHarness};
    use canstack_common::types::DataType;
    use canstack_eds::{ObjectSpec, PdoSpec, Value};

    fn harness_with_tpdo(transmission_type: u8, event_time: u16, inhibit: u16) -> TestHarness {
        let mut harness = TestHarness::new(0x0A);
        harness
            .eds
            .add_entry(
                0x2000,
                ObjectSpec::var_with_value("Status", DataType::Unsigned16, Value::Unsigned(0x1122))
                    .mappable(),
            )
            .unwrap();
        harness
            .eds
            .add_entry(
                0x2001,
                ObjectSpec::var_with_value("Speed", DataType::Unsigned16, Value::Unsigned(0x3344))
                    .mappable(),
            )
            .unwrap();
        harness
            .eds
            .add_transmit_pdo(&PdoSpec {
                cob_id: 0x18A,
                transmission_type,
                inhibit_time: inhibit,
                event_time,
                sync_start: 0,
                mapped: vec![(0x2000, None), (0x2001, None)],
            })
            .unwrap();
        harness.eds.take_updates();
        harness
    }

    #[test]
    fn test_cyclic_transmit_every_third_sync() {
        let mut harness = harness_with_tpdo(3, 0, 0);
        let mut pdo = Pdo::new();
        pdo.start(&harness.eds, 0);

        for _ in 0..2 {
            harness.with_ctx(0, |ctx| pdo.on_sync(None, ctx));
        }
        assert!(harness.sent.is_empty());
        harness.with_ctx(0, |ctx| pdo.on_sync(None, ctx));
        assert_eq!(harness.sent.len(), 1);
        assert_eq!(harness.sent[0].cob_id(), 0x18A);
        assert_eq!(harness.sent[0].data(), &[0x22, 0x11, 0x44, 0x33]);

        // Next transmission after three more SYNCs
        for _ in 0..3 {
            harness.with_ctx(0, |ctx| pdo.on_sync(None, ctx));
        }
        assert_eq!(harness.sent.len(), 2);
    }

    #[test]
    fn test_sync_start_gates_transmission() {
        let mut harness = TestHarness::new(0x0A);
        harness
            .eds
            .add_entry(
                0x2000,
                ObjectSpec::var("Status", DataType::Unsigned16).mappable(),
            )
            .unwrap();
        harness
            .eds
            .add_transmit_pdo(&PdoSpec {
                cob_id: 0x18A,
                transmission_type: 1,
                inhibit_time: 0,
                event_time: 0,
                sync_start: 2,
                mapped: vec![(0x2000, None)],
            })
            .unwrap();
        let mut pdo = Pdo::new();
        pdo.start(&harness.eds, 0);

        harness.with_ctx(0, |ctx| pdo.on_sync(Some(1), ctx));
        assert!(harness.sent.is_empty());
        harness.with_ctx(0, |ctx| pdo.on_sync(Some(2), ctx));
        assert_eq!(harness.sent.len(), 1);
    }

    #[test]
    fn test_acyclic_fires_on_change_only() {
        let mut harness = harness_with_tpdo(0, 0, 0);
        let mut pdo = Pdo::new();
        pdo.start(&harness.eds, 0);

        harness.with_ctx(0, |ctx| pdo.on_sync(None, ctx));
        assert!(harness.sent.is_empty());

        harness.eds.set_raw(0x2000, &[1, 0]).unwrap();
        for id in harness.eds.take_updates() {
            pdo.handle_od_update(id, &harness.eds, 0);
        }
        harness.with_ctx(0, |ctx| pdo.on_sync(None, ctx));
        assert_eq!(harness.sent.len(), 1);

        // Unchanged since: silent again
        harness.with_ctx(0, |ctx| pdo.on_sync(None, ctx));
        assert_eq!(harness.sent.len(), 1);
    }

    #[test]
    fn test_event_timer_transmission() {
        let mut harness = harness_with_tpdo(0xFE, 50, 0);
        let mut pdo = Pdo::new();
        pdo.start(&harness.eds, 0);

        harness.with_ctx(10_000, |ctx| pdo.process(ctx));
        assert!(harness.sent.is_empty());
        harness.with_ctx(50_000, |ctx| pdo.process(ctx));
        assert_eq!(harness.sent.len(), 1);
        harness.with_ctx(100_000, |ctx| pdo.process(ctx));
        assert_eq!(harness.sent.len(), 2);
    }

    #[test]
    fn test_event_driven_with_inhibit_coalesces() {
        // 10 ms inhibit in 100 us units
        let mut harness = harness_with_tpdo(0xFE, 0, 100);
        let mut pdo = Pdo::new();
        pdo.start(&harness.eds, 0);

        let mut touch = |harness: &mut TestHarness, pdo: &mut Pdo, value: u16, now: u64| {
            harness.eds.set_raw(0x2000, &value.to_le_bytes()).unwrap();
            for id in harness.eds.take_updates() {
                pdo.handle_od_update(id, &harness.eds, now);
            }
            harness.with_ctx(now, |ctx| pdo.process(ctx));
        };

        touch(&mut harness, &mut pdo, 1, 0);
        assert_eq!(harness.sent.len(), 1);

        // Two rapid updates inside the inhibit window coalesce into one frame
        touch(&mut harness, &mut pdo, 2, 1_000);
        touch(&mut harness, &mut pdo, 3, 2_000);
        assert_eq!(harness.sent.len(), 1);

        harness.with_ctx(10_000, |ctx| pdo.process(ctx));
        assert_eq!(harness.sent.len(), 2);
        assert_eq!(harness.sent[1].data()[0..2], [3, 0]);
    }

    #[test]
    fn test_rpdo_updates_dictionary() {
        let mut harness = TestHarness::new(0x0A);
        harness
            .eds
            .add_entry(
                0x2000,
                ObjectSpec::var("Setpoint", DataType::Unsigned16).mappable(),
            )
            .unwrap();
        harness
            .eds
            .add_receive_pdo(&PdoSpec {
                cob_id: 0x20A,
                transmission_type: 0xFE,
                inhibit_time: 0,
                event_time: 0,
                sync_start: 0,
                mapped: vec![(0x2000, None)],
            })
            .unwrap();
        let mut pdo = Pdo::new();
        pdo.start(&harness.eds, 0);

        let frame = CanFrame::new(0x20A, &[0xCD, 0xAB]);
        harness.with_ctx(0, |ctx| pdo.handle_frame(&frame, ctx));
        assert_eq!(harness.eds.get_raw(0x2000).unwrap(), &[0xCD, 0xAB]);
        assert_eq!(
            drain_events(&mut harness.events),
            vec![NodeEvent::Pdo { cob_id: 0x20A }]
        );

        // Same payload again: values unchanged, no event
        harness.with_ctx(0, |ctx| pdo.handle_frame(&frame, ctx));
        assert!(drain_events(&mut harness.events).is_empty());
    }
}
