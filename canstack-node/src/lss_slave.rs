//! LSS slave
//!
//! Answers LSS requests on COB-ID 0x7E5: global and selective mode
//! switching, node-ID configuration, identity inquiry, and Fastscan
//! participation. Bit-timing configuration and persistent storage are
//! answered as not supported.

use canstack_common::lss::{
    LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM,
};
use canstack_common::messages::LSS_REQUEST_COB_ID;
use canstack_common::CanFrame;
use log::{debug, info};

use crate::ctx::Ctx;
use crate::events::NodeEvent;

/// Error code answered for services the node does not support
const LSS_ERR_NOT_SUPPORTED: u8 = 1;

#[derive(Default)]
struct SelectiveMatch {
    vendor: bool,
    product: bool,
    revision: bool,
}

pub(crate) struct LssSlave {
    state: LssState,
    identity: LssIdentity,
    selective: SelectiveMatch,
    fast_scan_sub: u8,
    /// A node ID accepted via ConfigureNodeId, picked up by the facade
    pending_node_id: Option<u8>,
}

impl LssSlave {
    pub fn new() -> Self {
        Self {
            state: LssState::Waiting,
            identity: LssIdentity::default(),
            selective: SelectiveMatch::default(),
            fast_scan_sub: 0,
            pending_node_id: None,
        }
    }

    /// Refresh the identity from object 0x1018
    pub fn start(&mut self, identity: LssIdentity) {
        self.identity = identity;
    }

    /// Take a node ID assigned by the LSS master, if one arrived
    pub fn take_pending_node_id(&mut self) -> Option<u8> {
        self.pending_node_id.take()
    }

    fn set_state(&mut self, state: LssState, ctx: &mut Ctx) {
        if state != self.state {
            debug!("LSS mode changed to {state:?}");
            self.state = state;
            ctx.emit(NodeEvent::LssModeChange { mode: state });
        }
    }

    fn respond(&self, response: LssResponse, ctx: &mut Ctx) {
        ctx.send(response.into());
    }

    pub fn handle_frame(&mut self, frame: &CanFrame, ctx: &mut Ctx) {
        if frame.cob_id() != LSS_REQUEST_COB_ID {
            return;
        }
        let Ok(request) = LssRequest::try_from(frame.data()) else {
            return;
        };

        match request {
            LssRequest::SwitchModeGlobal { mode } => {
                if let Ok(state) = LssState::from_byte(mode) {
                    self.set_state(state, ctx);
                    self.selective = SelectiveMatch::default();
                }
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                self.selective = SelectiveMatch {
                    vendor: vendor_id == self.identity.vendor_id,
                    ..Default::default()
                };
            }
            LssRequest::SwitchStateProduct { product_code } => {
                self.selective.product =
                    self.selective.vendor && product_code == self.identity.product_code;
            }
            LssRequest::SwitchStateRevision { revision } => {
                self.selective.revision =
                    self.selective.product && revision == self.identity.revision;
            }
            LssRequest::SwitchStateSerial { serial } => {
                if self.selective.revision && serial == self.identity.serial {
                    self.set_state(LssState::Configuring, ctx);
                    self.respond(LssResponse::SwitchStateResponse, ctx);
                }
                self.selective = SelectiveMatch::default();
            }
            LssRequest::ConfigureNodeId { node_id } => {
                if self.state != LssState::Configuring {
                    return;
                }
                if (1..=127).contains(&node_id) {
                    info!("LSS assigned node ID {node_id}");
                    self.pending_node_id = Some(node_id);
                    ctx.emit(NodeEvent::LssNodeIdChange { node_id });
                    self.respond(
                        LssResponse::ConfigureNodeIdAck {
                            error: 0,
                            spec_error: 0,
                        },
                        ctx,
                    );
                } else {
                    self.respond(
                        LssResponse::ConfigureNodeIdAck {
                            error: LSS_ERR_NOT_SUPPORTED,
                            spec_error: 0,
                        },
                        ctx,
                    );
                }
            }
            LssRequest::ConfigureBitTiming { .. } => {
                if self.state != LssState::Configuring {
                    return;
                }
                // Bit-timing reconfiguration is not supported
                self.respond(
                    LssResponse::ConfigureBitTimingAck {
                        error: LSS_ERR_NOT_SUPPORTED,
                        spec_error: 0,
                    },
                    ctx,
                );
            }
            LssRequest::ActivateBitTiming { .. } => {}
            LssRequest::StoreConfiguration => {
                if self.state != LssState::Configuring {
                    return;
                }
                // No persistent storage is attached
                self.respond(
                    LssResponse::StoreConfigurationAck {
                        error: LSS_ERR_NOT_SUPPORTED,
                        spec_error: 0,
                    },
                    ctx,
                );
            }
            LssRequest::InquireVendor => {
                if self.state == LssState::Configuring {
                    self.respond(
                        LssResponse::InquireVendorAck {
                            vendor_id: self.identity.vendor_id,
                        },
                        ctx,
                    );
                }
            }
            LssRequest::InquireProduct => {
                if self.state == LssState::Configuring {
                    self.respond(
                        LssResponse::InquireProductAck {
                            product_code: self.identity.product_code,
                        },
                        ctx,
                    );
                }
            }
            LssRequest::InquireRev => {
                if self.state == LssState::Configuring {
                    self.respond(
                        LssResponse::InquireRevAck {
                            revision: self.identity.revision,
                        },
                        ctx,
                    );
                }
            }
            LssRequest::InquireSerial => {
                if self.state == LssState::Configuring {
                    self.respond(
                        LssResponse::InquireSerialAck {
                            serial: self.identity.serial,
                        },
                        ctx,
                    );
                }
            }
            LssRequest::InquireNodeId => {
                if self.state == LssState::Configuring {
                    self.respond(
                        LssResponse::InquireNodeIdAck {
                            node_id: ctx.node_id.raw(),
                        },
                        ctx,
                    );
                }
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => self.handle_fastscan(id, bit_check, sub, next, ctx),
        }
    }

    fn handle_fastscan(&mut self, id: u32, bit_check: u8, sub: u8, next: u8, ctx: &mut Ctx) {
        if self.state != LssState::Waiting {
            return;
        }
        if bit_check == LSS_FASTSCAN_CONFIRM {
            // Reset the scan state machine and confirm participation
            self.fast_scan_sub = 0;
            self.respond(LssResponse::IdentifySlave, ctx);
        } else if self.fast_scan_sub == sub && sub < 4 && bit_check <= 32 {
            let mask = (0xFFFF_FFFFu64 << bit_check) as u32;
            if self.identity.by_addr(sub) & mask == id & mask {
                self.fast_scan_sub = next;
                if bit_check == 0 && next < sub {
                    // All identity words matched; enter configuration state
                    self.set_state(LssState::Configuring, ctx);
                }
                self.respond(LssResponse::IdentifySlave, ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, TestHarness};

    const IDENTITY: LssIdentity = LssIdentity {
        vendor_id: 0x0000_1234,
        product_code: 0x0005_6789,
        revision: 0x0000_0002,
        serial: 0x00BC_614E,
    };

    fn send(harness: &mut TestHarness, slave: &mut LssSlave, request: LssRequest) {
        let frame: CanFrame = request.into();
        harness.with_ctx(0, |ctx| slave.handle_frame(&frame, ctx));
    }

    fn slave() -> LssSlave {
        let mut slave = LssSlave::new();
        slave.start(IDENTITY);
        slave
    }

    #[test]
    fn test_switch_mode_global() {
        let mut harness = TestHarness::new(0x0A);
        let mut slave = slave();
        send(&mut harness, &mut slave, LssRequest::SwitchModeGlobal { mode: 1 });
        assert_eq!(slave.state, LssState::Configuring);
        assert_eq!(
            drain_events(&mut harness.events),
            vec![NodeEvent::LssModeChange {
                mode: LssState::Configuring
            }]
        );
        // No response is sent to a global mode switch
        assert!(harness.sent.is_empty());
    }

    #[test]
    fn test_switch_selective_requires_full_identity() {
        let mut harness = TestHarness::new(0x0A);
        let mut slave = slave();

        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateVendor {
                vendor_id: IDENTITY.vendor_id,
            },
        );
        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateProduct {
                product_code: IDENTITY.product_code,
            },
        );
        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateRevision {
                revision: IDENTITY.revision,
            },
        );
        // Wrong serial: no response, still waiting
        send(&mut harness, &mut slave, LssRequest::SwitchStateSerial { serial: 1 });
        assert!(harness.sent.is_empty());
        assert_eq!(slave.state, LssState::Waiting);

        // A second pass with the right serial requires the full sequence again
        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateVendor {
                vendor_id: IDENTITY.vendor_id,
            },
        );
        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateProduct {
                product_code: IDENTITY.product_code,
            },
        );
        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateRevision {
                revision: IDENTITY.revision,
            },
        );
        send(
            &mut harness,
            &mut slave,
            LssRequest::SwitchStateSerial {
                serial: IDENTITY.serial,
            },
        );
        assert_eq!(slave.state, LssState::Configuring);
        let frame = harness.sent.last().unwrap();
        assert_eq!(
            LssResponse::try_from(frame.data()),
            Ok(LssResponse::SwitchStateResponse)
        );
    }

    #[test]
    fn test_configure_node_id() {
        let mut harness = TestHarness::new(0x0A);
        let mut slave = slave();

        // Ignored while waiting
        send(&mut harness, &mut slave, LssRequest::ConfigureNodeId { node_id: 42 });
        assert!(harness.sent.is_empty());

        send(&mut harness, &mut slave, LssRequest::SwitchModeGlobal { mode: 1 });
        send(&mut harness, &mut slave, LssRequest::ConfigureNodeId { node_id: 42 });
        let frame = harness.sent.last().unwrap();
        assert_eq!(frame.data()[0..3], [0x11, 0, 0]);
        assert_eq!(slave.take_pending_node_id(), Some(42));
        assert!(drain_events(&mut harness.events)
            .contains(&NodeEvent::LssNodeIdChange { node_id: 42 }));

        // Out-of-range IDs are refused
        send(&mut harness, &mut slave, LssRequest::ConfigureNodeId { node_id: 0 });
        let frame = harness.sent.last().unwrap();
        assert_eq!(frame.data()[0..3], [0x11, 1, 0]);
        assert_eq!(slave.take_pending_node_id(), None);
    }

    #[test]
    fn test_unsupported_services() {
        let mut harness = TestHarness::new(0x0A);
        let mut slave = slave();
        send(&mut harness, &mut slave, LssRequest::SwitchModeGlobal { mode: 1 });

        send(
            &mut harness,
            &mut slave,
            LssRequest::ConfigureBitTiming { table: 0, index: 3 },
        );
        assert_eq!(
            LssResponse::try_from(harness.sent.last().unwrap().data()),
            Ok(LssResponse::ConfigureBitTimingAck {
                error: 1,
                spec_error: 0
            })
        );

        send(&mut harness, &mut slave, LssRequest::StoreConfiguration);
        assert_eq!(
            LssResponse::try_from(harness.sent.last().unwrap().data()),
            Ok(LssResponse::StoreConfigurationAck {
                error: 1,
                spec_error: 0
            })
        );
    }

    #[test]
    fn test_inquire_identity() {
        let mut harness = TestHarness::new(0x0A);
        let mut slave = slave();
        send(&mut harness, &mut slave, LssRequest::SwitchModeGlobal { mode: 1 });

        send(&mut harness, &mut slave, LssRequest::InquireVendor);
        send(&mut harness, &mut slave, LssRequest::InquireSerial);
        send(&mut harness, &mut slave, LssRequest::InquireNodeId);
        let responses: Vec<LssResponse> = harness
            .sent
            .iter()
            .map(|f| LssResponse::try_from(f.data()).unwrap())
            .collect();
        assert_eq!(
            responses,
            vec![
                LssResponse::InquireVendorAck {
                    vendor_id: IDENTITY.vendor_id
                },
                LssResponse::InquireSerialAck {
                    serial: IDENTITY.serial
                },
                LssResponse::InquireNodeIdAck { node_id: 0x0A },
            ]
        );
    }

    /// Run a full master-side fastscan sweep against the slave
    #[test]
    fn test_fastscan_discovers_identity() {
        let mut harness = TestHarness::new(0x0A);
        let mut slave = slave();

        let mut send_fs =
            |harness: &mut TestHarness, slave: &mut LssSlave, id: u32, bit_check: u8, sub: u8, next: u8| {
                harness.sent.clear();
                send(
                    harness,
                    slave,
                    LssRequest::FastScan {
                        id,
                        bit_check,
                        sub,
                        next,
                    },
                );
                !harness.sent.is_empty()
            };

        assert!(
            send_fs(&mut harness, &mut slave, 0, LSS_FASTSCAN_CONFIRM, 0, 0),
            "No confirmation response"
        );

        let mut id = [0u32; 4];
        for sub in 0..4u8 {
            for bit_check in (0..32).rev() {
                if !send_fs(&mut harness, &mut slave, id[sub as usize], bit_check, sub, sub) {
                    id[sub as usize] |= 1 << bit_check;
                }
            }
            let next = (sub + 1) % 4;
            assert!(
                send_fs(&mut harness, &mut slave, id[sub as usize], 0, sub, next),
                "No ack after completing word {sub}"
            );
        }

        assert_eq!(
            id,
            [
                IDENTITY.vendor_id,
                IDENTITY.product_code,
                IDENTITY.revision,
                IDENTITY.serial
            ]
        );
        assert_eq!(slave.state, LssState::Configuring);
    }
}
