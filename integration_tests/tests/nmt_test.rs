use canstack_common::messages::{CanFrame, NmtCommandSpecifier, NmtState};
use canstack_node::NodeEvent;

use integration_tests::sim_bus::SimBus;
use integration_tests::{drain_events, node_with_eds, test_eds, test_identity, test_node};

#[test]
fn test_boot_up_sequence() {
    let mut node = test_node(0x0A);
    let mut bus = SimBus::new();
    bus.step(&mut [&mut node]);

    assert_eq!(node.nmt_state(), NmtState::PreOperational);
    // Boot-up message on the heartbeat COB-ID with state 0
    let heartbeats = bus.frames_on(0x70A);
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].data(), &[0]);
    assert_eq!(
        drain_events(&mut node),
        vec![NodeEvent::StateChange {
            state: NmtState::PreOperational
        }]
    );
}

#[test]
fn test_broadcast_state_transitions() {
    let mut node = test_node(0x0A);
    let mut bus = SimBus::new();
    bus.step(&mut [&mut node]);
    drain_events(&mut node);

    bus.inject(&mut [&mut node], CanFrame::new(0, &[1, 0]));
    bus.step(&mut [&mut node]);
    bus.inject(&mut [&mut node], CanFrame::new(0, &[2, 0]));
    bus.step(&mut [&mut node]);

    assert_eq!(
        drain_events(&mut node),
        vec![
            NodeEvent::StateChange {
                state: NmtState::Operational
            },
            NodeEvent::StateChange {
                state: NmtState::Stopped
            },
        ]
    );
    assert_eq!(node.nmt_state(), NmtState::Stopped);
}

#[test]
fn test_reset_restarts_the_node() {
    let mut node = test_node(0x0A);
    let mut bus = SimBus::new();
    bus.step(&mut [&mut node]);
    drain_events(&mut node);

    bus.inject(&mut [&mut node], CanFrame::new(0, &[129, 0x0A]));
    bus.step(&mut [&mut node]);
    bus.step(&mut [&mut node]);

    let events = drain_events(&mut node);
    assert!(events.contains(&NodeEvent::Reset { application: true }));
    // The node came back up through PreOperational and sent a fresh boot-up
    // message
    assert_eq!(node.nmt_state(), NmtState::PreOperational);
    assert_eq!(bus.frames_on(0x70A).len(), 2);
}

#[test]
fn test_heartbeat_loss_fires_single_timeout() {
    let mut eds = test_eds(test_identity(0x0A));
    eds.add_heartbeat_consumer(0x0B, 100).unwrap();
    let mut node = node_with_eds(0x0A, eds);
    let mut bus = SimBus::new();
    bus.step(&mut [&mut node]);
    drain_events(&mut node);

    // Silence before the first heartbeat never fires the monitor
    bus.run_for(&mut [&mut node], 400_000);
    assert!(drain_events(&mut node).is_empty());

    // One heartbeat from node B, then silence
    bus.inject(
        &mut [&mut node],
        CanFrame::new(0x70B, &[NmtState::Operational as u8]),
    );
    bus.run_for(&mut [&mut node], 99_000);
    assert_eq!(
        drain_events(&mut node),
        vec![NodeEvent::Heartbeat {
            node_id: 0x0B,
            state: NmtState::Operational
        }]
    );
    assert_eq!(node.node_state(0x0B), Some(NmtState::Operational));

    // Within (100, 150) ms of the heartbeat: exactly one timeout
    bus.run_for(&mut [&mut node], 50_000);
    assert_eq!(
        drain_events(&mut node),
        vec![NodeEvent::HeartbeatTimeout { node_id: 0x0B }]
    );
    bus.run_for(&mut [&mut node], 500_000);
    assert!(drain_events(&mut node).is_empty());

    // A returning producer re-arms a fresh cycle
    bus.inject(
        &mut [&mut node],
        CanFrame::new(0x70B, &[NmtState::Operational as u8]),
    );
    bus.run_for(&mut [&mut node], 150_000);
    let events = drain_events(&mut node);
    assert!(events.contains(&NodeEvent::HeartbeatTimeout { node_id: 0x0B }));
}

#[test]
fn test_remote_state_request_and_command() {
    let mut eds = test_eds(test_identity(0x01));
    eds.add_heartbeat_consumer(0x0A, 500).unwrap();
    let mut master = node_with_eds(0x01, eds);

    let mut eds = test_eds(test_identity(0x0A));
    eds.set_heartbeat_producer_time(50).unwrap();
    let mut device = node_with_eds(0x0A, eds);

    let mut bus = SimBus::new();
    bus.step(&mut [&mut master, &mut device]);

    // Command the device into Operational from the master
    master.send_nmt_command(NmtCommandSpecifier::Start, 0x0A);
    bus.run_for(&mut [&mut master, &mut device], 10_000);
    assert_eq!(device.nmt_state(), NmtState::Operational);

    // The next heartbeat resolves a fresh state request
    let handle = master.request_node_state(0x0A, Some(200));
    bus.run_for(&mut [&mut master, &mut device], 100_000);
    assert_eq!(handle.try_result(), Some(Some(NmtState::Operational)));
}
