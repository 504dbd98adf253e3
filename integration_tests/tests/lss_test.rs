use canstack_common::lss::LssState;
use canstack_node::{LssRequestHandle, Node, NodeEvent};

use integration_tests::sim_bus::SimBus;
use integration_tests::{drain_events, node_with_eds, test_eds, test_identity};

fn run_until<T>(
    bus: &mut SimBus,
    nodes: &mut [&mut Node],
    handle: &LssRequestHandle<T>,
) -> Result<T, canstack_node::LssError> {
    for _ in 0..5_000 {
        bus.step(nodes);
        if let Some(result) = handle.try_result() {
            return result;
        }
    }
    panic!("LSS service did not resolve");
}

#[test]
fn test_configure_node_id_moves_heartbeat() {
    let mut master = node_with_eds(0x01, test_eds(test_identity(0x01)));

    let mut eds = test_eds(test_identity(0x05));
    eds.set_heartbeat_producer_time(50).unwrap();
    let mut slave = node_with_eds(0x05, eds);

    let mut bus = SimBus::new();
    bus.step(&mut [&mut master, &mut slave]);
    drain_events(&mut slave);

    // Select the slave by identity, then assign it node ID 42
    let handle = master.lss_switch_mode_select(test_identity(0x05), Some(10));
    run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();

    let handle = master.lss_configure_node_id(42, Some(10));
    run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();

    // The slave acknowledged with success code 0
    let ack = bus
        .frames_on(0x7E4)
        .into_iter()
        .find(|f| f.data()[0] == 0x11)
        .expect("No ConfigureNodeId ack on the bus");
    assert_eq!(ack.data()[1], 0);

    let events = drain_events(&mut slave);
    assert!(events.contains(&NodeEvent::LssNodeIdChange { node_id: 42 }));
    assert!(events.contains(&NodeEvent::LssModeChange {
        mode: LssState::Configuring
    }));

    // After the communication reset, heartbeats move to 0x700 + 42
    bus.run_for(&mut [&mut master, &mut slave], 200_000);
    assert_eq!(slave.id(), 42);
    assert!(!bus.frames_on(0x700 + 42).is_empty());
    let old_heartbeats = bus.frames_on(0x705).len();
    bus.run_for(&mut [&mut master, &mut slave], 200_000);
    assert_eq!(bus.frames_on(0x705).len(), old_heartbeats);
}

#[test]
fn test_inquire_identity_of_selected_slave() {
    let mut master = node_with_eds(0x01, test_eds(test_identity(0x01)));
    let mut slave = node_with_eds(0x05, test_eds(test_identity(0x05)));
    let mut bus = SimBus::new();
    bus.step(&mut [&mut master, &mut slave]);

    let handle = master.lss_switch_mode_select(test_identity(0x05), Some(10));
    run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();

    let handle = master.lss_inquire(canstack_node::InquireKind::Serial, Some(10));
    let serial = run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();
    assert_eq!(serial, test_identity(0x05).serial);

    let handle = master.lss_inquire(canstack_node::InquireKind::NodeId, Some(10));
    let node_id = run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();
    assert_eq!(node_id, 0x05);
}

#[test]
fn test_bit_timing_and_store_are_unsupported() {
    let mut master = node_with_eds(0x01, test_eds(test_identity(0x01)));
    let mut slave = node_with_eds(0x05, test_eds(test_identity(0x05)));
    let mut bus = SimBus::new();
    bus.step(&mut [&mut master, &mut slave]);

    let handle = master.lss_switch_mode_select(test_identity(0x05), Some(10));
    run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();

    let handle = master.lss_configure_bit_timing(0, 3, Some(10));
    let result = run_until(&mut bus, &mut [&mut master, &mut slave], &handle);
    assert_eq!(
        result,
        Err(canstack_node::LssError::BitTimingConfigError {
            error: 1,
            spec_error: 0
        })
    );

    let handle = master.lss_store_configuration(Some(10));
    let result = run_until(&mut bus, &mut [&mut master, &mut slave], &handle);
    assert_eq!(
        result,
        Err(canstack_node::LssError::StoreConfigError {
            error: 1,
            spec_error: 0
        })
    );
}

#[test]
fn test_fastscan_discovers_single_slave() {
    let mut master = node_with_eds(0x01, test_eds(test_identity(0x01)));
    let mut slave = node_with_eds(0x05, test_eds(test_identity(0x05)));
    let mut bus = SimBus::new();
    bus.step(&mut [&mut master, &mut slave]);
    drain_events(&mut slave);

    let handle = master.lss_fastscan(Some(5));
    let found = run_until(&mut bus, &mut [&mut master, &mut slave], &handle).unwrap();
    assert_eq!(found, Some(test_identity(0x05)));

    // The discovered slave switched to configuration mode
    assert!(drain_events(&mut slave).contains(&NodeEvent::LssModeChange {
        mode: LssState::Configuring
    }));

    // 4 x 32 sweep rounds plus 4 verification rounds
    let rounds = bus.frames_on(0x7E5).len();
    assert_eq!(rounds, 4 * 32 + 4);
}

#[test]
fn test_fastscan_empty_bus_resolves_none() {
    let mut master = node_with_eds(0x01, test_eds(test_identity(0x01)));
    let mut bus = SimBus::new();
    bus.step(&mut [&mut master]);

    let handle = master.lss_fastscan(Some(5));
    let found = run_until(&mut bus, &mut [&mut master], &handle).unwrap();
    assert_eq!(found, None);
}
