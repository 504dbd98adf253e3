//! Test harness for exercising complete nodes over a simulated bus

pub mod sim_bus;

use canstack_common::lss::LssIdentity;
use canstack_common::types::DataType;
use canstack_eds::{Eds, ObjectSpec, Value};
use canstack_node::{Node, NodeConfig, NodeEvent};

/// The identity written to 0x1018 of a test node
pub fn test_identity(id: u8) -> LssIdentity {
    LssIdentity::new(
        0x1000 + id as u32,
        0x2000 + id as u32,
        1,
        0x9000 + id as u32,
    )
}

/// Build a dictionary with a handful of application objects used across the
/// tests
pub fn test_eds(identity: LssIdentity) -> Eds {
    let mut eds = Eds::new();
    eds.device_info.vendor_name = "canstack".to_string();
    eds.device_info.product_name = "sim node".to_string();
    eds.device_info.lss_supported = true;
    eds.set_identity(identity).unwrap();

    eds.add_entry(0x2000, ObjectSpec::var("Scratch u32", DataType::Unsigned32))
        .unwrap();
    eds.add_entry(
        0x2001,
        ObjectSpec::var_with_value(
            "Greeting",
            DataType::VisibleString,
            Value::VisibleString("Hello, world!".to_string()),
        ),
    )
    .unwrap();
    eds.add_entry(0x2002, ObjectSpec::var("Blob", DataType::OctetString))
        .unwrap();
    eds.add_entry(
        0x2003,
        ObjectSpec::var("Bounded", DataType::Unsigned8)
            .limits(Some(Value::Unsigned(5)), Some(Value::Unsigned(10))),
    )
    .unwrap();
    eds.add_entry(
        0x2010,
        ObjectSpec::var("Status word", DataType::Unsigned16).mappable(),
    )
    .unwrap();
    eds.add_entry(
        0x2011,
        ObjectSpec::var("Velocity", DataType::Unsigned16).mappable(),
    )
    .unwrap();
    eds
}

/// Build and start a node with the test dictionary
pub fn test_node(id: u8) -> Node {
    node_with_eds(id, test_eds(test_identity(id)))
}

/// Build and start a node which also carries SDO client parameters for a
/// server node
pub fn client_node(id: u8, server_id: u8) -> Node {
    let mut eds = test_eds(test_identity(id));
    eds.add_sdo_client_parameter(
        server_id,
        0x600 + server_id as u16,
        0x580 + server_id as u16,
    )
    .unwrap();
    node_with_eds(id, eds)
}

/// Build and start a node from a prepared dictionary
pub fn node_with_eds(id: u8, eds: Eds) -> Node {
    let mut node = Node::new(NodeConfig {
        id,
        eds,
        loopback: false,
        enable_lss: None,
    })
    .unwrap();
    node.start();
    node
}

/// Drain every pending event from a node
pub fn drain_events(node: &mut Node) -> Vec<NodeEvent> {
    let mut events = Vec::new();
    while let Some(event) = node.pop_event() {
        events.push(event);
    }
    events
}
