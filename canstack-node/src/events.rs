//! Observable node events

use canstack_common::lss::LssState;
use canstack_common::messages::NmtState;
use canstack_common::types::TimeStamp;

/// A parsed emergency message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmcyMessage {
    /// The emergency error code
    pub code: u16,
    /// The producer's error register at the time of emission
    pub register: u8,
    /// Manufacturer specific information bytes
    pub info: [u8; 5],
}

impl EmcyMessage {
    /// Parse an 8-byte EMCY payload
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            code: u16::from_le_bytes([data[0], data[1]]),
            register: data[2],
            info: data[3..8].try_into().unwrap(),
        })
    }

    /// Serialize to an 8-byte EMCY payload
    pub fn to_payload(&self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&self.code.to_le_bytes());
        payload[2] = self.register;
        payload[3..8].copy_from_slice(&self.info);
        payload
    }
}

/// Events published by a [`crate::Node`]
///
/// Events accumulate inside the node and are drained with
/// [`crate::Node::pop_event`]. Outbound frames are not an event; they flow
/// through the sender passed to [`crate::Node::process`].
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// An emergency message arrived from a consumed producer
    Emergency {
        /// The COB-ID the message arrived on
        cob_id: u16,
        /// The parsed message
        message: EmcyMessage,
    },
    /// A SYNC was received
    Sync {
        /// The counter byte, when the producer carries one
        counter: Option<u8>,
    },
    /// A TIME broadcast was received
    Time {
        /// The decoded timestamp
        timestamp: TimeStamp,
    },
    /// A mapped receive PDO updated at least one dictionary value
    Pdo {
        /// The COB-ID of the PDO
        cob_id: u16,
    },
    /// A heartbeat arrived from a monitored node
    Heartbeat {
        /// The monitored node's ID
        node_id: u8,
        /// The state it reported
        state: NmtState,
    },
    /// A monitored node's heartbeat went silent past its timeout
    HeartbeatTimeout {
        /// The monitored node's ID
        node_id: u8,
    },
    /// An NMT reset command addressed this node
    Reset {
        /// True for a full application reset, false for a communication reset
        application: bool,
    },
    /// This node's NMT state changed
    StateChange {
        /// The new state
        state: NmtState,
    },
    /// The LSS slave changed mode
    LssModeChange {
        /// The new mode
        mode: LssState,
    },
    /// The LSS slave was assigned a new node ID
    LssNodeIdChange {
        /// The newly assigned ID
        node_id: u8,
    },
}
