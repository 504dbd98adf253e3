//! Message definitions
//!
//! The CAN frame model used throughout the stack, plus the fixed-format
//! broadcast messages (NMT command, heartbeat, SYNC, TIME).

use snafu::Snafu;

use crate::types::TimeStamp;

/// Largest valid 11-bit COB-ID
pub const MAX_COB_ID: u16 = 0x7FF;

const MAX_DATA_LENGTH: usize = 8;

/// The COB-ID used for sending NMT commands
pub const NMT_COB_ID: u16 = 0x000;
/// The default COB-ID for SYNC messages
pub const SYNC_COB_ID: u16 = 0x080;
/// The default COB-ID for TIME messages
pub const TIME_COB_ID: u16 = 0x100;
/// The base COB-ID for emergency messages (node ID is added)
pub const EMCY_BASE: u16 = 0x080;
/// The base COB-ID for heartbeat messages (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The default base COB-ID for SDO requests (server node ID is added)
pub const SDO_REQUEST_BASE: u16 = 0x600;
/// The default base COB-ID for SDO responses (server node ID is added)
pub const SDO_RESPONSE_BASE: u16 = 0x580;
/// The COB-ID used for LSS slave responses
pub const LSS_RESPONSE_COB_ID: u16 = 0x7E4;
/// The COB-ID used for LSS master requests
pub const LSS_REQUEST_COB_ID: u16 = 0x7E5;

/// A single CAN 2.0A data frame
///
/// Only standard 11-bit identifiers are modeled; the stack neither produces
/// nor consumes extended frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFrame {
    cob_id: u16,
    data: [u8; MAX_DATA_LENGTH],
    dlc: u8,
}

impl CanFrame {
    /// Create a new frame
    ///
    /// Panics if `cob_id` exceeds the 11-bit range or `data` is longer than 8
    /// bytes. Both are programming errors, not runtime conditions.
    pub fn new(cob_id: u16, data: &[u8]) -> Self {
        if cob_id > MAX_COB_ID {
            panic!("COB-ID 0x{cob_id:X} exceeds the 11-bit identifier range");
        }
        if data.len() > MAX_DATA_LENGTH {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..data.len()].copy_from_slice(data);
        Self {
            cob_id,
            data: buf,
            dlc: data.len() as u8,
        }
    }

    /// Get the COB-ID of the frame
    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Get the number of data bytes in the frame
    pub fn dlc(&self) -> u8 {
        self.dlc
    }
}

/// The NMT state transition command specifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Indicates device should transition to the Operational state
    Start = 1,
    /// Indicates device should transition to the Stopped state
    Stop = 2,
    /// Indicates device should transition to the PreOperational state
    EnterPreOp = 128,
    /// Indicates device should perform an application reset
    ResetApp = 129,
    /// Indicates device should perform a communications reset
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Create an NmtCommandSpecifier from the byte value transmitted in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command message
#[derive(Clone, Copy, Debug)]
pub struct NmtCommand {
    /// Specifies the type of command
    pub cs: NmtCommandSpecifier,
    /// Indicates the node it applies to. A node of 0 indicates a broadcast command to all nodes.
    pub node: u8,
}

impl TryFrom<&CanFrame> for NmtCommand {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let payload = frame.data();
        if frame.cob_id() != NMT_COB_ID {
            Err(MessageError::UnexpectedId {
                cob_id: frame.cob_id(),
                expected: NMT_COB_ID,
            })
        } else if payload.len() >= 2 {
            let cs = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanFrame {
    fn from(cmd: NmtCommand) -> Self {
        CanFrame::new(NMT_COB_ID, &[cmd.cs as u8, cmd.node])
    }
}

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Startup state, left automatically on the first transition to PreOperational
    Initializing = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state
    Operational = 5,
    /// Node is awaiting command to enter operation
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initializing => write!(f, "Initializing"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

impl TryFrom<u8> for NmtState {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initializing as u8 => Ok(Initializing),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(MessageError::InvalidNmtState { value }),
        }
    }
}

/// A heartbeat message
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// The ID of the node transmitting the heartbeat
    pub node: u8,
    /// The current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanFrame {
    fn from(value: Heartbeat) -> Self {
        CanFrame::new(HEARTBEAT_BASE + value.node as u16, &[value.state as u8])
    }
}

impl TryFrom<&CanFrame> for Heartbeat {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        if frame.cob_id() & !0x7F != HEARTBEAT_BASE {
            return Err(MessageError::UnexpectedId {
                cob_id: frame.cob_id(),
                expected: HEARTBEAT_BASE,
            });
        }
        if frame.data().is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let node = (frame.cob_id() & 0x7F) as u8;
        // Some stacks toggle bit 7; mask it off before interpreting the state
        let state = (frame.data()[0] & 0x7F).try_into()?;
        Ok(Heartbeat { node, state })
    }
}

/// A SYNC message
///
/// The counter byte is present only when the producer has a nonzero
/// synchronous counter overflow configured. It counts 1..=overflow and wraps.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncMessage {
    /// The counter value, if the producer carries one
    pub counter: Option<u8>,
}

impl SyncMessage {
    /// Convert to a frame on the given SYNC COB-ID
    pub fn to_frame(self, cob_id: u16) -> CanFrame {
        match self.counter {
            Some(count) => CanFrame::new(cob_id, &[count]),
            None => CanFrame::new(cob_id, &[]),
        }
    }

    /// Parse a SYNC payload
    pub fn from_frame(frame: &CanFrame) -> Self {
        Self {
            counter: frame.data().first().copied(),
        }
    }
}

/// A TIME message carrying a TIME_OF_DAY timestamp
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeMessage {
    /// The timestamp carried by the message
    pub timestamp: TimeStamp,
}

impl TimeMessage {
    /// Convert to a frame on the given TIME COB-ID
    pub fn to_frame(self, cob_id: u16) -> CanFrame {
        CanFrame::new(cob_id, &self.timestamp.to_bytes())
    }

    /// Parse a TIME payload
    pub fn from_frame(frame: &CanFrame) -> Result<Self, MessageError> {
        let timestamp =
            TimeStamp::from_bytes(frame.data()).ok_or(MessageError::MessageTooShort)?;
        Ok(Self { timestamp })
    }
}

/// An error for problems converting CAN frames to stack message types
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some way
    #[snafu(display("Malformed message on COB-ID 0x{cob_id:03X}"))]
    MalformedMsg {
        /// The COB-ID of the malformed message
        cob_id: u16,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: 0x{cob_id:03X}, expected: 0x{expected:03X}"))]
    UnexpectedId {
        /// Received ID
        cob_id: u16,
        /// Expected ID
        expected: u16,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
    /// An invalid LSS command specifier was found in the message
    #[snafu(display("Unexpected LSS command: {value}"))]
    UnexpectedLssCommand {
        /// The invalid byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_round_trip() {
        let cmd = NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 0x11,
        };
        let frame: CanFrame = cmd.into();
        assert_eq!(frame.cob_id(), 0);
        assert_eq!(frame.data(), &[1, 0x11]);

        let parsed = NmtCommand::try_from(&frame).unwrap();
        assert_eq!(parsed.cs, NmtCommandSpecifier::Start);
        assert_eq!(parsed.node, 0x11);
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let hb = Heartbeat {
            node: 42,
            state: NmtState::Operational,
        };
        let frame: CanFrame = hb.into();
        assert_eq!(frame.cob_id(), 0x700 + 42);
        assert_eq!(frame.data(), &[5]);

        let parsed = Heartbeat::try_from(&frame).unwrap();
        assert_eq!(parsed.node, 42);
        assert_eq!(parsed.state, NmtState::Operational);
    }

    #[test]
    fn test_sync_counter() {
        let frame = SyncMessage { counter: Some(3) }.to_frame(0x80);
        assert_eq!(frame.data(), &[3]);
        assert_eq!(SyncMessage::from_frame(&frame).counter, Some(3));

        let frame = SyncMessage { counter: None }.to_frame(0x80);
        assert!(frame.data().is_empty());
        assert_eq!(SyncMessage::from_frame(&frame).counter, None);
    }
}
