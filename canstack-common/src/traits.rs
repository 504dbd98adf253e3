//! Common traits

use snafu::Snafu;

use crate::messages::CanFrame;

/// Error returned when a frame could not be handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
#[snafu(display("Failed to send CAN frame"))]
pub struct CanSendError;

/// A synchronous CAN sender
///
/// The stack hands every outbound frame to an implementation of this trait.
/// Frames for the same COB-ID must be delivered in the order they were sent.
pub trait CanSender {
    /// Send a frame to the bus
    ///
    /// A send failure is reported back to the protocol handler that produced
    /// the frame; it must not panic or block.
    fn send(&mut self, frame: CanFrame) -> Result<(), CanSendError>;
}

impl<F> CanSender for F
where
    F: FnMut(CanFrame) -> Result<(), CanSendError>,
{
    fn send(&mut self, frame: CanFrame) -> Result<(), CanSendError> {
        self(frame)
    }
}
