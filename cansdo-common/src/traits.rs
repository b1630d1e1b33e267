//! Transport traits
//!
//! The SDO engine never touches a CAN controller directly. Bus access is provided by the
//! application through these traits.

use std::error;

use crate::messages::CanMessage;

/// Error type for CAN send operations containing the failed message
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub struct CanSendError(pub CanMessage);

impl core::fmt::Display for CanSendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Failed to send CAN message: {:?}", self.0)
    }
}

impl error::Error for CanSendError {}

/// A synchronous can sender
pub trait CanSender {
    /// Send a message to the bus
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError>;
}

impl<F> CanSender for F
where
    F: FnMut(CanMessage) -> Result<(), CanSendError>,
{
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self(msg)
    }
}

/// An async CAN sender trait
pub trait AsyncCanSender: Send {
    /// Send a message to the bus
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), CanSendError>>;
}

/// An async CAN receiver trait
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: error::Error + Send + 'static;

    /// Receive available message immediately
    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error>;

    /// A blocking receive
    fn recv(
        &mut self,
    ) -> impl core::future::Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) -> Result<(), Self::Error> {
        while self.try_recv()?.is_some() {}
        Ok(())
    }
}
