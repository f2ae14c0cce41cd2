use comms::msg::Msg;

use crate::error::TransportFailure;

/// Opens connections to the coordinator.
///
/// The round loop calls `connect` once at startup and again after every
/// transport failure or `Reconnect` instruction.
#[trait_variant::make(Connector: Send)]
pub trait ConnectorTemplate {
    type Conn: Connection;

    /// Establishes a new connection. The handshake is the caller's business.
    async fn connect(&mut self) -> Result<Self::Conn, TransportFailure>;
}

/// One established, message oriented connection to the coordinator.
#[trait_variant::make(Connection: Send)]
pub trait ConnectionTemplate {
    /// Sends a whole message.
    async fn send(&mut self, msg: &Msg) -> Result<(), TransportFailure>;

    /// Waits for the next message.
    ///
    /// # Returns
    /// `Ok(None)` if the coordinator closed the connection cleanly between
    /// two messages.
    async fn recv(&mut self) -> Result<Option<Msg>, TransportFailure>;

    /// Closes the sending side, letting the coordinator see a clean end of
    /// stream.
    async fn close(&mut self) -> Result<(), TransportFailure>;
}
