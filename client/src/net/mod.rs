mod connection;
mod tcp;

pub use connection::{Connection, ConnectionTemplate, Connector, ConnectorTemplate};
pub use tcp::{FramedConnection, TcpConnector};
