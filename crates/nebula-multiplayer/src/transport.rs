//! Ordered, reliable message delivery between server and clients.
//!
//! The replication core only talks to the [`ServerTransport`] and
//! [`ClientTransport`] traits. [`loopback`] provides an in-process
//! implementation over `crossbeam-channel`: one single-producer,
//! single-consumer channel per direction per connection, carrying
//! [`codec`](crate::codec)-encoded bytes.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use rustc_hash::FxHashMap;

use crate::codec::{self, CodecError, CompressionConfig};
use crate::messages::{ClientMessage, ServerMessage};
use crate::world::ConnectionId;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Disconnected,

    /// No such connection.
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Byte and message counters for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages sent.
    pub messages_sent: u64,
    /// Encoded bytes sent.
    pub bytes_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Encoded bytes received.
    pub bytes_received: u64,
}

/// Server side of the transport.
pub trait ServerTransport {
    /// Returns a newly connected client, if any.
    fn accept(&mut self) -> Option<ConnectionId>;

    /// Queues `message` for `connection`.
    fn send(&mut self, connection: ConnectionId, message: &ServerMessage) -> Result<(), TransportError>;

    /// Next message from `connection`, if one is waiting.
    fn try_receive(&mut self, connection: ConnectionId) -> Result<Option<ClientMessage>, TransportError>;

    /// Closes `connection`. Unknown connections are ignored.
    fn disconnect(&mut self, connection: ConnectionId);
}

/// Client side of the transport.
pub trait ClientTransport {
    /// Queues `message` for the server.
    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Next message from the server, if one is waiting.
    fn try_receive(&mut self) -> Result<Option<ServerMessage>, TransportError>;
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

struct Link {
    to_client: Sender<Vec<u8>>,
    from_client: Receiver<Vec<u8>>,
}

/// In-process server endpoint.
pub struct LoopbackServerTransport {
    pending: Receiver<Link>,
    links: FxHashMap<ConnectionId, Link>,
    next_id: u64,
    compression: CompressionConfig,
    stats: TransportStats,
}

/// Hands out client endpoints connected to one [`LoopbackServerTransport`].
#[derive(Clone)]
pub struct LoopbackConnector {
    pending: Sender<Link>,
    compression: CompressionConfig,
}

/// In-process client endpoint.
pub struct LoopbackClientTransport {
    to_server: Sender<Vec<u8>>,
    from_server: Receiver<Vec<u8>>,
    compression: CompressionConfig,
    stats: TransportStats,
}

/// Creates a connected server endpoint and connector.
pub fn loopback(compression: CompressionConfig) -> (LoopbackServerTransport, LoopbackConnector) {
    let (tx, rx) = unbounded();
    (
        LoopbackServerTransport {
            pending: rx,
            links: FxHashMap::default(),
            next_id: 1,
            compression: compression.clone(),
            stats: TransportStats::default(),
        },
        LoopbackConnector {
            pending: tx,
            compression,
        },
    )
}

impl LoopbackConnector {
    /// Opens a new connection. Fails once the server endpoint is dropped.
    pub fn connect(&self) -> Result<LoopbackClientTransport, TransportError> {
        let (to_server, from_client) = unbounded();
        let (to_client, from_server) = unbounded();
        self.pending
            .send(Link {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Disconnected)?;
        Ok(LoopbackClientTransport {
            to_server,
            from_server,
            compression: self.compression.clone(),
            stats: TransportStats::default(),
        })
    }
}

impl LoopbackServerTransport {
    /// Counters across every connection.
    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }
}

impl ServerTransport for LoopbackServerTransport {
    fn accept(&mut self) -> Option<ConnectionId> {
        let link = self.pending.try_recv().ok()?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.links.insert(id, link);
        Some(id)
    }

    fn send(&mut self, connection: ConnectionId, message: &ServerMessage) -> Result<(), TransportError> {
        let link = self
            .links
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        let bytes = codec::encode(message, &self.compression)?;
        let len = bytes.len() as u64;
        link.to_client
            .send(bytes)
            .map_err(|_| TransportError::Disconnected)?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    fn try_receive(&mut self, connection: ConnectionId) -> Result<Option<ClientMessage>, TransportError> {
        let link = self
            .links
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        match link.from_client.try_recv() {
            Ok(bytes) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += bytes.len() as u64;
                Ok(Some(codec::decode(&bytes)?))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        self.links.remove(&connection);
    }
}

impl LoopbackClientTransport {
    /// Counters for this endpoint.
    pub fn stats(&self) -> TransportStats {
        self.stats
    }
}

impl ClientTransport for LoopbackClientTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let bytes = codec::encode(message, &self.compression)?;
        let len = bytes.len() as u64;
        self.to_server
            .send(bytes)
            .map_err(|_| TransportError::Disconnected)?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        match self.from_server.try_recv() {
            Ok(bytes) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += bytes.len() as u64;
                Ok(Some(codec::decode(&bytes)?))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_flow_both_ways_in_order() {
        let (mut server, connector) = loopback(CompressionConfig::default());
        let mut client = connector.connect().unwrap();
        let conn = server.accept().unwrap();
        assert!(server.accept().is_none());

        for tick in 1..=3 {
            client
                .send(&ClientMessage::Heartbeat {
                    tick,
                    adjustment_iteration: 0,
                })
                .unwrap();
        }
        for tick in 1..=3 {
            let msg = server.try_receive(conn).unwrap().unwrap();
            assert_eq!(msg.tick_stamp(), Some((tick, 0)));
        }
        assert!(server.try_receive(conn).unwrap().is_none());

        server
            .send(conn, &ServerMessage::Extension { kind: 5, payload: vec![1, 2] })
            .unwrap();
        assert_eq!(
            client.try_receive().unwrap(),
            Some(ServerMessage::Extension { kind: 5, payload: vec![1, 2] })
        );
        assert_eq!(server.stats().messages_received, 3);
        assert_eq!(client.stats().messages_received, 1);
    }

    #[test]
    fn test_dropped_client_surfaces_as_disconnected() {
        let (mut server, connector) = loopback(CompressionConfig::default());
        let mut client = connector.connect().unwrap();
        let conn = server.accept().unwrap();
        client
            .send(&ClientMessage::Heartbeat {
                tick: 1,
                adjustment_iteration: 0,
            })
            .unwrap();
        drop(client);

        // Queued messages still arrive before the close is reported.
        assert!(server.try_receive(conn).unwrap().is_some());
        assert!(matches!(
            server.try_receive(conn),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_server_disconnect_closes_client() {
        let (mut server, connector) = loopback(CompressionConfig::default());
        let mut client = connector.connect().unwrap();
        let conn = server.accept().unwrap();
        server.disconnect(conn);
        assert!(matches!(client.try_receive(), Err(TransportError::Disconnected)));
        assert!(matches!(
            server.send(conn, &ServerMessage::Extension { kind: 0, payload: vec![] }),
            Err(TransportError::UnknownConnection(_))
        ));
    }
}
