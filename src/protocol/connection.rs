//! Transport seams and per-connection stream bookkeeping.
//!
//! The endpoint does not reimplement the QUIC wire format: connections and
//! streams arrive through these traits, backed by whatever IETF QUIC v1
//! implementation the embedder wires in. Tests use in-memory fakes.

use crate::errors::Result;
use crate::protocol::messages::{encode_message, TypedMessage};

/// The write half of one bidirectional QUIC stream.
pub trait QuicStream: Send {
    fn id(&self) -> u64;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn close_write(&mut self);
}

/// One QUIC connection to a peer instance.
pub trait QuicConnection: Send {
    fn instance_name(&self) -> &str;
    fn open_stream(&mut self) -> Result<Box<dyn QuicStream>>;
    fn close(&mut self);
}

/// A bidirectional byte stream surfaced to the embedder after
/// authentication. Every message sent on it is a tagged CBOR message.
pub struct ProtocolConnection {
    instance_id: u64,
    stream: Box<dyn QuicStream>,
}

impl ProtocolConnection {
    pub fn new(instance_id: u64, stream: Box<dyn QuicStream>) -> ProtocolConnection {
        ProtocolConnection {
            instance_id,
            stream,
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn stream_id(&self) -> u64 {
        self.stream.id()
    }

    pub fn send_message<M: TypedMessage>(&mut self, message: &M) -> Result<()> {
        let bytes = encode_message(message)?;
        self.stream.write(&bytes)
    }

    pub fn close_write(&mut self) {
        self.stream.close_write();
    }
}

/// Per-connection stream bookkeeping. The endpoint exclusively owns the
/// connection through this manager; the protocol connections handed to the
/// embedder refer back only by instance id, never by pointer.
pub struct StreamManager {
    connection: Box<dyn QuicConnection>,
    open_streams: Vec<u64>,
}

impl StreamManager {
    pub fn new(connection: Box<dyn QuicConnection>) -> StreamManager {
        StreamManager {
            connection,
            open_streams: Vec::new(),
        }
    }

    pub fn instance_name(&self) -> &str {
        self.connection.instance_name()
    }

    /// Opens a fresh outgoing stream wrapped as a protocol connection.
    pub fn open_protocol_connection(&mut self, instance_id: u64) -> Result<ProtocolConnection> {
        let stream = self.connection.open_stream()?;
        self.open_streams.push(stream.id());
        Ok(ProtocolConnection::new(instance_id, stream))
    }

    /// Opens a fresh outgoing stream for internal use.
    pub fn open_stream(&mut self) -> Result<Box<dyn QuicStream>> {
        let stream = self.connection.open_stream()?;
        self.open_streams.push(stream.id());
        Ok(stream)
    }

    /// Adopts an incoming stream, surfacing it as a protocol connection.
    pub fn adopt_incoming_stream(
        &mut self,
        instance_id: u64,
        stream: Box<dyn QuicStream>,
    ) -> ProtocolConnection {
        self.open_streams.push(stream.id());
        ProtocolConnection::new(instance_id, stream)
    }

    pub fn drop_stream(&mut self, stream_id: u64) {
        self.open_streams.retain(|&id| id != stream_id);
    }

    pub fn close(&mut self) {
        self.connection.close();
    }
}
