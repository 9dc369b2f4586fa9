//! The protocol endpoint: typed CBOR messages over QUIC streams, the
//! message demultiplexer, password-authenticated key exchange, and the
//! connection-pooling service endpoint.

pub mod auth;
pub mod connection;
pub mod demux;
pub mod endpoint;
pub mod messages;

pub use connection::{ProtocolConnection, QuicConnection, QuicStream};
pub use demux::MessageDemuxer;
pub use endpoint::{EndpointState, ProtocolEndpoint, Role};
pub use messages::MessageType;
