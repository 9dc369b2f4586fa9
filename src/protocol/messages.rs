//! Typed protocol messages.
//!
//! Every message is CBOR ([rfc7049]): a leading tag selects the message
//! type, and the tagged value carries the fields. Encoding is canonical in
//! the sense that re-encoding a decoded message reproduces its bytes.
//!
//! [rfc7049]: https://datatracker.ietf.org/doc/html/rfc7049

use crate::errors::{Error, Result};
use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;

/// Message type tags.
#[derive(Copy, Clone, Debug, FromPrimitive, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    AuthSpake2Handshake = 1001,
    AuthSpake2Confirmation = 1003,
    AuthStatus = 1005,
    PresentationUrlAvailabilityRequest = 2000,
    PresentationUrlAvailabilityResponse = 2001,
}

/// A message that frames itself under a CBOR type tag.
pub trait TypedMessage: Serialize + DeserializeOwned {
    const TYPE: MessageType;
}

/// Asks a receiver which of the given URLs it can present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationUrlAvailabilityRequest {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    pub urls: Vec<String>,
}

impl TypedMessage for PresentationUrlAvailabilityRequest {
    const TYPE: MessageType = MessageType::PresentationUrlAvailabilityRequest;
}

/// URL availability states, one per requested URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationUrlAvailabilityResponse {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    /// 0 = available, 1 = unavailable, 10 = invalid.
    #[serde(rename = "url-availabilities")]
    pub url_availabilities: Vec<u8>,
}

impl TypedMessage for PresentationUrlAvailabilityResponse {
    const TYPE: MessageType = MessageType::PresentationUrlAvailabilityResponse;
}

/// First message of the authentication exchange: the sender's public
/// value, an uncompressed P-256 point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpake2Handshake {
    #[serde(rename = "public-value", with = "serde_bytes")]
    pub public_value: Vec<u8>,
}

impl TypedMessage for AuthSpake2Handshake {
    const TYPE: MessageType = MessageType::AuthSpake2Handshake;
}

/// Proof of shared-key knowledge: SHA-512 over the derived key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpake2Confirmation {
    #[serde(with = "serde_bytes")]
    pub proof: Vec<u8>,
}

impl TypedMessage for AuthSpake2Confirmation {
    const TYPE: MessageType = MessageType::AuthSpake2Confirmation;
}

/// Final authentication verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    /// 0 = authenticated, 1 = proof invalid.
    pub result: u64,
}

impl AuthStatus {
    pub const AUTHENTICATED: u64 = 0;
    pub const PROOF_INVALID: u64 = 1;
}

impl TypedMessage for AuthStatus {
    const TYPE: MessageType = MessageType::AuthStatus;
}

/// Encodes `message` as its tagged CBOR representation.
pub fn encode_message<M: TypedMessage>(message: &M) -> Result<Vec<u8>> {
    let body = Value::serialized(message)
        .map_err(|e| Error::ParameterInvalid(format!("unencodable message: {}", e)))?;
    let tagged = Value::Tag(M::TYPE as u64, Box::new(body));

    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&tagged, &mut bytes)
        .map_err(|e| Error::ParameterInvalid(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

/// Result of attempting to decode one message from a stream buffer.
pub enum DecodedMessage {
    /// A complete tagged message: its type tag, body, and the number of
    /// bytes consumed. The tag may be unknown to this endpoint.
    Complete {
        message_type: Option<MessageType>,
        body: Value,
        consumed: usize,
    },
    /// The buffer holds only a prefix of a message.
    NeedMoreData,
}

/// Decodes the first CBOR item in `buf`.
///
/// # Errors
///
/// Returns a parse error for malformed CBOR or for a well-formed item that
/// is not a tagged value; the caller drops the stream buffer.
pub fn decode_message(buf: &[u8]) -> Result<DecodedMessage> {
    use num_traits::FromPrimitive;

    let mut cursor = io::Cursor::new(buf);
    let value: Value = match ciborium::de::from_reader(&mut cursor) {
        Ok(value) => value,
        Err(ciborium::de::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(DecodedMessage::NeedMoreData);
        }
        Err(e) => {
            return Err(Error::Parse(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed CBOR message: {}", e),
            )));
        }
    };

    let consumed = cursor.position() as usize;
    match value {
        Value::Tag(tag, body) => Ok(DecodedMessage::Complete {
            message_type: MessageType::from_u64(tag),
            body: *body,
            consumed,
        }),
        _ => Err(Error::Parse(io::Error::new(
            io::ErrorKind::InvalidData,
            "message does not start with a type tag",
        ))),
    }
}

/// Converts a decoded body into its typed form.
pub fn message_from_body<M: TypedMessage>(body: &Value) -> Result<M> {
    body.deserialized().map_err(|e| {
        Error::Parse(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed message body: {}", e),
        ))
    })
}
