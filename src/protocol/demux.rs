//! The message demultiplexer: a type-keyed dispatcher over per-stream
//! reassembly buffers.

use crate::errors::{Error, Result};
use crate::protocol::messages::{decode_message, DecodedMessage, MessageType};
use ciborium::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Default cap for one stream's reassembly buffer.
pub const DEFAULT_BUFFER_LIMIT: usize = 1 << 20;

/// Receives decoded messages for a watched (instance, type) pair.
pub trait MessageCallback: Send {
    fn on_message(
        &mut self,
        instance_id: u64,
        stream_id: u64,
        message_type: MessageType,
        body: &Value,
    );

    /// The stream reached EOF.
    fn on_stream_closed(&mut self, _instance_id: u64, _stream_id: u64) {}
}

pub type MessageCallbackHandle = Arc<Mutex<dyn MessageCallback>>;

type WatchKey = (u64, MessageType);

struct DemuxState {
    buffer_limit: usize,
    buffers: HashMap<(u64, u64), Vec<u8>>,
    watches: HashMap<WatchKey, MessageCallbackHandle>,
}

/// Dispatches CBOR messages to watchers keyed by (instance id, message
/// type). Partial reads are buffered per (instance id, stream id) up to a
/// configurable limit; messages without a watcher are decoded and dropped.
#[derive(Clone)]
pub struct MessageDemuxer {
    state: Arc<Mutex<DemuxState>>,
}

/// Removes its watch when dropped, cancelling future callbacks.
pub struct MessageWatch {
    state: Arc<Mutex<DemuxState>>,
    key: WatchKey,
}

impl Drop for MessageWatch {
    fn drop(&mut self) {
        self.state.lock().watches.remove(&self.key);
    }
}

impl MessageDemuxer {
    pub fn new(buffer_limit: usize) -> MessageDemuxer {
        MessageDemuxer {
            state: Arc::new(Mutex::new(DemuxState {
                buffer_limit,
                buffers: HashMap::new(),
                watches: HashMap::new(),
            })),
        }
    }

    /// Installs a watch for messages of `message_type` from `instance_id`.
    /// At most one watch may exist per key.
    pub fn watch_message_type(
        &self,
        instance_id: u64,
        message_type: MessageType,
        callback: MessageCallbackHandle,
    ) -> Result<MessageWatch> {
        let key = (instance_id, message_type);
        let mut state = self.state.lock();
        if state.watches.contains_key(&key) {
            return Err(Error::ItemAlreadyExists(format!(
                "watch for instance {} type {:?}",
                instance_id, message_type
            )));
        }
        state.watches.insert(key, callback);
        Ok(MessageWatch {
            state: self.state.clone(),
            key,
        })
    }

    /// Feeds stream bytes, dispatching every complete message they finish.
    /// Messages framed earlier on the stream dispatch before later ones.
    pub fn on_stream_data(&self, instance_id: u64, stream_id: u64, bytes: &[u8]) -> Result<()> {
        let mut dispatches: Vec<(MessageCallbackHandle, MessageType, Value)> = Vec::new();
        {
            let mut state = self.state.lock();
            let limit = state.buffer_limit;
            let buffered = state
                .buffers
                .get(&(instance_id, stream_id))
                .map_or(0, Vec::len);
            if buffered + bytes.len() > limit {
                state.buffers.remove(&(instance_id, stream_id));
                return Err(Error::ParameterInvalid(format!(
                    "stream {}:{} exceeded its {} byte buffer",
                    instance_id, stream_id, limit
                )));
            }
            state
                .buffers
                .entry((instance_id, stream_id))
                .or_default()
                .extend_from_slice(bytes);

            loop {
                let buffer = state.buffers.get_mut(&(instance_id, stream_id)).unwrap();
                if buffer.is_empty() {
                    break;
                }
                match decode_message(buffer) {
                    Ok(DecodedMessage::Complete {
                        message_type,
                        body,
                        consumed,
                    }) => {
                        buffer.drain(..consumed);
                        match message_type {
                            Some(message_type) => {
                                if let Some(callback) =
                                    state.watches.get(&(instance_id, message_type))
                                {
                                    dispatches.push((callback.clone(), message_type, body));
                                } else {
                                    log::debug!(
                                        "no watch for message type {:?} from instance {}",
                                        message_type,
                                        instance_id
                                    );
                                }
                            }
                            None => {
                                log::debug!("dropping message with unknown type tag");
                            }
                        }
                    }
                    Ok(DecodedMessage::NeedMoreData) => break,
                    Err(e) => {
                        // Malformed stream data: drop the buffer, report
                        // the parse error, leave the demuxer intact.
                        state.buffers.remove(&(instance_id, stream_id));
                        return Err(e);
                    }
                }
            }
        }

        for (callback, message_type, body) in dispatches {
            callback
                .lock()
                .on_message(instance_id, stream_id, message_type, &body);
        }
        Ok(())
    }

    /// Reports EOF for a stream, discarding its buffer and notifying every
    /// watch on the instance.
    pub fn on_stream_close(&self, instance_id: u64, stream_id: u64) {
        let callbacks: Vec<MessageCallbackHandle> = {
            let mut state = self.state.lock();
            state.buffers.remove(&(instance_id, stream_id));
            state
                .watches
                .iter()
                .filter(|((id, _), _)| *id == instance_id)
                .map(|(_, callback)| callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback.lock().on_stream_closed(instance_id, stream_id);
        }
    }

    /// Drops all reassembly buffers for an instance.
    pub fn drop_instance(&self, instance_id: u64) {
        let mut state = self.state.lock();
        state.buffers.retain(|(id, _), _| *id != instance_id);
    }
}

impl Default for MessageDemuxer {
    fn default() -> Self {
        MessageDemuxer::new(DEFAULT_BUFFER_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::*;

    #[derive(Default)]
    struct Recording {
        messages: Vec<(u64, u64, Value)>,
        closed: Vec<(u64, u64)>,
    }

    impl MessageCallback for Recording {
        fn on_message(
            &mut self,
            instance_id: u64,
            stream_id: u64,
            _message_type: MessageType,
            body: &Value,
        ) {
            self.messages.push((instance_id, stream_id, body.clone()));
        }
        fn on_stream_closed(&mut self, instance_id: u64, stream_id: u64) {
            self.closed.push((instance_id, stream_id));
        }
    }

    fn request(id: u64) -> Vec<u8> {
        encode_message(&PresentationUrlAvailabilityRequest {
            request_id: id,
            urls: vec!["https://example.com".to_string()],
        })
        .unwrap()
    }

    #[test]
    fn dispatches_watched_type() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let _watch = demuxer
            .watch_message_type(
                1,
                MessageType::PresentationUrlAvailabilityRequest,
                recording.clone(),
            )
            .unwrap();

        demuxer.on_stream_data(1, 4, &request(7)).unwrap();

        let recording = recording.lock();
        assert_eq!(recording.messages.len(), 1);
        let (instance, stream, body) = &recording.messages[0];
        assert_eq!((*instance, *stream), (1, 4));
        let decoded: PresentationUrlAvailabilityRequest = message_from_body(body).unwrap();
        assert_eq!(decoded.request_id, 7);
    }

    #[test]
    fn buffers_partial_messages() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let _watch = demuxer
            .watch_message_type(
                1,
                MessageType::PresentationUrlAvailabilityRequest,
                recording.clone(),
            )
            .unwrap();

        let bytes = request(7);
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        demuxer.on_stream_data(1, 4, head).unwrap();
        assert!(recording.lock().messages.is_empty());
        demuxer.on_stream_data(1, 4, tail).unwrap();
        assert_eq!(recording.lock().messages.len(), 1);
    }

    #[test]
    fn preserves_framing_order() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let _watch = demuxer
            .watch_message_type(
                1,
                MessageType::PresentationUrlAvailabilityRequest,
                recording.clone(),
            )
            .unwrap();

        let mut bytes = request(1);
        bytes.extend(request(2));
        bytes.extend(request(3));
        demuxer.on_stream_data(1, 4, &bytes).unwrap();

        let ids: Vec<u64> = recording
            .lock()
            .messages
            .iter()
            .map(|(_, _, body)| {
                message_from_body::<PresentationUrlAvailabilityRequest>(body)
                    .unwrap()
                    .request_id
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn watch_per_instance() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let _watch = demuxer
            .watch_message_type(
                1,
                MessageType::PresentationUrlAvailabilityRequest,
                recording.clone(),
            )
            .unwrap();

        // Messages from a different instance are not dispatched.
        demuxer.on_stream_data(2, 4, &request(9)).unwrap();
        assert!(recording.lock().messages.is_empty());
    }

    #[test]
    fn duplicate_watch_rejected() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let watch = demuxer
            .watch_message_type(
                1,
                MessageType::AuthStatus,
                recording.clone(),
            )
            .unwrap();
        assert!(demuxer
            .watch_message_type(1, MessageType::AuthStatus, recording.clone())
            .is_err());

        // Dropping the watch frees the key.
        drop(watch);
        assert!(demuxer
            .watch_message_type(1, MessageType::AuthStatus, recording)
            .is_ok());
    }

    #[test]
    fn dropped_watch_cancels_dispatch() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let watch = demuxer
            .watch_message_type(
                1,
                MessageType::PresentationUrlAvailabilityRequest,
                recording.clone(),
            )
            .unwrap();
        drop(watch);

        demuxer.on_stream_data(1, 4, &request(7)).unwrap();
        assert!(recording.lock().messages.is_empty());
    }

    #[test]
    fn buffer_limit_enforced() {
        let demuxer = MessageDemuxer::new(16);
        let result = demuxer.on_stream_data(1, 4, &[0u8; 32]);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_stream_reports_parse_error() {
        let demuxer = MessageDemuxer::default();
        // 0xFF is not a valid CBOR initial byte outside a container.
        let result = demuxer.on_stream_data(1, 4, &[0xFF, 0xFF]);
        assert!(matches!(result, Err(Error::Parse(_))));

        // The demuxer survives and accepts fresh data on the stream.
        demuxer.on_stream_data(1, 4, &request(1)).unwrap();
    }

    #[test]
    fn close_reports_eof_and_drops_buffer() {
        let demuxer = MessageDemuxer::default();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let _watch = demuxer
            .watch_message_type(
                1,
                MessageType::PresentationUrlAvailabilityRequest,
                recording.clone(),
            )
            .unwrap();

        let bytes = request(7);
        demuxer.on_stream_data(1, 4, &bytes[..4]).unwrap();
        demuxer.on_stream_close(1, 4);
        assert_eq!(recording.lock().closed, vec![(1, 4)]);

        // The partial prefix is gone; the full message decodes cleanly.
        demuxer.on_stream_data(1, 4, &bytes).unwrap();
        assert_eq!(recording.lock().messages.len(), 1);
    }
}
