//! The mDNS engine: multicast socket plumbing, record and question
//! trackers, the probe manager, the querier, and the publisher/responder
//! pair. See [rfc6762].
//!
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762

pub mod probe;
pub mod publisher;
pub mod querier;
pub mod random;
pub mod responder;
pub mod service;
pub mod socket;
pub mod trackers;

pub use probe::MdnsProbeManager;
pub use publisher::MdnsPublisher;
pub use querier::MdnsQuerier;
pub use responder::MdnsResponder;
pub use service::MdnsService;
pub use socket::{MdnsReceiver, MdnsSender};
