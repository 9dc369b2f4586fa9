//! openscreen is a peer-to-peer discovery, authentication and messaging
//! stack: a controller device finds receivers on the local network and
//! projects presentation URLs to them over an authenticated connection.
//!
//! # Features
//! * An mDNS querier/responder engine ([rfc6762]):
//!   * record cache with TTL refresh and duplicate suppression,
//!   * probing and name tiebreaking,
//!   * question trackers with exponential backoff, and
//!   * known-answer suppression.
//! * DNS-SD service discovery ([rfc6763]) over a multi-indexed record
//!   graph that materialises service-instance endpoints.
//! * A receiver-listener lifecycle state machine with observer
//!   notifications.
//! * A QUIC protocol endpoint: connection pooling keyed by instance name,
//!   CBOR message demultiplexing, and a password-authenticated key
//!   exchange on P-256.
//! * Device-certificate chain validation against an injected trust store.
//!
//! # Usage (discovery)
//!
//! ```no_run
//! use openscreen::clock::SystemClock;
//! use openscreen::dnssd::querier::{DnsSdQuerier, InstanceListener};
//! use openscreen::dnssd::InstanceEndpoint;
//! use openscreen::mdns::MdnsService;
//! use openscreen::runner::TaskRunner;
//! use openscreen::waiter::SocketWaiter;
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! struct PrintingListener;
//!
//! impl InstanceListener for PrintingListener {
//!     fn on_endpoint_created(&mut self, endpoint: &InstanceEndpoint) {
//!         println!("found {}", endpoint.instance_id);
//!     }
//!     fn on_endpoint_updated(&mut self, _endpoint: &InstanceEndpoint) {}
//!     fn on_endpoint_deleted(&mut self, endpoint: &InstanceEndpoint) {
//!         println!("lost {}", endpoint.instance_id);
//!     }
//! }
//!
//! fn main() -> Result<(), openscreen::Error> {
//!     let clock = Arc::new(SystemClock);
//!     let runner = TaskRunner::new(clock.clone());
//!     let waiter = SocketWaiter::start().expect("socket waiter");
//!
//!     // One engine per network interface; 0 selects the default.
//!     let mdns = MdnsService::new(runner.clone(), clock, &waiter, 0, false)?;
//!     let querier = DnsSdQuerier::new(mdns.querier(), runner.clone(), 0);
//!     querier.start_query("_openscreen._udp", Arc::new(Mutex::new(PrintingListener)))?;
//!
//!     runner.run_until_stopped();
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! ```shell
//! $ cargo test --all
//! ```
//!
//! The discovery and protocol layers are driven in tests by a fake clock
//! and an in-memory socket, so TTL refresh schedules, probe tiebreaks and
//! the authentication exchange run deterministically.
//!
//! ## Reference
//!
//! * [rfc6762]: Multicast DNS
//! * [rfc6763]: DNS-Based Service Discovery
//! * [rfc1035]: DOMAIN NAMES - IMPLEMENTATION AND SPECIFICATION
//! * [rfc7049]: Concise Binary Object Representation (CBOR)
//!
//! [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
//! [rfc6763]: https://datatracker.ietf.org/doc/html/rfc6763
//! [rfc7049]: https://datatracker.ietf.org/doc/html/rfc7049

pub mod agent;
pub mod cert;
pub mod clock;
pub mod crypto;
pub mod dnssd;
mod errors;
mod io;
pub mod listener;
pub mod mdns;
pub mod message;
pub mod name;
pub mod protocol;
pub mod resource;
pub mod runner;
pub mod types;
pub mod waiter;
pub mod watcher;

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate lazy_static;

// Pull up the types that should be on the front page of the docs.
#[doc(inline)]
pub use crate::message::{MdnsMessage, MdnsQuestion, MdnsRecord};

#[doc(inline)]
pub use crate::name::DomainName;

#[doc(inline)]
pub use crate::types::*;

#[doc(inline)]
pub use crate::dnssd::InstanceEndpoint;

#[doc(inline)]
pub use crate::listener::{ListenerState, ReceiverInfo, ReceiverListener};

pub use crate::errors::Error;
pub use crate::errors::Result;
