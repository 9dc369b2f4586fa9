//! DNS-Based Service Discovery over the mDNS engine, [rfc6763]: the
//! record graph, instance endpoints, and the query/publish surfaces.
//!
//! [rfc6763]: https://datatracker.ietf.org/doc/html/rfc6763

pub mod endpoint;
pub mod graph;
pub mod keys;
pub mod publisher;
pub mod querier;
pub mod txt;

pub use endpoint::InstanceEndpoint;
pub use graph::{domain_group_for, DnsDataGraph, DomainGroup};
pub use keys::{InstanceKey, ServiceKey};
pub use publisher::{DnsSdInstance, DnsSdPublisher};
pub use querier::DnsSdQuerier;
pub use txt::TxtRecord;
