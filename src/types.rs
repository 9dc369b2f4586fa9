//! Wire-level types shared by the mDNS engine and the discovery layers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// The mDNS IPv4 multicast group, [rfc6762] section 3.
///
/// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
pub const MDNS_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The mDNS IPv6 link-local multicast group.
pub const MDNS_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);

/// The mDNS UDP port.
pub const MDNS_PORT: u16 = 5353;

lazy_static! {
    /// Destination for multicast queries and responses over IPv4.
    pub static ref MDNS_IPV4_ENDPOINT: SocketAddr =
        SocketAddr::new(IpAddr::V4(MDNS_IPV4_GROUP), MDNS_PORT);

    /// Destination for multicast queries and responses over IPv6.
    pub static ref MDNS_IPV6_ENDPOINT: SocketAddr =
        SocketAddr::new(IpAddr::V6(MDNS_IPV6_GROUP), MDNS_PORT);
}

/// Maximum UDP payload for a multicast mDNS message: the 1500-byte ethernet
/// MTU less IP and UDP headers.
pub const MAX_MULTICAST_MESSAGE_SIZE: usize = 1500 - 20 - 8;

/// The DNS-SD service type advertised and browsed by this stack.
pub const OPENSCREEN_SERVICE_TYPE: &str = "_openscreen._udp";

/// TTL for A and AAAA host records, [rfc6762] section 10 recommends 120
/// seconds for records containing host names.
pub const ADDRESS_RECORD_TTL: Duration = Duration::from_secs(120);

/// TTL for PTR, SRV and TXT records (75 minutes).
pub const SERVICE_RECORD_TTL: Duration = Duration::from_secs(75 * 60);

/// Resource Record Type subset used by DNS-SD, see [rfc1035] and [rfc2782].
///
/// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
/// [rfc2782]: https://datatracker.ietf.org/doc/html/rfc2782
#[derive(Copy, Clone, Debug, Display, EnumString, FromPrimitive, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u16)]
pub enum DnsType {
    /// IPv4 Address.
    A = 1,

    /// Domain name pointer; maps a service type to its instances.
    PTR = 12,

    /// Text strings; key/value metadata for a service instance.
    TXT = 16,

    /// IPv6 Address.
    AAAA = 28,

    /// Server selection; maps an instance to its host and port.
    SRV = 33,

    /// Next-secure record, used by mDNS for negative responses. See
    /// [rfc4034].
    ///
    /// [rfc4034]: https://datatracker.ietf.org/doc/html/rfc4034
    NSEC = 47,

    /// Any record type. Only valid in a question.
    ANY = 255,
}

/// Resource Record Class. mDNS uses the Internet class; the high bit of the
/// wire-format class field is the cache-flush bit and is carried separately
/// in [`RecordType`].
#[derive(Copy, Clone, Debug, Display, EnumString, FromPrimitive, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DnsClass {
    /// (Default) The Internet (IN), see [rfc1035].
    ///
    /// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
    #[strum(serialize = "IN")]
    Internet = 1,

    /// * (ANY). Only valid in a question.
    #[strum(serialize = "*")]
    Any = 255,
}

/// The cache-flush bit of the wire-format class field, [rfc6762] section
/// 10.2.
pub const CACHE_FLUSH_BIT: u16 = 0x8000;

/// Whether a record is member of a shared or a unique resource record set.
///
/// Unique records carry the cache-flush bit and replace previously cached
/// records with the same name, type and class. Shared records (PTR)
/// accumulate.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum RecordType {
    Shared,
    Unique,
}

/// Query or Response, from the header QR bit.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum MessageType {
    Query,
    Response,
}

impl MessageType {
    pub fn from_bool(qr: bool) -> MessageType {
        match qr {
            false => MessageType::Query,
            true => MessageType::Response,
        }
    }

    pub fn to_bool(self) -> bool {
        match self {
            MessageType::Query => false,
            MessageType::Response => true,
        }
    }
}

/// Whether a question requests a multicast or a unicast response
/// (the QU bit of the wire-format class field), [rfc6762] section 5.4.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Multicast,
    Unicast,
}

/// The unicast-response bit of a question's wire-format class field.
pub const UNICAST_RESPONSE_BIT: u16 = 0x8000;

/// Change notifications produced by the record cache and consumed by the
/// DNS-SD graph. Expired covers both natural TTL expiry and goodbye
/// records.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum RecordChangedEvent {
    Created,
    Updated,
    Expired,
}
