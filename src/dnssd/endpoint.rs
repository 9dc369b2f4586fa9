//! The materialised view of a discovered service instance.

use crate::dnssd::txt::TxtRecord;
use crate::errors::{Error, Result};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// A fully resolved service instance: identity, TXT metadata, and at least
/// one of an IPv4 and an IPv6 endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceEndpoint {
    pub instance_id: String,
    pub service_id: String,
    pub domain_id: String,
    pub txt: TxtRecord,
    pub address_v4: Option<SocketAddrV4>,
    pub address_v6: Option<SocketAddrV6>,
    pub network_interface: u32,
}

impl InstanceEndpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: String,
        service_id: String,
        domain_id: String,
        txt: TxtRecord,
        address_v4: Option<SocketAddrV4>,
        address_v6: Option<SocketAddrV6>,
        network_interface: u32,
    ) -> Result<InstanceEndpoint> {
        if address_v4.is_none() && address_v6.is_none() {
            return Err(Error::ParameterInvalid(format!(
                "instance '{}' has no address",
                instance_id
            )));
        }
        Ok(InstanceEndpoint {
            instance_id,
            service_id,
            domain_id,
            txt,
            address_v4,
            address_v6,
            network_interface,
        })
    }

    /// Every endpoint address, IPv4 first.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        let mut addresses = Vec::new();
        if let Some(v4) = self.address_v4 {
            addresses.push(SocketAddr::V4(v4));
        }
        if let Some(v6) = self.address_v6 {
            addresses.push(SocketAddr::V6(v6));
        }
        addresses
    }

    /// True when `other` names the same instance, regardless of resolved
    /// addresses or metadata.
    pub fn same_instance(&self, other: &InstanceEndpoint) -> bool {
        self.instance_id == other.instance_id
            && self.service_id == other.service_id
            && self.domain_id == other.domain_id
    }
}
