//! Keys identifying services and service instances, converting between
//! the user-visible string ids and mDNS domain names.

use crate::errors::{Error, Result};
use crate::message::MdnsRecord;
use crate::name::DomainName;
use crate::resource::Rdata;

/// Identifies a service type within a domain, e.g.
/// `("_openscreen._udp", "local")`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub service_id: String,
    pub domain_id: String,
}

impl ServiceKey {
    pub fn new(service_id: &str, domain_id: &str) -> Result<ServiceKey> {
        let parts: Vec<&str> = service_id.split('.').collect();
        if parts.len() != 2 || !parts.iter().all(|p| p.starts_with('_') && p.len() > 1) {
            return Err(Error::ParameterInvalid(format!(
                "invalid service id '{}'",
                service_id
            )));
        }
        if domain_id.is_empty() {
            return Err(Error::ParameterInvalid("empty domain id".to_string()));
        }
        Ok(ServiceKey {
            service_id: service_id.to_ascii_lowercase(),
            domain_id: domain_id.to_ascii_lowercase(),
        })
    }

    /// The name PTR queries for this service are issued against, e.g.
    /// `_openscreen._udp.local`.
    pub fn service_name(&self) -> DomainName {
        let mut labels: Vec<&str> = self.service_id.split('.').collect();
        labels.extend(self.domain_id.split('.'));
        DomainName::new(labels).expect("validated on construction")
    }
}

/// Identifies one service instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub instance_id: String,
    pub service_id: String,
    pub domain_id: String,
}

impl InstanceKey {
    pub fn new(instance_id: &str, service_id: &str, domain_id: &str) -> Result<InstanceKey> {
        if instance_id.is_empty() {
            return Err(Error::ParameterInvalid("empty instance id".to_string()));
        }
        let service = ServiceKey::new(service_id, domain_id)?;
        Ok(InstanceKey {
            instance_id: instance_id.to_string(),
            service_id: service.service_id,
            domain_id: service.domain_id,
        })
    }

    /// Parses an instance name of the form
    /// `<instance>.<_service>.<_proto>.<domain…>`.
    pub fn from_name(name: &DomainName) -> Result<InstanceKey> {
        let labels = name.labels();
        if labels.len() < 4 {
            return Err(Error::ParameterInvalid(format!(
                "'{}' is not an instance name",
                name
            )));
        }
        let service_id = format!("{}.{}", labels[1], labels[2]);
        let domain_id = labels[3..].join(".");
        InstanceKey::new(labels[0].as_str(), &service_id, &domain_id)
    }

    /// The instance key a record belongs to: the PTR target for PTR
    /// records, the owner name otherwise.
    pub fn from_record(record: &MdnsRecord) -> Result<InstanceKey> {
        match record.rdata() {
            Rdata::PTR(target) => InstanceKey::from_name(target),
            _ => InstanceKey::from_name(record.name()),
        }
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey {
            service_id: self.service_id.clone(),
            domain_id: self.domain_id.clone(),
        }
    }

    /// The full instance domain name.
    pub fn instance_name(&self) -> DomainName {
        let mut labels: Vec<&str> = vec![&self.instance_id];
        labels.extend(self.service_id.split('.'));
        labels.extend(self.domain_id.split('.'));
        DomainName::new(labels).expect("validated on construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn service_key_roundtrip() {
        let key = ServiceKey::new("_openscreen._udp", "local").unwrap();
        assert_eq!(key.service_name().to_string(), "_openscreen._udp.local.");
    }

    #[test]
    fn invalid_service_ids_rejected() {
        assert!(ServiceKey::new("_openscreen", "local").is_err());
        assert!(ServiceKey::new("openscreen._udp", "local").is_err());
        assert!(ServiceKey::new("_openscreen._udp", "").is_err());
    }

    #[test]
    fn instance_key_from_name() {
        let name = DomainName::from_str("TV._openscreen._udp.local").unwrap();
        let key = InstanceKey::from_name(&name).unwrap();
        assert_eq!(key.instance_id, "TV");
        assert_eq!(key.service_id, "_openscreen._udp");
        assert_eq!(key.domain_id, "local");
        assert_eq!(key.instance_name(), name);
    }

    #[test]
    fn instance_id_keeps_case() {
        // The instance label is user-visible and preserves case; service
        // and domain are normalized.
        let key = InstanceKey::new("My TV", "_OpenScreen._UDP", "LOCAL").unwrap();
        assert_eq!(key.instance_id, "My TV");
        assert_eq!(key.service_id, "_openscreen._udp");
        assert_eq!(key.domain_id, "local");
    }

    #[test]
    fn too_short_name_rejected() {
        let name = DomainName::from_str("_openscreen._udp.local").unwrap();
        assert!(InstanceKey::from_name(&name).is_err());
    }
}
