//! The DNS-SD publish surface: converts a service instance into its
//! PTR/SRV/TXT record set, claims names through the probe manager, and
//! hands the records to the mDNS publisher.

use crate::dnssd::keys::InstanceKey;
use crate::dnssd::txt::TxtRecord;
use crate::errors::{Error, Result};
use crate::mdns::probe::{DomainCallback, DomainConfirmedCallback, MdnsProbeManager};
use crate::mdns::publisher::MdnsPublisher;
use crate::message::MdnsRecord;
use crate::name::DomainName;
use crate::resource::{Rdata, Srv};
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// A service instance to advertise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsSdInstance {
    pub instance_id: String,
    pub service_id: String,
    pub domain_id: String,
    pub port: u16,
    pub txt: TxtRecord,
}

impl DnsSdInstance {
    fn instance_key(&self) -> Result<InstanceKey> {
        InstanceKey::new(&self.instance_id, &self.service_id, &self.domain_id)
    }
}

/// Notified when probing completes. The claimed instance differs from the
/// requested one if the name had to be renamed after collisions.
pub trait PublishClient: Send {
    fn on_instance_claimed(&mut self, requested: &DnsSdInstance, claimed: &DnsSdInstance);
}

pub type PublishClientHandle = Arc<Mutex<dyn PublishClient>>;

struct PublisherState {
    mdns_publisher: MdnsPublisher,
    probe_manager: MdnsProbeManager,
    hostname: DomainName,
    address: IpAddr,
    /// Instances waiting on a probe, keyed by requested instance name.
    pending: HashMap<DomainName, (DnsSdInstance, PublishClientHandle)>,
    /// Claimed instances with their registered records, keyed by the
    /// requested instance id.
    published: HashMap<String, (DnsSdInstance, Vec<MdnsRecord>)>,
}

/// Advertises service instances over mDNS.
#[derive(Clone)]
pub struct DnsSdPublisher {
    inner: Arc<Mutex<PublisherState>>,
}

struct ProbeCompletion {
    publisher: DnsSdPublisher,
}

impl DomainConfirmedCallback for ProbeCompletion {
    fn on_domain_found(&mut self, requested: DomainName, claimed: DomainName) {
        self.publisher.on_instance_name_claimed(requested, claimed);
    }
}

impl DnsSdPublisher {
    /// `hostname` is the A/AAAA owner name for this endpoint (e.g.
    /// `myhost.local`) and `address` the address advertised under it.
    /// The host name itself is claimed before any instance registers, via
    /// [`DnsSdPublisher::claim_host`].
    pub fn new(
        mdns_publisher: MdnsPublisher,
        probe_manager: MdnsProbeManager,
        hostname: DomainName,
        address: IpAddr,
    ) -> DnsSdPublisher {
        DnsSdPublisher {
            inner: Arc::new(Mutex::new(PublisherState {
                mdns_publisher,
                probe_manager,
                hostname,
                address,
                pending: HashMap::new(),
                published: HashMap::new(),
            })),
        }
    }

    /// Probes for the host name and, once claimed, registers its address
    /// record. Must complete before instances become reachable.
    pub fn claim_host(&self) -> Result<()> {
        let state = self.inner.lock();
        let callback: DomainCallback = Arc::new(Mutex::new(HostClaim {
            publisher: self.clone(),
        }));
        state
            .probe_manager
            .start_probe(callback, state.hostname.clone(), state.address)
    }

    /// Starts advertising `instance`. The instance name is probed first;
    /// `client` learns the claimed (possibly renamed) instance.
    pub fn register(&self, instance: DnsSdInstance, client: PublishClientHandle) -> Result<()> {
        let key = instance.instance_key()?;
        let name = key.instance_name();

        let mut state = self.inner.lock();
        if state.pending.contains_key(&name) || state.published.contains_key(&instance.instance_id)
        {
            return Err(Error::ItemAlreadyExists(instance.instance_id));
        }

        let callback: DomainCallback = Arc::new(Mutex::new(ProbeCompletion {
            publisher: self.clone(),
        }));
        state
            .probe_manager
            .start_probe(callback, name.clone(), state.address)?;
        state.pending.insert(name, (instance, client));
        Ok(())
    }

    /// Stops advertising the instance registered under `instance_id`,
    /// sending goodbyes for its records.
    pub fn deregister(&self, instance_id: &str) -> Result<()> {
        let mut state = self.inner.lock();

        if let Some((instance, records)) = state.published.remove(instance_id) {
            for record in records {
                if let Err(e) = state.mdns_publisher.deregister_record(&record) {
                    log::warn!(
                        "failed to deregister record for '{}': {}",
                        instance.instance_id,
                        e
                    );
                }
            }
            return Ok(());
        }

        // Still probing: abandon the probe.
        let pending_name = state
            .pending
            .iter()
            .find(|(_, (instance, _))| instance.instance_id == instance_id)
            .map(|(name, _)| name.clone());
        match pending_name {
            Some(name) => {
                state.pending.remove(&name);
                let _ = state.probe_manager.stop_probe(&name);
                Ok(())
            }
            None => Err(Error::ItemNotFound(instance_id.to_string())),
        }
    }

    fn on_instance_name_claimed(&self, requested: DomainName, claimed: DomainName) {
        let mut notify = None;
        {
            let mut state = self.inner.lock();
            let Some((instance, client)) = state.pending.remove(&requested) else {
                return; // Deregistered while probing.
            };

            let claimed_key = match InstanceKey::from_name(&claimed) {
                Ok(key) => key,
                Err(e) => {
                    log::error!("claimed name '{}' is not an instance name: {}", claimed, e);
                    return;
                }
            };
            let mut claimed_instance = instance.clone();
            claimed_instance.instance_id = claimed_key.instance_id.clone();

            let records = instance_records(&claimed_key, &claimed_instance, &state.hostname);
            let mut registered = Vec::new();
            for record in records {
                match state.mdns_publisher.register_record(record.clone()) {
                    Ok(()) => registered.push(record),
                    Err(e) => {
                        log::error!(
                            "failed to register record for '{}': {}",
                            claimed_instance.instance_id,
                            e
                        );
                    }
                }
            }
            state
                .published
                .insert(instance.instance_id.clone(), (claimed_instance.clone(), registered));
            notify = Some((instance, claimed_instance, client));
        }

        if let Some((requested, claimed, client)) = notify {
            client.lock().on_instance_claimed(&requested, &claimed);
        }
    }

    fn on_host_claimed(&self, _requested: DomainName, claimed: DomainName) {
        let state = self.inner.lock();
        let record = crate::mdns::probe::address_record(claimed, state.address);
        if let Err(e) = state.mdns_publisher.register_record(record) {
            log::error!("failed to register host address record: {}", e);
        }
    }
}

struct HostClaim {
    publisher: DnsSdPublisher,
}

impl DomainConfirmedCallback for HostClaim {
    fn on_domain_found(&mut self, requested: DomainName, claimed: DomainName) {
        self.publisher.on_host_claimed(requested, claimed);
    }
}

/// The PTR, SRV and TXT records advertising one claimed instance.
fn instance_records(
    key: &InstanceKey,
    instance: &DnsSdInstance,
    hostname: &DomainName,
) -> Vec<MdnsRecord> {
    let instance_name = key.instance_name();
    let service_name = key.service_key().service_name();

    vec![
        MdnsRecord::new(
            service_name,
            DnsClass::Internet,
            RecordType::Shared,
            SERVICE_RECORD_TTL,
            Rdata::PTR(instance_name.clone()),
        ),
        MdnsRecord::new(
            instance_name.clone(),
            DnsClass::Internet,
            RecordType::Unique,
            SERVICE_RECORD_TTL,
            Rdata::SRV(Srv {
                priority: 0,
                weight: 0,
                port: instance.port,
                target: hostname.clone(),
            }),
        ),
        MdnsRecord::new(
            instance_name,
            DnsClass::Internet,
            RecordType::Unique,
            SERVICE_RECORD_TTL,
            Rdata::TXT(instance.txt.to_wire()),
        ),
    ]
}
