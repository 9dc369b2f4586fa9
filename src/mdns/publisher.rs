//! Publication of owned records, [rfc6762] section 8.3.
//!
//! Records may only be registered under names claimed through the probe
//! manager (for PTR records, the name pointed to must be claimed). New and
//! updated records are announced twice, one second apart.
//!
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762

use crate::errors::{Error, Result};
use crate::mdns::probe::MdnsProbeManager;
use crate::mdns::responder::RecordHandler;
use crate::mdns::socket::MdnsSender;
use crate::message::{MdnsMessage, MdnsRecord};
use crate::name::DomainName;
use crate::resource::Rdata;
use crate::runner::TaskRunner;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Delay between the two announcements of a new or updated record.
const ANNOUNCE_REPEAT_DELAY: Duration = Duration::from_secs(1);

struct PublisherInner {
    sender: MdnsSender,
    runner: TaskRunner,
    probe_manager: MdnsProbeManager,
    records: HashMap<DomainName, Vec<MdnsRecord>>,
}

/// Registry of the records this endpoint advertises.
#[derive(Clone)]
pub struct MdnsPublisher {
    inner: Arc<Mutex<PublisherInner>>,
}

impl MdnsPublisher {
    pub fn new(
        sender: MdnsSender,
        runner: TaskRunner,
        probe_manager: MdnsProbeManager,
    ) -> MdnsPublisher {
        MdnsPublisher {
            inner: Arc::new(Mutex::new(PublisherInner {
                sender,
                runner,
                probe_manager,
                records: HashMap::new(),
            })),
        }
    }

    /// Registers a record for advertisement. The record's name (or, for
    /// PTR records, the name pointed to) must already be claimed.
    pub fn register_record(&self, record: MdnsRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_ownership(&inner, &record)?;

        let entries = inner.records.entry(record.name().clone()).or_default();
        if entries.contains(&record) {
            return Err(Error::ItemAlreadyExists(record.name().to_string()));
        }
        entries.push(record.clone());
        drop(inner);

        self.announce(record);
        Ok(())
    }

    /// Replaces `old_record` with `new_record` and re-announces. The two
    /// records must share a name, type and class.
    pub fn update_registered_record(
        &self,
        old_record: &MdnsRecord,
        new_record: MdnsRecord,
    ) -> Result<()> {
        if !old_record.matches_key(&new_record) {
            return Err(Error::ParameterInvalid(
                "update must preserve name, type and class".to_string(),
            ));
        }

        let mut inner = self.inner.lock();
        let Some(entries) = inner.records.get_mut(old_record.name()) else {
            return Err(Error::ItemNotFound(old_record.name().to_string()));
        };
        let Some(index) = entries.iter().position(|r| r == old_record) else {
            return Err(Error::ItemNotFound(old_record.name().to_string()));
        };
        entries[index] = new_record.clone();
        drop(inner);

        self.announce(new_record);
        Ok(())
    }

    /// Stops advertising `record`, sending a goodbye for it.
    pub fn deregister_record(&self, record: &MdnsRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.records.get_mut(record.name()) else {
            return Err(Error::ItemNotFound(record.name().to_string()));
        };
        let Some(index) = entries.iter().position(|r| r == record) else {
            return Err(Error::ItemNotFound(record.name().to_string()));
        };
        entries.remove(index);
        if entries.is_empty() {
            inner.records.remove(record.name());
        }

        // Announce departure with a TTL of zero.
        let mut goodbye = MdnsMessage::new(0, MessageType::Response);
        goodbye.add_answer(record.with_ttl(Duration::ZERO));
        inner.sender.send_multicast(&goodbye);
        Ok(())
    }

    fn check_ownership(&self, inner: &PublisherInner, record: &MdnsRecord) -> Result<()> {
        let owned_name = match record.rdata() {
            Rdata::PTR(target) => target,
            _ => record.name(),
        };
        if !inner.probe_manager.is_domain_claimed(owned_name) {
            return Err(Error::ParameterInvalid(format!(
                "name '{}' has not been claimed",
                owned_name
            )));
        }
        Ok(())
    }

    fn announce(&self, record: MdnsRecord) {
        let inner = self.inner.lock();
        let mut message = MdnsMessage::new(0, MessageType::Response);
        message.add_answer(record.clone());
        inner.sender.send_multicast(&message);

        // Repeat once; skipped if the record was deregistered meanwhile.
        let publisher = self.clone();
        inner.runner.post_task_with_delay(
            move || {
                let inner = publisher.inner.lock();
                let still_registered = inner
                    .records
                    .get(record.name())
                    .map(|entries| entries.contains(&record))
                    .unwrap_or(false);
                if still_registered {
                    let mut message = MdnsMessage::new(0, MessageType::Response);
                    message.add_answer(record.clone());
                    inner.sender.send_multicast(&message);
                }
            },
            ANNOUNCE_REPEAT_DELAY,
        );
    }
}

impl RecordHandler for MdnsPublisher {
    fn is_exclusive_owner(&self, name: &DomainName) -> bool {
        self.inner.lock().probe_manager.is_domain_claimed(name)
    }

    fn has_records(&self, name: &DomainName, dns_type: DnsType, dns_class: DnsClass) -> bool {
        !self.get_records(name, dns_type, dns_class).is_empty()
    }

    fn get_records(
        &self,
        name: &DomainName,
        dns_type: DnsType,
        dns_class: DnsClass,
    ) -> Vec<MdnsRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|record| {
                        (dns_type == DnsType::ANY || dns_type == record.dns_type())
                            && (dns_class == DnsClass::Any || dns_class == record.dns_class())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
