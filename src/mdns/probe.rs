//! Probing and name conflict resolution, [rfc6762] section 8.
//!
//! Before advertising records under a name, the publisher probes the
//! network three times, 250 ms apart, to confirm the name is unclaimed.
//! A simultaneous probe by another host is resolved by comparing the
//! authority records lexicographically: the loser postpones one second.
//! After enough collisions the requested name is renamed by appending the
//! attempt count to its first label.
//!
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762

use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::mdns::random::MdnsRandom;
use crate::mdns::socket::MdnsSender;
use crate::message::{MdnsMessage, MdnsQuestion, MdnsRecord};
use crate::name::DomainName;
use crate::resource::Rdata;
use crate::types::*;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Delay before re-probing after losing a simultaneous probe tiebreak,
/// RFC 6762 section 8.2.
const SIMULTANEOUS_PROBE_DELAY: Duration = Duration::from_secs(1);

/// Interval between successive probe queries, RFC 6762 section 8.1.
const PROBE_QUERY_INTERVAL: Duration = Duration::from_millis(250);

/// Number of probe queries that must go unanswered before a name is
/// considered claimed.
const PROBE_QUERY_COUNT: usize = 3;

/// Tiebreak losses tolerated before the requested name is renamed.
pub const DEFAULT_MAX_PROBE_COLLISIONS: usize = 3;

/// Notified when probing for a requested name finishes. The claimed name
/// differs from the requested one if renaming was necessary.
pub trait DomainConfirmedCallback: Send {
    fn on_domain_found(&mut self, requested: DomainName, claimed: DomainName);
}

pub type DomainCallback = Arc<Mutex<dyn DomainConfirmedCallback>>;

struct OngoingProbe {
    id: u64,
    requested_name: DomainName,
    target_name: DomainName,
    address: IpAddr,
    queries_sent: usize,
    collisions: usize,
    rename_attempts: usize,
    generation: u64,
    callback: DomainCallback,
}

struct CompletedProbe {
    target_name: DomainName,
    address: IpAddr,
}

struct ProbeInner {
    sender: MdnsSender,
    runner: crate::runner::TaskRunner,
    random: MdnsRandom,
    max_collisions: usize,
    ongoing: Vec<OngoingProbe>,
    completed: Vec<CompletedProbe>,
    next_probe_id: u64,
}

/// Owns the probe lifecycle for every name this endpoint claims.
#[derive(Clone)]
pub struct MdnsProbeManager {
    inner: Arc<Mutex<ProbeInner>>,
}

impl MdnsProbeManager {
    pub fn new(
        sender: MdnsSender,
        runner: crate::runner::TaskRunner,
        _clock: Arc<dyn Clock>,
        random: MdnsRandom,
    ) -> MdnsProbeManager {
        MdnsProbeManager {
            inner: Arc::new(Mutex::new(ProbeInner {
                sender,
                runner,
                random,
                max_collisions: DEFAULT_MAX_PROBE_COLLISIONS,
                ongoing: Vec::new(),
                completed: Vec::new(),
                next_probe_id: 0,
            })),
        }
    }

    /// Begins probing for `requested_name`, announcing `address` in the
    /// probe's authority section. Fails if the name is already being
    /// probed or already claimed.
    pub fn start_probe(
        &self,
        callback: DomainCallback,
        requested_name: DomainName,
        address: IpAddr,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner
            .ongoing
            .iter()
            .any(|probe| probe.requested_name == requested_name)
        {
            return Err(Error::ItemAlreadyExists(requested_name.to_string()));
        }
        if inner
            .completed
            .iter()
            .any(|probe| probe.target_name == requested_name)
        {
            return Err(Error::ItemAlreadyExists(requested_name.to_string()));
        }

        inner.next_probe_id += 1;
        let id = inner.next_probe_id;
        inner.ongoing.push(OngoingProbe {
            id,
            requested_name: requested_name.clone(),
            target_name: requested_name,
            address,
            queries_sent: 0,
            collisions: 0,
            rename_attempts: 0,
            generation: 0,
            callback,
        });

        let delay = inner.random.initial_probe_delay();
        self.schedule_probe_step(&mut inner, id, delay);
        Ok(())
    }

    /// Abandons an ongoing probe. Claimed names stay claimed.
    pub fn stop_probe(&self, requested_name: &DomainName) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner
            .ongoing
            .iter()
            .position(|probe| probe.requested_name == *requested_name)
        {
            Some(index) => {
                inner.ongoing.remove(index);
                Ok(())
            }
            None => Err(Error::ItemNotFound(requested_name.to_string())),
        }
    }

    pub fn is_domain_claimed(&self, domain: &DomainName) -> bool {
        self.inner
            .lock()
            .completed
            .iter()
            .any(|probe| probe.target_name == *domain)
    }

    /// Handles a probe query received from the network. If a completed
    /// probe owns a questioned name, an address record is sent unicast to
    /// `src`; otherwise a simultaneous probe is tiebroken per RFC 6762
    /// section 8.2.
    pub fn respond_to_probe_query(&self, message: &MdnsMessage, src: std::net::SocketAddr) {
        debug_assert!(!message.questions.is_empty());

        let mut inner = self.inner.lock();

        let mut response = MdnsMessage::new(MdnsMessage::random_id(), MessageType::Response);
        for question in &message.questions {
            if let Some(probe) = inner
                .completed
                .iter()
                .find(|probe| probe.target_name == question.name)
            {
                response.add_answer(address_record(probe.target_name.clone(), probe.address));
            }
        }

        if !response.answers.is_empty() {
            inner.sender.send_unicast(&response, src);
        } else {
            self.tiebreak_simultaneous_probes(&mut inner, message);
        }
    }

    fn tiebreak_simultaneous_probes(&self, inner: &mut ProbeInner, message: &MdnsMessage) {
        if message.authority_records.is_empty() {
            return;
        }

        for question in &message.questions {
            let Some(index) = inner
                .ongoing
                .iter()
                .position(|probe| probe.target_name == question.name)
            else {
                continue;
            };

            // Records are compared pairwise in sorted order until a
            // difference is found. This probe only carries its address
            // record, so only the lowest tiebreaker record matters.
            let lowest = message.authority_records.iter().min().unwrap();
            let probe = &inner.ongoing[index];
            let our_record = address_record(probe.target_name.clone(), probe.address);

            // If our own data is lexicographically later we simply ignore
            // the other host's probe; it performs the same computation and
            // rejects its own. Otherwise defer to the winner by waiting one
            // second before probing again.
            if our_record < *lowest {
                let id = probe.id;
                self.handle_probe_collision(inner, id);
            }
        }
    }

    fn handle_probe_collision(&self, inner: &mut ProbeInner, id: u64) {
        let max_collisions = inner.max_collisions;
        let Some(probe) = inner.ongoing.iter_mut().find(|probe| probe.id == id) else {
            return;
        };

        probe.collisions += 1;
        probe.queries_sent = 0;

        if probe.collisions >= max_collisions {
            // Too many collisions: retry under a renamed first label.
            probe.rename_attempts += 1;
            probe.collisions = 0;
            probe.target_name = retry_domain_name(&probe.requested_name, probe.rename_attempts);
            let new_name = probe.target_name.clone();

            // The renamed target may already be claimed by this endpoint.
            if inner
                .completed
                .iter()
                .any(|completed| completed.target_name == new_name)
            {
                let probe = inner
                    .ongoing
                    .iter()
                    .position(|probe| probe.id == id)
                    .map(|index| inner.ongoing.remove(index))
                    .unwrap();
                let callback = probe.callback.clone();
                let requested = probe.requested_name;
                inner.runner.post_task(move || {
                    callback.lock().on_domain_found(requested, new_name);
                });
                return;
            }
        }

        self.schedule_probe_step(inner, id, SIMULTANEOUS_PROBE_DELAY);
    }

    fn schedule_probe_step(&self, inner: &mut ProbeInner, id: u64, delay: Duration) {
        let Some(probe) = inner.ongoing.iter_mut().find(|probe| probe.id == id) else {
            return;
        };
        probe.generation += 1;
        let generation = probe.generation;
        let manager = self.clone();
        inner
            .runner
            .post_task_with_delay(move || manager.on_probe_step(id, generation), delay);
    }

    fn on_probe_step(&self, id: u64, generation: u64) {
        let mut inner = self.inner.lock();
        let Some(index) = inner
            .ongoing
            .iter()
            .position(|probe| probe.id == id && probe.generation == generation)
        else {
            return; // Probe cancelled or rescheduled.
        };

        if inner.ongoing[index].queries_sent >= PROBE_QUERY_COUNT {
            // Three unanswered probes: the name is ours.
            let probe = inner.ongoing.remove(index);
            inner.completed.push(CompletedProbe {
                target_name: probe.target_name.clone(),
                address: probe.address,
            });
            let callback = probe.callback.clone();
            let requested = probe.requested_name;
            let claimed = probe.target_name;
            inner.runner.post_task(move || {
                callback.lock().on_domain_found(requested, claimed);
            });
            return;
        }

        // Probe queries request unicast responses and carry the proposed
        // record in the authority section, RFC 6762 section 8.1.
        let (query, target) = {
            let probe = &mut inner.ongoing[index];
            probe.queries_sent += 1;
            let mut query = MdnsMessage::new(MdnsMessage::random_id(), MessageType::Query);
            query.add_question(MdnsQuestion::new(
                probe.target_name.clone(),
                DnsType::ANY,
                DnsClass::Internet,
                ResponseType::Unicast,
            ));
            query.add_authority_record(address_record(probe.target_name.clone(), probe.address));
            (query, probe.id)
        };
        inner.sender.send_multicast(&query);
        self.schedule_probe_step(&mut inner, target, PROBE_QUERY_INTERVAL);
    }
}

/// Builds the A or AAAA record a probe advertises for its name.
pub fn address_record(name: DomainName, address: IpAddr) -> MdnsRecord {
    let rdata = match address {
        IpAddr::V4(v4) => Rdata::A(v4),
        IpAddr::V6(v6) => Rdata::AAAA(v6),
    };
    MdnsRecord::new(
        name,
        DnsClass::Internet,
        RecordType::Unique,
        ADDRESS_RECORD_TTL,
        rdata,
    )
}

/// Appends `attempt` to the first label of `name`, truncating the label so
/// that it stays within the DNS label limit.
fn retry_domain_name(name: &DomainName, attempt: usize) -> DomainName {
    debug_assert!(!name.labels().is_empty());
    let mut labels: Vec<String> = name.labels().to_vec();
    let digits = attempt.to_string();

    let mut label = labels[0].clone();
    if label.len() + digits.len() > DomainName::MAX_LABEL_LEN {
        label.truncate(DomainName::MAX_LABEL_LEN - digits.len());
    }
    label.push_str(&digits);
    labels[0] = label;

    DomainName::new(labels).expect("renamed label within limits")
}
