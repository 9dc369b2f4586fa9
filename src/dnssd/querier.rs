//! The DNS-SD query surface: subscribes to service types, maintains the
//! record graph from mDNS record changes, and notifies listeners with
//! materialised instance endpoints.

use crate::dnssd::endpoint::InstanceEndpoint;
use crate::dnssd::graph::{domain_group_for, DnsDataGraph, DomainGroup};
use crate::dnssd::keys::ServiceKey;
use crate::errors::{Error, Result};
use crate::mdns::querier::{MdnsQuerier, RecordCallback};
use crate::message::MdnsRecord;
use crate::name::DomainName;
use crate::runner::TaskRunner;
use crate::types::{DnsClass, DnsType, RecordChangedEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Notified as instance endpoints appear, change and disappear.
pub trait InstanceListener: Send {
    fn on_endpoint_created(&mut self, endpoint: &InstanceEndpoint);
    fn on_endpoint_updated(&mut self, endpoint: &InstanceEndpoint);
    fn on_endpoint_deleted(&mut self, endpoint: &InstanceEndpoint);
}

pub type ListenerHandle = Arc<Mutex<dyn InstanceListener>>;

#[derive(Copy, Clone)]
enum EndpointChange {
    Created,
    Updated,
    Deleted,
}

type Dispatch = (ListenerHandle, InstanceEndpoint, EndpointChange);

struct QuerierState {
    mdns: MdnsQuerier,
    runner: TaskRunner,
    graph: DnsDataGraph,
    listeners: HashMap<ServiceKey, Vec<(u64, ListenerHandle)>>,
    /// The mDNS query started for each tracked graph node.
    domain_queries: HashMap<DomainName, (DnsType, u64)>,
    /// The callback registered with the mDNS querier; set once after
    /// construction.
    record_callback: Option<RecordCallback>,
    next_listener_id: u64,
}

impl QuerierState {
    fn start_domain_query(&mut self, domain: DomainName) {
        // Service roots are queried for PTR records; instance and host
        // nodes are queried for everything they hold.
        let dns_type = if self
            .listeners
            .keys()
            .any(|key| key.service_name() == domain)
        {
            DnsType::PTR
        } else {
            DnsType::ANY
        };

        let callback = self.record_callback.clone().expect("wired at construction");
        let id = self
            .mdns
            .start_query(&domain, dns_type, DnsClass::Internet, callback);
        self.domain_queries.insert(domain, (dns_type, id));
    }

    fn stop_domain_query(&mut self, domain: &DomainName) {
        if let Some((dns_type, id)) = self.domain_queries.remove(domain) {
            self.mdns
                .stop_query(domain, dns_type, DnsClass::Internet, id);
        }
    }

    fn listeners_for(&self, endpoint: &InstanceEndpoint) -> Vec<ListenerHandle> {
        let key = ServiceKey {
            service_id: endpoint.service_id.clone(),
            domain_id: endpoint.domain_id.clone(),
        };
        self.listeners
            .get(&key)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

/// Browses DNS-SD services. One instance owns one record graph; every
/// tracked domain has a matching continuous mDNS query.
#[derive(Clone)]
pub struct DnsSdQuerier {
    inner: Arc<Mutex<QuerierState>>,
}

impl DnsSdQuerier {
    pub fn new(mdns: MdnsQuerier, runner: TaskRunner, network_interface: u32) -> DnsSdQuerier {
        let querier = DnsSdQuerier {
            inner: Arc::new(Mutex::new(QuerierState {
                mdns,
                runner,
                graph: DnsDataGraph::new(network_interface),
                listeners: HashMap::new(),
                domain_queries: HashMap::new(),
                record_callback: None,
                next_listener_id: 0,
            })),
        };

        let handle = querier.clone();
        let callback: RecordCallback = Arc::new(Mutex::new(
            move |record: &MdnsRecord, event: RecordChangedEvent| {
                handle.on_record_changed(record.clone(), event);
            },
        ));
        querier.inner.lock().record_callback = Some(callback);

        querier
    }

    /// Starts browsing `service` (e.g. `_openscreen._udp`) in the local
    /// domain and returns the listener's subscription id. A late
    /// subscriber is replayed the already-materialised endpoints.
    pub fn start_query(&self, service: &str, listener: ListenerHandle) -> Result<u64> {
        let key = ServiceKey::new(service, "local")?;

        let mut state = self.inner.lock();
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        let is_first = !state.listeners.contains_key(&key);
        state
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, listener));

        if is_first {
            let root = key.service_name();
            let mut started = Vec::new();
            state
                .graph
                .start_tracking(&root, &mut |domain| started.push(domain.clone()))?;
            for domain in started {
                state.start_domain_query(domain);
            }
        } else {
            // Replay once the caller's stack unwinds; the listener may be
            // registered from inside another listener's notification.
            let querier = self.clone();
            state
                .runner
                .post_task(move || querier.replay_endpoints(key, id));
        }

        Ok(id)
    }

    /// Removes a subscription; tears down the graph subtree and the mDNS
    /// queries when the last listener for the service leaves.
    pub fn stop_query(&self, service: &str, listener_id: u64) -> Result<()> {
        let key = ServiceKey::new(service, "local")?;

        let mut state = self.inner.lock();
        let Some(listeners) = state.listeners.get_mut(&key) else {
            return Err(Error::ItemNotFound(service.to_string()));
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener_id);
        if listeners.len() == before {
            return Err(Error::ItemNotFound(format!("listener {}", listener_id)));
        }
        if !listeners.is_empty() {
            return Ok(());
        }
        state.listeners.remove(&key);

        let root = key.service_name();
        let mut stopped = Vec::new();
        state
            .graph
            .stop_tracking(&root, &mut |domain| stopped.push(domain.clone()))?;
        for domain in &stopped {
            state.stop_domain_query(domain);
        }
        Ok(())
    }

    /// Discards all state for `service` and starts browsing afresh.
    pub fn reinitialize_queries(&self, service: &str) -> Result<()> {
        let key = ServiceKey::new(service, "local")?;
        let root = key.service_name();

        let mut dispatches: Vec<Dispatch> = Vec::new();
        {
            let mut state = self.inner.lock();
            if !state.listeners.contains_key(&key) {
                return Err(Error::ItemNotFound(service.to_string()));
            }

            let old = state
                .graph
                .create_endpoints(DomainGroup::Ptr, &root)
                .unwrap_or_default();
            for endpoint in old {
                for listener in state.listeners_for(&endpoint) {
                    dispatches.push((listener, endpoint.clone(), EndpointChange::Deleted));
                }
            }

            let mut stopped = Vec::new();
            state
                .graph
                .stop_tracking(&root, &mut |domain| stopped.push(domain.clone()))?;
            for domain in &stopped {
                state.stop_domain_query(domain);
            }

            let mut started = Vec::new();
            state
                .graph
                .start_tracking(&root, &mut |domain| started.push(domain.clone()))?;
            for domain in started {
                state.start_domain_query(domain);
            }
        }
        dispatch(dispatches);
        Ok(())
    }

    fn replay_endpoints(&self, key: ServiceKey, listener_id: u64) {
        let mut dispatches: Vec<Dispatch> = Vec::new();
        {
            let state = self.inner.lock();
            let Some(listener) = state.listeners.get(&key).and_then(|listeners| {
                listeners
                    .iter()
                    .find(|(id, _)| *id == listener_id)
                    .map(|(_, l)| l.clone())
            }) else {
                return; // Unsubscribed before the replay ran.
            };

            let endpoints = state
                .graph
                .create_endpoints(DomainGroup::Ptr, &key.service_name())
                .unwrap_or_default();
            for endpoint in endpoints {
                dispatches.push((listener.clone(), endpoint, EndpointChange::Created));
            }
        }
        dispatch(dispatches);
    }

    fn on_record_changed(&self, record: MdnsRecord, event: RecordChangedEvent) {
        let Some(group) = domain_group_for(record.dns_type()) else {
            return;
        };

        let mut dispatches: Vec<Dispatch> = Vec::new();
        {
            let mut state = self.inner.lock();
            let name = record.name().clone();

            let before = state
                .graph
                .create_endpoints(group, &name)
                .unwrap_or_default();

            let mut started = Vec::new();
            let mut stopped = Vec::new();
            let result = state.graph.apply_record_change(
                record,
                event,
                &mut |domain| started.push(domain.clone()),
                &mut |domain| stopped.push(domain.clone()),
            );
            match result {
                Ok(()) => {}
                Err(Error::OperationCancelled) => return, // Raced a teardown.
                Err(e) => {
                    log::warn!("erroneous record change for '{}': {}", name, e);
                    return;
                }
            }

            for domain in started {
                state.start_domain_query(domain);
            }
            for domain in &stopped {
                state.stop_domain_query(domain);
            }

            let after = state
                .graph
                .create_endpoints(group, &name)
                .unwrap_or_default();

            let mut created: Vec<InstanceEndpoint> = after
                .iter()
                .filter(|e| !before.contains(e))
                .cloned()
                .collect();
            let mut deleted: Vec<InstanceEndpoint> = before
                .iter()
                .filter(|e| !after.contains(e))
                .cloned()
                .collect();
            let mut updated = Vec::new();
            created.retain(|endpoint| {
                match deleted.iter().position(|old| old.same_instance(endpoint)) {
                    Some(index) => {
                        deleted.remove(index);
                        updated.push(endpoint.clone());
                        false
                    }
                    None => true,
                }
            });

            for (endpoints, change) in [
                (&created, EndpointChange::Created),
                (&updated, EndpointChange::Updated),
                (&deleted, EndpointChange::Deleted),
            ] {
                for endpoint in endpoints {
                    for listener in state.listeners_for(endpoint) {
                        dispatches.push((listener, endpoint.clone(), change));
                    }
                }
            }
        }
        dispatch(dispatches);
    }
}

fn dispatch(dispatches: Vec<Dispatch>) {
    for (listener, endpoint, change) in dispatches {
        let mut listener = listener.lock();
        match change {
            EndpointChange::Created => listener.on_endpoint_created(&endpoint),
            EndpointChange::Updated => listener.on_endpoint_updated(&endpoint),
            EndpointChange::Deleted => listener.on_endpoint_deleted(&endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::mdns::random::MdnsRandom;
    use crate::mdns::socket::testing::fake_sender;
    use crate::message::MdnsMessage;
    use crate::resource::{Rdata, Srv};
    use crate::types::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        created: Vec<InstanceEndpoint>,
        updated: Vec<InstanceEndpoint>,
        deleted: Vec<InstanceEndpoint>,
    }

    impl InstanceListener for RecordingListener {
        fn on_endpoint_created(&mut self, endpoint: &InstanceEndpoint) {
            self.created.push(endpoint.clone());
        }
        fn on_endpoint_updated(&mut self, endpoint: &InstanceEndpoint) {
            self.updated.push(endpoint.clone());
        }
        fn on_endpoint_deleted(&mut self, endpoint: &InstanceEndpoint) {
            self.deleted.push(endpoint.clone());
        }
    }

    struct Harness {
        querier: DnsSdQuerier,
        mdns: MdnsQuerier,
        runner: TaskRunner,
        clock: FakeClock,
        listener: Arc<Mutex<RecordingListener>>,
    }

    fn harness() -> Harness {
        let clock = FakeClock::new();
        let runner = TaskRunner::new(Arc::new(clock.clone()));
        let (sender, _socket) = fake_sender();
        let mdns = MdnsQuerier::new(sender, runner.clone(), Arc::new(clock.clone()), MdnsRandom);
        let querier = DnsSdQuerier::new(mdns.clone(), runner.clone(), 1);
        Harness {
            querier,
            mdns,
            runner,
            clock,
            listener: Arc::new(Mutex::new(RecordingListener::default())),
        }
    }

    impl Harness {
        fn pump(&self) {
            self.clock.advance(Duration::from_millis(1));
            self.runner.run_tasks_until_idle();
        }

        fn receive(&self, records: Vec<MdnsRecord>) {
            let mut m = MdnsMessage::new(0, MessageType::Response);
            for record in records {
                m.add_answer(record);
            }
            self.mdns.on_message_received(&m);
            self.pump();
        }
    }

    fn ptr() -> MdnsRecord {
        MdnsRecord::new(
            DomainName::from_str("_openscreen._udp.local").unwrap(),
            DnsClass::Internet,
            RecordType::Shared,
            SERVICE_RECORD_TTL,
            Rdata::PTR(DomainName::from_str("tv._openscreen._udp.local").unwrap()),
        )
    }

    fn srv() -> MdnsRecord {
        MdnsRecord::new(
            DomainName::from_str("tv._openscreen._udp.local").unwrap(),
            DnsClass::Internet,
            RecordType::Unique,
            SERVICE_RECORD_TTL,
            Rdata::SRV(Srv {
                priority: 0,
                weight: 0,
                port: 4434,
                target: DomainName::from_str("host.local").unwrap(),
            }),
        )
    }

    fn txt(value: &str) -> MdnsRecord {
        MdnsRecord::new(
            DomainName::from_str("tv._openscreen._udp.local").unwrap(),
            DnsClass::Internet,
            RecordType::Unique,
            SERVICE_RECORD_TTL,
            Rdata::TXT(vec![format!("fn={}", value).into_bytes()]),
        )
    }

    fn a_record(ttl: Duration) -> MdnsRecord {
        MdnsRecord::new(
            DomainName::from_str("host.local").unwrap(),
            DnsClass::Internet,
            RecordType::Unique,
            ttl,
            Rdata::A(Ipv4Addr::new(192, 168, 1, 10)),
        )
    }

    #[test]
    fn endpoint_created_when_triple_coheres() {
        let h = harness();
        h.querier
            .start_query("_openscreen._udp", h.listener.clone())
            .unwrap();

        h.receive(vec![ptr()]);
        h.receive(vec![srv(), txt("TV")]);
        assert!(h.listener.lock().created.is_empty());

        h.receive(vec![a_record(Duration::from_secs(120))]);
        let listener = h.listener.lock();
        assert_eq!(listener.created.len(), 1);
        let endpoint = &listener.created[0];
        assert_eq!(endpoint.instance_id, "tv");
        assert_eq!(
            endpoint.address_v4.unwrap().to_string(),
            "192.168.1.10:4434"
        );
        assert_eq!(endpoint.txt.value("fn"), Some("TV".as_bytes()));
    }

    #[test]
    fn txt_change_notifies_updated() {
        let h = harness();
        h.querier
            .start_query("_openscreen._udp", h.listener.clone())
            .unwrap();
        h.receive(vec![ptr()]);
        h.receive(vec![srv(), txt("TV")]);
        h.receive(vec![a_record(Duration::from_secs(120))]);

        h.receive(vec![txt("Bedroom")]);
        let listener = h.listener.lock();
        assert_eq!(listener.updated.len(), 1);
        assert_eq!(
            listener.updated[0].txt.value("fn"),
            Some("Bedroom".as_bytes())
        );
        assert_eq!(listener.deleted.len(), 0);
    }

    #[test]
    fn address_expiry_deletes_endpoint() {
        let h = harness();
        h.querier
            .start_query("_openscreen._udp", h.listener.clone())
            .unwrap();
        h.receive(vec![ptr()]);
        h.receive(vec![srv(), txt("TV")]);
        h.receive(vec![a_record(Duration::from_secs(100))]);
        assert_eq!(h.listener.lock().created.len(), 1);

        // Let the A record run its TTL out.
        h.clock.advance(Duration::from_secs(130));
        h.runner.run_tasks_until_idle();

        let listener = h.listener.lock();
        assert_eq!(listener.deleted.len(), 1);
        assert_eq!(listener.deleted[0].instance_id, "tv");
    }

    #[test]
    fn late_listener_gets_replay() {
        let h = harness();
        h.querier
            .start_query("_openscreen._udp", h.listener.clone())
            .unwrap();
        h.receive(vec![ptr()]);
        h.receive(vec![srv(), txt("TV")]);
        h.receive(vec![a_record(Duration::from_secs(120))]);

        let late = Arc::new(Mutex::new(RecordingListener::default()));
        h.querier
            .start_query("_openscreen._udp", late.clone())
            .unwrap();
        h.pump();

        assert_eq!(late.lock().created.len(), 1);
    }

    #[test]
    fn stop_query_last_listener_tears_down() {
        let h = harness();
        let id = h
            .querier
            .start_query("_openscreen._udp", h.listener.clone())
            .unwrap();
        h.receive(vec![ptr()]);
        h.receive(vec![srv(), txt("TV")]);
        h.receive(vec![a_record(Duration::from_secs(120))]);

        h.querier.stop_query("_openscreen._udp", id).unwrap();

        // Subsequent record changes no longer notify.
        h.receive(vec![txt("Other")]);
        let listener = h.listener.lock();
        assert_eq!(listener.updated.len(), 0);
        assert!(h.querier.stop_query("_openscreen._udp", id).is_err());
    }

    #[test]
    fn reinitialize_restarts_cleanly() {
        let h = harness();
        h.querier
            .start_query("_openscreen._udp", h.listener.clone())
            .unwrap();
        h.receive(vec![ptr()]);
        h.receive(vec![srv(), txt("TV")]);
        h.receive(vec![a_record(Duration::from_secs(120))]);
        assert_eq!(h.listener.lock().created.len(), 1);

        h.querier.reinitialize_queries("_openscreen._udp").unwrap();
        assert_eq!(h.listener.lock().deleted.len(), 1);
    }
}
