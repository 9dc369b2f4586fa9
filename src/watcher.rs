//! Glue between the DNS-SD querier and the receiver listener: drives the
//! browse query from listener lifecycle requests and converts discovered
//! endpoints into receiver-list entries.

use crate::dnssd::querier::{DnsSdQuerier, InstanceListener};
use crate::dnssd::txt::keys;
use crate::dnssd::InstanceEndpoint;
use crate::listener::{ListenerDelegate, ListenerState, ReceiverInfo, ReceiverListener};
use crate::runner::TaskRunner;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Builds the receiver-list entry for a discovered endpoint. TXT fields
/// that are absent come through as empty strings.
pub fn receiver_info_from_endpoint(endpoint: &InstanceEndpoint) -> ReceiverInfo {
    let text = |key: &str| {
        endpoint
            .txt
            .value(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    };

    ReceiverInfo {
        receiver_id: text(keys::ID),
        friendly_name: if endpoint.txt.value(keys::FRIENDLY_NAME).is_some() {
            text(keys::FRIENDLY_NAME)
        } else {
            endpoint.instance_id.clone()
        },
        model: text(keys::MODEL),
        fingerprint: text(keys::FINGERPRINT),
        endpoint_v4: endpoint.address_v4.map(SocketAddr::V4),
        endpoint_v6: endpoint.address_v6.map(SocketAddr::V6),
        network_interface: endpoint.network_interface,
    }
}

struct WatcherInner {
    querier: DnsSdQuerier,
    runner: TaskRunner,
    service: String,
    listener: Weak<Mutex<ReceiverListener>>,
    subscription: Option<u64>,
}

impl WatcherInner {
    fn start_browsing(&mut self, this: &Arc<Mutex<WatcherInner>>) {
        if self.subscription.is_some() {
            return;
        }
        let forwarder = Arc::new(Mutex::new(EndpointForwarder {
            watcher: Arc::downgrade(this),
        }));
        match self.querier.start_query(&self.service, forwarder) {
            Ok(id) => self.subscription = Some(id),
            Err(e) => {
                log::error!("failed to start browsing '{}': {}", self.service, e);
                self.report_error(e);
            }
        }
    }

    fn stop_browsing(&mut self) {
        if let Some(id) = self.subscription.take() {
            if let Err(e) = self.querier.stop_query(&self.service, id) {
                log::warn!("failed to stop browsing '{}': {}", self.service, e);
            }
        }
    }

    /// Commits a lifecycle transition on the task runner, matching the
    /// asynchronous delegate contract.
    fn commit_state(&self, state: ListenerState) {
        let listener = self.listener.clone();
        self.runner.post_task(move || {
            if let Some(listener) = listener.upgrade() {
                listener.lock().set_state(state);
            }
        });
    }

    fn report_error(&self, error: crate::errors::Error) {
        let listener = self.listener.clone();
        self.runner.post_task(move || {
            if let Some(listener) = listener.upgrade() {
                listener.lock().on_error(error);
            }
        });
    }
}

/// Forwards endpoint changes to the receiver listener as list updates.
struct EndpointForwarder {
    watcher: Weak<Mutex<WatcherInner>>,
}

impl EndpointForwarder {
    fn listener(&self) -> Option<Arc<Mutex<ReceiverListener>>> {
        self.watcher.upgrade()?.lock().listener.upgrade()
    }
}

impl InstanceListener for EndpointForwarder {
    fn on_endpoint_created(&mut self, endpoint: &InstanceEndpoint) {
        if let Some(listener) = self.listener() {
            listener
                .lock()
                .on_receiver_added(&receiver_info_from_endpoint(endpoint));
        }
    }

    fn on_endpoint_updated(&mut self, endpoint: &InstanceEndpoint) {
        if let Some(listener) = self.listener() {
            listener
                .lock()
                .on_receiver_changed(&receiver_info_from_endpoint(endpoint));
        }
    }

    fn on_endpoint_deleted(&mut self, endpoint: &InstanceEndpoint) {
        if let Some(listener) = self.listener() {
            listener
                .lock()
                .on_receiver_removed(&receiver_info_from_endpoint(endpoint));
        }
    }
}

/// The listener delegate backed by DNS-SD browsing.
///
/// Construction is two-phase, as the listener and its delegate reference
/// each other: build the watcher, hand [`DnsSdWatcherClient::delegate`] to
/// the listener, then attach the listener with
/// [`DnsSdWatcherClient::set_listener`].
pub struct DnsSdWatcherClient {
    inner: Arc<Mutex<WatcherInner>>,
}

impl DnsSdWatcherClient {
    pub fn new(querier: DnsSdQuerier, runner: TaskRunner, service: &str) -> DnsSdWatcherClient {
        DnsSdWatcherClient {
            inner: Arc::new(Mutex::new(WatcherInner {
                querier,
                runner,
                service: service.to_string(),
                listener: Weak::new(),
                subscription: None,
            })),
        }
    }

    /// The delegate to install into a [`ReceiverListener`].
    pub fn delegate(&self) -> Box<dyn ListenerDelegate> {
        Box::new(WatcherDelegate {
            inner: self.inner.clone(),
        })
    }

    pub fn set_listener(&self, listener: Weak<Mutex<ReceiverListener>>) {
        self.inner.lock().listener = listener;
    }
}

struct WatcherDelegate {
    inner: Arc<Mutex<WatcherInner>>,
}

impl ListenerDelegate for WatcherDelegate {
    fn start_listener(&mut self) {
        let mut inner = self.inner.lock();
        let this = self.inner.clone();
        inner.start_browsing(&this);
        inner.commit_state(ListenerState::Running);
    }

    fn start_and_suspend_listener(&mut self) {
        let inner = self.inner.lock();
        inner.commit_state(ListenerState::Suspended);
    }

    fn stop_listener(&mut self) {
        let mut inner = self.inner.lock();
        inner.stop_browsing();
        inner.commit_state(ListenerState::Stopped);
    }

    fn suspend_listener(&mut self) {
        let mut inner = self.inner.lock();
        inner.stop_browsing();
        inner.commit_state(ListenerState::Suspended);
    }

    fn resume_listener(&mut self) {
        let mut inner = self.inner.lock();
        let this = self.inner.clone();
        inner.start_browsing(&this);
        inner.commit_state(ListenerState::Running);
    }

    fn search_now(&mut self, from: ListenerState) {
        let inner = self.inner.lock();
        if let Err(e) = inner.querier.reinitialize_queries(&inner.service) {
            log::warn!("search failed for '{}': {}", inner.service, e);
        }
        inner.commit_state(ListenerState::Searching);
        // This implementation's search completes as soon as the fresh
        // queries are on the wire; return to the requesting state.
        inner.commit_state(from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::dnssd::txt::TxtRecord;
    use crate::listener::ListenerObserver;
    use crate::mdns::querier::MdnsQuerier;
    use crate::mdns::random::MdnsRandom;
    use crate::mdns::socket::testing::fake_sender;
    use crate::message::{MdnsMessage, MdnsRecord};
    use crate::name::DomainName;
    use crate::resource::{Rdata, Srv};
    use crate::types::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::str::FromStr;
    use std::time::Duration;

    #[derive(Default)]
    struct EventLog {
        events: Vec<String>,
    }

    impl ListenerObserver for Arc<Mutex<EventLog>> {
        fn on_started(&mut self) {
            self.lock().events.push("started".to_string());
        }
        fn on_stopped(&mut self) {
            self.lock().events.push("stopped".to_string());
        }
        fn on_suspended(&mut self) {
            self.lock().events.push("suspended".to_string());
        }
        fn on_searching(&mut self) {
            self.lock().events.push("searching".to_string());
        }
        fn on_receiver_added(&mut self, receiver: &ReceiverInfo) {
            self.lock()
                .events
                .push(format!("added:{}", receiver.friendly_name));
        }
        fn on_receiver_removed(&mut self, receiver: &ReceiverInfo) {
            self.lock()
                .events
                .push(format!("removed:{}", receiver.friendly_name));
        }
    }

    #[test]
    fn endpoint_conversion_reads_txt_schema() {
        let mut txt = TxtRecord::new();
        txt.set_value("id", "abc123".as_bytes()).unwrap();
        txt.set_value("fn", "Living Room".as_bytes()).unwrap();
        txt.set_value("md", "Demo v1".as_bytes()).unwrap();
        txt.set_value("pk", "AA:BB:CC".as_bytes()).unwrap();

        let endpoint = InstanceEndpoint::new(
            "tv".to_string(),
            "_openscreen._udp".to_string(),
            "local".to_string(),
            txt,
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 4434)),
            None,
            7,
        )
        .unwrap();

        let info = receiver_info_from_endpoint(&endpoint);
        assert_eq!(info.receiver_id, "abc123");
        assert_eq!(info.friendly_name, "Living Room");
        assert_eq!(info.model, "Demo v1");
        assert_eq!(info.fingerprint, "AA:BB:CC");
        assert_eq!(info.endpoint_v4.unwrap().to_string(), "192.168.1.10:4434");
        assert_eq!(info.network_interface, 7);
    }

    #[test]
    fn missing_friendly_name_falls_back_to_instance_id() {
        let endpoint = InstanceEndpoint::new(
            "Kitchen TV".to_string(),
            "_openscreen._udp".to_string(),
            "local".to_string(),
            TxtRecord::new(),
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 4434)),
            None,
            1,
        )
        .unwrap();
        let info = receiver_info_from_endpoint(&endpoint);
        assert_eq!(info.friendly_name, "Kitchen TV");
    }

    fn instance_records() -> Vec<MdnsRecord> {
        let service = DomainName::from_str("_openscreen._udp.local").unwrap();
        let instance = DomainName::from_str("tv._openscreen._udp.local").unwrap();
        let host = DomainName::from_str("host.local").unwrap();
        vec![
            MdnsRecord::new(
                service,
                DnsClass::Internet,
                RecordType::Shared,
                SERVICE_RECORD_TTL,
                Rdata::PTR(instance.clone()),
            ),
            MdnsRecord::new(
                instance.clone(),
                DnsClass::Internet,
                RecordType::Unique,
                SERVICE_RECORD_TTL,
                Rdata::SRV(Srv {
                    priority: 0,
                    weight: 0,
                    port: 4434,
                    target: host.clone(),
                }),
            ),
            MdnsRecord::new(
                instance,
                DnsClass::Internet,
                RecordType::Unique,
                SERVICE_RECORD_TTL,
                Rdata::TXT(vec![b"fn=Living Room".to_vec()]),
            ),
            MdnsRecord::new(
                host,
                DnsClass::Internet,
                RecordType::Unique,
                ADDRESS_RECORD_TTL,
                Rdata::A(Ipv4Addr::new(192, 168, 1, 10)),
            ),
        ]
    }

    // Scenario: start the listener; discovery populates the receiver
    // list; stop tears everything down with exactly one notification per
    // lifecycle edge.
    #[test]
    fn listener_lifecycle_drives_browsing() {
        let clock = FakeClock::new();
        let runner = TaskRunner::new(Arc::new(clock.clone()));
        let (sender, _socket) = fake_sender();
        let mdns = MdnsQuerier::new(sender, runner.clone(), Arc::new(clock.clone()), MdnsRandom);
        let dnssd = DnsSdQuerier::new(mdns.clone(), runner.clone(), 1);

        let watcher = DnsSdWatcherClient::new(dnssd, runner.clone(), "_openscreen._udp");
        let log = Arc::new(Mutex::new(EventLog::default()));
        let listener = Arc::new(Mutex::new(ReceiverListener::new(
            watcher.delegate(),
            Some(Box::new(log.clone())),
        )));
        watcher.set_listener(Arc::downgrade(&listener));

        assert!(listener.lock().start());
        assert_eq!(listener.lock().state(), ListenerState::Starting);
        runner.run_tasks_until_idle();
        assert_eq!(listener.lock().state(), ListenerState::Running);

        // Discovery: feed the full record set through the mDNS layer.
        let mut message = MdnsMessage::new(0, MessageType::Response);
        for record in instance_records() {
            message.add_answer(record);
        }
        mdns.on_message_received(&message);
        clock.advance(Duration::from_millis(500));
        runner.run_tasks_until_idle();

        assert_eq!(listener.lock().receivers().len(), 1);
        assert_eq!(listener.lock().receivers()[0].friendly_name, "Living Room");

        assert!(listener.lock().stop());
        runner.run_tasks_until_idle();
        assert_eq!(listener.lock().state(), ListenerState::Stopped);

        let events = &log.lock().events;
        assert_eq!(
            events,
            &vec![
                "started".to_string(),
                "added:Living Room".to_string(),
                "stopped".to_string(),
            ]
        );
    }
}
