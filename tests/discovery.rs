// End-to-end discovery over an in-memory network: one endpoint publishes
// an _openscreen._udp instance, another browses for it, and the full
// probe -> announce -> query -> materialise pipeline runs against a fake
// clock.

use openscreen::clock::{Clock, FakeClock};
use openscreen::dnssd::publisher::{DnsSdPublisher, PublishClient};
use openscreen::dnssd::querier::{DnsSdQuerier, InstanceListener};
use openscreen::dnssd::txt::TxtRecord;
use openscreen::dnssd::{DnsSdInstance, InstanceEndpoint};
use openscreen::mdns::probe::MdnsProbeManager;
use openscreen::mdns::publisher::MdnsPublisher;
use openscreen::mdns::querier::MdnsQuerier;
use openscreen::mdns::random::MdnsRandom;
use openscreen::mdns::responder::MdnsResponder;
use openscreen::mdns::socket::{MdnsReceiver, MdnsSender, PacketSender};
use openscreen::name::DomainName;
use openscreen::runner::TaskRunner;
use openscreen::types::*;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A socket that queues outgoing datagrams for the test network to carry.
struct QueueSocket {
    outbox: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl QueueSocket {
    fn new() -> Arc<QueueSocket> {
        Arc::new(QueueSocket {
            outbox: Mutex::new(Vec::new()),
        })
    }

    fn drain(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.outbox.lock().drain(..).collect()
    }
}

impl PacketSender for QueueSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.outbox.lock().push((buf.to_vec(), to));
        Ok(buf.len())
    }
}

/// One mDNS engine wired to a queue socket.
struct Stack {
    address: SocketAddr,
    socket: Arc<QueueSocket>,
    receiver: MdnsReceiver,
    querier: MdnsQuerier,
    probe_manager: MdnsProbeManager,
    publisher: MdnsPublisher,
    _responder: MdnsResponder,
}

impl Stack {
    fn new(runner: &TaskRunner, clock: Arc<dyn Clock>, address: [u8; 4]) -> Stack {
        let socket = QueueSocket::new();
        let sender = MdnsSender::new(socket.clone(), *MDNS_IPV4_ENDPOINT);
        let receiver = MdnsReceiver::new();
        let querier = MdnsQuerier::new(sender.clone(), runner.clone(), clock.clone(), MdnsRandom);
        let response_querier = querier.clone();
        receiver.set_response_callback(Some(Box::new(move |message| {
            response_querier.on_message_received(message);
        })));

        let probe_manager = MdnsProbeManager::new(sender.clone(), runner.clone(), clock, MdnsRandom);
        let publisher = MdnsPublisher::new(sender.clone(), runner.clone(), probe_manager.clone());
        let responder = MdnsResponder::new(
            Arc::new(publisher.clone()),
            probe_manager.clone(),
            sender,
            &receiver,
        );

        Stack {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(address)), MDNS_PORT),
            socket,
            receiver,
            querier,
            probe_manager,
            publisher,
            _responder: responder,
        }
    }
}

/// Carries every queued datagram to the other endpoints, then runs the
/// task queue, repeatedly, while stepping the clock.
fn pump(runner: &TaskRunner, clock: &FakeClock, stacks: &[&Stack], rounds: usize) {
    for _ in 0..rounds {
        clock.advance(Duration::from_millis(250));
        runner.run_tasks_until_idle();
        loop {
            let mut delivered = false;
            for from in stacks {
                for (bytes, _to) in from.socket.drain() {
                    delivered = true;
                    for to in stacks {
                        if !std::ptr::eq(*from, *to) {
                            to.receiver.on_packet(&bytes, from.address);
                        }
                    }
                }
            }
            runner.run_tasks_until_idle();
            if !delivered {
                break;
            }
        }
    }
}

#[derive(Default)]
struct RecordingListener {
    created: Vec<InstanceEndpoint>,
    deleted: Vec<InstanceEndpoint>,
}

impl InstanceListener for RecordingListener {
    fn on_endpoint_created(&mut self, endpoint: &InstanceEndpoint) {
        self.created.push(endpoint.clone());
    }
    fn on_endpoint_updated(&mut self, _endpoint: &InstanceEndpoint) {}
    fn on_endpoint_deleted(&mut self, endpoint: &InstanceEndpoint) {
        self.deleted.push(endpoint.clone());
    }
}

struct QuietClient;
impl PublishClient for QuietClient {
    fn on_instance_claimed(&mut self, _requested: &DnsSdInstance, _claimed: &DnsSdInstance) {}
}

#[test]
fn published_instance_is_discovered() {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = FakeClock::new();
    let runner = TaskRunner::new(Arc::new(clock.clone()));

    let receiver_stack = Stack::new(&runner, Arc::new(clock.clone()), [192, 168, 1, 10]);
    let controller_stack = Stack::new(&runner, Arc::new(clock.clone()), [192, 168, 1, 20]);

    // The receiver side claims its host name and registers an instance.
    let dnssd_publisher = DnsSdPublisher::new(
        receiver_stack.publisher.clone(),
        receiver_stack.probe_manager.clone(),
        DomainName::from_str("tv-host.local").unwrap(),
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
    );
    dnssd_publisher.claim_host().unwrap();

    let mut txt = TxtRecord::new();
    txt.set_value("fn", "Living Room TV".as_bytes()).unwrap();
    txt.set_value("ve", "1".as_bytes()).unwrap();
    dnssd_publisher
        .register(
            DnsSdInstance {
                instance_id: "Living Room TV".to_string(),
                service_id: "_openscreen._udp".to_string(),
                domain_id: "local".to_string(),
                port: 4434,
                txt,
            },
            Arc::new(Mutex::new(QuietClient)),
        )
        .unwrap();

    // The controller side browses for the service type.
    let dnssd_querier = DnsSdQuerier::new(controller_stack.querier.clone(), runner.clone(), 1);
    let listener = Arc::new(Mutex::new(RecordingListener::default()));
    dnssd_querier
        .start_query("_openscreen._udp", listener.clone())
        .unwrap();

    pump(
        &runner,
        &clock,
        &[&receiver_stack, &controller_stack],
        40,
    );

    let listener = listener.lock();
    assert_eq!(
        listener.created.len(),
        1,
        "expected exactly one discovered endpoint"
    );
    let endpoint = &listener.created[0];
    assert_eq!(endpoint.instance_id, "Living Room TV");
    assert_eq!(endpoint.service_id, "_openscreen._udp");
    assert_eq!(endpoint.domain_id, "local");
    assert_eq!(
        endpoint.address_v4.unwrap().to_string(),
        "192.168.1.10:4434"
    );
    assert_eq!(endpoint.txt.value("fn"), Some("Living Room TV".as_bytes()));
    assert!(listener.deleted.is_empty());
}

#[test]
fn goodbye_removes_discovered_instance() {
    let clock = FakeClock::new();
    let runner = TaskRunner::new(Arc::new(clock.clone()));

    let receiver_stack = Stack::new(&runner, Arc::new(clock.clone()), [192, 168, 1, 10]);
    let controller_stack = Stack::new(&runner, Arc::new(clock.clone()), [192, 168, 1, 20]);

    let dnssd_publisher = DnsSdPublisher::new(
        receiver_stack.publisher.clone(),
        receiver_stack.probe_manager.clone(),
        DomainName::from_str("tv-host.local").unwrap(),
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
    );
    dnssd_publisher.claim_host().unwrap();

    let mut txt = TxtRecord::new();
    txt.set_value("fn", "TV".as_bytes()).unwrap();
    dnssd_publisher
        .register(
            DnsSdInstance {
                instance_id: "TV".to_string(),
                service_id: "_openscreen._udp".to_string(),
                domain_id: "local".to_string(),
                port: 4434,
                txt,
            },
            Arc::new(Mutex::new(QuietClient)),
        )
        .unwrap();

    let dnssd_querier = DnsSdQuerier::new(controller_stack.querier.clone(), runner.clone(), 1);
    let listener = Arc::new(Mutex::new(RecordingListener::default()));
    dnssd_querier
        .start_query("_openscreen._udp", listener.clone())
        .unwrap();

    pump(&runner, &clock, &[&receiver_stack, &controller_stack], 40);
    assert_eq!(listener.lock().created.len(), 1);

    // Unpublish: goodbyes expire the records on the controller within a
    // second, tearing the endpoint down.
    dnssd_publisher.deregister("TV").unwrap();
    pump(&runner, &clock, &[&receiver_stack, &controller_stack], 8);

    let listener = listener.lock();
    assert_eq!(listener.deleted.len(), 1);
    assert_eq!(listener.deleted[0].instance_id, "TV");
}
