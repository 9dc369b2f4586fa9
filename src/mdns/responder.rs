//! Answers incoming questions from the published record set, [rfc6762]
//! section 6.
//!
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762

use crate::mdns::probe::MdnsProbeManager;
use crate::mdns::socket::{MdnsReceiver, MdnsSender};
use crate::message::{MdnsMessage, MdnsRecord};
use crate::name::DomainName;
use crate::types::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// Read access to the records this endpoint advertises. Implemented by the
/// publisher.
pub trait RecordHandler: Send + Sync {
    /// Whether the provided name is exclusively owned by this endpoint.
    fn is_exclusive_owner(&self, name: &DomainName) -> bool;

    /// Whether this endpoint has one or more records matching name, type
    /// and class.
    fn has_records(&self, name: &DomainName, dns_type: DnsType, dns_class: DnsClass) -> bool;

    /// All owned records matching name, type and class.
    fn get_records(&self, name: &DomainName, dns_type: DnsType, dns_class: DnsClass)
        -> Vec<MdnsRecord>;
}

/// Routes incoming queries: probe queries go to the probe manager for
/// tiebreaking, everything else is answered from the record handler with
/// known-answer suppression applied.
#[derive(Clone)]
pub struct MdnsResponder {
    record_handler: Arc<dyn RecordHandler>,
    probe_manager: MdnsProbeManager,
    sender: MdnsSender,
}

impl MdnsResponder {
    pub fn new(
        record_handler: Arc<dyn RecordHandler>,
        probe_manager: MdnsProbeManager,
        sender: MdnsSender,
        receiver: &MdnsReceiver,
    ) -> MdnsResponder {
        let responder = MdnsResponder {
            record_handler,
            probe_manager,
            sender,
        };

        let callback = responder.clone();
        receiver.set_query_callback(Some(Box::new(move |message, src| {
            callback.on_message_received(message, src);
        })));

        responder
    }

    pub fn on_message_received(&self, message: &MdnsMessage, src: SocketAddr) {
        debug_assert_eq!(message.msg_type, MessageType::Query);

        if message.questions.is_empty() {
            return;
        }

        // A query with authority records is a probe, RFC 6762 section 8.2.
        if !message.authority_records.is_empty() {
            self.probe_manager.respond_to_probe_query(message, src);
            return;
        }

        let mut response = MdnsMessage::new(0, MessageType::Response);
        let mut unicast_requested = false;
        for question in &message.questions {
            if question.response_type == ResponseType::Unicast {
                unicast_requested = true;
            }
            for record in self.record_handler.get_records(
                &question.name,
                question.dns_type,
                question.dns_class,
            ) {
                if is_known_by_querier(&record, message) {
                    continue;
                }
                response.add_answer(record);
            }
        }

        if response.answers.is_empty() {
            return;
        }

        if unicast_requested {
            self.sender.send_unicast(&response, src);
        } else {
            self.sender.send_multicast(&response);
        }
    }
}

/// Known-answer suppression: skip an answer the querier already holds with
/// at least half its TTL remaining, RFC 6762 section 7.1.
fn is_known_by_querier(record: &MdnsRecord, query: &MdnsMessage) -> bool {
    query.answers.iter().any(|known| {
        known.matches_key(record)
            && known.rdata() == record.rdata()
            && known.ttl() >= record.ttl() / 2
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::mdns::probe::DomainConfirmedCallback;
    use crate::mdns::publisher::MdnsPublisher;
    use crate::mdns::random::MdnsRandom;
    use crate::mdns::socket::testing::fake_sender;
    use crate::message::MdnsQuestion;
    use crate::resource::Rdata;
    use crate::runner::TaskRunner;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;
    use std::time::Duration;

    struct NullCallback;
    impl DomainConfirmedCallback for NullCallback {
        fn on_domain_found(&mut self, _requested: DomainName, _claimed: DomainName) {}
    }

    struct Harness {
        responder: MdnsResponder,
        publisher: MdnsPublisher,
        socket: Arc<crate::mdns::socket::testing::FakeSocket>,
    }

    fn harness() -> Harness {
        let clock = FakeClock::new();
        let runner = TaskRunner::new(Arc::new(clock.clone()));
        let (sender, socket) = fake_sender();
        let receiver = MdnsReceiver::new();
        let probe_manager = MdnsProbeManager::new(
            sender.clone(),
            runner.clone(),
            Arc::new(clock.clone()),
            MdnsRandom,
        );
        probe_manager
            .start_probe(
                Arc::new(Mutex::new(NullCallback)),
                DomainName::from_str("host.local").unwrap(),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            )
            .unwrap();
        for _ in 0..5 {
            clock.advance(Duration::from_millis(250));
            runner.run_tasks_until_idle();
        }

        let publisher = MdnsPublisher::new(sender.clone(), runner, probe_manager.clone());
        publisher
            .register_record(MdnsRecord::new(
                DomainName::from_str("host.local").unwrap(),
                DnsClass::Internet,
                RecordType::Unique,
                ADDRESS_RECORD_TTL,
                Rdata::A(Ipv4Addr::new(192, 168, 1, 10)),
            ))
            .unwrap();
        socket.take_messages();

        let responder = MdnsResponder::new(
            Arc::new(publisher.clone()),
            probe_manager,
            sender,
            &receiver,
        );
        Harness {
            responder,
            publisher,
            socket,
        }
    }

    fn question(name: &str, response_type: ResponseType) -> MdnsMessage {
        let mut query = MdnsMessage::new(5, MessageType::Query);
        query.add_question(MdnsQuestion::new(
            DomainName::from_str(name).unwrap(),
            DnsType::A,
            DnsClass::Internet,
            response_type,
        ));
        query
    }

    #[test]
    fn answers_owned_name_multicast() {
        let h = harness();
        let src = "192.168.1.2:5353".parse().unwrap();
        h.responder
            .on_message_received(&question("host.local", ResponseType::Multicast), src);

        let sent = h.socket.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, *MDNS_IPV4_ENDPOINT);
        assert_eq!(sent[0].0.answers.len(), 1);
        assert_eq!(
            sent[0].0.answers[0].rdata(),
            &Rdata::A(Ipv4Addr::new(192, 168, 1, 10))
        );
    }

    #[test]
    fn unicast_bit_answers_unicast() {
        let h = harness();
        let src: SocketAddr = "192.168.1.2:5353".parse().unwrap();
        h.responder
            .on_message_received(&question("host.local", ResponseType::Unicast), src);

        let sent = h.socket.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, src);
    }

    #[test]
    fn unknown_name_is_silent() {
        let h = harness();
        let src = "192.168.1.2:5353".parse().unwrap();
        h.responder
            .on_message_received(&question("other.local", ResponseType::Multicast), src);
        assert!(h.socket.take_messages().is_empty());
    }

    #[test]
    fn known_answer_suppression() {
        let h = harness();
        let src = "192.168.1.2:5353".parse().unwrap();

        // The querier already knows the answer with a fresh TTL.
        let mut query = question("host.local", ResponseType::Multicast);
        query.add_answer(MdnsRecord::new(
            DomainName::from_str("host.local").unwrap(),
            DnsClass::Internet,
            RecordType::Unique,
            ADDRESS_RECORD_TTL,
            Rdata::A(Ipv4Addr::new(192, 168, 1, 10)),
        ));
        h.responder.on_message_received(&query, src);
        assert!(h.socket.take_messages().is_empty());

        // A stale known answer (less than half TTL left) is re-answered.
        let mut query = question("host.local", ResponseType::Multicast);
        query.add_answer(MdnsRecord::new(
            DomainName::from_str("host.local").unwrap(),
            DnsClass::Internet,
            RecordType::Unique,
            Duration::from_secs(30),
            Rdata::A(Ipv4Addr::new(192, 168, 1, 10)),
        ));
        h.responder.on_message_received(&query, src);
        assert_eq!(h.socket.take_messages().len(), 1);
    }

    #[test]
    fn probe_query_routes_to_probe_manager() {
        let h = harness();
        let src: SocketAddr = "192.168.1.2:5353".parse().unwrap();

        // A probe for the name we own gets a unicast defence.
        let mut probe = question("host.local", ResponseType::Unicast);
        probe.add_authority_record(crate::mdns::probe::address_record(
            DomainName::from_str("host.local").unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)),
        ));
        h.responder.on_message_received(&probe, src);

        let sent = h.socket.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, src);
        // Keep the publisher alive for the duration of the test.
        let _ = &h.publisher;
    }
}
