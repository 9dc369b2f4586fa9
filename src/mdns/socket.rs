//! Multicast UDP plumbing: socket setup, the message sender, and the
//! receive-side dispatch into the task runner.

use crate::errors::{Error, Result};
use crate::message::MdnsMessage;
use crate::runner::TaskRunner;
use crate::types::*;
use crate::waiter::ReadableHandler;
use parking_lot::Mutex;
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// Minimal socket surface the engine needs, so tests can substitute a
/// capture.
pub trait PacketSender: Send + Sync {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;
}

/// A UDP socket bound to the mDNS port and joined to the multicast group
/// on one network interface.
pub struct MulticastUdpSocket {
    socket: UdpSocket,
    multicast_dest: SocketAddr,
}

impl MulticastUdpSocket {
    /// Creates an IPv4 socket bound to 0.0.0.0:5353, joined to 224.0.0.251
    /// on `interface_index` (0 selects the default interface).
    pub fn bind_v4(interface_index: u32) -> Result<MulticastUdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::Socket(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .and_then(|_| socket.set_reuse_port(true))
            .and_then(|_| {
                socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())
            })
            .and_then(|_| {
                socket.join_multicast_v4_n(
                    &MDNS_IPV4_GROUP,
                    &InterfaceIndexOrAddress::Index(interface_index),
                )
            })
            .and_then(|_| socket.set_multicast_loop_v4(true))
            .and_then(|_| socket.set_nonblocking(true))
            .map_err(|e| Error::Socket(e.to_string()))?;

        Ok(MulticastUdpSocket {
            socket: socket.into(),
            multicast_dest: *MDNS_IPV4_ENDPOINT,
        })
    }

    /// Creates an IPv6 socket bound to [::]:5353, joined to FF02::FB on
    /// `interface_index`.
    pub fn bind_v6(interface_index: u32) -> Result<MulticastUdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::Socket(e.to_string()))?;
        socket
            .set_only_v6(true)
            .and_then(|_| socket.set_reuse_address(true))
            .and_then(|_| socket.set_reuse_port(true))
            .and_then(|_| {
                socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, MDNS_PORT)).into())
            })
            .and_then(|_| socket.join_multicast_v6(&MDNS_IPV6_GROUP, interface_index))
            .and_then(|_| socket.set_multicast_loop_v6(true))
            .and_then(|_| socket.set_nonblocking(true))
            .map_err(|e| Error::Socket(e.to_string()))?;

        Ok(MulticastUdpSocket {
            socket: socket.into(),
            multicast_dest: *MDNS_IPV6_ENDPOINT,
        })
    }

    pub fn multicast_dest(&self) -> SocketAddr {
        self.multicast_dest
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl PacketSender for MulticastUdpSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, to)
    }
}

/// Serializes and transmits mDNS messages.
#[derive(Clone)]
pub struct MdnsSender {
    socket: Arc<dyn PacketSender>,
    multicast_dest: SocketAddr,
}

impl MdnsSender {
    pub fn new(socket: Arc<dyn PacketSender>, multicast_dest: SocketAddr) -> MdnsSender {
        MdnsSender {
            socket,
            multicast_dest,
        }
    }

    pub fn send_multicast(&self, message: &MdnsMessage) {
        self.send(message, self.multicast_dest);
    }

    pub fn send_unicast(&self, message: &MdnsMessage, to: SocketAddr) {
        self.send(message, to);
    }

    fn send(&self, message: &MdnsMessage, to: SocketAddr) {
        let bytes = match message.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to serialize mDNS message: {}", e);
                return;
            }
        };
        if bytes.len() > MAX_MULTICAST_MESSAGE_SIZE {
            log::warn!("oversized mDNS message ({} bytes) to {}", bytes.len(), to);
        }
        if let Err(e) = self.socket.send_to(&bytes, to) {
            // Transient send failures are survivable; the protocol retries.
            log::warn!("mDNS send to {} failed: {}", to, e);
        }
    }
}

type QueryCallback = Box<dyn FnMut(&MdnsMessage, SocketAddr) + Send>;
type ResponseCallback = Box<dyn FnMut(&MdnsMessage) + Send>;

#[derive(Default)]
struct ReceiverCallbacks {
    query: Option<QueryCallback>,
    response: Option<ResponseCallback>,
}

/// Parses received packets and routes queries and responses to their
/// registered consumers (the responder and the querier respectively).
#[derive(Clone, Default)]
pub struct MdnsReceiver {
    callbacks: Arc<Mutex<ReceiverCallbacks>>,
}

impl MdnsReceiver {
    pub fn new() -> MdnsReceiver {
        MdnsReceiver::default()
    }

    pub fn set_query_callback(&self, callback: Option<QueryCallback>) {
        self.callbacks.lock().query = callback;
    }

    pub fn set_response_callback(&self, callback: Option<ResponseCallback>) {
        self.callbacks.lock().response = callback;
    }

    /// Decodes one packet and dispatches it. Malformed packets are dropped.
    pub fn on_packet(&self, bytes: &[u8], src: SocketAddr) {
        let message = match MdnsMessage::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("dropping malformed mDNS packet from {}: {}", src, e);
                return;
            }
        };

        let mut callbacks = self.callbacks.lock();
        match message.msg_type {
            MessageType::Query => {
                if let Some(callback) = callbacks.query.as_mut() {
                    callback(&message, src);
                }
            }
            MessageType::Response => {
                if let Some(callback) = callbacks.response.as_mut() {
                    callback(&message);
                }
            }
        }
    }
}

/// Bridges the socket waiter to the task runner: drains the readable
/// socket on the waiter thread and posts each datagram as a decode task.
pub struct MdnsSocketHandler {
    socket: Arc<MulticastUdpSocket>,
    runner: TaskRunner,
    receiver: MdnsReceiver,
}

impl MdnsSocketHandler {
    pub fn new(
        socket: Arc<MulticastUdpSocket>,
        runner: TaskRunner,
        receiver: MdnsReceiver,
    ) -> MdnsSocketHandler {
        MdnsSocketHandler {
            socket,
            runner,
            receiver,
        }
    }
}

impl ReadableHandler for MdnsSocketHandler {
    fn on_readable(&self) {
        let mut buf = [0u8; MAX_MULTICAST_MESSAGE_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    let bytes = buf[..len].to_vec();
                    let receiver = self.receiver.clone();
                    self.runner
                        .post_task(move || receiver.on_packet(&bytes, src));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("mDNS receive failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Test double capturing every transmitted message.
#[cfg(test)]
pub mod testing {
    use super::*;

    #[derive(Default)]
    pub struct FakeSocket {
        pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl FakeSocket {
        pub fn new() -> Arc<FakeSocket> {
            Arc::new(FakeSocket::default())
        }

        /// Decodes and drains everything sent so far.
        pub fn take_messages(&self) -> Vec<(MdnsMessage, SocketAddr)> {
            self.sent
                .lock()
                .drain(..)
                .map(|(bytes, to)| (MdnsMessage::from_slice(&bytes).unwrap(), to))
                .collect()
        }
    }

    impl PacketSender for FakeSocket {
        fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push((buf.to_vec(), to));
            Ok(buf.len())
        }
    }

    pub fn fake_sender() -> (MdnsSender, Arc<FakeSocket>) {
        let socket = FakeSocket::new();
        let sender = MdnsSender::new(socket.clone(), *MDNS_IPV4_ENDPOINT);
        (sender, socket)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::message::MdnsQuestion;
    use crate::name::DomainName;
    use std::str::FromStr;

    #[test]
    fn sender_serializes_and_transmits() {
        let (sender, socket) = fake_sender();
        let mut m = MdnsMessage::new(7, MessageType::Query);
        m.add_question(MdnsQuestion::new(
            DomainName::from_str("_openscreen._udp.local").unwrap(),
            DnsType::PTR,
            DnsClass::Internet,
            ResponseType::Multicast,
        ));
        sender.send_multicast(&m);

        let sent = socket.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, m);
        assert_eq!(sent[0].1, *MDNS_IPV4_ENDPOINT);
    }

    #[test]
    fn receiver_routes_by_message_type() {
        let receiver = MdnsReceiver::new();
        let queries = Arc::new(Mutex::new(0));
        let responses = Arc::new(Mutex::new(0));

        let q = queries.clone();
        receiver.set_query_callback(Some(Box::new(move |_, _| *q.lock() += 1)));
        let r = responses.clone();
        receiver.set_response_callback(Some(Box::new(move |_| *r.lock() += 1)));

        let src = "192.168.1.2:5353".parse().unwrap();
        let query = MdnsMessage::new(1, MessageType::Query).to_vec().unwrap();
        let response = MdnsMessage::new(2, MessageType::Response).to_vec().unwrap();
        receiver.on_packet(&query, src);
        receiver.on_packet(&response, src);
        receiver.on_packet(b"garbage", src);

        assert_eq!(*queries.lock(), 1);
        assert_eq!(*responses.lock(), 1);
    }
}
