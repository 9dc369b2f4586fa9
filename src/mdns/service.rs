//! Assembles the mDNS engine over one network interface: socket, sender,
//! receiver, querier, probe manager, publisher and responder, wired to the
//! task runner and the socket waiter.

use crate::clock::Clock;
use crate::errors::Result;
use crate::mdns::probe::MdnsProbeManager;
use crate::mdns::publisher::MdnsPublisher;
use crate::mdns::querier::MdnsQuerier;
use crate::mdns::random::MdnsRandom;
use crate::mdns::responder::MdnsResponder;
use crate::mdns::socket::{MdnsReceiver, MdnsSender, MdnsSocketHandler, MulticastUdpSocket};
use crate::runner::TaskRunner;
use crate::waiter::SocketWaiter;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// One mDNS engine instance, bound to a single interface.
pub struct MdnsService {
    socket: Arc<MulticastUdpSocket>,
    fd: RawFd,
    querier: MdnsQuerier,
    probe_manager: MdnsProbeManager,
    publisher: MdnsPublisher,
    // Held so the query callback stays registered.
    _responder: MdnsResponder,
    receiver: MdnsReceiver,
}

impl MdnsService {
    /// Binds the multicast socket on `interface_index`, registers it with
    /// the waiter, and wires the full engine together.
    pub fn new(
        runner: TaskRunner,
        clock: Arc<dyn Clock>,
        waiter: &SocketWaiter,
        interface_index: u32,
        use_ipv6: bool,
    ) -> Result<MdnsService> {
        let socket = Arc::new(if use_ipv6 {
            MulticastUdpSocket::bind_v6(interface_index)?
        } else {
            MulticastUdpSocket::bind_v4(interface_index)?
        });

        let sender = MdnsSender::new(socket.clone(), socket.multicast_dest());
        let receiver = MdnsReceiver::new();
        let random = MdnsRandom;

        let querier = MdnsQuerier::new(sender.clone(), runner.clone(), clock.clone(), random);
        let response_querier = querier.clone();
        receiver.set_response_callback(Some(Box::new(move |message| {
            response_querier.on_message_received(message);
        })));

        let probe_manager =
            MdnsProbeManager::new(sender.clone(), runner.clone(), clock.clone(), random);
        let publisher = MdnsPublisher::new(sender.clone(), runner.clone(), probe_manager.clone());
        let responder = MdnsResponder::new(
            Arc::new(publisher.clone()),
            probe_manager.clone(),
            sender,
            &receiver,
        );

        let fd = socket.raw_fd();
        let handler = Arc::new(MdnsSocketHandler::new(
            socket.clone(),
            runner,
            receiver.clone(),
        ));
        waiter.register(fd, handler)?;

        Ok(MdnsService {
            socket,
            fd,
            querier,
            probe_manager,
            publisher,
            _responder: responder,
            receiver,
        })
    }

    pub fn querier(&self) -> MdnsQuerier {
        self.querier.clone()
    }

    pub fn probe_manager(&self) -> MdnsProbeManager {
        self.probe_manager.clone()
    }

    pub fn publisher(&self) -> MdnsPublisher {
        self.publisher.clone()
    }

    pub fn socket(&self) -> &Arc<MulticastUdpSocket> {
        &self.socket
    }

    /// Detaches from the waiter. Blocks until the socket is no longer
    /// pending, after which the socket may be closed.
    pub fn shutdown(&self, waiter: &SocketWaiter) -> Result<()> {
        self.receiver.set_query_callback(None);
        self.receiver.set_response_callback(None);
        waiter.deregister(self.fd)
    }
}
