// Standalone Open Screen receiver demo.
// osp-receiver --friendly-name "Living Room" --model "Demo v1" [--interface N]
use openscreen::agent::AgentCertificate;
use openscreen::clock::SystemClock;
use openscreen::dnssd::publisher::{DnsSdPublisher, PublishClient};
use openscreen::dnssd::txt::{keys, TxtRecord};
use openscreen::dnssd::DnsSdInstance;
use openscreen::mdns::MdnsService;
use openscreen::name::DomainName;
use openscreen::runner::TaskRunner;
use openscreen::types::OPENSCREEN_SERVICE_TYPE;
use openscreen::waiter::SocketWaiter;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

const PROTOCOL_VERSION: &str = "1";
const RECEIVER_PORT: u16 = 4434;

struct Args {
    friendly_name: String,
    model: String,
    interface: u32,
    address: Option<IpAddr>,
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "usage: osp-receiver --friendly-name NAME --model MODEL \
         [--interface N] [--address IP] [--certificate DER --private-key DER]"
    );
    process::exit(2);
}

impl Args {
    fn parse() -> Args {
        let mut args = Args {
            friendly_name: "Open Screen Receiver".to_string(),
            model: "Demo".to_string(),
            interface: 0,
            address: None,
            certificate: None,
            private_key: None,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            let mut value = || iter.next().unwrap_or_else(|| usage());
            match flag.as_str() {
                "--friendly-name" => args.friendly_name = value(),
                "--model" => args.model = value(),
                "--interface" => {
                    args.interface = value().parse().unwrap_or_else(|_| usage());
                }
                "--address" => {
                    args.address = Some(value().parse().unwrap_or_else(|_| usage()));
                }
                "--certificate" => args.certificate = Some(PathBuf::from(value())),
                "--private-key" => args.private_key = Some(PathBuf::from(value())),
                _ => usage(),
            }
        }
        args
    }
}

/// Picks the local address the OS would route multicast through.
fn default_local_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket
        .connect(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)),
            5353,
        ))
        .ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

struct ClaimLogger;

impl PublishClient for ClaimLogger {
    fn on_instance_claimed(&mut self, requested: &DnsSdInstance, claimed: &DnsSdInstance) {
        if requested.instance_id == claimed.instance_id {
            log::info!("advertising as '{}'", claimed.instance_id);
        } else {
            log::info!(
                "name collision: advertising as '{}' instead of '{}'",
                claimed.instance_id,
                requested.instance_id
            );
        }
    }
}

fn run(args: Args) -> openscreen::Result<()> {
    let clock = Arc::new(SystemClock);
    let runner = TaskRunner::new(clock.clone());
    let waiter = SocketWaiter::start()
        .map_err(|e| openscreen::Error::Socket(e.to_string()))?;

    let mdns = MdnsService::new(runner.clone(), clock, &waiter, args.interface, false)?;

    let address = args
        .address
        .or_else(default_local_address)
        .ok_or_else(|| openscreen::Error::Socket("no usable local address".to_string()))?;

    let mut txt = TxtRecord::new();
    txt.set_value(keys::ID, uuid_ish(&args.friendly_name))?;
    txt.set_value(keys::VERSION, PROTOCOL_VERSION.as_bytes())?;
    txt.set_value(keys::CAPABILITIES, "0".as_bytes())?;
    txt.set_value(keys::STATUS, "0".as_bytes())?;
    txt.set_value(keys::FRIENDLY_NAME, args.friendly_name.as_bytes())?;
    txt.set_value(keys::MODEL, args.model.as_bytes())?;

    match (&args.certificate, &args.private_key) {
        (Some(cert), Some(key)) => {
            let agent = AgentCertificate::load(cert, key)?;
            txt.set_value(keys::FINGERPRINT, agent.fingerprint().as_bytes())?;
        }
        (None, None) => {
            log::warn!("no agent certificate supplied; advertising without a fingerprint");
        }
        _ => {
            return Err(openscreen::Error::CredentialLoad(
                "--certificate and --private-key must be given together".to_string(),
            ));
        }
    }

    let hostname = DomainName::from_str("osp-receiver.local")?;
    let publisher = DnsSdPublisher::new(
        mdns.publisher(),
        mdns.probe_manager(),
        hostname,
        address,
    );
    publisher.claim_host()?;
    publisher.register(
        DnsSdInstance {
            instance_id: args.friendly_name.clone(),
            service_id: OPENSCREEN_SERVICE_TYPE.to_string(),
            domain_id: "local".to_string(),
            port: RECEIVER_PORT,
            txt,
        },
        Arc::new(Mutex::new(ClaimLogger)),
    )?;

    log::info!(
        "receiver '{}' ({}) listening on {}:{}",
        args.friendly_name,
        args.model,
        address,
        RECEIVER_PORT
    );
    runner.run_until_stopped();

    mdns.shutdown(&waiter)?;
    waiter.request_stop_soon();
    Ok(())
}

/// A stable receiver id derived from the friendly name. Real deployments
/// persist a generated UUID instead.
fn uuid_ish(name: &str) -> Vec<u8> {
    format!("{:016x}", name.bytes().fold(0u64, |h, b| {
        h.wrapping_mul(0x100000001B3).wrapping_add(b as u64)
    }))
    .into_bytes()
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("startup failed: {}", e);
        process::exit(1);
    }
}
