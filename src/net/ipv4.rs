use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use smoltcp::wire::{EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Packet};

use crate::errno::{Error, Result};
use crate::net;
use crate::net::arp;
use crate::net::device::{self, DeviceFlags, NetDevice};

pub const HEADER_LEN: usize = 20;
const VERSION: u8 = 4;
const DEFAULT_TTL: u8 = 255;

/// An IPv4 address and port pair. The unspecified address and port zero act
/// as wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
	pub addr: Ipv4Address,
	pub port: u16,
}

impl Endpoint {
	pub const ANY: Endpoint = Endpoint {
		addr: Ipv4Address::UNSPECIFIED,
		port: 0,
	};

	pub const fn new(addr: Ipv4Address, port: u16) -> Self {
		Self { addr, port }
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.addr, self.port)
	}
}

impl FromStr for Endpoint {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let (addr, port) = s.rsplit_once(':').ok_or(Error::BadArgument)?;
		Ok(Endpoint {
			addr: addr.parse().map_err(|_| Error::BadArgument)?,
			port: port.parse().map_err(|_| Error::BadArgument)?,
		})
	}
}

/// An IPv4 interface bound to a device.
pub struct IpInterface {
	pub unicast: Ipv4Address,
	pub netmask: Ipv4Address,
	pub broadcast: Ipv4Address,
	device: OnceLock<Arc<NetDevice>>,
}

impl IpInterface {
	pub fn new(unicast: &str, netmask: &str) -> Result<Self> {
		let unicast: Ipv4Address = unicast.parse().map_err(|_| Error::BadArgument)?;
		let netmask: Ipv4Address = netmask.parse().map_err(|_| Error::BadArgument)?;
		Ok(Self {
			unicast,
			netmask,
			broadcast: (unicast & netmask) | !netmask,
			device: OnceLock::new(),
		})
	}

	/// The owning device. Interfaces are handed out only by
	/// [`iface_register`], which binds them first.
	pub fn device(&self) -> &Arc<NetDevice> {
		self.device.get().expect("interface not bound to a device")
	}
}

struct Route {
	network: Ipv4Address,
	netmask: Ipv4Address,
	nexthop: Ipv4Address,
	iface: Arc<IpInterface>,
}

/// Routing table with longest-prefix lookup over a small linear list.
struct RouteTable {
	routes: Vec<Route>,
}

impl RouteTable {
	const fn new() -> Self {
		Self { routes: Vec::new() }
	}

	fn add(&mut self, network: Ipv4Address, netmask: Ipv4Address, nexthop: Ipv4Address, iface: Arc<IpInterface>) {
		info!(
			"route added: network={}, netmask={}, nexthop={}, iface={}",
			network, netmask, nexthop, iface.unicast
		);
		self.routes.push(Route {
			network,
			netmask,
			nexthop,
			iface,
		});
	}

	fn lookup(&self, dst: Ipv4Address) -> Option<&Route> {
		let mut candidate: Option<&Route> = None;
		for route in &self.routes {
			if dst & route.netmask == route.network & route.netmask
				&& candidate.is_none_or(|c| u32::from(c.netmask) < u32::from(route.netmask))
			{
				candidate = Some(route);
			}
		}
		candidate
	}
}

pub type IpHandler = Box<dyn Fn(&[u8], Ipv4Address, Ipv4Address, &Arc<IpInterface>) + Send + Sync>;

struct IpProtocolEntry {
	protocol: IpProtocol,
	handler: IpHandler,
}

static IFACES: Mutex<Vec<Arc<IpInterface>>> = Mutex::new(Vec::new());
static ROUTES: Mutex<RouteTable> = Mutex::new(RouteTable::new());
static PROTOCOLS: Mutex<Vec<Arc<IpProtocolEntry>>> = Mutex::new(Vec::new());

/// Datagram ids increment per process, starting at 128.
static NEXT_ID: AtomicU16 = AtomicU16::new(128);

/// Binds `iface` to `dev` and auto-registers the connected route.
///
/// Must not be called after [`net::run`].
pub fn iface_register(dev: &Arc<NetDevice>, iface: IpInterface) -> Result<Arc<IpInterface>> {
	let iface = Arc::new(iface);
	iface
		.device
		.set(dev.clone())
		.map_err(|_| Error::BadArgument)?;
	device::add_iface(dev, iface.clone())?;

	ROUTES.lock().unwrap().add(
		iface.unicast & iface.netmask,
		iface.netmask,
		Ipv4Address::UNSPECIFIED,
		iface.clone(),
	);
	IFACES.lock().unwrap().push(iface.clone());

	info!(
		"registered: dev={}, unicast={}, netmask={}, broadcast={}",
		dev.name(),
		iface.unicast,
		iface.netmask,
		iface.broadcast
	);
	Ok(iface)
}

/// Installs the default route (`0.0.0.0/0`) through `gateway`.
///
/// Must not be called after [`net::run`].
pub fn route_set_default_gateway(iface: &Arc<IpInterface>, gateway: &str) -> Result<()> {
	let gateway: Ipv4Address = gateway.parse().map_err(|_| Error::BadArgument)?;
	ROUTES.lock().unwrap().add(
		Ipv4Address::UNSPECIFIED,
		Ipv4Address::UNSPECIFIED,
		gateway,
		iface.clone(),
	);
	Ok(())
}

/// The egress interface for `dst`, per the routing table.
pub fn route_get_iface(dst: Ipv4Address) -> Option<Arc<IpInterface>> {
	ROUTES
		.lock()
		.unwrap()
		.lookup(dst)
		.map(|route| route.iface.clone())
}

/// Registers an upper-protocol input handler, keyed by IP protocol number.
///
/// Must not be called after [`net::run`]; duplicate registration fails.
pub fn protocol_register(protocol: IpProtocol, handler: IpHandler) -> Result<()> {
	let mut protocols = PROTOCOLS.lock().unwrap();
	if protocols.iter().any(|entry| entry.protocol == protocol) {
		error!("already registered, protocol={}", protocol);
		return Err(Error::InUse);
	}
	protocols.push(Arc::new(IpProtocolEntry { protocol, handler }));
	info!("registered, protocol={}", protocol);
	Ok(())
}

fn input(data: &[u8], dev: &Arc<NetDevice>) {
	let Ok(packet) = Ipv4Packet::new_checked(data) else {
		warn!("malformed datagram, dev={}, len={}", dev.name(), data.len());
		return;
	};
	if packet.version() != VERSION {
		warn!("version error, dev={}", dev.name());
		return;
	}
	if !packet.verify_checksum() {
		warn!("checksum error, dev={}", dev.name());
		return;
	}
	// Fragments are not supported.
	if packet.more_frags() || packet.frag_offset() != 0 {
		warn!("fragments are not supported, dev={}", dev.name());
		return;
	}

	let Some(iface) = dev.get_iface() else {
		return;
	};
	let dst = packet.dst_addr();
	if dst != Ipv4Address::BROADCAST && dst != iface.unicast && dst != iface.broadcast {
		/* for other host */
		return;
	}

	debug!(
		"dev={}, iface={}, protocol={}, total={}",
		dev.name(),
		iface.unicast,
		packet.next_header(),
		packet.total_len()
	);

	let protocol = packet.next_header();
	let entry = PROTOCOLS
		.lock()
		.unwrap()
		.iter()
		.find(|entry| entry.protocol == protocol)
		.cloned();
	if let Some(entry) = entry {
		(entry.handler)(packet.payload(), packet.src_addr(), dst, &iface);
	}
	/* unsupported protocol: ignored */
}

fn output_device(iface: &Arc<IpInterface>, data: &[u8], nexthop: Ipv4Address) -> Result<()> {
	let dev = iface.device();
	let dst = if dev.flags().contains(DeviceFlags::NEED_ARP) {
		if nexthop == iface.broadcast || nexthop == Ipv4Address::BROADCAST {
			Some(dev.broadcast_addr)
		} else {
			match arp::resolve(iface, nexthop)? {
				arp::Resolve::Found(hwaddr) => Some(hwaddr),
				// The datagram is dropped while resolution is pending;
				// TCP retransmission recovers.
				arp::Resolve::Incomplete => return Err(Error::Unreachable),
			}
		}
	} else {
		None
	};
	dev.output(EthernetProtocol::Ipv4, data, dst)
}

/// Assembles and transmits one datagram. Returns the payload length
/// accepted, or the error from route lookup / link resolution.
pub(crate) fn output(
	protocol: IpProtocol,
	payload: &[u8],
	src: Ipv4Address,
	dst: Ipv4Address,
) -> Result<usize> {
	if src.is_unspecified() && dst == Ipv4Address::BROADCAST {
		error!("source address is required for broadcast");
		return Err(Error::BadArgument);
	}
	let (iface, nexthop) = {
		let routes = ROUTES.lock().unwrap();
		let Some(route) = routes.lookup(dst) else {
			error!("no route to host, addr={}", dst);
			return Err(Error::NoRoute);
		};
		let nexthop = if route.nexthop.is_unspecified() {
			dst
		} else {
			route.nexthop
		};
		(route.iface.clone(), nexthop)
	};
	// Strong end-system: never send with a source address that is not the
	// egress interface's own.
	if !src.is_unspecified() && src != iface.unicast {
		error!("unable to output with specified source address, addr={}", src);
		return Err(Error::BadArgument);
	}
	if usize::from(iface.device().mtu) < HEADER_LEN + payload.len() {
		error!(
			"too long, dev={}, mtu={} < {}",
			iface.device().name(),
			iface.device().mtu,
			HEADER_LEN + payload.len()
		);
		return Err(Error::BadArgument);
	}

	let total = HEADER_LEN + payload.len();
	let mut buf = vec![0u8; total];
	let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
	packet.set_version(VERSION);
	packet.set_header_len(HEADER_LEN as u8);
	packet.set_dscp(0);
	packet.set_ecn(0);
	packet.set_total_len(total as u16);
	packet.set_ident(NEXT_ID.fetch_add(1, Ordering::Relaxed));
	packet.set_dont_frag(false);
	packet.set_more_frags(false);
	packet.set_frag_offset(0);
	packet.set_hop_limit(DEFAULT_TTL);
	packet.set_next_header(protocol);
	packet.set_src_addr(iface.unicast);
	packet.set_dst_addr(dst);
	packet.payload_mut().copy_from_slice(payload);
	packet.fill_checksum();

	debug!(
		"dev={}, dst={}, protocol={}, len={}",
		iface.device().name(),
		dst,
		protocol,
		total
	);
	output_device(&iface, &buf, nexthop)?;
	Ok(payload.len())
}

pub(crate) fn init() -> Result<()> {
	net::protocol_register(EthernetProtocol::Ipv4, Box::new(input))
}
