use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Address, UdpPacket};

use crate::errno::{Error, Result};
use crate::net;
use crate::net::ipv4::{self, Endpoint, IpInterface};
use crate::synch::wait::WaitContext;

const PCB_COUNT: usize = 16;
const HEADER_LEN: usize = 8;

/* see https://tools.ietf.org/html/rfc6335 */
const SOURCE_PORT_MIN: u16 = 49152;
const SOURCE_PORT_MAX: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UdpState {
	Free,
	Open,
	Closing,
}

struct UdpPcb {
	state: UdpState,
	local: Endpoint,
	queue: VecDeque<(Endpoint, Vec<u8>)>,
	ctx: Arc<WaitContext>,
}

impl UdpPcb {
	fn new() -> Self {
		Self {
			state: UdpState::Free,
			local: Endpoint::ANY,
			queue: VecDeque::new(),
			ctx: Arc::new(WaitContext::new()),
		}
	}
}

struct PcbTable {
	pcbs: Vec<UdpPcb>,
}

impl PcbTable {
	fn new() -> Self {
		Self {
			pcbs: (0..PCB_COUNT).map(|_| UdpPcb::new()).collect(),
		}
	}

	fn alloc(&mut self) -> Option<usize> {
		let idx = self
			.pcbs
			.iter()
			.position(|pcb| pcb.state == UdpState::Free)?;
		self.pcbs[idx] = UdpPcb::new();
		self.pcbs[idx].state = UdpState::Open;
		Some(idx)
	}

	/// Marks the PCB closing and reclaims it unless tasks are still parked
	/// on it; in that case they are woken and the last one retries.
	fn release(&mut self, idx: usize) {
		let pcb = &mut self.pcbs[idx];
		pcb.state = UdpState::Closing;
		if pcb.ctx.destroy().is_err() {
			pcb.ctx.wakeup();
			return;
		}
		*pcb = UdpPcb::new();
	}

	fn select(&self, addr: Ipv4Address, port: u16) -> Option<usize> {
		self.pcbs.iter().position(|pcb| {
			pcb.state == UdpState::Open
				&& (pcb.local.addr.is_unspecified()
					|| addr.is_unspecified()
					|| pcb.local.addr == addr)
				&& pcb.local.port == port
		})
	}

	fn get(&mut self, id: usize) -> Option<&mut UdpPcb> {
		self.pcbs
			.get_mut(id)
			.filter(|pcb| pcb.state == UdpState::Open)
	}
}

static PCBS: LazyLock<Mutex<PcbTable>> = LazyLock::new(|| Mutex::new(PcbTable::new()));

fn lock() -> MutexGuard<'static, PcbTable> {
	PCBS.lock().unwrap()
}

fn input(data: &[u8], src: Ipv4Address, dst: Ipv4Address, _iface: &Arc<IpInterface>) {
	let Ok(packet) = UdpPacket::new_checked(data) else {
		warn!("too short, len={}", data.len());
		return;
	};
	if usize::from(packet.len()) != data.len() {
		warn!("length error: len={}, hdr={}", data.len(), packet.len());
		return;
	}
	if !packet.verify_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst)) {
		warn!("checksum error");
		return;
	}
	debug!(
		"{}:{} => {}:{}, len={}",
		src,
		packet.src_port(),
		dst,
		packet.dst_port(),
		data.len()
	);

	let mut table = lock();
	let Some(idx) = table.select(dst, packet.dst_port()) else {
		/* port is not in use */
		return;
	};
	let pcb = &mut table.pcbs[idx];
	let foreign = Endpoint::new(src, packet.src_port());
	pcb.queue.push_back((foreign, packet.payload().to_vec()));
	trace!("queue pushed: id={}, num={}", idx, pcb.queue.len());
	pcb.ctx.wakeup();
}

pub(crate) fn output(src: Endpoint, dst: Endpoint, data: &[u8]) -> Result<usize> {
	if data.len() > u16::MAX as usize - HEADER_LEN {
		error!("too long, len={}", data.len());
		return Err(Error::BadArgument);
	}
	let total = HEADER_LEN + data.len();
	let mut buf = vec![0u8; total];
	let mut packet = UdpPacket::new_unchecked(&mut buf[..]);
	packet.set_src_port(src.port);
	packet.set_dst_port(dst.port);
	packet.set_len(total as u16);
	packet.payload_mut().copy_from_slice(data);
	packet.fill_checksum(&IpAddress::Ipv4(src.addr), &IpAddress::Ipv4(dst.addr));

	debug!("{} => {}, len={}", src, dst, total);
	ipv4::output(IpProtocol::Udp, &buf, src.addr, dst.addr)?;
	Ok(data.len())
}

/*
 * UDP user commands
 */

/// Opens a datagram socket and returns its id.
pub fn open() -> Result<usize> {
	lock().alloc().ok_or_else(|| {
		error!("all PCBs in use");
		Error::NoMemory
	})
}

/// Binds the socket to a local endpoint.
pub fn bind(id: usize, local: Endpoint) -> Result<()> {
	let mut table = lock();
	if let Some(exist) = table.select(local.addr, local.port) {
		error!("already in use, id={}, want={}, bound to id={}", id, local, exist);
		return Err(Error::InUse);
	}
	let pcb = table.get(id).ok_or(Error::BadArgument)?;
	pcb.local = local;
	debug!("bound, id={}, local={}", id, pcb.local);
	Ok(())
}

/// Sends one datagram to `foreign`. An unbound socket gets its source
/// address from the egress interface and an ephemeral port.
pub fn sendto(id: usize, data: &[u8], foreign: Endpoint) -> Result<usize> {
	let mut table = lock();
	let pcb = table.get(id).ok_or(Error::BadArgument)?;

	let mut local = pcb.local;
	if local.addr.is_unspecified() {
		let iface = ipv4::route_get_iface(foreign.addr).ok_or_else(|| {
			error!("no reachable iface, addr={}", foreign.addr);
			Error::NoRoute
		})?;
		local.addr = iface.unicast;
		debug!("select local address, addr={}", local.addr);
	}
	if pcb.local.port == 0 {
		let port = (SOURCE_PORT_MIN..=SOURCE_PORT_MAX)
			.find(|port| table.select(local.addr, *port).is_none())
			.ok_or(Error::InUse)?;
		// Re-borrow: the scan above needed the whole table.
		let pcb = table.get(id).ok_or(Error::BadArgument)?;
		pcb.local.port = port;
		debug!("dynamic assign local port, id={}, port={}", id, port);
	}
	local.port = table.get(id).ok_or(Error::BadArgument)?.local.port;
	drop(table);

	output(local, foreign, data)
}

/// Receives one datagram, parking until one arrives. Returns the payload
/// length (truncated to `buf`) and the sender.
pub fn recvfrom(id: usize, buf: &mut [u8]) -> Result<(usize, Endpoint)> {
	let mut table = lock();
	let (foreign, data) = loop {
		// The socket may have been closed while we were parked; finish
		// the deferred release and report it.
		if table
			.pcbs
			.get(id)
			.is_some_and(|pcb| pcb.state == UdpState::Closing)
		{
			debug!("closed, id={}", id);
			table.release(id);
			return Err(Error::Closed);
		}
		let pcb = table.get(id).ok_or(Error::BadArgument)?;
		if let Some(entry) = pcb.queue.pop_front() {
			break entry;
		}
		let ctx = pcb.ctx.clone();
		let (guard, result) = ctx.sleep(table, None);
		table = guard;
		if let Err(err) = result {
			debug!("interrupted, id={}", id);
			return Err(err);
		}
	};
	drop(table);

	let len = data.len().min(buf.len());
	buf[..len].copy_from_slice(&data[..len]);
	Ok((len, foreign))
}

/// Closes the socket and discards queued datagrams.
pub fn close(id: usize) -> Result<()> {
	let mut table = lock();
	table.get(id).ok_or(Error::BadArgument)?;
	table.release(id);
	Ok(())
}

fn event_handler() {
	let table = lock();
	for pcb in &table.pcbs {
		if pcb.state == UdpState::Open {
			pcb.ctx.interrupt();
		}
	}
}

pub(crate) fn init() -> Result<()> {
	ipv4::protocol_register(IpProtocol::Udp, Box::new(input))?;
	net::event_subscribe(Box::new(event_handler))
}
