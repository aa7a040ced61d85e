use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smoltcp::wire::{
	ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetProtocol, Ipv4Address,
};

use crate::errno::{Error, Result};
use crate::net;
use crate::net::device::{DeviceKind, NetDevice};
use crate::net::ipv4::IpInterface;

const CACHE_SIZE: usize = 32;
const CACHE_TIMEOUT: Duration = Duration::from_secs(30);
const TIMER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
	Free,
	Incomplete,
	Resolved,
	#[allow(dead_code)]
	Static,
}

/// One cache slot. Only `Resolved` and `Static` entries carry a valid
/// hardware address.
#[derive(Clone, Copy)]
struct CacheEntry {
	state: CacheState,
	pa: Ipv4Address,
	ha: EthernetAddress,
	timestamp: Option<Instant>,
}

const FREE_ENTRY: CacheEntry = CacheEntry {
	state: CacheState::Free,
	pa: Ipv4Address::UNSPECIFIED,
	ha: EthernetAddress([0; 6]),
	timestamp: None,
};

/// Fixed-size cache, at most one entry per protocol address. Non-static
/// entries age out after [`CACHE_TIMEOUT`].
struct ArpCache {
	entries: [CacheEntry; CACHE_SIZE],
}

impl ArpCache {
	const fn new() -> Self {
		Self {
			entries: [FREE_ENTRY; CACHE_SIZE],
		}
	}

	fn delete(&mut self, idx: usize) {
		let entry = &mut self.entries[idx];
		debug!("delete: pa={}, ha={}", entry.pa, entry.ha);
		*entry = FREE_ENTRY;
	}

	/// A free slot, or the oldest entry evicted.
	fn alloc(&mut self) -> usize {
		let mut oldest = 0;
		for (idx, entry) in self.entries.iter().enumerate() {
			if entry.state == CacheState::Free {
				return idx;
			}
			if self.entries[oldest].timestamp > entry.timestamp {
				oldest = idx;
			}
		}
		self.delete(oldest);
		oldest
	}

	fn select(&self, pa: Ipv4Address) -> Option<usize> {
		self.entries
			.iter()
			.position(|entry| entry.state != CacheState::Free && entry.pa == pa)
	}

	/// Refreshes an existing entry; fails when `pa` is not cached yet.
	fn update(&mut self, pa: Ipv4Address, ha: EthernetAddress, now: Instant) -> bool {
		let Some(idx) = self.select(pa) else {
			return false;
		};
		self.entries[idx] = CacheEntry {
			state: CacheState::Resolved,
			pa,
			ha,
			timestamp: Some(now),
		};
		debug!("update: pa={}, ha={}", pa, ha);
		true
	}

	fn insert(&mut self, pa: Ipv4Address, ha: EthernetAddress, now: Instant) {
		let idx = self.alloc();
		self.entries[idx] = CacheEntry {
			state: CacheState::Resolved,
			pa,
			ha,
			timestamp: Some(now),
		};
		debug!("insert: pa={}, ha={}", pa, ha);
	}

	fn sweep(&mut self, now: Instant) {
		for idx in 0..CACHE_SIZE {
			let entry = &self.entries[idx];
			if entry.state == CacheState::Free || entry.state == CacheState::Static {
				continue;
			}
			if let Some(timestamp) = entry.timestamp
				&& now.duration_since(timestamp) > CACHE_TIMEOUT
			{
				self.delete(idx);
			}
		}
	}
}

static CACHE: Mutex<ArpCache> = Mutex::new(ArpCache::new());

/// Outcome of a resolution attempt.
pub(crate) enum Resolve {
	Found(EthernetAddress),
	/// A request is in flight; the caller drops its datagram and retries
	/// later (TCP retransmission recovers).
	Incomplete,
}

fn transmit(
	iface: &Arc<IpInterface>,
	operation: ArpOperation,
	target_hardware_addr: EthernetAddress,
	target_protocol_addr: Ipv4Address,
	dst: EthernetAddress,
) -> Result<()> {
	let dev = iface.device();
	let repr = ArpRepr::EthernetIpv4 {
		operation,
		source_hardware_addr: dev.hwaddr,
		source_protocol_addr: iface.unicast,
		target_hardware_addr,
		target_protocol_addr,
	};
	let mut buf = vec![0u8; repr.buffer_len()];
	repr.emit(&mut ArpPacket::new_unchecked(&mut buf[..]));

	debug!("dev={}, opcode={:?}, len={}", dev.name(), operation, buf.len());
	dev.output(EthernetProtocol::Arp, &buf, Some(dst))
}

fn request(iface: &Arc<IpInterface>, tpa: Ipv4Address) -> Result<()> {
	transmit(
		iface,
		ArpOperation::Request,
		EthernetAddress([0; 6]),
		tpa,
		iface.device().broadcast_addr,
	)
}

fn reply(iface: &Arc<IpInterface>, tha: EthernetAddress, tpa: Ipv4Address) -> Result<()> {
	transmit(iface, ArpOperation::Reply, tha, tpa, tha)
}

fn input(data: &[u8], dev: &Arc<NetDevice>) {
	let repr = ArpPacket::new_checked(data).and_then(|packet| ArpRepr::parse(&packet));
	let Ok(ArpRepr::EthernetIpv4 {
		operation,
		source_hardware_addr: sha,
		source_protocol_addr: spa,
		target_protocol_addr: tpa,
		..
	}) = repr
	else {
		warn!("unsupported message, dev={}, len={}", dev.name(), data.len());
		return;
	};

	debug!("dev={}, opcode={:?}, len={}", dev.name(), operation, data.len());

	// Refresh the sender's entry first; only merge a new one below when the
	// message actually targets one of our addresses.
	let merge = CACHE.lock().unwrap().update(spa, sha, Instant::now());

	// A device without an IP interface cannot be a target; drop silently.
	let Some(iface) = dev.get_iface() else {
		return;
	};
	if iface.unicast != tpa {
		return;
	}
	if !merge {
		CACHE.lock().unwrap().insert(spa, sha, Instant::now());
	}
	if operation == ArpOperation::Request
		&& let Err(err) = reply(&iface, sha, spa)
	{
		warn!("reply failure, dev={}: {}", dev.name(), err);
	}
}

/// Resolves `pa` to a hardware address through `iface`'s device.
///
/// A miss inserts an `Incomplete` entry and transmits a request; a hit that
/// is still `Incomplete` retransmits the request in case the first one was
/// lost.
pub(crate) fn resolve(iface: &Arc<IpInterface>, pa: Ipv4Address) -> Result<Resolve> {
	if iface.device().kind != DeviceKind::Ethernet {
		debug!("unsupported hardware address type, dev={}", iface.device().name());
		return Err(Error::Device);
	}

	let mut cache = CACHE.lock().unwrap();
	let Some(idx) = cache.select(pa) else {
		debug!("cache miss, pa={}", pa);
		let idx = cache.alloc();
		cache.entries[idx] = CacheEntry {
			state: CacheState::Incomplete,
			pa,
			ha: EthernetAddress([0; 6]),
			timestamp: Some(Instant::now()),
		};
		drop(cache);
		request(iface, pa)?;
		return Ok(Resolve::Incomplete);
	};

	if cache.entries[idx].state == CacheState::Incomplete {
		drop(cache);
		request(iface, pa)?;
		return Ok(Resolve::Incomplete);
	}
	let ha = cache.entries[idx].ha;
	debug!("resolved, pa={}, ha={}", pa, ha);
	Ok(Resolve::Found(ha))
}

fn timer_handler() {
	CACHE.lock().unwrap().sweep(Instant::now());
}

pub(crate) fn init() -> Result<()> {
	net::protocol_register(EthernetProtocol::Arp, Box::new(input))?;
	net::timer_register(TIMER_INTERVAL, Box::new(timer_handler))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pa(s: &str) -> Ipv4Address {
		s.parse().unwrap()
	}

	const HA: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 1]);

	#[test]
	fn update_is_idempotent() {
		let mut cache = ArpCache::new();
		let now = Instant::now();

		assert!(!cache.update(pa("192.0.2.1"), HA, now));
		cache.insert(pa("192.0.2.1"), HA, now);

		// Replaying the same reply leaves a single resolved entry.
		assert!(cache.update(pa("192.0.2.1"), HA, now));
		assert!(cache.update(pa("192.0.2.1"), HA, now));
		let occupied = cache
			.entries
			.iter()
			.filter(|entry| entry.state != CacheState::Free)
			.count();
		assert_eq!(occupied, 1);

		let idx = cache.select(pa("192.0.2.1")).unwrap();
		assert_eq!(cache.entries[idx].ha, HA);
		assert_eq!(cache.entries[idx].state, CacheState::Resolved);
	}

	#[test]
	fn entries_age_out() {
		let mut cache = ArpCache::new();
		let now = Instant::now();

		cache.insert(pa("192.0.2.1"), HA, now);
		cache.sweep(now + CACHE_TIMEOUT);
		assert!(cache.select(pa("192.0.2.1")).is_some());

		cache.sweep(now + CACHE_TIMEOUT + Duration::from_secs(1));
		assert!(cache.select(pa("192.0.2.1")).is_none());
	}

	#[test]
	fn alloc_evicts_the_oldest() {
		let mut cache = ArpCache::new();
		let now = Instant::now();

		for i in 0..CACHE_SIZE {
			let addr = Ipv4Address::new(10, 0, (i / 256) as u8, (i % 256) as u8);
			cache.insert(addr, HA, now + Duration::from_millis(i as u64));
		}
		// Full table; the next insert evicts 10.0.0.0 (oldest).
		cache.insert(pa("192.0.2.99"), HA, now + Duration::from_secs(1));
		assert!(cache.select(pa("10.0.0.0")).is_none());
		assert!(cache.select(pa("192.0.2.99")).is_some());
	}
}
