//! Protocol stack core: protocol registry, timers, event subscribers, and
//! the `init → run → shutdown` lifecycle.
//!
//! Registration is write-once during startup. Inbound frames are queued per
//! protocol from the ISR path and drained by the worker on the soft
//! interrupt; see [`intr`] for the worker itself.

pub mod arp;
pub mod device;
pub mod icmp;
pub mod intr;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smoltcp::wire::EthernetProtocol;

use crate::errno::{Error, Result};
use crate::net::device::NetDevice;

pub type ProtocolHandler = Box<dyn Fn(&[u8], &Arc<NetDevice>) + Send + Sync>;

struct QueueEntry {
	dev: Arc<NetDevice>,
	data: Vec<u8>,
}

/// A registered link-level protocol with its receive queue. The queue is
/// written from the ISR path and drained by the worker.
struct Protocol {
	ethertype: EthernetProtocol,
	handler: ProtocolHandler,
	queue: Mutex<VecDeque<QueueEntry>>,
}

struct NetTimer {
	interval: Duration,
	last: Mutex<Instant>,
	handler: Box<dyn Fn() + Send + Sync>,
}

struct EventEntry {
	handler: Box<dyn Fn() + Send + Sync>,
}

static PROTOCOLS: Mutex<Vec<Arc<Protocol>>> = Mutex::new(Vec::new());
static TIMERS: Mutex<Vec<Arc<NetTimer>>> = Mutex::new(Vec::new());
static EVENTS: Mutex<Vec<Arc<EventEntry>>> = Mutex::new(Vec::new());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Registers an input handler for a link-level protocol type.
///
/// Must not be called after [`run`]; duplicate registration fails.
pub fn protocol_register(ethertype: EthernetProtocol, handler: ProtocolHandler) -> Result<()> {
	let mut protocols = PROTOCOLS.lock().unwrap();
	if protocols.iter().any(|proto| proto.ethertype == ethertype) {
		error!("already registered, type={}", ethertype);
		return Err(Error::InUse);
	}
	protocols.push(Arc::new(Protocol {
		ethertype,
		handler,
		queue: Mutex::new(VecDeque::new()),
	}));
	info!("registered, type={}", ethertype);
	Ok(())
}

/// Accepts one inbound frame from a device driver. Appends a copy to the
/// protocol's receive queue and raises the soft interrupt; frames for
/// unknown protocol types are dropped silently.
pub fn input_handler(ethertype: EthernetProtocol, data: &[u8], dev: &Arc<NetDevice>) {
	let proto = PROTOCOLS
		.lock()
		.unwrap()
		.iter()
		.find(|proto| proto.ethertype == ethertype)
		.cloned();
	let Some(proto) = proto else {
		return;
	};

	proto.queue.lock().unwrap().push_back(QueueEntry {
		dev: dev.clone(),
		data: data.to_vec(),
	});
	trace!(
		"queue pushed, dev={}, type={}, len={}",
		dev.name(),
		ethertype,
		data.len()
	);
	intr::raise(intr::Interrupt::Soft);
}

/// Drains every protocol receive queue; runs on the worker.
pub(crate) fn softirq() {
	let protocols: Vec<Arc<Protocol>> = PROTOCOLS.lock().unwrap().clone();
	for proto in protocols {
		loop {
			let entry = proto.queue.lock().unwrap().pop_front();
			let Some(entry) = entry else {
				break;
			};
			(proto.handler)(&entry.data, &entry.dev);
		}
	}
}

/// Registers a periodic handler. Must not be called after [`run`].
pub fn timer_register(interval: Duration, handler: Box<dyn Fn() + Send + Sync>) -> Result<()> {
	TIMERS.lock().unwrap().push(Arc::new(NetTimer {
		interval,
		last: Mutex::new(Instant::now()),
		handler,
	}));
	info!("registered, interval={:?}", interval);
	Ok(())
}

/// Fires every timer whose interval has elapsed; runs on the worker tick.
pub(crate) fn timer_sweep() {
	let timers: Vec<Arc<NetTimer>> = TIMERS.lock().unwrap().clone();
	for timer in timers {
		let now = Instant::now();
		let fire = {
			let last = timer.last.lock().unwrap();
			now.duration_since(*last) >= timer.interval
		};
		if fire {
			(timer.handler)();
			*timer.last.lock().unwrap() = now;
		}
	}
}

/// Subscribes a handler to the event broadcast. Must not be called after
/// [`run`].
pub fn event_subscribe(handler: Box<dyn Fn() + Send + Sync>) -> Result<()> {
	EVENTS.lock().unwrap().push(Arc::new(EventEntry { handler }));
	Ok(())
}

/// Calls every event subscriber; runs on the worker.
pub(crate) fn event_dispatch() {
	let events: Vec<Arc<EventEntry>> = EVENTS.lock().unwrap().clone();
	for event in events {
		(event.handler)();
	}
}

/// Broadcasts an event to all subscribers, from any task. The transport
/// subscribers interrupt every parked user task.
pub fn raise_event() {
	intr::raise(intr::Interrupt::Event);
}

/// Initializes the stack: installs the logger and registers ARP, IPv4,
/// ICMP, UDP and TCP. Call once, before registering devices.
pub fn init() -> Result<()> {
	if INITIALIZED.swap(true, Ordering::Relaxed) {
		return Err(Error::InUse);
	}
	crate::logging::init();
	arp::init()?;
	ipv4::init()?;
	icmp::init()?;
	udp::init()?;
	tcp::init()?;
	info!("initialized");
	Ok(())
}

/// Starts the worker and opens all registered devices.
pub fn run() -> Result<()> {
	intr::run()?;
	debug!("open all devices...");
	device::open_all();
	debug!("running...");
	Ok(())
}

/// Closes all devices and stops the worker.
pub fn shutdown() {
	debug!("close all devices...");
	device::close_all();
	intr::shutdown();
	debug!("shutting down");
}
