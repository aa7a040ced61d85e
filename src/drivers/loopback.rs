use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use smoltcp::wire::{EthernetAddress, EthernetProtocol};

use crate::errno::{Error, Result};
use crate::net;
use crate::net::device::{self, DeviceFlags, DeviceKind, NetDevice, NetDriver};
use crate::net::intr;

const MTU: u16 = u16::MAX;
const QUEUE_LIMIT: usize = 16;

type FrameQueue = Mutex<VecDeque<(EthernetProtocol, Vec<u8>)>>;

/// Transmitted frames are queued and handed back to the stack from the
/// device's own interrupt.
struct LoopbackDriver {
	irq: u32,
	queue: Arc<FrameQueue>,
}

impl NetDriver for LoopbackDriver {
	fn transmit(
		&self,
		dev: &NetDevice,
		ty: EthernetProtocol,
		data: &[u8],
		_dst: Option<EthernetAddress>,
	) -> Result<()> {
		let mut queue = self.queue.lock().unwrap();
		if queue.len() >= QUEUE_LIMIT {
			error!("queue is full, dev={}", dev.name());
			return Err(Error::NoMemory);
		}
		queue.push_back((ty, data.to_vec()));
		trace!(
			"queue pushed (num:{}), dev={}, type={}, len={}",
			queue.len(),
			dev.name(),
			ty,
			data.len()
		);
		drop(queue);

		intr::raise_irq(self.irq);
		Ok(())
	}
}

/// Creates and registers a loopback device.
pub fn init() -> Result<Arc<NetDevice>> {
	let irq = intr::alloc_irq();
	let queue = Arc::new(Mutex::new(VecDeque::new()));

	let dev = device::register(NetDevice::new(
		DeviceKind::Loopback,
		MTU,
		DeviceFlags::LOOPBACK,
		EthernetAddress([0; 6]),
		EthernetAddress([0; 6]),
		Box::new(LoopbackDriver {
			irq,
			queue: queue.clone(),
		}),
	))?;

	let isr_dev = dev.clone();
	intr::request_irq(
		irq,
		dev.name(),
		true,
		Box::new(move |irq| {
			loop {
				let entry = queue.lock().unwrap().pop_front();
				let Some((ty, data)) = entry else {
					break;
				};
				trace!("queue popped, irq={}, dev={}, len={}", irq, isr_dev.name(), data.len());
				net::input_handler(ty, &data, &isr_dev);
			}
		}),
	)?;

	debug!("initialized, dev={}", dev.name());
	Ok(dev)
}
