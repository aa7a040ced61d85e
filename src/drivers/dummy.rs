use std::sync::Arc;

use smoltcp::wire::{EthernetAddress, EthernetProtocol};

use crate::errno::Result;
use crate::net::device::{self, DeviceFlags, DeviceKind, NetDevice, NetDriver};
use crate::net::intr;

const MTU: u16 = u16::MAX;

/// Discards every frame, raising its interrupt so the plumbing can be
/// exercised without real hardware.
struct DummyDriver {
	irq: u32,
}

impl NetDriver for DummyDriver {
	fn transmit(
		&self,
		dev: &NetDevice,
		ty: EthernetProtocol,
		data: &[u8],
		_dst: Option<EthernetAddress>,
	) -> Result<()> {
		debug!("dev={}, type={}, len={}", dev.name(), ty, data.len());
		/* drop data */
		intr::raise_irq(self.irq);
		Ok(())
	}
}

/// Creates and registers a dummy device.
pub fn init() -> Result<Arc<NetDevice>> {
	let irq = intr::alloc_irq();
	let dev = device::register(NetDevice::new(
		DeviceKind::Dummy,
		MTU,
		DeviceFlags::empty(),
		EthernetAddress([0; 6]),
		EthernetAddress([0; 6]),
		Box::new(DummyDriver { irq }),
	))?;

	let isr_dev = dev.clone();
	intr::request_irq(
		irq,
		dev.name(),
		true,
		Box::new(move |irq| {
			debug!("irq={}, dev={}", irq, isr_dev.name());
		}),
	)?;

	debug!("initialized, dev={}", dev.name());
	Ok(dev)
}
