use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use smoltcp::wire::{EthernetAddress, EthernetProtocol};

use crate::errno::{Error, Result};
use crate::net::ipv4::IpInterface;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DeviceFlags: u16 {
		const UP = 0x0001;
		const LOOPBACK = 0x0010;
		const BROADCAST = 0x0020;
		const P2P = 0x0040;
		const NEED_ARP = 0x0100;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
	Dummy,
	Loopback,
	Ethernet,
}

/// A trait for link-layer device drivers.
pub trait NetDriver: Send + Sync {
	fn open(&self, _dev: &NetDevice) -> Result<()> {
		Ok(())
	}

	fn close(&self, _dev: &NetDevice) -> Result<()> {
		Ok(())
	}

	/// Queues one outbound frame. `dst` carries the link-layer destination
	/// for devices that address frames; loopback and dummy ignore it.
	fn transmit(
		&self,
		dev: &NetDevice,
		ty: EthernetProtocol,
		data: &[u8],
		dst: Option<EthernetAddress>,
	) -> Result<()>;
}

/// A registered link device. Created at init and never destroyed while the
/// worker runs.
pub struct NetDevice {
	index: usize,
	name: String,
	pub kind: DeviceKind,
	pub mtu: u16,
	pub hwaddr: EthernetAddress,
	pub broadcast_addr: EthernetAddress,
	flags: AtomicU16,
	driver: Box<dyn NetDriver>,
	iface: Mutex<Option<Arc<IpInterface>>>,
}

impl std::fmt::Debug for NetDevice {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NetDevice")
			.field("index", &self.index)
			.field("name", &self.name)
			.field("kind", &self.kind)
			.field("mtu", &self.mtu)
			.field("hwaddr", &self.hwaddr)
			.field("broadcast_addr", &self.broadcast_addr)
			.finish()
	}
}

static DEVICES: Mutex<Vec<Arc<NetDevice>>> = Mutex::new(Vec::new());

impl NetDevice {
	pub fn new(
		kind: DeviceKind,
		mtu: u16,
		flags: DeviceFlags,
		hwaddr: EthernetAddress,
		broadcast_addr: EthernetAddress,
		driver: Box<dyn NetDriver>,
	) -> Self {
		Self {
			index: 0,
			name: String::new(),
			kind,
			mtu,
			hwaddr,
			broadcast_addr,
			flags: AtomicU16::new(flags.bits()),
			driver,
			iface: Mutex::new(None),
		}
	}

	pub fn index(&self) -> usize {
		self.index
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn flags(&self) -> DeviceFlags {
		DeviceFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
	}

	pub fn is_up(&self) -> bool {
		self.flags().contains(DeviceFlags::UP)
	}

	/// The IPv4 interface bound to this device, if one was registered.
	pub fn get_iface(&self) -> Option<Arc<IpInterface>> {
		self.iface.lock().unwrap().clone()
	}

	pub(crate) fn open(&self) -> Result<()> {
		if self.is_up() {
			error!("already opened, dev={}", self.name);
			return Err(Error::InUse);
		}
		self.driver.open(self)?;
		self.flags
			.fetch_or(DeviceFlags::UP.bits(), Ordering::Relaxed);
		info!("opened, dev={}", self.name);
		Ok(())
	}

	pub(crate) fn close(&self) -> Result<()> {
		if !self.is_up() {
			error!("not opened, dev={}", self.name);
			return Err(Error::Device);
		}
		self.driver.close(self)?;
		self.flags
			.fetch_and(!DeviceFlags::UP.bits(), Ordering::Relaxed);
		info!("closed, dev={}", self.name);
		Ok(())
	}

	/// Hands one frame to the driver. Fails when the device is down or the
	/// frame exceeds the MTU.
	pub fn output(
		&self,
		ty: EthernetProtocol,
		data: &[u8],
		dst: Option<EthernetAddress>,
	) -> Result<()> {
		if !self.is_up() {
			error!("not opened, dev={}", self.name);
			return Err(Error::Device);
		}
		if data.len() > usize::from(self.mtu) {
			error!(
				"too long, dev={}, mtu={}, len={}",
				self.name,
				self.mtu,
				data.len()
			);
			return Err(Error::BadArgument);
		}
		debug!("dev={}, type={}, len={}", self.name, ty, data.len());
		self.driver.transmit(self, ty, data, dst)
	}
}

/// Registers a device, assigning its index and name (`net0`, `net1`, ...).
///
/// Must not be called after [`crate::net::run`].
pub fn register(mut dev: NetDevice) -> Result<Arc<NetDevice>> {
	let mut devices = DEVICES.lock().unwrap();

	dev.index = devices.len();
	dev.name = format!("net{}", dev.index);

	let dev = Arc::new(dev);
	devices.push(dev.clone());
	info!("registered, dev={}, kind={:?}", dev.name, dev.kind);
	Ok(dev)
}

/// Binds an IPv4 interface to a device. Only one interface per family can
/// be added.
pub(crate) fn add_iface(dev: &Arc<NetDevice>, iface: Arc<IpInterface>) -> Result<()> {
	let mut slot = dev.iface.lock().unwrap();
	if slot.is_some() {
		error!("iface already exists, dev={}", dev.name);
		return Err(Error::InUse);
	}
	*slot = Some(iface);
	Ok(())
}

pub(crate) fn open_all() {
	for dev in DEVICES.lock().unwrap().iter() {
		if let Err(err) = dev.open() {
			warn!("open failure, dev={}: {}", dev.name(), err);
		}
	}
}

pub(crate) fn close_all() {
	for dev in DEVICES.lock().unwrap().iter() {
		if let Err(err) = dev.close() {
			warn!("close failure, dev={}: {}", dev.name(), err);
		}
	}
}
