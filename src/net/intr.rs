//! Interrupt plumbing for the protocol worker.
//!
//! All stack work is funneled through a single cooperative worker thread.
//! Device ISRs, the 1 ms ticker, and user tasks deliver work exclusively by
//! raising an interrupt; the worker waits for one stimulus, dispatches it,
//! and loops.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::errno::{Error, Result};
use crate::net;

/// First interrupt number handed out to device drivers.
pub const IRQ_BASE: u32 = 1;

/// Period of the timer-tick interrupt.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// The stimuli the worker multiplexes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
	/// A device raised its interrupt line.
	Irq(u32),
	/// An inbound frame was queued for some protocol; drain the queues.
	Soft,
	/// Periodic tick; service the registered timers.
	Timer,
	/// Broadcast to all event subscribers.
	Event,
	/// Leave the worker loop.
	Shutdown,
}

struct IrqEntry {
	irq: u32,
	name: String,
	shared: bool,
	handler: Box<dyn Fn(u32) + Send + Sync>,
}

static IRQS: Mutex<Vec<Arc<IrqEntry>>> = Mutex::new(Vec::new());
static NEXT_IRQ: AtomicU32 = AtomicU32::new(IRQ_BASE);

static SENDER: Mutex<Option<Sender<Interrupt>>> = Mutex::new(None);
static WORKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
static TICKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
static TICKER_STOP: AtomicBool = AtomicBool::new(false);

/// Allocates a fresh interrupt number for a device driver.
pub fn alloc_irq() -> u32 {
	NEXT_IRQ.fetch_add(1, Ordering::Relaxed)
}

/// Registers a handler for `irq`. Multiple handlers may share an interrupt
/// number if every registration passes `shared`.
pub fn request_irq(
	irq: u32,
	name: &str,
	shared: bool,
	handler: Box<dyn Fn(u32) + Send + Sync>,
) -> Result<()> {
	let mut irqs = IRQS.lock().unwrap();
	for entry in irqs.iter() {
		if entry.irq == irq && (!entry.shared || !shared) {
			error!("conflicts with already registered irq={}", irq);
			return Err(Error::InUse);
		}
	}
	irqs.push(Arc::new(IrqEntry {
		irq,
		name: name.to_string(),
		shared,
		handler,
	}));
	debug!("registered, irq={}, name={}", irq, name);
	Ok(())
}

/// Delivers an interrupt to the worker. Callable from any task; the send
/// is asynchronous and never blocks. A raise before `run` is dropped.
pub(crate) fn raise(intr: Interrupt) {
	let sender = SENDER.lock().unwrap().clone();
	if let Some(sender) = sender {
		// The worker owns the other end until shutdown; a failed send
		// only means the stack is already gone.
		let _ = sender.send(intr);
	}
}

/// Raises a device interrupt; used by driver transmit paths and ISR glue.
pub fn raise_irq(irq: u32) {
	raise(Interrupt::Irq(irq));
}

fn worker(rx: Receiver<Interrupt>) {
	debug!("worker start");
	while let Ok(intr) = rx.recv() {
		match intr {
			Interrupt::Irq(irq) => {
				let handlers: Vec<Arc<IrqEntry>> = IRQS
					.lock()
					.unwrap()
					.iter()
					.filter(|entry| entry.irq == irq)
					.cloned()
					.collect();
				for entry in handlers {
					trace!("dispatch irq={}, name={}", irq, entry.name);
					(entry.handler)(irq);
				}
			}
			Interrupt::Soft => net::softirq(),
			Interrupt::Timer => net::timer_sweep(),
			Interrupt::Event => net::event_dispatch(),
			Interrupt::Shutdown => break,
		}
	}
	debug!("worker terminated");
}

/// Starts the worker and the 1 ms ticker.
pub(crate) fn run() -> Result<()> {
	let mut sender = SENDER.lock().unwrap();
	if sender.is_some() {
		return Err(Error::InUse);
	}
	let (tx, rx) = mpsc::channel();
	*sender = Some(tx);
	drop(sender);

	*WORKER.lock().unwrap() = Some(
		std::thread::Builder::new()
			.name("net-worker".into())
			.spawn(move || worker(rx))
			.map_err(|_| Error::Device)?,
	);

	TICKER_STOP.store(false, Ordering::Relaxed);
	*TICKER.lock().unwrap() = Some(
		std::thread::Builder::new()
			.name("net-ticker".into())
			.spawn(|| {
				while !TICKER_STOP.load(Ordering::Relaxed) {
					std::thread::sleep(TICK_INTERVAL);
					raise(Interrupt::Timer);
				}
			})
			.map_err(|_| Error::Device)?,
	);
	Ok(())
}

/// Stops the ticker, drains the worker, and joins both threads.
pub(crate) fn shutdown() {
	if SENDER.lock().unwrap().is_none() {
		return;
	}
	raise(Interrupt::Shutdown);
	if let Some(worker) = WORKER.lock().unwrap().take() {
		let _ = worker.join();
	}
	TICKER_STOP.store(true, Ordering::Relaxed);
	if let Some(ticker) = TICKER.lock().unwrap().take() {
		let _ = ticker.join();
	}
	*SENDER.lock().unwrap() = None;
}
