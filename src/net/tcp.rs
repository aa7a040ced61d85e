//! TCP connection engine: PCB table, RFC 793 §3.9 segment arrival
//! processing, retransmission queue, and the blocking user commands.
//!
//! All PCB state is mutated either by the protocol worker or by user tasks
//! holding the single TCP lock; the only suspension point is
//! [`WaitContext::sleep`], which releases the lock while parked.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Address, TcpPacket, TcpSeqNumber};

use crate::entropy;
use crate::errno::{Error, Result};
use crate::net;
use crate::net::ipv4::{self, Endpoint, IpInterface};
use crate::synch::wait::WaitContext;

const PCB_COUNT: usize = 16;
const HEADER_LEN: usize = 20;

/// Deliberately tiny, to exercise flow control.
const BUFFER_SIZE: usize = 16;

const DEFAULT_RTO: Duration = Duration::from_millis(200);
const RETRANSMIT_DEADLINE: Duration = Duration::from_secs(12);
const USER_TIMEOUT: Duration = Duration::from_secs(30);
const MSL: Duration = Duration::from_secs(120);

const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);
const USER_TIMEOUT_INTERVAL: Duration = Duration::from_secs(1);
const TIME_WAIT_INTERVAL: Duration = Duration::from_secs(1);

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub(crate) struct TcpFlags: u8 {
		const FIN = 0x01;
		const SYN = 0x02;
		const RST = 0x04;
		const PSH = 0x08;
		const ACK = 0x10;
		const URG = 0x20;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
	Free,
	Closed,
	Listen,
	SynSent,
	SynReceived,
	Established,
	FinWait1,
	FinWait2,
	Closing,
	TimeWait,
	CloseWait,
	LastAck,
}

/// The relevant fields of an arrived segment. `len` counts the payload
/// plus one sequence number per SYN and per FIN.
struct SegmentInfo {
	seq: TcpSeqNumber,
	ack: TcpSeqNumber,
	len: usize,
	wnd: u16,
	#[allow(dead_code)]
	up: u16,
}

/// One outstanding segment awaiting acknowledgement. Owned exclusively by
/// its PCB.
struct RetransmitEntry {
	first: Instant,
	last: Instant,
	rto: Duration,
	seq: TcpSeqNumber,
	flags: TcpFlags,
	data: Vec<u8>,
}

#[derive(Default)]
struct SendVars {
	nxt: TcpSeqNumber,
	una: TcpSeqNumber,
	wnd: u16,
	#[allow(dead_code)]
	up: u16,
	wl1: TcpSeqNumber,
	wl2: TcpSeqNumber,
}

#[derive(Default)]
struct RecvVars {
	nxt: TcpSeqNumber,
	wnd: u16,
	#[allow(dead_code)]
	up: u16,
}

struct TcpPcb {
	state: TcpState,
	/// Opened by the caller (vs. accepted from LISTEN).
	active: bool,
	local: Endpoint,
	foreign: Endpoint,
	snd: SendVars,
	iss: TcpSeqNumber,
	rcv: RecvVars,
	irs: TcpSeqNumber,
	start_time: Instant,
	time_wait: Option<Instant>,
	buf: [u8; BUFFER_SIZE],
	ctx: Arc<WaitContext>,
	queue: VecDeque<RetransmitEntry>,
	/// Terminal kind recorded by the worker for parked tasks to report.
	reason: Option<Error>,
}

impl TcpPcb {
	fn new() -> Self {
		Self {
			state: TcpState::Free,
			active: false,
			local: Endpoint::ANY,
			foreign: Endpoint::ANY,
			snd: SendVars::default(),
			iss: TcpSeqNumber(0),
			rcv: RecvVars::default(),
			irs: TcpSeqNumber(0),
			start_time: Instant::now(),
			time_wait: None,
			buf: [0; BUFFER_SIZE],
			ctx: Arc::new(WaitContext::new()),
			queue: VecDeque::new(),
			reason: None,
		}
	}

	fn inflight(&self) -> usize {
		self.snd.nxt - self.snd.una
	}

	/// Composes and transmits a segment from PCB state. Anything that
	/// consumes sequence space (SYN, FIN, payload) enters the retransmit
	/// queue first.
	fn output(&mut self, flags: TcpFlags, data: &[u8]) -> Result<usize> {
		let seq = if flags.contains(TcpFlags::SYN) {
			self.iss
		} else {
			self.snd.nxt
		};
		if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) || !data.is_empty() {
			let now = Instant::now();
			self.queue.push_back(RetransmitEntry {
				first: now,
				last: now,
				rto: DEFAULT_RTO,
				seq,
				flags,
				data: data.to_vec(),
			});
		}
		output_segment(
			seq,
			self.rcv.nxt,
			flags,
			self.rcv.wnd,
			data,
			self.local,
			self.foreign,
		)
	}

	/// Drops retransmit entries that `snd.una` has passed.
	fn queue_cleanup(&mut self) {
		while let Some(entry) = self.queue.front() {
			if entry.seq >= self.snd.una {
				break;
			}
			let entry = self.queue.pop_front().unwrap();
			trace!(
				"removed, seq={}, flags={:?}, len={}",
				entry.seq,
				entry.flags,
				entry.data.len()
			);
		}
	}
}

struct PcbTable {
	pcbs: Vec<TcpPcb>,
}

impl PcbTable {
	fn new() -> Self {
		Self {
			pcbs: (0..PCB_COUNT).map(|_| TcpPcb::new()).collect(),
		}
	}

	fn alloc(&mut self) -> Option<usize> {
		let idx = self
			.pcbs
			.iter()
			.position(|pcb| pcb.state == TcpState::Free)?;
		self.pcbs[idx] = TcpPcb::new();
		self.pcbs[idx].state = TcpState::Closed;
		Some(idx)
	}

	/// Reclaims a slot. While tasks are still parked on the context the
	/// release is deferred: they are woken and the last of them retries.
	fn release(&mut self, idx: usize) {
		let pcb = &mut self.pcbs[idx];
		if pcb.ctx.destroy().is_err() {
			pcb.ctx.wakeup();
			return;
		}
		debug!("released, local={}, foreign={}", pcb.local, pcb.foreign);
		*pcb = TcpPcb::new();
	}

	/// `(local, foreign)` lookup. An exact match wins over a LISTEN PCB
	/// with wildcard foreign; the local address may be wildcard in either.
	fn select(&self, local: Endpoint, foreign: Endpoint) -> Option<usize> {
		let mut listener = None;
		for (idx, pcb) in self.pcbs.iter().enumerate() {
			if pcb.state == TcpState::Free {
				continue;
			}
			if (pcb.local.addr.is_unspecified() || pcb.local.addr == local.addr)
				&& pcb.local.port == local.port
			{
				if pcb.foreign == foreign {
					return Some(idx);
				}
				if pcb.state == TcpState::Listen
					&& pcb.foreign.addr.is_unspecified()
					&& pcb.foreign.port == 0
				{
					listener.get_or_insert(idx);
				}
			}
		}
		listener
	}

	fn get(&mut self, id: usize) -> Option<&mut TcpPcb> {
		self.pcbs
			.get_mut(id)
			.filter(|pcb| pcb.state != TcpState::Free)
	}
}

static PCBS: LazyLock<Mutex<PcbTable>> = LazyLock::new(|| Mutex::new(PcbTable::new()));

fn lock() -> MutexGuard<'static, PcbTable> {
	PCBS.lock().unwrap()
}

/// Builds one wire-format segment, pseudo-header checksum included.
fn build_segment(
	seq: TcpSeqNumber,
	ack: TcpSeqNumber,
	flags: TcpFlags,
	wnd: u16,
	data: &[u8],
	local: Endpoint,
	foreign: Endpoint,
) -> Vec<u8> {
	let mut buf = vec![0u8; HEADER_LEN + data.len()];
	let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
	packet.set_src_port(local.port);
	packet.set_dst_port(foreign.port);
	packet.set_seq_number(seq);
	packet.set_ack_number(ack);
	packet.set_header_len(HEADER_LEN as u8);
	packet.set_fin(flags.contains(TcpFlags::FIN));
	packet.set_syn(flags.contains(TcpFlags::SYN));
	packet.set_rst(flags.contains(TcpFlags::RST));
	packet.set_psh(flags.contains(TcpFlags::PSH));
	packet.set_ack(flags.contains(TcpFlags::ACK));
	packet.set_urg(flags.contains(TcpFlags::URG));
	packet.set_window_len(wnd);
	packet.set_urgent_at(0);
	packet.payload_mut().copy_from_slice(data);
	packet.fill_checksum(&IpAddress::Ipv4(local.addr), &IpAddress::Ipv4(foreign.addr));
	buf
}

fn output_segment(
	seq: TcpSeqNumber,
	ack: TcpSeqNumber,
	flags: TcpFlags,
	wnd: u16,
	data: &[u8],
	local: Endpoint,
	foreign: Endpoint,
) -> Result<usize> {
	let buf = build_segment(seq, ack, flags, wnd, data, local, foreign);
	debug!(
		"{} => {}, seq={}, ack={}, flags={:?}, wnd={}, len={}",
		local,
		foreign,
		seq,
		ack,
		flags,
		wnd,
		buf.len()
	);
	ipv4::output(IpProtocol::Tcp, &buf, local.addr, foreign.addr)?;
	Ok(data.len())
}

fn flags_of(packet: &TcpPacket<&[u8]>) -> TcpFlags {
	let mut flags = TcpFlags::empty();
	flags.set(TcpFlags::FIN, packet.fin());
	flags.set(TcpFlags::SYN, packet.syn());
	flags.set(TcpFlags::RST, packet.rst());
	flags.set(TcpFlags::PSH, packet.psh());
	flags.set(TcpFlags::ACK, packet.ack());
	flags.set(TcpFlags::URG, packet.urg());
	flags
}

/// RFC 793 §3.9, "SEGMENT ARRIVES".
fn segment_arrives(
	table: &mut PcbTable,
	seg: &SegmentInfo,
	flags: TcpFlags,
	data: &[u8],
	local: Endpoint,
	foreign: Endpoint,
) {
	let Some(idx) = table.select(local, foreign) else {
		segment_arrives_closed(seg, flags, local, foreign);
		return;
	};
	if table.pcbs[idx].state == TcpState::Closed {
		segment_arrives_closed(seg, flags, local, foreign);
		return;
	}

	match table.pcbs[idx].state {
		TcpState::Listen => {
			let pcb = &mut table.pcbs[idx];
			/* 1st check for an RST */
			if flags.contains(TcpFlags::RST) {
				return;
			}
			/* 2nd check for an ACK */
			if flags.contains(TcpFlags::ACK) {
				let _ = output_segment(
					seg.ack,
					TcpSeqNumber(0),
					TcpFlags::RST,
					0,
					&[],
					local,
					foreign,
				);
				return;
			}
			/* 3rd check for a SYN */
			if flags.contains(TcpFlags::SYN) {
				/* ignore: security/compartment and precedence checks */
				pcb.local = local;
				pcb.foreign = foreign;
				pcb.rcv.wnd = BUFFER_SIZE as u16;
				pcb.rcv.nxt = seg.seq + 1;
				pcb.irs = seg.seq;
				pcb.iss = TcpSeqNumber(entropy::random_u32() as i32);
				let _ = pcb.output(TcpFlags::SYN | TcpFlags::ACK, &[]);
				pcb.snd.nxt = pcb.iss + 1;
				pcb.snd.una = pcb.iss;
				pcb.state = TcpState::SynReceived;
				/* ignore: other control or data will be processed in SYN-RECEIVED */
				return;
			}
			/* 4th, other text or control: drop */
			return;
		}
		TcpState::SynSent => {
			let pcb = &mut table.pcbs[idx];
			/* 1st check the ACK bit */
			let mut acceptable = false;
			if flags.contains(TcpFlags::ACK) {
				if seg.ack <= pcb.iss || seg.ack > pcb.snd.nxt {
					let _ = output_segment(
						seg.ack,
						TcpSeqNumber(0),
						TcpFlags::RST,
						0,
						&[],
						local,
						foreign,
					);
					return;
				}
				if pcb.snd.una <= seg.ack && seg.ack <= pcb.snd.nxt {
					acceptable = true;
				}
			}
			/* 2nd check the RST bit */
			if flags.contains(TcpFlags::RST) {
				if acceptable {
					error!("connection reset, local={}, foreign={}", local, foreign);
					pcb.reason = Some(Error::ConnectionReset);
					pcb.state = TcpState::Closed;
					pcb.ctx.wakeup();
					table.release(idx);
				}
				/* otherwise drop */
				return;
			}
			/* 3rd check security and precedence (ignore) */
			/* 4th check the SYN bit */
			if flags.contains(TcpFlags::SYN) {
				pcb.rcv.nxt = seg.seq + 1;
				pcb.irs = seg.seq;
				if acceptable {
					pcb.snd.una = seg.ack;
					pcb.queue_cleanup();
				}
				if pcb.snd.una > pcb.iss {
					pcb.state = TcpState::Established;
					let _ = pcb.output(TcpFlags::ACK, &[]);
					/* not in the RFC 793 flow, but the send window must be seeded here */
					pcb.snd.wnd = seg.wnd;
					pcb.snd.wl1 = seg.seq;
					pcb.snd.wl2 = seg.ack;
					pcb.ctx.wakeup();
				} else {
					// Simultaneous open.
					pcb.state = TcpState::SynReceived;
					let _ = pcb.output(TcpFlags::SYN | TcpFlags::ACK, &[]);
					/* ignore: queue any other controls or text for later */
				}
				return;
			}
			/* 5th, neither SYN nor RST: drop */
			return;
		}
		_ => {}
	}

	/* Otherwise: states sharing the common frame below. */

	/* 1st check sequence number */
	let acceptable = {
		let pcb = &table.pcbs[idx];
		let wnd_end = pcb.rcv.nxt + usize::from(pcb.rcv.wnd);
		if seg.len == 0 {
			if pcb.rcv.wnd == 0 {
				seg.seq == pcb.rcv.nxt
			} else {
				pcb.rcv.nxt <= seg.seq && seg.seq < wnd_end
			}
		} else if pcb.rcv.wnd == 0 {
			false
		} else {
			let last = seg.seq + (seg.len - 1);
			(pcb.rcv.nxt <= seg.seq && seg.seq < wnd_end)
				|| (pcb.rcv.nxt <= last && last < wnd_end)
		}
	};
	if !acceptable {
		if !flags.contains(TcpFlags::RST) {
			let _ = table.pcbs[idx].output(TcpFlags::ACK, &[]);
		}
		return;
	}
	/*
	 * The segment is treated as the idealized segment that begins at
	 * RCV.NXT and does not exceed the window.
	 */

	/* 2nd check the RST bit */
	if flags.contains(TcpFlags::RST) {
		let pcb = &mut table.pcbs[idx];
		match pcb.state {
			TcpState::SynReceived => {
				if pcb.active {
					error!("connection refused, local={}, foreign={}", local, foreign);
					pcb.reason = Some(Error::ConnectionReset);
					pcb.state = TcpState::Closed;
					pcb.ctx.wakeup();
					table.release(idx);
				} else {
					pcb.state = TcpState::Listen;
				}
			}
			TcpState::Established
			| TcpState::FinWait1
			| TcpState::FinWait2
			| TcpState::CloseWait => {
				// Outstanding sends and receives observe "reset"; the
				// segment queues are flushed.
				error!("connection reset, local={}, foreign={}", local, foreign);
				pcb.queue.clear();
				pcb.reason = Some(Error::ConnectionReset);
				pcb.state = TcpState::Closed;
				pcb.ctx.wakeup();
				table.release(idx);
			}
			TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
				pcb.state = TcpState::Closed;
				table.release(idx);
			}
			_ => {}
		}
		return;
	}
	/* 3rd check security and precedence (ignore) */

	/* 4th check the SYN bit: a SYN in a synchronized state is a reset */
	if flags.contains(TcpFlags::SYN) {
		let pcb = &mut table.pcbs[idx];
		pcb.queue.clear();
		pcb.reason = Some(Error::ConnectionReset);
		pcb.state = TcpState::Closed;
		pcb.ctx.wakeup();
		table.release(idx);
		return;
	}

	/* 5th check the ACK field */
	if !flags.contains(TcpFlags::ACK) {
		return;
	}
	{
		let pcb = &mut table.pcbs[idx];
		if pcb.state == TcpState::SynReceived {
			if pcb.snd.una <= seg.ack && seg.ack <= pcb.snd.nxt {
				pcb.state = TcpState::Established;
				// The passive path has no send window yet; seed it from
				// the handshake ACK.
				pcb.snd.wnd = seg.wnd;
				pcb.snd.wl1 = seg.seq;
				pcb.snd.wl2 = seg.ack;
				pcb.ctx.wakeup();
			} else {
				let _ = output_segment(
					seg.ack,
					TcpSeqNumber(0),
					TcpFlags::RST,
					0,
					&[],
					local,
					foreign,
				);
				return;
			}
		}
		match pcb.state {
			TcpState::Established
			| TcpState::FinWait1
			| TcpState::FinWait2
			| TcpState::CloseWait => {
				if pcb.snd.una <= seg.ack && seg.ack <= pcb.snd.nxt {
					if pcb.snd.una < seg.ack {
						pcb.snd.una = seg.ack;
						pcb.queue_cleanup();
						pcb.ctx.wakeup();
					}
					/* window update, RFC 793 p.72 */
					if pcb.snd.wl1 < seg.seq
						|| (pcb.snd.wl1 == seg.seq && pcb.snd.wl2 <= seg.ack)
					{
						pcb.snd.wnd = seg.wnd;
						pcb.snd.wl1 = seg.seq;
						pcb.snd.wl2 = seg.ack;
						pcb.ctx.wakeup();
					}
				} else if seg.ack > pcb.snd.nxt {
					let _ = pcb.output(TcpFlags::ACK, &[]);
					return;
				}
				/* seg.ack < snd.una: old duplicate, ignore */

				if pcb.state == TcpState::FinWait1 && seg.ack == pcb.snd.nxt {
					// Our FIN is fully acknowledged.
					pcb.state = TcpState::FinWait2;
				}
			}
			TcpState::LastAck => {
				if seg.ack == pcb.snd.nxt {
					pcb.state = TcpState::Closed;
					table.release(idx);
				}
				return;
			}
			_ => {}
		}
	}
	/* 6th check the URG bit (ignore) */

	/* 7th process the segment text */
	if !data.is_empty() && table.pcbs[idx].state == TcpState::Established {
		let pcb = &mut table.pcbs[idx];
		let used = BUFFER_SIZE - usize::from(pcb.rcv.wnd);
		let len = data.len().min(usize::from(pcb.rcv.wnd));
		pcb.buf[used..used + len].copy_from_slice(&data[..len]);
		pcb.rcv.nxt = seg.seq + seg.len;
		pcb.rcv.wnd -= len as u16;
		let _ = pcb.output(TcpFlags::ACK, &[]);
		pcb.ctx.wakeup();
	}

	/* 8th check the FIN bit */
	if flags.contains(TcpFlags::FIN) {
		let pcb = &mut table.pcbs[idx];
		match pcb.state {
			TcpState::Closed | TcpState::Listen | TcpState::SynSent => return,
			_ => {}
		}
		pcb.rcv.nxt = seg.seq + 1;
		let _ = pcb.output(TcpFlags::ACK, &[]);
		match pcb.state {
			TcpState::SynReceived | TcpState::Established => {
				pcb.state = TcpState::CloseWait;
				pcb.ctx.wakeup();
			}
			TcpState::FinWait1 => {
				if seg.ack == pcb.snd.nxt {
					pcb.state = TcpState::TimeWait;
					pcb.time_wait = Some(Instant::now());
				} else {
					pcb.state = TcpState::Closing;
				}
			}
			TcpState::FinWait2 => {
				pcb.state = TcpState::TimeWait;
				pcb.time_wait = Some(Instant::now());
			}
			TcpState::CloseWait | TcpState::LastAck => {}
			_ => {}
		}
	}
}

/// Reply rules for segments that match no connection (or a CLOSED one).
fn segment_arrives_closed(seg: &SegmentInfo, flags: TcpFlags, local: Endpoint, foreign: Endpoint) {
	if flags.contains(TcpFlags::RST) {
		return;
	}
	if !flags.contains(TcpFlags::ACK) {
		let _ = output_segment(
			TcpSeqNumber(0),
			seg.seq + seg.len,
			TcpFlags::RST | TcpFlags::ACK,
			0,
			&[],
			local,
			foreign,
		);
	} else {
		let _ = output_segment(
			seg.ack,
			TcpSeqNumber(0),
			TcpFlags::RST,
			0,
			&[],
			local,
			foreign,
		);
	}
}

fn input(data: &[u8], src: Ipv4Address, dst: Ipv4Address, _iface: &Arc<IpInterface>) {
	let Ok(packet) = TcpPacket::new_checked(data) else {
		warn!("too short, len={}", data.len());
		return;
	};
	if !packet.verify_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst)) {
		warn!("checksum error");
		return;
	}
	if src == Ipv4Address::BROADCAST || dst == Ipv4Address::BROADCAST {
		warn!("broadcast endpoints are not allowed");
		return;
	}

	let local = Endpoint::new(dst, packet.dst_port());
	let foreign = Endpoint::new(src, packet.src_port());
	let flags = flags_of(&packet);
	let payload = packet.payload();
	let mut len = payload.len();
	// SYN and FIN each consume one sequence number.
	if flags.contains(TcpFlags::SYN) {
		len += 1;
	}
	if flags.contains(TcpFlags::FIN) {
		len += 1;
	}
	let seg = SegmentInfo {
		seq: packet.seq_number(),
		ack: packet.ack_number(),
		len,
		wnd: packet.window_len(),
		up: packet.urgent_at(),
	};
	debug!(
		"{} => {}, flags={:?}, len={} (payload={})",
		foreign,
		local,
		flags,
		data.len(),
		payload.len()
	);

	let mut table = lock();
	segment_arrives(&mut table, &seg, flags, payload, local, foreign);
}

/*
 * Timers. Each sweep takes the TCP lock once and never calls user code.
 */

fn retransmit_sweep(table: &mut PcbTable, now: Instant) {
	for idx in 0..PCB_COUNT {
		let pcb = &mut table.pcbs[idx];
		if pcb.state == TcpState::Free {
			continue;
		}
		let (rcv_nxt, rcv_wnd) = (pcb.rcv.nxt, pcb.rcv.wnd);
		let (local, foreign) = (pcb.local, pcb.foreign);
		let mut deadline = false;
		for entry in pcb.queue.iter_mut() {
			if now.duration_since(entry.first) >= RETRANSMIT_DEADLINE {
				deadline = true;
				break;
			}
			if now >= entry.last + entry.rto {
				let _ = output_segment(
					entry.seq,
					rcv_nxt,
					entry.flags,
					rcv_wnd,
					&entry.data,
					local,
					foreign,
				);
				entry.last = now;
				// Exponential backoff.
				entry.rto *= 2;
			}
		}
		if deadline {
			error!("retransmission deadline, local={}, foreign={}", local, foreign);
			pcb.queue.clear();
			pcb.reason = Some(Error::TimedOut);
			pcb.state = TcpState::Closed;
			pcb.ctx.wakeup();
			table.release(idx);
		}
	}
}

fn user_timeout_sweep(table: &mut PcbTable, now: Instant) {
	for idx in 0..PCB_COUNT {
		let pcb = &mut table.pcbs[idx];
		if pcb.state == TcpState::Free || pcb.state == TcpState::TimeWait {
			continue;
		}
		if now.duration_since(pcb.start_time) >= USER_TIMEOUT {
			error!(
				"connection aborted due to user timeout, local={}, foreign={}",
				pcb.local, pcb.foreign
			);
			pcb.queue.clear();
			pcb.reason = Some(Error::TimedOut);
			pcb.state = TcpState::Closed;
			pcb.ctx.wakeup();
			table.release(idx);
		}
	}
}

fn time_wait_sweep(table: &mut PcbTable, now: Instant) {
	for idx in 0..PCB_COUNT {
		let pcb = &mut table.pcbs[idx];
		if pcb.state != TcpState::TimeWait {
			continue;
		}
		if let Some(since) = pcb.time_wait
			&& now.duration_since(since) >= 2 * MSL
		{
			pcb.state = TcpState::Closed;
			table.release(idx);
		}
	}
}

fn event_handler() {
	let table = lock();
	for pcb in &table.pcbs {
		if pcb.state != TcpState::Free {
			pcb.ctx.interrupt();
		}
	}
}

pub(crate) fn init() -> Result<()> {
	ipv4::protocol_register(IpProtocol::Tcp, Box::new(input))?;
	net::event_subscribe(Box::new(event_handler))?;
	net::timer_register(
		RETRANSMIT_INTERVAL,
		Box::new(|| retransmit_sweep(&mut lock(), Instant::now())),
	)?;
	net::timer_register(
		USER_TIMEOUT_INTERVAL,
		Box::new(|| user_timeout_sweep(&mut lock(), Instant::now())),
	)?;
	net::timer_register(
		TIME_WAIT_INTERVAL,
		Box::new(|| time_wait_sweep(&mut lock(), Instant::now())),
	)
}

/*
 * TCP user commands (RFC 793)
 */

/// Opens a connection and parks until it settles.
///
/// Active open sends a SYN towards `foreign` and waits to leave SYN_SENT;
/// passive open listens on `local` (optionally restricted to `foreign`)
/// and waits for an incoming connection to reach ESTABLISHED. Returns the
/// connection id.
pub fn open(local: Endpoint, foreign: Option<Endpoint>, active: bool) -> Result<usize> {
	if active && foreign.is_none() {
		return Err(Error::BadArgument);
	}
	let mut table = lock();
	let Some(idx) = table.alloc() else {
		error!("all PCBs in use");
		return Err(Error::NoMemory);
	};
	let pcb = &mut table.pcbs[idx];
	pcb.active = active;
	pcb.start_time = Instant::now();
	if active {
		let foreign = foreign.unwrap();
		debug!("active open: local={}, foreign={}, connecting...", local, foreign);
		pcb.local = local;
		pcb.foreign = foreign;
		pcb.rcv.wnd = BUFFER_SIZE as u16;
		pcb.iss = TcpSeqNumber(entropy::random_u32() as i32);
		if let Err(err) = pcb.output(TcpFlags::SYN, &[]) {
			error!("SYN transmit failure: {}", err);
			pcb.state = TcpState::Closed;
			table.release(idx);
			return Err(err);
		}
		let pcb = &mut table.pcbs[idx];
		pcb.snd.una = pcb.iss;
		pcb.snd.nxt = pcb.iss + 1;
		pcb.state = TcpState::SynSent;
	} else {
		debug!("passive open: local={}, waiting for connection...", local);
		pcb.local = local;
		if let Some(foreign) = foreign {
			pcb.foreign = foreign;
		}
		pcb.state = TcpState::Listen;
	}

	loop {
		let observed = table.pcbs[idx].state;
		while table.pcbs[idx].state == observed {
			let ctx = table.pcbs[idx].ctx.clone();
			let (guard, result) = ctx.sleep(table, None);
			table = guard;
			if result.is_err() {
				debug!("interrupted");
				table.pcbs[idx].state = TcpState::Closed;
				table.release(idx);
				return Err(Error::Interrupted);
			}
		}
		match table.pcbs[idx].state {
			TcpState::Established => break,
			// Simultaneous open only reaches SYN_RECEIVED; park again.
			TcpState::SynReceived => continue,
			state => {
				debug!("open failed, state={:?}", state);
				let reason = table.pcbs[idx].reason.unwrap_or(Error::Closed);
				table.pcbs[idx].state = TcpState::Closed;
				table.release(idx);
				return Err(reason);
			}
		}
	}
	info!(
		"connection established: local={}, foreign={}",
		table.pcbs[idx].local, table.pcbs[idx].foreign
	);
	Ok(idx)
}

/// Initiates a close. ESTABLISHED moves to FIN_WAIT_1, CLOSE_WAIT to
/// LAST_ACK; other states are an error.
pub fn close(id: usize) -> Result<()> {
	let mut table = lock();
	let pcb = table.get(id).ok_or(Error::BadArgument)?;
	match pcb.state {
		TcpState::Established => {
			let _ = pcb.output(TcpFlags::ACK | TcpFlags::FIN, &[]);
			pcb.state = TcpState::FinWait1;
			pcb.snd.nxt = pcb.snd.nxt + 1;
		}
		TcpState::CloseWait => {
			let _ = pcb.output(TcpFlags::ACK | TcpFlags::FIN, &[]);
			pcb.state = TcpState::LastAck;
			pcb.snd.nxt = pcb.snd.nxt + 1;
		}
		state => {
			error!("close in state {:?}", state);
			return Err(Error::BadArgument);
		}
	}
	pcb.ctx.wakeup();
	Ok(())
}

/// Sends `data`, parking whenever the usable send window is exhausted.
/// Returns the number of bytes accepted by the stack (not necessarily
/// acknowledged yet).
pub fn send(id: usize, data: &[u8]) -> Result<usize> {
	let mut table = lock();
	let mut sent = 0;
	'retry: loop {
		let pcb = table.get(id).ok_or(Error::BadArgument)?;
		match pcb.state {
			TcpState::Established | TcpState::CloseWait => {
				let Some(iface) = ipv4::route_get_iface(table.pcbs[id].foreign.addr) else {
					error!("iface not found, foreign={}", table.pcbs[id].foreign);
					return Err(Error::NoRoute);
				};
				let mss = usize::from(iface.device().mtu) - (ipv4::HEADER_LEN + HEADER_LEN);
				while sent < data.len() {
					let pcb = &mut table.pcbs[id];
					let cap = usize::from(pcb.snd.wnd).saturating_sub(pcb.inflight());
					if cap == 0 {
						let ctx = pcb.ctx.clone();
						let (guard, result) = ctx.sleep(table, None);
						table = guard;
						if result.is_err() {
							debug!("interrupted");
							if sent == 0 {
								return Err(Error::Interrupted);
							}
							break 'retry;
						}
						continue 'retry;
					}
					let len = mss.min(data.len() - sent).min(cap);
					if let Err(err) = pcb.output(
						TcpFlags::ACK | TcpFlags::PSH,
						&data[sent..sent + len],
					) {
						error!("transmit failure: {}", err);
						pcb.state = TcpState::Closed;
						table.release(id);
						return Err(err);
					}
					let pcb = &mut table.pcbs[id];
					pcb.snd.nxt = pcb.snd.nxt + len;
					sent += len;
				}
				break 'retry;
			}
			TcpState::LastAck => {
				error!("connection closing, id={}", id);
				return Err(Error::Closed);
			}
			// The worker left the PCB for us to reclaim; report why.
			TcpState::Closed => {
				let reason = pcb.reason.unwrap_or(Error::Closed);
				table.release(id);
				return Err(reason);
			}
			state => {
				error!("send in state {:?}", state);
				return Err(Error::BadArgument);
			}
		}
	}
	Ok(sent)
}

/// Receives up to `buf.len()` bytes, parking until data arrives. Returns
/// 0 once the peer has closed and the buffer is drained.
pub fn receive(id: usize, buf: &mut [u8]) -> Result<usize> {
	let mut table = lock();
	let remain = loop {
		let pcb = table.get(id).ok_or(Error::BadArgument)?;
		match pcb.state {
			TcpState::Established => {
				let remain = BUFFER_SIZE - usize::from(pcb.rcv.wnd);
				if remain > 0 {
					break remain;
				}
				let ctx = pcb.ctx.clone();
				let (guard, result) = ctx.sleep(table, None);
				table = guard;
				if result.is_err() {
					debug!("interrupted");
					return Err(Error::Interrupted);
				}
			}
			TcpState::CloseWait => {
				let remain = BUFFER_SIZE - usize::from(pcb.rcv.wnd);
				if remain > 0 {
					break remain;
				}
				debug!("connection closing, id={}", id);
				return Ok(0);
			}
			// The worker left the PCB for us to reclaim; report why.
			TcpState::Closed => {
				let reason = pcb.reason.unwrap_or(Error::Closed);
				table.release(id);
				return Err(reason);
			}
			state => {
				error!("receive in state {:?}", state);
				return Err(Error::BadArgument);
			}
		}
	};

	let pcb = &mut table.pcbs[id];
	let len = buf.len().min(remain);
	buf[..len].copy_from_slice(&pcb.buf[..len]);
	pcb.buf.copy_within(len..remain, 0);
	pcb.rcv.wnd += len as u16;
	// Window update so the peer's sender unblocks without waiting for a
	// retransmission.
	if pcb.state == TcpState::Established {
		let _ = pcb.output(TcpFlags::ACK, &[]);
	}
	Ok(len)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ep(s: &str) -> Endpoint {
		s.parse().unwrap()
	}

	fn seg(seq: u32, ack: u32, len: usize, wnd: u16) -> SegmentInfo {
		SegmentInfo {
			seq: TcpSeqNumber(seq as i32),
			ack: TcpSeqNumber(ack as i32),
			len,
			wnd,
			up: 0,
		}
	}

	/// A listener the way a passive `open` installs one.
	fn listen_pcb(table: &mut PcbTable, local: Endpoint) -> usize {
		let idx = table.alloc().unwrap();
		let pcb = &mut table.pcbs[idx];
		pcb.local = local;
		pcb.state = TcpState::Listen;
		idx
	}

	/// An active opener the way `open` leaves it in SYN_SENT.
	fn syn_sent_pcb(table: &mut PcbTable, local: Endpoint, foreign: Endpoint) -> usize {
		let idx = table.alloc().unwrap();
		let pcb = &mut table.pcbs[idx];
		pcb.active = true;
		pcb.local = local;
		pcb.foreign = foreign;
		pcb.rcv.wnd = BUFFER_SIZE as u16;
		pcb.iss = TcpSeqNumber(42);
		pcb.snd.una = pcb.iss;
		pcb.snd.nxt = pcb.iss + 1;
		pcb.queue.push_back(RetransmitEntry {
			first: Instant::now(),
			last: Instant::now(),
			rto: DEFAULT_RTO,
			seq: pcb.iss,
			flags: TcpFlags::SYN,
			data: Vec::new(),
		});
		pcb.state = TcpState::SynSent;
		idx
	}

	fn established_pcb(table: &mut PcbTable, local: Endpoint, foreign: Endpoint) -> usize {
		let idx = syn_sent_pcb(table, local, foreign);
		let iss = table.pcbs[idx].iss.0 as u32;
		segment_arrives(
			table,
			&seg(1000, iss + 1, 1, BUFFER_SIZE as u16),
			TcpFlags::SYN | TcpFlags::ACK,
			&[],
			local,
			foreign,
		);
		assert_eq!(table.pcbs[idx].state, TcpState::Established);
		idx
	}

	const LOCAL: &str = "192.0.2.2:7";
	const FOREIGN: &str = "192.0.2.1:10007";

	#[test]
	fn checksum_round_trip() {
		let local = ep(LOCAL);
		let foreign = ep(FOREIGN);
		let buf = build_segment(
			TcpSeqNumber(100),
			TcpSeqNumber(200),
			TcpFlags::ACK | TcpFlags::PSH,
			4096,
			b"hello",
			local,
			foreign,
		);

		let packet = TcpPacket::new_checked(&buf[..]).unwrap();
		assert!(packet.verify_checksum(
			&IpAddress::Ipv4(local.addr),
			&IpAddress::Ipv4(foreign.addr)
		));
		assert_eq!(packet.seq_number(), TcpSeqNumber(100));
		assert_eq!(packet.ack_number(), TcpSeqNumber(200));
		assert!(packet.ack() && packet.psh());
		assert!(!packet.syn());
		assert_eq!(packet.window_len(), 4096);
		assert_eq!(packet.payload(), b"hello");
	}

	#[test]
	fn select_prefers_exact_match_over_listener() {
		let mut table = PcbTable::new();
		let listener = listen_pcb(&mut table, ep("0.0.0.0:7"));
		let exact = {
			let idx = table.alloc().unwrap();
			let pcb = &mut table.pcbs[idx];
			pcb.local = ep(LOCAL);
			pcb.foreign = ep(FOREIGN);
			pcb.state = TcpState::Established;
			idx
		};

		assert_eq!(table.select(ep(LOCAL), ep(FOREIGN)), Some(exact));
		// Any other peer lands on the wildcard listener.
		assert_eq!(table.select(ep(LOCAL), ep("198.51.100.9:1234")), Some(listener));
		assert_eq!(table.select(ep("192.0.2.2:99"), ep(FOREIGN)), None);
	}

	#[test]
	fn passive_handshake_reaches_established() {
		let mut table = PcbTable::new();
		let idx = listen_pcb(&mut table, ep("0.0.0.0:7"));

		segment_arrives(
			&mut table,
			&seg(3000, 0, 1, 1024),
			TcpFlags::SYN,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.state, TcpState::SynReceived);
		assert_eq!(pcb.irs, TcpSeqNumber(3000));
		assert_eq!(pcb.rcv.nxt, TcpSeqNumber(3001));
		assert_eq!(pcb.rcv.wnd, BUFFER_SIZE as u16);
		assert_eq!(pcb.snd.nxt, pcb.iss + 1);
		assert_eq!(pcb.snd.una, pcb.iss);
		assert_eq!(pcb.local, ep(LOCAL));
		assert_eq!(pcb.foreign, ep(FOREIGN));

		let iss = pcb.iss.0 as u32;
		segment_arrives(
			&mut table,
			&seg(3001, iss.wrapping_add(1), 0, 2048),
			TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.state, TcpState::Established);
		// The send window is seeded from the handshake ACK.
		assert_eq!(pcb.snd.wnd, 2048);
		assert_eq!(pcb.snd.wl1, TcpSeqNumber(3001));
		assert_eq!(pcb.snd.wl2, pcb.iss + 1);
	}

	#[test]
	fn active_handshake_reaches_established() {
		let mut table = PcbTable::new();
		let idx = syn_sent_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let iss = table.pcbs[idx].iss.0 as u32;

		segment_arrives(
			&mut table,
			&seg(9000, iss + 1, 1, 4096),
			TcpFlags::SYN | TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.state, TcpState::Established);
		assert_eq!(pcb.snd.nxt, pcb.iss + 1);
		assert_eq!(pcb.rcv.nxt, TcpSeqNumber(9001));
		assert_eq!(pcb.irs, TcpSeqNumber(9000));
		assert_eq!(pcb.snd.wnd, 4096);
		// The SYN retransmit entry is acknowledged and gone.
		assert!(pcb.queue.is_empty());
	}

	#[test]
	fn unacceptable_ack_in_syn_sent_is_refused() {
		let mut table = PcbTable::new();
		let idx = syn_sent_pcb(&mut table, ep(LOCAL), ep(FOREIGN));

		// ACK for a sequence number we never sent; the PCB stays put.
		segment_arrives(
			&mut table,
			&seg(9000, 9999, 1, 4096),
			TcpFlags::SYN | TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::SynSent);
	}

	#[test]
	fn acceptable_rst_in_syn_sent_releases() {
		let mut table = PcbTable::new();
		let idx = syn_sent_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let iss = table.pcbs[idx].iss.0 as u32;

		segment_arrives(
			&mut table,
			&seg(0, iss + 1, 0, 0),
			TcpFlags::RST | TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::Free);

		// A RST without an acceptable ACK is dropped instead.
		let idx = syn_sent_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		segment_arrives(
			&mut table,
			&seg(0, 0, 0, 0),
			TcpFlags::RST,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::SynSent);
	}

	#[test]
	fn segment_text_fills_receive_buffer() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));

		segment_arrives(
			&mut table,
			&seg(1001, 43, 5, 1024),
			TcpFlags::ACK | TcpFlags::PSH,
			b"hello",
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.rcv.nxt, TcpSeqNumber(1006));
		assert_eq!(pcb.rcv.wnd, (BUFFER_SIZE - 5) as u16);
		assert_eq!(&pcb.buf[..5], b"hello");

		// Fill the window completely; it closes to zero.
		segment_arrives(
			&mut table,
			&seg(1006, 43, 11, 1024),
			TcpFlags::ACK,
			&[0xaa; 11],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.rcv.wnd, 0);
		assert_eq!(pcb.rcv.nxt, TcpSeqNumber(1017));

		// Out-of-window text elicits a bare ACK and no state change.
		segment_arrives(
			&mut table,
			&seg(1017, 43, 3, 1024),
			TcpFlags::ACK,
			&[1, 2, 3],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].rcv.nxt, TcpSeqNumber(1017));
	}

	#[test]
	fn window_update_follows_rfc_rule() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let nxt = table.pcbs[idx].snd.nxt;

		// A pure window update (duplicate ACK, same ack number) must still
		// widen the send window.
		segment_arrives(
			&mut table,
			&seg(1001, nxt.0 as u32, 0, 512),
			TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.snd.wnd, 512);
		assert_eq!(pcb.snd.wl1, TcpSeqNumber(1001));
		assert_eq!(pcb.snd.wl2, nxt);

		// A segment from the past is dropped by the sequence check and
		// leaves the window alone.
		segment_arrives(
			&mut table,
			&seg(1000, nxt.0 as u32, 0, 64),
			TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].snd.wnd, 512);
	}

	#[test]
	fn rst_resets_established_connection() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));

		segment_arrives(
			&mut table,
			&seg(1001, 0, 0, 0),
			TcpFlags::RST,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::Free);
	}

	#[test]
	fn syn_in_synchronized_state_resets() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));

		segment_arrives(
			&mut table,
			&seg(1001, 0, 1, 0),
			TcpFlags::SYN,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::Free);
	}

	#[test]
	fn fin_moves_established_to_close_wait() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let nxt = table.pcbs[idx].snd.nxt;

		segment_arrives(
			&mut table,
			&seg(1001, nxt.0 as u32, 1, 1024),
			TcpFlags::ACK | TcpFlags::FIN,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.state, TcpState::CloseWait);
		assert_eq!(pcb.rcv.nxt, TcpSeqNumber(1002));
	}

	#[test]
	fn closing_handshake_transitions() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));

		// Local close: FIN|ACK goes out, sequence space is consumed.
		{
			let pcb = &mut table.pcbs[idx];
			let _ = pcb.output(TcpFlags::ACK | TcpFlags::FIN, &[]);
			pcb.state = TcpState::FinWait1;
			pcb.snd.nxt = pcb.snd.nxt + 1;
		}
		let nxt = table.pcbs[idx].snd.nxt;

		// Peer ACKs our FIN.
		segment_arrives(
			&mut table,
			&seg(1001, nxt.0 as u32, 0, 1024),
			TcpFlags::ACK,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::FinWait2);

		// Peer sends its own FIN; we enter TIME_WAIT with a stamp.
		segment_arrives(
			&mut table,
			&seg(1001, nxt.0 as u32, 1, 1024),
			TcpFlags::ACK | TcpFlags::FIN,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		let pcb = &table.pcbs[idx];
		assert_eq!(pcb.state, TcpState::TimeWait);
		assert!(pcb.time_wait.is_some());
	}

	#[test]
	fn simultaneous_close_reaches_closing() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));

		{
			let pcb = &mut table.pcbs[idx];
			let _ = pcb.output(TcpFlags::ACK | TcpFlags::FIN, &[]);
			pcb.state = TcpState::FinWait1;
			pcb.snd.nxt = pcb.snd.nxt + 1;
		}

		// Peer FIN that does not acknowledge ours.
		let una = table.pcbs[idx].snd.una;
		segment_arrives(
			&mut table,
			&seg(1001, una.0 as u32, 1, 1024),
			TcpFlags::ACK | TcpFlags::FIN,
			&[],
			ep(LOCAL),
			ep(FOREIGN),
		);
		assert_eq!(table.pcbs[idx].state, TcpState::Closing);
	}

	#[test]
	fn retransmit_backoff_doubles_rto() {
		let mut table = PcbTable::new();
		let idx = syn_sent_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let start = Instant::now();

		// Not yet due.
		retransmit_sweep(&mut table, start + Duration::from_millis(100));
		assert_eq!(table.pcbs[idx].queue[0].rto, DEFAULT_RTO);

		// Three successive expiries: 200 -> 400 -> 800 -> 1600 ms.
		let mut at = start + Duration::from_millis(250);
		for expected in [400u64, 800, 1600] {
			retransmit_sweep(&mut table, at);
			let entry = &table.pcbs[idx].queue[0];
			assert_eq!(entry.rto, Duration::from_millis(expected));
			at = entry.last + entry.rto + Duration::from_millis(10);
		}
	}

	#[test]
	fn retransmit_deadline_releases_pcb() {
		let mut table = PcbTable::new();
		let idx = syn_sent_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let first = table.pcbs[idx].queue[0].first;

		retransmit_sweep(&mut table, first + RETRANSMIT_DEADLINE);
		assert_eq!(table.pcbs[idx].state, TcpState::Free);
		assert!(table.pcbs[idx].queue.is_empty());
	}

	#[test]
	fn user_timeout_reaps_stale_pcbs() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let start = table.pcbs[idx].start_time;

		user_timeout_sweep(&mut table, start + USER_TIMEOUT - Duration::from_secs(1));
		assert_eq!(table.pcbs[idx].state, TcpState::Established);

		user_timeout_sweep(&mut table, start + USER_TIMEOUT);
		assert_eq!(table.pcbs[idx].state, TcpState::Free);
	}

	#[test]
	fn time_wait_releases_after_two_msl() {
		let mut table = PcbTable::new();
		let idx = established_pcb(&mut table, ep(LOCAL), ep(FOREIGN));
		let now = Instant::now();
		{
			let pcb = &mut table.pcbs[idx];
			pcb.state = TcpState::TimeWait;
			pcb.time_wait = Some(now);
		}

		time_wait_sweep(&mut table, now + 2 * MSL - Duration::from_secs(1));
		assert_eq!(table.pcbs[idx].state, TcpState::TimeWait);

		time_wait_sweep(&mut table, now + 2 * MSL);
		assert_eq!(table.pcbs[idx].state, TcpState::Free);
	}
}
