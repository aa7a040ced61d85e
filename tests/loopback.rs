//! End-to-end tests over the loopback device: the worker, both transports,
//! and the blocking user API with real parked threads.

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, Once};
use std::time::{Duration, Instant};

use netstack::Error;
use netstack::net::ipv4::{self, Endpoint, IpInterface};
use netstack::net::{tcp, udp};

/// The stack is process-global; tests take turns.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
	static ONCE: Once = Once::new();
	ONCE.call_once(|| {
		netstack::init().unwrap();

		let lo = netstack::drivers::loopback::init().unwrap();
		ipv4::iface_register(&lo, IpInterface::new("127.0.0.1", "255.0.0.0").unwrap()).unwrap();

		// A blackhole towards 192.0.2.0/24 and everything else, the shape
		// of the reference setup with its Ethernet uplink replaced by the
		// dummy device.
		let dummy = netstack::drivers::dummy::init().unwrap();
		let iface = ipv4::iface_register(
			&dummy,
			IpInterface::new("192.0.2.2", "255.255.255.0").unwrap(),
		)
		.unwrap();
		ipv4::route_set_default_gateway(&iface, "192.0.2.1").unwrap();

		netstack::run().unwrap();
	});
	TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn ep(s: &str) -> Endpoint {
	s.parse().unwrap()
}

#[test]
fn udp_datagram_over_loopback() {
	let _guard = setup();

	let receiver = udp::open().unwrap();
	udp::bind(receiver, ep("127.0.0.1:7")).unwrap();
	let sender = udp::open().unwrap();
	udp::bind(sender, ep("127.0.0.1:10000")).unwrap();

	// Binding the same endpoint twice is refused.
	let other = udp::open().unwrap();
	assert_eq!(udp::bind(other, ep("127.0.0.1:7")), Err(Error::InUse));
	udp::close(other).unwrap();

	assert_eq!(udp::sendto(sender, b"hello\n", ep("127.0.0.1:7")), Ok(6));

	let mut buf = [0u8; 64];
	let (len, foreign) = udp::recvfrom(receiver, &mut buf).unwrap();
	assert_eq!(&buf[..len], b"hello\n");
	assert_eq!(foreign, ep("127.0.0.1:10000"));

	udp::close(sender).unwrap();
	udp::close(receiver).unwrap();
}

#[test]
fn udp_sendto_via_dummy_route() {
	let _guard = setup();

	// An unbound socket picks its source address from the egress
	// interface; the dummy device swallows the frame.
	let sock = udp::open().unwrap();
	assert_eq!(udp::sendto(sock, b"probe", ep("192.0.2.1:7")), Ok(5));
	udp::close(sock).unwrap();
}

/// 64 bytes pushed through a 16-byte receive window arrive complete and
/// in order; the sender parks whenever the window is exhausted and is
/// unblocked by the reader's window updates.
#[test]
fn tcp_flow_control_delivers_in_order() {
	let _guard = setup();

	let server = std::thread::spawn(|| {
		let id = tcp::open(ep("127.0.0.1:10007"), None, false).unwrap();
		let mut collected = Vec::new();
		let mut buf = [0u8; 2048];
		loop {
			let n = tcp::receive(id, &mut buf).unwrap();
			if n == 0 {
				break;
			}
			assert!(n <= 16, "read exceeds the receive buffer");
			collected.extend_from_slice(&buf[..n]);
		}
		tcp::close(id).unwrap();
		collected
	});

	// Give the listener a moment to install itself.
	std::thread::sleep(Duration::from_millis(50));

	let id = tcp::open(ep("127.0.0.1:7"), Some(ep("127.0.0.1:10007")), true).unwrap();

	let message: Vec<u8> = (0u8..64).collect();
	assert_eq!(tcp::send(id, &message), Ok(64));
	tcp::close(id).unwrap();

	assert_eq!(server.join().unwrap(), message);

	// The connection is closing; further user calls are refused.
	let mut buf = [0u8; 16];
	assert!(tcp::receive(id, &mut buf).is_err());
	assert!(tcp::send(id, b"x").is_err());
}

/// Scenario: a client ping-pongs chunks against an echo peer, then closes;
/// the peer observes an exact echo and a clean FIN.
#[test]
fn tcp_echo_ping_pong() {
	let _guard = setup();

	let server = std::thread::spawn(|| {
		let id = tcp::open(ep("127.0.0.1:40002"), None, false).unwrap();
		let mut buf = [0u8; 2048];
		loop {
			let n = tcp::receive(id, &mut buf).unwrap();
			if n == 0 {
				break;
			}
			tcp::send(id, &buf[..n]).unwrap();
		}
		tcp::close(id).unwrap();
	});

	std::thread::sleep(Duration::from_millis(50));

	let id = tcp::open(ep("127.0.0.1:40001"), Some(ep("127.0.0.1:40002")), true).unwrap();

	let message: Vec<u8> = (b'a'..=b'z').collect();
	let mut buf = [0u8; 2048];
	for chunk in message.chunks(8) {
		assert_eq!(tcp::send(id, chunk), Ok(chunk.len()));

		let mut echoed = Vec::new();
		while echoed.len() < chunk.len() {
			let n = tcp::receive(id, &mut buf).unwrap();
			assert!(n > 0, "peer closed early");
			echoed.extend_from_slice(&buf[..n]);
		}
		assert_eq!(echoed, chunk);
	}

	tcp::close(id).unwrap();
	server.join().unwrap();
}

#[test]
fn tcp_receive_interrupted_exactly_once() {
	let _guard = setup();

	let (tx, rx) = mpsc::channel();
	let server = std::thread::spawn(move || {
		tx.send(None).unwrap();
		let id = tcp::open(ep("127.0.0.1:20002"), None, false).unwrap();
		let mut buf = [0u8; 64];

		// The first wait is interrupted by the event broadcast...
		let interrupted = tcp::receive(id, &mut buf);
		tx.send(Some(interrupted.map(|n| buf[..n].to_vec()))).unwrap();

		// ...and only that one; the next wait completes normally.
		let data = tcp::receive(id, &mut buf);
		tx.send(Some(data.map(|n| buf[..n].to_vec()))).unwrap();

		loop {
			if tcp::receive(id, &mut buf).unwrap() == 0 {
				break;
			}
		}
		tcp::close(id).unwrap();
	});

	assert_eq!(rx.recv().unwrap(), None);
	std::thread::sleep(Duration::from_millis(50));

	let id = tcp::open(ep("127.0.0.1:20001"), Some(ep("127.0.0.1:20002")), true).unwrap();
	std::thread::sleep(Duration::from_millis(300));

	netstack::raise_event();
	assert_eq!(rx.recv().unwrap(), Some(Err(Error::Interrupted)));

	tcp::send(id, b"ping").unwrap();
	assert_eq!(rx.recv().unwrap(), Some(Ok(b"ping".to_vec())));

	tcp::close(id).unwrap();
	server.join().unwrap();
}

/// An unanswered SYN is retransmitted with backoff until the 12 s deadline
/// reaps the connection.
#[test]
fn tcp_unanswered_connect_hits_retransmit_deadline() {
	let _guard = setup();

	let started = Instant::now();
	let result = tcp::open(ep("192.0.2.2:30001"), Some(ep("192.0.2.1:30002")), true);
	let elapsed = started.elapsed();

	assert_eq!(result.unwrap_err(), Error::TimedOut);
	assert!(elapsed >= Duration::from_secs(11), "reaped too early: {elapsed:?}");
	assert!(elapsed < Duration::from_secs(25), "reaped too late: {elapsed:?}");
}
