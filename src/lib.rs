//! A userspace TCP/IP protocol stack.
//!
//! The stack runs a single cooperative worker that serializes device input,
//! timers, and event broadcasts; user tasks block on a socket-like API and
//! are woken by the worker. Frames enter through pluggable link drivers
//! (see [`drivers`]) and flow through ARP/IP/ICMP/UDP/TCP.
//!
//! Lifecycle: [`init`] registers the built-in protocols, then devices and
//! interfaces are set up, then [`run`] starts the worker. [`shutdown`]
//! stops it again.
//!
//! ```no_run
//! use netstack::net::ipv4::{Endpoint, IpInterface};
//! use netstack::net::{ipv4, tcp};
//!
//! netstack::init().unwrap();
//! let dev = netstack::drivers::loopback::init().unwrap();
//! ipv4::iface_register(&dev, IpInterface::new("127.0.0.1", "255.0.0.0").unwrap()).unwrap();
//! netstack::run().unwrap();
//!
//! let local: Endpoint = "127.0.0.1:7".parse().unwrap();
//! let id = tcp::open(local, None, false).unwrap();
//! let mut buf = [0u8; 2048];
//! while let Ok(n) = tcp::receive(id, &mut buf) {
//! 	if n == 0 {
//! 		break;
//! 	}
//! 	tcp::send(id, &buf[..n]).unwrap();
//! }
//! tcp::close(id).unwrap();
//! netstack::shutdown();
//! ```

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod drivers;
mod entropy;
pub mod errno;
mod logging;
pub mod net;
mod synch;

pub use crate::errno::{Error, Result};
pub use crate::net::{init, raise_event, run, shutdown};
