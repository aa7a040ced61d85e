use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address};

use crate::errno::Result;
use crate::net::ipv4::{self, IpInterface};

fn input(data: &[u8], src: Ipv4Address, _dst: Ipv4Address, iface: &Arc<IpInterface>) {
	let caps = ChecksumCapabilities::default();
	let repr = Icmpv4Packet::new_checked(data).and_then(|packet| Icmpv4Repr::parse(&packet, &caps));
	let Ok(repr) = repr else {
		warn!("malformed message, src={}, len={}", src, data.len());
		return;
	};

	match repr {
		Icmpv4Repr::EchoRequest { ident, seq_no, data } => {
			debug!("echo request, src={}, ident={}, seq={}", src, ident, seq_no);
			let reply = Icmpv4Repr::EchoReply { ident, seq_no, data };
			let mut buf = vec![0u8; reply.buffer_len()];
			reply.emit(&mut Icmpv4Packet::new_unchecked(&mut buf[..]), &caps);
			if let Err(err) = ipv4::output(IpProtocol::Icmp, &buf, iface.unicast, src) {
				warn!("echo reply failure, dst={}: {}", src, err);
			}
		}
		_ => {
			debug!("ignored message, src={}", src);
		}
	}
}

pub(crate) fn init() -> Result<()> {
	ipv4::protocol_register(IpProtocol::Icmp, Box::new(input))
}
