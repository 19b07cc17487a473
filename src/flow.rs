//! Flow hashing for multipath selection.
//!
//! A route with several next hops needs one of them picked per packet,
//! and consistently so for the packets of one flow. The hash modes trade
//! granularity against cost: `single` pins everything to the first hop,
//! `addr` and `port` hash the flow key fields, `packet` spreads every
//! packet independently.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::types::RouteTableError;

const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;

//------------ HashMode ------------------------------------------------------

/// How the per-packet flow hash is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashMode {
    /// Always zero: every packet takes the first hop.
    Single,
    /// Hash of source and destination address.
    Addr,
    /// Like [HashMode::Addr], additionally folding in the TCP/UDP ports
    /// of first-fragment packets.
    Port,
    /// A fresh pseudo-random value per packet.
    Packet,
}

impl FromStr for HashMode {
    type Err = RouteTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(HashMode::Single),
            "addr" => Ok(HashMode::Addr),
            "port" => Ok(HashMode::Port),
            "packet" => Ok(HashMode::Packet),
            other => Err(RouteTableError::UnknownMode(other.to_string())),
        }
    }
}

//------------ FlowPacket ----------------------------------------------------

/// The slice of a packet the routing element consumes.
///
/// Implemented by the host dataplane's packet type; the engine reads the
/// IPv4 flow key fields and, on a successful lookup, writes the gateway
/// back as the new destination annotation.
pub trait FlowPacket {
    fn src_ip(&self) -> Ipv4Addr;
    fn dst_ip(&self) -> Ipv4Addr;
    fn ip_proto(&self) -> u8;
    /// Whether this packet is unfragmented or the first fragment, i.e.
    /// whether its transport header is present.
    fn is_first_fragment(&self) -> bool;
    /// The transport header and everything behind it.
    fn transport_header(&self) -> &[u8];
    fn set_dst_ip(&mut self, gw: Ipv4Addr);
}

//------------ flow_hash -----------------------------------------------------

/// Computes the flow hash for a packet under the given mode and salt.
///
/// Deterministic for the deterministic modes: two packets with equal flow
/// key fields hash identically for the lifetime of the salt.
pub fn flow_hash<P: FlowPacket + ?Sized>(
    mode: HashMode,
    salt: u32,
    pkt: &P,
) -> u32 {
    match mode {
        HashMode::Single => 0,
        HashMode::Addr | HashMode::Port => {
            let src = u32::from(pkt.src_ip());
            let dst = u32::from(pkt.dst_ip());
            let mut a = src.wrapping_mul(59) ^ dst ^ salt;
            if mode == HashMode::Port
                && pkt.is_first_fragment()
                && matches!(
                    pkt.ip_proto(),
                    IP_PROTO_TCP | IP_PROTO_UDP
                )
            {
                let th = pkt.transport_header();
                if th.len() >= 4 {
                    a ^= u32::from(u16::from_be_bytes([th[0], th[1]]));
                    a ^= u32::from(u16::from_be_bytes([th[2], th[3]])) << 16;
                }
            }
            avalanche(a)
        }
        HashMode::Packet => rand::random(),
    }
}

// Bob Jenkins' 32-bit integer avalanche,
// http://burtleburtle.net/bob/hash/integer.html
fn avalanche(mut a: u32) -> u32 {
    a = a.wrapping_add(0x7ed55d16).wrapping_add(a << 12);
    a = (a ^ 0xc761c23c) ^ (a >> 19);
    a = a.wrapping_add(0x165667b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2646c) ^ (a << 9);
    a = a.wrapping_add(0xfd7046c5).wrapping_add(a << 3);
    a = (a ^ 0xb55a4f09) ^ (a >> 16);
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal in-memory packet for exercising the hash modes.
    #[derive(Clone)]
    pub(crate) struct TestPacket {
        pub src: Ipv4Addr,
        pub dst: Ipv4Addr,
        pub proto: u8,
        pub first_fragment: bool,
        pub transport: Vec<u8>,
    }

    impl TestPacket {
        pub fn udp(src: &str, dst: &str, sport: u16, dport: u16) -> Self {
            let mut transport = Vec::new();
            transport.extend_from_slice(&sport.to_be_bytes());
            transport.extend_from_slice(&dport.to_be_bytes());
            TestPacket {
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                proto: IP_PROTO_UDP,
                first_fragment: true,
                transport,
            }
        }
    }

    impl FlowPacket for TestPacket {
        fn src_ip(&self) -> Ipv4Addr {
            self.src
        }
        fn dst_ip(&self) -> Ipv4Addr {
            self.dst
        }
        fn ip_proto(&self) -> u8 {
            self.proto
        }
        fn is_first_fragment(&self) -> bool {
            self.first_fragment
        }
        fn transport_header(&self) -> &[u8] {
            &self.transport
        }
        fn set_dst_ip(&mut self, gw: Ipv4Addr) {
            self.dst = gw;
        }
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("single".parse::<HashMode>().unwrap(), HashMode::Single);
        assert_eq!("addr".parse::<HashMode>().unwrap(), HashMode::Addr);
        assert_eq!("port".parse::<HashMode>().unwrap(), HashMode::Port);
        assert_eq!("packet".parse::<HashMode>().unwrap(), HashMode::Packet);
        assert!(matches!(
            "flow".parse::<HashMode>(),
            Err(RouteTableError::UnknownMode(_))
        ));
    }

    #[test]
    fn single_mode_is_zero() {
        let pkt = TestPacket::udp("10.0.0.1", "10.0.0.2", 1234, 80);
        assert_eq!(flow_hash(HashMode::Single, 0xdead_beef, &pkt), 0);
    }

    #[test]
    fn deterministic_modes_are_deterministic() {
        let pkt = TestPacket::udp("10.0.0.1", "192.0.2.7", 1234, 80);
        for mode in [HashMode::Addr, HashMode::Port] {
            assert_eq!(
                flow_hash(mode, 42, &pkt),
                flow_hash(mode, 42, &pkt.clone())
            );
        }
    }

    #[test]
    fn addr_mode_ignores_ports() {
        let a = TestPacket::udp("10.0.0.1", "192.0.2.7", 1234, 80);
        let b = TestPacket::udp("10.0.0.1", "192.0.2.7", 80, 1234);
        assert_eq!(
            flow_hash(HashMode::Addr, 42, &a),
            flow_hash(HashMode::Addr, 42, &b)
        );
    }

    #[test]
    fn port_mode_reads_ports_of_first_fragments_only() {
        let first = TestPacket::udp("10.0.0.1", "192.0.2.7", 1234, 80);
        let mut late = first.clone();
        late.first_fragment = false;
        let mut other_ports = first.clone();
        other_ports.transport = vec![0xde, 0xad, 0xbe, 0xef];
        other_ports.first_fragment = false;

        // Non-first fragments fall back to pure address hashing, so the
        // transport bytes cannot matter.
        assert_eq!(
            flow_hash(HashMode::Port, 42, &late),
            flow_hash(HashMode::Port, 42, &other_ports)
        );
        // ...and they agree with addr mode under the same salt.
        assert_eq!(
            flow_hash(HashMode::Port, 42, &late),
            flow_hash(HashMode::Addr, 42, &first)
        );
    }

    #[test]
    fn port_mode_ignores_non_transport_protocols() {
        let mut icmp = TestPacket::udp("10.0.0.1", "192.0.2.7", 0, 0);
        icmp.proto = 1;
        icmp.transport = vec![8, 0, 0x12, 0x34];
        assert_eq!(
            flow_hash(HashMode::Port, 42, &icmp),
            flow_hash(HashMode::Addr, 42, &icmp)
        );
    }

    #[test]
    fn truncated_transport_header_is_tolerated() {
        let mut pkt = TestPacket::udp("10.0.0.1", "192.0.2.7", 1, 2);
        pkt.transport = vec![0x01];
        assert_eq!(
            flow_hash(HashMode::Port, 42, &pkt),
            flow_hash(HashMode::Addr, 42, &pkt)
        );
    }

    #[test]
    fn salt_perturbs_the_hash() {
        let pkt = TestPacket::udp("10.0.0.1", "192.0.2.7", 1234, 80);
        assert_ne!(
            flow_hash(HashMode::Addr, 1, &pkt),
            flow_hash(HashMode::Addr, 2, &pkt)
        );
    }
}
