use core::fmt;

use super::Ipv4Address;

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        HopByHop  = 0x00,
        Icmp      = 0x01,
        Igmp      = 0x02,
        Tcp       = 0x06,
        Udp       = 0x11,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::HopByHop => write!(f, "Hop-by-Hop"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Igmp => write!(f, "IGMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{id:02x}"),
        }
    }
}

/// An internet endpoint address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Endpoint {
    pub addr: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint address from given address and port.
    pub const fn new(addr: Ipv4Address, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<(Ipv4Address, u16)> for Endpoint {
    fn from((addr, port): (Ipv4Address, u16)) -> Endpoint {
        Endpoint { addr, port }
    }
}

pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::*;

    const fn propagate_carries(word: u64) -> u16 {
        let mut sum = word;
        while sum >> 16 != 0 {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        sum as u16
    }

    /// Running one's complement sum over data that arrives in pieces of
    /// arbitrary length, as when walking a chain of slots.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Accumulator {
        sum: u64,
        odd: bool,
    }

    impl Accumulator {
        pub const fn new() -> Accumulator {
            Accumulator { sum: 0, odd: false }
        }

        pub fn add(&mut self, mut data: &[u8]) {
            if self.odd {
                if let Some((&low, rest)) = data.split_first() {
                    self.sum += low as u64;
                    self.odd = false;
                    data = rest;
                }
            }
            let mut words = data.chunks_exact(2);
            for word in &mut words {
                self.sum += NetworkEndian::read_u16(word) as u64;
            }
            if let [high] = words.remainder() {
                self.sum += (*high as u64) << 8;
                self.odd = true;
            }
        }

        pub const fn finish(&self) -> u16 {
            propagate_carries(self.sum)
        }
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(data: &[u8]) -> u16 {
        let mut accum = Accumulator::new();
        accum.add(data);
        accum.finish()
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u64 = 0;
        for &word in checksums {
            accum += word as u64;
        }
        propagate_carries(accum)
    }

    /// Compute an IPv4 pseudo header checksum.
    pub fn pseudo_header_v4(
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        next_header: Protocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len[..]),
        ])
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn test_rfc1071_example() {
            let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
            assert_eq!(data(&bytes), 0xddf2);
        }

        #[test]
        fn test_split_at_odd_offsets() {
            let bytes: [u8; 11] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
            let mut accum = Accumulator::new();
            accum.add(&bytes[..3]);
            accum.add(&bytes[3..4]);
            accum.add(&[]);
            accum.add(&bytes[4..]);
            assert_eq!(accum.finish(), data(&bytes));
        }

        #[test]
        fn test_pseudo_header() {
            let src = Ipv4Address::new(192, 168, 0, 1);
            let dst = Ipv4Address::new(192, 168, 0, 199);
            let sum = pseudo_header_v4(&src, &dst, Protocol::Tcp, 20);
            let expected = combine(&[0xc0a8, 0x0001, 0xc0a8, 0x00c7, 0x0006, 0x0014]);
            assert_eq!(sum, expected);
        }
    }
}
