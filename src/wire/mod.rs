/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   [TcpPacket] structure.
 * Second, in cases where the space of valid field values is much smaller than the space
   of possible field values, it provides a compact, high-level representation
   of packet data that can be parsed from and emitted into a sequence of octets.
   This happens through [TcpRepr].

The `Packet` family of data structures guarantees that, if the `Packet::check_len()` method
returned `Ok(())`, then no accessor or setter method will panic; however, the guarantee
provided by `Packet::check_len()` may no longer hold after changing certain fields,
which are listed in the documentation for the specific packet.

When parsing untrusted input, it is *necessary* to use `Packet::new_checked()`;
so long as the buffer is not modified, no accessor will fail.
When emitting output, though, it is *incorrect* to use `Packet::new_checked()`;
the length check is likely to succeed on a zeroed buffer, but fail on a buffer
filled with data from a previous packet.

Segments handed to the transport engine live in pool chains rather than in one
contiguous buffer. The engine copies the header out of the chain into a stack
buffer to parse it, and computes checksums over the chain with
[checksum::Accumulator](ip::checksum::Accumulator).

# Examples

To emit a TCP header into an octet buffer, and then parse it back:

```rust
use poolnet::wire::*;
let repr = TcpRepr {
    src_port:     49152,
    dst_port:     80,
    flags:        TcpFlags::SYN,
    seq_number:   TcpSeqNumber(1000),
    ack_number:   None,
    window_len:   8192,
    urgent_at:    0,
    max_seg_size: Some(1460),
    window_scale: None,
};
let mut buffer = vec![0; repr.header_len()];
{ // emission
    let mut packet = TcpPacket::new_unchecked(&mut buffer[..]);
    repr.emit(&mut packet);
}
{ // parsing
    let packet = TcpPacket::new_checked(&buffer[..])
                            .expect("truncated packet");
    let parsed = TcpRepr::parse(&packet)
                          .expect("malformed packet");
    assert_eq!(repr, parsed);
}
```
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
}

pub(crate) mod ip;

pub(crate) mod ipv4;

mod tcp;

use core::fmt;

pub use self::ip::{checksum, Endpoint as IpEndpoint, Protocol as IpProtocol};

pub use self::ipv4::{
    Address as Ipv4Address, HEADER_LEN as IPV4_HEADER_LEN,
};

pub(crate) use self::ipv4::AddressExt as Ipv4AddressExt;

pub use self::tcp::{
    Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    TcpOption, HEADER_LEN as TCP_HEADER_LEN, MAX_HEADER_LEN as TCP_MAX_HEADER_LEN,
    MAX_WINDOW_SCALE as TCP_MAX_WINDOW_SCALE,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by poolnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
