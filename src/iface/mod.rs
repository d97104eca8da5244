/*! The TCP stack and its seam to the IP layer below.

The [Stack] owns the packet pools, every connection and every listener, and
serializes access to them with a single lock. It never talks to a network
device itself: finished segments are handed to an [IpLayer] implementation,
and inbound segments are pushed into [Stack::dispatch] by whoever receives
them.
*/

mod stack;

#[cfg(test)]
pub(crate) mod capture;

use core::fmt;

use crate::config::TCP_TX_QUEUE_MAX;
use crate::socket::tcp::ConnectionHandle;
use crate::storage::{PacketId, PoolSet};
use crate::time::Duration;
use crate::wire::{IpProtocol, Ipv4Address, IPV4_HEADER_LEN, TCP_HEADER_LEN, TCP_MAX_WINDOW_SCALE};

pub(crate) use self::stack::Context;
pub use self::stack::Stack;

/// The layer the stack hands finished segments to.
///
/// # Ownership
///
/// [send](IpLayer::send) receives the id of a packet whose TCP header and
/// checksum are complete, with [IP_HEADER_ROOM](crate::config::IP_HEADER_ROOM)
/// octets of header room in front of it. From then on the packet belongs to
/// the implementation until it calls
/// [PoolSet::transmit_release] with the same id. That call must happen
/// exactly once, whether the datagram went out or was dropped; the pool
/// decides whether the slots go back to the free list or stay on a
/// connection's sent queue for retransmission.
///
/// Transmission is fire and forget. Failures are not reported back; the
/// retransmission timer recovers from them.
///
/// # Locking
///
/// `send` is called with the stack locked. It may use `pools` freely (no pool
/// lock is held) but must not call back into the [Stack].
pub trait IpLayer: Send {
    /// The local address to use toward `dst`, or `None` when `dst` is not
    /// reachable.
    fn source_address(&self, dst: Ipv4Address) -> Option<Ipv4Address>;

    /// Wrap the segment `packet` in an IP datagram and send it.
    fn send(&mut self, pools: &PoolSet<'_>, packet: PacketId, transmit: &Transmit);
}

/// IP parameters of one outgoing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmit {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub protocol: IpProtocol,
    pub type_of_service: u8,
    pub time_to_live: u8,
    pub dont_fragment: bool,
}

impl fmt::Display for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} src={} dst={} tos={} ttl={}",
            self.protocol, self.src_addr, self.dst_addr, self.type_of_service, self.time_to_live
        )?;
        if self.dont_fragment {
            write!(f, " df")?;
        }
        Ok(())
    }
}

/// A description of checksum behavior for every supported protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Checksum {
    /// Verify checksum when receiving and compute checksum when sending.
    #[default]
    Both,
    /// Verify checksum when receiving.
    Rx,
    /// Compute checksum before sending.
    Tx,
    /// Ignore checksum completely.
    None,
}

impl Checksum {
    /// Returns whether checksum should be verified when receiving.
    pub fn rx(&self) -> bool {
        match *self {
            Checksum::Both | Checksum::Rx => true,
            _ => false,
        }
    }

    /// Returns whether checksum should be verified when sending.
    pub fn tx(&self) -> bool {
        match *self {
            Checksum::Both | Checksum::Tx => true,
            _ => false,
        }
    }
}

/// Configuration of a [Stack], fixed when it is created.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Largest IP datagram the link below carries. The local maximum segment
    /// size is derived from it.
    pub mtu: usize,
    /// Receive window of every connection, in octets.
    pub rx_window: usize,
    /// Initial retransmission timeout.
    pub timeout: Duration,
    /// Retransmissions of one segment before the connection is aborted.
    pub max_retries: u8,
    /// The timeout is `timeout << (retries * retry_shift)`.
    pub retry_shift: u8,
    /// Segments allowed on a connection's sent queue at once.
    pub tx_queue_depth: usize,
    pub type_of_service: u8,
    pub time_to_live: u8,
    pub dont_fragment: bool,
    pub checksum: Checksum,
    /// Seed for initial sequence numbers and ephemeral ports.
    pub random_seed: u64,
    /// Called with the stack locked whenever a segment with the URG flag is
    /// accepted on a connection.
    pub urgent_callback: Option<fn(ConnectionHandle)>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Segment size this host accepts, as announced in its SYN.
    pub(crate) fn local_mss(&self) -> usize {
        self.mtu
            .saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN)
            .clamp(1, u16::MAX as usize)
    }

    /// Largest receive window that can be advertised.
    pub(crate) fn rx_window(&self) -> usize {
        self.rx_window.min((u16::MAX as usize) << TCP_MAX_WINDOW_SCALE)
    }

    /// Window scale to offer, the smallest that covers the receive window.
    pub(crate) fn window_shift(&self) -> u8 {
        let rx_window_log2 = usize::BITS - self.rx_window().leading_zeros();
        (rx_window_log2.saturating_sub(16) as u8).min(TCP_MAX_WINDOW_SCALE)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mtu: 1500,
            rx_window: 8192,
            timeout: Duration::from_secs(1),
            max_retries: 10,
            retry_shift: 1,
            tx_queue_depth: TCP_TX_QUEUE_MAX,
            type_of_service: 0,
            time_to_live: 64,
            dont_fragment: true,
            checksum: Checksum::Both,
            random_seed: 0,
            urgent_callback: None,
        }
    }
}
