//! An IP layer that records what the stack transmits.

use std::mem;
use std::vec::Vec;

use super::{Checksum, IpLayer, Transmit};
use crate::config::{IP_HEADER_ROOM, TCP_PACKET_HEADROOM};
use crate::socket::tcp::{emit_segment, segment_checksum};
use crate::storage::{Packet, PacketId, PoolHandle, PoolSet};
use crate::wait::Wait;
use crate::wire::{Ipv4Address, TcpPacket, TcpRepr, TCP_MAX_HEADER_LEN};

#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub(crate) transmit: Transmit,
    pub(crate) repr: TcpRepr,
    pub(crate) payload: Vec<u8>,
    pub(crate) id: PacketId,
}

#[derive(Debug, Default)]
pub(crate) struct Capture {
    pub(crate) source: Option<Ipv4Address>,
    pub(crate) sent: Vec<Sent>,
    /// Keep packets instead of completing them, like a slow driver.
    pub(crate) hold: bool,
    pub(crate) held: Vec<PacketId>,
}

impl Capture {
    pub(crate) fn new(source: Ipv4Address) -> Capture {
        Capture {
            source: Some(source),
            ..Capture::default()
        }
    }

    pub(crate) fn take(&mut self) -> Vec<Sent> {
        mem::take(&mut self.sent)
    }

    pub(crate) fn complete_held(&mut self, pools: &PoolSet<'_>) {
        for id in self.held.drain(..) {
            pools.transmit_release(id).unwrap();
        }
    }
}

impl IpLayer for Capture {
    fn source_address(&self, _dst: Ipv4Address) -> Option<Ipv4Address> {
        self.source
    }

    fn send(&mut self, pools: &PoolSet<'_>, packet: PacketId, transmit: &Transmit) {
        assert!(pools.headroom_id(packet) >= IP_HEADER_ROOM, "no room for the IP header");
        let mut bytes = vec![0u8; pools.length_id(packet)];
        assert_eq!(pools.read_id(packet, 0, &mut bytes), bytes.len());

        let tcp = TcpPacket::new_checked(&bytes[..]).expect("truncated segment");
        if tcp.checksum() != 0 {
            assert_eq!(
                segment_checksum(pools, packet, transmit.src_addr, transmit.dst_addr),
                !0,
                "bad checksum"
            );
        }
        let repr = TcpRepr::parse(&tcp).expect("malformed segment");
        let payload = bytes[tcp.header_len() as usize..].to_vec();
        self.sent.push(Sent {
            transmit: *transmit,
            repr,
            payload,
            id: packet,
        });

        if self.hold {
            self.held.push(packet);
        } else {
            pools.transmit_release(packet).unwrap();
        }
    }
}

/// Build an inbound segment the way a peer would have sent it.
pub(crate) fn segment(
    pools: &PoolSet<'_>,
    pool: PoolHandle,
    repr: &TcpRepr,
    payload: &[u8],
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
) -> Packet {
    let mut packet = pools
        .allocate(pool, TCP_PACKET_HEADROOM, Wait::NoWait)
        .unwrap();
    if !payload.is_empty() {
        pools.append(&mut packet, payload, Wait::NoWait).unwrap();
    }
    assert!(repr.header_len() <= TCP_MAX_HEADER_LEN);
    emit_segment(pools, packet.id(), repr, src_addr, dst_addr, Checksum::Both).unwrap();
    packet
}
