#![deny(unsafe_code)]
#![allow(clippy::new_without_default)]

/*! The `poolnet` crate is the data plane of a fixed-memory TCP/IP stack:
a zero-copy packet buffer pool and the TCP transport engine that runs on it.

# Buffer pools

A [PoolSet](storage/struct.PoolSet.html) owns every pool of the stack. Each pool
carves a caller-supplied memory region into fixed-size slots once, at creation
time; nothing is allocated afterwards. A [Packet](storage/struct.Packet.html) is
an owned handle on one slot, optionally chained to further slots for data that
does not fit a single one. Allocation may suspend the calling thread until
another thread (or a driver completing a transmission) releases a slot.

# TCP

The [Stack](iface/struct.Stack.html) owns the pools, the connections and the
listeners. Inbound segments, already stripped of their IP header, are handed to
[Stack::dispatch](iface/struct.Stack.html#method.dispatch); finished outbound
segments leave through the [IpLayer](iface/trait.IpLayer.html) trait, which is the
only thing the engine requires from the IP layer. Connection management follows
RFC 793, congestion control follows RFC 5681 with the RFC 6582 fast-recovery
modifications, and MSS and window scaling are negotiated on the handshake.

The retransmission timer is driven from the outside: the host calls
[Stack::tick](iface/struct.Stack.html#method.tick) periodically, or
[Stack::retransmit](iface/struct.Stack.html#method.retransmit) directly from its
own scheduler.

# Concurrency

Pool state is guarded by short critical sections that are safe to enter from a
driver completion context. Connection state is guarded by one lock per stack,
which is never held while a thread is suspended. Suspended callers are resumed
through a rendezvous channel carrying their result.
*/

#[macro_use]
mod macros;
mod rand;

pub mod config;
pub mod iface;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wait;
pub mod wire;
