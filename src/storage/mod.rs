/*! Packet storage.

The `storage` module provides the fixed-capacity packet buffer pools the rest of
the stack runs on. A pool is carved out of one caller-supplied memory region when
it is created and never allocates afterwards; every [Packet] is a handle on one
of its slots, possibly chained to further slots when the data does not fit.

Packets move between owners without copying. The application owns a packet
while it fills it in, the connection owns it while it sits in a send or receive
queue, and the driver owns it between [`IpLayer::send`](crate::iface::IpLayer::send)
and [PoolSet::transmit_release]. The [Link] role recorded in the packet's head
slot tells which of those is current.
*/

mod packet;
mod pool;
mod section;

pub use self::packet::{Link, Packet, PacketId};
pub use self::pool::{AllocError, Pool, PoolError, PoolHandle, PoolSet, PoolSetFull, PoolStats};
