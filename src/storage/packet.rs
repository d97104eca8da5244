use core::fmt;

use super::PoolHandle;

/// The identity of one slot of one pool.
///
/// A slot's generation is bumped every time it returns to its pool, so an id
/// that outlives its packet is recognized as stale rather than aliasing
/// whatever the slot holds next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId {
    pub(crate) pool: PoolHandle,
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

impl PacketId {
    /// The pool the slot belongs to.
    pub const fn pool(&self) -> PoolHandle {
        self.pool
    }

    /// The slot number within its pool.
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}.{}", self.pool, self.index, self.generation)
    }
}

/// An owned packet: the head slot of a chain.
///
/// A chain is made of runs. A run is a list of slots of one pool; the first
/// slot of each run may name the run that continues the chain, which can live
/// in another pool.
///
/// A `Packet` is not `Clone`. Handing it to a function that takes it by value
/// transfers ownership; the only ways to give the slots back are
/// [PoolSet::release](super::PoolSet::release) and the stack's own queues.
#[must_use = "a dropped packet is never returned to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    id: PacketId,
}

impl Packet {
    pub(crate) const fn from_id(id: PacketId) -> Packet {
        Packet { id }
    }

    pub const fn id(&self) -> PacketId {
        self.id
    }

    pub const fn pool(&self) -> PoolHandle {
        self.id.pool
    }

    /// Give up the handle, e.g. when passing the packet to a driver that will
    /// later report completion through its id.
    pub fn into_id(self) -> PacketId {
        self.id
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// The role a slot currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// On the pool's free list.
    Free { next: Option<u16> },
    /// Owned by the application, or part of a chain.
    Allocated,
    /// On a connection's sent queue and handed to the driver.
    Queued,
    /// On a connection's sent queue, the driver is done with it.
    DriverDone,
    /// On a connection's receive queue.
    Received,
}

impl Link {
    pub const fn is_free(&self) -> bool {
        matches!(self, Link::Free { .. })
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Link::Free { .. } => write!(f, "free"),
            Link::Allocated => write!(f, "allocated"),
            Link::Queued => write!(f, "queued"),
            Link::DriverDone => write!(f, "driver-done"),
            Link::Received => write!(f, "received"),
        }
    }
}

/// Bookkeeping for one slot. The cursors are relative to the slot's data area.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub(crate) offset: usize,
    pub(crate) capacity: usize,
    pub(crate) head: usize,
    pub(crate) tail: usize,
    /// Length of the run. Only meaningful in the run's first slot.
    pub(crate) total_len: usize,
    /// Next slot of the run, always in the same pool.
    pub(crate) next: Option<u16>,
    /// First slot of the next run. Only meaningful in the run's first slot.
    pub(crate) more: Option<PacketId>,
    pub(crate) link: Link,
    pub(crate) generation: u16,
}

impl Descriptor {
    pub(crate) const fn free(offset: usize, capacity: usize, next: Option<u16>) -> Descriptor {
        Descriptor {
            offset,
            capacity,
            head: 0,
            tail: 0,
            total_len: 0,
            next: None,
            more: None,
            link: Link::Free { next },
            generation: 0,
        }
    }

    pub(crate) fn reset(&mut self, headroom: usize) {
        self.head = headroom;
        self.tail = headroom;
        self.total_len = 0;
        self.next = None;
        self.more = None;
        self.link = Link::Allocated;
    }

    pub(crate) const fn len(&self) -> usize {
        self.tail - self.head
    }

    pub(crate) const fn tailroom(&self) -> usize {
        self.capacity - self.tail
    }
}
