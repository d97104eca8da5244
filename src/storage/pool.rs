use core::fmt;
use core::ops::ControlFlow;

use heapless::Vec;
use managed::ManagedSlice;

use super::packet::{Descriptor, Link, Packet, PacketId};
use super::section::AtomicSection;
use crate::config::{POOL_MAX_COUNT, POOL_MAX_SLOTS, POOL_MAX_WAITERS};
use crate::wait::{self, Wait, WaitList};

const WORD: usize = core::mem::size_of::<usize>();

/// Size of the stack buffer data passes through when moving between chains.
const BOUNCE_LEN: usize = 64;

/// Refers to one pool of a [PoolSet].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolHandle(u8);

impl PoolHandle {
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pool{}", self.0)
    }
}

/// Error returned by [PoolSet::create].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSetFull;

impl core::fmt::Display for PoolSetFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pool set full")
    }
}

impl core::error::Error for PoolSetFull {}

/// Error returned by [PoolSet::allocate].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The pool does not exist.
    InvalidPool,
    /// The requested header room does not fit a slot.
    InvalidSize,
    /// The pool is exhausted and the caller did not want to wait.
    NoBuffer,
    /// The pool stayed exhausted for the whole wait.
    Timeout,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidPool => write!(f, "invalid pool"),
            AllocError::InvalidSize => write!(f, "requested header room exceeds the slot size"),
            AllocError::NoBuffer => write!(f, "no buffer available"),
            AllocError::Timeout => write!(f, "timed out waiting for a buffer"),
        }
    }
}

impl core::error::Error for AllocError {}

/// Error returned by the operations on an existing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The id does not name a live packet.
    InvalidPacket,
    /// The packet is not in a role that allows the operation, e.g. it was
    /// already released.
    InvalidState,
    /// Not enough data, or not enough header room, for the operation.
    Underflow,
    /// A copy produced a different number of bytes than the source declares.
    LengthMismatch,
    /// Growing the packet needed a new slot and none could be had.
    Alloc(AllocError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidPacket => write!(f, "invalid packet"),
            PoolError::InvalidState => write!(f, "packet not in a valid state"),
            PoolError::Underflow => write!(f, "packet underflow"),
            PoolError::LengthMismatch => write!(f, "copied length mismatch"),
            PoolError::Alloc(err) => write!(f, "{err}"),
        }
    }
}

impl core::error::Error for PoolError {}

impl From<AllocError> for PoolError {
    fn from(err: AllocError) -> Self {
        PoolError::Alloc(err)
    }
}

/// Counters kept by each pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of slots carved out of the region.
    pub total: usize,
    /// Number of slots on the free list.
    pub available: usize,
    pub requests: u32,
    /// Requests that found the pool exhausted.
    pub empty_requests: u32,
    pub suspensions: u32,
    pub timeouts: u32,
    /// Releases refused because the packet was not allocated.
    pub invalid_releases: u32,
    pub length_mismatches: u32,
}

#[derive(Debug)]
struct Slots<'a> {
    handle: PoolHandle,
    region: ManagedSlice<'a, u8>,
    descriptors: Vec<Descriptor, POOL_MAX_SLOTS>,
    free: Option<u16>,
    waiters: WaitList<Packet, usize, POOL_MAX_WAITERS>,
    stats: PoolStats,
}

impl Slots<'_> {
    /// Index of the head slot `id` names, if it is live.
    fn check(&self, id: PacketId) -> Result<usize, PoolError> {
        match self.descriptors.get(id.index as usize) {
            Some(desc) if desc.generation == id.generation && !desc.link.is_free() => {
                Ok(id.index as usize)
            }
            _ => Err(PoolError::InvalidPacket),
        }
    }

    fn pop_free(&mut self) -> Option<u16> {
        let index = self.free?;
        self.free = match self.descriptors[index as usize].link {
            Link::Free { next } => next,
            _ => None,
        };
        self.stats.available -= 1;
        Some(index)
    }

    fn prepare(&mut self, index: u16, headroom: usize) -> Packet {
        let desc = &mut self.descriptors[index as usize];
        desc.reset(headroom);
        Packet::from_id(PacketId {
            pool: self.handle,
            index,
            generation: desc.generation,
        })
    }

    /// Give a slot back: to the oldest suspended allocator if there is one,
    /// to the free list otherwise.
    fn recycle(&mut self, index: u16) {
        let desc = &mut self.descriptors[index as usize];
        desc.generation = desc.generation.wrapping_add(1);

        while let Some(waiter) = self.waiters.pop() {
            let (headroom, reply) = waiter.split();
            let packet = self.prepare(index, headroom);
            match reply.send(packet) {
                Ok(()) => {
                    net_trace!("{}: slot {} handed to a suspended allocator", self.handle, index);
                    return;
                }
                Err(_) => {
                    let desc = &mut self.descriptors[index as usize];
                    desc.generation = desc.generation.wrapping_add(1);
                }
            }
        }

        let desc = &mut self.descriptors[index as usize];
        desc.next = None;
        desc.more = None;
        desc.link = Link::Free { next: self.free };
        self.free = Some(index);
        self.stats.available += 1;
    }

    /// Free every slot of the run starting at `index`, returning the run
    /// that continues the chain in another pool, if any.
    fn free_chain(&mut self, index: usize) -> Option<PacketId> {
        let more = self.descriptors[index].more;
        let mut cursor = Some(index as u16);
        while let Some(index) = cursor {
            cursor = self.descriptors[index as usize].next;
            self.recycle(index);
        }
        more
    }

    /// Refuse a release, leaving the packet untouched.
    fn refuse(&mut self, id: PacketId) -> PoolError {
        self.stats.invalid_releases += 1;
        net_debug!("{}: refused to release {}", self.handle, id);
        PoolError::InvalidState
    }

    /// Call `f` on every slot of a chain in order, with the slot's data area.
    fn walk<F>(&mut self, index: usize, mut f: F)
    where
        F: FnMut(&mut Descriptor, &mut [u8]) -> ControlFlow<()>,
    {
        let Slots {
            region,
            descriptors,
            ..
        } = self;
        let mut cursor = Some(index as u16);
        while let Some(index) = cursor {
            let desc = &mut descriptors[index as usize];
            let data = &mut region[desc.offset..desc.offset + desc.capacity];
            if f(desc, data).is_break() {
                return;
            }
            cursor = desc.next;
        }
    }

    fn last(&self, index: usize) -> usize {
        let mut index = index;
        while let Some(next) = self.descriptors[index].next {
            index = next as usize;
        }
        index
    }

    /// Copy as much of `data` as fits behind the tail of slot `index`.
    fn fill(&mut self, index: usize, data: &[u8]) -> usize {
        let desc = &mut self.descriptors[index];
        let len = desc.tailroom().min(data.len());
        let start = desc.offset + desc.tail;
        self.region[start..start + len].copy_from_slice(&data[..len]);
        desc.tail += len;
        len
    }
}

/// A pool of equally sized packet slots carved out of one memory region.
#[derive(Debug)]
pub struct Pool<'a> {
    name: &'static str,
    payload_size: usize,
    total: usize,
    slots: AtomicSection<Slots<'a>>,
}

impl<'a> Pool<'a> {
    fn new(handle: PoolHandle, name: &'static str, payload_size: usize, region: ManagedSlice<'a, u8>) -> Pool<'a> {
        let payload_size = payload_size.div_ceil(WORD) * WORD;
        let usable = region.len() / WORD * WORD;
        let total = match payload_size {
            0 => 0,
            size => (usable / size).min(POOL_MAX_SLOTS),
        };

        let mut descriptors = Vec::new();
        for index in 0..total {
            let next = (index + 1 < total).then_some((index + 1) as u16);
            let _ = descriptors.push(Descriptor::free(index * payload_size, payload_size, next));
        }

        net_debug!("{}: {} slots of {} octets", name, total, payload_size);

        Pool {
            name,
            payload_size,
            total,
            slots: AtomicSection::new(Slots {
                handle,
                region,
                descriptors,
                free: (total > 0).then_some(0),
                waiters: WaitList::new(),
                stats: PoolStats {
                    total,
                    available: total,
                    ..PoolStats::default()
                },
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size of one slot, in octets.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Number of slots carved out of the region.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.slots.enter().stats.available
    }

    pub fn stats(&self) -> PoolStats {
        self.slots.enter().stats
    }

    fn allocate(&self, headroom: usize, wait: Wait) -> Result<Packet, AllocError> {
        if headroom > self.payload_size {
            return Err(AllocError::InvalidSize);
        }

        let (ticket, rx) = {
            let mut slots = self.slots.enter();
            slots.stats.requests += 1;
            if let Some(index) = slots.pop_free() {
                return Ok(slots.prepare(index, headroom));
            }
            slots.stats.empty_requests += 1;
            if !wait.may_suspend() {
                return Err(AllocError::NoBuffer);
            }
            match slots.waiters.enqueue(headroom) {
                Ok(waiter) => {
                    slots.stats.suspensions += 1;
                    waiter
                }
                Err(_) => return Err(AllocError::NoBuffer),
            }
        };

        net_trace!("{}: allocation suspended", self.name);
        if let Some(packet) = wait::park(&rx, wait) {
            return Ok(packet);
        }

        let cancelled = {
            let mut slots = self.slots.enter();
            let cancelled = slots.waiters.cancel(ticket).is_some();
            if cancelled {
                slots.stats.timeouts += 1;
            }
            cancelled
        };
        if cancelled {
            return Err(AllocError::Timeout);
        }
        // Served while the timeout fired.
        rx.try_recv().map_err(|_| AllocError::Timeout)
    }

    /// Release the run `id` heads. The run continuing the chain, if any, is
    /// returned for the caller to release in its own pool.
    fn release_with(&self, id: PacketId, accept: impl Fn(Link) -> bool) -> Result<Option<PacketId>, PoolError> {
        let mut slots = self.slots.enter();
        let index = match slots.check(id) {
            Ok(index) if accept(slots.descriptors[index].link) => index,
            _ => return Err(slots.refuse(id)),
        };
        Ok(slots.free_chain(index))
    }

    fn transmit_release(&self, id: PacketId) -> Result<Option<PacketId>, PoolError> {
        let mut slots = self.slots.enter();
        let Ok(index) = slots.check(id) else {
            return Err(slots.refuse(id));
        };
        match slots.descriptors[index].link {
            Link::Queued => {
                slots.descriptors[index].link = Link::DriverDone;
                Ok(None)
            }
            Link::Allocated => Ok(slots.free_chain(index)),
            _ => Err(slots.refuse(id)),
        }
    }

    fn release_queued(&self, id: PacketId) -> Result<Option<PacketId>, PoolError> {
        let mut slots = self.slots.enter();
        let Ok(index) = slots.check(id) else {
            return Err(slots.refuse(id));
        };
        match slots.descriptors[index].link {
            // The driver still holds it and frees it on completion.
            Link::Queued => {
                slots.descriptors[index].link = Link::Allocated;
                Ok(None)
            }
            Link::DriverDone => Ok(slots.free_chain(index)),
            _ => Err(slots.refuse(id)),
        }
    }

    fn link(&self, id: PacketId) -> Result<Link, PoolError> {
        let slots = self.slots.enter();
        let index = slots.check(id)?;
        Ok(slots.descriptors[index].link)
    }

    fn swap_link(&self, id: PacketId, current: Link, new: Link) -> Result<(), PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        let desc = &mut slots.descriptors[index];
        if desc.link != current {
            return Err(PoolError::InvalidState);
        }
        desc.link = new;
        Ok(())
    }

    /// Length of the run `id` heads and the run continuing it.
    fn run(&self, id: PacketId) -> Result<(usize, Option<PacketId>), PoolError> {
        let slots = self.slots.enter();
        let index = slots.check(id)?;
        let desc = &slots.descriptors[index];
        Ok((desc.total_len, desc.more))
    }

    /// Continue the run `id` heads with the chain `more` heads.
    fn attach(&self, id: PacketId, more: PacketId) -> Result<(), PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        let desc = &mut slots.descriptors[index];
        if desc.more.is_some() {
            return Err(PoolError::InvalidState);
        }
        desc.more = Some(more);
        Ok(())
    }

    fn headroom(&self, id: PacketId) -> Result<usize, PoolError> {
        let slots = self.slots.enter();
        let index = slots.check(id)?;
        Ok(slots.descriptors[index].head)
    }

    fn read(&self, id: PacketId, mut offset: usize, buf: &mut [u8]) -> Result<usize, PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        let mut copied = 0;
        slots.walk(index, |desc, data| {
            let chunk = &data[desc.head..desc.tail];
            if offset >= chunk.len() {
                offset -= chunk.len();
                return ControlFlow::Continue(());
            }
            let len = (chunk.len() - offset).min(buf.len() - copied);
            buf[copied..copied + len].copy_from_slice(&chunk[offset..offset + len]);
            copied += len;
            offset = 0;
            if copied == buf.len() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        Ok(copied)
    }

    fn for_each_chunk(&self, id: PacketId, mut f: impl FnMut(&[u8])) -> Result<(), PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        slots.walk(index, |desc, data| {
            f(&data[desc.head..desc.tail]);
            ControlFlow::Continue(())
        });
        Ok(())
    }

    fn append(&self, id: PacketId, mut data: &[u8], wait: Wait) -> Result<(), PoolError> {
        loop {
            {
                let mut slots = self.slots.enter();
                let head = slots.check(id)?;
                loop {
                    let last = slots.last(head);
                    let written = slots.fill(last, data);
                    slots.descriptors[head].total_len += written;
                    data = &data[written..];
                    if data.is_empty() {
                        return Ok(());
                    }
                    // Grow without dropping the lock while slots are free.
                    let Some(index) = slots.pop_free() else { break };
                    let extra = slots.prepare(index, 0).into_id();
                    slots.descriptors[last].next = Some(extra.index);
                }
            }

            let extra = self.allocate(0, wait)?.into_id();
            let mut slots = self.slots.enter();
            match slots.check(id) {
                Ok(head) => {
                    let last = slots.last(head);
                    slots.descriptors[last].next = Some(extra.index);
                }
                Err(err) => {
                    slots.recycle(extra.index);
                    return Err(err);
                }
            }
        }
    }

    fn prepend(&self, id: PacketId, header: &[u8]) -> Result<(), PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        let Slots {
            region,
            descriptors,
            ..
        } = &mut *slots;
        let desc = &mut descriptors[index];
        if desc.head < header.len() {
            return Err(PoolError::Underflow);
        }
        desc.head -= header.len();
        desc.total_len += header.len();
        let start = desc.offset + desc.head;
        region[start..start + header.len()].copy_from_slice(header);
        Ok(())
    }

    fn front_mut<R>(&self, id: PacketId, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        let Slots {
            region,
            descriptors,
            ..
        } = &mut *slots;
        let desc = &descriptors[index];
        if desc.len() < len {
            return Err(PoolError::Underflow);
        }
        let start = desc.offset + desc.head;
        Ok(f(&mut region[start..start + len]))
    }

    fn trim_front(&self, id: PacketId, len: usize) -> Result<(), PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        if slots.descriptors[index].total_len < len {
            return Err(PoolError::Underflow);
        }
        // Emptied slots stay on the chain until it is released.
        let mut remaining = len;
        slots.walk(index, |desc, _| {
            let take = desc.len().min(remaining);
            desc.head += take;
            remaining -= take;
            if remaining == 0 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        slots.descriptors[index].total_len -= len;
        Ok(())
    }

    fn truncate(&self, id: PacketId, keep: usize) -> Result<(), PoolError> {
        let mut slots = self.slots.enter();
        let index = slots.check(id)?;
        if slots.descriptors[index].total_len < keep {
            return Err(PoolError::Underflow);
        }
        let mut remaining = keep;
        slots.walk(index, |desc, _| {
            let kept = desc.len().min(remaining);
            desc.tail = desc.head + kept;
            remaining -= kept;
            ControlFlow::Continue(())
        });
        slots.descriptors[index].total_len = keep;
        Ok(())
    }
}

/// Every pool of a stack.
///
/// The set is filled in before the stack starts and is shared by reference
/// afterwards; all operations on packets go through it so that a packet can
/// find its pool from its id alone.
#[derive(Debug, Default)]
pub struct PoolSet<'a> {
    pools: Vec<Pool<'a>, POOL_MAX_COUNT>,
}

impl<'a> PoolSet<'a> {
    pub fn new() -> PoolSet<'a> {
        PoolSet { pools: Vec::new() }
    }

    /// Create a pool of `payload_size` octet slots carved out of `region`.
    ///
    /// The slot size is rounded up, and the region size rounded down, to the
    /// machine word. A region too small for a single slot yields an empty pool.
    pub fn create<R>(&mut self, name: &'static str, payload_size: usize, region: R) -> Result<PoolHandle, PoolSetFull>
    where
        R: Into<ManagedSlice<'a, u8>>,
    {
        let handle = PoolHandle(self.pools.len() as u8);
        self.pools
            .push(Pool::new(handle, name, payload_size, region.into()))
            .map_err(|_| PoolSetFull)?;
        Ok(handle)
    }

    pub fn get(&self, handle: PoolHandle) -> Option<&Pool<'a>> {
        self.pools.get(handle.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolHandle, &Pool<'a>)> {
        self.pools
            .iter()
            .enumerate()
            .map(|(index, pool)| (PoolHandle(index as u8), pool))
    }

    pub fn stats(&self, handle: PoolHandle) -> Option<PoolStats> {
        self.get(handle).map(Pool::stats)
    }

    fn owner(&self, id: PacketId) -> Result<&Pool<'a>, PoolError> {
        self.get(id.pool).ok_or(PoolError::InvalidPacket)
    }

    /// Take a slot from the pool, leaving `headroom` octets in front of the
    /// data for headers to be prepended later.
    ///
    /// When the pool is exhausted the caller is suspended for as long as `wait`
    /// allows. Suspended callers are served strictly in arrival order.
    pub fn allocate(&self, handle: PoolHandle, headroom: usize, wait: Wait) -> Result<Packet, AllocError> {
        self.get(handle)
            .ok_or(AllocError::InvalidPool)?
            .allocate(headroom, wait)
    }

    /// Give every slot of the chain back to its pool. Only packets owned by
    /// the application can be released.
    pub fn release(&self, packet: Packet) -> Result<(), PoolError> {
        self.release_id(packet.into_id())
    }

    /// Release a packet known by id only. Stale ids and packets not owned by
    /// the application are refused with [PoolError::InvalidState].
    pub fn release_id(&self, id: PacketId) -> Result<(), PoolError> {
        let more = self.owner(id)?.release_with(id, |link| link == Link::Allocated)?;
        self.release_runs(more)
    }

    /// Release the runs continuing a chain whose head run is already free.
    fn release_runs(&self, mut more: Option<PacketId>) -> Result<(), PoolError> {
        while let Some(id) = more {
            more = self.owner(id)?.release_with(id, |link| link == Link::Allocated)?;
        }
        Ok(())
    }

    /// Report that the lower layer is done transmitting `id`.
    ///
    /// A packet that sits on a connection's sent queue stays there, waiting for
    /// its acknowledgment; any other packet goes back to its pool.
    pub fn transmit_release(&self, id: PacketId) -> Result<(), PoolError> {
        let more = self.owner(id)?.transmit_release(id)?;
        self.release_runs(more)
    }

    /// Release a packet taken off a sent queue. If the driver still holds it,
    /// it is left for [PoolSet::transmit_release] to free.
    pub(crate) fn release_queued(&self, packet: Packet) -> Result<(), PoolError> {
        let id = packet.into_id();
        let more = self.owner(id)?.release_queued(id)?;
        self.release_runs(more)
    }

    /// Release a packet taken off a receive queue.
    pub(crate) fn release_received(&self, packet: Packet) -> Result<(), PoolError> {
        let id = packet.into_id();
        let more = self.owner(id)?.release_with(id, |link| link == Link::Received)?;
        self.release_runs(more)
    }

    pub fn link(&self, id: PacketId) -> Result<Link, PoolError> {
        self.owner(id)?.link(id)
    }

    /// Move a packet from role `current` to role `new`, failing if it is in
    /// any other role.
    pub(crate) fn swap_link(&self, id: PacketId, current: Link, new: Link) -> Result<(), PoolError> {
        self.owner(id)?.swap_link(id, current, new)
    }

    /// Call `f` with each run of the chain `id` heads and the run's length.
    /// Only the pool of the current run is locked.
    fn for_each_run<F>(&self, id: PacketId, mut f: F) -> Result<(), PoolError>
    where
        F: FnMut(&Pool<'a>, PacketId, usize) -> Result<ControlFlow<()>, PoolError>,
    {
        let mut cursor = Some(id);
        while let Some(run) = cursor {
            let pool = self.owner(run)?;
            let (len, more) = pool.run(run)?;
            if f(pool, run, len)?.is_break() {
                break;
            }
            cursor = more;
        }
        Ok(())
    }

    fn last_run(&self, id: PacketId) -> Result<PacketId, PoolError> {
        let mut last = id;
        self.for_each_run(id, |_, run, _| {
            last = run;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(last)
    }

    fn chain_len(&self, id: PacketId) -> Result<usize, PoolError> {
        let mut total = 0;
        self.for_each_run(id, |_, _, len| {
            total += len;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(total)
    }

    /// Length of the whole chain, or zero for an invalid packet.
    pub fn length(&self, packet: &Packet) -> usize {
        self.length_id(packet.id())
    }

    pub(crate) fn length_id(&self, id: PacketId) -> usize {
        self.chain_len(id).unwrap_or(0)
    }

    /// Octets of header room in front of the data, or zero for an invalid
    /// packet.
    pub fn headroom(&self, packet: &Packet) -> usize {
        self.headroom_id(packet.id())
    }

    pub(crate) fn headroom_id(&self, id: PacketId) -> usize {
        self.owner(id).and_then(|pool| pool.headroom(id)).unwrap_or(0)
    }

    /// Copy data starting at `offset` into `buf`, returning the number of
    /// octets copied.
    pub fn read(&self, packet: &Packet, offset: usize, buf: &mut [u8]) -> usize {
        self.read_id(packet.id(), offset, buf)
    }

    pub(crate) fn read_id(&self, id: PacketId, mut offset: usize, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        let _ = self.for_each_run(id, |pool, run, len| {
            if copied == buf.len() {
                return Ok(ControlFlow::Break(()));
            }
            if offset >= len {
                offset -= len;
                return Ok(ControlFlow::Continue(()));
            }
            copied += pool.read(run, offset, &mut buf[copied..])?;
            offset = 0;
            Ok(ControlFlow::Continue(()))
        });
        copied
    }

    /// Call `f` on each contiguous piece of data, in order.
    ///
    /// The pool holding the piece is locked for the call; `f` must not use
    /// the pool set.
    pub fn for_each_chunk(&self, packet: &Packet, f: impl FnMut(&[u8])) -> Result<(), PoolError> {
        self.for_each_chunk_id(packet.id(), f)
    }

    pub(crate) fn for_each_chunk_id(&self, id: PacketId, mut f: impl FnMut(&[u8])) -> Result<(), PoolError> {
        self.for_each_run(id, |pool, run, _| {
            pool.for_each_chunk(run, &mut f)?;
            Ok(ControlFlow::Continue(()))
        })
    }

    /// Add `data` at the end, taking more slots from the pool of the last
    /// run as needed.
    pub fn append(&self, packet: &mut Packet, data: &[u8], wait: Wait) -> Result<(), PoolError> {
        self.append_id(packet.id(), data, wait)
    }

    fn append_id(&self, id: PacketId, data: &[u8], wait: Wait) -> Result<(), PoolError> {
        let last = self.last_run(id)?;
        self.owner(last)?.append(last, data, wait)
    }

    /// Attach `tail` behind the last octet of `packet`. The two may come from
    /// different pools. They are one packet from then on and are released
    /// together. On failure `tail` is handed back unchanged.
    pub fn concat(&self, packet: &mut Packet, tail: Packet) -> Result<(), (PoolError, Packet)> {
        for id in [packet.id(), tail.id()] {
            match self.link(id) {
                Ok(Link::Allocated) => (),
                Ok(_) => return Err((PoolError::InvalidState, tail)),
                Err(err) => return Err((err, tail)),
            }
        }
        let attached = self
            .last_run(packet.id())
            .and_then(|last| self.owner(last)?.attach(last, tail.id()));
        match attached {
            Ok(()) => {
                net_trace!("{}: continued by {}", packet, tail);
                let _ = tail.into_id();
                Ok(())
            }
            Err(err) => Err((err, tail)),
        }
    }

    /// Add `header` in front of the data, using the head slot's header room.
    pub fn prepend(&self, packet: &mut Packet, header: &[u8]) -> Result<(), PoolError> {
        self.prepend_id(packet.id(), header)
    }

    pub(crate) fn prepend_id(&self, id: PacketId, header: &[u8]) -> Result<(), PoolError> {
        self.owner(id)?.prepend(id, header)
    }

    /// Drop `len` octets from the front of the data.
    pub fn trim_front(&self, packet: &mut Packet, len: usize) -> Result<(), PoolError> {
        self.trim_front_id(packet.id(), len)
    }

    pub(crate) fn trim_front_id(&self, id: PacketId, len: usize) -> Result<(), PoolError> {
        if self.chain_len(id)? < len {
            return Err(PoolError::Underflow);
        }
        let mut remaining = len;
        self.for_each_run(id, |pool, run, run_len| {
            if remaining == 0 {
                return Ok(ControlFlow::Break(()));
            }
            let take = run_len.min(remaining);
            pool.trim_front(run, take)?;
            remaining -= take;
            Ok(ControlFlow::Continue(()))
        })
    }

    /// Keep only the first `len` octets of the data.
    pub fn truncate(&self, packet: &mut Packet, len: usize) -> Result<(), PoolError> {
        self.truncate_id(packet.id(), len)
    }

    pub(crate) fn truncate_id(&self, id: PacketId, len: usize) -> Result<(), PoolError> {
        if self.chain_len(id)? < len {
            return Err(PoolError::Underflow);
        }
        let mut keep = len;
        self.for_each_run(id, |pool, run, run_len| {
            let kept = run_len.min(keep);
            if kept < run_len {
                pool.truncate(run, kept)?;
            }
            keep -= kept;
            Ok(ControlFlow::Continue(()))
        })
    }

    /// Run `f` on the first `len` octets, which must lie in the head slot.
    pub(crate) fn front_mut<R>(&self, id: PacketId, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, PoolError> {
        self.owner(id)?.front_mut(id, len, f)
    }

    /// Copy the whole chain into a new packet from `pool`, keeping the same
    /// header room where the target slots allow it.
    pub fn copy(&self, packet: &Packet, pool: PoolHandle, wait: Wait) -> Result<Packet, PoolError> {
        let source = self.owner(packet.id())?;
        let declared = self.chain_len(packet.id())?;
        let headroom = source.headroom(packet.id())?;

        let target = self.get(pool).ok_or(AllocError::InvalidPool)?;
        let mut copy = target.allocate(headroom.min(target.payload_size()), wait)?;

        match self.copy_range(packet, 0, declared, &mut copy, wait) {
            Ok(copied) if copied == declared => Ok(copy),
            Ok(copied) => {
                net_debug!(
                    "{}: copy of {} produced {} octets, expected {}",
                    source.name(),
                    packet,
                    copied,
                    declared
                );
                source.slots.enter().stats.length_mismatches += 1;
                let _ = self.release(copy);
                Err(PoolError::LengthMismatch)
            }
            Err(err) => {
                let _ = self.release(copy);
                Err(err)
            }
        }
    }

    /// Append `len` octets of `src`, starting at `offset`, to `dst`. Only one
    /// pool is locked at a time.
    pub(crate) fn copy_range(
        &self,
        src: &Packet,
        offset: usize,
        len: usize,
        dst: &mut Packet,
        wait: Wait,
    ) -> Result<usize, PoolError> {
        self.chain_len(src.id())?;
        let mut bounce = [0u8; BOUNCE_LEN];
        let mut copied = 0;
        while copied < len {
            let want = (len - copied).min(BOUNCE_LEN);
            let read = self.read_id(src.id(), offset + copied, &mut bounce[..want]);
            if read == 0 {
                break;
            }
            self.append_id(dst.id(), &bounce[..read], wait)?;
            copied += read;
        }
        Ok(copied)
    }
}
