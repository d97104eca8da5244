//! Compile-time capacities.
//!
//! Every table in the stack is a fixed-capacity container sized by one of
//! these constants; nothing grows at runtime. Values that the host picks when
//! the stack is created live in [`iface::Config`](crate::iface::Config) instead.

/// Number of pools a [`PoolSet`](crate::storage::PoolSet) can hold.
pub const POOL_MAX_COUNT: usize = 4;

/// Number of slots carved out of a single pool region. Space beyond this many
/// slots is left unused.
pub const POOL_MAX_SLOTS: usize = 128;

/// Number of threads that may be suspended on one exhausted pool.
pub const POOL_MAX_WAITERS: usize = 8;

/// Number of connections a stack can hold.
pub const TCP_MAX_CONNECTIONS: usize = 8;

/// Number of ports that can be listened on at the same time.
pub const TCP_MAX_LISTENERS: usize = 4;

/// Upper bound for the per-port backlog depth.
pub const TCP_LISTEN_BACKLOG_MAX: usize = 8;

/// Capacity of a connection's sent queue. The runtime depth cap may be lower.
pub const TCP_TX_QUEUE_MAX: usize = 16;

/// Capacity of a connection's receive queue, in segments.
pub const TCP_RX_QUEUE_MAX: usize = 16;

/// Number of threads that may be suspended on one connection, per direction.
pub const TCP_MAX_WAITERS: usize = 4;

/// Room the IP layer and the link layer need in front of a TCP segment.
pub const IP_HEADER_ROOM: usize = 40;

/// Header room to request when allocating a packet that will carry TCP data.
pub const TCP_PACKET_HEADROOM: usize = IP_HEADER_ROOM + crate::wire::TCP_MAX_HEADER_LEN;
