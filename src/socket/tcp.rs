// Heads up! Before working on this file you should read, at least, RFC 793 and
// the parts of RFC 1122 that discuss TCP, as well as RFC 5681 and RFC 6582 for
// congestion control and RFC 7323 for window scaling.

use core::fmt::Display;
use core::fmt;

use heapless::{Deque, Vec};

use crate::config::{TCP_MAX_WAITERS, TCP_PACKET_HEADROOM, TCP_RX_QUEUE_MAX, TCP_TX_QUEUE_MAX};
use crate::iface::{Checksum, Config, Context};
use crate::storage::{AllocError, Link, Packet, PacketId, PoolError, PoolHandle, PoolSet};
use crate::time::Duration;
use crate::wait::{Wait, WaitList};
use crate::wire::{
    checksum, IpEndpoint, IpProtocol, Ipv4Address, Ipv4AddressExt, TcpFlags, TcpPacket, TcpRepr,
    TcpSeqNumber, TCP_HEADER_LEN, TCP_MAX_HEADER_LEN,
};

mod congestion;
mod listen;

pub(crate) use self::listen::{Listener, QueuedSyn, Refusal};

macro_rules! tcp_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

/// RFC 1122: segment size assumed when the peer's SYN carries no MSS option.
const DEFAULT_MSS: usize = 536;

/// Upper bound of the retransmission timeout.
const TIMEOUT_MAX: Duration = Duration::from_secs(60);

/// Names one connection of a [Stack](crate::iface::Stack).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub(crate) usize);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error returned by [`Stack::create_connection`](crate::iface::Stack::create_connection)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CreateError {
    InvalidPool,
    TooManyConnections,
}

impl Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CreateError::InvalidPool => write!(f, "invalid pool"),
            CreateError::TooManyConnections => write!(f, "too many connections"),
        }
    }
}

impl core::error::Error for CreateError {}

/// Error returned by [`Stack::bind`](crate::iface::Stack::bind)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BindError {
    InvalidHandle,
    InvalidState,
    PortInUse,
    NoFreePort,
}

impl Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BindError::InvalidHandle => write!(f, "invalid handle"),
            BindError::InvalidState => write!(f, "invalid state"),
            BindError::PortInUse => write!(f, "port in use"),
            BindError::NoFreePort => write!(f, "no free port"),
        }
    }
}

impl core::error::Error for BindError {}

/// Error returned by [`Stack::listen`](crate::iface::Stack::listen)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ListenError {
    InvalidHandle,
    InvalidState,
    Unaddressable,
    PortInUse,
    TooManyListeners,
    NotListening,
}

impl Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ListenError::InvalidHandle => write!(f, "invalid handle"),
            ListenError::InvalidState => write!(f, "invalid state"),
            ListenError::Unaddressable => write!(f, "unaddressable destination"),
            ListenError::PortInUse => write!(f, "port in use"),
            ListenError::TooManyListeners => write!(f, "too many listeners"),
            ListenError::NotListening => write!(f, "not listening"),
        }
    }
}

impl core::error::Error for ListenError {}

/// Error returned by [`Stack::connect`](crate::iface::Stack::connect) and the
/// other operations that wait for a connection state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnectError {
    InvalidHandle,
    InvalidState,
    Unbound,
    Unaddressable,
    /// The operation was started but the caller did not wait for it.
    InProgress,
    NoBuffer,
    Timeout,
    Reset,
    TooManyWaiters,
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectError::InvalidHandle => write!(f, "invalid handle"),
            ConnectError::InvalidState => write!(f, "invalid state"),
            ConnectError::Unbound => write!(f, "not bound to a port"),
            ConnectError::Unaddressable => write!(f, "unaddressable destination"),
            ConnectError::InProgress => write!(f, "in progress"),
            ConnectError::NoBuffer => write!(f, "no buffer"),
            ConnectError::Timeout => write!(f, "timed out"),
            ConnectError::Reset => write!(f, "connection reset"),
            ConnectError::TooManyWaiters => write!(f, "too many waiters"),
        }
    }
}

impl core::error::Error for ConnectError {}

/// Error returned by [`Stack::send`](crate::iface::Stack::send)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    InvalidState,
    InvalidPacket,
    /// The segment does not fit the send window.
    WindowOverflow,
    /// The sent queue is at its depth limit.
    QueueFull,
    NoBuffer,
    Timeout,
    Reset,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::InvalidState => write!(f, "invalid state"),
            SendError::InvalidPacket => write!(f, "invalid packet"),
            SendError::WindowOverflow => write!(f, "window overflow"),
            SendError::QueueFull => write!(f, "queue full"),
            SendError::NoBuffer => write!(f, "no buffer"),
            SendError::Timeout => write!(f, "timed out"),
            SendError::Reset => write!(f, "connection reset"),
        }
    }
}

impl core::error::Error for SendError {}

impl From<AllocError> for SendError {
    fn from(err: AllocError) -> SendError {
        match err {
            AllocError::Timeout => SendError::Timeout,
            _ => SendError::NoBuffer,
        }
    }
}

impl From<PoolError> for SendError {
    fn from(err: PoolError) -> SendError {
        match err {
            PoolError::Alloc(err) => err.into(),
            _ => SendError::InvalidPacket,
        }
    }
}

/// A failed send. Unless the packet was unusable, it is handed back with
/// whatever data was not sent and without a TCP header.
#[derive(Debug, PartialEq, Eq)]
pub struct SendFailure {
    pub error: SendError,
    pub packet: Option<Packet>,
}

impl SendFailure {
    pub(crate) fn new(error: SendError, packet: Packet) -> SendFailure {
        SendFailure {
            error,
            packet: Some(packet),
        }
    }
}

impl Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl core::error::Error for SendFailure {}

/// Error returned by [`Stack::receive`](crate::iface::Stack::receive)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    InvalidState,
    /// The peer closed its half and every segment was consumed.
    Finished,
    NoPacket,
    Timeout,
    Reset,
}

impl Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RecvError::InvalidState => write!(f, "invalid state"),
            RecvError::Finished => write!(f, "operation finished"),
            RecvError::NoPacket => write!(f, "no packet"),
            RecvError::Timeout => write!(f, "timed out"),
            RecvError::Reset => write!(f, "connection reset"),
        }
    }
}

impl core::error::Error for RecvError {}

/// The state of a TCP connection, according to [RFC 793].
///
/// There is no TIME-WAIT: a connection that completed its close is CLOSED
/// right away.
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::Closing => write!(f, "CLOSING"),
            State::LastAck => write!(f, "LAST-ACK"),
        }
    }
}

impl State {
    /// Whether the application may queue data.
    pub fn may_send(self) -> bool {
        matches!(self, State::Established | State::CloseWait)
    }

    /// Whether payload carried by inbound segments is accepted.
    pub fn may_receive(self) -> bool {
        matches!(self, State::Established | State::FinWait1 | State::FinWait2)
    }

    fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }
}

/// A congestion control algorithm.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CongestionControl {
    None,
    Reno,
}

/// Counters of one stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub segments_sent: u32,
    pub segments_received: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub invalid_segments: u32,
    pub checksum_errors: u32,
    /// Segments whose source and destination were the same endpoint.
    pub land_dropped: u32,
    /// SYNs dropped because the listen backlog was full.
    pub syn_dropped: u32,
    /// Segments dropped for lack of room in a receive queue.
    pub receive_dropped: u32,
    pub resets_sent: u32,
    pub resets_received: u32,
    pub retransmits: u32,
    pub fast_retransmits: u32,
    pub zero_window_probes: u32,
    /// Data headers stamped again because the sequence moved while the
    /// checksum was computed.
    pub checksum_restamps: u32,
    pub no_buffer: u32,
    pub connections: u32,
    pub disconnections: u32,
}

/// A snapshot of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub state: State,
    pub pool: PoolHandle,
    pub local: Option<IpEndpoint>,
    pub remote: Option<IpEndpoint>,
    pub tx_sequence: TcpSeqNumber,
    pub tx_unacked: TcpSeqNumber,
    pub rx_sequence: TcpSeqNumber,
    /// Window the peer advertised, scaled.
    pub tx_window: usize,
    pub rx_window: usize,
    pub congestion_window: usize,
    pub slow_start_threshold: usize,
    pub outstanding: usize,
    pub duplicate_acks: u8,
    pub fast_recovery: bool,
    pub mss: usize,
    pub timeout: Duration,
    pub retries: u8,
    pub queued_segments: usize,
    pub received_segments: usize,
    pub segments_sent: u32,
    pub bytes_sent: u64,
    pub segments_received: u32,
    pub bytes_received: u64,
    pub retransmits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tuple {
    pub(crate) local: IpEndpoint,
    pub(crate) remote: IpEndpoint,
}

impl Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// The fields a data header was stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    tuple: Tuple,
    seq: TcpSeqNumber,
    ack: TcpSeqNumber,
    window: u16,
}

impl Stamp {
    /// Prepend a data header to `id` and fill in its checksum.
    pub(crate) fn emit(&self, pools: &PoolSet<'_>, id: PacketId, checksum: Checksum) -> Result<(), PoolError> {
        let repr = TcpRepr {
            src_port: self.tuple.local.port,
            dst_port: self.tuple.remote.port,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            seq_number: self.seq,
            ack_number: Some(self.ack),
            window_len: self.window,
            urgent_at: 0,
            max_seg_size: None,
            window_scale: None,
        };
        emit_segment(pools, id, &repr, self.tuple.local.addr, self.tuple.remote.addr, checksum)
    }

    /// Rewrite the variable fields of a header emitted by [Stamp::emit].
    pub(crate) fn restamp(&self, pools: &PoolSet<'_>, id: PacketId, checksum: Checksum) -> Result<(), PoolError> {
        pools.front_mut(id, TCP_HEADER_LEN, |bytes| {
            let mut packet = TcpPacket::new_unchecked(bytes);
            packet.set_seq_number(self.seq);
            packet.set_ack_number(self.ack);
            packet.set_window_len(self.window);
        })?;
        fill_checksum(pools, id, self.tuple.local.addr, self.tuple.remote.addr, checksum)
    }
}

/// A sender suspended on a closed window or a full sent queue. The packet
/// already carries a header.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub(crate) packet: Packet,
    pub(crate) len: usize,
}

/// The state a waiter on [Connection::state_waiters] is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Goal {
    Established,
    Closed,
}

impl Goal {
    pub(crate) fn reached(self, state: State) -> bool {
        match self {
            Goal::Established => matches!(state, State::Established | State::CloseWait),
            Goal::Closed => state == State::Closed,
        }
    }
}

#[derive(Debug)]
struct SentSegment {
    packet: Packet,
    seq: TcpSeqNumber,
    len: usize,
}

#[derive(Debug)]
struct RxSegment {
    packet: Packet,
    seq: TcpSeqNumber,
    len: usize,
    /// In order and acknowledged; may be handed to the application.
    ready: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    segments_sent: u32,
    bytes_sent: u64,
    segments_received: u32,
    bytes_received: u64,
    retransmits: u32,
}

pub(crate) type RxWaiters = WaitList<Result<Packet, RecvError>, (), TCP_MAX_WAITERS>;
pub(crate) type TxWaiters = WaitList<Result<(), SendFailure>, PendingSend, TCP_MAX_WAITERS>;
pub(crate) type StateWaiters = WaitList<Result<(), ConnectError>, Goal, TCP_MAX_WAITERS>;

/// One TCP connection and everything queued on it.
#[derive(Debug)]
pub(crate) struct Connection {
    handle: ConnectionHandle,
    pool: PoolHandle,
    state: State,
    local_port: u16,
    /// Opened passively; goes back to LISTEN when the peer resets a
    /// half-open connection.
    listening: bool,
    tuple: Option<Tuple>,

    iss: TcpSeqNumber,
    /// Next sequence number to send.
    tx_sequence: TcpSeqNumber,
    /// Oldest unacknowledged sequence number.
    tx_unacked: TcpSeqNumber,
    /// Highest sequence sent when fast recovery was entered.
    tx_recover: TcpSeqNumber,
    ack_high: TcpSeqNumber,
    ack_prev_high: TcpSeqNumber,
    tx_window: usize,
    tx_win_scale: u8,
    outstanding: usize,
    dup_acks: u8,
    fast_recovery: bool,
    /// A sender was refused by a zero window and probing is due.
    persist: bool,
    fin_pending: bool,
    fin_sent: bool,

    rx_sequence: TcpSeqNumber,
    rx_window: usize,
    rx_window_max: usize,
    /// Window carried by the last segment sent.
    rx_window_last: usize,
    rx_win_shift: u8,
    rx_win_shift_offer: u8,
    /// The peer offered window scaling.
    scaling: bool,

    local_mss: usize,
    peer_mss: usize,
    connect_mss: usize,
    congestion: congestion::AnyController,

    timeout_rate: Duration,
    timeout: Duration,
    timer: Option<Duration>,
    retries: u8,
    max_retries: u8,
    retry_shift: u8,
    tx_queue_depth: usize,

    sent: Deque<SentSegment, TCP_TX_QUEUE_MAX>,
    received: Vec<RxSegment, TCP_RX_QUEUE_MAX>,
    rx_waiters: RxWaiters,
    tx_waiters: TxWaiters,
    state_waiters: StateWaiters,
    counters: Counters,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle, pool: PoolHandle, config: &Config) -> Connection {
        let rx_window = config.rx_window();
        let shift = config.window_shift();
        Connection {
            handle,
            pool,
            state: State::Closed,
            local_port: 0,
            listening: false,
            tuple: None,
            iss: TcpSeqNumber::default(),
            tx_sequence: TcpSeqNumber::default(),
            tx_unacked: TcpSeqNumber::default(),
            tx_recover: TcpSeqNumber::default(),
            ack_high: TcpSeqNumber::default(),
            ack_prev_high: TcpSeqNumber::default(),
            tx_window: 0,
            tx_win_scale: 0,
            outstanding: 0,
            dup_acks: 0,
            fast_recovery: false,
            persist: false,
            fin_pending: false,
            fin_sent: false,
            rx_sequence: TcpSeqNumber::default(),
            rx_window,
            rx_window_max: rx_window,
            rx_window_last: rx_window,
            rx_win_shift: shift,
            rx_win_shift_offer: shift,
            scaling: false,
            local_mss: config.local_mss(),
            peer_mss: DEFAULT_MSS,
            connect_mss: 0,
            congestion: congestion::AnyController::new(),
            timeout_rate: config.timeout,
            timeout: config.timeout,
            timer: None,
            retries: 0,
            max_retries: config.max_retries,
            retry_shift: config.retry_shift,
            tx_queue_depth: config.tx_queue_depth.clamp(1, TCP_TX_QUEUE_MAX),
            sent: Deque::new(),
            received: Vec::new(),
            rx_waiters: WaitList::new(),
            tx_waiters: WaitList::new(),
            state_waiters: WaitList::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub(crate) fn pool(&self) -> PoolHandle {
        self.pool
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listening
    }

    /// Segment size agreed on the handshake, zero before it.
    pub(crate) fn connect_mss(&self) -> usize {
        self.connect_mss
    }

    pub(crate) fn matches(&self, local: IpEndpoint, remote: IpEndpoint) -> bool {
        self.tuple == Some(Tuple { local, remote })
    }

    pub(crate) fn rx_waiters(&mut self) -> &mut RxWaiters {
        &mut self.rx_waiters
    }

    pub(crate) fn tx_waiters(&mut self) -> &mut TxWaiters {
        &mut self.tx_waiters
    }

    pub(crate) fn state_waiters(&mut self) -> &mut StateWaiters {
        &mut self.state_waiters
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            pool: self.pool,
            local: self.tuple.map(|tuple| tuple.local),
            remote: self.tuple.map(|tuple| tuple.remote),
            tx_sequence: self.tx_sequence,
            tx_unacked: self.tx_unacked,
            rx_sequence: self.rx_sequence,
            tx_window: self.tx_window,
            rx_window: self.rx_window,
            congestion_window: self.congestion.inner().window(),
            slow_start_threshold: self.congestion.inner().threshold(),
            outstanding: self.outstanding,
            duplicate_acks: self.dup_acks,
            fast_recovery: self.fast_recovery,
            mss: self.connect_mss,
            timeout: self.timeout,
            retries: self.retries,
            queued_segments: self.sent.len(),
            received_segments: self.received.len(),
            segments_sent: self.counters.segments_sent,
            bytes_sent: self.counters.bytes_sent,
            segments_received: self.counters.segments_received,
            bytes_received: self.counters.bytes_received,
            retransmits: self.counters.retransmits,
        }
    }

    pub(crate) fn set_congestion_control(&mut self, congestion_control: CongestionControl) {
        use congestion::*;

        self.congestion = match congestion_control {
            CongestionControl::None => AnyController::None(no_control::NoControl),
            CongestionControl::Reno => AnyController::Reno(reno::Reno::new()),
        };
        if self.state.is_synchronized() {
            self.congestion
                .inner_mut()
                .on_established(self.connect_mss, self.tx_window);
        }
    }

    pub(crate) fn congestion_control(&self) -> CongestionControl {
        use congestion::*;

        match self.congestion {
            AnyController::None(_) => CongestionControl::None,
            AnyController::Reno(_) => CongestionControl::Reno,
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tcp_trace!("{}: state={}=>{}", self.handle, self.state, state);
        }
        self.state = state;

        for _ in 0..self.state_waiters.len() {
            let Some(waiter) = self.state_waiters.take_first(|goal| goal.reached(state)) else {
                break;
            };
            let (_, reply) = waiter.split();
            let _ = reply.send(Ok(()));
        }
    }

    pub(crate) fn bind(&mut self, port: u16) {
        self.local_port = port;
    }

    /// Begin an active open toward `remote`.
    pub(crate) fn connect(
        &mut self,
        cx: &mut Context,
        local_addr: Ipv4Address,
        remote: IpEndpoint,
    ) -> Result<(), ConnectError> {
        if self.state != State::Closed || self.listening {
            return Err(ConnectError::InvalidState);
        }
        if self.local_port == 0 {
            return Err(ConnectError::Unbound);
        }
        if remote.port == 0 || !remote.addr.x_is_unicast() {
            return Err(ConnectError::Unaddressable);
        }

        self.tuple = Some(Tuple {
            local: IpEndpoint::new(local_addr, self.local_port),
            remote,
        });
        self.restart(cx);
        self.set_state(State::SynSent);
        if !self.send_syn(cx) {
            self.tuple = None;
            self.timer = None;
            self.set_state(State::Closed);
            return Err(ConnectError::NoBuffer);
        }
        Ok(())
    }

    /// Wait passively for a SYN on `port`.
    pub(crate) fn listen(&mut self, port: u16) -> Result<(), ListenError> {
        if self.state != State::Closed {
            return Err(ListenError::InvalidState);
        }
        self.local_port = port;
        self.listening = true;
        self.set_state(State::Listen);
        Ok(())
    }

    /// Stop waiting for a SYN. Returns the connection to its unbound, closed
    /// state.
    pub(crate) fn unlisten(&mut self, cx: &mut Context) {
        if self.state == State::Listen {
            self.teardown(cx, false);
        }
        self.listening = false;
        self.local_port = 0;
    }

    /// Answer the SYN `repr` that `remote` sent to `local`. Returns `false`
    /// and stays in LISTEN if the SYN is unusable.
    pub(crate) fn accept_syn(
        &mut self,
        cx: &mut Context,
        local: IpEndpoint,
        remote: IpEndpoint,
        repr: &TcpRepr,
    ) -> bool {
        debug_assert_eq!(self.state, State::Listen);
        self.tuple = Some(Tuple { local, remote });
        self.restart(cx);
        if !self.synchronize(repr) {
            self.tuple = None;
            return false;
        }
        tcp_trace!("{}: accepting SYN from {}", self.handle, remote);
        self.set_state(State::SynReceived);
        self.send_syn(cx);
        true
    }

    /// Start a close. The caller waits for CLOSED if it wants to.
    pub(crate) fn close(&mut self, cx: &mut Context) -> Result<(), ConnectError> {
        match self.state {
            State::Closed => return Err(ConnectError::InvalidState),
            State::Listen | State::SynSent => self.teardown(cx, false),
            // Our SYN is not acknowledged yet, a FIN cannot follow it.
            State::SynReceived => self.abort(cx),
            State::Established => {
                self.set_state(State::FinWait1);
                self.fin_pending = true;
                self.try_send_fin(cx);
            }
            State::CloseWait => {
                self.set_state(State::LastAck);
                self.fin_pending = true;
                self.try_send_fin(cx);
            }
            State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck => (),
        }
        Ok(())
    }

    /// Reset the connection, telling the peer if it is synchronized.
    pub(crate) fn abort(&mut self, cx: &mut Context) {
        if self.state.is_synchronized() {
            self.send_control(cx, TcpFlags::RST | TcpFlags::ACK, self.tx_sequence, &[]);
            cx.stats.resets_sent += 1;
        }
        self.teardown(cx, true);
    }

    /// Drop the connection without telling the peer.
    pub(crate) fn reset(&mut self, cx: &mut Context) {
        self.teardown(cx, true);
    }

    /// Fresh sequence space and timers for a new connection.
    fn restart(&mut self, cx: &mut Context) {
        self.iss = TcpSeqNumber(cx.rand.rand_u32() as i32);
        self.tx_sequence = self.iss;
        self.tx_unacked = self.iss;
        self.tx_recover = self.iss;
        self.ack_high = self.iss;
        self.ack_prev_high = self.iss;
        self.tx_window = 0;
        self.tx_win_scale = 0;
        self.outstanding = 0;
        self.dup_acks = 0;
        self.fast_recovery = false;
        self.persist = false;
        self.fin_pending = false;
        self.fin_sent = false;
        self.rx_window = self.rx_window_max;
        self.rx_window_last = self.rx_window_max;
        self.rx_win_shift = self.rx_win_shift_offer;
        self.scaling = false;
        self.peer_mss = DEFAULT_MSS;
        self.connect_mss = 0;
        self.timeout = self.timeout_rate;
        self.timer = None;
        self.retries = 0;
        self.counters = Counters::default();
    }

    /// Take the peer's initial sequence number and options from its SYN.
    fn synchronize(&mut self, repr: &TcpRepr) -> bool {
        let peer_mss = repr.max_seg_size.map_or(DEFAULT_MSS, usize::from);
        if peer_mss == 0 {
            net_debug!("{}: SYN with zero MSS", self.handle);
            return false;
        }
        self.peer_mss = peer_mss;
        self.rx_sequence = repr.seq_number + 1;
        match repr.window_scale {
            Some(shift) => {
                self.scaling = true;
                self.tx_win_scale = shift;
            }
            None => {
                self.scaling = false;
                self.tx_win_scale = 0;
                self.rx_win_shift = 0;
            }
        }
        // RFC 7323: the window of a SYN is never scaled.
        self.tx_window = repr.window_len as usize;
        true
    }

    fn establish(&mut self, cx: &mut Context) {
        self.connect_mss = self.local_mss.min(self.peer_mss);
        self.tx_unacked = self.tx_sequence;
        self.tx_recover = self.iss;
        self.ack_high = self.tx_sequence;
        self.ack_prev_high = self.tx_sequence;
        self.congestion
            .inner_mut()
            .on_established(self.connect_mss, self.tx_window);
        self.timer = None;
        self.retries = 0;
        self.timeout = self.timeout_rate;
        cx.stats.connections += 1;
        net_debug!(
            "{}: established, mss={} window={}",
            self.handle,
            self.connect_mss,
            self.tx_window
        );
        self.set_state(State::Established);
    }

    /// Release everything queued, wake every waiter and go to CLOSED.
    fn teardown(&mut self, cx: &mut Context, reset: bool) {
        while let Some(segment) = self.sent.pop_front() {
            let _ = cx.pools.release_queued(segment.packet);
        }
        while let Some(segment) = self.received.pop() {
            let _ = cx.pools.release_received(segment.packet);
        }

        let recv_error = if reset { RecvError::Reset } else { RecvError::Finished };
        while let Some(waiter) = self.rx_waiters.pop() {
            let (_, reply) = waiter.split();
            let _ = reply.send(Err(recv_error));
        }
        let send_error = if reset { SendError::Reset } else { SendError::InvalidState };
        while let Some(waiter) = self.tx_waiters.pop() {
            let (pending, reply) = waiter.split();
            let packet = strip_header(cx.pools, pending.packet);
            if let Err(Err(failure)) = reply.send(Err(SendFailure::new(send_error, packet))) {
                if let Some(packet) = failure.packet {
                    let _ = cx.pools.release(packet);
                }
            }
        }

        if self.state.is_synchronized() {
            cx.stats.disconnections += 1;
        }
        self.tuple = None;
        self.outstanding = 0;
        self.dup_acks = 0;
        self.fast_recovery = false;
        self.persist = false;
        self.fin_pending = false;
        self.fin_sent = false;
        self.timer = None;
        self.retries = 0;
        self.timeout = self.timeout_rate;
        self.rx_window = self.rx_window_max;
        self.set_state(State::Closed);

        let connect_error = if reset { ConnectError::Reset } else { ConnectError::InvalidState };
        while let Some(waiter) = self.state_waiters.pop() {
            let (_, reply) = waiter.split();
            let _ = reply.send(Err(connect_error));
        }
    }

    /// A half-open passive connection was reset by the peer; wait for the
    /// next SYN.
    fn return_to_listen(&mut self, cx: &mut Context) {
        while let Some(segment) = self.sent.pop_front() {
            let _ = cx.pools.release_queued(segment.packet);
        }
        self.tuple = None;
        self.timer = None;
        self.retries = 0;
        self.timeout = self.timeout_rate;
        self.set_state(State::Listen);
    }

    /// Window to advertise on segments other than SYNs.
    fn scaled_window(&self) -> u16 {
        (self.rx_window >> self.rx_win_shift).min(u16::MAX as usize) as u16
    }

    /// Octets that may be sent right now.
    fn send_window(&self) -> usize {
        let mut cwnd = self.congestion.inner().window();
        // RFC 3042 limited transmit.
        if (1..=2).contains(&self.dup_acks) && !self.fast_recovery {
            cwnd = cwnd.saturating_add(2 * self.connect_mss);
        }
        self.tx_window.min(cwnd).saturating_sub(self.outstanding)
    }

    /// The header a data segment sent now would carry.
    pub(crate) fn stamp(&self) -> Result<Stamp, SendError> {
        if !self.state.may_send() || self.fin_pending || self.fin_sent {
            return Err(SendError::InvalidState);
        }
        let tuple = self.tuple.ok_or(SendError::InvalidState)?;
        Ok(Stamp {
            tuple,
            seq: self.tx_sequence,
            ack: self.rx_sequence,
            window: self.scaled_window(),
        })
    }

    /// Queue and transmit a data segment of `len` octets whose header was
    /// stamped by `stamp`. The packet is handed back when it cannot be sent
    /// now.
    pub(crate) fn submit(
        &mut self,
        cx: &mut Context,
        packet: Packet,
        len: usize,
        stamp: Stamp,
    ) -> Result<(), (SendError, Packet)> {
        let current = match self.stamp() {
            Ok(current) => current,
            Err(err) => return Err((err, packet)),
        };
        // Senders already waiting go first.
        if !self.tx_waiters.is_empty() {
            return Err((self.blocked_reason(len), packet));
        }
        if self.sent.len() >= self.tx_queue_depth {
            return Err((SendError::QueueFull, packet));
        }
        if len > self.send_window() {
            if self.tx_window == 0 {
                self.persist = true;
                if self.timer.is_none() {
                    self.timer = Some(self.timeout);
                }
            }
            return Err((SendError::WindowOverflow, packet));
        }
        if current != stamp {
            // The sequence moved while the checksum was computed.
            cx.stats.checksum_restamps += 1;
            if let Err(err) = current.restamp(cx.pools, packet.id(), cx.config.checksum) {
                return Err((err.into(), packet));
            }
        }
        self.transmit_data(cx, packet, len);
        Ok(())
    }

    pub(crate) fn blocked_reason(&self, len: usize) -> SendError {
        if self.sent.len() >= self.tx_queue_depth {
            SendError::QueueFull
        } else if len > self.send_window() {
            SendError::WindowOverflow
        } else {
            SendError::QueueFull
        }
    }

    fn transmit_data(&mut self, cx: &mut Context, packet: Packet, len: usize) {
        let Some(tuple) = self.tuple else {
            let _ = cx.pools.release(packet);
            return;
        };
        if let Err(err) = cx.pools.swap_link(packet.id(), Link::Allocated, Link::Queued) {
            net_debug!("{}: cannot queue {}: {}", self.handle, packet, err);
            let _ = cx.pools.release(packet);
            return;
        }
        let id = packet.id();
        let seq = self.tx_sequence;
        if let Err(segment) = self.sent.push_back(SentSegment { packet, seq, len }) {
            let _ = cx.pools.release_queued(segment.packet);
            return;
        }
        tcp_trace!("{}: sending {} octets at seq={}", tuple, len, seq);
        self.tx_sequence += len;
        self.outstanding += len;
        self.rx_window_last = self.rx_window;
        self.counters.segments_sent += 1;
        self.counters.bytes_sent += len as u64;
        cx.stats.bytes_sent += len as u64;
        if self.timer.is_none() {
            self.timer = Some(self.timeout);
        }
        cx.transmit(id, tuple.local.addr, tuple.remote.addr);
    }

    /// Resume suspended senders, oldest first, while the window allows.
    fn resume_senders(&mut self, cx: &mut Context) {
        loop {
            let Some(len) = self.tx_waiters.front().map(|waiter| waiter.item().len) else {
                return;
            };
            let Ok(stamp) = self.stamp() else {
                return;
            };
            if self.sent.len() >= self.tx_queue_depth || len > self.send_window() {
                return;
            }
            let Some(waiter) = self.tx_waiters.pop() else {
                return;
            };
            let (pending, reply) = waiter.split();
            let packet = pending.packet;
            if let Err(err) = stamp.restamp(cx.pools, packet.id(), cx.config.checksum) {
                let packet = strip_header(cx.pools, packet);
                let _ = reply.send(Err(SendFailure::new(err.into(), packet)));
                continue;
            }
            self.transmit_data(cx, packet, len);
            let _ = reply.send(Ok(()));
        }
    }

    /// Take the oldest in-order segment off the receive queue.
    pub(crate) fn dequeue(&mut self, cx: &mut Context) -> Option<Packet> {
        if !self.received.first().is_some_and(|segment| segment.ready) {
            return None;
        }
        let segment = self.received.remove(0);
        let _ = cx
            .pools
            .swap_link(segment.packet.id(), Link::Received, Link::Allocated);
        self.rx_window = (self.rx_window + segment.len).min(self.rx_window_max);
        self.window_update(cx);
        Some(segment.packet)
    }

    /// What a receive that found nothing queued should report.
    pub(crate) fn receive_error(&self) -> RecvError {
        match self.state {
            State::Established | State::FinWait1 | State::FinWait2 => RecvError::NoPacket,
            State::CloseWait | State::Closing | State::LastAck => RecvError::Finished,
            State::Closed | State::Listen | State::SynSent | State::SynReceived => {
                RecvError::InvalidState
            }
        }
    }

    /// Octets of in-order data waiting for the application.
    pub(crate) fn bytes_available(&self) -> usize {
        self.received
            .iter()
            .take_while(|segment| segment.ready)
            .map(|segment| segment.len)
            .sum()
    }

    /// Advertise a window that reopened by at least one segment.
    fn window_update(&mut self, cx: &mut Context) {
        if !self.state.may_receive() {
            return;
        }
        let threshold = self.connect_mss.min(self.rx_window_max / 2).max(1);
        if self.rx_window >= self.rx_window_last + threshold {
            tcp_trace!("{}: window update to {}", self.handle, self.rx_window);
            self.send_ack(cx);
        }
    }

    /// Process a segment addressed to this connection. Whatever the
    /// connection does not keep is handed back for release.
    pub(crate) fn process(
        &mut self,
        cx: &mut Context,
        packet: Packet,
        repr: &TcpRepr,
        header_len: usize,
        payload_len: usize,
    ) -> Option<Packet> {
        self.counters.segments_received += 1;
        tcp_trace!("{}: received {}", self.handle, repr);

        if self.state == State::SynSent {
            self.process_syn_sent(cx, repr, payload_len);
            return Some(packet);
        }

        // A retransmitted SYN; the SYN|ACK was lost.
        if self.state == State::SynReceived
            && repr.flags.contains(TcpFlags::SYN)
            && repr.ack_number.is_none()
            && repr.seq_number + 1 == self.rx_sequence
        {
            self.send_syn(cx);
            return Some(packet);
        }

        let segment_len = repr.segment_len(payload_len);
        if !self.acceptable(repr.seq_number, segment_len) {
            net_debug!(
                "{}: segment {}+{} outside window {}+{}",
                self.handle,
                repr.seq_number,
                segment_len,
                self.rx_sequence,
                self.rx_window
            );
            if !repr.flags.contains(TcpFlags::RST) {
                self.send_ack(cx);
            }
            return Some(packet);
        }

        if repr.flags.contains(TcpFlags::RST) {
            cx.stats.resets_received += 1;
            if self.state == State::SynReceived && self.listening {
                net_debug!("{}: reset while half open, listening again", self.handle);
                self.return_to_listen(cx);
            } else {
                net_debug!("{}: reset by peer", self.handle);
                self.teardown(cx, true);
            }
            return Some(packet);
        }

        if repr.flags.contains(TcpFlags::SYN) {
            net_debug!("{}: SYN on a synchronized connection", self.handle);
            self.send_ack(cx);
            return Some(packet);
        }

        let Some(ack) = repr.ack_number else {
            return Some(packet);
        };

        if self.state == State::SynReceived {
            if ack != self.tx_sequence {
                net_debug!("{}: unacceptable ACK in response to SYN|ACK", self.handle);
                if let Some(tuple) = self.tuple {
                    send_reset(cx, self.pool, tuple.local, tuple.remote, repr, payload_len);
                }
                return Some(packet);
            }
            self.establish(cx);
        }

        if !self.ack_check(cx, repr, ack, payload_len) {
            self.send_ack(cx);
            return Some(packet);
        }

        if self.fin_sent && ack == self.tx_sequence {
            match self.state {
                State::FinWait1 => self.set_state(State::FinWait2),
                State::Closing | State::LastAck => {
                    self.teardown(cx, false);
                    return Some(packet);
                }
                _ => (),
            }
        }

        let mut ack_needed = false;
        let mut rest = Some(packet);
        if payload_len > 0 && self.state.may_receive() {
            if let Some(packet) = rest.take() {
                rest = self.data_check(cx, packet, repr.seq_number, header_len, payload_len);
            }
            ack_needed = true;
        }

        if repr.flags.contains(TcpFlags::FIN) {
            ack_needed = true;
            if repr.seq_number + payload_len == self.rx_sequence && self.fin_check(cx) {
                return rest;
            }
        }

        self.resume_senders(cx);
        self.try_send_fin(cx);

        if repr.flags.contains(TcpFlags::URG) && payload_len > 0 {
            if let Some(callback) = cx.config.urgent_callback {
                callback(self.handle);
            }
        }

        if ack_needed {
            self.send_ack(cx);
        }
        rest
    }

    fn process_syn_sent(&mut self, cx: &mut Context, repr: &TcpRepr, payload_len: usize) {
        let ack_ok = repr.ack_number.map(|ack| ack == self.tx_sequence);

        if repr.flags.contains(TcpFlags::RST) {
            if ack_ok == Some(true) {
                net_debug!("{}: connection refused", self.handle);
                cx.stats.resets_received += 1;
                self.teardown(cx, true);
            } else {
                net_debug!("{}: unacceptable RST in response to initial SYN", self.handle);
            }
            return;
        }
        if ack_ok == Some(false) {
            net_debug!("{}: unacceptable ACK in response to initial SYN", self.handle);
            if let Some(tuple) = self.tuple {
                send_reset(cx, self.pool, tuple.local, tuple.remote, repr, payload_len);
            }
            return;
        }
        if !repr.flags.contains(TcpFlags::SYN) || !self.synchronize(repr) {
            return;
        }

        if ack_ok == Some(true) {
            self.establish(cx);
            self.send_ack(cx);
        } else {
            // Simultaneous open.
            self.set_state(State::SynReceived);
            self.send_syn(cx);
        }
    }

    /// The RFC 793 acceptability test for a segment occupying `len` octets
    /// of sequence space.
    fn acceptable(&self, seq: TcpSeqNumber, len: usize) -> bool {
        let window_start = self.rx_sequence;
        let window_end = self.rx_sequence + self.rx_window;
        match (len == 0, self.rx_window == 0) {
            (true, true) => seq == window_start,
            (true, false) => window_start <= seq && seq < window_end,
            (false, true) => false,
            (false, false) => {
                let last = seq + (len - 1);
                (window_start <= seq && seq < window_end)
                    || (window_start <= last && last < window_end)
            }
        }
    }

    /// Acknowledgment processing. Returns `false` for an acknowledgment of
    /// data never sent.
    fn ack_check(&mut self, cx: &mut Context, repr: &TcpRepr, ack: TcpSeqNumber, payload_len: usize) -> bool {
        if ack > self.tx_sequence {
            net_debug!(
                "{}: unacceptable ACK ({} beyond {})",
                self.handle,
                ack,
                self.tx_sequence
            );
            return false;
        }
        if ack < self.tx_unacked {
            // Old duplicate.
            return true;
        }

        let window = (repr.window_len as usize) << self.tx_win_scale;
        let window_changed = window != self.tx_window;
        self.tx_window = window;
        if window > 0 {
            self.persist = false;
        }

        self.release_acked(cx, ack);

        let acked = ack - self.tx_unacked;
        if acked > 0 {
            self.ack_prev_high = self.ack_high;
            self.ack_high = ack;
            self.tx_unacked = ack;
            self.outstanding = self.outstanding.saturating_sub(acked);
            self.dup_acks = 0;
            self.retries = 0;
            self.timeout = self.timeout_rate;
            let fin_unacked = self.fin_sent && ack != self.tx_sequence;
            self.timer = (self.outstanding > 0 || fin_unacked).then_some(self.timeout);

            if self.fast_recovery {
                if ack > self.tx_recover {
                    tcp_trace!("{}: leaving fast recovery at {}", self.handle, ack);
                    self.fast_recovery = false;
                    self.congestion.inner_mut().on_recovery_exit();
                } else {
                    // RFC 6582 partial acknowledgment.
                    self.resend(cx);
                }
            } else {
                self.congestion.inner_mut().on_ack(acked);
            }
        } else if self.outstanding > 0
            && payload_len == 0
            && !window_changed
            && window > 0
            && !repr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN)
        {
            self.dup_acks = self.dup_acks.saturating_add(1);
            tcp_trace!("{}: duplicate ACK #{} for {}", self.handle, self.dup_acks, ack);
            if self.dup_acks == 3 {
                let cwnd = self.congestion.inner().window();
                let advance = self.ack_high.distance(self.ack_prev_high).max(0) as usize;
                if ack > self.tx_recover
                    || (cwnd > self.connect_mss && advance <= 4 * self.connect_mss)
                {
                    self.retransmit(cx, true);
                }
            } else if self.dup_acks > 3 && self.fast_recovery {
                self.congestion.inner_mut().on_duplicate_ack();
            }
        }
        true
    }

    /// Release sent segments covered by `ack`.
    fn release_acked(&mut self, cx: &mut Context, ack: TcpSeqNumber) {
        if ack == self.tx_sequence {
            // Everything is acknowledged; segments the driver still holds are
            // freed when it reports completion.
            while let Some(segment) = self.sent.pop_front() {
                let _ = cx.pools.release_queued(segment.packet);
            }
            return;
        }
        while let Some(front) = self.sent.front() {
            if ack < front.seq + front.len {
                break;
            }
            if cx.pools.link(front.packet.id()) != Ok(Link::DriverDone) {
                break;
            }
            let Some(segment) = self.sent.pop_front() else {
                break;
            };
            let _ = cx.pools.release_queued(segment.packet);
        }
    }

    /// Queue the payload of an acceptable segment. Returns the packet when
    /// nothing of it was kept.
    fn data_check(
        &mut self,
        cx: &mut Context,
        packet: Packet,
        seq: TcpSeqNumber,
        header_len: usize,
        payload_len: usize,
    ) -> Option<Packet> {
        let mut seq = seq;
        let mut len = payload_len;
        let mut skip = header_len;
        if seq < self.rx_sequence {
            let duplicate = self.rx_sequence - seq;
            if duplicate >= len {
                return Some(packet);
            }
            skip += duplicate;
            seq = self.rx_sequence;
            len -= duplicate;
        }
        let edge = self.rx_sequence + self.rx_window;
        if seq >= edge {
            return Some(packet);
        }
        if edge - seq < len {
            tcp_trace!("{}: trimming {}+{} to the window edge {}", self.handle, seq, len, edge);
            len = edge - seq;
        }
        if self.received.is_full() {
            net_debug!("{}: receive queue full, dropping {}", self.handle, seq);
            cx.stats.receive_dropped += 1;
            return Some(packet);
        }

        if seq != self.rx_sequence {
            let end = seq + len;
            let overlaps = self
                .received
                .iter()
                .filter(|segment| !segment.ready)
                .any(|segment| seq < segment.seq + segment.len && segment.seq < end);
            if overlaps {
                return Some(packet);
            }
            if Self::cut(cx, &packet, skip, len).is_err() {
                return Some(packet);
            }
            let position = self
                .received
                .iter()
                .position(|segment| !segment.ready && segment.seq > seq)
                .unwrap_or(self.received.len());
            tcp_trace!("{}: out of order {}+{}", self.handle, seq, len);
            self.counters.bytes_received += len as u64;
            cx.stats.bytes_received += len as u64;
            self.queue_received(cx, position, packet, seq, len, false);
            return None;
        }

        if Self::cut(cx, &packet, skip, len).is_err() {
            return Some(packet);
        }
        self.rx_sequence += len;
        self.counters.bytes_received += len as u64;
        cx.stats.bytes_received += len as u64;

        let ready_ahead = self.received.first().is_some_and(|segment| segment.ready);
        let packet = if ready_ahead {
            packet
        } else {
            match self.hand_to_receiver(packet) {
                Ok(()) => {
                    self.promote(cx);
                    self.serve_receivers(cx);
                    return None;
                }
                Err(packet) => packet,
            }
        };
        let position = self
            .received
            .iter()
            .take_while(|segment| segment.ready)
            .count();
        self.rx_window = self.rx_window.saturating_sub(len);
        self.queue_received(cx, position, packet, seq, len, true);
        self.promote(cx);
        self.serve_receivers(cx);
        None
    }

    /// Strip `skip` octets of header and duplicate data, keeping `len`.
    fn cut(cx: &mut Context, packet: &Packet, skip: usize, len: usize) -> Result<(), PoolError> {
        cx.pools.trim_front_id(packet.id(), skip)?;
        cx.pools.truncate_id(packet.id(), len)
    }

    fn queue_received(
        &mut self,
        cx: &mut Context,
        position: usize,
        packet: Packet,
        seq: TcpSeqNumber,
        len: usize,
        ready: bool,
    ) {
        if let Err(err) = cx.pools.swap_link(packet.id(), Link::Allocated, Link::Received) {
            net_debug!("{}: cannot queue {}: {}", self.handle, packet, err);
            let _ = cx.pools.release(packet);
            return;
        }
        let segment = RxSegment {
            packet,
            seq,
            len,
            ready,
        };
        if let Err(segment) = self.received.insert(position, segment) {
            let _ = cx.pools.release_received(segment.packet);
        }
    }

    /// Mark out-of-order segments that became contiguous as ready.
    fn promote(&mut self, cx: &mut Context) {
        let mut index = 0;
        while index < self.received.len() {
            let segment = &mut self.received[index];
            if segment.ready {
                index += 1;
                continue;
            }
            if segment.seq > self.rx_sequence {
                break;
            }
            let duplicate = self.rx_sequence - segment.seq;
            if duplicate >= segment.len {
                let stale = self.received.remove(index);
                let _ = cx.pools.release_received(stale.packet);
                continue;
            }
            if duplicate > 0 {
                let _ = cx.pools.trim_front_id(segment.packet.id(), duplicate);
                segment.seq = self.rx_sequence;
                segment.len -= duplicate;
            }
            segment.ready = true;
            self.rx_sequence += segment.len;
            self.rx_window = self.rx_window.saturating_sub(segment.len);
            index += 1;
        }
    }

    /// Hand `packet` to the oldest suspended receiver that is still there.
    fn hand_to_receiver(&mut self, packet: Packet) -> Result<(), Packet> {
        let mut packet = packet;
        while let Some(waiter) = self.rx_waiters.pop() {
            let (_, reply) = waiter.split();
            let Err(Ok(returned)) = reply.send(Ok(packet)) else {
                return Ok(());
            };
            packet = returned;
        }
        Err(packet)
    }

    fn serve_receivers(&mut self, cx: &mut Context) {
        while !self.rx_waiters.is_empty() {
            let Some(segment) = self.received.first() else {
                return;
            };
            if !segment.ready {
                return;
            }
            let (seq, len) = (segment.seq, segment.len);
            let Some(packet) = self.dequeue(cx) else {
                return;
            };
            if let Err(packet) = self.hand_to_receiver(packet) {
                self.rx_window = self.rx_window.saturating_sub(len);
                self.queue_received(cx, 0, packet, seq, len, true);
                return;
            }
        }
    }

    /// An in-order FIN arrived. Returns `true` when the connection is gone.
    fn fin_check(&mut self, cx: &mut Context) -> bool {
        self.rx_sequence += 1;
        while let Some(waiter) = self.rx_waiters.pop() {
            let (_, reply) = waiter.split();
            let _ = reply.send(Err(RecvError::Finished));
        }
        match self.state {
            State::Established => self.set_state(State::CloseWait),
            State::FinWait1 => self.set_state(State::Closing),
            State::FinWait2 => {
                self.send_ack(cx);
                self.teardown(cx, false);
                return true;
            }
            _ => (),
        }
        false
    }

    fn try_send_fin(&mut self, cx: &mut Context) {
        if !self.fin_pending || !self.sent.is_empty() {
            return;
        }
        self.fin_pending = false;
        self.fin_sent = true;
        let seq = self.tx_sequence;
        self.tx_sequence += 1;
        self.timer = Some(self.timeout);
        self.send_control(cx, TcpFlags::FIN | TcpFlags::ACK, seq, &[]);
    }

    fn send_syn(&mut self, cx: &mut Context) -> bool {
        let flags = if self.state == State::SynReceived {
            TcpFlags::SYN | TcpFlags::ACK
        } else {
            TcpFlags::SYN
        };
        self.tx_sequence = self.iss + 1;
        self.timer = Some(self.timeout);
        self.send_control(cx, flags, self.iss, &[])
    }

    fn send_ack(&mut self, cx: &mut Context) -> bool {
        self.send_control(cx, TcpFlags::ACK, self.tx_sequence, &[])
    }

    /// Build and transmit a segment carrying no queued data.
    fn send_control(&mut self, cx: &mut Context, flags: TcpFlags, seq: TcpSeqNumber, payload: &[u8]) -> bool {
        let Some(tuple) = self.tuple else {
            return false;
        };
        let mut packet = match cx.pools.allocate(self.pool, TCP_PACKET_HEADROOM, Wait::NoWait) {
            Ok(packet) => packet,
            Err(err) => {
                net_debug!("{}: cannot send {}: {}", self.handle, flags, err);
                cx.stats.no_buffer += 1;
                return false;
            }
        };
        if !payload.is_empty() && cx.pools.append(&mut packet, payload, Wait::NoWait).is_err() {
            cx.stats.no_buffer += 1;
            let _ = cx.pools.release(packet);
            return false;
        }

        let syn = flags.contains(TcpFlags::SYN);
        let ack_number = flags.contains(TcpFlags::ACK).then_some(self.rx_sequence);
        let repr = TcpRepr {
            src_port: tuple.local.port,
            dst_port: tuple.remote.port,
            flags,
            seq_number: seq,
            ack_number,
            window_len: if syn {
                self.rx_window.min(u16::MAX as usize) as u16
            } else {
                self.scaled_window()
            },
            urgent_at: 0,
            max_seg_size: syn.then_some(self.local_mss as u16),
            window_scale: (syn && (self.state == State::SynSent || self.scaling))
                .then_some(self.rx_win_shift),
        };
        if let Err(err) = emit_segment(
            cx.pools,
            packet.id(),
            &repr,
            tuple.local.addr,
            tuple.remote.addr,
            cx.config.checksum,
        ) {
            net_debug!("{}: cannot emit {}: {}", self.handle, repr, err);
            let _ = cx.pools.release(packet);
            return false;
        }
        if ack_number.is_some() {
            self.rx_window_last = self.rx_window;
        }
        tcp_trace!("{}: sending {}", tuple, repr);
        self.counters.segments_sent += 1;
        cx.transmit(packet.into_id(), tuple.local.addr, tuple.remote.addr);
        true
    }

    /// Retransmit after a timeout, or as a fast retransmit when `fast` is set.
    pub(crate) fn retransmit(&mut self, cx: &mut Context, fast: bool) {
        match self.state {
            State::Closed | State::Listen => {
                self.timer = None;
                return;
            }
            State::SynSent | State::SynReceived => {
                net_debug!("{}: retransmitting SYN", self.handle);
                self.send_syn(cx);
                self.backoff();
                return;
            }
            _ => (),
        }

        // A closed window is probed, never filled.
        if self.tx_window == 0 && (self.persist || !self.sent.is_empty() || !self.tx_waiters.is_empty()) {
            self.probe(cx);
            return;
        }

        if self.sent.is_empty() {
            if self.fin_sent && self.tx_unacked != self.tx_sequence {
                net_debug!("{}: retransmitting FIN", self.handle);
                self.send_control(cx, TcpFlags::FIN | TcpFlags::ACK, self.tx_sequence - 1, &[]);
                self.backoff();
            } else {
                self.timer = None;
            }
            return;
        }

        if fast || !self.fast_recovery {
            self.congestion.inner_mut().on_retransmit(self.outstanding);
        }
        if fast {
            net_debug!("{}: fast retransmit at {}", self.handle, self.tx_unacked);
            self.congestion.inner_mut().on_fast_retransmit();
            self.fast_recovery = true;
            self.tx_recover = self.tx_sequence - 1;
            cx.stats.fast_retransmits += 1;
        }
        self.resend(cx);
        if fast {
            self.timer = Some(self.timeout);
        } else {
            self.backoff();
        }
    }

    /// Put unacknowledged segments back on the wire, within the congestion
    /// window. Only one during fast recovery.
    fn resend(&mut self, cx: &mut Context) {
        let Some(tuple) = self.tuple else {
            return;
        };
        let stamp = Stamp {
            tuple,
            seq: self.tx_sequence,
            ack: self.rx_sequence,
            window: self.scaled_window(),
        };
        let mut budget = self.congestion.inner().window();
        for segment in self.sent.iter() {
            if segment.seq + segment.len <= self.tx_unacked {
                continue;
            }
            let id = segment.packet.id();
            // The driver still has it.
            if cx.pools.link(id) != Ok(Link::DriverDone) {
                continue;
            }
            if segment.len > budget {
                break;
            }
            let stamp = Stamp {
                seq: segment.seq,
                ..stamp
            };
            if stamp.restamp(cx.pools, id, cx.config.checksum).is_err()
                || cx.pools.swap_link(id, Link::DriverDone, Link::Queued).is_err()
            {
                continue;
            }
            tcp_trace!("{}: resending {}+{}", tuple, segment.seq, segment.len);
            budget -= segment.len;
            self.counters.retransmits += 1;
            cx.stats.retransmits += 1;
            cx.transmit(id, tuple.local.addr, tuple.remote.addr);
            if self.fast_recovery {
                break;
            }
        }
        self.rx_window_last = self.rx_window;
    }

    /// Send one octet below the send sequence so the peer answers with its
    /// current window.
    fn probe(&mut self, cx: &mut Context) {
        tcp_trace!("{}: zero window probe", self.handle);
        self.send_control(cx, TcpFlags::ACK, self.tx_sequence - 1, &[0]);
        cx.stats.zero_window_probes += 1;
        self.timeout = (self.timeout << 1).min(TIMEOUT_MAX);
        self.timer = Some(self.timeout);
    }

    fn backoff(&mut self) {
        self.retries = self.retries.saturating_add(1);
        let shift = u32::from(self.retries) * u32::from(self.retry_shift);
        self.timeout = (self.timeout_rate << shift).min(TIMEOUT_MAX);
        self.timer = Some(self.timeout);
    }

    /// Advance the retransmission timer by `elapsed`.
    pub(crate) fn tick(&mut self, cx: &mut Context, elapsed: Duration) {
        let Some(remaining) = self.timer else {
            return;
        };
        if remaining > elapsed {
            self.timer = Some(remaining - elapsed);
            return;
        }
        if self.retries >= self.max_retries {
            net_debug!("{}: no answer after {} retries, aborting", self.handle, self.retries);
            self.abort(cx);
            return;
        }
        self.retransmit(cx, false);
    }
}

/// Prepend the header `repr` describes to `id` and fill in the checksum.
pub(crate) fn emit_segment(
    pools: &PoolSet<'_>,
    id: PacketId,
    repr: &TcpRepr,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    checksum: Checksum,
) -> Result<(), PoolError> {
    let mut header = [0u8; TCP_MAX_HEADER_LEN];
    let header = &mut header[..repr.header_len()];
    repr.emit(&mut TcpPacket::new_unchecked(&mut *header));
    pools.prepend_id(id, header)?;
    fill_checksum(pools, id, src_addr, dst_addr, checksum)
}

fn fill_checksum(
    pools: &PoolSet<'_>,
    id: PacketId,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    checksum: Checksum,
) -> Result<(), PoolError> {
    pools.front_mut(id, TCP_HEADER_LEN, |bytes| {
        TcpPacket::new_unchecked(bytes).set_checksum(0)
    })?;
    if !checksum.tx() {
        return Ok(());
    }
    let sum = !segment_checksum(pools, id, src_addr, dst_addr);
    pools.front_mut(id, TCP_HEADER_LEN, |bytes| {
        TcpPacket::new_unchecked(bytes).set_checksum(sum)
    })
}

/// One's complement sum over the pseudo header and the whole chain. A
/// segment with a valid checksum sums to `!0`.
pub(crate) fn segment_checksum(
    pools: &PoolSet<'_>,
    id: PacketId,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
) -> u16 {
    let len = pools.length_id(id);
    let mut accum = checksum::Accumulator::new();
    let _ = pools.for_each_chunk_id(id, |chunk| accum.add(chunk));
    checksum::combine(&[
        checksum::pseudo_header_v4(&src_addr, &dst_addr, IpProtocol::Tcp, len as u32),
        accum.finish(),
    ])
}

/// Drop the data header a failed send had been given.
pub(crate) fn strip_header(pools: &PoolSet<'_>, mut packet: Packet) -> Packet {
    let _ = pools.trim_front(&mut packet, TCP_HEADER_LEN);
    packet
}

/// Answer a segment nobody wants with a reset. The reset takes the sequence
/// number the segment acknowledged, or acknowledges the segment if it did
/// not carry an acknowledgment.
pub(crate) fn send_reset(
    cx: &mut Context,
    pool: PoolHandle,
    local: IpEndpoint,
    remote: IpEndpoint,
    repr: &TcpRepr,
    payload_len: usize,
) {
    if repr.flags.contains(TcpFlags::RST) {
        return;
    }
    // See https://www.snellman.net/blog/archive/2016-02-01-tcp-rst/ for explanation
    // of why we sometimes send an RST and sometimes an RST|ACK
    let (flags, seq_number, ack_number) = match repr.ack_number {
        Some(ack) => (TcpFlags::RST, ack, None),
        None => (
            TcpFlags::RST | TcpFlags::ACK,
            TcpSeqNumber(0),
            Some(repr.seq_number + repr.segment_len(payload_len)),
        ),
    };
    let reply = TcpRepr {
        src_port: local.port,
        dst_port: remote.port,
        flags,
        seq_number,
        ack_number,
        window_len: 0,
        urgent_at: 0,
        max_seg_size: None,
        window_scale: None,
    };

    let packet = match cx.pools.allocate(pool, TCP_PACKET_HEADROOM, Wait::NoWait) {
        Ok(packet) => packet,
        Err(err) => {
            net_debug!("cannot send reset to {}: {}", remote, err);
            cx.stats.no_buffer += 1;
            return;
        }
    };
    if emit_segment(cx.pools, packet.id(), &reply, local.addr, remote.addr, cx.config.checksum).is_err() {
        let _ = cx.pools.release(packet);
        return;
    }
    tcp_trace!("{}: sending {}", remote, reply);
    cx.stats.resets_sent += 1;
    cx.transmit(packet.into_id(), local.addr, remote.addr);
}
