use heapless::Vec;

use crate::config::{IP_HEADER_ROOM, TCP_MAX_CONNECTIONS, TCP_MAX_LISTENERS, TCP_PACKET_HEADROOM};
use crate::rand::Rand;
use crate::socket::tcp::{
    send_reset, segment_checksum, strip_header, BindError, CongestionControl, Connection,
    ConnectionHandle, ConnectionInfo, ConnectError, CreateError, Goal, ListenError, Listener,
    PendingSend, QueuedSyn, RecvError, Refusal, SendError, SendFailure, State, Stats,
};
use crate::storage::{Link, Packet, PacketId, PoolHandle, PoolSet};
use crate::time::Duration;
use crate::wait::{self, Wait};
use crate::wire::{
    IpEndpoint, IpProtocol, Ipv4Address, TcpFlags, TcpPacket, TcpRepr, TCP_HEADER_LEN,
    TCP_MAX_HEADER_LEN,
};

use super::{Config, IpLayer, Transmit};

const EPHEMERAL_FIRST: u16 = 49152;
const EPHEMERAL_LAST: u16 = 65535;

/// Header room a data packet needs to be sent without copying.
const DATA_HEADROOM: usize = IP_HEADER_ROOM + TCP_HEADER_LEN;

/// What a connection needs from the stack while it processes an event.
pub(crate) struct Context<'c, 'a> {
    pub(crate) pools: &'c PoolSet<'a>,
    pub(crate) ip: &'c mut dyn IpLayer,
    pub(crate) config: &'c Config,
    pub(crate) rand: &'c mut Rand,
    pub(crate) stats: &'c mut Stats,
}

impl Context<'_, '_> {
    /// Hand a finished segment to the IP layer.
    pub(crate) fn transmit(&mut self, packet: PacketId, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        let transmit = Transmit {
            src_addr,
            dst_addr,
            protocol: IpProtocol::Tcp,
            type_of_service: self.config.type_of_service,
            time_to_live: self.config.time_to_live,
            dont_fragment: self.config.dont_fragment,
        };
        self.stats.segments_sent += 1;
        self.ip.send(self.pools, packet, &transmit);
    }
}

struct Tables {
    connections: Vec<Option<Connection>, TCP_MAX_CONNECTIONS>,
    listeners: Vec<Listener, TCP_MAX_LISTENERS>,
}

impl Tables {
    fn connection(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        slot(&mut self.connections, handle)
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.iter().any(|listener| listener.port() == port)
            || self
                .connections
                .iter()
                .flatten()
                .any(|connection| connection.local_port() == port)
    }

    fn ephemeral_port(&self, rand: &mut Rand) -> Option<u16> {
        let count = u32::from(EPHEMERAL_LAST - EPHEMERAL_FIRST) + 1;
        let start = u32::from(rand.rand_u16()) % count;
        (0..count)
            .map(|offset| EPHEMERAL_FIRST + ((start + offset) % count) as u16)
            .find(|&port| !self.port_in_use(port))
    }

    /// Detach `handle` from the listener it was waiting on.
    fn forget_socket(&mut self, handle: ConnectionHandle) {
        for listener in self.listeners.iter_mut() {
            if listener.socket() == Some(handle) {
                listener.set_socket(None);
            }
        }
    }
}

fn slot(
    connections: &mut Vec<Option<Connection>, TCP_MAX_CONNECTIONS>,
    handle: ConnectionHandle,
) -> Option<&mut Connection> {
    connections.get_mut(handle.0)?.as_mut()
}

/// Answer queued SYNs until `connection` leaves LISTEN.
fn serve_backlog(cx: &mut Context, connection: &mut Connection, listener: &mut Listener) {
    while connection.state() == State::Listen {
        let Some(syn) = listener.pop() else {
            return;
        };
        if connection.accept_syn(cx, syn.local, syn.remote, &syn.repr) {
            listener.set_socket(None);
        }
    }
}

struct Inner<D> {
    ip: D,
    rand: Rand,
    stats: Stats,
    tables: Tables,
}

/// An operation that either finished or left the caller queued on a wait
/// list.
enum Pending<T, R> {
    Done(T),
    Queued(u32, flume::Receiver<R>),
}

type StateReceiver = flume::Receiver<Result<(), ConnectError>>;

fn await_goal(
    connection: &mut Connection,
    goal: Goal,
    wait: Wait,
) -> Result<Pending<(), Result<(), ConnectError>>, ConnectError> {
    if goal.reached(connection.state()) {
        return Ok(Pending::Done(()));
    }
    if !wait.may_suspend() {
        return Err(ConnectError::InProgress);
    }
    let (ticket, rx): (u32, StateReceiver) = connection
        .state_waiters()
        .enqueue(goal)
        .map_err(|_| ConnectError::TooManyWaiters)?;
    Ok(Pending::Queued(ticket, rx))
}

/// A TCP stack.
///
/// Every method takes `&self`; the stack is meant to be shared between
/// threads. Methods that accept a [Wait] may suspend the calling thread, and
/// never do so with the stack locked.
pub struct Stack<'a, D: IpLayer> {
    config: Config,
    pools: PoolSet<'a>,
    inner: spin::Mutex<Inner<D>>,
}

impl<'a, D: IpLayer> Stack<'a, D> {
    /// Create a stack that allocates from `pools` and transmits through `ip`.
    pub fn new(config: Config, pools: PoolSet<'a>, ip: D) -> Stack<'a, D> {
        Stack {
            inner: spin::Mutex::new(Inner {
                ip,
                rand: Rand::new(config.random_seed),
                stats: Stats::default(),
                tables: Tables {
                    connections: Vec::new(),
                    listeners: Vec::new(),
                },
            }),
            config,
            pools,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pools(&self) -> &PoolSet<'a> {
        &self.pools
    }

    /// Run `f` on the IP layer, with the stack locked.
    pub fn with_ip<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.inner.lock().ip)
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().stats
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Context<'_, 'a>, &mut Tables) -> R) -> R {
        let mut inner = self.inner.lock();
        let Inner {
            ip,
            rand,
            stats,
            tables,
        } = &mut *inner;
        let mut cx = Context {
            pools: &self.pools,
            ip,
            config: &self.config,
            rand,
            stats,
        };
        f(&mut cx, tables)
    }

    /// Create a closed connection whose segments are allocated from `pool`.
    pub fn create_connection(&self, pool: PoolHandle) -> Result<ConnectionHandle, CreateError> {
        if self.pools.get(pool).is_none() {
            return Err(CreateError::InvalidPool);
        }
        self.locked(|cx, tables| {
            let index = match tables.connections.iter().position(Option::is_none) {
                Some(index) => index,
                None => {
                    tables
                        .connections
                        .push(None)
                        .map_err(|_| CreateError::TooManyConnections)?;
                    tables.connections.len() - 1
                }
            };
            let handle = ConnectionHandle(index);
            tables.connections[index] = Some(Connection::new(handle, pool, cx.config));
            net_debug!("{}: created on {}", handle, pool);
            Ok(handle)
        })
    }

    /// Remove a closed connection. Its handle may be reused afterwards.
    pub fn delete_connection(&self, handle: ConnectionHandle) -> Result<(), ConnectError> {
        self.locked(|_, tables| {
            let connection = tables.connection(handle).ok_or(ConnectError::InvalidHandle)?;
            if connection.state() != State::Closed {
                return Err(ConnectError::InvalidState);
            }
            tables.connections[handle.0] = None;
            Ok(())
        })
    }

    /// Give a connection its local port. Port zero picks a free ephemeral
    /// port. Returns the port bound.
    pub fn bind(&self, handle: ConnectionHandle, port: u16) -> Result<u16, BindError> {
        self.locked(|cx, tables| {
            let connection = tables.connection(handle).ok_or(BindError::InvalidHandle)?;
            if connection.state() != State::Closed || connection.local_port() != 0 {
                return Err(BindError::InvalidState);
            }
            let port = match port {
                0 => tables.ephemeral_port(cx.rand).ok_or(BindError::NoFreePort)?,
                port if tables.port_in_use(port) => return Err(BindError::PortInUse),
                port => port,
            };
            if let Some(connection) = tables.connection(handle) {
                connection.bind(port);
            }
            Ok(port)
        })
    }

    /// Open a connection to `remote`. With [Wait::NoWait] this returns
    /// [ConnectError::InProgress] once the SYN is sent.
    pub fn connect(&self, handle: ConnectionHandle, remote: IpEndpoint, wait: Wait) -> Result<(), ConnectError> {
        let pending = self.locked(|cx, tables| {
            let connection = tables.connection(handle).ok_or(ConnectError::InvalidHandle)?;
            let local_addr = cx
                .ip
                .source_address(remote.addr)
                .ok_or(ConnectError::Unaddressable)?;
            connection.connect(cx, local_addr, remote)?;
            await_goal(connection, Goal::Established, wait)
        })?;
        self.wait_for_state(handle, pending, wait)
    }

    /// Accept connections on `port`, with `connection` answering the first
    /// SYN and up to `backlog` further SYNs queued meanwhile.
    pub fn listen(&self, port: u16, handle: ConnectionHandle, backlog: usize) -> Result<(), ListenError> {
        if port == 0 {
            return Err(ListenError::Unaddressable);
        }
        self.locked(|_, tables| {
            if tables.port_in_use(port) {
                return Err(ListenError::PortInUse);
            }
            let connection = tables.connection(handle).ok_or(ListenError::InvalidHandle)?;
            if connection.state() != State::Closed {
                return Err(ListenError::InvalidState);
            }
            tables
                .listeners
                .push(Listener::new(port, handle, backlog))
                .map_err(|_| ListenError::TooManyListeners)?;
            match tables.connection(handle) {
                Some(connection) => connection.listen(port),
                None => Err(ListenError::InvalidHandle),
            }
        })
    }

    /// Stop accepting connections on `port`. Queued SYNs are forgotten and a
    /// connection waiting in LISTEN is closed.
    pub fn unlisten(&self, port: u16) -> Result<(), ListenError> {
        self.locked(|cx, tables| {
            let index = tables
                .listeners
                .iter()
                .position(|listener| listener.port() == port)
                .ok_or(ListenError::NotListening)?;
            let listener = tables.listeners.swap_remove(index);
            net_debug!("unlisten {}: {} SYNs dropped", port, listener.len());
            if let Some(connection) = listener.socket().and_then(|handle| tables.connection(handle)) {
                connection.unlisten(cx);
            }
            Ok(())
        })
    }

    /// Wait until a listening connection is established.
    pub fn accept(&self, handle: ConnectionHandle, wait: Wait) -> Result<(), ConnectError> {
        let pending = self.locked(|_, tables| {
            let connection = tables.connection(handle).ok_or(ConnectError::InvalidHandle)?;
            match connection.state() {
                State::Listen | State::SynReceived | State::Established | State::CloseWait => {
                    await_goal(connection, Goal::Established, wait)
                }
                _ => Err(ConnectError::InvalidState),
            }
        })?;
        self.wait_for_state(handle, pending, wait)
    }

    /// Put a closed connection back in LISTEN on `port`, answering the oldest
    /// queued SYN right away if there is one.
    pub fn relisten(&self, port: u16, handle: ConnectionHandle) -> Result<(), ListenError> {
        self.locked(|cx, tables| {
            let Tables {
                connections,
                listeners,
            } = tables;
            let listener = listeners
                .iter_mut()
                .find(|listener| listener.port() == port)
                .ok_or(ListenError::NotListening)?;
            if listener.socket().is_some() {
                return Err(ListenError::InvalidState);
            }
            let connection = slot(connections, handle).ok_or(ListenError::InvalidHandle)?;
            connection.listen(port)?;
            listener.set_socket(Some(handle));
            serve_backlog(cx, connection, listener);
            Ok(())
        })
    }

    /// Close a connection gracefully. If the peer does not finish the close
    /// in time, the connection is reset.
    pub fn disconnect(&self, handle: ConnectionHandle, wait: Wait) -> Result<(), ConnectError> {
        let pending = self.locked(|cx, tables| {
            tables.forget_socket(handle);
            let connection = tables.connection(handle).ok_or(ConnectError::InvalidHandle)?;
            connection.close(cx)?;
            await_goal(connection, Goal::Closed, wait)
        })?;
        match self.wait_for_state(handle, pending, wait) {
            Err(ConnectError::Timeout) => {
                self.locked(|cx, tables| {
                    if let Some(connection) = tables.connection(handle) {
                        connection.abort(cx);
                    }
                });
                Err(ConnectError::Timeout)
            }
            result => result,
        }
    }

    /// Reset a connection, telling the peer if it is synchronized.
    pub fn abort(&self, handle: ConnectionHandle) -> Result<(), ConnectError> {
        self.locked(|cx, tables| {
            tables.forget_socket(handle);
            let connection = tables.connection(handle).ok_or(ConnectError::InvalidHandle)?;
            connection.abort(cx);
            Ok(())
        })
    }

    fn wait_for_state(
        &self,
        handle: ConnectionHandle,
        pending: Pending<(), Result<(), ConnectError>>,
        wait: Wait,
    ) -> Result<(), ConnectError> {
        let (ticket, rx) = match pending {
            Pending::Done(()) => return Ok(()),
            Pending::Queued(ticket, rx) => (ticket, rx),
        };
        if let Some(result) = wait::park(&rx, wait) {
            return result;
        }
        let cancelled = self.locked(|_, tables| {
            tables
                .connection(handle)
                .and_then(|connection| connection.state_waiters().cancel(ticket))
                .is_some()
        });
        if cancelled {
            return Err(ConnectError::Timeout);
        }
        rx.try_recv().unwrap_or(Err(ConnectError::Timeout))
    }

    /// Send the data of `packet`, which must be owned by the application.
    ///
    /// Data larger than the negotiated segment size, or without room for the
    /// TCP and IP headers in front of it, is copied into segments allocated
    /// from the connection's pool. On failure the packet comes back holding
    /// the data that was not sent.
    pub fn send(&self, handle: ConnectionHandle, packet: Packet, wait: Wait) -> Result<(), SendFailure> {
        let Some((mss, pool)) = self.locked(|_, tables| {
            tables
                .connection(handle)
                .map(|connection| (connection.connect_mss(), connection.pool()))
        }) else {
            return Err(SendFailure::new(SendError::InvalidState, packet));
        };
        let short_headroom = self.pools.headroom(&packet) < DATA_HEADROOM;
        if mss > 0 && (self.pools.length(&packet) > mss || short_headroom) {
            self.send_segmented(handle, packet, mss, pool, wait)
        } else {
            self.send_segment(handle, packet, wait)
        }
    }

    fn send_segmented(
        &self,
        handle: ConnectionHandle,
        mut packet: Packet,
        mss: usize,
        pool: PoolHandle,
        wait: Wait,
    ) -> Result<(), SendFailure> {
        if self.pools.link(packet.id()) != Ok(Link::Allocated) {
            return Err(SendFailure::new(SendError::InvalidPacket, packet));
        }
        loop {
            let remaining = self.pools.length(&packet);
            if remaining == 0 {
                break;
            }
            let take = remaining.min(mss);
            let mut fragment = match self.pools.allocate(pool, TCP_PACKET_HEADROOM, wait) {
                Ok(fragment) => fragment,
                Err(err) => return Err(SendFailure::new(err.into(), packet)),
            };
            match self.pools.copy_range(&packet, 0, take, &mut fragment, wait) {
                Ok(copied) if copied == take => (),
                Ok(_) => {
                    let _ = self.pools.release(fragment);
                    return Err(SendFailure::new(SendError::InvalidPacket, packet));
                }
                Err(err) => {
                    let _ = self.pools.release(fragment);
                    return Err(SendFailure::new(err.into(), packet));
                }
            }
            if let Err(failure) = self.send_segment(handle, fragment, wait) {
                if let Some(fragment) = failure.packet {
                    let _ = self.pools.release(fragment);
                }
                return Err(SendFailure::new(failure.error, packet));
            }
            if let Err(err) = self.pools.trim_front(&mut packet, take) {
                return Err(SendFailure::new(err.into(), packet));
            }
        }
        let _ = self.pools.release(packet);
        Ok(())
    }

    fn send_segment(&self, handle: ConnectionHandle, packet: Packet, wait: Wait) -> Result<(), SendFailure> {
        let len = self.pools.length(&packet);
        if len == 0
            || self.pools.link(packet.id()) != Ok(Link::Allocated)
            || self.pools.headroom(&packet) < DATA_HEADROOM
        {
            return Err(SendFailure::new(SendError::InvalidPacket, packet));
        }
        let stamp = match self.locked(|_, tables| tables.connection(handle).map(|connection| connection.stamp())) {
            Some(Ok(stamp)) => stamp,
            Some(Err(err)) => return Err(SendFailure::new(err, packet)),
            None => return Err(SendFailure::new(SendError::InvalidState, packet)),
        };
        // Checksum over the whole chain, without the stack locked.
        if let Err(err) = stamp.emit(&self.pools, packet.id(), self.config.checksum) {
            return Err(SendFailure::new(err.into(), packet));
        }

        let pending = self.locked(|cx, tables| {
            let Some(connection) = tables.connection(handle) else {
                return Err((SendError::InvalidState, packet));
            };
            match connection.submit(cx, packet, len, stamp) {
                Ok(()) => Ok(Pending::Done(())),
                Err((SendError::WindowOverflow | SendError::QueueFull, packet)) if wait.may_suspend() => {
                    match connection.tx_waiters().enqueue(PendingSend { packet, len }) {
                        Ok((ticket, rx)) => Ok(Pending::Queued(ticket, rx)),
                        Err(pending) => Err((SendError::QueueFull, pending.packet)),
                    }
                }
                Err(refused) => Err(refused),
            }
        });
        let (ticket, rx) = match pending {
            Ok(Pending::Done(())) => return Ok(()),
            Ok(Pending::Queued(ticket, rx)) => (ticket, rx),
            Err((error, packet)) => {
                return Err(SendFailure::new(error, strip_header(&self.pools, packet)));
            }
        };

        if let Some(result) = wait::park(&rx, wait) {
            return result;
        }
        let cancelled = self.locked(|_, tables| {
            tables
                .connection(handle)
                .and_then(|connection| connection.tx_waiters().cancel(ticket))
        });
        if let Some(waiter) = cancelled {
            let (pending, _) = waiter.split();
            let packet = strip_header(&self.pools, pending.packet);
            return Err(SendFailure::new(SendError::Timeout, packet));
        }
        rx.try_recv().unwrap_or(Err(SendFailure {
            error: SendError::Timeout,
            packet: None,
        }))
    }

    /// Take the next in-order segment's data. The packet belongs to the
    /// application afterwards.
    pub fn receive(&self, handle: ConnectionHandle, wait: Wait) -> Result<Packet, RecvError> {
        let pending = self.locked(|cx, tables| {
            let connection = tables.connection(handle).ok_or(RecvError::InvalidState)?;
            if let Some(packet) = connection.dequeue(cx) {
                return Ok(Pending::Done(packet));
            }
            let err = connection.receive_error();
            if err != RecvError::NoPacket || !wait.may_suspend() {
                return Err(err);
            }
            let (ticket, rx) = connection
                .rx_waiters()
                .enqueue(())
                .map_err(|()| RecvError::NoPacket)?;
            Ok(Pending::Queued(ticket, rx))
        })?;
        let (ticket, rx) = match pending {
            Pending::Done(packet) => return Ok(packet),
            Pending::Queued(ticket, rx) => (ticket, rx),
        };

        if let Some(result) = wait::park(&rx, wait) {
            return result;
        }
        let cancelled = self.locked(|_, tables| {
            tables
                .connection(handle)
                .and_then(|connection| connection.rx_waiters().cancel(ticket))
                .is_some()
        });
        if cancelled {
            return Err(RecvError::Timeout);
        }
        rx.try_recv().unwrap_or(Err(RecvError::Timeout))
    }

    /// Octets of in-order data that [Stack::receive] would return.
    pub fn bytes_available(&self, handle: ConnectionHandle) -> Result<usize, RecvError> {
        self.locked(|_, tables| {
            tables
                .connection(handle)
                .map(|connection| connection.bytes_available())
                .ok_or(RecvError::InvalidState)
        })
    }

    /// Process one inbound segment, starting at its TCP header.
    ///
    /// The stack takes ownership of `packet`: it is queued on a connection or
    /// given back to its pool.
    pub fn dispatch(&self, packet: Packet, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        let pools = &self.pools;
        let total_len = pools.length(&packet);
        let mut header = [0u8; TCP_MAX_HEADER_LEN];
        let copied = pools.read(&packet, 0, &mut header);

        self.locked(|cx, tables| {
            cx.stats.segments_received += 1;

            let Ok(tcp) = TcpPacket::new_checked(&header[..copied]) else {
                net_debug!("truncated TCP segment from {}", src_addr);
                cx.stats.invalid_segments += 1;
                let _ = pools.release(packet);
                return;
            };
            if cx.config.checksum.rx() && segment_checksum(pools, packet.id(), src_addr, dst_addr) != !0 {
                net_debug!("TCP checksum error from {}", src_addr);
                cx.stats.checksum_errors += 1;
                let _ = pools.release(packet);
                return;
            }
            let mut repr = TcpRepr::parse_fixed(&tcp);
            if repr.src_port == 0 || repr.dst_port == 0 {
                cx.stats.invalid_segments += 1;
                let _ = pools.release(packet);
                return;
            }
            let options_valid = repr.parse_options(tcp.options()).is_ok();
            let header_len = tcp.header_len() as usize;
            let payload_len = total_len - header_len;

            let local = IpEndpoint::new(dst_addr, repr.dst_port);
            let remote = IpEndpoint::new(src_addr, repr.src_port);
            if local == remote {
                net_debug!("dropping LAND segment {}", repr);
                cx.stats.land_dropped += 1;
                let _ = pools.release(packet);
                return;
            }

            let Tables {
                connections,
                listeners,
            } = tables;

            let found = connections
                .iter_mut()
                .flatten()
                .find(|connection| connection.matches(local, remote));
            if let Some(connection) = found {
                if !options_valid {
                    net_debug!("{}: malformed TCP options, resetting", connection.handle());
                    cx.stats.invalid_segments += 1;
                    let pool = connection.pool();
                    connection.reset(cx);
                    let _ = pools.release(packet);
                    send_reset(cx, pool, local, remote, &repr, payload_len);
                    return;
                }
                if let Some(rest) = connection.process(cx, packet, &repr, header_len, payload_len) {
                    let _ = pools.release(rest);
                }
                if connection.state() == State::Listen {
                    let port = connection.local_port();
                    if let Some(listener) = listeners.iter_mut().find(|listener| listener.port() == port) {
                        if listener.socket().is_none() {
                            listener.set_socket(Some(connection.handle()));
                            serve_backlog(cx, connection, listener);
                        }
                    }
                }
                return;
            }

            let pool = packet.pool();
            let _ = pools.release(packet);

            let listener = listeners
                .iter_mut()
                .find(|listener| listener.port() == repr.dst_port);
            if repr.flags.contains(TcpFlags::RST) {
                if let Some(listener) = listener {
                    if listener.cancel(remote).is_some() {
                        net_debug!("queued SYN from {} reset", remote);
                    }
                }
                return;
            }

            let is_syn = repr.flags.contains(TcpFlags::SYN) && repr.ack_number.is_none();
            if let (true, true, Some(listener)) = (is_syn, options_valid, listener) {
                match listener.socket().and_then(|handle| slot(connections, handle)) {
                    Some(connection) => {
                        if connection.accept_syn(cx, local, remote, &repr) {
                            listener.set_socket(None);
                        }
                    }
                    None => match listener.queue(QueuedSyn { local, remote, repr }) {
                        Ok(()) => net_trace!("queued SYN from {}", remote),
                        Err(Refusal::Duplicate) => net_trace!("duplicate SYN from {}", remote),
                        Err(Refusal::Full) => {
                            net_debug!("backlog of port {} full, dropping SYN", local.port);
                            cx.stats.syn_dropped += 1;
                        }
                    },
                }
                return;
            }

            net_debug!("no connection for {} -> {}, resetting", remote, local);
            send_reset(cx, pool, local, remote, &repr, payload_len);
        });
    }

    /// Retransmit for a connection now, as a timeout would, or as a fast
    /// retransmit.
    pub fn retransmit(&self, handle: ConnectionHandle, fast: bool) {
        self.locked(|cx, tables| {
            if let Some(connection) = tables.connection(handle) {
                connection.retransmit(cx, fast);
            }
        });
    }

    /// Advance every retransmission timer by `elapsed`.
    pub fn tick(&self, elapsed: Duration) {
        self.locked(|cx, tables| {
            for connection in tables.connections.iter_mut().flatten() {
                connection.tick(cx, elapsed);
            }
        });
    }

    pub fn state(&self, handle: ConnectionHandle) -> Option<State> {
        self.locked(|_, tables| tables.connection(handle).map(|connection| connection.state()))
    }

    pub fn info(&self, handle: ConnectionHandle) -> Option<ConnectionInfo> {
        self.locked(|_, tables| tables.connection(handle).map(|connection| connection.info()))
    }

    #[cfg(test)]
    pub(crate) fn with_connection<R>(
        &self,
        handle: ConnectionHandle,
        f: impl FnOnce(&mut Context<'_, 'a>, &mut Connection) -> R,
    ) -> Option<R> {
        self.locked(|cx, tables| tables.connection(handle).map(|connection| f(cx, connection)))
    }

    /// Set the congestion control algorithm of a connection.
    ///
    /// `CongestionControl::None` sends as much as the peer's window allows.
    pub fn set_congestion_control(
        &self,
        handle: ConnectionHandle,
        congestion_control: CongestionControl,
    ) -> Result<(), ConnectError> {
        self.locked(|_, tables| {
            let connection = tables.connection(handle).ok_or(ConnectError::InvalidHandle)?;
            connection.set_congestion_control(congestion_control);
            Ok(())
        })
    }

    pub fn congestion_control(&self, handle: ConnectionHandle) -> Option<CongestionControl> {
        self.locked(|_, tables| {
            tables
                .connection(handle)
                .map(|connection| connection.congestion_control())
        })
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::iface::capture::{segment, Capture, Sent};
    use crate::iface::Checksum;
    use crate::wire::{TcpSeqNumber, TCP_HEADER_LEN};

    const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
    const PORT: u16 = 80;
    const CLIENT_SEQ: TcpSeqNumber = TcpSeqNumber(5000);

    type TestStack = Stack<'static, Capture>;

    fn stack(config: Config) -> (TestStack, PoolHandle) {
        let mut pools = PoolSet::new();
        let pool = pools.create("tcp", 1600, vec![0u8; 32 * 1600]).unwrap();
        (Stack::new(config, pools, Capture::new(LOCAL)), pool)
    }

    fn repr(src_port: u16, dst_port: u16, flags: TcpFlags, seq: TcpSeqNumber, ack: Option<TcpSeqNumber>) -> TcpRepr {
        TcpRepr {
            src_port,
            dst_port,
            flags,
            seq_number: seq,
            ack_number: ack,
            window_len: 2048,
            urgent_at: 0,
            max_seg_size: None,
            window_scale: None,
        }
    }

    fn syn(port: u16) -> TcpRepr {
        TcpRepr {
            max_seg_size: Some(536),
            ..repr(port, PORT, TcpFlags::SYN, CLIENT_SEQ, None)
        }
    }

    fn deliver(stack: &TestStack, pool: PoolHandle, repr: TcpRepr) {
        let packet = segment(stack.pools(), pool, &repr, &[], REMOTE, LOCAL);
        stack.dispatch(packet, REMOTE, LOCAL);
    }

    fn sent(stack: &TestStack) -> std::vec::Vec<Sent> {
        stack.with_ip(Capture::take)
    }

    fn available(stack: &TestStack, pool: PoolHandle) -> usize {
        stack.pools().get(pool).unwrap().available()
    }

    /// Answer the SYN from `port`; returns our initial sequence number.
    fn answer(stack: &TestStack, pool: PoolHandle, port: u16) -> TcpSeqNumber {
        deliver(stack, pool, syn(port));
        let out = sent(stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(out[0].repr.dst_port, port);
        out[0].repr.seq_number
    }

    fn complete(stack: &TestStack, pool: PoolHandle, port: u16, iss: TcpSeqNumber) {
        deliver(stack, pool, repr(port, PORT, TcpFlags::ACK, CLIENT_SEQ + 1, Some(iss + 1)));
    }

    #[test]
    fn test_passive_open() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 2).unwrap();
        assert_eq!(stack.state(handle), Some(State::Listen));
        assert_eq!(stack.accept(handle, Wait::NoWait), Err(ConnectError::InProgress));

        deliver(&stack, pool, syn(50000));
        assert_eq!(stack.state(handle), Some(State::SynReceived));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        let syn_ack = out[0].repr;
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.ack_number, Some(CLIENT_SEQ + 1));
        assert_eq!(syn_ack.max_seg_size, Some(1460));
        assert_eq!(syn_ack.window_len, 8192);
        // The peer did not offer scaling.
        assert_eq!(syn_ack.window_scale, None);

        complete(&stack, pool, 50000, syn_ack.seq_number);
        assert_eq!(stack.state(handle), Some(State::Established));
        assert_eq!(stack.accept(handle, Wait::NoWait), Ok(()));
        let info = stack.info(handle).unwrap();
        assert_eq!(info.remote, Some(IpEndpoint::new(REMOTE, 50000)));
        assert_eq!(info.local, Some(IpEndpoint::new(LOCAL, PORT)));
        assert_eq!(info.mss, 536);
        assert!(sent(&stack).is_empty());
    }

    #[test]
    fn test_passive_open_with_window_scale() {
        let (stack, pool) = stack(Config {
            rx_window: 1 << 17,
            ..Config::default()
        });
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();

        deliver(&stack, pool, TcpRepr {
            window_scale: Some(2),
            ..syn(50000)
        });
        let out = sent(&stack);
        assert_eq!(out[0].repr.window_scale, Some(2));
        assert_eq!(out[0].repr.window_len, u16::MAX);

        complete(&stack, pool, 50000, out[0].repr.seq_number);
        // 2048 << 2
        assert_eq!(stack.info(handle).unwrap().tx_window, 8192);
    }

    #[test]
    fn test_blocking_accept() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();

        thread::scope(|s| {
            let acceptor = s.spawn(|| stack.accept(handle, Wait::Forever));
            thread::sleep(std::time::Duration::from_millis(20));
            let iss = answer(&stack, pool, 50000);
            complete(&stack, pool, 50000, iss);
            assert_eq!(acceptor.join().unwrap(), Ok(()));
        });
    }

    #[test]
    fn test_syn_ack_retransmitted_on_duplicate_syn() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();

        let iss = answer(&stack, pool, 50000);
        assert_eq!(answer(&stack, pool, 50000), iss);
        assert_eq!(stack.state(handle), Some(State::SynReceived));
    }

    #[test]
    fn test_bad_ack_in_syn_received() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();

        let iss = answer(&stack, pool, 50000);
        deliver(&stack, pool, repr(50000, PORT, TcpFlags::ACK, CLIENT_SEQ + 1, Some(iss + 7)));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::RST);
        assert_eq!(out[0].repr.seq_number, iss + 7);
        assert_eq!(stack.state(handle), Some(State::SynReceived));
    }

    #[test]
    fn test_backlog() {
        let (stack, pool) = stack(Config::default());
        let first = stack.create_connection(pool).unwrap();
        stack.listen(PORT, first, 2).unwrap();

        let iss = answer(&stack, pool, 50001);
        deliver(&stack, pool, syn(50002));
        // Retransmitted while queued.
        deliver(&stack, pool, syn(50002));
        deliver(&stack, pool, syn(50003));
        deliver(&stack, pool, syn(50004));
        assert!(sent(&stack).is_empty());
        assert_eq!(stack.stats().syn_dropped, 1);

        // The peer gave up on its attempt.
        deliver(&stack, pool, repr(50003, PORT, TcpFlags::RST, CLIENT_SEQ + 1, None));
        assert!(sent(&stack).is_empty());

        complete(&stack, pool, 50001, iss);
        assert_eq!(stack.state(first), Some(State::Established));

        let second = stack.create_connection(pool).unwrap();
        stack.relisten(PORT, second).unwrap();
        assert_eq!(stack.state(second), Some(State::SynReceived));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.dst_port, 50002);

        // Nothing else is queued.
        let iss = out[0].repr.seq_number;
        complete(&stack, pool, 50002, iss);
        let third = stack.create_connection(pool).unwrap();
        stack.relisten(PORT, third).unwrap();
        assert_eq!(stack.state(third), Some(State::Listen));
        assert!(sent(&stack).is_empty());
    }

    #[test]
    fn test_relisten_while_listening() {
        let (stack, pool) = stack(Config::default());
        let first = stack.create_connection(pool).unwrap();
        let second = stack.create_connection(pool).unwrap();
        stack.listen(PORT, first, 1).unwrap();
        assert_eq!(stack.relisten(PORT, second), Err(ListenError::InvalidState));
        assert_eq!(stack.relisten(PORT + 1, second), Err(ListenError::NotListening));
    }

    #[test]
    fn test_half_open_reset_returns_to_listen() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 1).unwrap();

        answer(&stack, pool, 50001);
        deliver(&stack, pool, syn(50002));
        deliver(&stack, pool, repr(50001, PORT, TcpFlags::RST, CLIENT_SEQ + 1, None));

        // Back in LISTEN, the queued SYN is answered at once.
        assert_eq!(stack.state(handle), Some(State::SynReceived));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.dst_port, 50002);
        assert_eq!(stack.info(handle).unwrap().remote, Some(IpEndpoint::new(REMOTE, 50002)));
        assert_eq!(stack.stats().resets_received, 1);
    }

    #[test]
    fn test_close_in_syn_received() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();
        answer(&stack, pool, 50000);

        assert_eq!(stack.disconnect(handle, Wait::NoWait), Ok(()));
        assert_eq!(stack.state(handle), Some(State::Closed));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::RST | TcpFlags::ACK);
    }

    #[test]
    fn test_disconnect_timeout_aborts() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();
        let iss = answer(&stack, pool, 50000);
        complete(&stack, pool, 50000, iss);

        let wait = Wait::Timeout(Duration::from_millis(10));
        assert_eq!(stack.disconnect(handle, wait), Err(ConnectError::Timeout));
        assert_eq!(stack.state(handle), Some(State::Closed));
        let flags: std::vec::Vec<TcpFlags> = sent(&stack).iter().map(|s| s.repr.flags).collect();
        assert_eq!(flags, [TcpFlags::FIN | TcpFlags::ACK, TcpFlags::RST | TcpFlags::ACK]);
    }

    #[test]
    fn test_land() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();
        let before = available(&stack, pool);

        let repr = repr(PORT, PORT, TcpFlags::SYN, CLIENT_SEQ, None);
        let packet = segment(stack.pools(), pool, &repr, &[], LOCAL, LOCAL);
        stack.dispatch(packet, LOCAL, LOCAL);

        assert_eq!(stack.stats().land_dropped, 1);
        assert_eq!(stack.state(handle), Some(State::Listen));
        assert!(sent(&stack).is_empty());
        assert_eq!(available(&stack, pool), before);
    }

    #[test]
    fn test_reset_without_connection() {
        let (stack, pool) = stack(Config::default());

        deliver(&stack, pool, repr(50000, 81, TcpFlags::SYN, CLIENT_SEQ, None));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(out[0].repr.seq_number, TcpSeqNumber(0));
        assert_eq!(out[0].repr.ack_number, Some(CLIENT_SEQ + 1));
        assert_eq!(out[0].repr.src_port, 81);
        assert_eq!(out[0].repr.dst_port, 50000);
        assert_eq!(out[0].transmit.dst_addr, REMOTE);

        let ack = TcpSeqNumber(777);
        deliver(&stack, pool, repr(50000, 81, TcpFlags::ACK, CLIENT_SEQ, Some(ack)));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::RST);
        assert_eq!(out[0].repr.seq_number, ack);
        assert_eq!(out[0].repr.ack_number, None);

        deliver(&stack, pool, repr(50000, 81, TcpFlags::RST, CLIENT_SEQ, None));
        assert!(sent(&stack).is_empty());
        assert_eq!(stack.stats().resets_sent, 2);
    }

    #[test]
    fn test_checksum_error() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();
        let before = available(&stack, pool);

        let packet = segment(stack.pools(), pool, &syn(50000), &[], REMOTE, LOCAL);
        stack
            .pools()
            .front_mut(packet.id(), TCP_HEADER_LEN, |bytes| bytes[16] ^= 0xff)
            .unwrap();
        stack.dispatch(packet, REMOTE, LOCAL);

        assert_eq!(stack.stats().checksum_errors, 1);
        assert_eq!(stack.state(handle), Some(State::Listen));
        assert!(sent(&stack).is_empty());
        assert_eq!(available(&stack, pool), before);
    }

    #[test]
    fn test_checksum_not_verified() {
        let (stack, pool) = stack(Config {
            checksum: Checksum::None,
            ..Config::default()
        });
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();

        let packet = segment(stack.pools(), pool, &syn(50000), &[], REMOTE, LOCAL);
        stack
            .pools()
            .front_mut(packet.id(), TCP_HEADER_LEN, |bytes| bytes[16] ^= 0xff)
            .unwrap();
        stack.dispatch(packet, REMOTE, LOCAL);

        assert_eq!(stack.state(handle), Some(State::SynReceived));
        assert_eq!(stack.stats().checksum_errors, 0);
    }

    #[test]
    fn test_truncated_segment() {
        let (stack, pool) = stack(Config::default());
        let before = available(&stack, pool);

        let mut packet = stack.pools().allocate(pool, 0, Wait::NoWait).unwrap();
        stack.pools().append(&mut packet, &[0; 12], Wait::NoWait).unwrap();
        stack.dispatch(packet, REMOTE, LOCAL);

        assert_eq!(stack.stats().invalid_segments, 1);
        assert_eq!(available(&stack, pool), before);
    }

    #[test]
    fn test_malformed_options_reset() {
        let (stack, pool) = stack(Config {
            checksum: Checksum::None,
            ..Config::default()
        });
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 0).unwrap();
        let iss = answer(&stack, pool, 50000);
        complete(&stack, pool, 50000, iss);
        assert_eq!(stack.state(handle), Some(State::Established));

        // An MSS option claiming three octets.
        let bad = TcpRepr {
            max_seg_size: Some(536),
            ..repr(50000, PORT, TcpFlags::ACK, CLIENT_SEQ + 1, Some(iss + 1))
        };
        let packet = segment(stack.pools(), pool, &bad, &[], REMOTE, LOCAL);
        stack
            .pools()
            .front_mut(packet.id(), TCP_HEADER_LEN + 2, |bytes| bytes[TCP_HEADER_LEN + 1] = 3)
            .unwrap();
        stack.dispatch(packet, REMOTE, LOCAL);

        assert_eq!(stack.state(handle), Some(State::Closed));
        assert_eq!(stack.stats().invalid_segments, 1);
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::RST);
        assert_eq!(out[0].repr.seq_number, iss + 1);
    }

    #[test]
    fn test_connection_table() {
        let (stack, pool) = stack(Config::default());
        for index in 0..TCP_MAX_CONNECTIONS {
            assert_eq!(stack.create_connection(pool), Ok(ConnectionHandle(index)));
        }
        assert_eq!(stack.create_connection(pool), Err(CreateError::TooManyConnections));

        stack.delete_connection(ConnectionHandle(3)).unwrap();
        assert_eq!(stack.state(ConnectionHandle(3)), None);
        assert_eq!(stack.create_connection(pool), Ok(ConnectionHandle(3)));

        stack.listen(PORT, ConnectionHandle(3), 0).unwrap();
        assert_eq!(
            stack.delete_connection(ConnectionHandle(3)),
            Err(ConnectError::InvalidState)
        );
        assert_eq!(
            stack.delete_connection(ConnectionHandle(TCP_MAX_CONNECTIONS)),
            Err(ConnectError::InvalidHandle)
        );
    }

    #[test]
    fn test_invalid_pool() {
        let mut other = PoolSet::new();
        other.create("a", 64, vec![0u8; 64]).unwrap();
        let missing = other.create("b", 64, vec![0u8; 64]).unwrap();

        let (stack, _) = stack(Config::default());
        assert_eq!(stack.create_connection(missing), Err(CreateError::InvalidPool));
    }

    #[test]
    fn test_bind() {
        let (stack, pool) = stack(Config::default());
        let first = stack.create_connection(pool).unwrap();
        let second = stack.create_connection(pool).unwrap();
        let third = stack.create_connection(pool).unwrap();

        let port = stack.bind(first, 0).unwrap();
        assert!(port >= EPHEMERAL_FIRST);
        assert_eq!(stack.bind(second, port), Err(BindError::PortInUse));
        let other = stack.bind(second, 0).unwrap();
        assert_ne!(other, port);
        assert_eq!(stack.bind(second, 0), Err(BindError::InvalidState));
        assert_eq!(stack.listen(port, third, 0), Err(ListenError::PortInUse));
        assert_eq!(
            stack.bind(ConnectionHandle(TCP_MAX_CONNECTIONS), 0),
            Err(BindError::InvalidHandle)
        );
    }

    #[test]
    fn test_listen_errors() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        assert_eq!(stack.listen(0, handle, 0), Err(ListenError::Unaddressable));

        stack.bind(handle, 1234).unwrap();
        assert_eq!(stack.listen(1234, handle, 0), Err(ListenError::PortInUse));

        for port in 0..TCP_MAX_LISTENERS as u16 {
            let handle = stack.create_connection(pool).unwrap();
            stack.listen(PORT + port, handle, 0).unwrap();
        }
        let extra = stack.create_connection(pool).unwrap();
        assert_eq!(stack.listen(PORT + 100, extra, 0), Err(ListenError::TooManyListeners));
    }

    #[test]
    fn test_unlisten() {
        let (stack, pool) = stack(Config::default());
        let handle = stack.create_connection(pool).unwrap();
        stack.listen(PORT, handle, 1).unwrap();

        stack.unlisten(PORT).unwrap();
        assert_eq!(stack.state(handle), Some(State::Closed));
        assert_eq!(stack.unlisten(PORT), Err(ListenError::NotListening));

        deliver(&stack, pool, syn(50000));
        let out = sent(&stack);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].repr.flags, TcpFlags::RST | TcpFlags::ACK);

        // The port is free again.
        stack.listen(PORT, handle, 1).unwrap();
    }

    #[test]
    fn test_ephemeral_port_range() {
        let mut rand = Rand::new(3);
        let tables = Tables {
            connections: Vec::new(),
            listeners: Vec::new(),
        };
        let port = tables.ephemeral_port(&mut rand).unwrap();
        assert!((EPHEMERAL_FIRST..=EPHEMERAL_LAST).contains(&port));
    }
}
