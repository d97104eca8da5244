use heapless::Vec;

use crate::config::TCP_LISTEN_BACKLOG_MAX;
use crate::wire::{IpEndpoint, TcpRepr};

use super::ConnectionHandle;

/// A SYN that arrived while no connection was waiting on its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedSyn {
    pub(crate) local: IpEndpoint,
    pub(crate) remote: IpEndpoint,
    pub(crate) repr: TcpRepr,
}

/// Why a SYN was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    /// The peer retransmitted a SYN that is already queued.
    Duplicate,
    Full,
}

/// A port being listened on.
#[derive(Debug)]
pub(crate) struct Listener {
    port: u16,
    /// The connection currently waiting in LISTEN, if any.
    socket: Option<ConnectionHandle>,
    depth: usize,
    backlog: Vec<QueuedSyn, TCP_LISTEN_BACKLOG_MAX>,
}

impl Listener {
    pub(crate) fn new(port: u16, socket: ConnectionHandle, depth: usize) -> Listener {
        Listener {
            port,
            socket: Some(socket),
            depth: depth.min(TCP_LISTEN_BACKLOG_MAX),
            backlog: Vec::new(),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn socket(&self) -> Option<ConnectionHandle> {
        self.socket
    }

    pub(crate) fn set_socket(&mut self, socket: Option<ConnectionHandle>) {
        self.socket = socket;
    }

    pub(crate) fn len(&self) -> usize {
        self.backlog.len()
    }

    /// Remember a SYN until a connection is free to answer it.
    pub(crate) fn queue(&mut self, syn: QueuedSyn) -> Result<(), Refusal> {
        if self.backlog.iter().any(|queued| queued.remote == syn.remote) {
            return Err(Refusal::Duplicate);
        }
        if self.backlog.len() >= self.depth {
            return Err(Refusal::Full);
        }
        self.backlog.push(syn).map_err(|_| Refusal::Full)
    }

    /// Forget the SYN `remote` queued, after it reset the attempt.
    pub(crate) fn cancel(&mut self, remote: IpEndpoint) -> Option<QueuedSyn> {
        let index = self.backlog.iter().position(|queued| queued.remote == remote)?;
        Some(self.backlog.remove(index))
    }

    /// The oldest queued SYN.
    pub(crate) fn pop(&mut self) -> Option<QueuedSyn> {
        if self.backlog.is_empty() {
            None
        } else {
            Some(self.backlog.remove(0))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{Ipv4Address, TcpFlags, TcpSeqNumber};

    fn syn(port: u16) -> QueuedSyn {
        let local = IpEndpoint::new(Ipv4Address::new(10, 0, 0, 1), 80);
        let remote = IpEndpoint::new(Ipv4Address::new(10, 0, 0, 2), port);
        QueuedSyn {
            local,
            remote,
            repr: TcpRepr {
                src_port: port,
                dst_port: 80,
                flags: TcpFlags::SYN,
                seq_number: TcpSeqNumber(port as i32),
                ack_number: None,
                window_len: 1024,
                urgent_at: 0,
                max_seg_size: Some(536),
                window_scale: None,
            },
        }
    }

    #[test]
    fn test_oldest_first() {
        let mut listener = Listener::new(80, ConnectionHandle(0), 4);
        listener.queue(syn(1000)).unwrap();
        listener.queue(syn(1001)).unwrap();
        assert_eq!(listener.pop().map(|s| s.remote.port), Some(1000));
        assert_eq!(listener.pop().map(|s| s.remote.port), Some(1001));
        assert_eq!(listener.pop(), None);
    }

    #[test]
    fn test_duplicate_collapsed() {
        let mut listener = Listener::new(80, ConnectionHandle(0), 4);
        listener.queue(syn(1000)).unwrap();
        assert_eq!(listener.queue(syn(1000)), Err(Refusal::Duplicate));
        assert_eq!(listener.len(), 1);
    }

    #[test]
    fn test_depth_limit() {
        let mut listener = Listener::new(80, ConnectionHandle(0), 2);
        listener.queue(syn(1000)).unwrap();
        listener.queue(syn(1001)).unwrap();
        assert_eq!(listener.queue(syn(1002)), Err(Refusal::Full));
    }

    #[test]
    fn test_depth_clamped() {
        let mut listener = Listener::new(80, ConnectionHandle(0), usize::MAX);
        for port in 0..TCP_LISTEN_BACKLOG_MAX as u16 {
            listener.queue(syn(2000 + port)).unwrap();
        }
        assert_eq!(listener.queue(syn(3000)), Err(Refusal::Full));
    }

    #[test]
    fn test_cancel() {
        let mut listener = Listener::new(80, ConnectionHandle(0), 4);
        listener.queue(syn(1000)).unwrap();
        listener.queue(syn(1001)).unwrap();
        let remote = syn(1000).remote;
        assert_eq!(listener.cancel(remote).map(|s| s.remote), Some(remote));
        assert_eq!(listener.cancel(remote), None);
        assert_eq!(listener.len(), 1);
    }
}
