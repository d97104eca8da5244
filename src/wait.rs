/*! Suspension of callers on exhausted resources.

A thread that cannot be served immediately registers a [Waiter] in a FIFO
[WaitList] owned by the resource, drops the resource's lock and parks on the
receiving side of a rendezvous channel. Whoever frees the resource pops the
oldest waiter under the same lock and hands the result over the channel, so a
waiter is either still queued or already served, never both.

A waiter whose timeout expires re-takes the lock and cancels its ticket. If the
ticket is gone the resource was handed over concurrently and the result is
already in the channel.
*/

use heapless::Deque;

use crate::time::Duration;

/// How long a caller is willing to be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Fail immediately.
    #[default]
    NoWait,
    /// Suspend for at most the given time.
    Timeout(Duration),
    /// Suspend until served.
    Forever,
}

impl Wait {
    /// Whether the caller accepts being suspended at all.
    pub fn may_suspend(&self) -> bool {
        match self {
            Wait::NoWait => false,
            Wait::Timeout(duration) => !duration.is_zero(),
            Wait::Forever => true,
        }
    }
}

/// The sending half handed to whoever serves a waiter.
#[derive(Debug)]
pub(crate) struct Reply<T>(flume::Sender<T>);

impl<T> Reply<T> {
    /// Deliver `value`. Gives it back if the waiter is gone.
    pub(crate) fn send(self, value: T) -> Result<(), T> {
        self.0.try_send(value).map_err(|err| err.into_inner())
    }
}

#[derive(Debug)]
pub(crate) struct Waiter<T, I> {
    ticket: u32,
    item: I,
    reply: Reply<T>,
}

impl<T, I> Waiter<T, I> {
    pub(crate) fn item(&self) -> &I {
        &self.item
    }

    pub(crate) fn split(self) -> (I, Reply<T>) {
        (self.item, self.reply)
    }
}

/// A bounded FIFO of suspended callers. `I` is whatever the caller leaves
/// behind for the one who serves it.
#[derive(Debug)]
pub(crate) struct WaitList<T, I, const N: usize> {
    queue: Deque<Waiter<T, I>, N>,
    next_ticket: u32,
}

impl<T, I, const N: usize> WaitList<T, I, N> {
    pub(crate) const fn new() -> Self {
        WaitList {
            queue: Deque::new(),
            next_ticket: 0,
        }
    }

    /// Queue a new waiter behind all existing ones. Gives `item` back if the
    /// list is full.
    pub(crate) fn enqueue(&mut self, item: I) -> Result<(u32, flume::Receiver<T>), I> {
        let (tx, rx) = flume::bounded(1);
        let ticket = self.next_ticket;
        let waiter = Waiter {
            ticket,
            item,
            reply: Reply(tx),
        };
        match self.queue.push_back(waiter) {
            Ok(()) => {
                self.next_ticket = self.next_ticket.wrapping_add(1);
                Ok((ticket, rx))
            }
            Err(waiter) => Err(waiter.item),
        }
    }

    pub(crate) fn front(&self) -> Option<&Waiter<T, I>> {
        self.queue.front()
    }

    pub(crate) fn pop(&mut self) -> Option<Waiter<T, I>> {
        self.queue.pop_front()
    }

    /// Remove the waiter holding `ticket`, keeping the order of the others.
    pub(crate) fn cancel(&mut self, ticket: u32) -> Option<Waiter<T, I>> {
        self.remove_first(|waiter| waiter.ticket == ticket)
    }

    /// Remove the oldest waiter whose item satisfies `pred`.
    pub(crate) fn take_first(&mut self, mut pred: impl FnMut(&I) -> bool) -> Option<Waiter<T, I>> {
        self.remove_first(|waiter| pred(&waiter.item))
    }

    fn remove_first(&mut self, mut pred: impl FnMut(&Waiter<T, I>) -> bool) -> Option<Waiter<T, I>> {
        let mut found = None;
        for _ in 0..self.queue.len() {
            let waiter = self.queue.pop_front()?;
            if found.is_none() && pred(&waiter) {
                found = Some(waiter);
            } else if let Err(waiter) = self.queue.push_back(waiter) {
                // Cannot happen, one element was just taken out.
                drop(waiter);
            }
        }
        found
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T, I, const N: usize> Default for WaitList<T, I, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Block on `rx` for as long as `wait` allows.
pub(crate) fn park<T>(rx: &flume::Receiver<T>, wait: Wait) -> Option<T> {
    match wait {
        Wait::NoWait => rx.try_recv().ok(),
        Wait::Timeout(duration) => rx.recv_timeout(duration.into()).ok(),
        Wait::Forever => rx.recv().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut list: WaitList<u32, &str, 4> = WaitList::new();
        let (_, rx_a) = list.enqueue("a").unwrap();
        let (_, rx_b) = list.enqueue("b").unwrap();

        let (item, reply) = list.pop().unwrap().split();
        assert_eq!(item, "a");
        reply.send(1).unwrap();
        let (item, reply) = list.pop().unwrap().split();
        assert_eq!(item, "b");
        reply.send(2).unwrap();

        assert_eq!(rx_a.try_recv(), Ok(1));
        assert_eq!(rx_b.try_recv(), Ok(2));
        assert!(list.is_empty());
    }

    #[test]
    fn test_full() {
        let mut list: WaitList<u32, u8, 1> = WaitList::new();
        let _rx = list.enqueue(1).unwrap();
        assert_eq!(list.enqueue(2).err(), Some(2));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_cancel_keeps_order() {
        let mut list: WaitList<(), char, 4> = WaitList::new();
        let (_, _rx_a) = list.enqueue('a').unwrap();
        let (b, _rx_b) = list.enqueue('b').unwrap();
        let (_, _rx_c) = list.enqueue('c').unwrap();

        assert_eq!(list.cancel(b).map(|w| *w.item()), Some('b'));
        assert!(list.cancel(b).is_none());
        assert_eq!(list.pop().map(|w| *w.item()), Some('a'));
        assert_eq!(list.pop().map(|w| *w.item()), Some('c'));
    }

    #[test]
    fn test_take_first_matching() {
        let mut list: WaitList<(), u8, 4> = WaitList::new();
        let _a = list.enqueue(1).unwrap();
        let _b = list.enqueue(2).unwrap();
        let _c = list.enqueue(2).unwrap();

        assert_eq!(list.take_first(|item| *item == 2).map(|w| *w.item()), Some(2));
        assert_eq!(list.len(), 2);
        assert!(list.take_first(|item| *item == 3).is_none());
        assert_eq!(list.pop().map(|w| *w.item()), Some(1));
        assert_eq!(list.pop().map(|w| *w.item()), Some(2));
    }

    #[test]
    fn test_reply_to_gone_waiter() {
        let mut list: WaitList<u32, (), 1> = WaitList::new();
        let (_, rx) = list.enqueue(()).unwrap();
        drop(rx);
        let (_, reply) = list.pop().unwrap().split();
        assert_eq!(reply.send(7), Err(7));
    }

    #[test]
    fn test_park_timeout() {
        let mut list: WaitList<u32, (), 1> = WaitList::new();
        let (_, rx) = list.enqueue(()).unwrap();
        assert_eq!(park(&rx, Wait::Timeout(Duration::from_millis(5))), None);
        assert_eq!(park(&rx, Wait::NoWait), None);
    }

    #[test]
    fn test_may_suspend() {
        assert!(!Wait::NoWait.may_suspend());
        assert!(!Wait::Timeout(Duration::ZERO).may_suspend());
        assert!(Wait::Timeout(Duration::from_millis(1)).may_suspend());
        assert!(Wait::Forever.may_suspend());
    }
}
