pub(super) mod no_control;

pub(super) mod reno;

#[allow(unused_variables)]
pub(super) trait Controller {
    /// Returns the number of bytes that can be sent.
    fn window(&self) -> usize;

    /// Returns the slow-start threshold.
    fn threshold(&self) -> usize {
        usize::MAX
    }

    /// The connection is synchronized; start over with the negotiated segment
    /// size and the window the peer advertised on its SYN.
    fn on_established(&mut self, mss: usize, remote_window: usize) {}

    /// `len` previously unacknowledged bytes were acknowledged.
    fn on_ack(&mut self, len: usize) {}

    /// An acknowledgment beyond the recovery point ended fast recovery.
    fn on_recovery_exit(&mut self) {}

    /// A segment is retransmitted with `flight` bytes outstanding.
    fn on_retransmit(&mut self, flight: usize) {}

    /// The third duplicate acknowledgment triggered a fast retransmit.
    fn on_fast_retransmit(&mut self) {}

    /// Another duplicate acknowledgment arrived during fast recovery.
    fn on_duplicate_ack(&mut self) {}
}

#[derive(Debug)]
pub(super) enum AnyController {
    None(no_control::NoControl),
    Reno(reno::Reno),
}

impl AnyController {
    /// Create a new congestion controller.
    ///
    /// The default is [`Reno`](reno::Reno); users can select another
    /// controller at run-time with
    /// [`Stack::set_congestion_control()`](crate::iface::Stack::set_congestion_control).
    #[inline]
    pub fn new() -> Self {
        AnyController::Reno(reno::Reno::new())
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut dyn Controller {
        match self {
            AnyController::None(n) => n,
            AnyController::Reno(r) => r,
        }
    }

    #[inline]
    pub fn inner(&self) -> &dyn Controller {
        match self {
            AnyController::None(n) => n,
            AnyController::Reno(r) => r,
        }
    }
}
