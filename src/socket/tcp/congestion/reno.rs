use super::Controller;

/// Slow start and congestion avoidance of RFC 5681, with the window handling
/// of NewReno fast recovery (RFC 6582).
#[derive(Debug)]
pub struct Reno {
    cwnd: usize,
    ssthresh: usize,
    mss: usize,
    /// `mss * mss`, for the congestion avoidance increment.
    mss2: usize,
}

impl Reno {
    pub fn new() -> Self {
        Reno {
            cwnd: 536,
            ssthresh: usize::MAX,
            mss: 536,
            mss2: 536 * 536,
        }
    }
}

impl Controller for Reno {
    fn window(&self) -> usize {
        self.cwnd
    }

    fn threshold(&self) -> usize {
        self.ssthresh
    }

    fn on_established(&mut self, mss: usize, remote_window: usize) {
        self.mss = mss.max(1);
        self.mss2 = self.mss * self.mss;
        self.cwnd = self.mss;
        self.ssthresh = remote_window;
    }

    fn on_ack(&mut self, len: usize) {
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd = self.cwnd.saturating_add(len.min(self.mss));
        } else {
            // Congestion avoidance, roughly one segment per round trip.
            let increment = (self.mss2 / self.cwnd.max(1)).max(1);
            self.cwnd = self.cwnd.saturating_add(increment);
        }
    }

    fn on_recovery_exit(&mut self) {
        self.cwnd = self.ssthresh;
    }

    fn on_retransmit(&mut self, flight: usize) {
        self.ssthresh = (flight / 2).max(2 * self.mss);
        self.cwnd = self.mss;
    }

    fn on_fast_retransmit(&mut self) {
        self.cwnd = self.ssthresh.saturating_add(3 * self.mss);
    }

    fn on_duplicate_ack(&mut self) {
        self.cwnd = self.cwnd.saturating_add(self.mss);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn established(mss: usize, window: usize) -> Reno {
        let mut reno = Reno::new();
        reno.on_established(mss, window);
        reno
    }

    #[test]
    fn test_established() {
        let reno = established(1000, 8000);
        assert_eq!(reno.window(), 1000);
        assert_eq!(reno.threshold(), 8000);
    }

    #[test]
    fn test_slow_start_grows_by_at_most_one_segment() {
        let mut reno = established(1000, 8000);
        reno.on_ack(3000);
        assert_eq!(reno.window(), 2000);
        reno.on_ack(400);
        assert_eq!(reno.window(), 2400);
    }

    #[test]
    fn test_congestion_avoidance() {
        let mut reno = established(1000, 2000);
        reno.on_ack(1000);
        assert_eq!(reno.window(), 2000);
        // At the threshold: mss^2 / cwnd.
        reno.on_ack(1000);
        assert_eq!(reno.window(), 2500);
    }

    #[test]
    fn test_congestion_avoidance_minimum_increment() {
        let mut reno = established(10, 0);
        reno.cwnd = 500;
        reno.on_ack(10);
        assert_eq!(reno.window(), 501);
    }

    #[test]
    fn test_retransmit_floor() {
        let mut reno = established(1000, 64000);
        reno.on_retransmit(1500);
        assert_eq!(reno.threshold(), 2000);
        assert_eq!(reno.window(), 1000);

        reno.on_retransmit(10000);
        assert_eq!(reno.threshold(), 5000);
    }

    #[test]
    fn test_fast_recovery() {
        let mut reno = established(1000, 64000);
        reno.on_retransmit(8000);
        reno.on_fast_retransmit();
        assert_eq!(reno.window(), 7000);
        reno.on_duplicate_ack();
        assert_eq!(reno.window(), 8000);
        reno.on_recovery_exit();
        assert_eq!(reno.window(), 4000);
    }
}
