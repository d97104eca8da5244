#[derive(Debug)]
pub(crate) struct Rand {
    state: u64,
}

impl Rand {
    pub(crate) const fn new(seed: u64) -> Self {
        // xorshift never leaves the all-zero state.
        let state = if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed };
        Self { state }
    }

    /// xorshift64*, see <https://vigna.di.unimi.it/ftp/papers/xorshift.pdf>.
    pub(crate) fn rand_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32
    }

    pub(crate) fn rand_u16(&mut self) -> u16 {
        (self.rand_u32() >> 16) as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_zero_seed_does_not_stick() {
        let mut rand = Rand::new(0);
        let a = rand.rand_u32();
        let b = rand.rand_u32();
        assert!(a != 0 || b != 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = Rand::new(42);
        let mut b = Rand::new(42);
        for _ in 0..16 {
            assert_eq!(a.rand_u32(), b.rand_u32());
        }
    }
}
