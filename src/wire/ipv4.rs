/// Length of an IPv4 header without options.
pub const HEADER_LEN: usize = 20;

pub use core::net::Ipv4Addr as Address;

pub(crate) trait AddressExt {
    /// Query whether the address is an unicast address.
    ///
    /// `x_` prefix is to avoid a collision with the still-unstable method in `core::ip`.
    fn x_is_unicast(&self) -> bool;
}

impl AddressExt for Address {
    fn x_is_unicast(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unicast() {
        assert!(Address::new(10, 0, 0, 1).x_is_unicast());
        assert!(!Address::BROADCAST.x_is_unicast());
        assert!(!Address::UNSPECIFIED.x_is_unicast());
        assert!(!Address::new(224, 0, 0, 1).x_is_unicast());
    }
}
