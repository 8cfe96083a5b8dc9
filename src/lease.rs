use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};
use ipnet::IpNet;

use crate::error::Error;

/// An address pool. Leases are computed by offsetting the start address
/// with a user's identifier; the result must stay inside the declared
/// network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    start: IpAddr,
    network: IpNet,
}

impl FromStr for Cidr {
    type Err = Error;

    /// Parses a CIDR string such as `192.168.1.0/24` or `1234::1222:0/16`.
    /// The address half (host bits preserved) becomes the start address,
    /// which by construction lies inside the masked network.
    fn from_str(s: &str) -> Result<Self, Error> {
        let network: IpNet =
            s.parse().map_err(|_| Error::InvalidCidr(s.to_string()))?;
        Ok(Cidr {
            start: network.addr(),
            network,
        })
    }
}

/// Adds `n` to a 128-bit integer held as two big-endian u64 halves,
/// carrying from the low half into the high half.
fn uint128_add(hi: u64, lo: u64, n: u64) -> (u64, u64) {
    let (lo, carry) = lo.overflowing_add(n);
    (hi.wrapping_add(carry as u64), lo)
}

impl Cidr {
    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn network(&self) -> IpNet {
        self.network
    }

    /// Computes the lease address for a user identifier by treating the
    /// start address as a big-endian integer and adding the identifier.
    /// IPv4 addition wraps at 2^32, IPv6 addition is full 128-bit with
    /// carry between the two 64-bit halves. A result that leaves the
    /// network is rejected, which also catches any wraparound: the wrapped
    /// address cannot lie inside the pool's prefix.
    pub fn generate(&self, id: u64) -> Result<IpAddr, Error> {
        let ip = match self.start {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4).wrapping_add(id as u32);
                IpAddr::V4(Ipv4Addr::from(bits))
            }
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                let hi = BigEndian::read_u64(&octets[..8]);
                let lo = BigEndian::read_u64(&octets[8..]);
                let (hi, lo) = uint128_add(hi, lo, id);
                let mut out = [0u8; 16];
                BigEndian::write_u64(&mut out[..8], hi);
                BigEndian::write_u64(&mut out[8..], lo);
                IpAddr::V6(Ipv6Addr::from(out))
            }
        };

        if !self.network.contains(&ip) {
            return Err(Error::OutOfRange {
                ip,
                network: self.network,
            });
        }

        Ok(ip)
    }
}
