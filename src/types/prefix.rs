use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use inetnum::addr::Prefix;

use crate::types::errors::RouteTableError;

//------------ Ipv4Net -------------------------------------------------------

/// An IPv4 prefix as an address/netmask pair.
///
/// Both words are kept in host byte order, which is the form the radix trie
/// consumes. The pair is always canonical: the netmask is contiguous and
/// `addr & !mask == 0`. A prefix with an all-zeroes mask is the default
/// route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: u32,
    mask: u32,
}

impl Ipv4Net {
    /// Creates a prefix from an address and a netmask.
    ///
    /// The address is silently truncated to its network part. Fails if the
    /// netmask is not contiguous.
    pub fn new(addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, RouteTableError> {
        let mask = u32::from(mask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(RouteTableError::InvalidPrefix(format!(
                "{}/{}",
                addr,
                Ipv4Addr::from(mask)
            )));
        }
        Ok(Self {
            addr: u32::from(addr) & mask,
            mask,
        })
    }

    /// Creates a prefix from an address and a prefix length.
    ///
    /// The address is silently truncated to its network part.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds 32.
    pub fn from_len(addr: Ipv4Addr, len: u8) -> Self {
        assert!(len <= 32, "IPv4 prefix length {} out of range", len);
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Self {
            addr: u32::from(addr) & mask,
            mask,
        }
    }

    /// The default route, `0.0.0.0/0`.
    pub fn default_route() -> Self {
        Self { addr: 0, mask: 0 }
    }

    pub fn addr(self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }

    pub fn mask(self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }

    /// The network address in host byte order.
    pub(crate) fn addr_u32(self) -> u32 {
        self.addr
    }

    /// The netmask in host byte order.
    pub(crate) fn mask_u32(self) -> u32 {
        self.mask
    }

    pub fn prefix_len(self) -> u8 {
        self.mask.count_ones() as u8
    }

    /// Whether this is the all-covering default route.
    pub fn is_default(self) -> bool {
        self.mask == 0
    }

    /// Whether `addr` falls inside this prefix.
    pub fn contains(self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask == self.addr
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix_len())
    }
}

impl FromStr for Ipv4Net {
    type Err = RouteTableError;

    /// Parses `ADDR/LEN`, `ADDR/DOTTED_MASK`, or a bare `ADDR` (a host
    /// route).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RouteTableError::InvalidPrefix(s.to_string());
        match s.split_once('/') {
            None => {
                let addr: Ipv4Addr = s.parse().map_err(|_| err())?;
                Ok(Self::from_len(addr, 32))
            }
            Some((addr, mask)) => {
                let addr: Ipv4Addr = addr.parse().map_err(|_| err())?;
                if let Ok(len) = mask.parse::<u8>() {
                    if len > 32 {
                        return Err(err());
                    }
                    Ok(Self::from_len(addr, len))
                } else {
                    let mask: Ipv4Addr = mask.parse().map_err(|_| err())?;
                    Self::new(addr, mask).map_err(|_| err())
                }
            }
        }
    }
}

//------------ Conversions to and from inetnum -------------------------------

impl TryFrom<Prefix> for Ipv4Net {
    type Error = RouteTableError;

    fn try_from(prefix: Prefix) -> Result<Self, Self::Error> {
        match prefix.addr() {
            IpAddr::V4(addr) => Ok(Self::from_len(addr, prefix.len())),
            IpAddr::V6(_) => {
                Err(RouteTableError::InvalidPrefix(prefix.to_string()))
            }
        }
    }
}

impl TryFrom<Ipv4Net> for Prefix {
    type Error = RouteTableError;

    fn try_from(net: Ipv4Net) -> Result<Self, Self::Error> {
        Prefix::new(net.addr().into(), net.prefix_len())
            .map_err(|_| RouteTableError::InvalidPrefix(net.to_string()))
    }
}
