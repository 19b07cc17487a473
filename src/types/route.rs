use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::types::errors::RouteTableError;
use crate::types::prefix::Ipv4Net;

/// Maximum number of next hops a single route can carry.
pub const PATH_SET_CAPACITY: usize = 7;

//------------ NextHop -------------------------------------------------------

/// One forwarding option of a route: an optional gateway and an output port.
///
/// `gw == None` means "forward to the original destination", rendered as
/// `-` in the textual route format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NextHop {
    pub gw: Option<Ipv4Addr>,
    pub port: i32,
}

impl NextHop {
    pub fn new(gw: Option<Ipv4Addr>, port: i32) -> Self {
        Self { gw, port }
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gw {
            Some(gw) => write!(f, "{} {}", gw, self.port),
            None => write!(f, "- {}", self.port),
        }
    }
}

//------------ PathSet -------------------------------------------------------

/// An ordered, fixed-capacity collection of [NextHop]s.
///
/// Order is significant: two path-sets are equal iff they hold the same hops
/// at the same positions. A set may be empty only as a removal pattern;
/// installing a route requires at least one hop.
#[derive(Clone, Copy, Debug)]
pub struct PathSet {
    len: u8,
    hops: [NextHop; PATH_SET_CAPACITY],
}

impl PathSet {
    pub fn new() -> Self {
        Self {
            len: 0,
            hops: [NextHop::default(); PATH_SET_CAPACITY],
        }
    }

    /// Appends a hop, failing once the capacity of seven is reached.
    pub fn push(&mut self, hop: NextHop) -> Result<(), RouteTableError> {
        if usize::from(self.len) == PATH_SET_CAPACITY {
            return Err(RouteTableError::TooManyPaths);
        }
        self.hops[usize::from(self.len)] = hop;
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[NextHop] {
        &self.hops[..usize::from(self.len)]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NextHop> {
        self.as_slice().iter()
    }

    pub fn first(&self) -> Option<&NextHop> {
        self.as_slice().first()
    }

    pub fn get(&self, index: usize) -> Option<&NextHop> {
        self.as_slice().get(index)
    }
}

impl Default for PathSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PathSet {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PathSet {}

impl TryFrom<&[NextHop]> for PathSet {
    type Error = RouteTableError;

    fn try_from(hops: &[NextHop]) -> Result<Self, Self::Error> {
        let mut set = Self::new();
        for hop in hops {
            set.push(*hop)?;
        }
        Ok(set)
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a NextHop;
    type IntoIter = std::slice::Iter<'a, NextHop>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

//------------ Route ---------------------------------------------------------

/// A routing table entry: a prefix and the path-set to spread its traffic
/// over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub net: Ipv4Net,
    pub paths: PathSet,
}

impl Route {
    pub fn new(net: Ipv4Net, paths: PathSet) -> Self {
        Self { net, paths }
    }

    /// Parses `ADDR/MASK [GW] PORT [[GW] PORT]...`.
    ///
    /// A gateway is an IPv4 address or `-` (no gateway); `0.0.0.0` means no
    /// gateway as well. The gateway may be omitted altogether, in which case
    /// the token is taken as the port. With `allow_missing_hops` (removal
    /// patterns) the hop list may be empty and a trailing gateway without a
    /// port is ignored.
    pub fn parse(
        s: &str,
        allow_missing_hops: bool,
    ) -> Result<Self, RouteTableError> {
        let mut words = s.split_whitespace();
        let net: Ipv4Net = words
            .next()
            .ok_or_else(|| RouteTableError::InvalidPrefix(s.trim().to_string()))?
            .parse()?;

        let mut paths = PathSet::new();
        while let Some(word) = words.next() {
            // A hop starts with `-`, a gateway address, or directly with
            // the port.
            let (gw, port_word) = if word == "-" {
                (None, words.next())
            } else if let Ok(addr) = word.parse::<Ipv4Addr>() {
                let gw = if addr.is_unspecified() { None } else { Some(addr) };
                (gw, words.next())
            } else {
                (None, Some(word))
            };

            let port_word = match port_word {
                Some(w) => w,
                None if allow_missing_hops => break,
                None => {
                    return Err(RouteTableError::InvalidPort(String::new()))
                }
            };
            let port: i32 = port_word.parse().map_err(|_| {
                RouteTableError::InvalidPort(port_word.to_string())
            })?;
            if port < 0 {
                return Err(RouteTableError::InvalidPort(
                    port_word.to_string(),
                ));
            }
            paths.push(NextHop::new(gw, port))?;
        }

        if paths.is_empty() && !allow_missing_hops {
            return Err(RouteTableError::EmptyPathSet);
        }
        Ok(Self { net, paths })
    }

    /// Renders the route in the textual table format.
    ///
    /// With `tabs` the prefix column is padded to its seventeen-character
    /// width; hops then follow as `GW⟨tab⟩PORT` separated by single spaces.
    /// A route without hops renders as `-1`.
    pub fn unparse(&self, tabs: bool) -> String {
        let tab = if tabs { '\t' } else { ' ' };
        let mut out = self.net.to_string();
        out.push(tab);
        if out.len() < 17 && tabs {
            out.push('\t');
        }
        if self.paths.is_empty() {
            out.push_str("-1");
        } else {
            for (i, hop) in self.paths.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                match hop.gw {
                    Some(gw) => out.push_str(&gw.to_string()),
                    None => out.push('-'),
                }
                out.push(tab);
                out.push_str(&hop.port.to_string());
            }
        }
        out
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unparse(false))
    }
}

impl FromStr for Route {
    type Err = RouteTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, false)
    }
}
