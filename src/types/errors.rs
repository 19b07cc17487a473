use std::fmt;

use crate::types::route::Route;

/// Possible errors returned by methods on a routing table and by the
/// command interpreter. All of these are recoverable; a failed call leaves
/// the table exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTableError {
    /// A prefix could not be parsed, or its netmask is not contiguous.
    InvalidPrefix(String),
    /// An address handed to the lookup handler could not be parsed.
    InvalidAddress(String),
    /// An output port token was missing, malformed, or negative.
    InvalidPort(String),
    /// The first token of a control line was not `add`, `set`, `setm` or
    /// `remove`.
    UnknownCommand(String),
    /// A hash mode other than `single`, `addr`, `port` or `packet` was
    /// requested. The element falls back to per-packet hashing when it
    /// sees this.
    UnknownMode(String),
    /// No hash mode was given in the configuration at all.
    ModeMissing,
    /// A route cannot be installed without at least one next hop.
    EmptyPathSet,
    /// A route carried more than the seven next hops a path-set can hold.
    TooManyPaths,
    /// All 255 distinct path-sets are in use.
    PathSetsFull,
    /// All route slots are in use.
    TableFull,
    /// `add` of a prefix that is already installed; carries the incumbent
    /// route.
    RouteExists(Box<Route>),
    /// `remove` of a prefix that is not installed; carries the requested
    /// route.
    RouteNotFound(Box<Route>),
}

impl RouteTableError {
    /// The errno-style status code the handler surface reports for this
    /// error: `-EEXIST`, `-ENOENT`, `-ENOMEM` or `-EINVAL`.
    pub fn code(&self) -> i32 {
        match self {
            RouteTableError::RouteExists(_) => -17,
            RouteTableError::RouteNotFound(_) => -2,
            RouteTableError::PathSetsFull
            | RouteTableError::TableFull => -12,
            _ => -22,
        }
    }
}

impl std::error::Error for RouteTableError {}

impl fmt::Display for RouteTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTableError::InvalidPrefix(s) => {
                write!(f, "expected ADDR/MASK, got '{}'", s)
            }
            RouteTableError::InvalidAddress(s) => {
                write!(f, "expected IP address, got '{}'", s)
            }
            RouteTableError::InvalidPort(s) if s.is_empty() => {
                write!(f, "missing output port")
            }
            RouteTableError::InvalidPort(s) => {
                write!(f, "invalid output port '{}'", s)
            }
            RouteTableError::UnknownCommand(s) => {
                write!(f, "bad command '{}'", s)
            }
            RouteTableError::UnknownMode(s) => {
                write!(
                    f,
                    "mode '{}' unknown, should be single, addr, port or \
                     packet",
                    s
                )
            }
            RouteTableError::ModeMissing => write!(f, "MODE not specified"),
            RouteTableError::EmptyPathSet => {
                write!(f, "a route needs at least one next hop")
            }
            RouteTableError::TooManyPaths => {
                write!(f, "a route can carry at most seven next hops")
            }
            RouteTableError::PathSetsFull => {
                write!(f, "no memory to store route: all 255 path-sets in use")
            }
            RouteTableError::TableFull => {
                write!(f, "no memory to store route: route table full")
            }
            RouteTableError::RouteExists(route) => {
                write!(f, "conflict with existing route '{}'", route)
            }
            RouteTableError::RouteNotFound(route) => {
                write!(f, "route '{}' not found", route)
            }
        }
    }
}
