//! The dataplane-facing routing element.
//!
//! [MpathRouter] wraps the routing table with everything the host
//! framework interacts with: positional configuration, the handler
//! surface for runtime control, and the per-packet processing path. The
//! table sits behind a reader-writer lock so packet processing may run
//! concurrently with (rare) handler writes.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use parking_lot::RwLock;

use crate::ctrl::{run_command, run_script, CmdKind};
use crate::flow::{flow_hash, FlowPacket, HashMode};
use crate::table::RadixIpLookup;
use crate::types::{Route, RouteTableError};

// No-route events are worth a warning, but not one per packet.
const MAX_NO_ROUTE_COMPLAINTS: usize = 5;

//------------ MpathRouter ---------------------------------------------------

/// A multipath IPv4 routing element.
///
/// Looks up each packet's destination address, longest-prefix-match,
/// rewrites the destination annotation with the route's gateway when one
/// is configured, and reports the output port to forward the packet on.
/// Routes with several hops are spread by the configured [HashMode].
pub struct MpathRouter {
    mode: HashMode,
    salt: u32,
    noutputs: usize,
    table: RwLock<RadixIpLookup>,
    no_route_complaints: AtomicUsize,
}

impl MpathRouter {
    /// Creates an empty element with a freshly drawn hash salt.
    pub fn new(mode: HashMode, noutputs: usize) -> Self {
        debug!("creating multipath router, mode {:?}", mode);
        MpathRouter {
            mode,
            salt: rand::random(),
            noutputs,
            table: RwLock::new(RadixIpLookup::new()),
            no_route_complaints: AtomicUsize::new(0),
        }
    }

    /// Configures an element from positional arguments: the hash mode
    /// followed by any number of initial `ADDR/MASK [GW] PORT ...`
    /// routes.
    ///
    /// An unrecognised mode falls back to [HashMode::Packet] with a
    /// warning. Routes are installed in order; a route for an already
    /// installed prefix is dropped with a warning rather than replacing
    /// the incumbent. The last hard error, if any, is returned after all
    /// arguments have been tried.
    pub fn configure(
        conf: &[&str],
        noutputs: usize,
    ) -> Result<Self, RouteTableError> {
        let (mode, routes) = match conf.split_first() {
            Some((mode, routes)) => (*mode, routes),
            None => return Err(RouteTableError::ModeMissing),
        };
        let mode = match mode.parse::<HashMode>() {
            Ok(mode) => mode,
            Err(err) => {
                warn!("{}; falling back to packet mode", err);
                HashMode::Packet
            }
        };

        let router = Self::new(mode, noutputs);
        let mut duplicates = 0;
        let mut result = Ok(());
        {
            let mut table = router.table.write();
            for (i, arg) in routes.iter().enumerate() {
                let added = Route::parse(arg, false)
                    .and_then(|route| table.add_route(route, false));
                match added {
                    Ok(_) => {}
                    Err(RouteTableError::RouteExists(_)) => duplicates += 1,
                    Err(err) => {
                        warn!("route argument {}: {}", i + 2, err);
                        result = Err(err);
                    }
                }
            }
        }
        if duplicates > 0 {
            warn!(
                "{} route{} kept over later duplicates",
                duplicates,
                if duplicates == 1 { "" } else { "s" }
            );
        }
        result.map(|()| router)
    }

    pub fn mode(&self) -> HashMode {
        self.mode
    }

    pub fn noutputs(&self) -> usize {
        self.noutputs
    }

    //--- Packet path --------------------------------------------------------

    /// Routes one packet: returns the output port to emit it on, or
    /// `None` when no route matches and the packet should be dropped.
    ///
    /// On a match with a configured gateway the packet's destination
    /// annotation is rewritten before the port is returned.
    ///
    /// # Panics
    ///
    /// Panics if the selected route names a port outside this element's
    /// output range; installing such a route is a configuration bug.
    pub fn process<P: FlowPacket>(&self, pkt: &mut P) -> Option<usize> {
        let hash = flow_hash(self.mode, self.salt, pkt);
        let dst = pkt.dst_ip();
        match self.table.read().lookup_route(dst, hash) {
            Some(hop) => {
                let port = hop.port as usize;
                assert!(
                    port < self.noutputs,
                    "route for {} names port {} but the element has {} \
                     outputs",
                    dst,
                    hop.port,
                    self.noutputs
                );
                if let Some(gw) = hop.gw {
                    pkt.set_dst_ip(gw);
                }
                Some(port)
            }
            None => {
                let complaints = self
                    .no_route_complaints
                    .fetch_add(1, Ordering::Relaxed);
                if complaints < MAX_NO_ROUTE_COMPLAINTS {
                    warn!("no route for {}", dst);
                }
                None
            }
        }
    }

    //--- Handlers -----------------------------------------------------------

    /// The `add` write handler: installs one route, failing on a
    /// duplicate prefix.
    pub fn add(&self, conf: &str) -> Result<(), RouteTableError> {
        run_command(&mut self.table.write(), CmdKind::Add, conf, None)
    }

    /// The `set` write handler: installs one route, replacing any
    /// incumbent.
    pub fn set(&self, conf: &str) -> Result<(), RouteTableError> {
        run_command(&mut self.table.write(), CmdKind::Set, conf, None)
    }

    /// The `setm` write handler, an alias of [Self::set].
    pub fn setm(&self, conf: &str) -> Result<(), RouteTableError> {
        self.set(conf)
    }

    /// The `remove` write handler: removes one prefix.
    pub fn remove(&self, conf: &str) -> Result<(), RouteTableError> {
        run_command(&mut self.table.write(), CmdKind::Remove, conf, None)
    }

    /// The `ctrl` write handler: applies a whole `add`/`set`/`setm`/
    /// `remove` script atomically. The first failing line rolls back
    /// every line before it.
    pub fn ctrl(&self, script: &str) -> Result<(), RouteTableError> {
        run_script(&mut self.table.write(), script)
    }

    /// The `flush` write handler: drops all routes.
    pub fn flush(&self) {
        self.table.write().flush()
    }

    /// The `table` read handler: the current table, one route per line.
    pub fn table(&self) -> String {
        self.table.read().dump_routes()
    }

    /// The `lookup` read handler: resolves one address and renders
    /// `"PORT"` or `"PORT GW"`, with port `-1` when nothing matches.
    pub fn lookup(&self, addr: &str) -> Result<String, RouteTableError> {
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| {
            RouteTableError::InvalidAddress(addr.trim().to_string())
        })?;
        Ok(match self.table.read().lookup_route(addr, 0) {
            Some(hop) => match hop.gw {
                Some(gw) => format!("{} {}", hop.port, gw),
                None => hop.port.to_string(),
            },
            None => "-1".to_string(),
        })
    }

    /// Runs a closure with shared access to the underlying table, for
    /// callers that need more than the handler surface exposes.
    pub fn with_table<R>(&self, f: impl FnOnce(&RadixIpLookup) -> R) -> R {
        f(&self.table.read())
    }
}
