//! The routing table proper: slotted route storage, the deduplicated
//! path-set pool, and the mutation API tying them to the radix trie.

use std::net::Ipv4Addr;

use log::trace;

use crate::radix::{CombinedKey, RadixTrie};
use crate::types::{
    Ipv4Net, NextHop, PathSet, Route, RouteTableError,
};

// The trie packs route slot keys into 24 bits.
const MAX_ROUTES: u32 = (1 << 24) - 1;
// ...and path-set keys into the remaining 8.
const MAX_PATH_SETS: usize = 255;

//------------ RouteArena ----------------------------------------------------

// Dense, slotted storage for installed routes. Slots freed by a removal
// or replacement are chained into a free list and handed out again first.
// Slot keys are 1-based so they pack into a [CombinedKey].
enum Slot {
    Occupied(Route),
    Vacant { next: Option<u32> },
}

#[derive(Default)]
struct RouteArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    free_len: u32,
}

impl RouteArena {
    // The key the next `alloc` will hand out. Mutations reserve this
    // before touching the trie so the trie never points at a slot that
    // cannot be committed afterwards.
    fn next_key(&self) -> Result<u32, RouteTableError> {
        match self.free_head {
            Some(i) => Ok(i + 1),
            None => {
                let key = self.slots.len() as u32 + 1;
                if key > MAX_ROUTES {
                    return Err(RouteTableError::TableFull);
                }
                Ok(key)
            }
        }
    }

    fn alloc(&mut self, route: Route) -> u32 {
        match self.free_head {
            Some(i) => {
                let slot =
                    std::mem::replace(&mut self.slots[i as usize], Slot::Occupied(route));
                self.free_head = match slot {
                    Slot::Vacant { next } => next,
                    Slot::Occupied(_) => {
                        unreachable!("free list points at an occupied slot")
                    }
                };
                self.free_len -= 1;
                i + 1
            }
            None => {
                self.slots.push(Slot::Occupied(route));
                self.slots.len() as u32
            }
        }
    }

    fn free(&mut self, key: u32) -> Route {
        let i = (key - 1) as usize;
        let slot = std::mem::replace(
            &mut self.slots[i],
            Slot::Vacant {
                next: self.free_head,
            },
        );
        self.free_head = Some(key - 1);
        self.free_len += 1;
        match slot {
            Slot::Occupied(route) => route,
            Slot::Vacant { .. } => {
                unreachable!("trie key points at a vacant slot")
            }
        }
    }

    fn get(&self, key: u32) -> &Route {
        match &self.slots[(key - 1) as usize] {
            Slot::Occupied(route) => route,
            Slot::Vacant { .. } => {
                unreachable!("trie key points at a vacant slot")
            }
        }
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free_len as usize
    }

    fn iter_live(&self) -> impl Iterator<Item = &Route> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(route) => Some(route),
            Slot::Vacant { .. } => None,
        })
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free_head = None;
        self.free_len = 0;
    }
}

//------------ PathSetPool ---------------------------------------------------

// Append-only pool of distinct path-sets. Routes sharing the same hops in
// the same order share one entry; entries are never dropped individually,
// only by `flush`. Keys are 1-based and at most 255, the width of the
// path half of a [CombinedKey].
#[derive(Default)]
struct PathSetPool {
    sets: Vec<PathSet>,
}

// Outcome of probing the pool: the set is either already interned or
// would be appended under the returned key. Probing commits nothing, so
// a mutation can still fail without leaving a stray pool entry behind.
#[derive(Clone, Copy)]
enum Interned {
    Existing(u8),
    New(u8),
}

impl Interned {
    fn key(self) -> u8 {
        match self {
            Interned::Existing(key) | Interned::New(key) => key,
        }
    }
}

impl PathSetPool {
    fn probe(&self, paths: &PathSet) -> Result<Interned, RouteTableError> {
        for (i, set) in self.sets.iter().enumerate() {
            if set == paths {
                return Ok(Interned::Existing(i as u8 + 1));
            }
        }
        if self.sets.len() == MAX_PATH_SETS {
            return Err(RouteTableError::PathSetsFull);
        }
        Ok(Interned::New(self.sets.len() as u8 + 1))
    }

    fn commit(&mut self, interned: Interned, paths: &PathSet) -> u8 {
        match interned {
            Interned::Existing(key) => key,
            Interned::New(key) => {
                self.sets.push(*paths);
                debug_assert_eq!(self.sets.len(), usize::from(key));
                key
            }
        }
    }

    fn get(&self, key: u8) -> &PathSet {
        &self.sets[usize::from(key) - 1]
    }

    fn len(&self) -> usize {
        self.sets.len()
    }

    fn clear(&mut self) {
        self.sets.clear();
    }
}

//------------ RadixIpLookup -------------------------------------------------

/// A multipath IPv4 routing table.
///
/// Routes are installed per prefix and may carry up to seven gateway/port
/// pairs. [RadixIpLookup::lookup_route] performs longest-prefix-match on
/// a destination address and picks one hop out of the matched route's
/// path-set with the caller-supplied flow hash, so packets with equal
/// hashes stick to one path while distinct flows spread out.
///
/// The table is a single-writer structure: wrap it in a reader-writer
/// lock (as [crate::MpathRouter] does) if lookups must run concurrently
/// with mutations.
#[derive(Default)]
pub struct RadixIpLookup {
    routes: RouteArena,
    path_sets: PathSetPool,
    default_key: Option<CombinedKey>,
    trie: RadixTrie,
}

impl RadixIpLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a route. With `overwrite` an existing route for the same
    /// prefix is replaced and returned; without it the call fails with
    /// [RouteTableError::RouteExists] and changes nothing.
    pub fn add_route(
        &mut self,
        route: Route,
        overwrite: bool,
    ) -> Result<Option<Route>, RouteTableError> {
        if route.paths.is_empty() {
            return Err(RouteTableError::EmptyPathSet);
        }

        // Reserve a slot key and probe the pool before touching the trie;
        // all capacity failures happen while the table is still
        // untouched.
        let slot_key = self.routes.next_key()?;
        let interned = self.path_sets.probe(&route.paths)?;
        let combined = CombinedKey::new(slot_key, interned.key());

        let prev = if route.net.is_default() {
            let prev = self.default_key;
            if prev.is_none() || overwrite {
                self.default_key = Some(combined);
            }
            prev
        } else {
            self.trie.update(route.net, combined, overwrite)
        };

        let old = prev.map(|key| self.routes.get(key.slot()).clone());
        if let Some(old) = old.as_ref() {
            if !overwrite {
                return Err(RouteTableError::RouteExists(Box::new(
                    old.clone(),
                )));
            }
        }

        self.path_sets.commit(interned, &route.paths);
        trace!("installing route {}", route);
        let committed = self.routes.alloc(route);
        debug_assert_eq!(committed, slot_key);
        if let Some(prev) = prev {
            self.routes.free(prev.slot());
        }
        Ok(old)
    }

    /// Removes the route for `route.net` and returns it. The prefix must
    /// match an installed route exactly; the hops of the pattern are not
    /// compared.
    pub fn remove_route(
        &mut self,
        route: &Route,
    ) -> Result<Route, RouteTableError> {
        let prev = if route.net.is_default() {
            self.default_key
        } else {
            self.trie.peek(route.net)
        };
        let prev = match prev {
            Some(key) if self.routes.get(key.slot()).net == route.net => key,
            _ => {
                return Err(RouteTableError::RouteNotFound(Box::new(
                    route.clone(),
                )))
            }
        };

        let old = self.routes.free(prev.slot());
        if route.net.is_default() {
            self.default_key = None;
        } else {
            self.trie.clear(route.net);
        }
        trace!("removed route {}", old);
        Ok(old)
    }

    /// Longest-prefix-match lookup. The flow hash selects one hop out of
    /// the matched route's path-set; equal hashes select equal hops.
    pub fn lookup_route(
        &self,
        addr: Ipv4Addr,
        hash: u32,
    ) -> Option<NextHop> {
        let combined =
            self.trie.walk(u32::from(addr)).or(self.default_key)?;
        let paths = self.path_sets.get(combined.path());
        let hop = paths.get(hash as usize % paths.len());
        debug_assert!(hop.is_some(), "interned path-sets are never empty");
        hop.copied()
    }

    /// Drops every route and resets the table to its freshly-created
    /// state.
    pub fn flush(&mut self) {
        self.routes.clear();
        self.path_sets.clear();
        self.default_key = None;
        self.trie = RadixTrie::new();
    }

    /// Renders the table, one route per line in arena order.
    pub fn dump_routes(&self) -> String {
        let mut out = String::new();
        for route in self.routes.iter_live() {
            out.push_str(&route.unparse(true));
            out.push('\n');
        }
        out
    }

    /// The number of installed routes.
    pub fn route_count(&self) -> usize {
        self.routes.live()
    }

    /// The number of distinct path-sets referenced since the last flush.
    pub fn path_set_count(&self) -> usize {
        self.path_sets.len()
    }

    //--- Single-path compatibility surface ----------------------------------

    /// Installs a single-hop route; the façade over [Self::add_route]
    /// for callers that predate multipath. Returns the first hop of any
    /// replaced route.
    pub fn add_route_single(
        &mut self,
        net: Ipv4Net,
        hop: NextHop,
        overwrite: bool,
    ) -> Result<Option<NextHop>, RouteTableError> {
        let mut paths = PathSet::new();
        paths.push(hop)?;
        let old = self.add_route(Route::new(net, paths), overwrite)?;
        Ok(old.and_then(|route| route.paths.first().copied()))
    }

    /// Removes the route for `net`, returning the first hop it carried.
    pub fn remove_route_single(
        &mut self,
        net: Ipv4Net,
    ) -> Result<Option<NextHop>, RouteTableError> {
        let old = self.remove_route(&Route::new(net, PathSet::new()))?;
        Ok(old.paths.first().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(line: &str) -> Route {
        line.parse().unwrap()
    }

    fn hop(table: &RadixIpLookup, addr: &str) -> Option<NextHop> {
        table.lookup_route(addr.parse().unwrap(), 0)
    }

    fn arena_invariant(table: &RadixIpLookup) {
        // Walk the free list explicitly; live plus chained slots must
        // cover the arena exactly.
        let mut chained = 0;
        let mut cursor = table.routes.free_head;
        while let Some(i) = cursor {
            chained += 1;
            cursor = match &table.routes.slots[i as usize] {
                Slot::Vacant { next } => *next,
                Slot::Occupied(_) => panic!("free list hit a live slot"),
            };
        }
        assert_eq!(chained, table.routes.free_len);
        assert_eq!(
            table.routes.live() + chained as usize,
            table.routes.slots.len()
        );
    }

    #[test]
    fn add_remove_lookup() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false)?;
        table.add_route(route("10.1.0.0/16 - 2"), false)?;
        assert_eq!(hop(&table, "10.1.2.3").unwrap().port, 2);
        assert_eq!(hop(&table, "10.2.2.3").unwrap().port, 1);
        assert_eq!(hop(&table, "11.0.0.1"), None);

        let old = table.remove_route(&route("10.1.0.0/16 - 2"))?;
        assert_eq!(old.paths.first().unwrap().port, 2);
        assert_eq!(hop(&table, "10.1.2.3").unwrap().port, 1);
        arena_invariant(&table);
        Ok(())
    }

    #[test]
    fn remove_missing_is_an_error() {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false).unwrap();
        // A different prefix length under the same key path must not
        // match.
        assert!(matches!(
            table.remove_route(&Route::parse("10.0.0.0/16", true).unwrap()),
            Err(RouteTableError::RouteNotFound(_))
        ));
        assert!(matches!(
            table.remove_route(&Route::parse("99.0.0.0/8", true).unwrap()),
            Err(RouteTableError::RouteNotFound(_))
        ));
    }

    #[test]
    fn slots_are_recycled() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false)?;
        table.add_route(route("11.0.0.0/8 - 2"), false)?;
        table.remove_route(&route("10.0.0.0/8 - 1"))?;
        arena_invariant(&table);
        assert_eq!(table.routes.slots.len(), 2);

        // The freed slot is handed out again before the arena grows.
        table.add_route(route("12.0.0.0/8 - 3"), false)?;
        assert_eq!(table.routes.slots.len(), 2);
        assert_eq!(table.route_count(), 2);
        arena_invariant(&table);
        Ok(())
    }

    #[test]
    fn replace_frees_the_displaced_slot() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false)?;
        let old = table.add_route(route("10.0.0.0/8 - 2"), true)?;
        assert_eq!(old.unwrap().paths.first().unwrap().port, 1);
        assert_eq!(table.route_count(), 1);
        assert_eq!(hop(&table, "10.0.0.1").unwrap().port, 2);
        arena_invariant(&table);
        Ok(())
    }

    #[test]
    fn conflicting_add_changes_nothing() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false)?;
        let before = table.dump_routes();
        let err = table
            .add_route(route("10.0.0.0/8 - 2"), false)
            .unwrap_err();
        match err {
            RouteTableError::RouteExists(existing) => {
                assert_eq!(existing.paths.first().unwrap().port, 1)
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(table.dump_routes(), before);
        assert_eq!(hop(&table, "10.0.0.1").unwrap().port, 1);
        // The probed path-set of the failed add must not linger in the
        // pool.
        assert_eq!(table.path_set_count(), 1);
        arena_invariant(&table);
        Ok(())
    }

    #[test]
    fn default_route_semantics() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("0.0.0.0/0 192.168.1.1 0"), false)?;
        let hop = hop(&table, "8.8.8.8").unwrap();
        assert_eq!(hop.port, 0);
        assert_eq!(hop.gw, Some("192.168.1.1".parse().unwrap()));

        assert!(matches!(
            table.add_route(route("0.0.0.0/0 - 1"), false),
            Err(RouteTableError::RouteExists(_))
        ));
        table.add_route(route("0.0.0.0/0 - 1"), true)?;
        assert_eq!(table.lookup_route("8.8.8.8".parse().unwrap(), 0).unwrap().port, 1);

        table.remove_route(&Route::parse("0.0.0.0/0", true).unwrap())?;
        assert_eq!(table.lookup_route("8.8.8.8".parse().unwrap(), 0), None);
        Ok(())
    }

    #[test]
    fn path_sets_are_interned() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1 - 2"), false)?;
        table.add_route(route("11.0.0.0/8 - 1 - 2"), false)?;
        assert_eq!(table.path_set_count(), 1);

        // Order matters: the reversed set is a different entry.
        table.add_route(route("12.0.0.0/8 - 2 - 1"), false)?;
        assert_eq!(table.path_set_count(), 2);
        Ok(())
    }

    #[test]
    fn path_set_pool_exhausts_at_255() {
        let mut table = RadixIpLookup::new();
        for port in 0..255 {
            let line = format!("10.{}.0.0/16 - {}", port, port);
            table.add_route(route(&line), false).unwrap();
        }
        assert_eq!(table.path_set_count(), 255);
        let before = table.dump_routes();
        assert!(matches!(
            table.add_route(route("11.0.0.0/8 - 999"), false),
            Err(RouteTableError::PathSetsFull)
        ));
        // The failure must leave the table untouched.
        assert_eq!(table.dump_routes(), before);
        // Reusing an interned set still works.
        table.add_route(route("11.0.0.0/8 - 7"), false).unwrap();
        assert_eq!(table.path_set_count(), 255);
    }

    #[test]
    fn empty_path_set_is_rejected() {
        let mut table = RadixIpLookup::new();
        let pattern = Route::parse("10.0.0.0/8", true).unwrap();
        assert!(matches!(
            table.add_route(pattern, false),
            Err(RouteTableError::EmptyPathSet)
        ));
    }

    #[test]
    fn flush_empties_everything() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false)?;
        table.add_route(route("0.0.0.0/0 - 2"), false)?;
        table.flush();
        assert_eq!(table.route_count(), 0);
        assert_eq!(table.path_set_count(), 0);
        assert_eq!(hop(&table, "10.0.0.1"), None);
        assert_eq!(hop(&table, "8.8.8.8"), None);
        assert_eq!(table.dump_routes(), "");
        Ok(())
    }

    #[test]
    fn dump_shows_live_routes_in_slot_order() -> Result<(), RouteTableError>
    {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/8 - 1"), false)?;
        table.add_route(route("11.0.0.0/8 10.0.0.1 2"), false)?;
        table.remove_route(&Route::parse("10.0.0.0/8", true).unwrap())?;
        assert_eq!(table.dump_routes(), "11.0.0.0/8\t\t10.0.0.1\t2\n");
        Ok(())
    }

    #[test]
    fn single_path_bridge() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        let net: Ipv4Net = "10.0.0.0/8".parse()?;
        table.add_route_single(net, NextHop::new(None, 1), false)?;
        let old =
            table.add_route_single(net, NextHop::new(None, 2), true)?;
        assert_eq!(old, Some(NextHop::new(None, 1)));
        let removed = table.remove_route_single(net)?;
        assert_eq!(removed, Some(NextHop::new(None, 2)));
        assert_eq!(hop(&table, "10.0.0.1"), None);
        Ok(())
    }

    #[test]
    fn multipath_hash_selects_hops_in_order() -> Result<(), RouteTableError>
    {
        let mut table = RadixIpLookup::new();
        table.add_route(route("10.0.0.0/24 - 1 - 2 - 3"), false)?;
        let addr: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert_eq!(table.lookup_route(addr, 0).unwrap().port, 1);
        assert_eq!(table.lookup_route(addr, 1).unwrap().port, 2);
        assert_eq!(table.lookup_route(addr, 2).unwrap().port, 3);
        assert_eq!(table.lookup_route(addr, 3).unwrap().port, 1);
        Ok(())
    }
}
