//! The multi-level radix trie behind the routing table.
//!
//! The trie covers the 32-bit IPv4 address space with a 16-bit first stride
//! and four 4-bit strides below it. Every level is an array-mapped node:
//! a bucket per stride value, holding the key for the prefix that ends
//! exactly on this level's boundary and an optional child node for longer
//! prefixes. Prefixes that end *inside* a level (their length does not
//! fall on a stride boundary) live in the level's implicit binary tree:
//! heap positions `[2, 2n)` over the `n` buckets, leaves at `[n, 2n)`,
//! shorter in-level prefixes at their ancestor positions.
//!
//! Instead of keeping those ancestor positions authoritative at lookup
//! time, every mutation propagates its key down to all covered positions
//! that still carry the overwritten value. Lookups then only ever consult
//! leaf buckets on their way down, which keeps the descent a plain
//! five-step array walk.

use std::num::NonZeroU32;

use crate::types::Ipv4Net;

const LEVELS: usize = 5;

// Bits of the address left of each level's buckets, and the bucket count
// per level. 2^16 * (2^4)^4 = 2^32.
const SHIFT: [u32; LEVELS] = [16, 12, 8, 4, 0];
const BUCKETS: [usize; LEVELS] = [65536, 16, 16, 16, 16];

//------------ CombinedKey ---------------------------------------------------

/// The value stored in the trie for an installed prefix: a 24-bit route
/// slot key and an 8-bit path-set key packed into one non-zero word.
///
/// Both halves are 1-based, so a packed key can never be zero and the
/// in-node representation can use a plain `u32` with zero for "empty".
/// That packing never leaks out of this module: the trie API speaks
/// `Option<CombinedKey>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CombinedKey(NonZeroU32);

impl CombinedKey {
    const SLOT_MASK: u32 = 0x00ff_ffff;

    pub(crate) fn new(slot: u32, path: u8) -> Self {
        debug_assert!(slot >= 1 && slot <= Self::SLOT_MASK);
        debug_assert!(path >= 1);
        let raw = (u32::from(path) << 24) | slot;
        CombinedKey(NonZeroU32::new(raw).expect("slot keys are 1-based"))
    }

    /// The 1-based route slot key.
    pub(crate) fn slot(self) -> u32 {
        self.0.get() & Self::SLOT_MASK
    }

    /// The 1-based path-set key.
    pub(crate) fn path(self) -> u8 {
        (self.0.get() >> 24) as u8
    }

    fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(CombinedKey)
    }

    fn raw(self) -> u32 {
        self.0.get()
    }
}

//------------ RadixNode -----------------------------------------------------

#[derive(Default)]
struct Child {
    key: u32,
    child: Option<Box<RadixNode>>,
}

struct RadixNode {
    // One bucket per stride value; leaf positions of the implicit tree.
    children: Box<[Child]>,
    // Keys for the inner positions [2, n); index shifted down by two.
    inner: Box<[u32]>,
}

impl RadixNode {
    fn new(level: usize) -> Self {
        let n = BUCKETS[level];
        RadixNode {
            children: std::iter::repeat_with(Child::default)
                .take(n)
                .collect(),
            inner: vec![0; n - 2].into_boxed_slice(),
        }
    }

    // Key at heap position i, i in [2, 2n).
    fn key_at(&self, i: usize) -> u32 {
        let n = self.children.len();
        debug_assert!(i >= 2 && i < 2 * n);
        if i >= n {
            self.children[i - n].key
        } else {
            self.inner[i - 2]
        }
    }

    fn set_key_at(&mut self, i: usize, key: u32) {
        let n = self.children.len();
        debug_assert!(i >= 2 && i < 2 * n);
        if i >= n {
            self.children[i - n].key = key;
        } else {
            self.inner[i - 2] = key;
        }
    }

    // The heap position encoding (addr, mask) within this level, assuming
    // the mask ends here. Starts at the leaf bucket and climbs one step
    // per missing mask bit.
    fn position(&self, addr: u32, mask: u32, level: usize) -> usize {
        let n = self.children.len();
        let shift = SHIFT[level];
        let mut i = n + (((addr >> shift) as usize) & (n - 1));
        let nmasked = n - (((mask >> shift) as usize) & (n - 1));
        let mut x = nmasked;
        while x > 1 {
            x /= 2;
            i /= 2;
        }
        i
    }

    /// Installs, replaces or clears the key for a prefix.
    ///
    /// Returns the key the prefix carried before, zero if it had none.
    /// Positions that were merely inheriting an ancestor's key count as
    /// carrying none. With `set` false an occupied position is left
    /// untouched (the caller sees the conflict in the return value).
    ///
    /// Clearing (`key == 0`) rewrites the subtree to the ancestor's key so
    /// covered positions fall back to the next-shorter prefix.
    fn change(
        &mut self,
        addr: u32,
        mask: u32,
        key: u32,
        set: bool,
        level: usize,
    ) -> u32 {
        let shift = SHIFT[level];
        let n = self.children.len();

        // Mask bits below this stride: the prefix belongs to a deeper
        // level.
        if mask & ((1u32 << shift) - 1) != 0 {
            let b = ((addr >> shift) as usize) & (n - 1);
            let child = self.children[b]
                .child
                .get_or_insert_with(|| Box::new(RadixNode::new(level + 1)));
            return child.change(addr, mask, key, set, level + 1);
        }

        let mut i = self.position(addr, mask, level);
        let replace_key = self.key_at(i);
        let mut prev_key = replace_key;
        if prev_key != 0 && i > 3 && self.key_at(i / 2) == prev_key {
            prev_key = 0;
        }

        let mut key = key;
        if key == 0 && i > 3 {
            key = self.key_at(i / 2);
        }

        if prev_key != key && (prev_key == 0 || set) {
            // Sweep the subtree under i, one row of the implicit tree at
            // a time, refreshing every position that still carried the
            // replaced value.
            let mut width = 1;
            while i < 2 * n {
                for x in i..i + width {
                    if self.key_at(x) == replace_key {
                        self.set_key_at(x, key);
                    }
                }
                i *= 2;
                width *= 2;
            }
        }
        prev_key
    }

    // Read-only twin of the dry-run `change(key=0, set=false)`: the key a
    // prefix carries itself, not counting inherited ancestor keys. Never
    // allocates child nodes.
    fn peek(&self, addr: u32, mask: u32, level: usize) -> u32 {
        let shift = SHIFT[level];
        let n = self.children.len();

        if mask & ((1u32 << shift) - 1) != 0 {
            let b = ((addr >> shift) as usize) & (n - 1);
            return match &self.children[b].child {
                Some(child) => child.peek(addr, mask, level + 1),
                None => 0,
            };
        }

        let i = self.position(addr, mask, level);
        let key = self.key_at(i);
        if key != 0 && i > 3 && self.key_at(i / 2) == key {
            0
        } else {
            key
        }
    }
}

//------------ RadixTrie -----------------------------------------------------

/// Maps IPv4 prefixes to [CombinedKey]s with longest-prefix-match
/// semantics. The default route is not representable here; the table
/// keeps it next to the trie and feeds it into [RadixTrie::walk] as the
/// fallback answer.
pub(crate) struct RadixTrie {
    root: Box<RadixNode>,
}

impl Default for RadixTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl RadixTrie {
    pub(crate) fn new() -> Self {
        RadixTrie {
            root: Box::new(RadixNode::new(0)),
        }
    }

    /// Longest-prefix-match descent. Returns the key of the longest
    /// installed prefix covering `addr`, or `None` when no prefix covers
    /// it.
    pub(crate) fn walk(&self, addr: u32) -> Option<CombinedKey> {
        let mut cur = 0u32;
        let mut node: Option<&RadixNode> = Some(&self.root);
        let mut level = 0;
        while let Some(r) = node {
            let n = r.children.len();
            let c = &r.children[((addr >> SHIFT[level]) as usize) & (n - 1)];
            if c.key != 0 {
                cur = c.key;
            }
            node = c.child.as_deref();
            level += 1;
        }
        CombinedKey::from_raw(cur)
    }

    /// Installs `key` for a non-default prefix, returning the previously
    /// installed key if the prefix already carried one. Without
    /// `overwrite` an occupied prefix is left untouched; the caller
    /// decides whether the returned incumbent is a conflict.
    pub(crate) fn update(
        &mut self,
        net: Ipv4Net,
        key: CombinedKey,
        overwrite: bool,
    ) -> Option<CombinedKey> {
        debug_assert!(!net.is_default());
        let prev = self.root.change(
            net.addr_u32(),
            net.mask_u32(),
            key.raw(),
            overwrite,
            0,
        );
        CombinedKey::from_raw(prev)
    }

    /// Removes the key for a non-default prefix, returning it. Covered
    /// positions fall back to the longest remaining shorter prefix.
    pub(crate) fn clear(&mut self, net: Ipv4Net) -> Option<CombinedKey> {
        debug_assert!(!net.is_default());
        let prev =
            self.root.change(net.addr_u32(), net.mask_u32(), 0, true, 0);
        CombinedKey::from_raw(prev)
    }

    /// The key a prefix itself carries, if any. Read-only; inherited
    /// ancestor keys do not count.
    pub(crate) fn peek(&self, net: Ipv4Net) -> Option<CombinedKey> {
        debug_assert!(!net.is_default());
        CombinedKey::from_raw(self.root.peek(
            net.addr_u32(),
            net.mask_u32(),
            0,
        ))
    }
}
