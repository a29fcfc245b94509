//! # Virtual Mapping Table
//!
//! Copy-on-write media relocate a node on every rewrite, which would force
//! rewriting every ancestor up to the root on every leaf update. Instead,
//! superseded physical ids stay in the parents and this table redirects
//! them: an entry `prev -> curr` means any on-disk pointer naming `prev`
//! must be resolved to `curr` before use.
//!
//! The table is a fixed-capacity open-addressed hash: slot `prev % M`,
//! probe stride 7, bounded probe count. A failed insert is not an error —
//! the tree drains the table by rewriting ancestors (which deletes the
//! mappings they consumed) and retries.

use crate::storage::PageId;
use crate::tree::node::NO_PAGE;

const PROBE_STRIDE: usize = 7;
const MAX_TRIES: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Slot {
    prev: PageId,
    curr: PageId,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapInsert {
    Added,
    /// The entry existed; `curr` was replaced and the superseded target is
    /// returned so the caller can reclaim its physical page.
    Updated { old_curr: PageId },
    /// Probe chain exhausted; the caller must drain the table first.
    Full,
}

pub struct MappingTable {
    slots: Vec<Slot>,
    len: usize,
    max_tries: usize,
    /// Probe comparisons, for diagnostics.
    compares: u64,
}

impl MappingTable {
    /// Builds a table from a byte budget (8 bytes per slot). A zero budget
    /// disables the table: every lookup misses and every insert is `Full`.
    pub fn with_budget(bytes: usize) -> Self {
        let capacity = bytes / 8;
        Self {
            slots: vec![
                Slot {
                    prev: NO_PAGE,
                    curr: NO_PAGE,
                };
                capacity
            ],
            len: 0,
            max_tries: capacity.min(MAX_TRIES),
            compares: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn compares(&self) -> u64 {
        self.compares
    }

    fn probe(&mut self, prev: PageId) -> Option<usize> {
        if self.slots.is_empty() || self.len == 0 {
            return None;
        }
        let mut loc = prev as usize % self.slots.len();
        for _ in 0..self.max_tries {
            self.compares += 1;
            if self.slots[loc].prev == prev {
                return Some(loc);
            }
            loc = (loc + PROBE_STRIDE) % self.slots.len();
        }
        None
    }

    /// Resolves `prev`; identity on miss.
    pub fn resolve(&mut self, prev: PageId) -> PageId {
        self.lookup(prev).unwrap_or(prev)
    }

    /// Current target of `prev`, if a mapping exists.
    pub fn lookup(&mut self, prev: PageId) -> Option<PageId> {
        self.probe(prev).map(|loc| self.slots[loc].curr)
    }

    /// Inserts or updates `prev -> curr`.
    pub fn insert(&mut self, prev: PageId, curr: PageId) -> MapInsert {
        if self.slots.is_empty() {
            return MapInsert::Full;
        }
        debug_assert_ne!(prev, NO_PAGE);
        let mut loc = prev as usize % self.slots.len();
        for _ in 0..self.max_tries {
            self.compares += 1;
            if self.slots[loc].prev == prev {
                let old_curr = self.slots[loc].curr;
                self.slots[loc].curr = curr;
                return MapInsert::Updated { old_curr };
            }
            if self.slots[loc].prev == NO_PAGE {
                self.slots[loc] = Slot { prev, curr };
                self.len += 1;
                return MapInsert::Added;
            }
            loc = (loc + PROBE_STRIDE) % self.slots.len();
        }
        MapInsert::Full
    }

    /// Removes the mapping for `prev`, returning its target. Idempotent.
    pub fn remove(&mut self, prev: PageId) -> Option<PageId> {
        let loc = self.probe(prev)?;
        let curr = self.slots[loc].curr;
        self.slots[loc] = Slot {
            prev: NO_PAGE,
            curr: NO_PAGE,
        };
        self.len -= 1;
        Some(curr)
    }

    /// True if `page` is named as the `prev` of any mapping (its physical
    /// slot must not be reused while that holds).
    pub fn names_prev(&mut self, page: PageId) -> bool {
        self.probe(page).is_some()
    }

    /// Live `(prev, curr)` pairs, for diagnostics and tests.
    pub fn iter(&self) -> impl Iterator<Item = (PageId, PageId)> + '_ {
        self.slots
            .iter()
            .filter(|s| s.prev != NO_PAGE)
            .map(|s| (s.prev, s.curr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_identity_on_miss() {
        let mut table = MappingTable::with_budget(64);
        assert_eq!(table.resolve(13), 13);
        assert_eq!(table.lookup(13), None);
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let mut table = MappingTable::with_budget(64);
        assert_eq!(table.insert(5, 50), MapInsert::Added);
        assert_eq!(table.resolve(5), 50);
        assert_eq!(table.len(), 1);

        assert_eq!(table.insert(5, 51), MapInsert::Updated { old_curr: 50 });
        assert_eq!(table.resolve(5), 51);
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove(5), Some(51));
        assert_eq!(table.resolve(5), 5);
        assert_eq!(table.len(), 0);
        assert_eq!(table.remove(5), None);
    }

    #[test]
    fn colliding_keys_probe_with_stride_seven() {
        // Capacity 8: 3 and 11 hash to the same slot.
        let mut table = MappingTable::with_budget(64);
        assert_eq!(table.insert(3, 30), MapInsert::Added);
        assert_eq!(table.insert(11, 110), MapInsert::Added);
        assert_eq!(table.resolve(3), 30);
        assert_eq!(table.resolve(11), 110);
        assert!(table.names_prev(11));
        assert!(!table.names_prev(4));
    }

    #[test]
    fn exhausted_probe_chain_reports_full() {
        let mut table = MappingTable::with_budget(16); // 2 slots, 2 tries
        assert_eq!(table.insert(0, 1), MapInsert::Added);
        assert_eq!(table.insert(2, 3), MapInsert::Added);
        assert_eq!(table.insert(4, 5), MapInsert::Full);
        // Draining makes room again.
        table.remove(0);
        assert_eq!(table.insert(4, 5), MapInsert::Added);
    }

    #[test]
    fn zero_budget_disables_the_table() {
        let mut table = MappingTable::with_budget(0);
        assert_eq!(table.insert(1, 2), MapInsert::Full);
        assert_eq!(table.resolve(1), 1);
        assert_eq!(table.capacity(), 0);
    }
}
