//! # Range Iteration
//!
//! Ascending iteration over `[min, max]`, both bounds optional and
//! inclusive. The iterator borrows the tree mutably (reads go through the
//! page buffer), holds page ids and indices only, and re-reads frames on
//! every step — never a frame pointer across a buffer call.
//!
//! Sorted layouts walk a recorded per-level child index path: when a leaf
//! is exhausted the iterator ascends to the first ancestor with a next
//! sibling and descends its leftmost spine.
//!
//! Overwrite-layout pages are unsorted on disk (by design — see the node
//! codec), so index order means nothing there. Within a leaf the iterator
//! repeatedly selects the smallest live key greater than the last one
//! returned; when the leaf is exhausted it re-seeks from the root for the
//! leaf's coverage bound, which is exactly the routing key of the pair the
//! descent chose at the leaf's parent.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::storage::PageId;
use crate::tree::node::{is_max_key, NodeRef};
use crate::tree::tree::{PathVec, Tree, MAX_TREE_HEIGHT};

/// Inclusive iteration bounds; `None` means unbounded on that side.
#[derive(Debug, Default, Clone, Copy)]
pub struct IterBounds<'k> {
    pub min: Option<&'k [u8]>,
    pub max: Option<&'k [u8]>,
}

enum IterState {
    /// Sorted layouts: recorded descent with per-level child indices.
    Indexed {
        pages: PathVec,
        idxs: SmallVec<[usize; MAX_TREE_HEIGHT]>,
        leaf: PageId,
        leaf_idx: usize,
    },
    /// Overwrite layout: seek key, re-descending between leaves.
    Seek {
        cursor: Vec<u8>,
        include_equal: bool,
    },
    Done,
}

pub struct TreeIterator<'t> {
    tree: &'t mut Tree,
    min: Option<Vec<u8>>,
    max: Option<Vec<u8>>,
    /// Scratch for the current leaf's coverage bound (seek mode).
    bound: Vec<u8>,
    state: IterState,
}

impl Tree {
    /// Positions an iterator at the smallest key `>= bounds.min`.
    pub fn iter(&mut self, bounds: IterBounds<'_>) -> Result<TreeIterator<'_>> {
        let key_size = self.layout().key_size;
        if let Some(min) = bounds.min {
            ensure!(min.len() == key_size, "min key size mismatch");
        }
        if let Some(max) = bounds.max {
            ensure!(max.len() == key_size, "max key size mismatch");
        }
        let min = bounds.min.map(|k| k.to_vec());
        let max = bounds.max.map(|k| k.to_vec());

        let state = if self.layout().mode.overwrite_layout() {
            let cursor = min.clone().unwrap_or_else(|| vec![0; key_size]);
            IterState::Seek {
                cursor,
                include_equal: true,
            }
        } else {
            self.indexed_start(min.as_deref())?
        };

        Ok(TreeIterator {
            tree: self,
            min,
            max,
            bound: vec![0; key_size],
            state,
        })
    }

    /// Records the descent toward `min` (leftmost spine when unbounded).
    fn indexed_start(&mut self, min: Option<&[u8]>) -> Result<IterState> {
        let (buffer, layout, mappings, levels, root) = self.iter_parts();
        let mut pages = PathVec::new();
        let mut idxs = SmallVec::new();
        let mut next = root;

        for _ in 0..levels - 1 {
            let frame = buffer.read(next)?;
            let child_idx = {
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                min.map_or(0, |k| node.interior_child_index(k))
            };
            let child = {
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                node.child_at(child_idx)
            };
            pages.push(next);
            idxs.push(child_idx);
            next = mappings.resolve(child);
        }

        let leaf_idx = match min {
            None => 0,
            Some(k) => {
                let frame = buffer.read(next)?;
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                match node.leaf_predecessor(k) {
                    Some(p) if (layout.compare)(node.key_at(p), k) == std::cmp::Ordering::Equal => p,
                    Some(p) => p + 1,
                    None => 0,
                }
            }
        };
        Ok(IterState::Indexed {
            pages,
            idxs,
            leaf: next,
            leaf_idx,
        })
    }
}

impl TreeIterator<'_> {
    /// Copies the next in-range record into the output buffers. Returns
    /// `false` once the range is exhausted.
    pub fn next(&mut self, key_out: &mut [u8], data_out: &mut [u8]) -> Result<bool> {
        let (key_size, data_size) = {
            let layout = self.tree.layout();
            (layout.key_size, layout.data_size)
        };
        ensure!(key_out.len() >= key_size, "key buffer too small");
        ensure!(data_out.len() >= data_size, "data buffer too small");

        match std::mem::replace(&mut self.state, IterState::Done) {
            IterState::Done => Ok(false),
            IterState::Indexed {
                pages,
                idxs,
                leaf,
                leaf_idx,
            } => self.next_indexed(pages, idxs, leaf, leaf_idx, key_out, data_out),
            IterState::Seek {
                cursor,
                include_equal,
            } => self.next_seek(cursor, include_equal, key_out, data_out),
        }
    }

    fn next_indexed(
        &mut self,
        mut pages: PathVec,
        mut idxs: SmallVec<[usize; MAX_TREE_HEIGHT]>,
        mut leaf: PageId,
        mut leaf_idx: usize,
        key_out: &mut [u8],
        data_out: &mut [u8],
    ) -> Result<bool> {
        let (buffer, layout, mappings, levels, _root) = self.tree.iter_parts();
        loop {
            let frame = buffer.read(leaf)?;
            let count = NodeRef::new(buffer.frame(frame), layout)?.count();

            if leaf_idx < count {
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                let k = node.key_at(leaf_idx);
                if let Some(min) = &self.min {
                    if (layout.compare)(k, min) == std::cmp::Ordering::Less {
                        leaf_idx += 1;
                        continue;
                    }
                }
                if let Some(max) = &self.max {
                    if (layout.compare)(k, max) == std::cmp::Ordering::Greater {
                        return Ok(false); // state stays Done
                    }
                }
                key_out[..layout.key_size].copy_from_slice(k);
                data_out[..layout.data_size].copy_from_slice(node.value_at(leaf_idx));
                self.state = IterState::Indexed {
                    pages,
                    idxs,
                    leaf,
                    leaf_idx: leaf_idx + 1,
                };
                return Ok(true);
            }

            // Leaf exhausted: find the deepest ancestor with a next child.
            let mut level: Option<usize> = None;
            for l in (0..levels.saturating_sub(1)).rev() {
                let frame = buffer.read(pages[l])?;
                let count = NodeRef::new(buffer.frame(frame), layout)?.count();
                if idxs[l] < count {
                    idxs[l] += 1;
                    level = Some(l);
                    break;
                }
                idxs[l] = 0;
            }
            let Some(mut l) = level else {
                return Ok(false); // the ascent exhausted the root
            };

            // Descend the leftmost spine under the advanced child.
            let mut next = {
                let frame = buffer.read(pages[l])?;
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                mappings.resolve(node.child_at(idxs[l]))
            };
            l += 1;
            while l < levels - 1 {
                pages[l] = next;
                idxs[l] = 0;
                let frame = buffer.read(next)?;
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                next = mappings.resolve(node.child_at(0));
                l += 1;
            }
            leaf = next;
            leaf_idx = 0;
        }
    }

    fn next_seek(
        &mut self,
        mut cursor: Vec<u8>,
        mut include_equal: bool,
        key_out: &mut [u8],
        data_out: &mut [u8],
    ) -> Result<bool> {
        let (buffer, layout, _mappings, levels, root) = self.tree.iter_parts();
        loop {
            // Descend by the cursor, remembering the routing key the leaf's
            // parent chose: it is the leaf's exclusive coverage bound.
            let mut next = root;
            let mut bound_set = false;
            for l in 0..levels.saturating_sub(1) {
                let frame = buffer.read(next)?;
                let node = NodeRef::new(buffer.frame(frame), layout)?;
                let slot = node
                    .ow_child_slot(&cursor)
                    .ok_or_else(|| eyre::eyre!("interior page has no live routing pair"))?;
                if l == levels - 2 {
                    self.bound.copy_from_slice(node.key_at(slot));
                    bound_set = true;
                }
                next = node.child_at(slot);
            }

            // Smallest live key past the cursor within this leaf. An exact
            // cursor match only counts on the first probe of a seek.
            let frame = buffer.read(next)?;
            let node = NodeRef::new(buffer.frame(frame), layout)?;
            let best = if include_equal {
                node.ow_find_key(&cursor).or_else(|| node.ow_successor_slot(&cursor))
            } else {
                node.ow_successor_slot(&cursor)
            };

            if let Some(s) = best {
                let k = node.key_at(s);
                if let Some(max) = &self.max {
                    if (layout.compare)(k, max) == std::cmp::Ordering::Greater {
                        return Ok(false);
                    }
                }
                key_out[..layout.key_size].copy_from_slice(k);
                data_out[..layout.data_size].copy_from_slice(node.value_at(s));
                cursor.copy_from_slice(k);
                self.state = IterState::Seek {
                    cursor,
                    include_equal: false,
                };
                return Ok(true);
            }

            // Leaf exhausted: seek into the next leaf's coverage, unless
            // this was the rightmost leaf (or the root is the only leaf).
            if !bound_set || is_max_key(&self.bound) {
                return Ok(false);
            }
            cursor.copy_from_slice(&self.bound);
            include_equal = true;
        }
    }
}
