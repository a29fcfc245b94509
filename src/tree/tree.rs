//! # Tree Operations
//!
//! `put`, `get` and the machinery they share: descent along the cached
//! active path, leaf and interior splits, mapping maintenance, and the
//! relocation hooks the page buffer calls back into.
//!
//! ## Mode dispatch
//!
//! All three storage modes descend and search identically; they differ only
//! in how a mutated node reaches storage:
//!
//! ```text
//! update-in-place    rewrite at the same physical page
//! copy-on-write      fresh page; mapping table redirects the old id
//! in-page overwrite  same page, bit-clearing slot update; structural
//!                    changes write fresh pages and patch the parent by
//!                    invalidating its routing pair and adding new ones
//! ```
//!
//! ## Split cascade
//!
//! `put` reserves eight pages up front, which bounds the worst case: a leaf
//! split plus an interior split per level plus a root grow. Splits are
//! assembled in a dedicated scratch (keys, values and children as parallel
//! arrays) and emitted as fresh pages rather than shuffled within the frame.
//!
//! ## Page reclamation
//!
//! The free map is kept exact eagerly: whenever the last reference to a
//! physical page dies — a mapping is upserted away, a parent embeds a
//! current pointer, the root moves — the page is marked free on the spot.
//! Relocation classification is then a map/bitmap probe, never a descent.
//!
//! ## Reentrancy
//!
//! `ensure_space` relocates pages and calls back into the tree while the
//! buffer is borrowed mutably; the hook object borrows only the mapping
//! table and the active path, so the borrow split is checked by the
//! compiler. No frame slice is held across any buffer call.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::bitarr::BitArray;
use crate::buffer::{FrameId, PageBuffer, PageStatus, RelocationHooks, SpaceOutcome};
use crate::config::{Mode, TreeConfig};
use crate::storage::{PageId, StorageDriver};
use crate::tree::mapping::{MapInsert, MappingTable};
use crate::tree::node::{NodeLayout, NodeMut, NodeRef, PageHeader, PTR_SIZE};

/// Generous bound on tree height; the path stack never heap-allocates
/// below it.
pub(crate) const MAX_TREE_HEIGHT: usize = 12;

/// Pages reserved before a `put`: a leaf split, an interior split per
/// realistic level, and a root grow.
const SPLIT_RESERVE: usize = 8;

pub(crate) type PathVec = SmallVec<[PageId; MAX_TREE_HEIGHT]>;

/// Outcome of [`Tree::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    Inserted,
    /// The key existed; its value was replaced.
    Replaced,
    /// No space could be reclaimed anywhere on the device. The tree is
    /// unchanged.
    Full,
}

/// Parallel-array scratch used to assemble split halves. Sized once for
/// the largest node shape; all split logic reads records out of a frame,
/// edits here, and emits fresh pages.
struct SplitScratch {
    keys: Vec<u8>,
    values: Vec<u8>,
    children: Vec<PageId>,
    key_size: usize,
    value_size: usize,
}

impl SplitScratch {
    fn new(layout: &NodeLayout) -> Self {
        let max_records = layout
            .leaf_cap
            .max(layout.interior_cap)
            .max(layout.ow_leaf_slots)
            .max(layout.ow_interior_slots);
        Self {
            keys: vec![0; (max_records + 1) * layout.key_size],
            values: vec![0; (layout.leaf_cap.max(layout.ow_leaf_slots) + 1) * layout.data_size],
            children: vec![0; layout.interior_cap.max(layout.ow_interior_slots) + 2],
            key_size: layout.key_size,
            value_size: layout.data_size,
        }
    }

    fn key(&self, i: usize) -> &[u8] {
        &self.keys[i * self.key_size..(i + 1) * self.key_size]
    }

    fn value(&self, i: usize) -> &[u8] {
        &self.values[i * self.value_size..(i + 1) * self.value_size]
    }

    fn set_key(&mut self, i: usize, key: &[u8]) {
        self.keys[i * self.key_size..(i + 1) * self.key_size].copy_from_slice(key);
    }

    fn set_value(&mut self, i: usize, value: &[u8]) {
        self.values[i * self.value_size..(i + 1) * self.value_size].copy_from_slice(value);
    }

    /// Copies `n` records (keys and values) out of a leaf view.
    fn load_records(&mut self, node: NodeRef<'_>, n: usize) {
        for i in 0..n {
            self.set_key(i, node.key_at(i));
            self.set_value(i, node.value_at(i));
        }
    }

    /// Copies `count` separators and `count + 1` children out of a sorted
    /// interior view.
    fn load_interior(&mut self, node: NodeRef<'_>, count: usize) {
        for i in 0..count {
            self.set_key(i, node.key_at(i));
        }
        for i in 0..=count {
            self.children[i] = node.child_at(i);
        }
    }

    /// Copies `n` key/child pairs out of a compacted overwrite interior.
    fn load_pairs(&mut self, node: NodeRef<'_>, n: usize) {
        for i in 0..n {
            self.set_key(i, node.key_at(i));
            self.children[i] = node.child_at(i);
        }
    }

    /// Inserts a record at `idx` into `n` loaded records.
    fn insert_record(&mut self, n: usize, idx: usize, key: &[u8], value: &[u8]) {
        let ks = self.key_size;
        let vs = self.value_size;
        self.keys.copy_within(idx * ks..n * ks, (idx + 1) * ks);
        self.values.copy_within(idx * vs..n * vs, (idx + 1) * vs);
        self.set_key(idx, key);
        self.set_value(idx, value);
    }

    /// Inserts separator `key` at `idx` into a loaded sorted interior of
    /// `count` separators, pointing `children[idx]` at `left` and splicing
    /// `right` in after it.
    fn insert_separator(&mut self, count: usize, idx: usize, key: &[u8], left: PageId, right: PageId) {
        let ks = self.key_size;
        self.keys.copy_within(idx * ks..count * ks, (idx + 1) * ks);
        self.set_key(idx, key);
        self.children.copy_within(idx + 1..count + 1, idx + 2);
        self.children[idx] = left;
        self.children[idx + 1] = right;
    }

    /// Inserts a key/child pair at `idx` into `n` loaded pairs.
    fn insert_pair(&mut self, n: usize, idx: usize, key: &[u8], child: PageId) {
        let ks = self.key_size;
        self.keys.copy_within(idx * ks..n * ks, (idx + 1) * ks);
        self.children.copy_within(idx..n, idx + 1);
        self.set_key(idx, key);
        self.children[idx] = child;
    }

    /// Binary search over `n` loaded keys: `Ok(found)` or `Err(insert_at)`.
    fn find(&self, compare: crate::config::KeyCompare, n: usize, key: &[u8]) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare(self.key(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }
}

/// The tree-side state the buffer's relocation cycle needs: classification
/// comes from the free map and the mapping table, and a moved interior page
/// gets its pointers refreshed in the staged frame.
struct TreeHooks<'a> {
    layout: &'a NodeLayout,
    mappings: &'a mut MappingTable,
    path: &'a mut PathVec,
}

impl RelocationHooks for TreeHooks<'_> {
    fn classify(&mut self, buffer: &mut PageBuffer, page: PageId) -> Result<PageStatus> {
        if buffer.is_free(page) {
            return Ok(PageStatus::Unreachable);
        }
        if self.mappings.names_prev(page) {
            return Ok(PageStatus::Remapped);
        }
        Ok(PageStatus::Reachable)
    }

    fn page_moved(
        &mut self,
        buffer: &mut PageBuffer,
        prev: PageId,
        curr: PageId,
        frame: FrameId,
    ) -> Result<()> {
        update_pointers(buffer, self.layout, self.mappings, frame, None)?;
        if self.path.first() == Some(&prev) {
            self.path[0] = curr;
            buffer.note_root(curr);
        } else if prev != curr {
            // Relocation rewrites pages at their own slot, so this branch is
            // defensive; it mirrors the normal rewrite bookkeeping.
            match self.mappings.insert(prev, curr) {
                MapInsert::Updated { old_curr } if old_curr != curr => buffer.set_free(old_curr),
                MapInsert::Full => warn!(prev, curr, "mapping table full while relocating page"),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Marks every page reachable from `page` in `live`, counting nodes.
fn mark_live(
    buffer: &mut PageBuffer,
    layout: &NodeLayout,
    page: PageId,
    levels: usize,
    level: usize,
    live: &mut BitArray,
    node_count: &mut u64,
) -> Result<()> {
    live.set(page as usize);
    *node_count += 1;
    if level >= levels - 1 {
        return Ok(());
    }
    let children: Vec<PageId> = {
        let frame = buffer.read(page)?;
        let node = NodeRef::new(buffer.frame(frame), layout)?;
        if node.overwrite_layout() {
            (0..node.capacity())
                .filter(|&s| node.slot_live(s))
                .map(|s| node.child_at(s))
                .collect()
        } else {
            (0..=node.count()).map(|i| node.child_at(i)).collect()
        }
    };
    for child in children {
        mark_live(buffer, layout, child, levels, level + 1, live, node_count)?;
    }
    Ok(())
}

/// Routes `key` through an interior node view.
fn child_for_key(node: NodeRef<'_>, key: &[u8]) -> Result<PageId> {
    ensure!(node.is_interior(), "descent reached a leaf early");
    if node.overwrite_layout() {
        let slot = node
            .ow_child_slot(key)
            .ok_or_else(|| eyre::eyre!("interior page has no live routing pair"))?;
        Ok(node.child_at(slot))
    } else {
        Ok(node.child_at(node.interior_child_index(key)))
    }
}

/// Maintains the mapping-chain anchor of a node about to be rewritten at a
/// new location. The anchor is the physical id parents still name; it stays
/// only while a mapping anchors it to the node's current location,
/// otherwise the current location becomes the new anchor.
fn update_prev(
    buffer: &mut PageBuffer,
    mappings: &mut MappingTable,
    frame: FrameId,
    curr: PageId,
) -> Result<PageId> {
    let prev = PageHeader::from_bytes(buffer.frame(frame))?.prev_id();
    match prev {
        Some(p) if mappings.resolve(p) == curr => Ok(p),
        _ => {
            PageHeader::from_bytes_mut(buffer.frame_mut(frame))?.set_prev_id(Some(curr));
            Ok(curr)
        }
    }
}

/// Rewrites stale child pointers of a sorted interior node in `frame`
/// through the mapping table (plus one `pending` mapping not yet in the
/// table), deleting each consumed mapping and freeing the superseded
/// physical id. Returns the number of pointers changed.
fn update_pointers(
    buffer: &mut PageBuffer,
    layout: &NodeLayout,
    mappings: &mut MappingTable,
    frame: FrameId,
    pending: Option<(PageId, PageId)>,
) -> Result<usize> {
    let (count, applies) = {
        let node = NodeRef::new(buffer.frame(frame), layout)?;
        (node.count(), node.is_interior() && !node.overwrite_layout())
    };
    if !applies {
        return Ok(0);
    }
    let mut changed = 0;
    for i in 0..=count {
        let child = NodeRef::new(buffer.frame(frame), layout)?.child_at(i);
        let target = match pending {
            Some((prev, curr)) if prev == child => curr,
            _ => mappings.resolve(child),
        };
        if target != child {
            NodeMut::new(buffer.frame_mut(frame), layout)?.set_child(i, target);
            mappings.remove(child);
            // Nothing names the old id any more.
            buffer.set_free(child);
            changed += 1;
        }
    }
    Ok(changed)
}

pub struct Tree {
    buffer: PageBuffer,
    layout: NodeLayout,
    mappings: MappingTable,
    /// Physical ids (resolved at descent time) from the root down to the
    /// current leaf candidate; `path[0]` is authoritative for the root.
    path: PathVec,
    levels: usize,
    node_count: u64,
    /// Separator register for split propagation.
    tmp_key: Vec<u8>,
    /// Second key scratch: compact-sort temp, patched routing keys.
    tmp_key2: Vec<u8>,
    /// Value/pointer scratch for compact-sort.
    tmp_val: Vec<u8>,
    scratch: SplitScratch,
}

impl Tree {
    /// Initialises a fresh tree on `storage`: allocates every buffer the
    /// engine will ever use and writes the empty root leaf.
    pub fn create(config: TreeConfig, storage: Box<dyn StorageDriver>) -> Result<Self> {
        config.validate()?;
        let layout = NodeLayout::new(&config)?;
        let mut buffer = PageBuffer::new(&config, storage)?;
        let mappings = MappingTable::with_budget(config.mapping_bytes);

        buffer.init_frame(0);
        NodeMut::init(buffer.frame_mut(0), &layout, false, true)?;
        let root = buffer.write(0)?;
        buffer.note_root(root);
        debug!(root, mode = ?config.mode, "created empty tree");

        let mut path = PathVec::new();
        path.push(root);
        Ok(Self {
            scratch: SplitScratch::new(&layout),
            tmp_key: vec![0; layout.key_size],
            tmp_key2: vec![0; layout.key_size],
            tmp_val: vec![0; layout.data_size.max(PTR_SIZE)],
            buffer,
            layout,
            mappings,
            path,
            levels: 1,
            node_count: 1,
        })
    }

    /// Reopens a tree from storage written by a previous, cleanly closed
    /// instance: scans for the newest root-flagged page, rebuilds the free
    /// map, re-derives the height and reclaims superseded pages that are
    /// no longer reachable. A blank device yields a fresh tree.
    pub fn recover(config: TreeConfig, storage: Box<dyn StorageDriver>) -> Result<Self> {
        config.validate()?;
        let layout = NodeLayout::new(&config)?;
        let mut buffer = PageBuffer::new(&config, storage)?;
        let root = match buffer.recover()? {
            Some(root) => root,
            None => {
                buffer.init_frame(0);
                NodeMut::init(buffer.frame_mut(0), &layout, false, true)?;
                buffer.write(0)?
            }
        };
        buffer.note_root(root);

        // Height by leftmost descent. Mappings are volatile and were
        // drained by close(), so on-disk pointers are direct.
        let probe = vec![0u8; layout.key_size];
        let mut levels = 1;
        let mut page = root;
        loop {
            let frame = buffer.read(page)?;
            let node = NodeRef::new(buffer.frame(frame), &layout)?;
            if !node.is_interior() {
                break;
            }
            page = child_for_key(node, &probe)?;
            levels += 1;
            ensure!(levels <= MAX_TREE_HEIGHT, "recovered tree is implausibly deep");
        }

        // Superseded pages scan as written but nothing references them;
        // mark everything outside the tree walk reclaimable.
        let mut live = BitArray::new(buffer.capacity_pages() as usize, false);
        let mut node_count = 0u64;
        mark_live(&mut buffer, &layout, root, levels, 0, &mut live, &mut node_count)?;
        buffer.retain_live(&live);
        debug!(root, levels, node_count, "recovered tree");

        let mut path = PathVec::new();
        path.push(root);
        Ok(Self {
            scratch: SplitScratch::new(&layout),
            tmp_key: vec![0; layout.key_size],
            tmp_key2: vec![0; layout.key_size],
            tmp_val: vec![0; layout.data_size.max(PTR_SIZE)],
            buffer,
            layout,
            mappings: MappingTable::with_budget(config.mapping_bytes),
            path,
            levels,
            node_count,
        })
    }

    pub fn height(&self) -> usize {
        self.levels
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn mapping_len(&self) -> usize {
        self.mappings.len()
    }

    /// Hash probes performed by the mapping table so far.
    pub fn mapping_compares(&self) -> u64 {
        self.mappings.compares()
    }

    pub fn stats(&self) -> crate::buffer::BufferStats {
        self.buffer.stats()
    }

    pub fn clear_stats(&mut self) {
        self.buffer.clear_stats();
    }

    pub(crate) fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// Split borrows for the iterator: buffer, layout, mapping table,
    /// height and root, all usable at once.
    pub(crate) fn iter_parts(
        &mut self,
    ) -> (&mut PageBuffer, &NodeLayout, &mut MappingTable, usize, PageId) {
        (
            &mut self.buffer,
            &self.layout,
            &mut self.mappings,
            self.levels,
            self.path[0],
        )
    }

    /// Runs the buffer's space guarantee with the tree-side hooks attached.
    fn reserve_space(&mut self, pages: usize) -> Result<SpaceOutcome> {
        let Tree {
            buffer,
            layout,
            mappings,
            path,
            ..
        } = self;
        let mut hooks = TreeHooks {
            layout,
            mappings,
            path,
        };
        buffer.ensure_space(pages, &mut hooks)
    }

    /// Descends from the root to the leaf bracketing `key`, resolving every
    /// child pointer through the mapping table. With `record`, the resolved
    /// id at each level is cached in the active path.
    fn descend(&mut self, key: &[u8], record: bool) -> Result<PageId> {
        let mut next = self.path[0];
        if record {
            self.path.truncate(1);
        }
        for _ in 0..self.levels.saturating_sub(1) {
            let frame = self.buffer.read(next)?;
            let child = {
                let node = NodeRef::new(self.buffer.frame(frame), &self.layout)?;
                child_for_key(node, key)?
            };
            let resolved = self.mappings.resolve(child);
            if record {
                self.path.push(resolved);
            }
            next = resolved;
        }
        Ok(next)
    }

    /// Point lookup. Copies the value into `out` and returns `true` when
    /// the key exists.
    pub fn get(&mut self, key: &[u8], out: &mut [u8]) -> Result<bool> {
        ensure!(key.len() == self.layout.key_size, "key size mismatch");
        ensure!(out.len() >= self.layout.data_size, "output buffer too small");
        let leaf = self.descend(key, false)?;
        let frame = self.buffer.read(leaf)?;
        let node = NodeRef::new(self.buffer.frame(frame), &self.layout)?;
        let found = if node.overwrite_layout() {
            node.ow_find_key(key)
        } else {
            node.leaf_find_exact(key)
        };
        match found {
            Some(i) => {
                out[..self.layout.data_size].copy_from_slice(node.value_at(i));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Inserts or replaces a record. Reserves the worst-case split cascade
    /// up front, so a `Full` outcome leaves the tree untouched.
    pub fn put(&mut self, key: &[u8], data: &[u8]) -> Result<PutResult> {
        ensure!(key.len() == self.layout.key_size, "key size mismatch");
        ensure!(data.len() == self.layout.data_size, "data size mismatch");
        if self.reserve_space(SPLIT_RESERVE)? == SpaceOutcome::Full {
            return Ok(PutResult::Full);
        }

        let leaf = self.descend(key, true)?;
        self.buffer.read_into(leaf, 0)?;
        if self.layout.mode.overwrite_layout() {
            self.nor_put(leaf, key, data)
        } else {
            self.sorted_put(leaf, key, data)
        }
    }

    // ------------------------------------------------------------------
    // Sorted layouts (update-in-place and copy-on-write).

    fn sorted_put(&mut self, leaf: PageId, key: &[u8], data: &[u8]) -> Result<PutResult> {
        let (count, pred, exact) = {
            let node = NodeRef::new(self.buffer.frame(0), &self.layout)?;
            let pred = node.leaf_predecessor(key);
            let exact =
                pred.filter(|&p| (self.layout.compare)(node.key_at(p), key) == Ordering::Equal);
            (node.count(), pred, exact)
        };

        if let Some(i) = exact {
            let Tree { buffer, layout, .. } = self;
            NodeMut::new(buffer.frame_mut(0), layout)?.set_value(i, data);
            self.persist_leaf_rewrite(leaf)?;
            return Ok(PutResult::Replaced);
        }

        if count < self.layout.leaf_cap {
            let idx = pred.map_or(0, |p| p + 1);
            let Tree { buffer, layout, .. } = self;
            NodeMut::new(buffer.frame_mut(0), layout)?.leaf_insert_at(idx, key, data)?;
            self.persist_leaf_rewrite(leaf)?;
            return Ok(PutResult::Inserted);
        }

        self.split_sorted_leaf(leaf, key, data, pred)?;
        Ok(PutResult::Inserted)
    }

    /// Persists the leaf sitting in frame 0 after a non-structural change.
    fn persist_leaf_rewrite(&mut self, page: PageId) -> Result<()> {
        match self.layout.mode {
            Mode::UpdateInPlace => self.buffer.overwrite(0, page),
            Mode::CopyOnWrite => {
                if self.levels == 1 {
                    let new = self.buffer.write(0)?;
                    self.path[0] = new;
                    self.buffer.note_root(new);
                    self.buffer.set_free(page);
                    Ok(())
                } else {
                    let anchor = update_prev(&mut self.buffer, &mut self.mappings, 0, page)?;
                    let new = self.buffer.write(0)?;
                    *self.path.last_mut().unwrap() = new; // INVARIANT: descend recorded a full path
                    self.fix_mappings(anchor, new, self.levels as i32 - 2)
                }
            }
            Mode::InPageOverwrite => bail!("sorted rewrite path reached in overwrite mode"),
        }
    }

    /// Installs `prev -> curr`; under table pressure, drains slots by
    /// rewriting ancestors up the active path (each rewrite embeds current
    /// pointers and deletes the mappings it consumed), then retries. A
    /// rewrite that reaches the root installs the new root instead.
    fn fix_mappings(&mut self, mut prev: PageId, mut curr: PageId, mut level: i32) -> Result<()> {
        loop {
            match self.mappings.insert(prev, curr) {
                MapInsert::Added => return Ok(()),
                MapInsert::Updated { old_curr } => {
                    if old_curr != curr {
                        self.buffer.set_free(old_curr);
                    }
                    return Ok(());
                }
                MapInsert::Full => {}
            }
            if level < 0 {
                bail!("mapping table exhausted past the root");
            }
            trace!(prev, curr, level, "mapping pressure: rewriting ancestor");

            let l = level as usize;
            let parent = self.mappings.resolve(self.path[l]);
            self.buffer.read_into(parent, 0)?;
            let anchor = update_prev(&mut self.buffer, &mut self.mappings, 0, parent)?;
            update_pointers(
                &mut self.buffer,
                &self.layout,
                &mut self.mappings,
                0,
                Some((prev, curr)),
            )?;
            let new = self.buffer.write(0)?;
            if l == 0 {
                self.path[0] = new;
                self.buffer.note_root(new);
                self.buffer.set_free(parent);
                return Ok(());
            }
            self.path[l] = new;
            prev = anchor;
            curr = new;
            level -= 1;
        }
    }

    /// Drops every reference to a superseded child pointer value: the
    /// mapped-to page, and the stale anchor id with its mapping if one
    /// exists. Used when a parent is about to embed fresh pointers.
    fn release_replaced_child(&mut self, raw: PageId) {
        let resolved = self.mappings.resolve(raw);
        if resolved != raw {
            self.mappings.remove(raw);
            self.buffer.set_free(raw);
        }
        self.buffer.set_free(resolved);
    }

    fn split_sorted_leaf(
        &mut self,
        leaf: PageId,
        key: &[u8],
        data: &[u8],
        pred: Option<usize>,
    ) -> Result<()> {
        let count = NodeRef::new(self.buffer.frame(0), &self.layout)?.count();
        let was_root = self.levels == 1;

        {
            let Tree {
                buffer,
                layout,
                scratch,
                ..
            } = self;
            let node = NodeRef::new(buffer.frame(0), layout)?;
            scratch.load_records(node, count);
        }
        let idx = pred.map_or(0, |p| p + 1);
        self.scratch.insert_record(count, idx, key, data);

        let m = count + 1;
        let left_n = m - m / 2;
        self.tmp_key.copy_from_slice(self.scratch.key(left_n));
        trace!(leaf, count, left_n, "splitting leaf");

        let left = self.emit_leaf(0, left_n, false)?;
        let right = self.emit_leaf(left_n, m, false)?;
        self.node_count += 1;

        if was_root {
            self.buffer.set_free(leaf);
            self.grow_root(left, right)
        } else {
            self.propagate_sorted(left, right)
        }
    }

    /// Writes scratch records `[start, end)` as a fresh leaf page.
    fn emit_leaf(&mut self, start: usize, end: usize, root: bool) -> Result<PageId> {
        let Tree {
            buffer,
            layout,
            scratch,
            ..
        } = self;
        buffer.init_frame(0);
        {
            let mut node = NodeMut::init(buffer.frame_mut(0), layout, false, root)?;
            if layout.mode.overwrite_layout() {
                for (slot, i) in (start..end).enumerate() {
                    node.ow_write_record(slot, scratch.key(i), scratch.value(i));
                }
            } else {
                for (slot, i) in (start..end).enumerate() {
                    node.set_key(slot, scratch.key(i));
                    node.set_value(slot, scratch.value(i));
                }
                node.set_count(end - start);
            }
        }
        buffer.write(0)
    }

    /// Writes scratch separators `[kstart, kend)` with children
    /// `[kstart, kend]` as a fresh sorted interior page.
    fn emit_interior(&mut self, kstart: usize, kend: usize, root: bool) -> Result<PageId> {
        let Tree {
            buffer,
            layout,
            scratch,
            ..
        } = self;
        buffer.init_frame(0);
        {
            let mut node = NodeMut::init(buffer.frame_mut(0), layout, true, root)?;
            for (slot, i) in (kstart..kend).enumerate() {
                node.set_key(slot, scratch.key(i));
                node.set_child(slot, scratch.children[i]);
            }
            node.set_child(kend - kstart, scratch.children[kend]);
            node.set_count(kend - kstart);
        }
        buffer.write(0)
    }

    /// Writes scratch pairs `[start, end)` as a fresh overwrite interior.
    fn emit_ow_interior(&mut self, start: usize, end: usize, root: bool) -> Result<PageId> {
        let Tree {
            buffer,
            layout,
            scratch,
            ..
        } = self;
        buffer.init_frame(0);
        {
            let mut node = NodeMut::init(buffer.frame_mut(0), layout, true, root)?;
            for (slot, i) in (start..end).enumerate() {
                node.ow_write_pair(slot, scratch.key(i), scratch.children[i]);
            }
        }
        buffer.write(0)
    }

    /// Installs a new root over `left` and `right`, with the separator in
    /// `tmp_key`. Grows the tree by one level.
    fn grow_root(&mut self, left: PageId, right: PageId) -> Result<()> {
        {
            let Tree {
                buffer,
                layout,
                tmp_key,
                tmp_key2,
                ..
            } = self;
            buffer.init_frame(0);
            let mut node = NodeMut::init(buffer.frame_mut(0), layout, true, true)?;
            if layout.mode.overwrite_layout() {
                // The rightmost subtree rides the all-ones sentinel pair.
                node.ow_write_pair(0, tmp_key, left);
                tmp_key2.fill(0xFF);
                node.ow_write_pair(1, tmp_key2, right);
            } else {
                node.set_key(0, tmp_key);
                node.set_child(0, left);
                node.set_child(1, right);
                node.set_count(1);
            }
        }
        let new_root = self.buffer.write(0)?;
        self.levels += 1;
        self.node_count += 1;
        self.path.clear();
        self.path.push(new_root);
        self.buffer.note_root(new_root);
        debug!(new_root, levels = self.levels, "grew a new root");
        Ok(())
    }

    /// Walks the active path upward inserting the separator in `tmp_key`
    /// between `left` and `right`, splitting interior nodes as needed.
    fn propagate_sorted(&mut self, mut left: PageId, mut right: PageId) -> Result<()> {
        for l in (0..=self.levels - 2).rev() {
            let parent = self.mappings.resolve(self.path[l]);
            self.buffer.read_into(parent, 0)?;
            if self.layout.mode == Mode::CopyOnWrite {
                update_pointers(&mut self.buffer, &self.layout, &mut self.mappings, 0, None)?;
            }

            let (count, child_idx, raw) = {
                let node = NodeRef::new(self.buffer.frame(0), &self.layout)?;
                let child_idx = node.interior_child_index(&self.tmp_key);
                (node.count(), child_idx, node.child_at(child_idx))
            };
            // The pointer being replaced names the page that just split.
            self.release_replaced_child(raw);

            if count < self.layout.interior_cap {
                {
                    let Tree {
                        buffer,
                        layout,
                        tmp_key,
                        ..
                    } = self;
                    NodeMut::new(buffer.frame_mut(0), layout)?
                        .interior_insert_at(child_idx, tmp_key, left, right)?;
                }
                return self.persist_interior_rewrite(parent, l);
            }

            // Split this interior node.
            {
                let Tree {
                    buffer,
                    layout,
                    scratch,
                    ..
                } = self;
                let node = NodeRef::new(buffer.frame(0), layout)?;
                scratch.load_interior(node, count);
            }
            self.scratch
                .insert_separator(count, child_idx, &self.tmp_key, left, right);
            let m = count + 1;
            let mid = m / 2;

            let new_left = self.emit_interior(0, mid, false)?;
            let new_right = self.emit_interior(mid + 1, m, false)?;
            self.tmp_key.copy_from_slice(self.scratch.key(mid));
            self.node_count += 1;
            trace!(parent, level = l, "split interior node");

            if l == 0 {
                self.buffer.set_free(parent);
                return self.grow_root(new_left, new_right);
            }
            // The old page is released when the next ancestor embeds the
            // replacement pointers.
            left = new_left;
            right = new_right;
        }
        bail!("split propagation walked past the root");
    }

    /// Persists the interior node in frame 0 after a slack insert.
    fn persist_interior_rewrite(&mut self, page: PageId, level: usize) -> Result<()> {
        match self.layout.mode {
            Mode::UpdateInPlace => self.buffer.overwrite(0, page),
            Mode::CopyOnWrite => {
                let anchor = update_prev(&mut self.buffer, &mut self.mappings, 0, page)?;
                let new = self.buffer.write(0)?;
                self.path[level] = new;
                if level == 0 {
                    self.buffer.note_root(new);
                    self.buffer.set_free(page);
                    Ok(())
                } else {
                    self.fix_mappings(anchor, new, level as i32 - 1)
                }
            }
            Mode::InPageOverwrite => bail!("sorted rewrite path reached in overwrite mode"),
        }
    }

    // ------------------------------------------------------------------
    // In-page overwrite (NOR) layout.

    fn nor_put(&mut self, leaf: PageId, key: &[u8], data: &[u8]) -> Result<PutResult> {
        let (replace_slot, free_slot) = {
            let node = NodeRef::new(self.buffer.frame(0), &self.layout)?;
            (node.ow_find_key(key), node.first_free_slot())
        };

        if let Some(slot) = free_slot {
            {
                let Tree { buffer, layout, .. } = self;
                let mut node = NodeMut::new(buffer.frame_mut(0), layout)?;
                node.ow_write_record(slot, key, data);
                if let Some(old) = replace_slot {
                    node.ow_invalidate(old);
                }
            }
            self.buffer.overwrite(0, leaf)?;
            return Ok(if replace_slot.is_some() {
                PutResult::Replaced
            } else {
                PutResult::Inserted
            });
        }

        // Page full: compact in the frame, then rebuild fresh.
        let n = {
            let Tree {
                buffer,
                layout,
                tmp_key2,
                tmp_val,
                ..
            } = self;
            NodeMut::new(buffer.frame_mut(0), layout)?.ow_compact_sort(tmp_key2, tmp_val)
        };
        {
            let Tree {
                buffer,
                layout,
                scratch,
                ..
            } = self;
            let node = NodeRef::new(buffer.frame(0), layout)?;
            scratch.load_records(node, n);
        }

        let (m, replaced) = match self.scratch.find(self.layout.compare, n, key) {
            Ok(i) => {
                self.scratch.set_value(i, data);
                (n, true)
            }
            Err(at) => {
                self.scratch.insert_record(n, at, key, data);
                (n + 1, false)
            }
        };

        if m <= self.layout.ow_leaf_slots {
            let was_root = self.levels == 1;
            let new = self.emit_leaf(0, m, was_root)?;
            if was_root {
                self.path[0] = new;
                self.buffer.note_root(new);
            } else {
                self.nor_patch(self.levels - 2, leaf, new, None)?;
            }
            self.buffer.set_free(leaf);
            return Ok(if replaced {
                PutResult::Replaced
            } else {
                PutResult::Inserted
            });
        }

        // Split: two fresh halves, separator = right's smallest key.
        let left_n = m - m / 2;
        self.tmp_key.copy_from_slice(self.scratch.key(left_n));
        let left = self.emit_leaf(0, left_n, false)?;
        let right = self.emit_leaf(left_n, m, false)?;
        self.node_count += 1;
        trace!(leaf, m, left_n, "split overwrite leaf");

        if self.levels == 1 {
            self.buffer.set_free(leaf);
            self.grow_root(left, right)?;
        } else {
            self.nor_patch(self.levels - 2, leaf, left, Some(right))?;
            self.buffer.set_free(leaf);
        }
        Ok(PutResult::Inserted)
    }

    /// Replaces the routing entry for `old_child` at `level`. With one
    /// replacement the old pair's key is reused; with two (`second` is a
    /// split's right half) the separator sits in `tmp_key`. Parents with
    /// free slots are patched in place by invalidating the old pair and
    /// adding new ones — both bit-clearing transitions — otherwise the
    /// parent is compacted and rebuilt fresh, recursing toward the root.
    fn nor_patch(
        &mut self,
        start_level: usize,
        old_child: PageId,
        first: PageId,
        second: Option<PageId>,
    ) -> Result<()> {
        let mut level = start_level;
        let mut old_child = old_child;
        let mut first = first;
        let mut second = second;
        loop {
            let parent = self.path[level];
            self.buffer.read_into(parent, 0)?;

            let needed = if second.is_some() { 2 } else { 1 };
            let (slot_j, free_slots) = {
                let node = NodeRef::new(self.buffer.frame(0), &self.layout)?;
                let slot_j = node.ow_find_child(old_child).ok_or_else(|| {
                    eyre::eyre!("parent at page {parent} has no routing pair for child {old_child}")
                })?;
                let free = (0..node.capacity())
                    .filter(|&s| node.slot_free(s))
                    .take(needed)
                    .count();
                (slot_j, free)
            };

            if free_slots >= needed {
                {
                    let Tree {
                        buffer,
                        layout,
                        tmp_key,
                        tmp_key2,
                        ..
                    } = self;
                    tmp_key2.copy_from_slice(
                        NodeRef::new(buffer.frame(0), layout)?.key_at(slot_j),
                    );
                    let mut node = NodeMut::new(buffer.frame_mut(0), layout)?;
                    node.ow_invalidate(slot_j);
                    if let Some(right) = second {
                        let s = node.as_ref().first_free_slot().unwrap(); // INVARIANT: free_slots >= needed
                        node.ow_write_pair(s, tmp_key, first);
                        let s = node.as_ref().first_free_slot().unwrap();
                        node.ow_write_pair(s, tmp_key2, right);
                    } else {
                        let s = node.as_ref().first_free_slot().unwrap();
                        node.ow_write_pair(s, tmp_key2, first);
                    }
                }
                return self.buffer.overwrite(0, parent);
            }

            // No room: compact and rebuild the parent.
            let n = {
                let Tree {
                    buffer,
                    layout,
                    tmp_key2,
                    tmp_val,
                    ..
                } = self;
                NodeMut::new(buffer.frame_mut(0), layout)?.ow_compact_sort(tmp_key2, tmp_val)
            };
            {
                let Tree {
                    buffer,
                    layout,
                    scratch,
                    ..
                } = self;
                let node = NodeRef::new(buffer.frame(0), layout)?;
                scratch.load_pairs(node, n);
            }
            let idx = (0..n)
                .find(|&i| self.scratch.children[i] == old_child)
                .ok_or_else(|| {
                    eyre::eyre!("compacted parent lost the routing pair for child {old_child}")
                })?;

            // Substitute in place: the old pair's key keeps covering the
            // right part of the split range.
            let m = if let Some(right) = second {
                self.scratch.children[idx] = right;
                self.scratch.insert_pair(n, idx, &self.tmp_key, first);
                n + 1
            } else {
                self.scratch.children[idx] = first;
                n
            };

            if m <= self.layout.ow_interior_slots {
                let is_root = level == 0;
                let new = self.emit_ow_interior(0, m, is_root)?;
                self.buffer.set_free(parent);
                if is_root {
                    self.path[0] = new;
                    self.buffer.note_root(new);
                    return Ok(());
                }
                old_child = parent;
                first = new;
                second = None;
                level -= 1;
                continue;
            }

            // Split the parent. Pair pages carry their top key with them,
            // so nothing is promoted out: the grandparent separator is the
            // left half's largest key.
            let left_t = m - m / 2;
            let new_left = self.emit_ow_interior(0, left_t, false)?;
            let new_right = self.emit_ow_interior(left_t, m, false)?;
            self.tmp_key.copy_from_slice(self.scratch.key(left_t - 1));
            self.node_count += 1;
            self.buffer.set_free(parent);
            trace!(parent, level, m, "split overwrite interior");

            if level == 0 {
                return self.grow_root(new_left, new_right);
            }
            old_child = parent;
            first = new_left;
            second = Some(new_right);
            level -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Maintenance.

    /// Rewrites interior nodes bottom-up until no mapping remains, leaving
    /// every on-disk pointer direct. Run by `close` so a later `recover`
    /// does not depend on the (volatile) mapping table.
    ///
    /// Child ids are embedded directly as the recursion unwinds, so the
    /// drain never needs a free mapping slot itself.
    pub fn clear_mappings(&mut self) -> Result<()> {
        if self.layout.mode != Mode::CopyOnWrite || self.mappings.is_empty() {
            return Ok(());
        }
        debug!(mappings = self.mappings.len(), "draining mapping table");
        let root = self.path[0];
        let new_root = self.clear_mappings_node(root, 0)?;
        if new_root != root {
            self.path[0] = new_root;
            self.buffer.note_root(new_root);
            self.buffer.set_free(root);
        }
        debug_assert!(self.mappings.is_empty());
        Ok(())
    }

    /// Drains the subtree under `raw` and returns its current physical id
    /// (a fresh page when any child pointer had to be embedded). The caller
    /// owns retiring the id it previously held.
    fn clear_mappings_node(&mut self, raw: PageId, level: usize) -> Result<PageId> {
        let page = self.mappings.resolve(raw);
        if level >= self.levels - 1 {
            return Ok(page);
        }
        let count = {
            let frame = self.buffer.read(page)?;
            NodeRef::new(self.buffer.frame(frame), &self.layout)?.count()
        };

        // Close runs outside any put, so a per-level child list is fine.
        let mut children = Vec::with_capacity(count + 1);
        let mut changed = false;
        for i in 0..=count {
            let child_raw = {
                let frame = self.buffer.read(page)?;
                NodeRef::new(self.buffer.frame(frame), &self.layout)?.child_at(i)
            };
            let child_now = self.clear_mappings_node(child_raw, level + 1)?;
            if child_now != child_raw {
                // The stale id (anchor or superseded page) dies here; a
                // rewritten child already retired its previous location.
                self.mappings.remove(child_raw);
                self.buffer.set_free(child_raw);
                changed = true;
            }
            children.push(child_now);
        }
        if !changed {
            return Ok(page);
        }

        if self.reserve_space(2)? == SpaceOutcome::Full {
            bail!("no space to drain mappings");
        }
        self.buffer.read_into(page, 0)?;
        {
            let Tree { buffer, layout, .. } = self;
            let mut node = NodeMut::new(buffer.frame_mut(0), layout)?;
            for (i, &child) in children.iter().enumerate() {
                node.set_child(i, child);
            }
            node.set_prev_id(None);
        }
        let new = self.buffer.write(0)?;
        if level > 0 {
            self.buffer.set_free(page);
        }
        Ok(new)
    }

    /// Indented structural dump, for tests and debugging.
    pub fn dump(&mut self) -> Result<String> {
        let mut out = String::new();
        let root = self.path[0];
        self.dump_node(root, 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(&mut self, page: PageId, depth: usize, out: &mut String) -> Result<()> {
        use std::fmt::Write;

        let page = self.mappings.resolve(page);
        let frame = self.buffer.read(page)?;
        let (logical, prev, root, interior, count, children) = {
            let node = NodeRef::new(self.buffer.frame(frame), &self.layout)?;
            let interior = node.is_interior();
            let children: Vec<PageId> = if interior {
                if node.overwrite_layout() {
                    (0..node.capacity())
                        .filter(|&s| node.slot_live(s))
                        .map(|s| node.child_at(s))
                        .collect()
                } else {
                    (0..=node.count()).map(|i| node.child_at(i)).collect()
                }
            } else {
                Vec::new()
            };
            let count = if node.overwrite_layout() {
                node.live_count()
            } else {
                node.count()
            };
            (
                node.logical_id(),
                node.prev_id(),
                node.is_root(),
                interior,
                count,
                children,
            )
        };
        writeln!(
            out,
            "{:indent$}id={logical} page={page} n={count} {}{}{}",
            "",
            if interior { "interior" } else { "leaf" },
            if root { " root" } else { "" },
            match prev {
                Some(p) if p != page => format!(" prev={p}"),
                _ => String::new(),
            },
            indent = depth * 2
        )?;
        for child in children {
            self.dump_node(child, depth + 1, out)?;
        }
        Ok(())
    }

    /// Advisory: pushes buffered writes toward the medium.
    pub fn flush(&mut self) -> Result<()> {
        self.buffer.flush()
    }

    /// Drains the mapping table (copy-on-write mode), flushes and releases
    /// the storage driver. The on-disk image is then self-describing and
    /// [`Tree::recover`] can reopen it.
    pub fn close(&mut self) -> Result<()> {
        self.clear_mappings()?;
        self.buffer.flush()?;
        self.buffer.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, TreeConfig};
    use crate::storage::{FileStorage, MediaProfile, MemStorage};
    use tempfile::tempdir;

    fn key(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn value(v: u32) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..4].copy_from_slice(&v.to_le_bytes());
        out[4..8].copy_from_slice(&v.to_le_bytes());
        out
    }

    fn mem_tree(mode: Mode, capacity: u32) -> Tree {
        let mut config = TreeConfig::small(mode);
        if mode.requires_erase() {
            config.erase_block_pages = 8;
        }
        let profile = match mode {
            Mode::UpdateInPlace => MediaProfile::Unrestricted,
            Mode::CopyOnWrite => MediaProfile::NandStrict,
            Mode::InPageOverwrite => MediaProfile::NorOverwrite,
        };
        let storage = MemStorage::new(capacity, config.page_size, profile);
        Tree::create(config, Box::new(storage)).unwrap()
    }

    fn check_all(tree: &mut Tree, keys: impl Iterator<Item = u32>) {
        let mut out = [0u8; 12];
        for k in keys {
            assert!(
                tree.get(&key(k), &mut out).unwrap(),
                "key {k} missing from tree"
            );
            assert_eq!(out, value(k), "wrong data for key {k}");
        }
    }

    #[test]
    fn empty_tree_returns_not_found() {
        for mode in [Mode::UpdateInPlace, Mode::CopyOnWrite, Mode::InPageOverwrite] {
            let mut tree = mem_tree(mode, 64);
            let mut out = [0u8; 12];
            assert!(!tree.get(&key(1), &mut out).unwrap());
        }
    }

    #[test]
    fn single_record_round_trips_in_every_mode() {
        for mode in [Mode::UpdateInPlace, Mode::CopyOnWrite, Mode::InPageOverwrite] {
            let mut tree = mem_tree(mode, 64);
            assert_eq!(tree.put(&key(42), &value(42)).unwrap(), PutResult::Inserted);
            check_all(&mut tree, std::iter::once(42));
        }
    }

    #[test]
    fn replacing_a_key_reports_replaced_and_keeps_one_copy() {
        for mode in [Mode::UpdateInPlace, Mode::CopyOnWrite, Mode::InPageOverwrite] {
            let mut tree = mem_tree(mode, 256);
            for k in 0..100u32 {
                tree.put(&key(k), &value(k)).unwrap();
            }
            assert_eq!(tree.put(&key(7), &value(999)).unwrap(), PutResult::Replaced);
            let mut out = [0u8; 12];
            assert!(tree.get(&key(7), &mut out).unwrap());
            assert_eq!(out, value(999));
            // Every other key is untouched.
            check_all(&mut tree, (0..100).filter(|&k| k != 7));
        }
    }

    #[test]
    fn replacing_inside_a_full_overwrite_page_rebuilds_it() {
        let mut tree = mem_tree(Mode::InPageOverwrite, 256);
        // 30 slots per leaf; fill the root leaf exactly.
        for k in 0..30u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }
        assert_eq!(tree.height(), 1);
        // No free slot remains, so the replace compacts and rewrites fresh.
        assert_eq!(tree.put(&key(3), &value(777)).unwrap(), PutResult::Replaced);
        let mut out = [0u8; 12];
        assert!(tree.get(&key(3), &mut out).unwrap());
        assert_eq!(out, value(777));
        check_all(&mut tree, (0..30).filter(|&k| k != 3));
    }

    #[test]
    fn sequential_insert_then_lookup_a_thousand_keys() {
        for mode in [Mode::UpdateInPlace, Mode::CopyOnWrite, Mode::InPageOverwrite] {
            let mut tree = mem_tree(mode, 4096);
            for k in 1..=1000u32 {
                assert_eq!(
                    tree.put(&key(k), &value(k)).unwrap(),
                    PutResult::Inserted,
                    "insert {k} failed in {mode:?}"
                );
            }
            check_all(&mut tree, 1..=1000);
            assert!(tree.height() <= 4, "height {} in {mode:?}", tree.height());
        }
    }

    #[test]
    fn descending_insert_order_round_trips() {
        for mode in [Mode::UpdateInPlace, Mode::CopyOnWrite, Mode::InPageOverwrite] {
            let mut tree = mem_tree(mode, 4096);
            for k in (0..600u32).rev() {
                tree.put(&key(k), &value(k)).unwrap();
            }
            check_all(&mut tree, 0..600);
        }
    }

    #[test]
    fn random_permutation_of_ten_thousand_keys() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let mut keys: Vec<u32> = (0..10_000).collect();
        keys.shuffle(&mut rng);

        let mut tree = mem_tree(Mode::CopyOnWrite, 8192);
        for &k in &keys {
            assert_eq!(tree.put(&key(k), &value(k)).unwrap(), PutResult::Inserted);
        }
        check_all(&mut tree, keys.iter().copied());
    }

    #[test]
    fn out_of_range_lookups_return_not_found() {
        let mut tree = mem_tree(Mode::CopyOnWrite, 4096);
        for k in 0..1000u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }
        let mut out = [0u8; 12];
        // Negative one as unsigned, and a key far past the maximum.
        assert!(!tree.get(&key(u32::MAX), &mut out).unwrap());
        assert!(!tree.get(&key(3_500_000), &mut out).unwrap());
    }

    #[test]
    fn mapping_pressure_drains_by_rewriting_ancestors() {
        // Eight mapping slots only; in-order inserts on copy-on-write.
        let mut config = TreeConfig::small(Mode::CopyOnWrite);
        config.mapping_bytes = 64;
        let storage = MemStorage::new(4096, config.page_size, MediaProfile::NandStrict);
        let mut tree = Tree::create(config, Box::new(storage)).unwrap();

        for k in 0..1000u32 {
            assert_eq!(
                tree.put(&key(k), &value(k)).unwrap(),
                PutResult::Inserted,
                "insert {k} under mapping pressure"
            );
        }
        check_all(&mut tree, 0..1000);
        assert!(tree.mapping_len() <= 8);
        assert!(tree.mapping_compares() > 0);
    }

    #[test]
    fn copy_on_write_wraps_a_small_device_many_times() {
        // The reference flash geometry: 6700 pages in 4-page erase blocks.
        let mut config = TreeConfig::small(Mode::CopyOnWrite);
        config.erase_block_pages = 4;
        let storage = MemStorage::new(6700, config.page_size, MediaProfile::NandStrict);
        let mut tree = Tree::create(config, Box::new(storage)).unwrap();

        let n = 50_000u32;
        for k in 0..n {
            assert_eq!(
                tree.put(&key(k), &value(k)).unwrap(),
                PutResult::Inserted,
                "insert {k} after wraparound"
            );
        }
        // More writes than pages proves the cursor lapped the device; the
        // NAND-strict media profile would have failed any write to a
        // non-erased page.
        assert!(tree.stats().writes > 6700);
        assert!(tree.stats().erases > 0);
        check_all(&mut tree, (0..n).step_by(97));
        check_all(&mut tree, n - 100..n);
    }

    #[test]
    fn update_in_place_device_reports_full_cleanly() {
        let mut tree = mem_tree(Mode::UpdateInPlace, 16);
        let mut full_seen = false;
        for k in 0..2000u32 {
            match tree.put(&key(k), &value(k)).unwrap() {
                PutResult::Inserted => {}
                PutResult::Full => {
                    full_seen = true;
                    // The failing put changed nothing; earlier keys survive.
                    check_all(&mut tree, 0..k.min(100));
                    break;
                }
                PutResult::Replaced => unreachable!(),
            }
        }
        assert!(full_seen);
    }

    #[test]
    fn clear_mappings_leaves_pointers_direct() {
        let mut tree = mem_tree(Mode::CopyOnWrite, 4096);
        for k in 0..800u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }
        assert!(tree.mapping_len() > 0);
        tree.clear_mappings().unwrap();
        assert_eq!(tree.mapping_len(), 0);
        check_all(&mut tree, 0..800);
    }

    #[test]
    fn recovery_reopens_a_cleanly_closed_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");
        let config = {
            let mut c = TreeConfig::small(Mode::CopyOnWrite);
            c.mapping_bytes = 1024;
            c
        };

        {
            let storage = FileStorage::create(&path, 4096, config.page_size).unwrap();
            let mut tree = Tree::create(config.clone(), Box::new(storage)).unwrap();
            for k in 0..500u32 {
                tree.put(&key(k), &value(k)).unwrap();
            }
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        let storage = FileStorage::open(&path, config.page_size).unwrap();
        let mut tree = Tree::recover(config, Box::new(storage)).unwrap();
        check_all(&mut tree, 0..500);
        // The recovered tree keeps accepting writes.
        for k in 500..600u32 {
            assert_eq!(tree.put(&key(k), &value(k)).unwrap(), PutResult::Inserted);
        }
        check_all(&mut tree, 0..600);
    }

    #[test]
    fn recover_on_a_blank_device_starts_fresh() {
        let config = TreeConfig::small(Mode::CopyOnWrite);
        let storage = MemStorage::new(256, config.page_size, MediaProfile::NandStrict);
        let mut tree = Tree::recover(config, Box::new(storage)).unwrap();
        assert_eq!(tree.height(), 1);
        let mut out = [0u8; 12];
        assert!(!tree.get(&key(1), &mut out).unwrap());
        assert_eq!(tree.put(&key(1), &value(1)).unwrap(), PutResult::Inserted);
        check_all(&mut tree, std::iter::once(1));
    }

    #[test]
    fn free_map_agrees_with_reachability() {
        let mut tree = mem_tree(Mode::CopyOnWrite, 2048);
        for k in 0..700u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }

        // Collect every page reachable from the root, plus mapping prevs
        // (reserved slots) and currs.
        let mut live = std::collections::BTreeSet::new();
        let root = tree.path[0];
        collect_live(&mut tree, root, 0, &mut live);
        for (prev, curr) in tree.mappings.iter().collect::<Vec<_>>() {
            live.insert(prev);
            live.insert(curr);
        }

        for page in 0..tree.buffer.capacity_pages() {
            let reachable = live.contains(&page);
            assert_eq!(
                !tree.buffer.is_free(page),
                reachable,
                "free bit disagrees with reachability for page {page}"
            );
        }
    }

    fn collect_live(
        tree: &mut Tree,
        page: PageId,
        level: usize,
        live: &mut std::collections::BTreeSet<PageId>,
    ) {
        let page = tree.mappings.resolve(page);
        live.insert(page);
        if level >= tree.levels - 1 {
            return;
        }
        let children: Vec<PageId> = {
            let frame = tree.buffer.read(page).unwrap();
            let node = NodeRef::new(tree.buffer.frame(frame), &tree.layout).unwrap();
            (0..=node.count()).map(|i| node.child_at(i)).collect()
        };
        for child in children {
            collect_live(tree, child, level + 1, live);
        }
    }

    #[test]
    fn sorted_pages_keep_strictly_increasing_keys() {
        let mut tree = mem_tree(Mode::CopyOnWrite, 4096);
        for k in [500u32, 20, 900, 1, 640, 333, 721, 55] {
            tree.put(&key(k), &value(k)).unwrap();
        }
        for k in 1000..1600u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }

        let mut stack = vec![(tree.path[0], 0usize)];
        while let Some((page, level)) = stack.pop() {
            let page = tree.mappings.resolve(page);
            let frame = tree.buffer.read(page).unwrap();
            let node = NodeRef::new(tree.buffer.frame(frame), &tree.layout).unwrap();
            let count = node.count();
            let mut prev: Option<Vec<u8>> = None;
            for i in 0..count {
                let k = node.key_at(i).to_vec();
                if let Some(p) = prev {
                    assert!(
                        (tree.layout.compare)(&p, &k) == Ordering::Less,
                        "keys out of order at page {page}"
                    );
                }
                prev = Some(k);
            }
            if level < tree.levels - 1 {
                let children: Vec<PageId> = (0..=count).map(|i| node.child_at(i)).collect();
                for c in children {
                    stack.push((c, level + 1));
                }
            }
        }
    }

    #[test]
    fn dump_renders_every_level() {
        let mut tree = mem_tree(Mode::CopyOnWrite, 4096);
        for k in 0..200u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }
        let dump = tree.dump().unwrap();
        assert!(dump.contains("interior"));
        assert!(dump.contains("leaf"));
        assert!(dump.lines().count() as u64 >= tree.node_count());
    }

    #[test]
    fn overwrite_mode_prefers_in_place_updates() {
        let mut tree = mem_tree(Mode::InPageOverwrite, 1024);
        for k in 0..25u32 {
            tree.put(&key(k), &value(k)).unwrap();
        }
        let stats = tree.stats();
        // One fresh write for the root; everything else overwrote in place.
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.overwrites, 25);
    }
}
