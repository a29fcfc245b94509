//! # Node Codec
//!
//! Every tree node occupies exactly one page. A 10-byte header is followed
//! by one of two record layouts, selected per page by a header flag:
//!
//! ## Page header (10 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------------
//! 0       4     logical_id  Monotonic write sequence number
//! 4       4     prev_id     Physical id of the previous incarnation,
//!                           0xFFFFFFFF = none
//! 8       2     meta        Bits 0..=11 record count (sorted layout),
//!                           bit 12 root, bit 13 interior,
//!                           bit 14 overwrite layout
//! ```
//!
//! An erased flash page reads as all ones, which decodes as a blank header
//! (`logical_id == 0xFFFFFFFF`); a zero-filled file page decodes as blank
//! too (no flags, zero ids). Recovery leans on both.
//!
//! ## Sorted layout (update-in-place and copy-on-write modes)
//!
//! Keys and values are parallel arrays at fixed strides (SoA), both ordered
//! by key:
//!
//! ```text
//! | header | keys[0..max]            | values[0..max]          |
//!            keys[i]  = 10 + i*K       values[i] = 10 + max*K + i*V
//! ```
//!
//! Interior pages store child pointers instead of values and hold one more
//! pointer than keys (the rightmost subtree).
//!
//! ## Overwrite layout (in-page-overwrite mode)
//!
//! Records sit in fixed slots in arrival order, governed by two bitmaps:
//! `free` (1 = slot writable) and `valid` (1 = record current). Occupying a
//! slot clears its free bit, superseding a record clears its valid bit —
//! both are 1 -> 0 transitions, so a slot update is a legal NOR overwrite
//! of the same physical page.
//!
//! ```text
//! | header | free bm | valid bm | keys[0..slots] | values[0..slots] |
//! ```
//!
//! Valid records are *not* key-ordered; lookups scan the page. That is the
//! point: a point lookup touches one page once, and keeping arrival order
//! is what lets an insert be a single in-place overwrite.
//!
//! Interior overwrite pages store key/child pairs under the same bitmaps.
//! The rightmost subtree rides a pair keyed by the all-0xFF sentinel
//! (carried by the rightmost page of each level): unlike a bare extra
//! pointer it can be superseded by invalidate-and-add, which keeps parent
//! patching monotone.

use eyre::{ensure, Result};
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::bitarr::{bit_clear, bit_get, bit_set, bytes_for};
use crate::config::{KeyCompare, Mode, TreeConfig};
use crate::storage::PageId;

pub const PAGE_HEADER_SIZE: usize = 10;
/// Size of an on-page child pointer.
pub const PTR_SIZE: usize = 4;
/// Sentinel physical id: "no page".
pub const NO_PAGE: PageId = u32::MAX;

const COUNT_MASK: u16 = 0x0FFF;
const FLAG_ROOT: u16 = 1 << 12;
const FLAG_INTERIOR: u16 = 1 << 13;
const FLAG_OVERWRITE: u16 = 1 << 14;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    logical_id: U32<LittleEndian>,
    prev_id: U32<LittleEndian>,
    meta: U16<LittleEndian>,
}

impl PageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn logical_id(&self) -> u32 {
        self.logical_id.get()
    }

    pub fn set_logical_id(&mut self, id: u32) {
        self.logical_id = U32::new(id);
    }

    pub fn prev_id(&self) -> Option<PageId> {
        match self.prev_id.get() {
            NO_PAGE => None,
            id => Some(id),
        }
    }

    pub fn set_prev_id(&mut self, prev: Option<PageId>) {
        self.prev_id = U32::new(prev.unwrap_or(NO_PAGE));
    }

    pub fn count(&self) -> usize {
        (self.meta.get() & COUNT_MASK) as usize
    }

    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count <= COUNT_MASK as usize);
        let flags = self.meta.get() & !COUNT_MASK;
        self.meta = U16::new(flags | count as u16 & COUNT_MASK);
    }

    pub fn is_root(&self) -> bool {
        self.meta.get() & FLAG_ROOT != 0
    }

    pub fn set_root(&mut self, root: bool) {
        let meta = self.meta.get();
        self.meta = U16::new(if root { meta | FLAG_ROOT } else { meta & !FLAG_ROOT });
    }

    pub fn is_interior(&self) -> bool {
        self.meta.get() & FLAG_INTERIOR != 0
    }

    pub fn set_interior(&mut self, interior: bool) {
        let meta = self.meta.get();
        self.meta = U16::new(if interior {
            meta | FLAG_INTERIOR
        } else {
            meta & !FLAG_INTERIOR
        });
    }

    pub fn overwrite_layout(&self) -> bool {
        self.meta.get() & FLAG_OVERWRITE != 0
    }

    /// A page that has never been written: erased flash (all ones) or a
    /// zero-filled file page. A genuine first write always carries flags.
    pub fn is_blank(&self) -> bool {
        self.logical_id.get() == u32::MAX
            || (self.logical_id.get() == 0 && self.prev_id.get() == 0 && self.meta.get() == 0)
    }
}

/// Computed geometry for one tree instance: capacities and byte offsets of
/// every region in both layouts. Built once from the configuration.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    pub page_size: usize,
    pub key_size: usize,
    pub data_size: usize,
    pub mode: Mode,
    pub compare: KeyCompare,
    /// Sorted layout: max records in a leaf.
    pub leaf_cap: usize,
    /// Sorted layout: max keys in an interior page (holds one more child).
    pub interior_cap: usize,
    /// Overwrite layout: leaf slot count and bitmap width.
    pub ow_leaf_slots: usize,
    pub ow_leaf_bm: usize,
    /// Overwrite layout: interior pair count and bitmap width.
    pub ow_interior_slots: usize,
    pub ow_interior_bm: usize,
}

/// Largest slot count such that header + two bitmaps + records fit the page.
fn overwrite_slots(page_size: usize, record_size: usize) -> usize {
    let mut slots = (page_size - PAGE_HEADER_SIZE) * 8 / (record_size * 8 + 2);
    while slots > 0 && PAGE_HEADER_SIZE + 2 * bytes_for(slots) + slots * record_size > page_size {
        slots -= 1;
    }
    slots
}

impl NodeLayout {
    pub fn new(config: &TreeConfig) -> Result<Self> {
        let record_size = config.record_size();
        let leaf_cap = (config.page_size - PAGE_HEADER_SIZE) / record_size;
        let interior_cap =
            (config.page_size - PAGE_HEADER_SIZE - PTR_SIZE) / (config.key_size + PTR_SIZE);
        let ow_leaf_slots = overwrite_slots(config.page_size, record_size);
        let ow_interior_slots = overwrite_slots(config.page_size, config.key_size + PTR_SIZE);

        let layout = Self {
            page_size: config.page_size,
            key_size: config.key_size,
            data_size: config.data_size,
            mode: config.mode,
            compare: config.compare,
            leaf_cap,
            interior_cap,
            ow_leaf_slots,
            ow_leaf_bm: bytes_for(ow_leaf_slots),
            ow_interior_slots,
            ow_interior_bm: bytes_for(ow_interior_slots),
        };
        ensure!(
            layout.leaf_cap >= 3 && layout.interior_cap >= 3,
            "page size {} too small for records of {} bytes",
            config.page_size,
            record_size
        );
        if config.mode.overwrite_layout() {
            ensure!(
                layout.ow_leaf_slots >= 3 && layout.ow_interior_slots >= 3,
                "page size {} too small for overwrite layout",
                config.page_size
            );
        }
        ensure!(
            layout.leaf_cap.max(layout.interior_cap) <= COUNT_MASK as usize,
            "record count does not fit the header count field"
        );
        Ok(layout)
    }

    pub fn record_size(&self) -> usize {
        self.key_size + self.data_size
    }

    /// Record capacity of a page with the given shape.
    pub fn capacity(&self, interior: bool, overwrite: bool) -> usize {
        match (overwrite, interior) {
            (false, false) => self.leaf_cap,
            (false, true) => self.interior_cap,
            (true, false) => self.ow_leaf_slots,
            (true, true) => self.ow_interior_slots,
        }
    }

    fn key_base(&self, interior: bool, overwrite: bool) -> usize {
        if overwrite {
            let bm = if interior {
                self.ow_interior_bm
            } else {
                self.ow_leaf_bm
            };
            PAGE_HEADER_SIZE + 2 * bm
        } else {
            PAGE_HEADER_SIZE
        }
    }

    fn value_base(&self, interior: bool, overwrite: bool) -> usize {
        self.key_base(interior, overwrite) + self.capacity(interior, overwrite) * self.key_size
    }

    fn value_stride(&self, interior: bool) -> usize {
        if interior {
            PTR_SIZE
        } else {
            self.data_size
        }
    }

    pub fn key_range(&self, interior: bool, overwrite: bool, idx: usize) -> std::ops::Range<usize> {
        let start = self.key_base(interior, overwrite) + idx * self.key_size;
        start..start + self.key_size
    }

    pub fn value_range(
        &self,
        interior: bool,
        overwrite: bool,
        idx: usize,
    ) -> std::ops::Range<usize> {
        let stride = self.value_stride(interior);
        let start = self.value_base(interior, overwrite) + idx * stride;
        start..start + stride
    }

    fn free_bm_range(&self, interior: bool) -> std::ops::Range<usize> {
        let bm = if interior {
            self.ow_interior_bm
        } else {
            self.ow_leaf_bm
        };
        PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bm
    }

    fn valid_bm_range(&self, interior: bool) -> std::ops::Range<usize> {
        let bm = if interior {
            self.ow_interior_bm
        } else {
            self.ow_leaf_bm
        };
        PAGE_HEADER_SIZE + bm..PAGE_HEADER_SIZE + 2 * bm
    }
}

/// Returns true if `key` is the all-0xFF rightmost-subtree sentinel.
pub fn is_max_key(key: &[u8]) -> bool {
    key.iter().all(|&b| b == 0xFF)
}

/// Immutable view of a node in a page frame.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    data: &'a [u8],
    layout: &'a NodeLayout,
}

/// Mutable view of a node in a page frame.
pub struct NodeMut<'a> {
    data: &'a mut [u8],
    layout: &'a NodeLayout,
}

impl<'a> NodeRef<'a> {
    pub fn new(data: &'a [u8], layout: &'a NodeLayout) -> Result<Self> {
        ensure!(
            data.len() == layout.page_size,
            "invalid page size: {} != {}",
            data.len(),
            layout.page_size
        );
        Ok(Self { data, layout })
    }

    fn header(&self) -> &PageHeader {
        PageHeader::from_bytes(self.data).unwrap() // INVARIANT: size checked in new
    }

    pub fn logical_id(&self) -> u32 {
        self.header().logical_id()
    }

    pub fn prev_id(&self) -> Option<PageId> {
        self.header().prev_id()
    }

    pub fn is_root(&self) -> bool {
        self.header().is_root()
    }

    pub fn is_interior(&self) -> bool {
        self.header().is_interior()
    }

    pub fn overwrite_layout(&self) -> bool {
        self.header().overwrite_layout()
    }

    pub fn count(&self) -> usize {
        self.header().count()
    }

    pub fn capacity(&self) -> usize {
        self.layout
            .capacity(self.is_interior(), self.overwrite_layout())
    }

    pub fn key_at(&self, idx: usize) -> &'a [u8] {
        let range = self
            .layout
            .key_range(self.is_interior(), self.overwrite_layout(), idx);
        &self.data[range]
    }

    pub fn value_at(&self, idx: usize) -> &'a [u8] {
        let range = self
            .layout
            .value_range(self.is_interior(), self.overwrite_layout(), idx);
        &self.data[range]
    }

    pub fn child_at(&self, idx: usize) -> PageId {
        debug_assert!(self.is_interior());
        let range = self
            .layout
            .value_range(true, self.overwrite_layout(), idx);
        u32::from_le_bytes(self.data[range].try_into().unwrap())
    }

    // Overwrite-layout slot state.

    pub fn slot_free(&self, slot: usize) -> bool {
        debug_assert!(self.overwrite_layout());
        bit_get(&self.data[self.layout.free_bm_range(self.is_interior())], slot)
    }

    pub fn slot_valid(&self, slot: usize) -> bool {
        debug_assert!(self.overwrite_layout());
        bit_get(&self.data[self.layout.valid_bm_range(self.is_interior())], slot)
    }

    /// A slot holding a current record: occupied and not superseded.
    pub fn slot_live(&self, slot: usize) -> bool {
        !self.slot_free(slot) && self.slot_valid(slot)
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        (0..self.capacity()).find(|&s| self.slot_free(s))
    }

    pub fn live_count(&self) -> usize {
        (0..self.capacity()).filter(|&s| self.slot_live(s)).count()
    }

    // Search.

    /// Sorted interior: index of the child to follow for `key` — the
    /// smallest `i` with `key < keys[i]`, or `count` (the rightmost child).
    /// A key equal to a separator belongs to the right of it.
    pub fn interior_child_index(&self, key: &[u8]) -> usize {
        debug_assert!(self.is_interior() && !self.overwrite_layout());
        let cmp = self.layout.compare;
        let count = self.count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(key, self.key_at(mid)) == std::cmp::Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// Sorted leaf: exact match.
    pub fn leaf_find_exact(&self, key: &[u8]) -> Option<usize> {
        debug_assert!(!self.is_interior() && !self.overwrite_layout());
        let cmp = self.layout.compare;
        let count = self.count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(self.key_at(mid), key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Sorted leaf: index of the greatest key `<= key`, or `None` when the
    /// page is empty or every key is greater.
    pub fn leaf_predecessor(&self, key: &[u8]) -> Option<usize> {
        debug_assert!(!self.is_interior() && !self.overwrite_layout());
        let cmp = self.layout.compare;
        let count = self.count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self.key_at(mid), key) == std::cmp::Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo.checked_sub(1)
    }

    /// Overwrite leaf: slot of the live record with exactly `key`.
    pub fn ow_find_key(&self, key: &[u8]) -> Option<usize> {
        debug_assert!(self.overwrite_layout());
        let cmp = self.layout.compare;
        (0..self.capacity())
            .find(|&s| self.slot_live(s) && cmp(self.key_at(s), key) == std::cmp::Ordering::Equal)
    }

    /// Overwrite interior: slot of the routing pair for `key` — the live
    /// pair with the smallest key strictly greater than `key` (a pair keyed
    /// `k` covers keys below `k`), falling back to the largest live key
    /// (the rightmost-subtree sentinel on rightmost pages).
    pub fn ow_child_slot(&self, key: &[u8]) -> Option<usize> {
        debug_assert!(self.is_interior() && self.overwrite_layout());
        let cmp = self.layout.compare;
        let mut best: Option<usize> = None;
        let mut largest: Option<usize> = None;
        for s in 0..self.capacity() {
            if !self.slot_live(s) {
                continue;
            }
            let k = self.key_at(s);
            if cmp(k, key) == std::cmp::Ordering::Greater
                && best.map_or(true, |b| cmp(k, self.key_at(b)) == std::cmp::Ordering::Less)
            {
                best = Some(s);
            }
            if largest.map_or(true, |l| cmp(k, self.key_at(l)) == std::cmp::Ordering::Greater) {
                largest = Some(s);
            }
        }
        best.or(largest)
    }

    /// Overwrite interior: slot whose child pointer equals `child`.
    pub fn ow_find_child(&self, child: PageId) -> Option<usize> {
        debug_assert!(self.is_interior() && self.overwrite_layout());
        (0..self.capacity()).find(|&s| self.slot_live(s) && self.child_at(s) == child)
    }

    /// Overwrite layout: slot of the smallest live key strictly greater
    /// than `key`. Drives in-order iteration over unsorted pages.
    pub fn ow_successor_slot(&self, key: &[u8]) -> Option<usize> {
        debug_assert!(self.overwrite_layout());
        let cmp = self.layout.compare;
        let mut best: Option<usize> = None;
        for s in 0..self.capacity() {
            if self.slot_live(s)
                && cmp(self.key_at(s), key) == std::cmp::Ordering::Greater
                && best.map_or(true, |b| {
                    cmp(self.key_at(s), self.key_at(b)) == std::cmp::Ordering::Less
                })
            {
                best = Some(s);
            }
        }
        best
    }
}

impl<'a> NodeMut<'a> {
    pub fn new(data: &'a mut [u8], layout: &'a NodeLayout) -> Result<Self> {
        ensure!(
            data.len() == layout.page_size,
            "invalid page size: {} != {}",
            data.len(),
            layout.page_size
        );
        Ok(Self { data, layout })
    }

    /// Writes a fresh header into an initialised (zero- or ones-filled)
    /// frame. In overwrite layout both bitmaps are forced to all-ones so the
    /// codec does not depend on the frame fill.
    pub fn init(
        data: &'a mut [u8],
        layout: &'a NodeLayout,
        interior: bool,
        root: bool,
    ) -> Result<Self> {
        let overwrite = layout.mode.overwrite_layout();
        let mut node = Self::new(data, layout)?;
        {
            let header = node.header_mut();
            header.set_logical_id(0);
            header.set_prev_id(None);
            let mut meta = 0u16;
            if root {
                meta |= FLAG_ROOT;
            }
            if interior {
                meta |= FLAG_INTERIOR;
            }
            if overwrite {
                meta |= FLAG_OVERWRITE;
            }
            header.meta = U16::new(meta);
        }
        if overwrite {
            node.data[layout.free_bm_range(interior)].fill(0xFF);
            node.data[layout.valid_bm_range(interior)].fill(0xFF);
        }
        Ok(node)
    }

    pub fn as_ref(&self) -> NodeRef<'_> {
        NodeRef {
            data: self.data,
            layout: self.layout,
        }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::from_bytes_mut(self.data).unwrap() // INVARIANT: size checked in new
    }

    pub fn set_prev_id(&mut self, prev: Option<PageId>) {
        self.header_mut().set_prev_id(prev);
    }

    pub fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count);
    }

    pub fn set_key(&mut self, idx: usize, key: &[u8]) {
        let interior = self.as_ref().is_interior();
        let overwrite = self.as_ref().overwrite_layout();
        let range = self.layout.key_range(interior, overwrite, idx);
        self.data[range].copy_from_slice(key);
    }

    pub fn set_value(&mut self, idx: usize, value: &[u8]) {
        let interior = self.as_ref().is_interior();
        let overwrite = self.as_ref().overwrite_layout();
        let range = self.layout.value_range(interior, overwrite, idx);
        self.data[range].copy_from_slice(value);
    }

    pub fn set_child(&mut self, idx: usize, child: PageId) {
        self.set_value(idx, &child.to_le_bytes());
    }

    /// Sorted leaf: shift the tail up and place `key`/`value` at `idx`.
    pub fn leaf_insert_at(&mut self, idx: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(!view.is_interior() && !view.overwrite_layout());
        let count = view.count();
        ensure!(count < self.layout.leaf_cap, "leaf insert into full page");
        ensure!(idx <= count, "leaf insert index {idx} out of range {count}");

        self.shift_region_up(self.layout.key_range(false, false, idx).start, count - idx, self.layout.key_size);
        self.shift_region_up(
            self.layout.value_range(false, false, idx).start,
            count - idx,
            self.layout.data_size,
        );
        self.set_key(idx, key);
        self.set_value(idx, value);
        self.set_count(count + 1);
        Ok(())
    }

    /// Sorted interior: insert separator `key` at `idx` with its two
    /// children. `children[idx]` becomes `left` and `children[idx + 1]`
    /// becomes `right`; pointers from `idx` on are shifted up first.
    pub fn interior_insert_at(
        &mut self,
        idx: usize,
        key: &[u8],
        left: PageId,
        right: PageId,
    ) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(view.is_interior() && !view.overwrite_layout());
        let count = view.count();
        ensure!(
            count < self.layout.interior_cap,
            "interior insert into full page"
        );
        ensure!(idx <= count, "interior insert index {idx} out of range {count}");

        self.shift_region_up(self.layout.key_range(true, false, idx).start, count - idx, self.layout.key_size);
        // One more pointer than keys: shift count - idx + 1 entries.
        self.shift_region_up(
            self.layout.value_range(true, false, idx).start,
            count - idx + 1,
            PTR_SIZE,
        );
        self.set_key(idx, key);
        self.set_child(idx, left);
        self.set_child(idx + 1, right);
        self.set_count(count + 1);
        Ok(())
    }

    /// Moves `entries` records of `stride` bytes starting at `base` one
    /// stride upward (toward higher indices).
    fn shift_region_up(&mut self, base: usize, entries: usize, stride: usize) {
        if entries > 0 {
            self.data
                .copy_within(base..base + entries * stride, base + stride);
        }
    }

    // Overwrite-layout slot operations. All transitions clear bits (1 -> 0)
    // so the resulting page image is a legal NOR overwrite of the old one.

    /// Occupies `slot` with a record: writes key and value, clears the free
    /// bit.
    pub fn ow_write_record(&mut self, slot: usize, key: &[u8], value: &[u8]) {
        debug_assert!(self.as_ref().slot_free(slot));
        self.set_key(slot, key);
        self.set_value(slot, value);
        let interior = self.as_ref().is_interior();
        bit_clear(&mut self.data[self.layout.free_bm_range(interior)], slot);
    }

    pub fn ow_write_pair(&mut self, slot: usize, key: &[u8], child: PageId) {
        self.ow_write_record(slot, key, &child.to_le_bytes());
    }

    /// Supersedes the record in `slot`.
    pub fn ow_invalidate(&mut self, slot: usize) {
        let interior = self.as_ref().is_interior();
        debug_assert!(!self.as_ref().slot_free(slot));
        bit_clear(&mut self.data[self.layout.valid_bm_range(interior)], slot);
    }

    /// Compacts an overwrite page in the frame: drops superseded slots,
    /// moves survivors to the front, insertion-sorts them by key and
    /// rewrites both bitmaps. Returns the surviving record count. The result
    /// is no longer overwrite-compatible with the on-disk page and must be
    /// written fresh.
    ///
    /// Insertion sort, not quicksort: slot counts are small and recursion
    /// has no place on the targets this engine runs on.
    pub fn ow_compact_sort(&mut self, tmp_key: &mut [u8], tmp_value: &mut [u8]) -> usize {
        let view = self.as_ref();
        debug_assert!(view.overwrite_layout());
        let interior = view.is_interior();
        let capacity = view.capacity();
        let value_len = self.layout.value_stride(interior);

        // Compact live records to the front, preserving slot order.
        let mut n = 0usize;
        for s in 0..capacity {
            if self.as_ref().slot_live(s) {
                if s != n {
                    let src = self.layout.key_range(interior, true, s);
                    let dst = self.layout.key_range(interior, true, n).start;
                    self.data.copy_within(src, dst);
                    let src = self.layout.value_range(interior, true, s);
                    let dst = self.layout.value_range(interior, true, n).start;
                    self.data.copy_within(src, dst);
                }
                n += 1;
            }
        }

        // Insertion sort the prefix by key.
        for i in 1..n {
            tmp_key[..self.layout.key_size].copy_from_slice(self.as_ref().key_at(i));
            tmp_value[..value_len].copy_from_slice(self.as_ref().value_at(i));
            let mut j = i;
            while j > 0 {
                let prev = self.as_ref().key_at(j - 1);
                if (self.layout.compare)(prev, &tmp_key[..self.layout.key_size])
                    != std::cmp::Ordering::Greater
                {
                    break;
                }
                let src = self.layout.key_range(interior, true, j - 1);
                let dst = self.layout.key_range(interior, true, j).start;
                self.data.copy_within(src, dst);
                let src = self.layout.value_range(interior, true, j - 1);
                let dst = self.layout.value_range(interior, true, j).start;
                self.data.copy_within(src, dst);
                j -= 1;
            }
            self.set_key(j, &tmp_key[..self.layout.key_size]);
            self.set_value(j, &tmp_value[..value_len]);
        }

        // Rebuild the bitmaps: slots 0..n occupied and valid, the rest free.
        let free_range = self.layout.free_bm_range(interior);
        self.data[free_range].fill(0xFF);
        let valid_range = self.layout.valid_bm_range(interior);
        self.data[valid_range].fill(0xFF);
        for s in 0..n {
            let free_range = self.layout.free_bm_range(interior);
            bit_clear(&mut self.data[free_range], s);
        }
        n
    }
}
