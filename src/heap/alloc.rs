use super::bins::FreeBins;
use super::block::{block_end, header_of, payload_of, BlockHeader, ALIGNMENT, HEADER_SIZE};
use super::list::BlockList;
use super::os::{OsError, OsOps, PlatformOs};
use super::stats;
use std::fmt;
use std::ptr::NonNull;

/// Requests at or above this many payload bytes bypass the program break
/// and get their own anonymous mapping.
pub const LARGE_THRESHOLD: usize = 128 * 1024;

/// Hard ceiling on a single request, in bytes. Checked against the raw
/// request before alignment rounding, so a request just under the ceiling
/// may round up to exactly the ceiling and still be served.
pub const MAX_REQUEST: usize = 100_000_000;

/// A split only happens when the leftover would be a viable free block:
/// at least this many payload bytes beyond the new header.
pub(crate) const SPLIT_SLACK: usize = 128;

/// How `allocate` recycles freed break blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecyclePolicy {
    /// Freed break blocks are never reused; every allocation grows the break.
    None,
    /// Linear first-fit scan over the whole break chain.
    FirstFit,
    /// Best fit out of the 128 size-class buckets.
    BinnedFit,
}

/// Policy switches for [`HeapAllocator`]. Set at construction time.
///
/// The presets form a ladder of progressively smarter allocators; the
/// default is the full policy ([`HeapConfig::level4`]).
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    pub recycle: RecyclePolicy,

    /// Carve oversized winners into a used head and a free tail.
    pub split: bool,

    /// Merge adjacent free break blocks on free and after splits.
    pub coalesce: bool,

    /// Serve requests of [`LARGE_THRESHOLD`] and up from anonymous mappings.
    pub map_large: bool,

    /// Grow a free chain tail in place instead of allocating fresh when
    /// nothing recycled fits.
    pub extend_tail: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::level4()
    }
}

impl HeapConfig {
    /// Bare break growth: no recycling of any kind.
    #[must_use]
    pub fn level1() -> Self {
        Self {
            recycle: RecyclePolicy::None,
            split: false,
            coalesce: false,
            map_large: false,
            extend_tail: false,
        }
    }

    /// Linear first-fit reuse, whole blocks only.
    #[must_use]
    pub fn level2() -> Self {
        Self {
            recycle: RecyclePolicy::FirstFit,
            ..Self::level1()
        }
    }

    /// Bins, splitting, coalescing, large-request mapping, and tail
    /// extension. Identical to [`level4`](Self::level4): the remaining
    /// historical delta was payload alignment, which this crate applies at
    /// every level because headers live in band and must stay naturally
    /// aligned.
    #[must_use]
    pub fn level3() -> Self {
        Self::level4()
    }

    /// The full policy.
    #[must_use]
    pub fn level4() -> Self {
        Self {
            recycle: RecyclePolicy::BinnedFit,
            split: true,
            coalesce: true,
            map_large: true,
            extend_tail: true,
        }
    }
}

#[derive(Debug)]
pub enum AllocError {
    /// Zero-size or beyond [`MAX_REQUEST`]. Overflowing element counts in
    /// [`HeapAllocator::callocate`] land here too.
    InvalidRequest { size: usize },
    /// The OS declined to hand out more address space.
    Os(OsError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidRequest { size } => {
                write!(f, "invalid allocation request of {size} bytes")
            }
            AllocError::Os(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::InvalidRequest { .. } => None,
            AllocError::Os(e) => Some(e),
        }
    }
}

impl From<OsError> for AllocError {
    fn from(e: OsError) -> Self {
        AllocError::Os(e)
    }
}

/// Snapshot of the introspection counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub meta_data_bytes: usize,
    pub header_size: usize,
}

#[inline]
fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// The block manager: an address-ordered chain of break blocks, a separate
/// chain of mapped blocks, and the free-block index.
///
/// Single-threaded by design — every operation takes `&mut self` and the
/// type assumes it is the sole user of the program break. Wrap an instance
/// yourself when it must be shared; [`GlobalHeap`] does exactly that for
/// the process-wide default.
///
/// Break memory is never returned to the OS. Mapped blocks are unmapped on
/// free, and whatever is still mapped when the allocator drops is unmapped
/// then.
pub struct HeapAllocator<O: OsOps = PlatformOs> {
    os: O,
    config: HeapConfig,
    brk_chain: BlockList,
    mapped_chain: BlockList,
    bins: FreeBins,
    break_aligned: bool,
}

// Safety: the allocator exclusively owns every header behind its raw
// pointers; moving it across threads moves that ownership with it.
unsafe impl<O: OsOps + Send> Send for HeapAllocator<O> {}

impl HeapAllocator<PlatformOs> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    #[must_use]
    pub fn with_config(config: HeapConfig) -> Self {
        Self::with_os(PlatformOs, config)
    }
}

impl Default for HeapAllocator<PlatformOs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: OsOps> HeapAllocator<O> {
    pub fn with_os(os: O, config: HeapConfig) -> Self {
        Self {
            os,
            config,
            brk_chain: BlockList::new(),
            mapped_chain: BlockList::new(),
            bins: FreeBins::new(),
            break_aligned: false,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Allocate `size` payload bytes.
    ///
    /// The request is served by the first match in the policy ladder:
    /// anonymous mapping (at or above [`LARGE_THRESHOLD`]), a recycled free
    /// block (split when the leftover is viable), growing a free chain tail
    /// in place, or fresh break growth.
    ///
    /// Zero-size and beyond-ceiling requests fail without touching any
    /// state, as does OS exhaustion anywhere along the ladder.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 || size > MAX_REQUEST {
            return Err(AllocError::InvalidRequest { size });
        }
        let size = align_up(size);

        if self.config.map_large && size >= LARGE_THRESHOLD {
            return self.map_block(size);
        }

        match self.config.recycle {
            RecyclePolicy::None => {}
            RecyclePolicy::FirstFit => {
                if let Some(block) = self.recycle_first_fit(size) {
                    return Ok(payload_of(block));
                }
            }
            RecyclePolicy::BinnedFit => {
                if let Some(block) = self.recycle_binned(size) {
                    return Ok(payload_of(block));
                }
            }
        }

        if self.config.extend_tail {
            if let Some(p) = self.try_extend_tail(size)? {
                return Ok(p);
            }
        }

        self.grow_fresh(size)
    }

    /// Allocate zeroed storage for `count` elements of `elem_size` bytes.
    ///
    /// An overflowing product is rejected like an oversize request.
    pub fn callocate(&mut self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count
            .checked_mul(elem_size)
            .ok_or(AllocError::InvalidRequest { size: usize::MAX })?;
        let p = self.allocate(total)?;
        // Safety: allocate returned at least `total` usable bytes.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, total) };
        Ok(p)
    }

    /// Release the block backing `ptr`. `None` is a no-op.
    ///
    /// Mapped blocks are unmapped immediately. Break blocks go back into
    /// the free index and merge with free address neighbors on both sides.
    ///
    /// # Safety
    /// `ptr`, if `Some`, must be a payload pointer returned by this
    /// allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(p) = ptr else { return };
        // Safety: caller contract — p backs a live block of this allocator.
        let block = unsafe { header_of(p) };

        // Routed on the header's own record of where the block lives, not
        // on its size: coalescing can grow a break block past the mapping
        // threshold.
        if unsafe { (*block.as_ptr()).is_mapped } {
            let total = unsafe { (*block.as_ptr()).size } + HEADER_SIZE;
            // Safety: mapped blocks live in the mapped chain.
            unsafe { self.mapped_chain.remove(block) };
            stats::sub_saturating(&stats::MAPPED_LIVE, total);
            // Safety: the block was mapped with exactly this base and
            // length. A failed unmap has no recovery; the region leaks.
            drop(unsafe { self.os.unmap(block.cast(), total) });
            return;
        }

        if matches!(self.config.recycle, RecyclePolicy::None) {
            // Nothing recycles break blocks under this policy.
            return;
        }

        // Safety: block is a live break-chain header.
        unsafe {
            debug_assert!(!(*block.as_ptr()).is_free, "double free");
            self.bin(block);
        }
        if self.config.coalesce {
            // Safety: block is live and free.
            unsafe { self.coalesce_neighbors(block) };
        }
    }

    /// Resize the block backing `ptr` to `size` payload bytes.
    ///
    /// A `None` pointer delegates to [`allocate`](Self::allocate). Break
    /// blocks try every in-place option — reuse (with split), absorbing a
    /// free neighbor on either or both sides, extending the chain tail —
    /// before falling back to allocate-copy-free. Mapped blocks always
    /// move. Copies are overlap-safe because an absorbed left neighbor
    /// shifts the payload downward in place.
    ///
    /// # Safety
    /// `ptr`, if `Some`, must be a payload pointer returned by this
    /// allocator and not freed since. On success the old pointer is invalid
    /// whenever the returned pointer differs from it.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 || size > MAX_REQUEST {
            return Err(AllocError::InvalidRequest { size });
        }
        let Some(p) = ptr else {
            return self.allocate(size);
        };
        let size = align_up(size);
        // Safety: caller contract — p backs a live block of this allocator.
        let block = unsafe { header_of(p) };
        let old_size = unsafe { (*block.as_ptr()).size };

        // Mapped blocks always move: allocate (any path), copy, unmap.
        if unsafe { (*block.as_ptr()).is_mapped } {
            let new = self.allocate(size)?;
            // Safety: both payloads are live; the length is within each.
            unsafe {
                std::ptr::copy(p.as_ptr(), new.as_ptr(), old_size.min(size));
                self.free(Some(p));
            }
            return Ok(new);
        }

        // (a) The block already fits: reuse in place.
        if old_size >= size {
            if self.splittable(old_size, size) {
                // Safety: block is live, in use, and off the index.
                unsafe {
                    self.split_tail(block, size);
                    self.coalesce_after_split(block);
                }
            }
            return Ok(p);
        }

        let can_merge = self.config.coalesce;

        // Safety: chain nodes are live headers.
        let (prev, next) = unsafe { ((*block.as_ptr()).prev, (*block.as_ptr()).next) };
        let prev_if_free: Option<(NonNull<BlockHeader>, usize)> = prev.and_then(|q| {
            // Safety: see above.
            unsafe { (*q.as_ptr()).is_free.then(|| (q, (*q.as_ptr()).size)) }
        });
        let next_if_free: Option<(NonNull<BlockHeader>, usize)> = next.and_then(|q| {
            // Safety: see above.
            unsafe { (*q.as_ptr()).is_free.then(|| (q, (*q.as_ptr()).size)) }
        });

        // (b) Absorb the free left neighbor; the payload moves down.
        if let Some((target, prev_size)) = prev_if_free {
            if can_merge && prev_size + HEADER_SIZE + old_size >= size {
                // Safety: target is free and directly before block.
                unsafe {
                    self.unbin(target);
                    (*target.as_ptr()).is_free = false;
                    self.absorb_successor(target, block);
                    std::ptr::copy(p.as_ptr(), payload_of(target).as_ptr(), old_size.min(size));
                    if self.splittable((*target.as_ptr()).size, size) {
                        self.split_tail(target, size);
                        self.coalesce_after_split(target);
                    }
                }
                return Ok(payload_of(target));
            }
        }

        // (c) Absorb the free right neighbor; no move needed.
        if let Some((neighbor, next_size)) = next_if_free {
            if can_merge && old_size + HEADER_SIZE + next_size >= size {
                // Safety: neighbor is free and directly after block.
                unsafe {
                    self.unbin(neighbor);
                    self.absorb_successor(block, neighbor);
                    if self.splittable((*block.as_ptr()).size, size) {
                        self.split_tail(block, size);
                        self.coalesce_after_split(block);
                    }
                }
                return Ok(p);
            }
        }

        // (d) Absorb both neighbors; the payload moves down.
        if let (Some((target, prev_size)), Some((neighbor, next_size))) =
            (prev_if_free, next_if_free)
        {
            if can_merge && prev_size + old_size + next_size + 2 * HEADER_SIZE >= size {
                // Safety: both neighbors are free and adjacent.
                unsafe {
                    self.unbin(target);
                    self.unbin(neighbor);
                    (*target.as_ptr()).is_free = false;
                    self.absorb_successor(target, block);
                    self.absorb_successor(target, neighbor);
                    std::ptr::copy(p.as_ptr(), payload_of(target).as_ptr(), old_size.min(size));
                    if self.splittable((*target.as_ptr()).size, size) {
                        self.split_tail(target, size);
                        self.coalesce_after_split(target);
                    }
                }
                return Ok(payload_of(target));
            }
        }

        // (e) Chain tail: extend the break by the shortfall, absorbing a
        // free left neighbor first when there is one.
        if next.is_none() && self.config.extend_tail {
            let (target, capacity) = match prev_if_free {
                Some((q, prev_size)) if self.config.coalesce => {
                    (q, prev_size + HEADER_SIZE + old_size)
                }
                _ => (block, old_size),
            };
            // A sufficient capacity would have matched (a) or (b) above.
            debug_assert!(capacity < size);
            // The break grows before any header is touched, so an exhausted
            // OS leaves the heap exactly as it was.
            self.os.grow_break(size - capacity).map_err(AllocError::Os)?;
            stats::BREAK_GROWN.add(size - capacity);
            // Safety: target is live; when it differs from block it is the
            // free left neighbor being absorbed.
            unsafe {
                if target == block {
                    (*block.as_ptr()).size = size;
                } else {
                    self.unbin(target);
                    (*target.as_ptr()).is_free = false;
                    self.absorb_successor(target, block);
                    (*target.as_ptr()).size = size;
                    std::ptr::copy(p.as_ptr(), payload_of(target).as_ptr(), old_size);
                }
            }
            return Ok(payload_of(target));
        }

        // (f) Move: allocate fresh, copy, release the original.
        let new = self.allocate(size)?;
        // Safety: source and destination are live payloads.
        unsafe {
            std::ptr::copy(p.as_ptr(), new.as_ptr(), old_size.min(size));
            self.free(Some(p));
        }
        Ok(new)
    }

    // ------------------------------------------------------------------
    // Introspection counters
    // ------------------------------------------------------------------

    /// Break-chain blocks currently free.
    pub fn num_free_blocks(&self) -> usize {
        self.brk_chain
            .iter()
            // Safety: chain nodes are live headers.
            .filter(|&b| unsafe { (*b.as_ptr()).is_free })
            .count()
    }

    /// Payload bytes sitting in free break blocks.
    pub fn num_free_bytes(&self) -> usize {
        self.brk_chain
            .iter()
            // Safety: chain nodes are live headers.
            .filter_map(|b| unsafe { (*b.as_ptr()).is_free.then(|| (*b.as_ptr()).size) })
            .sum()
    }

    /// Blocks in both chains, free and used alike.
    pub fn num_allocated_blocks(&self) -> usize {
        self.brk_chain.iter().count() + self.mapped_chain.iter().count()
    }

    /// Payload bytes in both chains, excluding headers.
    pub fn num_allocated_bytes(&self) -> usize {
        self.brk_chain
            .iter()
            .chain(self.mapped_chain.iter())
            // Safety: chain nodes are live headers.
            .map(|b| unsafe { (*b.as_ptr()).size })
            .sum()
    }

    /// Header bytes across both chains.
    pub fn num_meta_data_bytes(&self) -> usize {
        self.num_allocated_blocks() * HEADER_SIZE
    }

    /// Size of a single block header.
    #[must_use]
    pub fn size_meta_data(&self) -> usize {
        HEADER_SIZE
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            free_blocks: self.num_free_blocks(),
            free_bytes: self.num_free_bytes(),
            allocated_blocks: self.num_allocated_blocks(),
            allocated_bytes: self.num_allocated_bytes(),
            meta_data_bytes: self.num_meta_data_bytes(),
            header_size: HEADER_SIZE,
        }
    }

    // ------------------------------------------------------------------
    // Policy internals
    // ------------------------------------------------------------------

    fn splittable(&self, have: usize, need: usize) -> bool {
        self.config.split && have >= need + HEADER_SIZE + SPLIT_SLACK
    }

    /// Mark a break block free and index it when the policy keeps an index.
    ///
    /// # Safety
    /// `block` must be a live break-chain header that is not binned.
    unsafe fn bin(&mut self, block: NonNull<BlockHeader>) {
        // Safety: block is live.
        unsafe {
            (*block.as_ptr()).is_free = true;
            if self.config.recycle == RecyclePolicy::BinnedFit {
                self.bins.insert(block);
            }
        }
    }

    /// Take a block out of the index when the policy keeps one.
    ///
    /// # Safety
    /// Under [`RecyclePolicy::BinnedFit`], `block` must currently be binned.
    unsafe fn unbin(&mut self, block: NonNull<BlockHeader>) {
        if self.config.recycle == RecyclePolicy::BinnedFit {
            // Safety: forwarded contract.
            unsafe { self.bins.remove(block) };
        }
    }

    fn recycle_binned(&mut self, size: usize) -> Option<NonNull<BlockHeader>> {
        // Safety: the index only holds live break-chain headers.
        let block = unsafe { self.bins.take_best_fit(size) }?;
        // Safety: block is live and no longer binned.
        unsafe {
            (*block.as_ptr()).is_free = false;
            if self.splittable((*block.as_ptr()).size, size) {
                self.split_tail(block, size);
            }
        }
        Some(block)
    }

    fn recycle_first_fit(&mut self, size: usize) -> Option<NonNull<BlockHeader>> {
        let mut cur = self.brk_chain.head();
        while let Some(b) = cur {
            // Safety: chain nodes are live headers.
            let (b_free, b_size, b_next) =
                unsafe { ((*b.as_ptr()).is_free, (*b.as_ptr()).size, (*b.as_ptr()).next) };
            if b_free && b_size >= size {
                // Safety: b is live. The whole block is handed over.
                unsafe { (*b.as_ptr()).is_free = false };
                return Some(b);
            }
            cur = b_next;
        }
        None
    }

    /// Grow a free chain tail in place. `Ok(None)` means the path does not
    /// apply; a break failure surfaces without touching the tail.
    fn try_extend_tail(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(tail) = self.brk_chain.last() else {
            return Ok(None);
        };
        // Safety: tail is a live header.
        let (tail_free, tail_size) = unsafe { ((*tail.as_ptr()).is_free, (*tail.as_ptr()).size) };
        if !tail_free {
            return Ok(None);
        }
        let Some(shortfall) = size.checked_sub(tail_size) else {
            // A fitting free tail would have been recycled already.
            return Ok(None);
        };
        self.os.grow_break(shortfall).map_err(AllocError::Os)?;
        stats::BREAK_GROWN.add(shortfall);
        // Safety: tail is live, free, and (under BinnedFit) binned.
        unsafe {
            self.unbin(tail);
            (*tail.as_ptr()).size = size;
            (*tail.as_ptr()).is_free = false;
        }
        Ok(Some(payload_of(tail)))
    }

    fn grow_fresh(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.align_initial_break()?;
        let total = size + HEADER_SIZE;
        let base = self.os.grow_break(total)?;
        stats::BREAK_GROWN.add(total);
        #[cfg(debug_assertions)]
        if let Some(last) = self.brk_chain.last() {
            // The allocator is the break's sole user, so growth continues
            // the chain without a gap.
            // Safety: last is a live header.
            debug_assert_eq!(unsafe { block_end(last) }, base.as_ptr());
        }
        let block = base.cast::<BlockHeader>();
        // Safety: the region is `total` fresh bytes; initial padding plus
        // rounded sizes keep every break position aligned.
        unsafe {
            BlockHeader::init(block, size, false, false);
            self.brk_chain.push_back(block);
        }
        Ok(payload_of(block))
    }

    fn map_block(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = size + HEADER_SIZE;
        let base = self.os.map_anonymous(total)?;
        stats::MAPPED_LIVE.add(total);
        let block = base.cast::<BlockHeader>();
        // Safety: fresh page-aligned mapping of `total` bytes.
        unsafe {
            BlockHeader::init(block, size, false, true);
            self.mapped_chain.push_back(block);
        }
        Ok(payload_of(block))
    }

    /// Pad the break so the first header lands aligned. Runs once, before
    /// the first growth.
    fn align_initial_break(&mut self) -> Result<(), AllocError> {
        if self.break_aligned {
            return Ok(());
        }
        let cur = self.os.current_break()?;
        let rem = (cur.as_ptr() as usize) % ALIGNMENT;
        if rem != 0 {
            self.os.grow_break(ALIGNMENT - rem)?;
            stats::BREAK_GROWN.add(ALIGNMENT - rem);
        }
        self.break_aligned = true;
        Ok(())
    }

    /// Shrink `block` to exactly `need` payload bytes and carve the rest
    /// into a new free block linked directly after it.
    ///
    /// # Safety
    /// `block` must be live, off the index, and satisfy the split
    /// threshold for `need`.
    unsafe fn split_tail(&mut self, block: NonNull<BlockHeader>, need: usize) {
        // Safety: the leftover region lies inside block's old extent and is
        // aligned because `need` and HEADER_SIZE are.
        unsafe {
            let total = (*block.as_ptr()).size;
            debug_assert!(total >= need + HEADER_SIZE + SPLIT_SLACK);
            let rest =
                NonNull::new_unchecked(payload_of(block).as_ptr().add(need).cast::<BlockHeader>());
            (*block.as_ptr()).size = need;
            BlockHeader::init(rest, total - need - HEADER_SIZE, true, false);
            self.brk_chain.insert_after(block, rest);
            self.bin(rest);
        }
    }

    /// Merge the free block directly after a split with *its* free
    /// successor, if any. A split drops a free block right before a
    /// possibly-free neighbor; this restores the no-adjacent-free rule.
    ///
    /// # Safety
    /// `block` must be a live break-chain header.
    unsafe fn coalesce_after_split(&mut self, block: NonNull<BlockHeader>) {
        if !self.config.coalesce {
            return;
        }
        // Safety: chain nodes are live headers.
        unsafe {
            let Some(first) = (*block.as_ptr()).next else {
                return;
            };
            if !(*first.as_ptr()).is_free {
                return;
            }
            let Some(second) = (*first.as_ptr()).next else {
                return;
            };
            if !(*second.as_ptr()).is_free {
                return;
            }
            self.merge_pair(first, second);
        }
    }

    /// Merge a just-freed block with its free address neighbors. Both
    /// merges are independent; when both fire the result is a three-way
    /// coalesce.
    ///
    /// # Safety
    /// `block` must be live and free.
    unsafe fn coalesce_neighbors(&mut self, block: NonNull<BlockHeader>) {
        // Safety: chain nodes are live headers.
        unsafe {
            if let Some(next) = (*block.as_ptr()).next {
                if (*next.as_ptr()).is_free {
                    self.merge_pair(block, next);
                }
            }
            if let Some(prev) = (*block.as_ptr()).prev {
                if (*prev.as_ptr()).is_free {
                    self.merge_pair(prev, block);
                }
            }
        }
    }

    /// Merge two adjacent free blocks; `second` is absorbed into `first`
    /// and the grown block is re-indexed.
    ///
    /// # Safety
    /// Both blocks must be live, free, and adjacent in that order.
    unsafe fn merge_pair(&mut self, first: NonNull<BlockHeader>, second: NonNull<BlockHeader>) {
        // Safety: forwarded contract.
        unsafe {
            self.unbin(first);
            self.unbin(second);
            self.absorb_successor(first, second);
            self.bin(first);
        }
    }

    /// Splice `second` (the immediate successor of `first`) out of the
    /// break chain and add its whole extent — header included — to `first`.
    ///
    /// # Safety
    /// `first` and `second` must be live and adjacent; `second` must not be
    /// binned.
    unsafe fn absorb_successor(&mut self, first: NonNull<BlockHeader>, second: NonNull<BlockHeader>) {
        // Safety: both are live chain members per the contract.
        unsafe {
            debug_assert_eq!((*first.as_ptr()).next, Some(second));
            debug_assert_eq!(block_end(first), second.as_ptr().cast::<u8>());
            let grown = (*first.as_ptr()).size + HEADER_SIZE + (*second.as_ptr()).size;
            self.brk_chain.remove(second);
            (*first.as_ptr()).size = grown;
        }
    }
}

impl<O: OsOps> Drop for HeapAllocator<O> {
    fn drop(&mut self) {
        // Unmap whatever the caller leaked. Break memory stays with the
        // process; the break is never moved back.
        let mut cur = self.mapped_chain.head();
        while let Some(block) = cur {
            // Safety: mapped-chain nodes are live mapped headers with the
            // recorded base and length.
            unsafe {
                cur = (*block.as_ptr()).next;
                let total = (*block.as_ptr()).size + HEADER_SIZE;
                stats::sub_saturating(&stats::MAPPED_LIVE, total);
                drop(self.os.unmap(block.cast(), total));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide default instance
// ---------------------------------------------------------------------------

/// The process-wide default allocator, lazily initialized with the full
/// policy over the real OS.
///
/// The core type is single-threaded; this facade serialises access behind
/// a mutex purely so the `static` is sound to share. Call [`init`]
/// (GlobalHeap::init) once up front when using it as a `#[global_allocator]`
/// so initialization never re-enters the allocator.
pub struct GlobalHeap;

static GLOBAL: std::sync::OnceLock<std::sync::Mutex<HeapAllocator<PlatformOs>>> =
    std::sync::OnceLock::new();

impl GlobalHeap {
    /// Force initialization of the default instance.
    pub fn init() {
        let _ = Self::instance();
    }

    fn instance() -> &'static std::sync::Mutex<HeapAllocator<PlatformOs>> {
        GLOBAL.get_or_init(|| std::sync::Mutex::new(HeapAllocator::new()))
    }

    fn lock() -> std::sync::MutexGuard<'static, HeapAllocator<PlatformOs>> {
        // Recover from poisoning: a panicking caller must not wedge the
        // process heap.
        Self::instance()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        Self::lock().allocate(size).ok()
    }

    pub fn callocate(count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        Self::lock().callocate(count, elem_size).ok()
    }

    /// # Safety
    /// Same contract as [`HeapAllocator::reallocate`].
    pub unsafe fn reallocate(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        // Safety: forwarded contract.
        unsafe { Self::lock().reallocate(ptr, size) }.ok()
    }

    /// # Safety
    /// Same contract as [`HeapAllocator::free`].
    pub unsafe fn free(ptr: Option<NonNull<u8>>) {
        // Safety: forwarded contract.
        unsafe { Self::lock().free(ptr) }
    }

    pub fn num_free_blocks() -> usize {
        Self::lock().num_free_blocks()
    }

    pub fn num_free_bytes() -> usize {
        Self::lock().num_free_bytes()
    }

    pub fn num_allocated_blocks() -> usize {
        Self::lock().num_allocated_blocks()
    }

    pub fn num_allocated_bytes() -> usize {
        Self::lock().num_allocated_bytes()
    }

    pub fn num_meta_data_bytes() -> usize {
        Self::lock().num_meta_data_bytes()
    }

    pub fn size_meta_data() -> usize {
        HEADER_SIZE
    }

    #[must_use]
    pub fn stats() -> HeapStats {
        Self::lock().stats()
    }
}

// Payloads are ALIGNMENT-aligned, so layouts demanding more are declined
// with a null rather than served misaligned.
unsafe impl std::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return std::ptr::null_mut();
        }
        Self::allocate(layout.size()).map_or(std::ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        // Safety: GlobalAlloc contract — ptr came from alloc on this
        // allocator.
        unsafe { Self::free(NonNull::new(ptr)) }
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
impl<O: OsOps> HeapAllocator<O> {
    pub(crate) fn os_ref(&self) -> &O {
        &self.os
    }

    pub(crate) fn os_mut(&mut self) -> &mut O {
        &mut self.os
    }

    /// Structural self-check, run after every operation in trace tests:
    /// chain ordering and contiguity, the no-adjacent-free rule, bin
    /// membership mirroring the free flag, payload alignment, and mapped
    /// blocks staying in their own chain and size range.
    pub(crate) fn check_invariants(&self) {
        let mut prev: Option<NonNull<BlockHeader>> = None;
        let mut cur = self.brk_chain.head();
        while let Some(b) = cur {
            // Safety: chain nodes are live headers.
            let hdr = unsafe { b.as_ref() };
            assert_eq!(hdr.prev, prev, "broken chain back-link");
            if let Some(pb) = prev {
                // Safety: pb is a live header.
                assert_eq!(
                    unsafe { block_end(pb) },
                    b.as_ptr().cast::<u8>(),
                    "chain gap: break blocks must be contiguous"
                );
                if self.config.coalesce {
                    // Safety: pb is a live header.
                    assert!(
                        !(unsafe { (*pb.as_ptr()).is_free } && hdr.is_free),
                        "adjacent free blocks survived coalescing"
                    );
                }
            }
            assert_eq!(
                payload_of(b).as_ptr() as usize % ALIGNMENT,
                0,
                "misaligned payload"
            );
            assert_eq!(hdr.size % ALIGNMENT, 0, "unrounded block size");
            assert!(!hdr.is_mapped, "mapped block in the break chain");
            if self.config.recycle == RecyclePolicy::BinnedFit {
                assert_eq!(
                    hdr.is_free,
                    self.bins.contains(b),
                    "bin membership must mirror the free flag"
                );
            }
            prev = cur;
            cur = hdr.next;
        }
        self.bins.check();
        for m in self.mapped_chain.iter() {
            // Safety: mapped-chain nodes are live headers.
            let hdr = unsafe { m.as_ref() };
            assert!(hdr.is_mapped, "break block in the mapped chain");
            assert!(!hdr.is_free, "mapped blocks are never free");
            assert!(hdr.size >= LARGE_THRESHOLD, "undersized mapped block");
            assert!(
                hdr.bin_next.is_none() && hdr.bin_prev.is_none(),
                "mapped block in a bucket"
            );
        }
    }
}
