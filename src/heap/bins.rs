use super::block::{payload_of, BlockHeader};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Number of size-class buckets.
pub(crate) const BIN_COUNT: usize = 128;

/// Width of one size class in bytes.
pub(crate) const BIN_WIDTH: usize = 1024;

/// 32-bit canary written at the start of every binned payload and checked
/// when the block leaves its bucket, to detect writes through stale
/// pointers. Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
const FREE_CANARY: u32 = 0xF4EE_B10C;

/// Size class of a payload size: one bucket per KiB, clamped to the top
/// bucket for anything beyond the table.
#[inline]
pub(crate) fn bucket_of(size: usize) -> usize {
    (size / BIN_WIDTH).min(BIN_COUNT - 1)
}

/// The free-block index: one intrusive doubly linked list per size class,
/// threaded through `BlockHeader::bin_next`/`bin_prev`, kept in ascending
/// size order within each bucket.
///
/// The occupancy bitmap mirrors which buckets are non-empty so a best-fit
/// scan can skip empty classes without touching their heads.
pub(crate) struct FreeBins {
    heads: [Option<NonNull<BlockHeader>>; BIN_COUNT],
    occupied: FixedBitSet,
}

impl FreeBins {
    pub fn new() -> Self {
        Self {
            heads: [None; BIN_COUNT],
            occupied: FixedBitSet::with_capacity(BIN_COUNT),
        }
    }

    /// Insert `block` into the bucket for its size, keeping the bucket
    /// sorted by ascending size (ties go before their equals). Marks the
    /// block free.
    ///
    /// # Safety
    /// `block` must be a live break-chain header that is not currently
    /// binned.
    pub unsafe fn insert(&mut self, block: NonNull<BlockHeader>) {
        // Safety: block is live per the contract; bucket members are live.
        unsafe {
            (*block.as_ptr()).is_free = true;
            canary_write(block);
            let size = (*block.as_ptr()).size;
            let bucket = bucket_of(size);
            self.occupied.insert(bucket);

            let mut prev: Option<NonNull<BlockHeader>> = None;
            let mut cur = self.heads[bucket];
            while let Some(c) = cur {
                if (*c.as_ptr()).size >= size {
                    break;
                }
                prev = cur;
                cur = (*c.as_ptr()).bin_next;
            }

            (*block.as_ptr()).bin_prev = prev;
            (*block.as_ptr()).bin_next = cur;
            if let Some(c) = cur {
                (*c.as_ptr()).bin_prev = Some(block);
            }
            match prev {
                Some(p) => (*p.as_ptr()).bin_next = Some(block),
                None => self.heads[bucket] = Some(block),
            }
        }
    }

    /// Unlink `block` from its bucket and clear its bin links. The one
    /// removal routine for every path that takes a block out of the index.
    ///
    /// # Safety
    /// `block` must currently be binned, and its size unchanged since
    /// insertion.
    pub unsafe fn remove(&mut self, block: NonNull<BlockHeader>) {
        // Safety: block and its bucket neighbors are live headers.
        unsafe {
            canary_check(block);
            let bucket = bucket_of((*block.as_ptr()).size);
            let prev = (*block.as_ptr()).bin_prev;
            let next = (*block.as_ptr()).bin_next;
            match prev {
                Some(p) => (*p.as_ptr()).bin_next = next,
                None => self.heads[bucket] = next,
            }
            if let Some(n) = next {
                (*n.as_ptr()).bin_prev = prev;
            }
            (*block.as_ptr()).bin_next = None;
            (*block.as_ptr()).bin_prev = None;
            if self.heads[bucket].is_none() {
                self.occupied.set(bucket, false);
            }
        }
    }

    /// Find the first block that satisfies `size`, scanning buckets from
    /// `bucket_of(size)` upward and each bucket head-to-tail. Ascending
    /// intra-bucket order makes the first fit the best fit. The winner is
    /// removed from the index before being returned.
    ///
    /// # Safety
    /// The index must only contain live headers.
    pub unsafe fn take_best_fit(&mut self, size: usize) -> Option<NonNull<BlockHeader>> {
        for bucket in bucket_of(size)..BIN_COUNT {
            if !self.occupied.contains(bucket) {
                continue;
            }
            let mut cur = self.heads[bucket];
            while let Some(c) = cur {
                // Safety: bucket members are live headers.
                if unsafe { (*c.as_ptr()).size } >= size {
                    // Safety: c is binned.
                    unsafe { self.remove(c) };
                    return Some(c);
                }
                // Safety: see above.
                cur = unsafe { (*c.as_ptr()).bin_next };
            }
        }
        None
    }
}

/// # Safety
/// `block` must be live, with at least 4 payload bytes when the canary is
/// active (sizes are alignment-rounded, so this always holds).
#[inline]
unsafe fn canary_write(block: NonNull<BlockHeader>) {
    #[cfg(debug_assertions)]
    // Safety: a free payload is dead storage owned by the allocator; the
    // payload pointer is ALIGNMENT-aligned.
    unsafe {
        if (*block.as_ptr()).size >= 4 {
            payload_of(block).as_ptr().cast::<u32>().write(FREE_CANARY);
        }
    }
    #[cfg(not(debug_assertions))]
    let _ = block;
}

/// # Safety
/// Same as [`canary_write`].
#[inline]
unsafe fn canary_check(block: NonNull<BlockHeader>) {
    #[cfg(debug_assertions)]
    // Safety: see canary_write.
    unsafe {
        if (*block.as_ptr()).size >= 4 {
            let canary = payload_of(block).as_ptr().cast::<u32>().read();
            assert!(
                canary == FREE_CANARY,
                "heap corruption: free-block canary at {:p} was 0x{canary:08x}, expected 0x{FREE_CANARY:08x}",
                payload_of(block),
            );
        }
    }
    #[cfg(not(debug_assertions))]
    let _ = block;
}

#[cfg(test)]
impl FreeBins {
    /// Pointer-equality membership probe for the bucket matching `block`'s
    /// size.
    pub fn contains(&self, block: NonNull<BlockHeader>) -> bool {
        // Safety: test invariant checks only run against live headers.
        let bucket = bucket_of(unsafe { (*block.as_ptr()).size });
        let mut cur = self.heads[bucket];
        while let Some(c) = cur {
            if c == block {
                return true;
            }
            // Safety: see above.
            cur = unsafe { (*c.as_ptr()).bin_next };
        }
        false
    }

    pub fn bucket_len(&self, bucket: usize) -> usize {
        let mut n = 0;
        let mut cur = self.heads[bucket];
        while let Some(c) = cur {
            n += 1;
            // Safety: bucket members are live headers.
            cur = unsafe { (*c.as_ptr()).bin_next };
        }
        n
    }

    /// Structural self-check: link symmetry, ascending sizes, bucket
    /// classification, free flags, and occupancy-bitmap agreement.
    pub fn check(&self) {
        for bucket in 0..BIN_COUNT {
            assert_eq!(
                self.occupied.contains(bucket),
                self.heads[bucket].is_some(),
                "occupancy bit disagrees with bucket {bucket}"
            );
            let mut prev: Option<NonNull<BlockHeader>> = None;
            let mut prev_size = 0usize;
            let mut cur = self.heads[bucket];
            while let Some(c) = cur {
                // Safety: bucket members are live headers.
                let hdr = unsafe { c.as_ref() };
                assert!(hdr.is_free, "binned block is not marked free");
                assert_eq!(bucket_of(hdr.size), bucket, "block in wrong bucket");
                assert_eq!(hdr.bin_prev, prev, "broken bin back-link");
                assert!(hdr.size >= prev_size, "bucket not in ascending size order");
                prev_size = hdr.size;
                prev = cur;
                cur = hdr.bin_next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::block::HEADER_SIZE;
    use super::*;

    const SLOT: usize = HEADER_SIZE + 16;

    #[repr(align(16))]
    struct Slab([u8; SLOT * 16]);

    // Headers with chosen sizes; physical slots only need room for the
    // canary, the `size` field is what the index sorts on.
    fn headers(slab: &mut Slab, sizes: &[usize]) -> Vec<NonNull<BlockHeader>> {
        let base = slab.0.as_mut_ptr();
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                // Safety: slot i is in bounds, aligned, and large enough for
                // a header plus canary.
                let block = unsafe {
                    NonNull::new_unchecked(base.add(i * SLOT).cast::<BlockHeader>())
                };
                // Safety: see above.
                unsafe { BlockHeader::init(block, size, true, false) };
                block
            })
            .collect()
    }

    #[test]
    fn test_bucket_of_boundaries() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(1023), 0);
        assert_eq!(bucket_of(1024), 1);
        assert_eq!(bucket_of(2047), 1);
        assert_eq!(bucket_of(127 * 1024), 127);
        // Sizes past the table clamp into the top bucket.
        assert_eq!(bucket_of(128 * 1024), 127);
        assert_eq!(bucket_of(100_000_000), 127);
    }

    #[test]
    fn test_insert_keeps_buckets_sorted() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut slab = Slab([0; SLOT * 16]);
        let nodes = headers(&mut slab, &[600, 200, 400, 400]);
        let mut bins = FreeBins::new();
        // Safety: fresh unbinned headers.
        unsafe {
            for &n in &nodes {
                bins.insert(n);
            }
        }
        bins.check();
        assert_eq!(bins.bucket_len(0), 4);

        // Drain in best-fit order: must come out ascending.
        let mut sizes = Vec::new();
        // Safety: index contains live headers.
        while let Some(b) = unsafe { bins.take_best_fit(1) } {
            sizes.push(unsafe { b.as_ref().size });
        }
        assert_eq!(sizes, vec![200, 400, 400, 600]);
        assert_eq!(bins.bucket_len(0), 0);
    }

    #[test]
    fn test_remove_middle_keeps_tail() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut slab = Slab([0; SLOT * 16]);
        let nodes = headers(&mut slab, &[100, 300, 500]);
        let mut bins = FreeBins::new();
        // Safety: fresh unbinned headers.
        unsafe {
            for &n in &nodes {
                bins.insert(n);
            }
            bins.remove(nodes[1]);
        }
        bins.check();
        assert_eq!(bins.bucket_len(0), 2);
        assert!(bins.contains(nodes[0]));
        assert!(!bins.contains(nodes[1]));
        assert!(bins.contains(nodes[2]));
        // Safety: removed node is live; its bin links must be cleared.
        unsafe {
            assert!(nodes[1].as_ref().bin_next.is_none());
            assert!(nodes[1].as_ref().bin_prev.is_none());
        }
    }

    #[test]
    fn test_best_fit_scans_upward_across_buckets() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut slab = Slab([0; SLOT * 16]);
        // Bucket 0 holds only too-small blocks; bucket 2 holds the fit.
        let nodes = headers(&mut slab, &[128, 256, 2200]);
        let mut bins = FreeBins::new();
        // Safety: fresh unbinned headers.
        unsafe {
            for &n in &nodes {
                bins.insert(n);
            }
        }
        // Safety: index contains live headers.
        let winner = unsafe { bins.take_best_fit(700) };
        assert_eq!(winner, Some(nodes[2]));
        bins.check();
        // The small blocks stayed put.
        assert_eq!(bins.bucket_len(0), 2);
        assert_eq!(bins.bucket_len(2), 0);
    }

    #[test]
    fn test_no_fit_returns_none() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut slab = Slab([0; SLOT * 16]);
        let nodes = headers(&mut slab, &[128]);
        let mut bins = FreeBins::new();
        // Safety: fresh unbinned header.
        unsafe { bins.insert(nodes[0]) };
        // Safety: index contains live headers.
        assert!(unsafe { bins.take_best_fit(4096) }.is_none());
        // The probe must not disturb the index.
        assert!(bins.contains(nodes[0]));
    }

    #[test]
    fn test_insert_marks_free() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut slab = Slab([0; SLOT * 16]);
        let nodes = headers(&mut slab, &[64]);
        // Safety: node is live.
        unsafe { (*nodes[0].as_ptr()).is_free = false };
        let mut bins = FreeBins::new();
        // Safety: fresh unbinned header.
        unsafe { bins.insert(nodes[0]) };
        // Safety: node is live.
        assert!(unsafe { nodes[0].as_ref().is_free });
    }
}
