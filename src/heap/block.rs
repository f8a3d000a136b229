use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// Alignment of every payload pointer and every accounted size: the pointer
/// width of the target.
pub const ALIGNMENT: usize = size_of::<*const u8>();

/// Per-block metadata, stored in band immediately before the payload.
///
/// `next`/`prev` link the address-ordered chain the block lives in (break
/// chain or mapped chain). `bin_next`/`bin_prev` are meaningful only while
/// `is_free` is set and the block sits in a size-class bucket; they are
/// `None` otherwise.
///
/// Every header the allocator creates is naturally aligned: sizes are
/// rounded to [`ALIGNMENT`] and the header size is a multiple of it, so a
/// header placed at `block + HEADER_SIZE + size` is aligned whenever the
/// block's own header is.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Payload bytes, excluding this header. Always a multiple of [`ALIGNMENT`].
    pub size: usize,
    pub is_free: bool,
    /// Whether the block lives in an anonymous mapping rather than the
    /// break region. Size alone cannot tell the two apart: coalescing can
    /// grow a break block past any threshold, and releasing such a block
    /// must not turn into an unmap.
    pub is_mapped: bool,
    pub next: Option<NonNull<BlockHeader>>,
    pub prev: Option<NonNull<BlockHeader>>,
    pub bin_next: Option<NonNull<BlockHeader>>,
    pub bin_prev: Option<NonNull<BlockHeader>>,
}

/// Bytes of metadata in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(
    HEADER_SIZE % ALIGNMENT == 0,
    "header size must preserve payload alignment"
);
const _: () = assert!(
    align_of::<BlockHeader>() <= ALIGNMENT,
    "header must be placeable at any aligned address"
);

impl BlockHeader {
    /// Write a fresh, unlinked header at `at`.
    ///
    /// # Safety
    /// `at` must be aligned and valid for writes of `HEADER_SIZE` bytes, and
    /// no reference to an existing header at `at` may be live.
    #[inline]
    pub(crate) unsafe fn init(at: NonNull<BlockHeader>, size: usize, is_free: bool, is_mapped: bool) {
        // Safety: upheld by caller.
        unsafe {
            at.as_ptr().write(BlockHeader {
                size,
                is_free,
                is_mapped,
                next: None,
                prev: None,
                bin_next: None,
                bin_prev: None,
            });
        }
    }
}

/// Header backing a payload pointer handed out by the allocator.
///
/// # Safety
/// `payload` must be a pointer previously produced by [`payload_of`] for a
/// block whose header is still live.
#[inline]
pub(crate) unsafe fn header_of(payload: NonNull<u8>) -> NonNull<BlockHeader> {
    // Safety: the header sits HEADER_SIZE bytes before its payload.
    unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)).cast() }
}

/// First payload byte of `block`.
#[inline]
pub(crate) fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // Safety: a header always has its payload region directly behind it, so
    // the offset stays inside the block's allocation.
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
}

/// One-past-the-end address of `block`'s payload. For break blocks this is
/// the base of the successor header (or the current break for the chain
/// tail).
///
/// # Safety
/// `block` must point to a live header.
#[inline]
pub(crate) unsafe fn block_end(block: NonNull<BlockHeader>) -> *mut u8 {
    // Safety: upheld by caller; the payload extent belongs to the block.
    unsafe { payload_of(block).as_ptr().add(block.as_ref().size) }
}
