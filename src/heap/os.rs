use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum OsError {
    BreakFailed(std::io::Error),
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::BreakFailed(e) => write!(f, "program break extension failed: {e}"),
            OsError::MapFailed(e) => write!(f, "anonymous mapping failed: {e}"),
            OsError::UnmapFailed(e) => write!(f, "unmapping failed: {e}"),
        }
    }
}

impl std::error::Error for OsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OsError::BreakFailed(e) | OsError::MapFailed(e) | OsError::UnmapFailed(e) => Some(e),
        }
    }
}

/// Abstract interface over the two ways the allocator obtains address space.
///
/// The break side models `sbrk`: a single upward-growing region, never
/// returned to the OS. The mapping side models `mmap(MAP_ANONYMOUS)`:
/// independent regions released individually via [`unmap`](OsOps::unmap).
///
/// Methods take `&mut self` so a test double can carry its own state
/// (simulated break cursor, failure injection) per allocator instance.
pub trait OsOps {
    /// Extend the program break by `increment` bytes.
    ///
    /// Returns the *previous* break, which is the base of the newly usable
    /// region. `increment == 0` queries without growing.
    fn grow_break(&mut self, increment: usize) -> Result<NonNull<u8>, OsError>;

    /// Current program break, without moving it.
    fn current_break(&mut self) -> Result<NonNull<u8>, OsError> {
        self.grow_break(0)
    }

    /// Map `len` anonymous read/write bytes. The region is page-aligned.
    fn map_anonymous(&mut self, len: usize) -> Result<NonNull<u8>, OsError>;

    /// Unmap a region previously returned by [`map_anonymous`](OsOps::map_anonymous).
    ///
    /// # Safety
    /// `ptr` and `len` must be exactly the base and length of one prior
    /// `map_anonymous` call, and nothing may reference the region afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), OsError>;

    /// OS page size.
    fn page_size(&self) -> usize;
}

/// The real OS, via libc.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformOs;

impl OsOps for PlatformOs {
    fn grow_break(&mut self, increment: usize) -> Result<NonNull<u8>, OsError> {
        let delta = isize::try_from(increment).map_err(|_| {
            OsError::BreakFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "break increment exceeds isize::MAX",
            ))
        })?;

        // Safety: FFI call to sbrk.
        let ret = unsafe { libc::sbrk(delta) };
        if ret as isize == -1 {
            return Err(OsError::BreakFailed(std::io::Error::last_os_error()));
        }

        match NonNull::new(ret.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(OsError::BreakFailed(std::io::Error::other(
                "sbrk returned null",
            ))),
        }
    }

    fn map_anonymous(&mut self, len: usize) -> Result<NonNull<u8>, OsError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(OsError::MapFailed(std::io::Error::last_os_error()));
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(OsError::MapFailed(std::io::Error::other(
                "mmap returned null",
            ))),
        }
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), OsError> {
        // Safety: FFI call to munmap; ptr/len come from map_anonymous per the
        // trait contract.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(OsError::UnmapFailed(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        use std::sync::OnceLock;
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(
                raw > 0,
                "sysconf(_SC_PAGESIZE) failed: {}",
                std::io::Error::last_os_error()
            );
            // PORTABILITY: this crate supports only 64-bit targets; page size
            // fits in usize there.
            #[allow(clippy::cast_sign_loss)]
            {
                raw as usize
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Test double: simulated break inside one heap-backed arena.
//
// Unit tests must not move the real program break — the test harness's own
// allocator shares it. Every "break" here is a cursor into a single
// `std::alloc` region; anonymous maps are independent heap allocations.
// Failure injection covers the OS-exhaustion paths.
// ---------------------------------------------------------------------------
#[cfg(test)]
pub(crate) struct ArenaOs {
    base: NonNull<u8>,
    limit: usize,
    brk: usize,
    maps: Vec<(NonNull<u8>, usize)>,
    fail_next_break: bool,
    fail_next_map: bool,
}

#[cfg(test)]
const ARENA_ALIGN: usize = 4096;

#[cfg(test)]
impl ArenaOs {
    pub fn new(limit: usize) -> Self {
        Self::with_break_skew(limit, 0)
    }

    /// Arena whose initial break sits `skew` bytes past an aligned boundary,
    /// for exercising the first-growth alignment padding.
    pub fn with_break_skew(limit: usize, skew: usize) -> Self {
        assert!(limit > 0 && skew < limit);
        let layout = std::alloc::Layout::from_size_align(limit, ARENA_ALIGN).unwrap();
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(ptr).expect("arena allocation failed");
        Self {
            base,
            limit,
            brk: skew,
            maps: Vec::new(),
            fail_next_break: false,
            fail_next_map: false,
        }
    }

    /// Bytes the simulated break has advanced since construction (including
    /// any skew offset the arena started with).
    pub fn break_used(&self) -> usize {
        self.brk
    }

    pub fn live_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn fail_next_break(&mut self) {
        self.fail_next_break = true;
    }

    pub fn fail_next_map(&mut self) {
        self.fail_next_map = true;
    }
}

#[cfg(test)]
impl OsOps for ArenaOs {
    fn grow_break(&mut self, increment: usize) -> Result<NonNull<u8>, OsError> {
        if increment > 0 && std::mem::take(&mut self.fail_next_break) {
            return Err(OsError::BreakFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "injected break failure",
            )));
        }
        let new_brk = self.brk.checked_add(increment).filter(|&b| b <= self.limit);
        let Some(new_brk) = new_brk else {
            return Err(OsError::BreakFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "arena exhausted",
            )));
        };
        // Safety: brk <= limit, so the offset stays inside the arena
        // allocation (one-past-the-end at most).
        let old = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        self.brk = new_brk;
        Ok(old)
    }

    fn map_anonymous(&mut self, len: usize) -> Result<NonNull<u8>, OsError> {
        if std::mem::take(&mut self.fail_next_map) {
            return Err(OsError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "injected map failure",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(len.max(1), ARENA_ALIGN)
            .map_err(|e| OsError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let Some(p) = NonNull::new(ptr) else {
            return Err(OsError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "arena map allocation failed",
            )));
        };
        self.maps.push((p, len));
        Ok(p)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), OsError> {
        let Some(idx) = self
            .maps
            .iter()
            .position(|&(p, l)| p == ptr && l == len)
        else {
            return Err(OsError::UnmapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unmap of unknown region",
            )));
        };
        self.maps.swap_remove(idx);
        let layout = std::alloc::Layout::from_size_align(len.max(1), ARENA_ALIGN)
            .map_err(|e| OsError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout in map_anonymous.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        4096
    }
}

#[cfg(test)]
impl Drop for ArenaOs {
    fn drop(&mut self) {
        // Free leaked maps first (an allocator drop normally unmaps its own).
        for &(ptr, len) in &self.maps {
            let layout =
                std::alloc::Layout::from_size_align(len.max(1), ARENA_ALIGN).unwrap();
            // Safety: ptr was allocated with this layout in map_anonymous.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
        let layout = std::alloc::Layout::from_size_align(self.limit, ARENA_ALIGN).unwrap();
        // Safety: base was allocated with this layout in with_break_skew.
        unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_page_size_is_power_of_two() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let size = PlatformOs.page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_platform_map_unmap_roundtrip() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = PlatformOs;
        let len = os.page_size();
        let ptr = os.map_anonymous(len).expect("map failed");
        // Safety: fresh RW mapping of `len` bytes.
        unsafe {
            ptr.as_ptr().write(0xA5);
            ptr.as_ptr().add(len - 1).write(0x5A);
            assert_eq!(ptr.as_ptr().read(), 0xA5);
            assert_eq!(ptr.as_ptr().add(len - 1).read(), 0x5A);
        }
        // Safety: ptr/len from map_anonymous above.
        unsafe { os.unmap(ptr, len).expect("unmap failed") };
    }

    #[test]
    fn test_arena_break_grows_contiguously() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = ArenaOs::new(4096);
        let first = os.grow_break(100).unwrap();
        let second = os.grow_break(50).unwrap();
        // The old break returned by the second growth is the end of the first.
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 100);
        assert_eq!(os.break_used(), 150);
    }

    #[test]
    fn test_arena_break_query_does_not_grow() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = ArenaOs::new(4096);
        os.grow_break(64).unwrap();
        let cur = os.current_break().unwrap();
        let again = os.current_break().unwrap();
        assert_eq!(cur, again);
        assert_eq!(os.break_used(), 64);
    }

    #[test]
    fn test_arena_exhaustion_is_an_error() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = ArenaOs::new(256);
        os.grow_break(200).unwrap();
        assert!(os.grow_break(100).is_err());
        // A failed growth must not move the break.
        assert_eq!(os.break_used(), 200);
    }

    #[test]
    fn test_arena_failure_injection_is_single_shot() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = ArenaOs::new(4096);
        os.fail_next_break();
        assert!(os.grow_break(16).is_err());
        assert!(os.grow_break(16).is_ok());
    }

    #[test]
    fn test_arena_map_bookkeeping() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = ArenaOs::new(4096);
        let a = os.map_anonymous(1000).unwrap();
        let b = os.map_anonymous(2000).unwrap();
        assert_eq!(os.live_maps(), 2);
        // Safety: regions from map_anonymous above.
        unsafe {
            os.unmap(a, 1000).unwrap();
            assert_eq!(os.live_maps(), 1);
            os.unmap(b, 2000).unwrap();
        }
        assert_eq!(os.live_maps(), 0);
    }

    #[test]
    fn test_arena_unmap_unknown_region_is_an_error() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut os = ArenaOs::new(4096);
        let a = os.map_anonymous(1000).unwrap();
        // Wrong length: must be rejected, region stays live.
        // Safety: test code; the call is expected to fail without touching `a`.
        assert!(unsafe { os.unmap(a, 999) }.is_err());
        assert_eq!(os.live_maps(), 1);
        // Safety: correct base and length.
        unsafe { os.unmap(a, 1000).unwrap() };
    }
}
