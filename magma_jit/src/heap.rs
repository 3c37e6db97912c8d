//! Executable code heap.
//!
//! One contiguous reserve-and-commit region services all code
//! allocation for a manager instance. Placement is constrained: every
//! byte of the region must be within signed-32-bit displacement of the
//! helper anchor, because emitted code reaches runtime helpers with
//! rel32 call/jump instructions.
//!
//! The region has three monotonic cursors, `committed <= used <=
//! reserved`. Pages in `[base, committed)` are mapped RWX; the rest is
//! reserved address space only. Three allocation shapes bump `used`:
//! code blocks (preceded by a [`CodeHeader`]), PData blocks (unwind +
//! GC-info bytes), and EH-info blocks. PData and EH-info requests that
//! no longer fit fall back to separate OS reservations tracked on an
//! owned side list.

use parking_lot::Mutex;

use crate::error::CodeManagerError;
use crate::header::{CodeHeader, HEADER_SIZE};

/// Reservation granule; regions are placed on 64 KiB boundaries.
pub const ALLOC_GRANULE: usize = 64 * 1024;

/// Commit granule.
pub const PAGE_SIZE: usize = 4096;

/// Half the signed-32-bit range. The whole heap must land within this
/// distance of the helper anchor in either direction.
pub const HELPER_REACH: usize = (i32::MAX / 2) as usize;

#[inline]
const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// Platform-specific shims
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    /// Reserve (no access) `size` bytes exactly at `addr`.
    ///
    /// Fails rather than displacing an existing mapping, so callers
    /// can race against concurrent address-space changes safely.
    pub unsafe fn reserve_fixed(addr: usize, size: usize) -> bool {
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let mapped = unsafe {
            libc::mmap(addr as *mut libc::c_void, size, libc::PROT_NONE, flags, -1, 0)
        };
        if mapped == libc::MAP_FAILED {
            return false;
        }
        if mapped as usize != addr {
            // Hint was not honored (non-Linux path); give it back.
            unsafe { libc::munmap(mapped, size) };
            return false;
        }
        true
    }

    /// Reserve and commit a read-write block anywhere.
    pub unsafe fn reserve_anywhere_rw(size: usize) -> *mut u8 {
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            mapped as *mut u8
        }
    }

    /// Commit reserved pages as read/write/execute.
    pub unsafe fn commit_rwx(addr: usize, size: usize) -> bool {
        unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            ) == 0
        }
    }

    /// Commit reserved pages as read/write.
    pub unsafe fn commit_rw(addr: usize, size: usize) -> bool {
        unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }
    }

    /// Release a reservation entirely.
    pub unsafe fn release(addr: usize, size: usize) {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, size);
        }
    }

    /// Currently mapped ranges, ascending. Gaps between them are free.
    #[cfg(target_os = "linux")]
    pub fn occupied_ranges() -> Vec<(usize, usize)> {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap_or_default();
        maps.lines()
            .filter_map(|line| {
                let range = line.split_whitespace().next()?;
                let (lo, hi) = range.split_once('-')?;
                Some((
                    usize::from_str_radix(lo, 16).ok()?,
                    usize::from_str_radix(hi, 16).ok()?,
                ))
            })
            .collect()
    }

    /// No query API wired up on this platform; callers probe instead.
    #[cfg(not(target_os = "linux"))]
    pub fn occupied_ranges() -> Vec<(usize, usize)> {
        Vec::new()
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
        PAGE_NOACCESS, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualQuery,
    };

    /// Reserve (no access) `size` bytes exactly at `addr`.
    pub unsafe fn reserve_fixed(addr: usize, size: usize) -> bool {
        let mapped =
            unsafe { VirtualAlloc(addr as *mut _, size, MEM_RESERVE, PAGE_NOACCESS) };
        !mapped.is_null()
    }

    /// Reserve and commit a read-write block anywhere.
    pub unsafe fn reserve_anywhere_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) as *mut u8
        }
    }

    /// Commit reserved pages as read/write/execute.
    pub unsafe fn commit_rwx(addr: usize, size: usize) -> bool {
        let mapped =
            unsafe { VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_EXECUTE_READWRITE) };
        !mapped.is_null()
    }

    /// Commit reserved pages as read/write.
    pub unsafe fn commit_rw(addr: usize, size: usize) -> bool {
        let mapped = unsafe { VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_READWRITE) };
        !mapped.is_null()
    }

    /// Release a reservation entirely.
    pub unsafe fn release(addr: usize, _size: usize) {
        unsafe {
            VirtualFree(addr as *mut _, 0, MEM_RELEASE);
        }
    }

    /// Currently mapped ranges, ascending, via the VirtualQuery walk.
    pub fn occupied_ranges() -> Vec<(usize, usize)> {
        const WALK_CEILING: usize = 0x7fff_0000_0000;
        let mut ranges = Vec::new();
        let mut addr = 0x1_0000usize;
        while addr < WALK_CEILING {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let queried = unsafe {
                VirtualQuery(
                    addr as *const _,
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if queried == 0 {
                break;
            }
            let base = info.BaseAddress as usize;
            if info.State != MEM_FREE {
                ranges.push((base, base + info.RegionSize));
            }
            addr = base + info.RegionSize;
        }
        ranges
    }
}

/// Scan free address space for a `size`-byte gap whose whole extent
/// lies inside `[range_lo, range_hi)`, and reserve it.
///
/// The scan walks mapped regions reported by the OS query API and
/// tries the gaps between them; a concurrent mapping racing us just
/// fails that one reservation attempt and the scan moves on.
fn reserve_within(range_lo: usize, range_hi: usize, size: usize) -> Option<usize> {
    let mut occupied = platform::occupied_ranges();
    occupied.sort_unstable();

    if occupied.is_empty() {
        // No query API available: probe candidate granules directly.
        let mut candidate = align_up(range_lo.max(ALLOC_GRANULE), ALLOC_GRANULE);
        let step = align_up(size, ALLOC_GRANULE).max(ALLOC_GRANULE);
        while candidate.checked_add(size).is_some_and(|end| end <= range_hi) {
            if unsafe { platform::reserve_fixed(candidate, size) } {
                return Some(candidate);
            }
            candidate += step;
        }
        return None;
    }

    let mut cursor = range_lo.max(ALLOC_GRANULE);
    for &(occ_lo, occ_hi) in occupied.iter().chain([(usize::MAX, usize::MAX)].iter()) {
        let gap_end = occ_lo.min(range_hi);
        let candidate = align_up(cursor, ALLOC_GRANULE);
        if candidate < gap_end
            && gap_end - candidate >= size
            && unsafe { platform::reserve_fixed(candidate, size) }
        {
            return Some(candidate);
        }
        cursor = cursor.max(occ_hi);
        if cursor >= range_hi {
            break;
        }
    }
    None
}

// =============================================================================
// ExecutableCodeHeap
// =============================================================================

struct HeapCursor {
    committed: usize,
    used: usize,
}

/// Fallback block reserved outside the main region when PData or
/// EH-info no longer fits. Owned here; freed with the heap.
struct FallbackRegion {
    base: usize,
    size: usize,
    used: usize,
}

/// Reserve-and-commit bump allocator for code within helper reach.
pub struct ExecutableCodeHeap {
    base: usize,
    limit: usize,
    cursor: Mutex<HeapCursor>,
    fallbacks: Mutex<Vec<FallbackRegion>>,
}

// The raw region is guarded by the cursor mutex; published code bytes
// are immutable.
unsafe impl Send for ExecutableCodeHeap {}
unsafe impl Sync for ExecutableCodeHeap {}

impl ExecutableCodeHeap {
    /// Reserve a heap of (at least) `size` bytes within PC-relative
    /// reach of `helper_anchor`.
    pub fn new(helper_anchor: usize, size: usize) -> Result<Self, CodeManagerError> {
        let size = align_up(size, ALLOC_GRANULE);
        let range_lo = helper_anchor.saturating_sub(HELPER_REACH);
        let range_hi = helper_anchor.saturating_add(HELPER_REACH);

        let base = reserve_within(range_lo, range_hi, size)
            .ok_or(CodeManagerError::OutOfAddressSpace { requested: size })?;

        Ok(ExecutableCodeHeap {
            base,
            limit: base + size,
            cursor: Mutex::new(HeapCursor {
                committed: base,
                used: base,
            }),
            fallbacks: Mutex::new(Vec::new()),
        })
    }

    /// Base address of the reserved region.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Reserved size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.limit - self.base
    }

    /// Whether `addr` falls inside the reserved region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit
    }

    /// Allocate a code block of `size` bytes aligned to `alignment`,
    /// with its [`CodeHeader`] constructed directly below it.
    ///
    /// Returns the code address; the header is at `code - HEADER_SIZE`.
    pub fn alloc_code_with_header(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8, CodeManagerError> {
        debug_assert!(alignment.is_power_of_two());
        let alignment = alignment.max(std::mem::align_of::<usize>());

        let mut cursor = self.cursor.lock();

        let header_slot = align_up(cursor.used, std::mem::align_of::<usize>());
        let code_addr = align_up(header_slot + HEADER_SIZE, alignment);
        let new_used = code_addr
            .checked_add(size)
            .ok_or(CodeManagerError::HeapFull)?;
        if new_used > self.limit {
            return Err(CodeManagerError::HeapFull);
        }

        self.commit_through(&mut cursor, new_used)?;
        cursor.used = new_used;
        drop(cursor);

        let header = (code_addr - HEADER_SIZE) as *mut CodeHeader;
        unsafe {
            CodeHeader::initialize(
                header,
                self.base as *const u8,
                (code_addr - self.base) as u32,
            );
        }
        Ok(code_addr as *mut u8)
    }

    /// Allocate a PData block (unwind bytes + trailing GC info).
    ///
    /// Bumps inside the heap when possible. When the heap is full the
    /// mutex is released and a separate block is reserved within
    /// `+i32::MAX` of the allocation cursor, keeping every unwind-data
    /// offset representable as a 32-bit distance from the heap base.
    pub fn alloc_pdata(&self, size: usize) -> Result<*mut u8, CodeManagerError> {
        match self.try_bump(size, 4) {
            Ok(addr) => Ok(addr),
            Err(CodeManagerError::HeapFull) => {
                // Extent bounds keeping unwind offsets positive and
                // within 32-bit distance of the heap base.
                let range_lo = self.limit;
                let range_hi = self.base.saturating_add(i32::MAX as usize);
                self.alloc_fallback(size, Some((range_lo, range_hi)))
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate an EH-info block. Same policy as PData except the
    /// fallback carries no placement constraint: EH tables are only
    /// ever reached through the code header's full pointer.
    pub fn alloc_eh_info(&self, size: usize) -> Result<*mut u8, CodeManagerError> {
        match self.try_bump(size, std::mem::align_of::<usize>()) {
            Ok(addr) => Ok(addr),
            Err(CodeManagerError::HeapFull) => self.alloc_fallback(size, None),
            Err(e) => Err(e),
        }
    }

    /// Bytes left between the allocation cursor and the reserve limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.cursor.lock().used
    }

    fn try_bump(&self, size: usize, alignment: usize) -> Result<*mut u8, CodeManagerError> {
        let mut cursor = self.cursor.lock();
        let addr = align_up(cursor.used, alignment);
        let new_used = addr.checked_add(size).ok_or(CodeManagerError::HeapFull)?;
        if new_used > self.limit {
            return Err(CodeManagerError::HeapFull);
        }
        self.commit_through(&mut cursor, new_used)?;
        cursor.used = new_used;
        Ok(addr as *mut u8)
    }

    /// Commit pages so that `[base, new_used)` is fully mapped.
    fn commit_through(
        &self,
        cursor: &mut HeapCursor,
        new_used: usize,
    ) -> Result<(), CodeManagerError> {
        if new_used <= cursor.committed {
            return Ok(());
        }
        let commit_end = align_up(new_used, PAGE_SIZE).min(self.limit);
        let ok = unsafe { platform::commit_rwx(cursor.committed, commit_end - cursor.committed) };
        if !ok {
            return Err(CodeManagerError::HeapFull);
        }
        cursor.committed = commit_end;
        Ok(())
    }

    /// Satisfy an allocation from a side region outside the heap.
    /// Not tracked by the heap cursor; lifetime tied to the heap.
    fn alloc_fallback(
        &self,
        size: usize,
        placement: Option<(usize, usize)>,
    ) -> Result<*mut u8, CodeManagerError> {
        let mut fallbacks = self.fallbacks.lock();

        // Reuse the tail of an existing compatible block first.
        for region in fallbacks.iter_mut() {
            let addr = align_up(region.base + region.used, std::mem::align_of::<usize>());
            let fits = addr + size <= region.base + region.size;
            let in_range = placement
                .map(|(lo, hi)| addr >= lo && addr + size <= hi)
                .unwrap_or(true);
            if fits && in_range {
                region.used = addr + size - region.base;
                return Ok(addr as *mut u8);
            }
        }

        let block_size = align_up(size, ALLOC_GRANULE);
        let base = match placement {
            Some((range_lo, range_hi)) => {
                let base = reserve_within(range_lo, range_hi, block_size)
                    .ok_or(CodeManagerError::OutOfAddressSpace { requested: block_size })?;
                let ok = unsafe { platform::commit_rw(base, block_size) };
                if !ok {
                    unsafe { platform::release(base, block_size) };
                    return Err(CodeManagerError::HeapFull);
                }
                base
            }
            None => {
                let base = unsafe { platform::reserve_anywhere_rw(block_size) } as usize;
                if base == 0 {
                    return Err(CodeManagerError::HeapFull);
                }
                base
            }
        };

        fallbacks.push(FallbackRegion {
            base,
            size: block_size,
            used: size,
        });
        Ok(base as *mut u8)
    }
}

impl Drop for ExecutableCodeHeap {
    fn drop(&mut self) {
        unsafe {
            platform::release(self.base, self.limit - self.base);
        }
        for region in self.fallbacks.lock().drain(..) {
            unsafe {
                platform::release(region.base, region.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> usize {
        // Any address inside our own image works as a stand-in for the
        // runtime helper entrypoint.
        anchor as usize
    }

    #[test]
    fn reservation_lands_within_helper_reach() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        let lo = heap.base();
        let hi = heap.base() + heap.size();
        assert_eq!(lo % ALLOC_GRANULE, 0);
        assert!(lo.abs_diff(anchor()) <= HELPER_REACH);
        assert!((hi - 1).abs_diff(anchor()) <= HELPER_REACH);
    }

    #[test]
    fn code_alloc_writes_header_invariants() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        let code = heap.alloc_code_with_header(1000, 16).expect("alloc");

        assert_eq!(code as usize % 16, 0);
        let header = unsafe { CodeHeader::for_code(code) };
        assert_eq!(header.heap_base(), heap.base() as *const u8);
        assert_eq!(
            header.heap_base() as usize + header.code_offset() as usize,
            code as usize
        );
        assert!(header.eh_info().is_null());
    }

    #[test]
    fn code_is_writable_after_alloc() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        let code = heap.alloc_code_with_header(64, 16).expect("alloc");
        unsafe {
            std::ptr::write_bytes(code, 0x90, 64);
            assert_eq!(*code, 0x90);
        }
    }

    #[test]
    fn alloc_exactly_remaining_succeeds_one_more_fails() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        // Burn a first block so the cursor is mid-heap.
        heap.alloc_code_with_header(100, 16).expect("alloc");

        let used = heap.cursor.lock().used;
        let code_addr = align_up(align_up(used, 8) + HEADER_SIZE, 16);
        let remaining = heap.limit - code_addr;

        let heap2 = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        heap2.alloc_code_with_header(100, 16).expect("alloc");
        assert!(matches!(
            heap2.alloc_code_with_header(remaining + 1, 16),
            Err(CodeManagerError::HeapFull)
        ));

        heap.alloc_code_with_header(remaining, 16)
            .expect("exact fit succeeds");
        assert_eq!(heap.remaining(), 0);
    }

    #[test]
    fn multiple_allocations_do_not_overlap() {
        let heap = ExecutableCodeHeap::new(anchor(), 128 * 1024).expect("reserve");
        let a = heap.alloc_code_with_header(1000, 16).expect("alloc") as usize;
        let b = heap.alloc_code_with_header(2000, 32).expect("alloc") as usize;
        assert!(b >= a + 1000 + HEADER_SIZE);
        assert_eq!(b % 32, 0);
    }

    #[test]
    fn pdata_bumps_inside_heap_when_space_remains() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        let pdata = heap.alloc_pdata(64).expect("pdata") as usize;
        assert!(heap.contains(pdata));
        assert!(pdata > heap.base());
        assert!(pdata - heap.base() < i32::MAX as usize);
    }

    #[test]
    fn pdata_fallback_stays_within_dword_reach_of_base() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        // Exhaust the heap.
        let remaining = heap.remaining();
        heap.alloc_code_with_header(remaining - 2 * HEADER_SIZE, 16)
            .expect("fill");

        let pdata = heap.alloc_pdata(256).expect("fallback pdata") as usize;
        assert!(!heap.contains(pdata));
        assert!(pdata > heap.base());
        assert!(pdata + 256 - heap.base() < i32::MAX as usize);

        // The block is writable.
        unsafe { std::ptr::write_bytes(pdata as *mut u8, 0xAB, 256) };
    }

    #[test]
    fn eh_info_fallback_is_unconstrained_and_writable() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        let remaining = heap.remaining();
        heap.alloc_code_with_header(remaining - 2 * HEADER_SIZE, 16)
            .expect("fill");

        let eh = heap.alloc_eh_info(128).expect("fallback eh");
        unsafe { std::ptr::write_bytes(eh, 0xCD, 128) };
    }

    #[test]
    fn fallback_blocks_are_reused_until_full() {
        let heap = ExecutableCodeHeap::new(anchor(), 64 * 1024).expect("reserve");
        let remaining = heap.remaining();
        heap.alloc_code_with_header(remaining - 2 * HEADER_SIZE, 16)
            .expect("fill");

        let a = heap.alloc_eh_info(64).expect("eh") as usize;
        let b = heap.alloc_eh_info(64).expect("eh") as usize;
        // Second allocation comes from the same side block.
        assert!(b > a && b - a < ALLOC_GRANULE);
    }
}
