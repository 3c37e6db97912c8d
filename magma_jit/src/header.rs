//! Per-method code header.
//!
//! Every emitted method body is preceded by a fixed-size header placed
//! directly below its first instruction. The header ties the code back
//! to its owning heap (for offset arithmetic against the function
//! table) and carries the EH-info pointer, which stays out of the
//! unwind blob because the OS unwinder dictates that blob's exact
//! shape.

use std::sync::atomic::{AtomicPtr, Ordering};

/// Header record written in place at `code_address - HEADER_SIZE`.
///
/// `heap_base + code_offset == code_address` always holds. The EH-info
/// pointer starts null and is written at most once; it is never
/// cleared.
#[repr(C)]
pub struct CodeHeader {
    heap_base: *const u8,
    code_offset: u32,
    eh_info: AtomicPtr<u8>,
}

/// Byte distance from the header to the code it describes.
pub const HEADER_SIZE: usize = std::mem::size_of::<CodeHeader>();

impl CodeHeader {
    /// Construct the header in place.
    ///
    /// # Safety
    /// `at` must point to `HEADER_SIZE` bytes of writable, pointer-
    /// aligned memory owned by the heap that `heap_base` names.
    pub unsafe fn initialize(at: *mut CodeHeader, heap_base: *const u8, code_offset: u32) {
        debug_assert!(!heap_base.is_null());
        debug_assert!(code_offset as usize >= HEADER_SIZE);
        unsafe {
            at.write(CodeHeader {
                heap_base,
                code_offset,
                eh_info: AtomicPtr::new(std::ptr::null_mut()),
            });
        }
    }

    /// Recover the header from a code address previously returned by
    /// the heap allocator.
    ///
    /// # Safety
    /// `code` must be an address handed out by
    /// `ExecutableCodeHeap::alloc_code_with_header`.
    #[inline]
    pub unsafe fn for_code<'a>(code: *const u8) -> &'a CodeHeader {
        unsafe { &*code.sub(HEADER_SIZE).cast::<CodeHeader>() }
    }

    /// Base of the owning heap.
    #[inline]
    pub fn heap_base(&self) -> *const u8 {
        self.heap_base
    }

    /// Offset of the code payload from the heap base.
    #[inline]
    pub fn code_offset(&self) -> u32 {
        self.code_offset
    }

    /// Attached EH-info table, or null if the method has none.
    #[inline]
    pub fn eh_info(&self) -> *const u8 {
        self.eh_info.load(Ordering::Acquire)
    }

    /// Attach the EH-info table. Called once per method, after the
    /// table bytes are fully written.
    pub fn set_eh_info(&self, eh_info: *const u8) {
        debug_assert!(self.eh_info.load(Ordering::Relaxed).is_null());
        self.eh_info.store(eh_info.cast_mut(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_its_slot() {
        // One pointer, one u32 (padded), one pointer.
        assert_eq!(HEADER_SIZE, 3 * std::mem::size_of::<usize>());
        assert_eq!(
            std::mem::align_of::<CodeHeader>(),
            std::mem::align_of::<usize>()
        );
    }

    #[test]
    fn initialize_and_read_back() {
        let mut slot = std::mem::MaybeUninit::<CodeHeader>::uninit();
        let heap_base = 0x10_0000usize as *const u8;
        unsafe {
            CodeHeader::initialize(slot.as_mut_ptr(), heap_base, 0x40);
            let header = slot.assume_init_ref();
            assert_eq!(header.heap_base(), heap_base);
            assert_eq!(header.code_offset(), 0x40);
            assert!(header.eh_info().is_null());
        }
    }

    #[test]
    fn eh_info_set_once() {
        let mut slot = std::mem::MaybeUninit::<CodeHeader>::uninit();
        unsafe {
            CodeHeader::initialize(slot.as_mut_ptr(), 0x10_0000usize as *const u8, 0x40);
            let header = slot.assume_init_ref();
            let table = 0x7000usize as *const u8;
            header.set_eh_info(table);
            assert_eq!(header.eh_info(), table);
        }
    }
}
