//! Code-manager instances and the process-wide registry.
//!
//! A [`JitCodeManager`] owns one executable heap plus its function
//! table and answers every per-PC question the runtime asks about code
//! in that heap: method lookup, GC-info location, EH-clause
//! enumeration, stack unwind and hardware-fault remapping.
//!
//! The [`CodeManagerRegistry`] hands out code blocks. It keeps a list
//! of instances and a lock-free pointer to the most recently used one;
//! when the current heap fills up a fresh instance is created and the
//! old one stays alive forever, still servicing lookups for the code
//! it already published.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use magma_core::eh::{decode_clause, decode_clause_count, EhClause};

use crate::config::{AbortTracking, JitOptions};
use crate::error::CodeManagerError;
use crate::header::{CodeHeader, HEADER_SIZE};
use crate::heap::ExecutableCodeHeap;
use crate::table::{FunctionEntry, FunctionTableIndex};

// =============================================================================
// MethodInfo
// =============================================================================

/// Everything a stack walker needs to know about one frame's method.
///
/// Copies the covering function-table entry (and its parent when the
/// PC was inside a funclet) so later queries need no table lookups.
/// Callers embed this in a fixed-size slot, hence the size check
/// below.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    main: FunctionEntry,
    runtime_function: FunctionEntry,
    execution_aborted: bool,
}

const _: () = assert!(std::mem::size_of::<MethodInfo>() <= 128);

impl MethodInfo {
    /// Entry for the main method body.
    #[inline]
    pub fn main(&self) -> &FunctionEntry {
        &self.main
    }

    /// Entry covering the query PC: the main body, or a funclet of it.
    #[inline]
    pub fn runtime_function(&self) -> &FunctionEntry {
        &self.runtime_function
    }

    /// Whether a hardware fault was remapped through this record.
    #[inline]
    pub fn execution_aborted(&self) -> bool {
        self.execution_aborted
    }

    /// Whether the query PC was inside a funclet.
    #[inline]
    pub fn in_funclet(&self) -> bool {
        self.runtime_function.begin_address != self.main.begin_address
    }
}

/// Register display threaded through unwind and GC-root enumeration:
/// the control registers plus the callee-saved state an unwind must
/// restore and a GC-info decoder may hold roots in (x64 convention:
/// rbx, rbp, rsi, rdi, r12-r15 and xmm6-xmm15).
#[derive(Debug, Default, Clone, Copy)]
pub struct RegDisplay {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
    pub rbx: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,
    /// Callee-saved SIMD registers xmm6..=xmm15, low lane first.
    pub xmm: [[u64; 2]; 10],
    /// Stack slot the return address came from in the most recent
    /// unwind, for walkers that patch or hijack return addresses.
    pub ret_addr_slot: Option<*const usize>,
}

/// Decodes a method's GC info and reports root slots.
///
/// The manager locates the GC-info bytes and the PC's offset within
/// the method; the decoding format belongs to the code generator, so
/// it stays behind this seam.
pub trait GcInfoDecoder {
    fn enum_gc_refs(
        &self,
        gc_info: *const u8,
        code_offset: u32,
        execution_aborted: bool,
        regs: &RegDisplay,
        visitor: &mut dyn FnMut(*mut usize),
    );
}

// =============================================================================
// EH enumeration
// =============================================================================

/// Cursor over a method's EH-clause table.
pub struct EhEnumState {
    method_start: *const u8,
    cursor: *const u8,
    clause_index: u32,
    clause_count: u32,
}

impl EhEnumState {
    /// Total clauses in the table.
    #[inline]
    pub fn clause_count(&self) -> u32 {
        self.clause_count
    }

    /// Decode the next clause, or `None` once the table is exhausted.
    ///
    /// # Safety
    /// The EH-info bytes this state was initialized over must still be
    /// live (they live as long as their manager, which is forever).
    pub unsafe fn next(&mut self) -> Option<EhClause> {
        if self.clause_index >= self.clause_count {
            return None;
        }
        self.clause_index += 1;
        let mut cursor = self.cursor;
        let clause = unsafe { decode_clause(&mut cursor, self.method_start) };
        self.cursor = cursor;
        clause
    }
}

// =============================================================================
// JitCodeManager
// =============================================================================

/// One executable heap plus the metadata to manage the code in it.
pub struct JitCodeManager {
    heap: ExecutableCodeHeap,
    table: FunctionTableIndex,
    abort_tracking: AbortTracking,
}

impl JitCodeManager {
    /// Reserve a heap near `helper_anchor` and set up an empty
    /// function table over it.
    pub fn new(helper_anchor: usize, options: &JitOptions) -> Result<Self, CodeManagerError> {
        let heap = ExecutableCodeHeap::new(helper_anchor, options.heap_size)?;
        let table = FunctionTableIndex::new(heap.base(), heap.size());
        Ok(JitCodeManager {
            heap,
            table,
            abort_tracking: options.abort_tracking,
        })
    }

    /// The owned code heap.
    #[inline]
    pub fn heap(&self) -> &ExecutableCodeHeap {
        &self.heap
    }

    /// Whether `pc` falls inside this manager's heap reservation.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        self.heap.contains(pc)
    }

    /// Record a function-table entry for a code range previously
    /// allocated from this heap. `parent` names the main-body entry
    /// when the range is a funclet. Invisible to lookup until
    /// [`update_runtime_function_table`](Self::update_runtime_function_table).
    pub fn publish_runtime_function(
        &self,
        code: *const u8,
        code_size: u32,
        unwind_data: *const u8,
        parent: Option<&FunctionEntry>,
    ) -> FunctionEntry {
        let base = self.heap.base();
        debug_assert!(self.heap.contains(code as usize));
        debug_assert!(unwind_data as usize > base);
        debug_assert!(unwind_data as usize - base <= i32::MAX as usize);

        let entry = FunctionEntry {
            begin_address: (code as usize - base) as u32,
            end_address: (code as usize - base) as u32 + code_size,
            unwind_data: (unwind_data as usize - base) as u32,
        };
        self.table.append(entry, parent);
        entry
    }

    /// Copy unwind and GC-info bytes into PData storage and record the
    /// function-table entry in one step. This is the surface the
    /// compiler driver calls; the emitted blobs live as long as the
    /// manager.
    pub fn publish_runtime_function_bytes(
        &self,
        code: *const u8,
        code_size: u32,
        unwind_bytes: &[u8],
        gc_info_bytes: &[u8],
        parent: Option<&FunctionEntry>,
    ) -> Result<FunctionEntry, CodeManagerError> {
        let pdata = self
            .heap
            .alloc_pdata(unwind_bytes.len() + gc_info_bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(unwind_bytes.as_ptr(), pdata, unwind_bytes.len());
            std::ptr::copy_nonoverlapping(
                gc_info_bytes.as_ptr(),
                pdata.add(unwind_bytes.len()),
                gc_info_bytes.len(),
            );
        }
        Ok(self.publish_runtime_function(code, code_size, pdata, parent))
    }

    /// Copy an encoded EH table into manager-owned storage and bind it
    /// to the method through its code header. Returns the stored
    /// table's address.
    pub fn set_eh_info(
        &self,
        code: *const u8,
        eh_bytes: &[u8],
    ) -> Result<*const u8, CodeManagerError> {
        debug_assert!(self.heap.contains(code as usize));
        let storage = self.heap.alloc_eh_info(eh_bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(eh_bytes.as_ptr(), storage, eh_bytes.len());
            CodeHeader::for_code(code).set_eh_info(storage);
        }
        Ok(storage)
    }

    /// Publish all recorded entries to PC lookup and the OS unwinder.
    pub fn update_runtime_function_table(&self) {
        self.table.publish();
    }

    /// Resolve `pc` to its method. Funclet PCs report the funclet as
    /// the runtime function and its parent as the main body.
    pub fn method_info_for_pc(&self, pc: usize) -> Option<MethodInfo> {
        if !self.contains(pc) {
            return None;
        }
        let hit = self.table.lookup((pc - self.heap.base()) as u32)?;
        Some(MethodInfo {
            main: hit.parent.unwrap_or(hit.entry),
            runtime_function: hit.entry,
            execution_aborted: false,
        })
    }

    /// First instruction of the method's main body.
    #[inline]
    pub fn method_start_address(&self, info: &MethodInfo) -> *const u8 {
        (self.heap.base() + info.main.begin_address as usize) as *const u8
    }

    /// Whether `pc` lies inside a funclet.
    pub fn is_funclet(&self, pc: usize) -> bool {
        match self.method_info_for_pc(pc) {
            Some(info) => info.in_funclet(),
            None => false,
        }
    }

    /// Frame pointer for the frame described by `regs`, when the
    /// method establishes one. Decided by the unwind record's
    /// frame-register field (low nibble of byte 3): zero means the
    /// frame is rsp-relative and has no frame pointer.
    pub fn frame_pointer(&self, info: &MethodInfo, regs: &RegDisplay) -> Option<usize> {
        let (blob, _) = self.unwind_blob(&info.runtime_function);
        let frame_register = unsafe { blob.add(3).read() } & 0x0f;
        if frame_register != 0 {
            Some(regs.fp)
        } else {
            None
        }
    }

    /// Unwind-blob address and size for one function-table entry.
    ///
    /// The blob is the platform unwind record: its fixed 4-byte prefix
    /// carries the unwind-code count in byte 2, each code being 2
    /// bytes.
    fn unwind_blob(&self, entry: &FunctionEntry) -> (*const u8, usize) {
        let blob = (self.heap.base() + entry.unwind_data as usize) as *const u8;
        let code_count = unsafe { blob.add(2).read() } as usize;
        (blob, 4 + 2 * code_count)
    }

    /// GC-info bytes for the method; they immediately follow the main
    /// body's unwind blob in its PData block.
    pub fn gc_info(&self, info: &MethodInfo) -> *const u8 {
        let (blob, size) = self.unwind_blob(&info.main);
        unsafe { blob.add(size) }
    }

    /// Report the frame's GC roots through `decoder`, using the abort
    /// flag carried by `info`.
    pub fn enum_gc_refs(
        &self,
        info: &MethodInfo,
        regs: &RegDisplay,
        decoder: &dyn GcInfoDecoder,
        visitor: &mut dyn FnMut(*mut usize),
    ) {
        self.enum_gc_refs_with_abort(info, regs, info.execution_aborted, decoder, visitor);
    }

    /// Report the frame's GC roots with an explicitly supplied abort
    /// flag, for walkers that track aborts outside the method record.
    pub fn enum_gc_refs_with_abort(
        &self,
        info: &MethodInfo,
        regs: &RegDisplay,
        execution_aborted: bool,
        decoder: &dyn GcInfoDecoder,
        visitor: &mut dyn FnMut(*mut usize),
    ) {
        let code_offset = (regs.pc - self.heap.base()) as u32 - info.main.begin_address;
        decoder.enum_gc_refs(
            self.gc_info(info),
            code_offset,
            execution_aborted,
            regs,
            visitor,
        );
    }

    /// A hardware fault at `fault_pc` is being turned into a GC
    /// safepoint for thread abort. Returns whether the PC belongs to
    /// this manager; when it does, the method record is marked so the
    /// subsequent root enumeration reports the fault site
    /// conservatively.
    pub fn remap_hardware_fault_to_gc_safepoint(
        &self,
        info: &mut MethodInfo,
        fault_pc: usize,
    ) -> bool {
        if !self.contains(fault_pc) {
            return false;
        }
        match self.abort_tracking {
            AbortTracking::StickyMethodInfo => info.execution_aborted = true,
            AbortTracking::ExplicitFlag => {}
        }
        true
    }

    /// Virtually unwind one frame: update `regs` from the frame at
    /// `regs.pc`/`regs.sp` to its caller, restoring the callee-saved
    /// general-purpose and SIMD registers and recording the slot the
    /// return address was popped from.
    ///
    /// The `Ok` value is the PInvoke transition frame the walker must
    /// switch to; jitted frames never sit on one, so success always
    /// yields `None` and the walker keeps treating frames as managed.
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        regs: &mut RegDisplay,
    ) -> Result<Option<*mut usize>, CodeManagerError> {
        use windows_sys::Win32::System::Diagnostics::Debug::{
            RtlVirtualUnwind, CONTEXT, IMAGE_RUNTIME_FUNCTION_ENTRY, M128A,
        };

        let mut context: CONTEXT = unsafe { std::mem::zeroed() };
        context.Rip = regs.pc as u64;
        context.Rsp = regs.sp as u64;
        context.Rbp = regs.fp as u64;
        context.Rbx = regs.rbx as u64;
        context.Rsi = regs.rsi as u64;
        context.Rdi = regs.rdi as u64;
        context.R12 = regs.r12 as u64;
        context.R13 = regs.r13 as u64;
        context.R14 = regs.r14 as u64;
        context.R15 = regs.r15 as u64;

        let to_m128 = |lanes: [u64; 2]| M128A {
            Low: lanes[0],
            High: lanes[1] as i64,
        };
        unsafe {
            let simd = &mut context.Anonymous.Anonymous;
            simd.Xmm6 = to_m128(regs.xmm[0]);
            simd.Xmm7 = to_m128(regs.xmm[1]);
            simd.Xmm8 = to_m128(regs.xmm[2]);
            simd.Xmm9 = to_m128(regs.xmm[3]);
            simd.Xmm10 = to_m128(regs.xmm[4]);
            simd.Xmm11 = to_m128(regs.xmm[5]);
            simd.Xmm12 = to_m128(regs.xmm[6]);
            simd.Xmm13 = to_m128(regs.xmm[7]);
            simd.Xmm14 = to_m128(regs.xmm[8]);
            simd.Xmm15 = to_m128(regs.xmm[9]);
        }

        // Layout matches the OS entry record.
        let entry = &info.runtime_function as *const FunctionEntry
            as *const IMAGE_RUNTIME_FUNCTION_ENTRY;

        let mut handler_data: *mut core::ffi::c_void = std::ptr::null_mut();
        let mut establisher_frame: u64 = 0;
        unsafe {
            RtlVirtualUnwind(
                0,
                self.heap.base() as u64,
                regs.pc as u64,
                entry,
                &mut context,
                &mut handler_data,
                &mut establisher_frame,
                std::ptr::null_mut(),
            );
        }

        if context.Rip == 0 {
            return Err(CodeManagerError::UnwindFailed { pc: regs.pc });
        }
        regs.pc = context.Rip as usize;
        regs.sp = context.Rsp as usize;
        regs.fp = context.Rbp as usize;
        regs.rbx = context.Rbx as usize;
        regs.rsi = context.Rsi as usize;
        regs.rdi = context.Rdi as usize;
        regs.r12 = context.R12 as usize;
        regs.r13 = context.R13 as usize;
        regs.r14 = context.R14 as usize;
        regs.r15 = context.R15 as usize;
        let from_m128 = |v: M128A| [v.Low, v.High as u64];
        unsafe {
            let simd = &context.Anonymous.Anonymous;
            regs.xmm = [
                from_m128(simd.Xmm6),
                from_m128(simd.Xmm7),
                from_m128(simd.Xmm8),
                from_m128(simd.Xmm9),
                from_m128(simd.Xmm10),
                from_m128(simd.Xmm11),
                from_m128(simd.Xmm12),
                from_m128(simd.Xmm13),
                from_m128(simd.Xmm14),
                from_m128(simd.Xmm15),
            ];
        }
        // The caller's return address sat just below the post-unwind
        // stack pointer.
        regs.ret_addr_slot =
            Some((context.Rsp as usize - std::mem::size_of::<usize>()) as *const usize);
        Ok(None)
    }

    /// Virtual unwind is only wired to the OS unwinder on Windows;
    /// `regs` is left untouched elsewhere.
    #[cfg(not(all(windows, target_arch = "x86_64")))]
    pub fn unwind_stack_frame(
        &self,
        _info: &MethodInfo,
        regs: &mut RegDisplay,
    ) -> Result<Option<*mut usize>, CodeManagerError> {
        Err(CodeManagerError::UnwindFailed { pc: regs.pc })
    }

    /// Begin enumerating the method's EH clauses. `None` when the
    /// method registered no EH info.
    pub fn eh_enum_init(&self, info: &MethodInfo) -> Option<EhEnumState> {
        let method_start = self.method_start_address(info);
        let header = unsafe { CodeHeader::for_code(method_start) };
        let eh_info = header.eh_info();
        if eh_info.is_null() {
            return None;
        }

        let mut cursor = eh_info;
        let clause_count = unsafe { decode_clause_count(&mut cursor) };
        Some(EhEnumState {
            method_start,
            cursor,
            clause_index: 0,
            clause_count,
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A code block handed out by the registry, paired with the manager
/// whose heap it came from.
pub struct CodeAllocation<'a> {
    pub manager: &'a JitCodeManager,
    pub code: *mut u8,
}

/// Process-wide set of code-manager instances.
///
/// Instances are append-only: a full heap is retired from allocation
/// but keeps answering lookups for its published code. The `last`
/// pointer caches the instance that served the most recent request so
/// the common case takes no lock.
pub struct CodeManagerRegistry {
    helper_anchor: usize,
    options: JitOptions,
    instances: Mutex<Vec<Box<JitCodeManager>>>,
    last: AtomicPtr<JitCodeManager>,
}

impl CodeManagerRegistry {
    pub fn new(helper_anchor: usize, options: JitOptions) -> Self {
        CodeManagerRegistry {
            helper_anchor,
            options,
            instances: Mutex::new(Vec::new()),
            last: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Number of instances created so far.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    /// Allocate a code block, creating a fresh manager instance when
    /// the current heap cannot satisfy the request.
    pub fn alloc_code(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<CodeAllocation<'_>, CodeManagerError> {
        let last = self.last.load(Ordering::Acquire);
        if !last.is_null() {
            // SAFETY: instances are boxed, never removed, and outlive
            // `&self`.
            let manager = unsafe { &*last };
            match manager.heap().alloc_code_with_header(size, alignment) {
                Ok(code) => return Ok(CodeAllocation { manager, code }),
                Err(CodeManagerError::HeapFull) => {}
                Err(e) => return Err(e),
            }
        }

        let mut instances = self.instances.lock();

        // Another thread may have installed a fresh instance while we
        // waited for the lock.
        let current = self.last.load(Ordering::Acquire);
        if current != last && !current.is_null() {
            // SAFETY: as above.
            let manager = unsafe { &*current };
            if let Ok(code) = manager.heap().alloc_code_with_header(size, alignment) {
                return Ok(CodeAllocation { manager, code });
            }
        }

        // Oversized requests get a correspondingly bigger heap.
        let mut options = self.options.clone();
        options.heap_size = options
            .heap_size
            .max(size + HEADER_SIZE + alignment.max(std::mem::align_of::<usize>()));

        let manager = Box::new(JitCodeManager::new(self.helper_anchor, &options)?);
        let code = manager.heap().alloc_code_with_header(size, alignment)?;
        log::debug!(
            "new code heap: base {:#x}, size {:#x} ({} instances)",
            manager.heap().base(),
            manager.heap().size(),
            instances.len() + 1
        );

        let ptr: *mut JitCodeManager = Box::as_ref(&manager) as *const _ as *mut JitCodeManager;
        instances.push(manager);
        self.last.store(ptr, Ordering::Release);

        // SAFETY: the box we just pushed is never removed.
        Ok(CodeAllocation {
            manager: unsafe { &*ptr },
            code,
        })
    }

    /// Find the instance whose heap contains `pc`, refreshing the
    /// last-used cache on a hit.
    pub fn manager_for_pc(&self, pc: usize) -> Option<&JitCodeManager> {
        let last = self.last.load(Ordering::Acquire);
        if !last.is_null() {
            // SAFETY: as in `alloc_code`.
            let manager = unsafe { &*last };
            if manager.contains(pc) {
                return Some(manager);
            }
        }

        let instances = self.instances.lock();
        for manager in instances.iter() {
            if manager.contains(pc) {
                let ptr: *mut JitCodeManager =
                    Box::as_ref(manager) as *const _ as *mut JitCodeManager;
                self.last.store(ptr, Ordering::Release);
                // SAFETY: boxed, never removed, outlives `&self`.
                return Some(unsafe { &*ptr });
            }
        }
        None
    }

    /// Resolve `pc` across every instance.
    pub fn method_info_for_pc(&self, pc: usize) -> Option<(&JitCodeManager, MethodInfo)> {
        let manager = self.manager_for_pc(pc)?;
        let info = manager.method_info_for_pc(pc)?;
        Some((manager, info))
    }
}

static GLOBAL_REGISTRY: OnceLock<CodeManagerRegistry> = OnceLock::new();

/// Install (or fetch) the process-wide registry. The first call wins;
/// later calls return the existing registry regardless of arguments.
pub fn init_registry(helper_anchor: usize, options: JitOptions) -> &'static CodeManagerRegistry {
    GLOBAL_REGISTRY.get_or_init(|| CodeManagerRegistry::new(helper_anchor, options))
}

/// The process-wide registry, if installed.
pub fn registry() -> Option<&'static CodeManagerRegistry> {
    GLOBAL_REGISTRY.get()
}
