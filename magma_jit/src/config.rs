//! Code-manager configuration resolved once at startup.
//!
//! Mirrors the runtime's other configuration surfaces: a single struct
//! captured before any compilation happens, read without locking
//! afterwards. Environment overrides exist for bring-up and testing.

/// How the execution-aborted flag reaches the GC-info decoder after a
/// hardware fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortTracking {
    /// `remap_hardware_fault_to_gc_safepoint` marks the caller's
    /// transient `MethodInfo`; later root enumeration through that
    /// record sees the flag. Callers must not cache the record across
    /// fault boundaries.
    StickyMethodInfo,
    /// The remap call leaves the record untouched; stack walkers pass
    /// the abort flag explicitly via `enum_gc_refs_with_abort`.
    ExplicitFlag,
}

/// Options for code-manager instances.
#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Reserved size of each code heap. New instances are created with
    /// this size whenever the current one fills up.
    pub heap_size: usize,

    /// Execution-aborted plumbing mode.
    pub abort_tracking: AbortTracking,
}

impl JitOptions {
    /// 8 MiB per heap is comfortable for bring-up workloads.
    pub const DEFAULT_HEAP_SIZE: usize = 0x80_0000;

    /// Defaults plus environment overrides.
    ///
    /// `MAGMA_JIT_HEAP_SIZE` — heap reservation in bytes.
    /// `MAGMA_JIT_ABORT_TRACKING` — `sticky` or `explicit`.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(value) = std::env::var("MAGMA_JIT_HEAP_SIZE") {
            if let Ok(size) = value.parse::<usize>() {
                if size > 0 {
                    options.heap_size = size;
                }
            }
        }

        if let Ok(value) = std::env::var("MAGMA_JIT_ABORT_TRACKING") {
            match value.as_str() {
                "explicit" => options.abort_tracking = AbortTracking::ExplicitFlag,
                "sticky" => options.abort_tracking = AbortTracking::StickyMethodInfo,
                _ => {}
            }
        }

        options
    }

    /// Override the heap size.
    pub fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    /// Override the abort-tracking mode.
    pub fn with_abort_tracking(mut self, mode: AbortTracking) -> Self {
        self.abort_tracking = mode;
        self
    }
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            heap_size: Self::DEFAULT_HEAP_SIZE,
            abort_tracking: AbortTracking::StickyMethodInfo,
        }
    }
}
