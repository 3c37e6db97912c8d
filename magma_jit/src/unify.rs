//! Generic-instantiation unification.
//!
//! Multiple modules can each carry a private copy of the same generic
//! instantiation. At load time every module submits its descriptors;
//! the first registration of a given instantiation becomes the
//! canonical "winner" and later duplicates are merged into it by
//! patching their indirection-cell arrays. Running code reads those
//! cells concurrently, so the merge writes each cell in one direction
//! only: a non-null winner cell overwrites the loser's, and a null
//! winner cell adopts the loser's non-null value so subsequent losers
//! observe a consistent winner.
//!
//! The table itself performs no locking; callers serialize batches
//! externally, which `&mut self` enforces here.

use magma_core::TypeRef;
use smallvec::SmallVec;

use crate::error::UnifyError;

/// Generic argument tuple; most instantiations have few parameters.
pub type Composition = SmallVec<[TypeRef; 4]>;

/// Descriptor flag bits.
pub mod flags {
    /// Instantiation owns GC-static storage the GC must scan.
    pub const GC_STATICS: u32 = 1 << 0;
    /// Instantiation owns thread-static storage.
    pub const THREAD_STATICS: u32 = 1 << 1;
}

/// A sub-range of a descriptor's indirection-cell array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub start: u32,
    pub len: u32,
}

/// Thread-static bookkeeping: the cell range plus the cell holding the
/// TLS index for the instantiation's per-thread storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStatics {
    pub range: CellRange,
    pub tls_index_cell: u32,
}

/// Borrowed view of a module's indirection-cell array.
///
/// Cells are pointer-sized slots patched at unification time and read
/// by running code afterwards; the module keeps them alive for the
/// life of the process.
#[derive(Debug, Clone, Copy)]
pub struct CellArray {
    ptr: *mut usize,
    len: u32,
}

impl CellArray {
    /// View over a module's cell storage.
    ///
    /// The caller promises the storage outlives the unification table
    /// and is not resized or moved.
    pub fn new(ptr: *mut usize, len: u32) -> Self {
        CellArray { ptr, len }
    }

    /// Convenience constructor over a slice with a stable address.
    pub fn from_slice(cells: &mut [usize]) -> Self {
        CellArray {
            ptr: cells.as_mut_ptr(),
            len: cells.len() as u32,
        }
    }

    /// Number of cells.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    unsafe fn get(&self, index: u32) -> usize {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index as usize).read() }
    }

    #[inline]
    unsafe fn set(&self, index: u32, value: usize) {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index as usize).write(value) }
    }
}

/// One module's description of a generic instantiation.
#[derive(Debug, Clone)]
pub struct GenericUnificationDesc {
    /// Structural hash over open type, ordinal and argument types.
    pub hash_code: u64,
    /// Flag bits from [`flags`].
    pub flags: u32,
    /// Identity of the open (uninstantiated) type or method.
    pub open_type: TypeRef,
    /// Disambiguates multiple generic entities on the same open type.
    pub ordinal: u32,
    /// Ordered generic arguments.
    pub composition: Composition,
    /// The module's indirection cells for this instantiation.
    pub cells: CellArray,
    /// GC-static cell sub-range, present iff `flags::GC_STATICS`.
    pub gc_statics: Option<CellRange>,
    /// Thread-static bookkeeping, present iff `flags::THREAD_STATICS`.
    pub thread_statics: Option<ThreadStatics>,
}

/// Structural type-equivalence predicate supplied by the type system.
pub trait TypeEquivalence {
    /// Whether two distinct type descriptions describe the same type.
    /// Never called with the universal-canonical sentinel.
    fn equivalent(&self, a: TypeRef, b: TypeRef) -> bool;
}

/// Receives first-registration notifications so static storage gets
/// scanned by the GC and thread statics get a TLS slot.
pub trait StaticsRegistrar {
    /// A winner with GC statics was registered; `range` names the
    /// cells the GC must treat as roots.
    fn register_gc_statics(&mut self, cells: CellArray, range: CellRange);

    /// A winner with thread statics was registered. Returns the TLS
    /// index allocated for the instantiation's per-thread storage.
    fn register_thread_statics(&mut self, cells: CellArray, range: CellRange) -> u32;
}

/// What happened to one submitted descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifyOutcome {
    /// First registration: this descriptor is the canonical winner.
    Registered,
    /// A matching winner existed; cells were merged into it.
    Merged,
}

// =============================================================================
// Table
// =============================================================================

struct Entry {
    desc: GenericUnificationDesc,
    next: Option<Box<Entry>>,
}

/// Hash-bucketed unification table with power-of-two bucket counts.
pub struct GenericUnificationTable {
    buckets: Vec<Option<Box<Entry>>>,
    entry_count: usize,
}

impl GenericUnificationTable {
    /// Hard ceiling; a batch that would push past this is rejected.
    pub const MAX_ENTRIES: usize = 1 << 28;

    const DEFAULT_BUCKETS: usize = 64;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_BUCKETS)
    }

    /// Create with an initial bucket count sized for `capacity`
    /// expected instantiations.
    pub fn with_capacity(capacity: usize) -> Self {
        let buckets = capacity
            .next_power_of_two()
            .clamp(Self::DEFAULT_BUCKETS, Self::MAX_ENTRIES);
        GenericUnificationTable {
            buckets: Self::fresh_buckets(buckets),
            entry_count: 0,
        }
    }

    fn fresh_buckets(count: usize) -> Vec<Option<Box<Entry>>> {
        // Zero-initialized storage: every chain starts empty.
        let mut buckets = Vec::with_capacity(count);
        buckets.resize_with(count, || None);
        buckets
    }

    /// Registered winner count.
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Current bucket count.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Unify a whole module's descriptor batch. Either every
    /// descriptor is processed or, when the table cannot hold the
    /// batch, nothing is and the module load fails.
    pub fn unify_batch(
        &mut self,
        descs: Vec<GenericUnificationDesc>,
        equiv: &dyn TypeEquivalence,
        registrar: &mut dyn StaticsRegistrar,
    ) -> Result<Vec<UnifyOutcome>, UnifyError> {
        if self.entry_count + descs.len() > Self::MAX_ENTRIES {
            return Err(UnifyError::TableLimitReached {
                entries: Self::MAX_ENTRIES,
            });
        }
        let mut outcomes = Vec::with_capacity(descs.len());
        for desc in descs {
            outcomes.push(self.unify(desc, equiv, registrar)?);
        }
        Ok(outcomes)
    }

    /// Unify one descriptor: merge into an equal winner, or register
    /// it as the new winner with the appropriate side effects.
    pub fn unify(
        &mut self,
        desc: GenericUnificationDesc,
        equiv: &dyn TypeEquivalence,
        registrar: &mut dyn StaticsRegistrar,
    ) -> Result<UnifyOutcome, UnifyError> {
        if self.entry_count == self.buckets.len() {
            self.grow()?;
        }

        let bucket = (desc.hash_code as usize) & (self.buckets.len() - 1);
        let mut chain = &self.buckets[bucket];
        while let Some(entry) = chain {
            if descriptors_equal(&entry.desc, &desc, equiv) {
                unsafe { merge_cells(&entry.desc, &desc) };
                return Ok(UnifyOutcome::Merged);
            }
            chain = &entry.next;
        }

        let mut desc = desc;
        if desc.flags & flags::GC_STATICS != 0 {
            if let Some(range) = desc.gc_statics {
                registrar.register_gc_statics(desc.cells, range);
            }
        }
        if desc.flags & flags::THREAD_STATICS != 0 {
            if let Some(ts) = desc.thread_statics {
                let tls_index = registrar.register_thread_statics(desc.cells, ts.range);
                // Collapse pointer-to-index into the raw index so
                // compiled accessors need not double-indirect.
                unsafe { desc.cells.set(ts.tls_index_cell, tls_index as usize) };
            }
        }

        let next = self.buckets[bucket].take();
        self.buckets[bucket] = Some(Box::new(Entry { desc, next }));
        self.entry_count += 1;
        Ok(UnifyOutcome::Registered)
    }

    /// Double the bucket array and rehash every chain.
    fn grow(&mut self) -> Result<(), UnifyError> {
        let new_count = self.buckets.len() * 2;
        if new_count > Self::MAX_ENTRIES {
            return Err(UnifyError::TableLimitReached {
                entries: Self::MAX_ENTRIES,
            });
        }

        let mut new_buckets = Self::fresh_buckets(new_count);
        for slot in self.buckets.iter_mut() {
            let mut chain = slot.take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let bucket = (entry.desc.hash_code as usize) & (new_count - 1);
                entry.next = new_buckets[bucket].take();
                new_buckets[bucket] = Some(entry);
            }
        }
        self.buckets = new_buckets;
        Ok(())
    }
}

impl Default for GenericUnificationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor equality: all key fields match and the compositions are
/// pairwise identical or structurally equivalent. The universal-
/// canonical sentinel only ever matches itself.
fn descriptors_equal(
    a: &GenericUnificationDesc,
    b: &GenericUnificationDesc,
    equiv: &dyn TypeEquivalence,
) -> bool {
    if a.hash_code != b.hash_code
        || a.flags != b.flags
        || a.open_type != b.open_type
        || a.ordinal != b.ordinal
        || a.composition.len() != b.composition.len()
    {
        return false;
    }

    a.composition
        .iter()
        .zip(b.composition.iter())
        .all(|(&x, &y)| {
            if x == y {
                return true;
            }
            if x.is_universal_canonical() || y.is_universal_canonical() {
                return false;
            }
            equiv.equivalent(x, y)
        })
}

/// Merge the loser's cells into the winner's over their overlapping
/// prefix, then force the static sub-ranges from winner to loser.
///
/// # Safety
/// Both cell arrays must be live and externally serialized against
/// other unification calls (running code may read them concurrently,
/// which the one-directional writes tolerate).
unsafe fn merge_cells(winner: &GenericUnificationDesc, loser: &GenericUnificationDesc) {
    let overlap = winner.cells.len().min(loser.cells.len());
    for i in 0..overlap {
        let w = unsafe { winner.cells.get(i) };
        if w != 0 {
            unsafe { loser.cells.set(i, w) };
        } else {
            let l = unsafe { loser.cells.get(i) };
            if l != 0 {
                unsafe { winner.cells.set(i, l) };
            }
        }
    }

    // Static ranges copy unconditionally: zero is a legal tls index,
    // so "non-null wins" does not apply to these cells.
    let mut ranges: SmallVec<[CellRange; 2]> = SmallVec::new();
    if let Some(range) = winner.gc_statics {
        ranges.push(range);
    }
    if let Some(ts) = winner.thread_statics {
        ranges.push(ts.range);
    }
    for range in ranges {
        let end = (range.start + range.len).min(overlap);
        for i in range.start..end {
            let w = unsafe { winner.cells.get(i) };
            unsafe { loser.cells.set(i, w) };
        }
    }
    if let (Some(w_ts), Some(_)) = (winner.thread_statics, loser.thread_statics) {
        if w_ts.tls_index_cell < overlap {
            let w = unsafe { winner.cells.get(w_ts.tls_index_cell) };
            unsafe { loser.cells.set(w_ts.tls_index_cell, w) };
        }
    }
}
