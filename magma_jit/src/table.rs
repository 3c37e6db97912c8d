//! Function table: sorted entries registered with the OS unwinder.
//!
//! Every published method range (main body or funclet) contributes one
//! entry of `(begin, end, unwind-data)` offsets relative to the heap
//! base. Entries accumulate in emission order and are sorted when the
//! batch is published; only published entries are visible to PC
//! lookup. A sparse side map records which begin offsets are funclets
//! and which parent they belong to — main bodies have no entry there.
//!
//! On Windows the entry array is registered with the growable function
//! table facility so the OS unwinder can walk JIT frames; elsewhere
//! the registration state is tracked but the OS hook is a no-op.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// One function-table entry. Offsets are relative to the owning
/// heap's base; the layout matches the platform unwinder's entry
/// record so the array can be handed to the OS as-is.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    /// First byte of the range, from heap base.
    pub begin_address: u32,
    /// One past the last byte of the range, from heap base.
    pub end_address: u32,
    /// Offset of the unwind blob (PData) from heap base.
    pub unwind_data: u32,
}

/// Result of a PC lookup: the covering entry and, when that entry is
/// a funclet, the parent main-body entry.
#[derive(Debug, Clone, Copy)]
pub struct LookupResult {
    pub entry: FunctionEntry,
    pub parent: Option<FunctionEntry>,
}

// =============================================================================
// OS registration
// =============================================================================

/// Registration state against the OS growable function table.
///
/// The OS API wants a stable array pointer; growth in place is
/// notified, a moved array forces delete-and-re-add.
struct OsTable {
    registered_ptr: *const FunctionEntry,
    registered_count: usize,
    registered_capacity: usize,
    #[cfg(windows)]
    handle: *mut core::ffi::c_void,
}

impl OsTable {
    fn new() -> Self {
        OsTable {
            registered_ptr: std::ptr::null(),
            registered_count: 0,
            registered_capacity: 0,
            #[cfg(windows)]
            handle: std::ptr::null_mut(),
        }
    }

    fn publish(
        &mut self,
        ptr: *const FunctionEntry,
        count: usize,
        capacity: usize,
        range_base: usize,
        range_size: usize,
    ) {
        // An in-place grow notification is only legal while the count
        // stays within the capacity the OS was told about at
        // registration. A realloc can enlarge capacity without moving
        // the buffer, so pointer equality alone is not enough.
        if self.registered_ptr == ptr && capacity == self.registered_capacity {
            if count != self.registered_count {
                self.grow(count);
            }
            return;
        }

        self.delete();

        // There is a short window where the table is not registered.
        self.register(ptr, count, capacity, range_base, range_size);
    }

    #[cfg(windows)]
    fn register(
        &mut self,
        ptr: *const FunctionEntry,
        count: usize,
        capacity: usize,
        range_base: usize,
        range_size: usize,
    ) {
        use windows_sys::Win32::System::Diagnostics::Debug::RtlAddGrowableFunctionTable;

        let status = unsafe {
            RtlAddGrowableFunctionTable(
                &mut self.handle,
                ptr as *mut _,
                count as u32,
                capacity as u32,
                range_base,
                range_base + range_size,
            )
        };
        if status != 0 {
            log::warn!(
                "failed to register growable function table (status {:#x})",
                status
            );
            self.handle = std::ptr::null_mut();
        }
        self.registered_ptr = ptr;
        self.registered_count = count;
        self.registered_capacity = capacity;
    }

    #[cfg(not(windows))]
    fn register(
        &mut self,
        ptr: *const FunctionEntry,
        count: usize,
        capacity: usize,
        _range_base: usize,
        _range_size: usize,
    ) {
        self.registered_ptr = ptr;
        self.registered_count = count;
        self.registered_capacity = capacity;
    }

    #[cfg(windows)]
    fn grow(&mut self, count: usize) {
        use windows_sys::Win32::System::Diagnostics::Debug::RtlGrowFunctionTable;

        debug_assert!(count <= self.registered_capacity);
        if !self.handle.is_null() {
            unsafe { RtlGrowFunctionTable(self.handle, count as u32) };
        }
        self.registered_count = count;
    }

    #[cfg(not(windows))]
    fn grow(&mut self, count: usize) {
        debug_assert!(count <= self.registered_capacity);
        self.registered_count = count;
    }

    #[cfg(windows)]
    fn delete(&mut self) {
        use windows_sys::Win32::System::Diagnostics::Debug::RtlDeleteGrowableFunctionTable;

        if !self.handle.is_null() {
            unsafe { RtlDeleteGrowableFunctionTable(self.handle) };
            self.handle = std::ptr::null_mut();
        }
        self.registered_ptr = std::ptr::null();
        self.registered_count = 0;
        self.registered_capacity = 0;
    }

    #[cfg(not(windows))]
    fn delete(&mut self) {
        self.registered_ptr = std::ptr::null();
        self.registered_count = 0;
        self.registered_capacity = 0;
    }
}

// =============================================================================
// FunctionTableIndex
// =============================================================================

struct TableInner {
    entries: Vec<FunctionEntry>,
    funclet_parents: FxHashMap<u32, u32>,
    /// Entries visible to lookup: the sorted prefix as of the last
    /// publish. Appends past this index stay invisible until then.
    published: usize,
    os_table: OsTable,
}

/// Sorted function-entry array plus funclet map and OS registration.
pub struct FunctionTableIndex {
    range_base: usize,
    range_size: usize,
    inner: RwLock<TableInner>,
}

// Raw pointers inside OsTable only name memory owned by `entries`.
unsafe impl Send for FunctionTableIndex {}
unsafe impl Sync for FunctionTableIndex {}

impl FunctionTableIndex {
    /// Create an index covering `[range_base, range_base + range_size)`.
    pub fn new(range_base: usize, range_size: usize) -> Self {
        FunctionTableIndex {
            range_base,
            range_size,
            inner: RwLock::new(TableInner {
                entries: Vec::new(),
                funclet_parents: FxHashMap::default(),
                published: 0,
                os_table: OsTable::new(),
            }),
        }
    }

    /// Append one entry. `parent` is the main-body entry when this
    /// entry describes a funclet; main bodies pass `None` and get no
    /// funclet-map entry.
    pub fn append(&self, entry: FunctionEntry, parent: Option<&FunctionEntry>) {
        let mut inner = self.inner.write();
        if let Some(parent) = parent {
            inner
                .funclet_parents
                .insert(entry.begin_address, parent.begin_address);
        }
        inner.entries.push(entry);
    }

    /// Sort and publish all appended entries, (re-)registering the
    /// array with the OS unwinder. Calling this twice with no
    /// intervening append is a no-op.
    pub fn publish(&self) {
        let mut inner = self.inner.write();
        inner
            .entries
            .sort_unstable_by_key(|entry| entry.begin_address);
        inner.published = inner.entries.len();

        let ptr = inner.entries.as_ptr();
        let count = inner.entries.len();
        let capacity = inner.entries.capacity();
        let (range_base, range_size) = (self.range_base, self.range_size);
        inner
            .os_table
            .publish(ptr, count, capacity, range_base, range_size);
    }

    /// Find the published entry covering `pc_offset` (half-open
    /// ranges), along with its parent if it is a funclet.
    pub fn lookup(&self, pc_offset: u32) -> Option<LookupResult> {
        let inner = self.inner.read();
        let published = &inner.entries[..inner.published];

        let index = search_entries(published, pc_offset)?;
        let entry = published[index];

        let parent = match inner.funclet_parents.get(&entry.begin_address) {
            Some(&parent_begin) => {
                let parent_index = search_entries(published, parent_begin)?;
                Some(published[parent_index])
            }
            None => None,
        };

        Some(LookupResult { entry, parent })
    }

    /// Whether the entry starting at `begin_address` is a funclet.
    pub fn is_funclet(&self, begin_address: u32) -> bool {
        self.inner.read().funclet_parents.contains_key(&begin_address)
    }

    /// Number of published entries.
    pub fn published_len(&self) -> usize {
        self.inner.read().published
    }
}

impl Drop for FunctionTableIndex {
    fn drop(&mut self) {
        // Unhook from the OS unwinder before the entry array goes away.
        self.inner.get_mut().os_table.delete();
    }
}

/// Binary search for the entry whose half-open range covers `offset`,
/// switching to a short linear scan near the bottom to avoid binary
/// search overhead on small windows.
fn search_entries(entries: &[FunctionEntry], offset: u32) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }

    let mut low = 0usize;
    let mut high = entries.len() - 1;
    while high - low > 10 {
        let middle = low + (high - low) / 2;
        if offset < entries[middle].begin_address {
            high = middle - 1;
        } else {
            low = middle;
        }
    }

    for index in (low..=high).rev() {
        let entry = &entries[index];
        if offset >= entry.begin_address {
            if offset < entry.end_address {
                return Some(index);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(begin: u32, end: u32) -> FunctionEntry {
        FunctionEntry {
            begin_address: begin,
            end_address: end,
            unwind_data: begin + 0x10_0000,
        }
    }

    #[test]
    fn entries_invisible_until_publish() {
        let table = FunctionTableIndex::new(0x10_0000, 0x1_0000);
        table.append(entry(0x100, 0x200), None);
        assert!(table.lookup(0x150).is_none());

        table.publish();
        assert!(table.lookup(0x150).is_some());
    }

    #[test]
    fn publish_sorts_out_of_order_appends() {
        let table = FunctionTableIndex::new(0x10_0000, 0x1_0000);
        // M2 first, then M1, as the driver may publish in any order.
        table.append(entry(0x800, 0x1000), None);
        table.append(entry(0x100, 0x4e8), None);
        table.publish();

        let hit = table.lookup(0x100 + 500).expect("M1 interior");
        assert_eq!(hit.entry.begin_address, 0x100);

        let hit = table.lookup(0x900).expect("M2 interior");
        assert_eq!(hit.entry.begin_address, 0x800);
    }

    #[test]
    fn lookup_ranges_are_half_open() {
        let table = FunctionTableIndex::new(0x10_0000, 0x1_0000);
        table.append(entry(0x100, 0x200), None);
        table.append(entry(0x200, 0x300), None);
        table.publish();

        assert_eq!(
            table.lookup(0x100).expect("begin is covered").entry.begin_address,
            0x100
        );
        // PC at end lands in the next entry, not this one.
        assert_eq!(
            table.lookup(0x200).expect("next entry").entry.begin_address,
            0x200
        );
        assert!(table.lookup(0x300).is_none());
        assert!(table.lookup(0xff).is_none());
    }

    #[test]
    fn gap_between_entries_is_not_found() {
        let table = FunctionTableIndex::new(0x10_0000, 0x1_0000);
        table.append(entry(0x100, 0x180), None);
        table.append(entry(0x400, 0x500), None);
        table.publish();

        assert!(table.lookup(0x180).is_none());
        assert!(table.lookup(0x3ff).is_none());
    }

    #[test]
    fn funclet_resolves_to_parent() {
        let table = FunctionTableIndex::new(0x10_0000, 0x1_0000);
        let main = entry(0x100, 0x400);
        table.append(main, None);
        table.append(entry(0x400, 0x480), Some(&main));
        table.publish();

        let hit = table.lookup(0x410).expect("funclet interior");
        assert_eq!(hit.entry.begin_address, 0x400);
        let parent = hit.parent.expect("funclet has a parent");
        assert_eq!(parent.begin_address, 0x100);
        assert!(table.is_funclet(0x400));
        assert!(!table.is_funclet(0x100));

        // Main-body lookup carries no parent.
        assert!(table.lookup(0x200).expect("main interior").parent.is_none());
    }

    #[test]
    fn publish_twice_is_a_noop() {
        let table = FunctionTableIndex::new(0x10_0000, 0x1_0000);
        table.append(entry(0x100, 0x200), None);
        table.publish();
        let before = table.published_len();
        table.publish();
        assert_eq!(table.published_len(), before);
        assert_eq!(
            table.lookup(0x150).expect("still found").entry.begin_address,
            0x100
        );
    }

    #[test]
    fn incremental_publish_extends_visibility() {
        let table = FunctionTableIndex::new(0x10_0000, 0x10_0000);
        table.append(entry(0x100, 0x200), None);
        table.publish();

        table.append(entry(0x50, 0x100), None);
        assert!(table.lookup(0x60).is_none());
        table.publish();
        assert_eq!(
            table.lookup(0x60).expect("new entry visible").entry.begin_address,
            0x50
        );
        // Earlier entry survived the re-sort.
        assert!(table.lookup(0x150).is_some());
    }

    #[test]
    fn os_registration_rebinds_when_capacity_changes_in_place() {
        let entries = [
            entry(0x100, 0x200),
            entry(0x200, 0x300),
            entry(0x300, 0x400),
            entry(0x400, 0x500),
        ];
        let ptr = entries.as_ptr();

        let mut os = OsTable::new();
        os.publish(ptr, 1, 2, 0x10_0000, 0x1_0000);
        assert_eq!(os.registered_count, 1);
        assert_eq!(os.registered_capacity, 2);

        // Same buffer address but larger capacity: a realloc grew the
        // storage in place. The registered maximum is stale, so this
        // must re-register instead of notifying an in-place grow.
        os.publish(ptr, 3, 4, 0x10_0000, 0x1_0000);
        assert_eq!(os.registered_ptr, ptr);
        assert_eq!(os.registered_count, 3);
        assert_eq!(os.registered_capacity, 4);

        // Unchanged pointer and capacity still takes the grow path.
        os.publish(ptr, 4, 4, 0x10_0000, 0x1_0000);
        assert_eq!(os.registered_count, 4);
        assert_eq!(os.registered_capacity, 4);
    }

    #[test]
    fn search_falls_back_to_linear_below_threshold_boundary() {
        // Enough entries to exercise both binary and linear phases.
        let table = FunctionTableIndex::new(0, 0x100_0000);
        for i in 0..64u32 {
            table.append(entry(i * 0x100, i * 0x100 + 0x80), None);
        }
        table.publish();

        for i in 0..64u32 {
            let hit = table.lookup(i * 0x100 + 0x40).expect("interior");
            assert_eq!(hit.entry.begin_address, i * 0x100);
            assert!(table.lookup(i * 0x100 + 0x80).is_none());
        }
    }
}
