//! Exception-handling clause model and wire codec.
//!
//! Per-method EH tables are a count-prefixed varint stream attached to
//! emitted code through its code header. Each clause encodes, in order:
//!
//! 1. try-start offset (varint)
//! 2. `(try-length << 2) | clause-kind` (varint)
//! 3. handler-start offset (varint)
//! 4. typed clauses: a raw little-endian `i32` pointing at a
//!    pointer-sized slot holding the target type, relative to the
//!    cursor position after the `i32` itself has been read
//! 5. filter clauses: filter-start offset (varint)
//!
//! All offsets are relative to the method start; the decoder resolves
//! handler and filter positions to absolute addresses.

use crate::varint;

/// Kind of an EH clause, stored in the low two bits of the second
/// varint of each clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EhClauseKind {
    /// Typed catch: handler runs when the thrown type matches.
    Typed = 0,
    /// Fault: handler runs on any exceptional exit from the try range.
    Fault = 1,
    /// Filter: a filter funclet decides whether the handler runs.
    Filter = 2,
}

impl EhClauseKind {
    /// Decode from the low two bits of the length-and-kind varint.
    #[inline]
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(EhClauseKind::Typed),
            1 => Some(EhClauseKind::Fault),
            2 => Some(EhClauseKind::Filter),
            _ => None,
        }
    }
}

/// Kind-specific clause payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhPayload {
    /// Pointer to the target type description.
    Typed { target_type: *const u8 },
    Fault,
    /// Absolute address of the filter funclet.
    Filter { filter_address: *const u8 },
}

/// A decoded EH clause with handler positions resolved to absolute
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhClause {
    /// Start of the protected range, relative to method start.
    pub try_start_offset: u32,
    /// End of the protected range (exclusive), relative to method start.
    pub try_end_offset: u32,
    /// Absolute address of the handler funclet.
    pub handler_address: *const u8,
    /// Kind-specific payload.
    pub payload: EhPayload,
}

impl EhClause {
    /// The clause kind implied by the payload.
    #[inline]
    pub fn kind(&self) -> EhClauseKind {
        match self.payload {
            EhPayload::Typed { .. } => EhClauseKind::Typed,
            EhPayload::Fault => EhClauseKind::Fault,
            EhPayload::Filter { .. } => EhClauseKind::Filter,
        }
    }
}

/// Decode the clause-count prefix, advancing the cursor past it.
///
/// # Safety
/// `*cursor` must point at a well-formed EH-info stream.
#[inline]
pub unsafe fn decode_clause_count(cursor: &mut *const u8) -> u32 {
    unsafe { varint::read_unsigned(cursor) }
}

/// Decode one clause, advancing the cursor past it.
///
/// Returns `None` if the stream carries a reserved clause kind, which
/// a well-formed emitter never produces.
///
/// # Safety
/// `*cursor` must point at a clause boundary inside a well-formed
/// EH-info stream, and typed clauses' type slots must be readable.
pub unsafe fn decode_clause(cursor: &mut *const u8, method_start: *const u8) -> Option<EhClause> {
    let try_start = unsafe { varint::read_unsigned(cursor) };
    let len_and_kind = unsafe { varint::read_unsigned(cursor) };
    let kind = EhClauseKind::from_bits(len_and_kind & 0x3)?;
    let try_end = try_start + (len_and_kind >> 2);

    let handler_offset = unsafe { varint::read_unsigned(cursor) };
    let handler_address = unsafe { method_start.add(handler_offset as usize) };

    let payload = match kind {
        EhClauseKind::Typed => {
            // Raw i32, then an indirect load through the slot it points
            // at. The displacement is relative to the cursor once the
            // i32 has been consumed.
            let rel = unsafe { cursor.cast::<i32>().read_unaligned() };
            *cursor = unsafe { cursor.add(4) };
            let slot = unsafe { cursor.offset(rel as isize) }.cast::<*const u8>();
            EhPayload::Typed {
                target_type: unsafe { slot.read_unaligned() },
            }
        }
        EhClauseKind::Fault => EhPayload::Fault,
        EhClauseKind::Filter => {
            let filter_offset = unsafe { varint::read_unsigned(cursor) };
            EhPayload::Filter {
                filter_address: unsafe { method_start.add(filter_offset as usize) },
            }
        }
    };

    Some(EhClause {
        try_start_offset: try_start,
        try_end_offset: try_end,
        handler_address,
        payload,
    })
}

// =============================================================================
// Builder
// =============================================================================

enum ClauseSpec {
    Typed {
        try_start: u32,
        try_len: u32,
        handler_offset: u32,
        target_type: *const u8,
    },
    Fault {
        try_start: u32,
        try_len: u32,
        handler_offset: u32,
    },
    Filter {
        try_start: u32,
        try_len: u32,
        handler_offset: u32,
        filter_offset: u32,
    },
}

/// Builder producing an owned, self-contained EH-info blob.
///
/// Typed clauses need a pointer-sized slot the stream's relative `i32`
/// can point at; the builder appends those slots after the varint
/// stream so the whole table lives in one allocation.
#[derive(Default)]
pub struct EhInfoBuilder {
    clauses: Vec<ClauseSpec>,
}

impl EhInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a typed catch clause.
    pub fn typed(
        &mut self,
        try_start: u32,
        try_len: u32,
        handler_offset: u32,
        target_type: *const u8,
    ) -> &mut Self {
        self.clauses.push(ClauseSpec::Typed {
            try_start,
            try_len,
            handler_offset,
            target_type,
        });
        self
    }

    /// Append a fault clause.
    pub fn fault(&mut self, try_start: u32, try_len: u32, handler_offset: u32) -> &mut Self {
        self.clauses.push(ClauseSpec::Fault {
            try_start,
            try_len,
            handler_offset,
        });
        self
    }

    /// Append a filter clause.
    pub fn filter(
        &mut self,
        try_start: u32,
        try_len: u32,
        handler_offset: u32,
        filter_offset: u32,
    ) -> &mut Self {
        self.clauses.push(ClauseSpec::Filter {
            try_start,
            try_len,
            handler_offset,
            filter_offset,
        });
        self
    }

    /// Encode the stream and lay out the typed-clause type slots.
    pub fn finish(&self) -> EhInfoBlob {
        let mut stream = Vec::new();
        varint::write_unsigned(&mut stream, self.clauses.len() as u32);

        // (position just past the i32, slot index) per typed clause
        let mut typed_fixups: Vec<(usize, usize)> = Vec::new();
        let mut slots: Vec<*const u8> = Vec::new();

        for clause in &self.clauses {
            match *clause {
                ClauseSpec::Typed {
                    try_start,
                    try_len,
                    handler_offset,
                    target_type,
                } => {
                    varint::write_unsigned(&mut stream, try_start);
                    varint::write_unsigned(&mut stream, (try_len << 2) | EhClauseKind::Typed as u32);
                    varint::write_unsigned(&mut stream, handler_offset);
                    stream.extend_from_slice(&0i32.to_le_bytes());
                    typed_fixups.push((stream.len(), slots.len()));
                    slots.push(target_type);
                }
                ClauseSpec::Fault {
                    try_start,
                    try_len,
                    handler_offset,
                } => {
                    varint::write_unsigned(&mut stream, try_start);
                    varint::write_unsigned(&mut stream, (try_len << 2) | EhClauseKind::Fault as u32);
                    varint::write_unsigned(&mut stream, handler_offset);
                }
                ClauseSpec::Filter {
                    try_start,
                    try_len,
                    handler_offset,
                    filter_offset,
                } => {
                    varint::write_unsigned(&mut stream, try_start);
                    varint::write_unsigned(
                        &mut stream,
                        (try_len << 2) | EhClauseKind::Filter as u32,
                    );
                    varint::write_unsigned(&mut stream, handler_offset);
                    varint::write_unsigned(&mut stream, filter_offset);
                }
            }
        }

        const PTR_SIZE: usize = std::mem::size_of::<*const u8>();
        let slots_offset = (stream.len() + PTR_SIZE - 1) & !(PTR_SIZE - 1);

        for &(after_i32, slot_idx) in &typed_fixups {
            // Slots sit after the stream, so the displacement is a
            // small non-negative number bounded by the blob size.
            let rel = (slots_offset + slot_idx * PTR_SIZE - after_i32) as i32;
            stream[after_i32 - 4..after_i32].copy_from_slice(&rel.to_le_bytes());
        }

        // Pointer-aligned backing store: stream bytes, padding, slots.
        let total = slots_offset + slots.len() * PTR_SIZE;
        let words = total.div_ceil(PTR_SIZE);
        let mut storage = vec![0usize; words].into_boxed_slice();
        unsafe {
            let base = storage.as_mut_ptr().cast::<u8>();
            std::ptr::copy_nonoverlapping(stream.as_ptr(), base, stream.len());
            let slot_base = base.add(slots_offset).cast::<*const u8>();
            for (i, &slot) in slots.iter().enumerate() {
                slot_base.add(i).write(slot);
            }
        }

        EhInfoBlob {
            storage,
            clauses: self.clauses.len() as u32,
        }
    }
}

/// An owned EH-info table, pointer-aligned and stable in memory.
pub struct EhInfoBlob {
    storage: Box<[usize]>,
    clauses: u32,
}

impl EhInfoBlob {
    /// Address of the count prefix; this is what goes into the code
    /// header's EH-info field.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr().cast()
    }

    /// Size of the table in bytes, padding included.
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len() * std::mem::size_of::<usize>()
    }

    /// Number of clauses in the table.
    #[inline]
    pub fn clause_count(&self) -> u32 {
        self.clauses
    }

    /// Whether the table holds no clauses. The count prefix always
    /// occupies storage, so this is not a check on `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clauses == 0
    }
}

// The blob is immutable after construction.
unsafe impl Send for EhInfoBlob {}
unsafe impl Sync for EhInfoBlob {}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(blob: &EhInfoBlob, method_start: *const u8) -> Vec<EhClause> {
        let mut cursor = blob.as_ptr();
        unsafe {
            let count = decode_clause_count(&mut cursor);
            (0..count)
                .map(|_| decode_clause(&mut cursor, method_start).expect("valid kind"))
                .collect()
        }
    }

    #[test]
    fn typed_clause_roundtrip() {
        let ty = 0x5000usize as *const u8;
        let blob = EhInfoBuilder::new().typed(4, 12, 32, ty).finish();

        let method = 0x1000usize as *const u8;
        let clauses = decode_all(&blob, method);
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].kind(), EhClauseKind::Typed);
        assert_eq!(clauses[0].try_start_offset, 4);
        assert_eq!(clauses[0].try_end_offset, 16);
        assert_eq!(clauses[0].handler_address, 0x1020usize as *const u8);
        assert_eq!(clauses[0].payload, EhPayload::Typed { target_type: ty });
    }

    #[test]
    fn fault_clause_roundtrip() {
        let blob = EhInfoBuilder::new().fault(70, 10, 90).finish();
        let method = 0x4000usize as *const u8;
        let clauses = decode_all(&blob, method);
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].kind(), EhClauseKind::Fault);
        assert_eq!(clauses[0].try_start_offset, 70);
        assert_eq!(clauses[0].try_end_offset, 80);
        assert_eq!(clauses[0].handler_address, unsafe { method.add(90) });
    }

    #[test]
    fn filter_clause_roundtrip() {
        let blob = EhInfoBuilder::new().filter(30, 10, 60, 55).finish();
        let method = 0x8000usize as *const u8;
        let clauses = decode_all(&blob, method);
        assert_eq!(clauses[0].kind(), EhClauseKind::Filter);
        assert_eq!(clauses[0].handler_address, unsafe { method.add(60) });
        assert_eq!(
            clauses[0].payload,
            EhPayload::Filter {
                filter_address: unsafe { method.add(55) }
            }
        );
    }

    #[test]
    fn three_clause_table_decodes_in_order() {
        let ty = 0xbeef0usize as *const u8;
        let blob = EhInfoBuilder::new()
            .typed(0, 10, 20, ty)
            .filter(30, 10, 60, 55)
            .fault(70, 10, 90)
            .finish();

        let method = 0x2000usize as *const u8;
        let clauses = decode_all(&blob, method);
        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[0].kind(), EhClauseKind::Typed);
        assert_eq!(clauses[1].kind(), EhClauseKind::Filter);
        assert_eq!(clauses[2].kind(), EhClauseKind::Fault);
        assert_eq!(clauses[1].try_start_offset, 30);
        assert_eq!(clauses[2].try_end_offset, 80);
    }

    #[test]
    fn large_offsets_take_multibyte_varints() {
        let blob = EhInfoBuilder::new().fault(100_000, 5_000, 200_000).finish();
        let method = std::ptr::null::<u8>();
        let clauses = decode_all(&blob, method);
        assert_eq!(clauses[0].try_start_offset, 100_000);
        assert_eq!(clauses[0].try_end_offset, 105_000);
        assert_eq!(clauses[0].handler_address as usize, 200_000);
    }

    #[test]
    fn empty_table_has_zero_count() {
        let blob = EhInfoBuilder::new().finish();
        let mut cursor = blob.as_ptr();
        assert_eq!(unsafe { decode_clause_count(&mut cursor) }, 0);

        // Emptiness means zero clauses; the count prefix still takes
        // storage.
        assert!(blob.is_empty());
        assert_eq!(blob.clause_count(), 0);
        assert!(blob.len() > 0);

        let populated = EhInfoBuilder::new().fault(0, 8, 16).finish();
        assert!(!populated.is_empty());
        assert_eq!(populated.clause_count(), 1);
    }
}
