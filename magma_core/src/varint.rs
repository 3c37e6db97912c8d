//! Unsigned variable-length integer codec.
//!
//! Metadata streams (EH tables in particular) store small integers as
//! LEB128-style varints: low 7 bits per byte, high bit set on every
//! byte except the last. Readers decode a value and advance the cursor
//! in one step, so a stream can be walked without a separate length
//! prefix per field.

/// Maximum encoded size of a `u32` (ceil(32 / 7) bytes).
pub const MAX_ENCODED_LEN: usize = 5;

/// Append the varint encoding of `value` to `out`.
pub fn write_unsigned(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `write_unsigned` would emit for `value`.
#[inline]
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// Decode a varint at `*cursor`, advancing the cursor past it.
///
/// # Safety
/// `*cursor` must point into a readable byte stream containing a
/// well-formed varint (at most [`MAX_ENCODED_LEN`] bytes remaining).
pub unsafe fn read_unsigned(cursor: &mut *const u8) -> u32 {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = unsafe { cursor.read() };
        *cursor = unsafe { cursor.add(1) };
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return value;
        }
        shift += 7;
        debug_assert!(shift < 35, "varint longer than 5 bytes");
    }
}

/// Decode a varint from a slice, returning the value and bytes consumed.
///
/// Returns `None` on a truncated stream.
pub fn read_unsigned_slice(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in bytes.iter().enumerate().take(MAX_ENCODED_LEN) {
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u32) {
        let mut buf = Vec::new();
        write_unsigned(&mut buf, value);
        assert_eq!(buf.len(), encoded_len(value));

        let (decoded, used) = read_unsigned_slice(&buf).expect("well-formed");
        assert_eq!(decoded, value);
        assert_eq!(used, buf.len());

        let mut cursor = buf.as_ptr();
        let decoded = unsafe { read_unsigned(&mut cursor) };
        assert_eq!(decoded, value);
        assert_eq!(cursor as usize - buf.as_ptr() as usize, buf.len());
    }

    #[test]
    fn single_byte_values() {
        roundtrip(0);
        roundtrip(1);
        roundtrip(0x7f);
    }

    #[test]
    fn multi_byte_values() {
        roundtrip(0x80);
        roundtrip(0x3fff);
        roundtrip(0x4000);
        roundtrip(1_000_000);
        roundtrip(u32::MAX);
    }

    #[test]
    fn cursor_advances_through_stream() {
        let mut buf = Vec::new();
        write_unsigned(&mut buf, 3);
        write_unsigned(&mut buf, 300);
        write_unsigned(&mut buf, 70_000);

        let mut cursor = buf.as_ptr();
        unsafe {
            assert_eq!(read_unsigned(&mut cursor), 3);
            assert_eq!(read_unsigned(&mut cursor), 300);
            assert_eq!(read_unsigned(&mut cursor), 70_000);
        }
        assert_eq!(cursor as usize, buf.as_ptr() as usize + buf.len());
    }

    #[test]
    fn truncated_slice_is_rejected() {
        assert_eq!(read_unsigned_slice(&[0x80]), None);
        assert_eq!(read_unsigned_slice(&[]), None);
    }
}
