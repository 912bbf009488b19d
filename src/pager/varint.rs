//! SQLite big-endian variable-length integers
//!
//! 1 to 9 bytes. The first eight bytes contribute their low 7 bits while
//! the high bit is set; a ninth byte contributes all 8 bits.

/// Decode a varint at the start of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// buffer ends before the varint does.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..8 {
        let byte = *buf.get(i)?;
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let last = *buf.get(8)?;
    Some(((value << 8) | u64::from(last), 9))
}

/// Encode `value` as a SQLite varint. Used to build fixtures.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    if value > 0x00ff_ffff_ffff_ffff {
        let mut bytes = [0u8; 9];
        bytes[8] = value as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            bytes[i] = ((v & 0x7f) as u8) | 0x80;
            v >>= 7;
        }
        out.extend_from_slice(&bytes);
        return;
    }

    let mut groups = [0u8; 8];
    let mut n = 0;
    let mut v = value;
    loop {
        groups[n] = (v & 0x7f) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        out.push(groups[i] | continuation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte() {
        assert_eq!(read_varint(&[0x05]), Some((5, 1)));
        assert_eq!(read_varint(&[0x7f, 0xff]), Some((127, 1)));
    }

    #[test]
    fn test_two_bytes() {
        // 0x81 0x00 == 128
        assert_eq!(read_varint(&[0x81, 0x00]), Some((128, 2)));
    }

    #[test]
    fn test_nine_bytes_is_full_u64() {
        let mut buf = Vec::new();
        write_varint(u64::MAX, &mut buf);
        assert_eq!(buf.len(), 9);
        assert_eq!(read_varint(&buf), Some((u64::MAX, 9)));
    }

    #[test]
    fn test_truncated() {
        assert_eq!(read_varint(&[0x81]), None);
        assert_eq!(read_varint(&[]), None);
    }

    #[test]
    fn test_negative_rowid_bits() {
        let mut buf = Vec::new();
        write_varint((-1i64) as u64, &mut buf);
        let (v, _) = read_varint(&buf).unwrap();
        assert_eq!(v as i64, -1);
    }
}
