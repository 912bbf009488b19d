//! Record format decoding
//!
//! A record is a header (its own size as a varint, then one serial type per
//! column) followed by the column bodies. Text is assumed to be UTF-8;
//! invalid sequences are replaced rather than rejected.

use rusqlite::types::Value;

use super::page::PageDamage;
use super::varint::read_varint;

/// Decoded column values of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub values: Vec<Value>,
    /// Payload ended early; trailing values are cut short or NULL.
    pub truncated: bool,
}

/// Body length in bytes of a serial type. Types 10 and 11 are reserved.
fn body_len(serial_type: u64) -> Option<usize> {
    match serial_type {
        0 | 8 | 9 => Some(0),
        1 => Some(1),
        2 => Some(2),
        3 => Some(3),
        4 => Some(4),
        5 => Some(6),
        6 | 7 => Some(8),
        10 | 11 => None,
        n => Some(((n - 12) / 2) as usize),
    }
}

fn read_int(bytes: &[u8]) -> i64 {
    let mut value = i64::from(bytes[0] as i8);
    for b in &bytes[1..] {
        value = (value << 8) | i64::from(*b);
    }
    value
}

fn decode_value(serial_type: u64, body: &[u8]) -> Value {
    match serial_type {
        0 => Value::Null,
        1..=6 => Value::Integer(read_int(body)),
        7 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(body);
            Value::Real(f64::from_be_bytes(raw))
        }
        8 => Value::Integer(0),
        9 => Value::Integer(1),
        n if n % 2 == 0 => Value::Blob(body.to_vec()),
        _ => Value::Text(String::from_utf8_lossy(body).into_owned()),
    }
}

/// Decode `payload` into column values.
///
/// `complete` says whether the whole declared payload was available. When
/// it was not, a header that is still intact yields a truncated record:
/// a text or blob that runs past the end is cut, and any other column
/// without its full body becomes NULL.
pub fn decode_record(payload: &[u8], complete: bool) -> Result<DecodedRecord, PageDamage> {
    let (header_size, mut at) = read_varint(payload).ok_or(PageDamage::BadRecord)?;
    let header_size = header_size as usize;
    if header_size < at || header_size > payload.len() {
        return Err(PageDamage::BadRecord);
    }

    let mut serial_types = Vec::new();
    while at < header_size {
        let (serial_type, n) =
            read_varint(&payload[at..header_size]).ok_or(PageDamage::BadRecord)?;
        if body_len(serial_type).is_none() {
            return Err(PageDamage::BadRecord);
        }
        serial_types.push(serial_type);
        at += n;
    }

    let mut values = Vec::with_capacity(serial_types.len());
    let mut truncated = false;
    let mut offset = header_size;
    for serial_type in serial_types {
        let len = body_len(serial_type).unwrap_or(0);
        let available = payload.len().saturating_sub(offset);

        if len <= available {
            values.push(decode_value(serial_type, &payload[offset..offset + len]));
            offset += len;
            continue;
        }
        if complete {
            return Err(PageDamage::BadRecord);
        }

        truncated = true;
        let partial = &payload[offset..offset + available];
        offset += available;
        if serial_type >= 12 {
            values.push(decode_value(serial_type, partial));
        } else {
            values.push(Value::Null);
        }
    }

    Ok(DecodedRecord { values, truncated })
}
