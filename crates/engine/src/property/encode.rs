//! Typed-value → byte encoders, the inverse of decode for the types that
//! have a round-trippable representation.
use crate::mapping::{Endianness, Mapping, PropertyKind, TimeFormat};
use crate::store::{MemoryStore, StoreError};
use shared::Value;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("no write encoding for {0} values")]
    Unsupported(&'static str),

    #[error("{0}")]
    Mismatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn mismatch(kind: &str, value: &Value) -> EncodeError {
    EncodeError::Mismatch(format!(
        "cannot encode a {} value as {kind}",
        value.type_name()
    ))
}

fn int_in_range(value: &Value, kind: &str, min: i64, max: i64) -> Result<i64, EncodeError> {
    let v = value.as_i64().ok_or_else(|| mismatch(kind, value))?;
    if v < min || v > max {
        return Err(EncodeError::Mismatch(format!(
            "{v} out of {kind} range {min}..={max}"
        )));
    }
    Ok(v)
}

fn write_uint(v: u64, width: usize, endian: Endianness) -> Vec<u8> {
    let mut out = vec![0u8; width];
    match endian {
        Endianness::Little => {
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = (v >> (8 * i)) as u8;
            }
        }
        Endianness::Big => {
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = (v >> (8 * (width - 1 - i))) as u8;
            }
        }
    }
    out
}

/// Encodes `value` as `kind`, producing exactly `width` bytes.
///
/// Bit and nibble writes read the current byte from the store so the
/// untouched half survives. Types without a defined inverse are rejected.
pub fn encode(
    store: &MemoryStore,
    mapping: &Mapping,
    value: &Value,
    kind: &PropertyKind,
    addr: u32,
    width: usize,
    endian: Endianness,
) -> Result<Vec<u8>, EncodeError> {
    Ok(match kind {
        PropertyKind::U8 => vec![int_in_range(value, "u8", 0, 0xFF)? as u8],
        PropertyKind::U16 => write_uint(
            int_in_range(value, "u16", 0, 0xFFFF)? as u64,
            2,
            endian,
        ),
        PropertyKind::U32 => write_uint(
            int_in_range(value, "u32", 0, u32::MAX as i64)? as u64,
            4,
            endian,
        ),
        PropertyKind::I8 => {
            vec![int_in_range(value, "i8", i8::MIN as i64, i8::MAX as i64)? as u8]
        }
        PropertyKind::I16 => write_uint(
            (int_in_range(value, "i16", i16::MIN as i64, i16::MAX as i64)? as u16) as u64,
            2,
            endian,
        ),
        PropertyKind::I32 => write_uint(
            (int_in_range(value, "i32", i32::MIN as i64, i32::MAX as i64)? as u32) as u64,
            4,
            endian,
        ),
        PropertyKind::F32 => {
            let v = value.as_f64().ok_or_else(|| mismatch("f32", value))? as f32;
            write_uint(u64::from(v.to_bits()), 4, endian)
        }
        PropertyKind::F64 => {
            let v = value.as_f64().ok_or_else(|| mismatch("f64", value))?;
            write_uint(v.to_bits(), 8, endian)
        }
        PropertyKind::Bool => {
            let v = value.as_bool().ok_or_else(|| mismatch("bool", value))?;
            vec![u8::from(v)]
        }
        PropertyKind::Bit { position } => {
            let set = value.as_bool().ok_or_else(|| mismatch("bit", value))?;
            let current = store.read_u8(addr)?;
            let mask = 1u8 << position;
            vec![if set { current | mask } else { current & !mask }]
        }
        PropertyKind::Nibble { position } => {
            let v = int_in_range(value, "nibble", 0, 0xF)? as u8;
            let current = store.read_u8(addr)?;
            vec![if *position == 0 {
                (current & 0xF0) | v
            } else {
                (current & 0x0F) | (v << 4)
            }]
        }
        PropertyKind::Bcd { length } => {
            let max = 10i64.pow(2 * *length as u32) - 1;
            let mut v = int_in_range(value, "bcd", 0, max)?;
            let mut out = vec![0u8; *length];
            for byte in out.iter_mut().rev() {
                let pair = v % 100;
                *byte = (((pair / 10) as u8) << 4) | (pair % 10) as u8;
                v /= 100;
            }
            out
        }
        PropertyKind::String { length, charmap } => {
            let text = value.as_str().ok_or_else(|| mismatch("string", value))?;
            let charmap = charmap.as_ref().and_then(|n| mapping.charmaps.get(n));
            let mut bytes = match charmap {
                Some(map) => map.encode(text).ok_or_else(|| {
                    EncodeError::Mismatch(format!(
                        "string contains characters outside the character map: \"{text}\""
                    ))
                })?,
                None => {
                    if !text.is_ascii() {
                        return Err(EncodeError::Mismatch(
                            "non-ascii string without a character map".to_string(),
                        ));
                    }
                    text.as_bytes().to_vec()
                }
            };
            if bytes.len() > *length {
                return Err(EncodeError::Mismatch(format!(
                    "string needs {} bytes but the property holds {length}",
                    bytes.len()
                )));
            }
            let fill = charmap.map(|m| m.terminator()).unwrap_or(0);
            bytes.resize(*length, fill);
            bytes
        }
        PropertyKind::Bitfield { length } => {
            let Value::List(bits) = value else {
                return Err(mismatch("bitfield", value));
            };
            if bits.len() != length * 8 {
                return Err(EncodeError::Mismatch(format!(
                    "bitfield expects {} bits, got {}",
                    length * 8,
                    bits.len()
                )));
            }
            let mut out = vec![0u8; *length];
            for (i, bit) in bits.iter().enumerate() {
                let set = bit.as_bool().ok_or_else(|| mismatch("bitfield", bit))?;
                if set {
                    out[i / 8] |= 1 << (i % 8);
                }
            }
            out
        }
        PropertyKind::Time { format, .. } => match format {
            TimeFormat::Frames | TimeFormat::Ms | TimeFormat::Seconds => {
                let raw = value
                    .as_i64()
                    .or_else(|| value.field("raw").and_then(Value::as_i64))
                    .ok_or_else(|| mismatch("time", value))?;
                if raw < 0 {
                    return Err(EncodeError::Mismatch("negative time value".to_string()));
                }
                write_uint(raw as u64, width, endian)
            }
            TimeFormat::Unix | TimeFormat::Bcd => {
                return Err(EncodeError::Unsupported("time"));
            }
        },
        PropertyKind::Percentage { max_value, .. } => {
            let raw = match value.field("raw").and_then(Value::as_i64) {
                Some(raw) => raw,
                None => {
                    let percent = value
                        .as_f64()
                        .ok_or_else(|| mismatch("percentage", value))?;
                    if !(0.0..=100.0).contains(&percent) {
                        return Err(EncodeError::Mismatch(format!(
                            "percentage {percent} outside 0..=100"
                        )));
                    }
                    (percent / 100.0 * max_value).round() as i64
                }
            };
            if raw < 0 {
                return Err(EncodeError::Mismatch("negative raw value".to_string()));
            }
            write_uint(raw as u64, width, endian)
        }
        other => return Err(EncodeError::Unsupported(other.name())),
    })
}
