//! Byte → typed-value decoders for the full property type set.
//!
//! Composite decoders return an ordered [`Value::Map`] carrying both the raw
//! numeric interpretation and the type-specific expansion.
use crate::mapping::{
    ChecksumAlgorithm, ColorFormat, CoordinateSystem, Endianness, Mapping, PropertyKind,
    StructField, TimeFormat, VersionFormat,
};
use crate::property::ValidationEvent;
use crate::property::expr::Scope;
use crate::property::transform;
use crate::store::{MemoryStore, StoreError};
use md5::{Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};
use shared::Value;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Invalid(String),
}

pub struct DecodeCtx<'a> {
    pub store: &'a MemoryStore,
    pub mapping: &'a Mapping,
}

/// The value a property degrades to while its region is unfetched.
pub fn zero_value(kind: &PropertyKind) -> Value {
    match kind {
        PropertyKind::U8
        | PropertyKind::U16
        | PropertyKind::U32
        | PropertyKind::I8
        | PropertyKind::I16
        | PropertyKind::I32
        | PropertyKind::Nibble { .. }
        | PropertyKind::Bcd { .. } => Value::Int(0),
        PropertyKind::F32 | PropertyKind::F64 => Value::Float(0.0),
        PropertyKind::Bool | PropertyKind::Bit { .. } => Value::Bool(false),
        PropertyKind::String { .. } => Value::Str(String::new()),
        PropertyKind::Bitfield { .. } | PropertyKind::Array { .. } => Value::List(Vec::new()),
        _ => Value::Map(Vec::new()),
    }
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Unsigned integer of up to 8 bytes in the given byte order.
fn read_uint(
    store: &MemoryStore,
    addr: u32,
    width: usize,
    endian: Endianness,
) -> Result<u64, StoreError> {
    let bytes = store.read_bytes(addr, width.min(8))?;
    let mut value = 0u64;
    match endian {
        Endianness::Little => {
            for b in bytes.iter().rev() {
                value = (value << 8) | u64::from(*b);
            }
        }
        Endianness::Big => {
            for b in bytes.iter() {
                value = (value << 8) | u64::from(*b);
            }
        }
    }
    Ok(value)
}

fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Decodes `width` bytes at `addr` as `kind`.
///
/// `scope` backs expressions inside struct-field transform chains; `events`
/// collects validation failures found along the way.
pub fn decode(
    ctx: &DecodeCtx<'_>,
    addr: u32,
    width: usize,
    kind: &PropertyKind,
    endian: Endianness,
    scope: &dyn Scope,
    events: &mut Vec<ValidationEvent>,
) -> Result<Value, DecodeError> {
    let store = ctx.store;
    Ok(match kind {
        PropertyKind::U8 => Value::Int(i64::from(store.read_u8(addr)?)),
        PropertyKind::U16 => Value::Int(i64::from(store.read_u16(addr, endian)?)),
        PropertyKind::U32 => Value::Int(i64::from(store.read_u32(addr, endian)?)),
        PropertyKind::I8 => Value::Int(i64::from(store.read_i8(addr)?)),
        PropertyKind::I16 => Value::Int(i64::from(store.read_i16(addr, endian)?)),
        PropertyKind::I32 => Value::Int(i64::from(store.read_i32(addr, endian)?)),
        PropertyKind::F32 => Value::Float(f64::from(store.read_f32(addr, endian)?)),
        PropertyKind::F64 => Value::Float(store.read_f64(addr, endian)?),
        PropertyKind::Bool => Value::Bool(store.read_bool(addr)?),
        PropertyKind::Bit { position } => {
            Value::Bool((store.read_u8(addr)? >> position) & 1 == 1)
        }
        PropertyKind::Nibble { position } => {
            let byte = store.read_u8(addr)?;
            Value::Int(i64::from(if *position == 0 {
                byte & 0x0F
            } else {
                byte >> 4
            }))
        }
        PropertyKind::Bcd { length } => Value::Int(store.read_bcd(addr, *length)? as i64),
        PropertyKind::String { length, charmap } => {
            let charmap = charmap.as_ref().and_then(|n| ctx.mapping.charmaps.get(n));
            Value::Str(store.read_string(addr, *length, charmap)?)
        }
        PropertyKind::Bitfield { length } => Value::List(
            store
                .read_bitfield(addr, *length)?
                .into_iter()
                .map(Value::Bool)
                .collect(),
        ),
        PropertyKind::Enum { values } => {
            let raw = read_uint(store, addr, width, endian)? as i64;
            let variant = values.iter().find(|v| v.value == raw);
            let mut entries = vec![
                ("value", Value::Int(raw)),
                (
                    "name",
                    Value::Str(
                        variant
                            .map(|v| v.name.clone())
                            .unwrap_or_else(|| "unknown".to_string()),
                    ),
                ),
            ];
            if let Some(v) = variant {
                if let Some(description) = &v.description {
                    entries.push(("description", Value::Str(description.clone())));
                }
                if let Some(color) = &v.color {
                    entries.push(("color", Value::Str(color.clone())));
                }
                entries.push(("deprecated", Value::Bool(v.deprecated)));
            }
            map(entries)
        }
        PropertyKind::Flags { defs } => {
            let raw = read_uint(store, addr, width, endian)?;
            let mut flags = Vec::new();
            let mut active = Vec::new();
            for def in defs {
                let set = ((raw >> def.bit) & 1 == 1) != def.invert_logic;
                flags.push((def.name.clone(), Value::Bool(set)));
                if set {
                    active.push(def.name.clone());
                }
            }
            let mut conflicts = Vec::new();
            for def in defs {
                if !active.contains(&def.name) {
                    continue;
                }
                for other in &def.mutually_exclusive {
                    if active.contains(other) && !conflicts.contains(&def.name) {
                        conflicts.push(def.name.clone());
                    }
                    if active.contains(other) && !conflicts.contains(other) {
                        conflicts.push(other.clone());
                    }
                }
            }
            conflicts.sort();
            map(vec![
                ("value", Value::Int(raw as i64)),
                ("flags", Value::Map(flags)),
                (
                    "active",
                    Value::List(active.into_iter().map(Value::Str).collect()),
                ),
                (
                    "conflicts",
                    Value::List(conflicts.into_iter().map(Value::Str).collect()),
                ),
            ])
        }
        PropertyKind::Time { format, frame_rate } => {
            decode_time(store, addr, width, endian, *format, *frame_rate)?
        }
        PropertyKind::Version { format } => decode_version(store, addr, width, endian, *format)?,
        PropertyKind::Checksum { algorithm, range } => {
            let (start, end) = *range;
            let data = store.read_bytes(start, (end - start) as usize + 1)?;
            let (computed, stored) = match algorithm {
                ChecksumAlgorithm::Crc16 => (
                    Value::Int(i64::from(crc16_ccitt(&data))),
                    Value::Int(read_uint(store, addr, width, endian)? as i64),
                ),
                ChecksumAlgorithm::Crc32 => (
                    Value::Int(i64::from(crc32_ieee(&data))),
                    Value::Int(read_uint(store, addr, width, endian)? as i64),
                ),
                ChecksumAlgorithm::Simple => (
                    Value::Int(data.iter().map(|b| i64::from(*b)).sum::<i64>()),
                    Value::Int(read_uint(store, addr, width, endian)? as i64),
                ),
                ChecksumAlgorithm::Md5 => (
                    Value::Str(hex_string(Md5::digest(&data).as_slice())),
                    Value::Str(hex_string(&store.read_bytes(addr, width)?)),
                ),
                ChecksumAlgorithm::Sha1 => (
                    Value::Str(hex_string(Sha1::digest(&data).as_slice())),
                    Value::Str(hex_string(&store.read_bytes(addr, width)?)),
                ),
            };
            let valid = computed == stored;
            map(vec![
                ("algorithm", Value::Str(format!("{algorithm:?}").to_lowercase())),
                ("computed", computed),
                ("stored", stored),
                ("valid", Value::Bool(valid)),
            ])
        }
        PropertyKind::Coordinate {
            system,
            dimensions,
            units,
        } => {
            let dims = usize::from(*dimensions).max(1);
            if width % dims != 0 {
                return Err(DecodeError::Invalid(format!(
                    "coordinate width {width} not divisible by {dims} dimensions"
                )));
            }
            let step = width / dims;
            if step == 0 || step > 8 {
                return Err(DecodeError::Invalid(format!(
                    "coordinate element width {step} out of range 1..=8"
                )));
            }
            let names: &[&str] = match system {
                CoordinateSystem::Cartesian => &["x", "y", "z", "w"],
                CoordinateSystem::Screen => &["x", "y"],
                CoordinateSystem::Polar => &["radius", "angle"],
                CoordinateSystem::Geographic => &["latitude", "longitude"],
            };
            let mut entries = Vec::new();
            for i in 0..dims {
                let raw = read_uint(store, addr + (i * step) as u32, step, endian)?;
                // Sign-extend from the element width.
                let shift = 64 - (step * 8) as u32;
                let value = ((raw << shift) as i64) >> shift;
                let name = names.get(i).copied().unwrap_or("d");
                entries.push((name.to_string(), Value::Int(value)));
            }
            if let Some(units) = units {
                entries.push(("units".to_string(), Value::Str(units.clone())));
            }
            Value::Map(entries)
        }
        PropertyKind::Color { format } => decode_color(store, addr, endian, *format)?,
        PropertyKind::Percentage {
            max_value,
            precision,
        } => {
            let raw = read_uint(store, addr, width, endian)?;
            let percent = if *max_value == 0.0 {
                0.0
            } else {
                raw as f64 / max_value * 100.0
            };
            let factor = 10f64.powi(i32::from(*precision));
            let rounded = (percent * factor).round() / factor;
            map(vec![
                ("raw", Value::Int(raw as i64)),
                (
                    "percent",
                    if rounded.fract() == 0.0 {
                        Value::Int(rounded as i64)
                    } else {
                        Value::Float(rounded)
                    },
                ),
            ])
        }
        PropertyKind::Pointer {
            target,
            max_dereferences,
            null_value,
        } => {
            let mut current = addr;
            for _ in 0..(*max_dereferences).max(1) {
                let ptr = read_uint(store, current, width, endian)? as u32;
                if ptr == *null_value {
                    return Ok(map(vec![
                        ("address", Value::Int(i64::from(ptr))),
                        ("null", Value::Bool(true)),
                    ]));
                }
                current = ptr;
            }
            let target_width = target.intrinsic_width().ok_or_else(|| {
                DecodeError::Invalid("pointer target type has no fixed width".to_string())
            })?;
            let value = decode(ctx, current, target_width, target, endian, scope, events)?;
            map(vec![
                ("address", Value::Int(i64::from(current))),
                ("null", Value::Bool(false)),
                ("value", value),
            ])
        }
        PropertyKind::Array {
            element,
            length,
            length_property,
            stride,
            index_offset: _,
        } => {
            let count = match (length, length_property) {
                (Some(n), _) => *n,
                (None, Some(prop_name)) => {
                    let prop = ctx.mapping.properties.get(prop_name).ok_or_else(|| {
                        DecodeError::Invalid(format!(
                            "array length property \"{prop_name}\" not found"
                        ))
                    })?;
                    let value = decode(
                        ctx,
                        prop.address,
                        prop.width,
                        &prop.kind,
                        ctx.mapping.endianness_of(prop),
                        scope,
                        events,
                    )?;
                    value.as_i64().unwrap_or(0).max(0) as usize
                }
                (None, None) => {
                    return Err(DecodeError::Invalid(
                        "array declares neither length nor length property".to_string(),
                    ));
                }
            };
            let element_width = element
                .intrinsic_width()
                .or(*stride)
                .ok_or_else(|| DecodeError::Invalid("array element has no width".to_string()))?;
            let step = stride.unwrap_or(element_width);
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let element_addr = addr + (i * step) as u32;
                items.push(decode(
                    ctx,
                    element_addr,
                    element_width,
                    element,
                    endian,
                    scope,
                    events,
                )?);
            }
            Value::List(items)
        }
        PropertyKind::Struct { fields, extends } => {
            let mut merged: Vec<StructField> = Vec::new();
            if let Some(parent_name) = extends {
                let parent = ctx.mapping.properties.get(parent_name).ok_or_else(|| {
                    DecodeError::Invalid(format!("struct extends unknown \"{parent_name}\""))
                })?;
                let PropertyKind::Struct {
                    fields: parent_fields,
                    ..
                } = &parent.kind
                else {
                    return Err(DecodeError::Invalid(format!(
                        "struct extends non-struct \"{parent_name}\""
                    )));
                };
                merged.extend(parent_fields.iter().cloned());
            }
            for field in fields {
                match merged.iter_mut().find(|f| f.name == field.name) {
                    Some(slot) => *slot = field.clone(),
                    None => merged.push(field.clone()),
                }
            }

            let mut entries = Vec::with_capacity(merged.len());
            for field in &merged {
                let field_width = field.kind.intrinsic_width().unwrap_or(field.size);
                let mut value = decode(
                    ctx,
                    addr + field.offset as u32,
                    field_width,
                    &field.kind,
                    endian,
                    scope,
                    events,
                )?;
                if !field.transforms.is_empty() {
                    let chain = transform::compile_chain(&field.transforms).map_err(|err| {
                        DecodeError::Invalid(format!(
                            "field \"{}\" transform: {err}",
                            field.name
                        ))
                    })?;
                    value = transform::apply_chain(value, &chain, scope, events);
                }
                if let Some(rules) = &field.validation {
                    check_field_bounds(&field.name, &value, rules, events);
                }
                entries.push((field.name.clone(), value));
            }
            Value::Map(entries)
        }
    })
}

/// Struct-field validation: bounds and allowed values only.
fn check_field_bounds(
    field: &str,
    value: &Value,
    rules: &crate::mapping::ValidationRules,
    events: &mut Vec<ValidationEvent>,
) {
    if let (Some(min), Some(x)) = (rules.min, value.as_f64())
        && x < min
    {
        events.push(ValidationEvent {
            rule: "min".into(),
            message: format!("field \"{field}\" value {x} below minimum {min}"),
            value: value.clone(),
        });
    }
    if let (Some(max), Some(x)) = (rules.max, value.as_f64())
        && x > max
    {
        events.push(ValidationEvent {
            rule: "max".into(),
            message: format!("field \"{field}\" value {x} above maximum {max}"),
            value: value.clone(),
        });
    }
    if let Some(allowed) = &rules.allowed_values
        && !allowed.contains(value)
    {
        events.push(ValidationEvent {
            rule: "allowed-values".into(),
            message: format!("field \"{field}\" value not in allowed set"),
            value: value.clone(),
        });
    }
}

fn decode_time(
    store: &MemoryStore,
    addr: u32,
    width: usize,
    endian: Endianness,
    format: TimeFormat,
    frame_rate: Option<f64>,
) -> Result<Value, DecodeError> {
    Ok(match format {
        TimeFormat::Frames => {
            let raw = read_uint(store, addr, width, endian)?;
            let rate = frame_rate.unwrap_or(60.0).max(1.0);
            let total_seconds = (raw as f64 / rate) as u64;
            map(vec![
                ("raw", Value::Int(raw as i64)),
                ("hours", Value::Int((total_seconds / 3600) as i64)),
                ("minutes", Value::Int((total_seconds % 3600 / 60) as i64)),
                ("seconds", Value::Int((total_seconds % 60) as i64)),
                ("frames", Value::Int((raw % rate as u64) as i64)),
            ])
        }
        TimeFormat::Ms => {
            let raw = read_uint(store, addr, width, endian)?;
            map(vec![
                ("raw", Value::Int(raw as i64)),
                ("hours", Value::Int((raw / 3_600_000) as i64)),
                ("minutes", Value::Int((raw % 3_600_000 / 60_000) as i64)),
                ("seconds", Value::Int((raw % 60_000 / 1000) as i64)),
                ("millis", Value::Int((raw % 1000) as i64)),
            ])
        }
        TimeFormat::Seconds => {
            let raw = read_uint(store, addr, width, endian)?;
            map(vec![
                ("raw", Value::Int(raw as i64)),
                ("hours", Value::Int((raw / 3600) as i64)),
                ("minutes", Value::Int((raw % 3600 / 60) as i64)),
                ("seconds", Value::Int((raw % 60) as i64)),
            ])
        }
        TimeFormat::Unix => {
            let raw = read_uint(store, addr, width, endian)?;
            map(vec![("raw", Value::Int(raw as i64))])
        }
        TimeFormat::Bcd => {
            let bytes = store.read_bytes(addr, width)?;
            let digit = |b: u8| i64::from(((b >> 4).min(9)) * 10 + (b & 0xF).min(9));
            map(vec![
                ("hours", Value::Int(bytes.first().copied().map(digit).unwrap_or(0))),
                ("minutes", Value::Int(bytes.get(1).copied().map(digit).unwrap_or(0))),
                ("seconds", Value::Int(bytes.get(2).copied().map(digit).unwrap_or(0))),
            ])
        }
    })
}

fn decode_version(
    store: &MemoryStore,
    addr: u32,
    width: usize,
    endian: Endianness,
    format: VersionFormat,
) -> Result<Value, DecodeError> {
    Ok(match format {
        VersionFormat::SemVer => {
            let bytes = store.read_bytes(addr, width.max(3))?;
            let (major, minor, patch) =
                (i64::from(bytes[0]), i64::from(bytes[1]), i64::from(bytes[2]));
            map(vec![
                ("major", Value::Int(major)),
                ("minor", Value::Int(minor)),
                ("patch", Value::Int(patch)),
                ("display", Value::Str(format!("{major}.{minor}.{patch}"))),
            ])
        }
        VersionFormat::Bcd => {
            let raw = store.read_bcd(addr, width)?;
            map(vec![
                ("raw", Value::Int(raw as i64)),
                ("display", Value::Str(raw.to_string())),
            ])
        }
        VersionFormat::Packed => {
            let v = read_uint(store, addr, 4.min(width), endian)?;
            let (major, minor, patch, build) = (
                (v >> 24) & 0xFF,
                (v >> 16) & 0xFF,
                (v >> 8) & 0xFF,
                v & 0xFF,
            );
            map(vec![
                ("major", Value::Int(major as i64)),
                ("minor", Value::Int(minor as i64)),
                ("patch", Value::Int(patch as i64)),
                ("build", Value::Int(build as i64)),
                (
                    "display",
                    Value::Str(format!("{major}.{minor}.{patch}.{build}")),
                ),
            ])
        }
        VersionFormat::String => {
            let text = store.read_string(addr, width, None)?;
            map(vec![("display", Value::Str(text))])
        }
    })
}

fn rgb_expansion(r: u8, g: u8, b: u8, a: Option<u8>) -> Value {
    let luminance =
        (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)).round() as i64;
    let hex = match a {
        Some(a) => format!("#{:02x}{:02x}{:02x}{:02x}", r, g, b, a),
        None => format!("#{:02x}{:02x}{:02x}", r, g, b),
    };
    let (h, s, l) = rgb_to_hsl(r, g, b);
    let mut entries = vec![
        ("r".to_string(), Value::Int(i64::from(r))),
        ("g".to_string(), Value::Int(i64::from(g))),
        ("b".to_string(), Value::Int(i64::from(b))),
    ];
    if let Some(a) = a {
        entries.push(("a".to_string(), Value::Int(i64::from(a))));
    }
    entries.push(("hex".to_string(), Value::Str(hex)));
    entries.push(("luminance".to_string(), Value::Int(luminance)));
    entries.push((
        "hsl".to_string(),
        Value::Map(vec![
            ("h".to_string(), Value::Int(h)),
            ("s".to_string(), Value::Int(s)),
            ("l".to_string(), Value::Int(l)),
        ]),
    ));
    Value::Map(entries)
}

fn rgb_to_hsl(r: u8, g: u8, b: u8) -> (i64, i64, i64) {
    let r = f64::from(r) / 255.0;
    let g = f64::from(g) / 255.0;
    let b = f64::from(b) / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    if max == min {
        return (0, 0, (l * 100.0).round() as i64);
    }
    let d = max - min;
    let s = if l > 0.5 {
        d / (2.0 - max - min)
    } else {
        d / (max + min)
    };
    let h = if max == r {
        (g - b) / d + if g < b { 6.0 } else { 0.0 }
    } else if max == g {
        (b - r) / d + 2.0
    } else {
        (r - g) / d + 4.0
    } * 60.0;
    (
        h.round() as i64,
        (s * 100.0).round() as i64,
        (l * 100.0).round() as i64,
    )
}

fn decode_color(
    store: &MemoryStore,
    addr: u32,
    endian: Endianness,
    format: ColorFormat,
) -> Result<Value, DecodeError> {
    Ok(match format {
        ColorFormat::Rgb565 => {
            let v = store.read_u16(addr, endian)?;
            let r = (((v >> 11) & 0x1F) << 3) as u8;
            let g = (((v >> 5) & 0x3F) << 2) as u8;
            let b = ((v & 0x1F) << 3) as u8;
            rgb_expansion(r, g, b, None)
        }
        ColorFormat::Rgb888 => {
            let bytes = store.read_bytes(addr, 3)?;
            rgb_expansion(bytes[0], bytes[1], bytes[2], None)
        }
        ColorFormat::Argb8888 => {
            let bytes = store.read_bytes(addr, 4)?;
            rgb_expansion(bytes[1], bytes[2], bytes[3], Some(bytes[0]))
        }
        ColorFormat::Rgba8888 => {
            let bytes = store.read_bytes(addr, 4)?;
            rgb_expansion(bytes[0], bytes[1], bytes[2], Some(bytes[3]))
        }
        ColorFormat::Palette => {
            let index = store.read_u8(addr)?;
            map(vec![("index", Value::Int(i64::from(index)))])
        }
        ColorFormat::Yuv => {
            let bytes = store.read_bytes(addr, 3)?;
            let (y, u, v) = (
                f64::from(bytes[0]),
                f64::from(bytes[1]) - 128.0,
                f64::from(bytes[2]) - 128.0,
            );
            let clamp = |x: f64| x.round().clamp(0.0, 255.0) as u8;
            let r = clamp(y + 1.402 * v);
            let g = clamp(y - 0.344136 * u - 0.714136 * v);
            let b = clamp(y + 1.772 * u);
            rgb_expansion(r, g, b, None)
        }
    })
}
