//! In-memory model of a loaded mapping: platform, regions, properties,
//! groups, computed nodes, and the load-time invariants over them.
//!
//! The mapping-file loader is an external collaborator; everything here is
//! serde-deserializable so a loader can populate the model directly.
mod loaded;
mod repository;

pub use loaded::{CompiledValidation, LoadedMapping};
pub use repository::{InMemoryRepository, MappingRepository};

use serde::{Deserialize, Serialize};
use shared::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("mapping not found: \"{0}\"")]
    NotFound(String),

    #[error("invalid mapping: {}", causes.join("; "))]
    Invalid { causes: Vec<String> },
}

/// Byte order of the emulated core. Properties may override it per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

/// A named contiguous span of guest RAM, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Region {
    pub name: String,
    pub start: u32,
    pub end: u32,
}

impl Region {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Whether `[addr, addr + width)` lies fully inside this region.
    pub fn contains_range(&self, addr: u32, width: usize) -> bool {
        if width == 0 {
            return false;
        }
        let Some(last) = addr.checked_add(width as u32 - 1) else {
            return false;
        };
        addr >= self.start && last <= self.end
    }
}

/// Target platform descriptor: name, default endianness, fetchable regions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub name: String,
    pub endian: Endianness,
    pub regions: Vec<Region>,
}

impl Platform {
    pub fn contains_range(&self, addr: u32, width: usize) -> bool {
        self.regions.iter().any(|r| r.contains_range(addr, width))
    }

    /// `(start, len)` pairs for the transport's region fetch.
    pub fn fetch_list(&self) -> Vec<(u32, usize)> {
        self.regions.iter().map(|r| (r.start, r.len())).collect()
    }
}

fn default_terminators() -> Vec<u8> {
    vec![0x50, 0xFF]
}

/// Byte → grapheme table for in-game text encodings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CharMap {
    pub map: HashMap<u8, String>,
    /// Bytes that end a string early.
    #[serde(default = "default_terminators")]
    pub terminators: Vec<u8>,
}

impl CharMap {
    /// Decodes bytes up to the first terminator; unmapped bytes are skipped.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut out = String::new();
        for b in bytes {
            if self.terminators.contains(b) {
                break;
            }
            if let Some(g) = self.map.get(b) {
                out.push_str(g);
            }
        }
        out
    }

    /// Reverse lookup for writes. `None` when a grapheme has no byte.
    pub fn encode(&self, text: &str) -> Option<Vec<u8>> {
        let reverse: HashMap<&str, u8> = self.map.iter().map(|(b, g)| (g.as_str(), *b)).collect();
        let mut out = Vec::new();
        for ch in text.chars() {
            let mut buf = [0u8; 4];
            let g = ch.encode_utf8(&mut buf);
            out.push(*reverse.get(&*g)?);
        }
        Some(out)
    }

    /// First terminator byte, used to pad encoded strings.
    pub fn terminator(&self) -> u8 {
        self.terminators.first().copied().unwrap_or(0xFF)
    }
}

/// One step of a property's value transform chain, applied in declared order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    Add(f64),
    Subtract(f64),
    Multiply(f64),
    Divide(f64),
    Modulo(f64),
    BitAnd(u64),
    BitOr(u64),
    BitXor(u64),
    ShiftLeft(u32),
    ShiftRight(u32),
    /// Linear remap of `[in_min, in_max]` onto `[out_min, out_max]`.
    RangeMap {
        in_min: f64,
        in_max: f64,
        out_min: f64,
        out_max: f64,
        #[serde(default)]
        clamp: bool,
    },
    /// Stringified-value lookup table.
    Lookup(Vec<(String, Value)>),
    Trim,
    Uppercase,
    Lowercase,
    Replace {
        from: String,
        to: String,
    },
    Truncate(usize),
    Pad {
        len: usize,
        pad: char,
    },
    /// Ordered `if cond then value` arms; first matching arm wins.
    Conditional(Vec<ConditionalArm>),
    /// Whitelisted expression; the current value is bound as `value`.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConditionalArm {
    pub condition: String,
    pub value: Value,
}

/// Declarative validation rules checked after the transform chain.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub allowed_values: Option<Vec<Value>>,
    /// String pattern, anchored by the author if desired.
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Cross-property predicate over the last snapshot.
    #[serde(default)]
    pub cross_property: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StructField {
    pub name: String,
    pub kind: PropertyKind,
    pub offset: usize,
    pub size: usize,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub validation: Option<ValidationRules>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnumVariantDef {
    pub name: String,
    pub value: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlagDef {
    pub name: String,
    pub bit: u32,
    #[serde(default)]
    pub invert_logic: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mutually_exclusive: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    Frames,
    Ms,
    Seconds,
    Unix,
    Bcd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionFormat {
    #[serde(rename = "major.minor.patch")]
    SemVer,
    Bcd,
    Packed,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc16,
    Crc32,
    Md5,
    Sha1,
    Simple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSystem {
    Cartesian,
    Screen,
    Polar,
    Geographic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    Rgb565,
    Rgb888,
    Argb8888,
    Rgba8888,
    Palette,
    Yuv,
}

/// The decodable type of a property.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
    Bool,
    /// Single bit of the addressed byte, `position` ∈ 0..=7.
    Bit { position: u8 },
    /// Half of the addressed byte, `position` 0 = low, 1 = high.
    Nibble { position: u8 },
    Bcd { length: usize },
    String {
        length: usize,
        #[serde(default)]
        charmap: Option<String>,
    },
    Bitfield { length: usize },
    Array {
        element: Box<PropertyKind>,
        #[serde(default)]
        length: Option<usize>,
        #[serde(default)]
        length_property: Option<String>,
        #[serde(default)]
        stride: Option<usize>,
        #[serde(default)]
        index_offset: i64,
    },
    Struct {
        fields: Vec<StructField>,
        #[serde(default)]
        extends: Option<String>,
    },
    Enum { values: Vec<EnumVariantDef> },
    Flags { defs: Vec<FlagDef> },
    Time {
        format: TimeFormat,
        #[serde(default)]
        frame_rate: Option<f64>,
    },
    Version { format: VersionFormat },
    Checksum {
        algorithm: ChecksumAlgorithm,
        range: (u32, u32),
    },
    Coordinate {
        system: CoordinateSystem,
        dimensions: u8,
        #[serde(default)]
        units: Option<String>,
    },
    Color { format: ColorFormat },
    Percentage {
        max_value: f64,
        #[serde(default)]
        precision: u8,
    },
    Pointer {
        target: Box<PropertyKind>,
        max_dereferences: u8,
        null_value: u32,
    },
}

impl PropertyKind {
    /// Byte width the kind dictates, when it dictates one.
    pub fn intrinsic_width(&self) -> Option<usize> {
        match self {
            PropertyKind::U8
            | PropertyKind::I8
            | PropertyKind::Bool
            | PropertyKind::Bit { .. }
            | PropertyKind::Nibble { .. } => Some(1),
            PropertyKind::U16 | PropertyKind::I16 => Some(2),
            PropertyKind::U32 | PropertyKind::I32 | PropertyKind::F32 => Some(4),
            PropertyKind::F64 => Some(8),
            PropertyKind::Bcd { length }
            | PropertyKind::String { length, .. }
            | PropertyKind::Bitfield { length } => Some(*length),
            _ => None,
        }
    }

    /// Short tag used in glossaries and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            PropertyKind::U8 => "u8",
            PropertyKind::U16 => "u16",
            PropertyKind::U32 => "u32",
            PropertyKind::I8 => "i8",
            PropertyKind::I16 => "i16",
            PropertyKind::I32 => "i32",
            PropertyKind::F32 => "f32",
            PropertyKind::F64 => "f64",
            PropertyKind::Bool => "bool",
            PropertyKind::Bit { .. } => "bit",
            PropertyKind::Nibble { .. } => "nibble",
            PropertyKind::Bcd { .. } => "bcd",
            PropertyKind::String { .. } => "string",
            PropertyKind::Bitfield { .. } => "bitfield",
            PropertyKind::Array { .. } => "array",
            PropertyKind::Struct { .. } => "struct",
            PropertyKind::Enum { .. } => "enum",
            PropertyKind::Flags { .. } => "flags",
            PropertyKind::Time { .. } => "time",
            PropertyKind::Version { .. } => "version",
            PropertyKind::Checksum { .. } => "checksum",
            PropertyKind::Coordinate { .. } => "coordinate",
            PropertyKind::Color { .. } => "color",
            PropertyKind::Percentage { .. } => "percentage",
            PropertyKind::Pointer { .. } => "pointer",
        }
    }

    fn charmap_name(&self) -> Option<&str> {
        match self {
            PropertyKind::String { charmap, .. } => charmap.as_deref(),
            _ => None,
        }
    }
}

/// A named, typed view onto a range of guest RAM. Identity is the map key.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Property {
    pub kind: PropertyKind,
    pub address: u32,
    pub width: usize,
    /// Overrides the platform endianness when set.
    #[serde(default)]
    pub endian: Option<Endianness>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub freezable: bool,
    #[serde(default)]
    pub default_frozen: bool,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub validation: Option<ValidationRules>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// UI/performance/debug hints, carried verbatim, never interpreted.
    #[serde(default)]
    pub hints: Option<Value>,
}

/// Ordered collection of property names with display metadata.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Group {
    pub properties: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub display: Option<Value>,
}

/// A property derived from others by an expression, never read from memory.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ComputedNode {
    pub expression: String,
    pub dependencies: Vec<String>,
    /// Optional declared result kind, informational only.
    #[serde(default)]
    pub kind: Option<String>,
    /// Re-evaluate only when dependency values change.
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GlobalValidationConfig {
    pub enabled: bool,
    pub emit_events: bool,
}

impl Default for GlobalValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emit_events: true,
        }
    }
}

/// The declarative description of one game's memory layout.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Mapping {
    pub name: String,
    pub game: String,
    #[serde(default)]
    pub version: String,
    pub platform: Platform,
    #[serde(default)]
    pub constants: HashMap<String, Value>,
    #[serde(default)]
    pub charmaps: HashMap<String, CharMap>,
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    #[serde(default)]
    pub computed: BTreeMap<String, ComputedNode>,
    /// Reference-type definitions, carried for callers.
    #[serde(default)]
    pub references: HashMap<String, Value>,
    /// Events configuration, carried for callers.
    #[serde(default)]
    pub events: Option<Value>,
    #[serde(default)]
    pub validation: GlobalValidationConfig,
}

impl Mapping {
    /// Checks every load-time invariant, collecting all violations.
    pub fn validate(&self) -> Result<(), MappingError> {
        let mut causes = Vec::new();

        for name in self.computed.keys() {
            if self.properties.contains_key(name) {
                causes.push(format!(
                    "\"{name}\" is declared both as a property and a computed node"
                ));
            }
        }

        for region in &self.platform.regions {
            if region.end < region.start {
                causes.push(format!(
                    "region \"{}\" ends at {:#06x} before it starts at {:#06x}",
                    region.name, region.end, region.start
                ));
            }
        }

        for (name, prop) in &self.properties {
            self.validate_property(name, prop, &mut causes);
        }

        for (group_name, group) in &self.groups {
            for prop in &group.properties {
                if !self.properties.contains_key(prop) && !self.computed.contains_key(prop) {
                    causes.push(format!(
                        "group \"{group_name}\" references unknown property \"{prop}\""
                    ));
                }
            }
        }

        for (node_name, node) in &self.computed {
            for dep in &node.dependencies {
                if !self.properties.contains_key(dep) && !self.computed.contains_key(dep) {
                    causes.push(format!(
                        "computed \"{node_name}\" depends on unknown \"{dep}\""
                    ));
                }
            }
        }

        if let Err(cycle) = self.computed_order() {
            causes.push(format!(
                "computed dependency cycle through: {}",
                cycle.join(", ")
            ));
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(MappingError::Invalid { causes })
        }
    }

    fn validate_property(&self, name: &str, prop: &Property, causes: &mut Vec<String>) {
        if prop.width == 0 {
            causes.push(format!("property \"{name}\" has zero width"));
            return;
        }
        if !self.platform.contains_range(prop.address, prop.width) {
            causes.push(format!(
                "property \"{name}\" at {:#06x}+{} lies outside every region",
                prop.address, prop.width
            ));
        }
        if let Some(w) = prop.kind.intrinsic_width()
            && w != prop.width
        {
            causes.push(format!(
                "property \"{name}\" declares width {} but its type implies {}",
                prop.width, w
            ));
        }
        match &prop.kind {
            PropertyKind::Bit { position } if *position > 7 => {
                causes.push(format!(
                    "property \"{name}\" bit position {position} out of range 0..=7"
                ));
            }
            PropertyKind::Nibble { position } if *position > 1 => {
                causes.push(format!(
                    "property \"{name}\" nibble position {position} out of range 0..=1"
                ));
            }
            PropertyKind::Enum { values } => {
                let mut seen = HashSet::new();
                for v in values {
                    if !seen.insert(v.value) {
                        causes.push(format!(
                            "property \"{name}\" enum value {} declared twice",
                            v.value
                        ));
                    }
                }
            }
            PropertyKind::Flags { defs } => {
                let mut seen = HashSet::new();
                for def in defs {
                    if !seen.insert(def.bit) {
                        causes.push(format!(
                            "property \"{name}\" flag bit {} declared twice",
                            def.bit
                        ));
                    }
                    if def.bit as usize >= prop.width * 8 {
                        causes.push(format!(
                            "property \"{name}\" flag bit {} exceeds width {} bytes",
                            def.bit, prop.width
                        ));
                    }
                }
            }
            _ => {}
        }
        if let Some(charmap) = prop.kind.charmap_name()
            && !self.charmaps.contains_key(charmap)
        {
            causes.push(format!(
                "property \"{name}\" references unknown character map \"{charmap}\""
            ));
        }
        if let Some(rules) = &prop.validation {
            if let (Some(min), Some(max)) = (rules.min, rules.max)
                && min > max
            {
                causes.push(format!(
                    "property \"{name}\" validation min {min} exceeds max {max}"
                ));
            }
            if let Some(pattern) = &rules.regex
                && regex::Regex::new(pattern).is_err()
            {
                causes.push(format!(
                    "property \"{name}\" has an invalid validation regex"
                ));
            }
        }
        if prop.freezable && prop.read_only {
            causes.push(format!(
                "property \"{name}\" cannot be both freezable and read-only"
            ));
        }
        for dep in &prop.depends_on {
            if !self.properties.contains_key(dep) && !self.computed.contains_key(dep) {
                causes.push(format!(
                    "property \"{name}\" depends on unknown \"{dep}\""
                ));
            }
        }
    }

    /// Topological evaluation order over computed nodes.
    ///
    /// `Err` carries the names stuck in a dependency cycle.
    pub fn computed_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut remaining_deps: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, node) in &self.computed {
            let computed_deps = node
                .dependencies
                .iter()
                .filter(|d| self.computed.contains_key(*d))
                .count();
            remaining_deps.insert(name, computed_deps);
            for dep in &node.dependencies {
                if self.computed.contains_key(dep) {
                    dependents.entry(dep).or_default().push(name);
                }
            }
        }

        let mut ready: Vec<&str> = remaining_deps
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.computed.len());

        while let Some(name) = ready.pop() {
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                let n = remaining_deps.get_mut(dependent).unwrap();
                *n -= 1;
                if *n == 0 {
                    ready.push(dependent);
                }
            }
        }

        if order.len() == self.computed.len() {
            Ok(order)
        } else {
            let stuck: Vec<String> = remaining_deps
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            Err(stuck)
        }
    }

    /// Looks up a property's effective endianness.
    pub fn endianness_of(&self, prop: &Property) -> Endianness {
        prop.endian.unwrap_or(self.platform.endian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_mapping() -> Mapping {
        Mapping {
            name: "red-blue".into(),
            game: "Pokemon Red/Blue".into(),
            version: "1".into(),
            platform: Platform {
                name: "gb".into(),
                endian: Endianness::Little,
                regions: vec![Region {
                    name: "wram".into(),
                    start: 0xC000,
                    end: 0xDFFF,
                }],
            },
            constants: HashMap::new(),
            charmaps: HashMap::new(),
            properties: BTreeMap::new(),
            groups: BTreeMap::new(),
            computed: BTreeMap::new(),
            references: HashMap::new(),
            events: None,
            validation: GlobalValidationConfig::default(),
        }
    }

    fn u8_property(address: u32) -> Property {
        Property {
            kind: PropertyKind::U8,
            address,
            width: 1,
            endian: None,
            read_only: false,
            freezable: true,
            default_frozen: false,
            transforms: Vec::new(),
            validation: None,
            depends_on: Vec::new(),
            description: None,
            hints: None,
        }
    }

    #[test]
    fn valid_mapping_passes() {
        let mut mapping = base_mapping();
        mapping.properties.insert("lives".into(), u8_property(0xC030));
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn out_of_region_property_is_rejected() {
        let mut mapping = base_mapping();
        mapping.properties.insert("oob".into(), u8_property(0x8000));
        let err = mapping.validate().unwrap_err();
        let MappingError::Invalid { causes } = err else {
            panic!("expected Invalid");
        };
        assert_eq!(causes.len(), 1);
        assert!(causes[0].contains("outside every region"), "{causes:?}");
    }

    #[test]
    fn all_violations_are_collected() {
        let mut mapping = base_mapping();
        let mut bad = u8_property(0x8000);
        bad.read_only = true; // freezable + read-only
        mapping.properties.insert("bad".into(), bad);
        mapping.groups.insert(
            "hud".into(),
            Group {
                properties: vec!["missing".into()],
                display_name: None,
                display: None,
            },
        );
        let MappingError::Invalid { causes } = mapping.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(causes.len() >= 3, "expected all causes, got {causes:?}");
    }

    #[test]
    fn width_mismatch_with_intrinsic_type_width() {
        let mut mapping = base_mapping();
        let mut prop = u8_property(0xC000);
        prop.kind = PropertyKind::U16;
        mapping.properties.insert("score".into(), prop);
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn flag_bit_must_fit_declared_width() {
        let mut mapping = base_mapping();
        let mut prop = u8_property(0xC000);
        prop.kind = PropertyKind::Flags {
            defs: vec![FlagDef {
                name: "poisoned".into(),
                bit: 8,
                invert_logic: false,
                group: None,
                mutually_exclusive: Vec::new(),
            }],
        };
        mapping.properties.insert("status".into(), prop);
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn computed_cycle_is_rejected() {
        let mut mapping = base_mapping();
        mapping.computed.insert(
            "a".into(),
            ComputedNode {
                expression: "b + 1".into(),
                dependencies: vec!["b".into()],
                kind: None,
                cached: false,
            },
        );
        mapping.computed.insert(
            "b".into(),
            ComputedNode {
                expression: "a + 1".into(),
                dependencies: vec!["a".into()],
                kind: None,
                cached: false,
            },
        );
        let MappingError::Invalid { causes } = mapping.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(causes.iter().any(|c| c.contains("cycle")), "{causes:?}");
    }

    #[test]
    fn computed_order_is_topological() {
        let mut mapping = base_mapping();
        mapping.properties.insert("hp".into(), u8_property(0xC000));
        mapping.computed.insert(
            "hp_pct".into(),
            ComputedNode {
                expression: "hp_ratio * 100".into(),
                dependencies: vec!["hp_ratio".into()],
                kind: None,
                cached: false,
            },
        );
        mapping.computed.insert(
            "hp_ratio".into(),
            ComputedNode {
                expression: "hp / 255".into(),
                dependencies: vec!["hp".into()],
                kind: None,
                cached: true,
            },
        );
        let order = mapping.computed_order().unwrap();
        let ratio = order.iter().position(|n| n == "hp_ratio").unwrap();
        let pct = order.iter().position(|n| n == "hp_pct").unwrap();
        assert!(ratio < pct, "dependency must evaluate first: {order:?}");
    }

    #[test]
    fn charmap_decode_stops_at_terminator() {
        let charmap = CharMap {
            map: HashMap::from([
                (0x80, "A".to_string()),
                (0x84, "E".to_string()),
                (0x91, "R".to_string()),
            ]),
            terminators: vec![0x50, 0xFF],
        };
        assert_eq!(charmap.decode(&[0x80, 0x91, 0x84, 0x50, 0x80]), "ARE");
    }
}
