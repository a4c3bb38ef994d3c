//! Request/response types for the engine's external API surface.
use crate::value::Value;

/// One operation inside a batch request.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum BatchOperation {
    SetValue { property: String, value: Value },
    SetBytes { property: String, bytes: Vec<u8> },
    Freeze { property: String },
    Unfreeze { property: String },
}

impl BatchOperation {
    pub fn property(&self) -> &str {
        match self {
            BatchOperation::SetValue { property, .. }
            | BatchOperation::SetBytes { property, .. }
            | BatchOperation::Freeze { property }
            | BatchOperation::Unfreeze { property } => property,
        }
    }

    /// Verb used in batch results and logs.
    pub fn verb(&self) -> &'static str {
        match self {
            BatchOperation::SetValue { .. } => "set-value",
            BatchOperation::SetBytes { .. } => "set-bytes",
            BatchOperation::Freeze { .. } => "freeze",
            BatchOperation::Unfreeze { .. } => "unfreeze",
        }
    }
}

/// Per-operation outcome of a batch.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BatchOpResult {
    pub property: String,
    pub operation: String,
    pub success: bool,
    /// Error message when `success` is false.
    pub error: Option<String>,
    /// False when an atomic batch stopped before reaching the operation.
    pub applied: bool,
}

/// Whole-batch outcome returned to the caller.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BatchOutcome {
    pub results: Vec<BatchOpResult>,
    pub success_count: usize,
    pub total: usize,
}

/// Summary of the currently loaded mapping.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MappingSummary {
    pub name: String,
    pub game: String,
    pub version: String,
    pub platform: String,
    pub property_count: usize,
    pub group_count: usize,
    pub computed_count: usize,
    pub region_count: usize,
}

/// Per-property entry of the mapping glossary.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GlossaryProperty {
    pub name: String,
    pub kind: String,
    pub address: u32,
    pub width: u32,
    pub read_only: bool,
    pub freezable: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GlossaryGroup {
    pub name: String,
    pub properties: Vec<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GlossaryComputed {
    pub name: String,
    pub expression: String,
    pub dependencies: Vec<String>,
}

/// Full per-property metadata view of the loaded mapping.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Glossary {
    pub properties: Vec<GlossaryProperty>,
    pub groups: Vec<GlossaryGroup>,
    pub computed: Vec<GlossaryComputed>,
}

/// Snapshot of one point in a property's bounded history ring.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct HistoryPoint {
    pub value: Value,
    pub timestamp_ms: u64,
}

/// Welford running statistics over a numeric property's observed values.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RunningStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
    pub samples: u64,
}

/// Externally visible per-property state.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PropertyStateView {
    pub name: String,
    pub value: Value,
    pub bytes: Vec<u8>,
    pub frozen: bool,
    pub last_changed_ms: Option<u64>,
    pub last_read_ms: Option<u64>,
    pub read_count: u64,
    pub write_count: u64,
    pub history: Vec<HistoryPoint>,
    pub stats: Option<RunningStats>,
}
