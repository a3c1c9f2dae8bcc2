//! Data contracts shared across the ingest pipeline.
//!
//! Every entity carries a `version` string so downstream consumers can
//! detect contract drift; unknown fields arriving over the wire are kept in
//! `metadata` wherever the producers put them there.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CONTRACT_VERSION: &str = "1.0.0";

/// Free-form JSON metadata attached to most entities.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub fn contract_version() -> String {
    CONTRACT_VERSION.to_string()
}

/// How a group of receipt lines should be handled at fulfillment time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    PackTogether,
    Separate,
    Other,
}

impl GroupType {
    /// Parse the wire spelling; anything unknown is `None` (callers coerce
    /// to `Other` and flag review).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pack_together" => Some(GroupType::PackTogether),
            "separate" => Some(GroupType::Separate),
            "other" => Some(GroupType::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::PackTogether => "pack_together",
            GroupType::Separate => "separate",
            GroupType::Other => "other",
        }
    }
}

/// One item-bearing row extracted from the receipt text. Created only by
/// the parser; later stages copy it rather than mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLine {
    pub line_index: usize,
    pub raw_line: String,
    pub name_raw: String,
    pub qty: u32,
    #[serde(default)]
    pub note_raw: Option<String>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

impl RawLine {
    pub fn new(line_index: usize, raw_line: &str, name_raw: &str, qty: u32) -> Self {
        RawLine {
            line_index,
            raw_line: raw_line.to_string(),
            name_raw: name_raw.to_string(),
            qty,
            note_raw: None,
            needs_review: false,
            metadata: Metadata::new(),
            version: contract_version(),
        }
    }
}

/// A scored pairing of a raw line to one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub line_index: usize,
    pub raw_line: String,
    pub name_raw: String,
    pub qty: u32,
    pub candidate_name: String,
    #[serde(default)]
    pub candidate_code: Option<String>,
    #[serde(default)]
    pub note_raw: Option<String>,
    /// 0–100 at this stage; rescaled to [0, 1] by the merge stage.
    #[serde(default)]
    pub confidence_item: Option<f64>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// A modifier attached to an item (e.g. `加辣`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mod {
    pub mod_raw: String,
    #[serde(default)]
    pub mod_name: Option<String>,
    #[serde(default)]
    pub mod_value: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

impl Mod {
    pub fn named(token: &str, confidence: Option<f64>) -> Self {
        Mod {
            mod_raw: token.to_string(),
            mod_name: Some(token.to_string()),
            mod_value: None,
            confidence,
            needs_review: false,
            metadata: Metadata::new(),
            version: contract_version(),
        }
    }
}

/// Fully merged item: parser truth plus the normalized selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub line_index: usize,
    pub raw_line: String,
    pub name_raw: String,
    pub qty: u32,
    pub name_normalized: String,
    #[serde(default)]
    pub item_code: Option<String>,
    #[serde(default)]
    pub note_raw: Option<String>,
    #[serde(default)]
    pub mods: Vec<Mod>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub confidence_item: Option<f64>,
    #[serde(default)]
    pub confidence_mods: Option<f64>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// A grouping decision over two or more lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_id: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub label: String,
    pub line_indices: Vec<usize>,
    #[serde(default)]
    pub confidence_group: Option<f64>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// In-pipeline audit event (distinct from the persisted JSONL records in
/// the `audit` module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub line_index: Option<usize>,
    #[serde(default)]
    pub item_index: Option<usize>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// Parser output envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRawParsed {
    pub source_text: String,
    pub lines: Vec<RawLine>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub parse_warnings: Vec<String>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// Output of the LLM normalize-and-group stage (sanitized or fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub items: Vec<NormalizedItem>,
    pub groups: Vec<GroupResult>,
    pub audit_events: Vec<AuditEvent>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// Final merged-and-validated order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderNormalized {
    pub source_text: String,
    pub items: Vec<NormalizedItem>,
    pub groups: Vec<GroupResult>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub lines: Vec<RawLine>,
    #[serde(default)]
    pub audit_events: Vec<AuditEvent>,
    #[serde(default)]
    pub overall_needs_review: bool,
    #[serde(default)]
    pub order_confidence: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "contract_version")]
    pub version: String,
}

/// Candidates keyed by parser `line_index`. A `BTreeMap` keeps JSON output
/// in a stable order.
pub type CandidatesByLine = BTreeMap<usize, Vec<CandidateItem>>;

/// One catalog entry after boundary normalization. The raw catalog payload
/// is polymorphic (map, list, scalar values); everything reduces to this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub item_id: String,
    pub canonical_name: String,
    pub aliases: Vec<String>,
}

/// Convert `metadata`-shaped JSON into a `Metadata` map; anything that is
/// not an object becomes empty.
pub fn as_metadata(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}
