//! LLM normalize-and-group stage: grouping hints, prompt assembly, the
//! model call (with one retry on unparseable JSON), output sanitization
//! against candidates and the allowed-mods reference, and the rule-based
//! fallbacks used when the model is unavailable.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::contracts::{
    AuditEvent, CandidateItem, CandidatesByLine, GroupResult, GroupType, Mod, NormalizedItem,
    OrderRawParsed, RawLine, StructuredResult, as_metadata, contract_version,
};
use crate::llm_client::{LlmComplete, LlmError, is_timeout_message};
use crate::prompts::PromptEngine;

const GROUP_KEYWORDS: [&str; 10] = [
    "一起", "同一袋", "同袋", "同包", "合併", "合并", "裝一起", "装一起", "上面", "前面",
];
const ALL_KEYWORDS: [&str; 5] = ["一起", "同袋", "同包", "合併", "合并"];
const PAIR_KEYWORDS: [&str; 7] = ["一起", "同袋", "同包", "合併", "合并", "裝一起", "装一起"];

static REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(上面|前面|前)\s*([123一二兩两三])\s*項").unwrap());

fn ref_count(token: &str) -> Option<usize> {
    match token {
        "1" | "一" => Some(1),
        "2" | "二" | "兩" | "两" => Some(2),
        "3" | "三" => Some(3),
        _ => None,
    }
}

/// Audit event types that force an order into the review queue, mapped to
/// the review reason they contribute.
fn audit_reason(event_type: &str) -> Option<&'static str> {
    match event_type {
        "llm_client_missing" => Some("fallback_llm_client_missing"),
        "llm_timeout" => Some("fallback_llm_timeout"),
        "llm_api_error" => Some("fallback_llm_api_error"),
        "llm_json_parse_error" => Some("fallback_llm_json_parse_error"),
        "item_id_out_of_candidates" => Some("item_id_out_of_scope"),
        "missing_item_id" => Some("item_id_missing"),
        "mods_out_of_allowed" => Some("mods_out_of_scope"),
        "invalid_mods_payload" => Some("mods_payload_invalid"),
        "group_line_indices_out_of_scope" => Some("group_line_indices_out_of_scope"),
        "group_type_out_of_allowed" => Some("group_type_out_of_scope"),
        _ => None,
    }
}

/// A grouping hint mined from a line's note or raw text before the model
/// is consulted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupHint {
    pub trigger_line_index: usize,
    pub candidate_group_note: String,
    pub referenced_line_indices: Vec<usize>,
}

fn unique_tokens<I: IntoIterator<Item = String>>(values: I) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut tokens: Vec<String> = Vec::new();
    for value in values {
        let token = value.trim().to_string();
        if token.is_empty() || seen.contains(&token) {
            continue;
        }
        seen.insert(token.clone());
        tokens.push(token);
    }
    tokens
}

fn metadata_tokens(metadata: &Map<String, Value>, key: &str) -> Vec<String> {
    let Some(Value::Array(raw)) = metadata.get(key) else {
        return Vec::new();
    };
    unique_tokens(raw.iter().filter_map(Value::as_str).map(str::to_string))
}

fn audit(
    event_type: &str,
    message: &str,
    line_index: Option<usize>,
    metadata: Option<Value>,
    tags: &[&str],
) -> AuditEvent {
    let mut payload = metadata.map(as_metadata).unwrap_or_default();
    let mut merged: Vec<String> = vec![event_type.to_string()];
    if let Some(Value::Array(inherited)) = payload.get("tags") {
        merged.extend(inherited.iter().filter_map(Value::as_str).map(str::to_string));
    }
    merged.extend(tags.iter().map(|tag| tag.to_string()));
    payload.insert("tags".to_string(), json!(unique_tokens(merged)));
    AuditEvent {
        event_type: event_type.to_string(),
        message: message.to_string(),
        line_index,
        item_index: None,
        metadata: payload,
        version: contract_version(),
    }
}

fn safe_confidence(value: Option<&Value>, default: f64) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(parsed) => parsed.clamp(0.0, 1.0),
        None => default,
    }
}

fn safe_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => true,
            "false" | "0" | "no" | "n" => false,
            _ => default,
        },
        _ => default,
    }
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Exact-substring scan of the line text for allowed-mod tokens.
fn rule_mods_from_line(line_text: &str, allowed_mods: &[String]) -> Vec<String> {
    let mut mods: Vec<String> = Vec::new();
    for token in allowed_mods {
        if !token.is_empty() && !mods.contains(token) && line_text.contains(token.as_str()) {
            mods.push(token.clone());
        }
    }
    mods
}

fn extract_mod_tokens(raw_mods: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = raw_mods else {
        return Vec::new();
    };
    let mut tokens: Vec<String> = Vec::new();
    for item in items {
        let token = match item {
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
            }
            Value::Object(map) => ["mod", "mod_raw", "mod_name", "name"].iter().find_map(|key| {
                map.get(*key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            }),
            _ => None,
        };
        if let Some(token) = token {
            tokens.push(token);
        }
    }
    tokens
}

fn line_text(line: &RawLine) -> String {
    match &line.note_raw {
        Some(note) => format!("{} {}", line.raw_line, note),
        None => line.raw_line.clone(),
    }
}

fn resolve_reference_indices(
    line_positions: &[usize],
    current_pos: usize,
    text: &str,
) -> Vec<usize> {
    let previous = &line_positions[..current_pos];
    if let Some(matched) = REF_RE.captures(text) {
        if let Some(count) = ref_count(&matched[2]) {
            if !previous.is_empty() {
                let start = previous.len().saturating_sub(count);
                return previous[start..].to_vec();
            }
        }
    }
    if (text.contains("全部") || text.contains("都"))
        && ALL_KEYWORDS.iter().any(|keyword| text.contains(keyword))
    {
        return line_positions[..=current_pos].to_vec();
    }
    if PAIR_KEYWORDS.iter().any(|keyword| text.contains(keyword)) && !previous.is_empty() {
        return vec![*previous.last().unwrap(), line_positions[current_pos]];
    }
    Vec::new()
}

/// Scan notes and raw text for grouping language and resolve which lines
/// each mention refers to.
pub fn build_step1_group_hints(order_raw: &OrderRawParsed) -> Vec<GroupHint> {
    let line_positions: Vec<usize> = order_raw.lines.iter().map(|line| line.line_index).collect();
    let mut hints: Vec<GroupHint> = Vec::new();
    for (pos, line) in order_raw.lines.iter().enumerate() {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(note) = &line.note_raw {
            parts.push(note);
        }
        parts.push(&line.raw_line);
        let text = parts.join(" ").trim().to_string();
        if text.is_empty() || !GROUP_KEYWORDS.iter().any(|keyword| text.contains(keyword)) {
            continue;
        }
        let refs = resolve_reference_indices(&line_positions, pos, &text);
        hints.push(GroupHint {
            trigger_line_index: line.line_index,
            candidate_group_note: line.note_raw.clone().unwrap_or_else(|| line.raw_line.clone()),
            referenced_line_indices: refs,
        });
    }
    hints
}

/// Rule groups built from hints: the degraded path when the model returns
/// nothing usable, and the backstop appended next to model output.
fn build_rule_groups(hints: &[GroupHint], mark_review: bool, source: &str) -> Vec<GroupResult> {
    let mut groups: Vec<GroupResult> = Vec::new();
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    for hint in hints {
        let mut normalized: Vec<usize> = hint
            .referenced_line_indices
            .iter()
            .copied()
            .collect::<HashSet<usize>>()
            .into_iter()
            .collect();
        normalized.sort_unstable();
        if normalized.len() < 2 || seen.contains(&normalized) {
            continue;
        }
        seen.insert(normalized.clone());
        let mut metadata = as_metadata(json!({"source": source}));
        if mark_review {
            metadata.insert("review_reasons".to_string(), json!(["rule_group_backstop"]));
            metadata.insert("review_tags".to_string(), json!(["rule_group_backstop"]));
        }
        groups.push(GroupResult {
            group_id: format!("G{}", groups.len() + 1),
            group_type: GroupType::PackTogether,
            label: "rule_group_note".to_string(),
            line_indices: normalized,
            confidence_group: Some(0.35),
            needs_review: mark_review,
            metadata,
            version: contract_version(),
        });
    }
    groups
}

type ItemLookup = HashMap<usize, HashMap<String, CandidateItem>>;

/// Build the per-line prompt payload and the slot-id lookup used to map the
/// model's `item_id` back to a candidate. Slot ids are unique within a line
/// (`#n` suffix on collision).
fn build_candidate_context(
    order_raw: &OrderRawParsed,
    candidates: &CandidatesByLine,
    hints: &[GroupHint],
) -> (ItemLookup, Vec<Value>) {
    let hint_by_line: HashMap<usize, &str> = hints
        .iter()
        .map(|hint| (hint.trigger_line_index, hint.candidate_group_note.as_str()))
        .collect();

    let mut item_lookup: ItemLookup = HashMap::new();
    let mut payload: Vec<Value> = Vec::new();
    for line in &order_raw.lines {
        let empty: Vec<CandidateItem> = Vec::new();
        let line_candidates = candidates.get(&line.line_index).unwrap_or(&empty);
        let mut lookup_for_line: HashMap<String, CandidateItem> = HashMap::new();
        let mut candidate_payload: Vec<Value> = Vec::new();
        for (slot, candidate) in line_candidates.iter().enumerate() {
            let base = candidate
                .candidate_code
                .clone()
                .filter(|code| !code.is_empty())
                .unwrap_or_else(|| {
                    if candidate.candidate_name.is_empty() {
                        format!("candidate_{}", slot + 1)
                    } else {
                        candidate.candidate_name.clone()
                    }
                });
            let item_id = if lookup_for_line.contains_key(&base) {
                format!("{base}#{}", slot + 1)
            } else {
                base
            };
            lookup_for_line.insert(item_id.clone(), candidate.clone());
            candidate_payload.push(json!({
                "item_id": item_id,
                "candidate_name": candidate.candidate_name,
                "candidate_code": candidate.candidate_code,
            }));
        }
        item_lookup.insert(line.line_index, lookup_for_line);
        payload.push(json!({
            "line_index": line.line_index,
            "raw_line": line.raw_line,
            "name_raw": line.name_raw,
            "qty": line.qty,
            "note_raw": line.note_raw,
            "candidate_group_note": hint_by_line.get(&line.line_index),
            "candidates": candidate_payload,
        }));
    }
    (item_lookup, payload)
}

/// Parse the model output as a JSON object; on failure retry on the
/// substring between the first `{` and the last `}`.
fn extract_json_payload(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(_) => return Err("LLM output must be a JSON object".to_string()),
        Err(_) => {}
    }
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if end > start => {
            match serde_json::from_str::<Value>(&text[start..=end]) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err("LLM output must be a JSON object".to_string()),
                Err(e) => Err(format!("LLM output is not valid JSON: {e}")),
            }
        }
        _ => Err("LLM output is not valid JSON".to_string()),
    }
}

fn build_fallback_items(
    order_raw: &OrderRawParsed,
    candidates: &CandidatesByLine,
    allowed_mods: &[String],
    force_review: bool,
    fallback_reason: Option<&str>,
    audit_events: &mut Vec<AuditEvent>,
) -> Vec<NormalizedItem> {
    let mut items: Vec<NormalizedItem> = Vec::new();
    for line in &order_raw.lines {
        let selected = candidates.get(&line.line_index).and_then(|list| list.first());
        let mut review_reasons: Vec<String> = Vec::new();
        let mut review_tags: Vec<String> = Vec::new();
        if force_review {
            review_reasons.push("llm_fallback".to_string());
            review_tags.push("llm_fallback".to_string());
            if let Some(reason) = fallback_reason {
                review_reasons.push(format!("fallback:{reason}"));
                review_tags.push(reason.to_string());
            }
        }
        if selected.is_none() {
            audit_events.push(audit(
                "missing_candidates",
                "No candidates found; fallback to raw line",
                Some(line.line_index),
                None,
                &[],
            ));
            review_reasons.push("missing_candidates".to_string());
            review_tags.push("missing_candidates".to_string());
        }
        let mods: Vec<Mod> = rule_mods_from_line(&line_text(line), allowed_mods)
            .into_iter()
            .map(|token| {
                let mut m = Mod::named(&token, Some(0.35));
                m.needs_review = force_review;
                m
            })
            .collect();
        items.push(NormalizedItem {
            line_index: line.line_index,
            raw_line: line.raw_line.clone(),
            name_raw: line.name_raw.clone(),
            qty: line.qty,
            name_normalized: selected
                .map(|c| c.candidate_name.clone())
                .unwrap_or_else(|| line.name_raw.clone()),
            item_code: selected.and_then(|c| c.candidate_code.clone()),
            note_raw: line.note_raw.clone(),
            mods,
            group_id: None,
            confidence_item: Some(0.0),
            confidence_mods: Some(0.0),
            needs_review: if force_review { true } else { line.needs_review },
            metadata: as_metadata(json!({
                "selection_source": "fallback_first_candidate",
                "review_reasons": unique_tokens(review_reasons),
                "review_tags": unique_tokens(review_tags),
            })),
            version: contract_version(),
        });
    }
    items
}

fn sanitize_llm_items(
    order_raw: &OrderRawParsed,
    candidates: &CandidatesByLine,
    allowed_mods: &[String],
    item_lookup: &ItemLookup,
    llm_items: Option<&Value>,
    audit_events: &mut Vec<AuditEvent>,
) -> Vec<NormalizedItem> {
    let reference_set: HashSet<&str> = allowed_mods.iter().map(String::as_str).collect();
    let mut by_line: HashMap<usize, &Map<String, Value>> = HashMap::new();
    match llm_items {
        None | Some(Value::Null) | Some(Value::Array(_)) => {}
        Some(_) => {
            audit_events.push(audit(
                "invalid_items_payload",
                "LLM items payload is not a list",
                None,
                None,
                &["policy_violation", "review_queue"],
            ));
        }
    }
    if let Some(Value::Array(raw_items)) = llm_items {
        for raw in raw_items {
            let Some(map) = raw.as_object() else { continue };
            if let Some(line_index) =
                map.get("line_index").and_then(Value::as_i64).filter(|idx| *idx >= 0)
            {
                by_line.insert(line_index as usize, map);
            }
        }
    }

    let empty_map = Map::new();
    let empty_candidates: Vec<CandidateItem> = Vec::new();
    let empty_lookup: HashMap<String, CandidateItem> = HashMap::new();
    let mut items: Vec<NormalizedItem> = Vec::new();
    for line in &order_raw.lines {
        let line_output = by_line.get(&line.line_index).copied().unwrap_or(&empty_map);
        let mut reasons: Vec<String> = Vec::new();
        let mut tags: Vec<String> = Vec::new();
        let missing_line_output = !by_line.contains_key(&line.line_index);
        if missing_line_output {
            audit_events.push(audit(
                "missing_line_item_decision",
                "LLM did not provide item decision for this line",
                Some(line.line_index),
                None,
                &["review_queue"],
            ));
            reasons.push("missing_line_item_decision".to_string());
            tags.push("missing_line_item_decision".to_string());
        }

        let line_candidates = candidates.get(&line.line_index).unwrap_or(&empty_candidates);
        let first_candidate = line_candidates.first();
        let line_lookup = item_lookup.get(&line.line_index).unwrap_or(&empty_lookup);

        let mut selected_id = line_output
            .get("item_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let missing_item_id = selected_id.is_none();
        if missing_item_id {
            audit_events.push(audit(
                "missing_item_id",
                "LLM response missing item_id; fallback to first candidate",
                Some(line.line_index),
                None,
                &["review_queue"],
            ));
            reasons.push("item_id_missing".to_string());
            tags.push("item_id_missing".to_string());
            selected_id = None;
        }

        let mut selected_candidate =
            selected_id.as_deref().and_then(|id| line_lookup.get(id));
        let mut invalid_item_id = false;
        if selected_candidate.is_none() {
            selected_candidate = first_candidate;
            if let Some(id) = &selected_id {
                invalid_item_id = true;
                audit_events.push(audit(
                    "item_id_out_of_candidates",
                    "LLM selected item_id not in candidates for this line",
                    Some(line.line_index),
                    Some(json!({"item_id": id})),
                    &["policy_violation", "review_queue"],
                ));
                reasons.push("item_id_out_of_scope".to_string());
                tags.push("item_id_out_of_scope".to_string());
            }
        }
        if selected_candidate.is_none() {
            reasons.push("missing_candidates".to_string());
            tags.push("missing_candidates".to_string());
        }

        let raw_mods = line_output.get("mods");
        let invalid_mods_payload =
            matches!(raw_mods, Some(value) if !value.is_null() && !value.is_array());
        if invalid_mods_payload {
            audit_events.push(audit(
                "invalid_mods_payload",
                "LLM mods payload is not a list; fallback to rule mods",
                Some(line.line_index),
                None,
                &["policy_violation", "review_queue"],
            ));
            reasons.push("mods_payload_invalid".to_string());
            tags.push("mods_payload_invalid".to_string());
        }
        let mut requested_mods = extract_mod_tokens(raw_mods);
        if requested_mods.is_empty() {
            requested_mods = rule_mods_from_line(&line_text(line), allowed_mods);
        }
        let filtered = unique_tokens(requested_mods);
        let beyond_reference: Vec<&String> =
            filtered.iter().filter(|token| !reference_set.contains(token.as_str())).collect();
        if !beyond_reference.is_empty() {
            audit_events.push(audit(
                "mods_beyond_reference",
                "LLM returned mods beyond reference list (accepted)",
                Some(line.line_index),
                Some(json!({"beyond_reference_mods": beyond_reference})),
                &[],
            ));
        }
        let confidence_mods = safe_confidence(line_output.get("confidence_mods"), 0.65);
        let mods: Vec<Mod> =
            filtered.iter().map(|token| Mod::named(token, Some(confidence_mods))).collect();

        let llm_flagged = safe_bool(line_output.get("needs_review"), false);
        let needs_review = line.needs_review
            || invalid_item_id
            || llm_flagged
            || selected_candidate.is_none()
            || missing_line_output
            || missing_item_id
            || invalid_mods_payload;
        if line.needs_review {
            reasons.push("raw_line_needs_review".to_string());
            tags.push("raw_line_needs_review".to_string());
        }
        if llm_flagged {
            reasons.push("llm_flagged_review".to_string());
            tags.push("llm_flagged_review".to_string());
        }

        items.push(NormalizedItem {
            line_index: line.line_index,
            raw_line: line.raw_line.clone(),
            name_raw: line.name_raw.clone(),
            qty: line.qty,
            name_normalized: selected_candidate
                .map(|c| c.candidate_name.clone())
                .unwrap_or_else(|| line.name_raw.clone()),
            item_code: selected_candidate.and_then(|c| c.candidate_code.clone()),
            note_raw: line.note_raw.clone(),
            mods,
            group_id: None,
            confidence_item: Some(safe_confidence(line_output.get("confidence_item"), 0.65)),
            confidence_mods: Some(confidence_mods),
            needs_review,
            metadata: as_metadata(json!({
                "selected_item_id": selected_id,
                "selection_source": "llm",
                "invalid_item_id": invalid_item_id,
                "review_reasons": unique_tokens(reasons),
                "review_tags": unique_tokens(tags),
            })),
            version: contract_version(),
        });
    }
    items
}

fn sanitize_llm_groups(
    raw_groups: Option<&Value>,
    valid_line_indices: &HashSet<usize>,
    audit_events: &mut Vec<AuditEvent>,
) -> Vec<GroupResult> {
    let raw_groups = match raw_groups {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            audit_events.push(audit(
                "invalid_groups_payload",
                "LLM groups payload is not a list",
                None,
                None,
                &["policy_violation", "review_queue"],
            ));
            return Vec::new();
        }
    };

    let mut groups: Vec<GroupResult> = Vec::new();
    let mut seen: HashSet<(GroupType, Vec<usize>)> = HashSet::new();
    for raw in raw_groups {
        let Some(map) = raw.as_object() else {
            audit_events.push(audit(
                "invalid_group_entry",
                "LLM group entry is not an object",
                None,
                None,
                &["policy_violation", "review_queue"],
            ));
            continue;
        };
        let Some(Value::Array(raw_indices)) = map.get("line_indices") else {
            audit_events.push(audit(
                "invalid_group_line_indices_payload",
                "LLM group line_indices must be a list",
                None,
                None,
                &["policy_violation", "review_queue"],
            ));
            continue;
        };

        let invalid_indices: Vec<&Value> = raw_indices
            .iter()
            .filter(|value| {
                !value
                    .as_i64()
                    .map(|idx| idx >= 0 && valid_line_indices.contains(&(idx as usize)))
                    .unwrap_or(false)
            })
            .collect();
        if !invalid_indices.is_empty() {
            audit_events.push(audit(
                "group_line_indices_out_of_scope",
                "LLM group contains out-of-scope line indices",
                None,
                Some(json!({"invalid_line_indices": invalid_indices})),
                &["policy_violation", "review_queue"],
            ));
        }
        let mut indices: Vec<usize> = raw_indices
            .iter()
            .filter_map(Value::as_i64)
            .filter(|idx| *idx >= 0)
            .map(|idx| idx as usize)
            .filter(|idx| valid_line_indices.contains(idx))
            .collect::<HashSet<usize>>()
            .into_iter()
            .collect();
        indices.sort_unstable();
        if indices.len() < 2 {
            audit_events.push(audit(
                "group_line_indices_insufficient",
                "LLM group must reference at least two valid line indices",
                None,
                Some(json!({"line_indices": indices})),
                &["policy_violation", "review_queue"],
            ));
            continue;
        }

        let mut needs_review = safe_bool(map.get("needs_review"), false);
        let mut reasons: Vec<String> = Vec::new();
        let mut tags: Vec<String> = Vec::new();
        if !invalid_indices.is_empty() {
            needs_review = true;
            reasons.push("group_line_indices_out_of_scope".to_string());
            tags.push("group_line_indices_out_of_scope".to_string());
        }

        let raw_type = map.get("type");
        let group_type = raw_type.and_then(Value::as_str).and_then(GroupType::parse);
        let group_type = match group_type {
            Some(group_type) => group_type,
            None => {
                audit_events.push(audit(
                    "group_type_out_of_allowed",
                    "LLM group type is outside allowed set",
                    None,
                    Some(json!({"group_type": raw_type})),
                    &["policy_violation", "review_queue"],
                ));
                needs_review = true;
                reasons.push("group_type_out_of_scope".to_string());
                tags.push("group_type_out_of_scope".to_string());
                GroupType::Other
            }
        };
        if safe_bool(map.get("needs_review"), false) {
            reasons.push("llm_flagged_review".to_string());
            tags.push("llm_flagged_review".to_string());
        }

        let key = (group_type, indices.clone());
        if seen.contains(&key) {
            audit_events.push(audit(
                "duplicate_group",
                "Duplicate group by type and line indices was dropped",
                None,
                Some(json!({"group_type": group_type.as_str(), "line_indices": indices})),
                &["review_queue"],
            ));
            continue;
        }
        seen.insert(key);

        groups.push(GroupResult {
            group_id: scalar_string(map.get("group_id"))
                .unwrap_or_else(|| format!("G{}", groups.len() + 1)),
            group_type,
            label: scalar_string(map.get("label")).unwrap_or_else(|| "llm_group".to_string()),
            line_indices: indices,
            confidence_group: Some(safe_confidence(map.get("confidence_group"), 0.7)),
            needs_review,
            metadata: as_metadata(json!({
                "source": "llm",
                "review_reasons": unique_tokens(reasons),
                "review_tags": unique_tokens(tags),
            })),
            version: contract_version(),
        });
    }
    if !raw_groups.is_empty() && groups.is_empty() {
        audit_events.push(audit(
            "invalid_groups",
            "LLM returned groups but none were valid",
            None,
            None,
            &["review_queue"],
        ));
    }
    groups
}

/// Aggregate review-queue metadata from items, groups, and audit events.
fn collect_review_queue_metadata(
    items: &[NormalizedItem],
    groups: &[GroupResult],
    audit_events: &[AuditEvent],
    fallback_reason: Option<&str>,
) -> Value {
    let mut needs_review = fallback_reason.is_some()
        || items.iter().any(|item| item.needs_review)
        || groups.iter().any(|group| group.needs_review);
    let mut reasons: Vec<String> = Vec::new();
    if let Some(reason) = fallback_reason {
        reasons.push(format!("fallback:{reason}"));
    }
    let mut tags: Vec<String> = Vec::new();

    for item in items {
        if item.needs_review {
            reasons.extend(metadata_tokens(&item.metadata, "review_reasons"));
            tags.extend(metadata_tokens(&item.metadata, "review_tags"));
        }
    }
    for group in groups {
        if group.needs_review {
            reasons.extend(metadata_tokens(&group.metadata, "review_reasons"));
            tags.extend(metadata_tokens(&group.metadata, "review_tags"));
        }
    }
    for event in audit_events {
        tags.push(event.event_type.clone());
        let event_tags = metadata_tokens(&event.metadata, "tags");
        tags.extend(event_tags.clone());
        if let Some(mapped) = audit_reason(&event.event_type) {
            reasons.push(mapped.to_string());
            needs_review = true;
        }
        if event_tags.iter().any(|tag| tag == "policy_violation" || tag == "review_queue") {
            needs_review = true;
        }
    }

    let mut reasons = unique_tokens(reasons);
    reasons.sort();
    let mut tags = unique_tokens(tags);
    tags.sort();
    json!({
        "needs_review": needs_review,
        "reasons": reasons,
        "audit_tags": tags,
    })
}

fn classify_llm_error(error: &LlmError) -> (&'static str, &'static str) {
    match error {
        LlmError::Timeout(_) => ("llm_timeout", "Timeout"),
        LlmError::Http { message, .. } if is_timeout_message(message) => ("llm_timeout", "Http"),
        LlmError::Http { .. } => ("llm_api_error", "Http"),
        LlmError::Api(message) if is_timeout_message(message) => ("llm_timeout", "Api"),
        LlmError::Api(_) => ("llm_api_error", "Api"),
    }
}

/// Run the normalize-and-group stage. Never fails: the model being absent,
/// slow, broken, or incoherent all degrade to rule-based output with review
/// flags and audit events.
pub fn llm_normalize_and_group(
    order_raw: &OrderRawParsed,
    candidates: &CandidatesByLine,
    allowed_mods: &[String],
    llm_client: Option<&dyn LlmComplete>,
    timeout: Duration,
    prompt_engine: &PromptEngine,
) -> StructuredResult {
    let normalized_allowed_mods: Vec<String> = allowed_mods
        .iter()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect();
    let step1_hints = build_step1_group_hints(order_raw);
    let (item_lookup, line_payload) = build_candidate_context(order_raw, candidates, &step1_hints);
    let mut audit_events: Vec<AuditEvent> = Vec::new();

    let mut parsed_response: Option<Map<String, Value>> = None;
    let mut fallback_reason: Option<&'static str> = None;
    let mut llm_attempts = 0u32;

    match llm_client {
        None => {
            fallback_reason = Some("llm_client_missing");
            audit_events.push(audit(
                "llm_client_missing",
                "No LLM client provided; fallback applied",
                None,
                None,
                &["review_queue"],
            ));
        }
        Some(client) => {
            let prompt = prompt_engine.render(
                &serde_json::to_string_pretty(&normalized_allowed_mods).unwrap_or_default(),
                &serde_json::to_string_pretty(&line_payload).unwrap_or_default(),
                &serde_json::to_string_pretty(&step1_hints).unwrap_or_default(),
            );
            match prompt {
                Err(e) => {
                    fallback_reason = Some("prompt_load_error");
                    audit_events.push(audit(
                        "prompt_load_error",
                        "Prompt template could not be loaded",
                        None,
                        Some(json!({"error": e.to_string()})),
                        &[],
                    ));
                }
                Ok(prompt) => {
                    for attempt in 0..2 {
                        llm_attempts = attempt + 1;
                        let raw = match client.complete(&prompt, timeout) {
                            Ok(raw) => raw,
                            Err(error) => {
                                let (reason, error_type) = classify_llm_error(&error);
                                warn!(reason, error = %error, "llm call failed");
                                fallback_reason = Some(reason);
                                let message = if reason == "llm_timeout" {
                                    "LLM request timed out"
                                } else {
                                    "LLM call failed"
                                };
                                audit_events.push(audit(
                                    reason,
                                    message,
                                    None,
                                    Some(json!({
                                        "error": error.to_string(),
                                        "error_type": error_type,
                                    })),
                                    &[],
                                ));
                                break;
                            }
                        };
                        match extract_json_payload(&raw) {
                            Ok(parsed) => {
                                parsed_response = Some(parsed);
                                break;
                            }
                            Err(e) if attempt == 0 => {
                                debug!(error = %e, "first llm json parse failed, retrying");
                                audit_events.push(audit(
                                    "llm_json_parse_retry",
                                    "First LLM JSON parse failed; retry once",
                                    None,
                                    Some(json!({"error": e})),
                                    &[],
                                ));
                            }
                            Err(e) => {
                                fallback_reason = Some("llm_json_parse_error");
                                audit_events.push(audit(
                                    "llm_json_parse_error",
                                    "Failed to parse LLM JSON after one retry",
                                    None,
                                    Some(json!({"error": e})),
                                    &[],
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    let (items, groups) = match &parsed_response {
        None => {
            let items = build_fallback_items(
                order_raw,
                candidates,
                &normalized_allowed_mods,
                true,
                fallback_reason,
                &mut audit_events,
            );
            let groups = build_rule_groups(&step1_hints, true, "fallback_rule");
            (items, groups)
        }
        Some(parsed) => {
            let items = sanitize_llm_items(
                order_raw,
                candidates,
                &normalized_allowed_mods,
                &item_lookup,
                parsed.get("items"),
                &mut audit_events,
            );
            let valid_line_indices: HashSet<usize> =
                order_raw.lines.iter().map(|line| line.line_index).collect();
            let mut groups =
                sanitize_llm_groups(parsed.get("groups"), &valid_line_indices, &mut audit_events);
            if !step1_hints.is_empty() {
                let mut known: HashSet<(GroupType, Vec<usize>)> = groups
                    .iter()
                    .map(|group| (group.group_type, group.line_indices.clone()))
                    .collect();
                for group in build_rule_groups(&step1_hints, true, "rule_backstop") {
                    let key = (group.group_type, group.line_indices.clone());
                    if !known.contains(&key) {
                        known.insert(key);
                        groups.push(group);
                    }
                }
            }
            (items, groups)
        }
    };

    let metadata = as_metadata(json!({
        "llm_attempts": llm_attempts,
        "fallback_reason": fallback_reason,
        "step1_hint_count": step1_hints.len(),
        "review_queue": collect_review_queue_metadata(
            &items,
            &groups,
            &audit_events,
            fallback_reason,
        ),
    }));

    StructuredResult { items, groups, audit_events, metadata, version: contract_version() }
}
