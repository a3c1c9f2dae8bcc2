//! Merge & validate: reconcile the structured stage's output with the
//! parser's ground truth, enforce catalog and grouping invariants, and
//! emit the routing decision.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use tracing::debug;

use crate::contracts::{
    AuditEvent, CandidateItem, CandidatesByLine, GroupResult, Metadata, Mod, NormalizedItem,
    OrderNormalized, OrderRawParsed, RawLine, StructuredResult, as_metadata, contract_version,
};

pub const DEFAULT_THRESHOLD: f64 = 0.85;

const ROUTE_AUTO_DISPATCH: &str = "auto-dispatch";
const ROUTE_REVIEW_QUEUE: &str = "review-queue";
const GROUP_MEMBERSHIP_RULE: &str = "single_group_per_line_first_wins";

/// Review thresholds for item, mods, and group confidences. Values are
/// clamped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub item: f64,
    pub mods: f64,
    pub group: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds { item: DEFAULT_THRESHOLD, mods: DEFAULT_THRESHOLD, group: DEFAULT_THRESHOLD }
    }
}

impl Thresholds {
    fn normalized(self) -> Self {
        Thresholds {
            item: normalize_threshold(self.item),
            mods: normalize_threshold(self.mods),
            group: normalize_threshold(self.group),
        }
    }
}

fn normalize_threshold(value: f64) -> f64 {
    if value.is_nan() { DEFAULT_THRESHOLD } else { value.clamp(0.0, 1.0) }
}

/// Normalize a confidence to [0, 1]: values in (1, 100] are treated as
/// percentages, anything else out of range is discarded.
fn normalize_confidence(value: Option<f64>) -> Option<f64> {
    let value = value?;
    if value.is_nan() || value < 0.0 {
        return None;
    }
    if value <= 1.0 {
        Some(value)
    } else if value <= 100.0 {
        Some(value / 100.0)
    } else {
        None
    }
}

fn audit(
    event_type: &str,
    message: &str,
    line_index: Option<usize>,
    metadata: Option<Value>,
) -> AuditEvent {
    AuditEvent {
        event_type: event_type.to_string(),
        message: message.to_string(),
        line_index,
        item_index: None,
        metadata: metadata.map(as_metadata).unwrap_or_default(),
        version: contract_version(),
    }
}

/// Valid item codes: mapping keys first, then list entries, then the codes
/// the candidate generator produced.
fn catalog_ids(menu_catalog: Option<&Value>, candidates: &CandidatesByLine) -> HashSet<String> {
    match menu_catalog {
        Some(Value::Object(map)) => {
            return map
                .keys()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect();
        }
        Some(Value::Array(entries)) => {
            let ids: HashSet<String> = entries
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|entry| entry.get("item_id").or_else(|| entry.get("item_code")))
                .filter_map(|raw| match raw {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|id| !id.is_empty())
                .collect();
            if !ids.is_empty() {
                return ids;
            }
        }
        _ => {}
    }

    candidates
        .values()
        .flatten()
        .filter_map(|candidate| candidate.candidate_code.clone())
        .filter(|code| !code.is_empty())
        .collect()
}

fn find_candidate_by_code<'a>(
    line_candidates: &'a [CandidateItem],
    item_code: &str,
) -> Option<&'a CandidateItem> {
    line_candidates.iter().find(|candidate| candidate.candidate_code.as_deref() == Some(item_code))
}

/// Index structured items by line, dropping unknown lines and duplicates
/// (first wins).
fn collect_llm_items<'a>(
    items: &'a [NormalizedItem],
    valid_line_indices: &HashSet<usize>,
    audit_events: &mut Vec<AuditEvent>,
) -> HashMap<usize, &'a NormalizedItem> {
    let mut by_line: HashMap<usize, &NormalizedItem> = HashMap::new();
    for item in items {
        if !valid_line_indices.contains(&item.line_index) {
            audit_events.push(audit(
                "item_invalid_line_index",
                "LLM item line_index not found in parser lines",
                Some(item.line_index),
                None,
            ));
            continue;
        }
        if by_line.contains_key(&item.line_index) {
            audit_events.push(audit(
                "item_duplicate_line_index",
                "Duplicate LLM item for the same line_index; first one is kept",
                Some(item.line_index),
                None,
            ));
            continue;
        }
        by_line.insert(item.line_index, item);
    }
    by_line
}

/// Pull a usable mod token out of a structured mod; blank mods drop.
fn normalize_mod(raw_mod: &Mod, default_confidence: Option<f64>) -> Option<Mod> {
    let token = [&raw_mod.mod_raw]
        .into_iter()
        .map(String::as_str)
        .chain(raw_mod.mod_name.as_deref())
        .chain(raw_mod.mod_value.as_deref())
        .map(str::trim)
        .find(|token| !token.is_empty())?
        .to_string();

    let confidence = normalize_confidence(raw_mod.confidence).or(default_confidence);
    Some(Mod {
        mod_raw: token,
        mod_name: raw_mod.mod_name.clone(),
        mod_value: raw_mod.mod_value.clone(),
        confidence,
        needs_review: raw_mod.needs_review,
        metadata: raw_mod.metadata.clone(),
        version: raw_mod.version.clone(),
    })
}

#[allow(clippy::too_many_arguments)]
fn merge_one_item(
    line: &RawLine,
    llm_item: Option<&NormalizedItem>,
    line_candidates: &[CandidateItem],
    valid_catalog_ids: &HashSet<String>,
    item_threshold: f64,
    mods_threshold: f64,
    audit_events: &mut Vec<AuditEvent>,
) -> NormalizedItem {
    let mut needs_review = line.needs_review;
    let source_metadata = llm_item.map(|item| item.metadata.clone()).unwrap_or_default();
    let primary_candidate = line_candidates.first();

    let mut qty = line.qty;
    if let Some(item) = llm_item {
        if item.qty > 0 {
            qty = item.qty;
        } else {
            needs_review = true;
            audit_events.push(audit(
                "qty_invalid",
                "LLM qty must be positive integer; raw qty is kept",
                Some(line.line_index),
                Some(json!({"qty": item.qty})),
            ));
        }
    }
    if qty == 0 {
        needs_review = true;
        audit_events.push(audit(
            "qty_invalid",
            "Final qty must be positive integer",
            Some(line.line_index),
            Some(json!({"qty": qty})),
        ));
    }

    let confidence_item = llm_item.and_then(|item| normalize_confidence(item.confidence_item));
    let confidence_mods = llm_item.and_then(|item| normalize_confidence(item.confidence_mods));
    if confidence_item.is_none_or(|value| value < item_threshold) {
        needs_review = true;
    }
    if confidence_mods.is_none_or(|value| value < mods_threshold) {
        needs_review = true;
    }

    let mut item_code = llm_item
        .and_then(|item| item.item_code.as_deref())
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string);
    if let Some(code) = &item_code {
        if !valid_catalog_ids.contains(code) {
            needs_review = true;
            audit_events.push(audit(
                "item_code_not_in_catalog",
                "LLM item_code not found in menu_catalog; fallback is applied",
                Some(line.line_index),
                Some(json!({"item_code": code})),
            ));
            item_code = None;
        }
    }

    let mut fallback_reason: Option<&'static str> = None;
    let mut selected_candidate =
        item_code.as_deref().and_then(|code| find_candidate_by_code(line_candidates, code));
    if item_code.is_some() && selected_candidate.is_none() {
        needs_review = true;
        fallback_reason = Some("item_code_not_in_line_candidates");
        audit_events.push(audit(
            "item_code_not_in_line_candidates",
            "LLM item_code is not in this line's candidates; fallback is applied when possible",
            Some(line.line_index),
            Some(json!({"item_code": item_code})),
        ));
        item_code = None;
    }
    if item_code.is_none() {
        if let Some(primary) = primary_candidate {
            if let Some(code) = primary.candidate_code.as_deref() {
                if !code.is_empty() && valid_catalog_ids.contains(code) {
                    item_code = Some(code.to_string());
                    selected_candidate = Some(primary);
                    needs_review = true;
                    fallback_reason = fallback_reason.or(Some("candidate_fallback"));
                    audit_events.push(audit(
                        "item_fallback_to_candidate",
                        "LLM item_code missing/invalid; using top candidate",
                        Some(line.line_index),
                        Some(json!({"item_code": code})),
                    ));
                }
            }
        }
    }

    let llm_name = llm_item
        .map(|item| item.name_normalized.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let name_normalized = match llm_name {
        Some(name) => name,
        None => match selected_candidate {
            Some(candidate) => {
                if llm_item.is_some() {
                    needs_review = true;
                    fallback_reason = fallback_reason.or(Some("name_from_candidate"));
                }
                candidate.candidate_name.clone()
            }
            None => {
                needs_review = true;
                fallback_reason = fallback_reason.or(Some("name_from_raw"));
                line.name_raw.clone()
            }
        },
    };

    let mut mods: Vec<Mod> = Vec::new();
    if let Some(item) = llm_item {
        for raw_mod in &item.mods {
            let Some(normalized) = normalize_mod(raw_mod, confidence_mods) else {
                needs_review = true;
                continue;
            };
            let low = normalized.confidence.is_none_or(|value| value < mods_threshold);
            mods.push(Mod { needs_review: normalized.needs_review || low, ..normalized });
        }
    }

    if llm_item.is_none() {
        needs_review = true;
        fallback_reason = fallback_reason.or(Some("llm_item_missing"));
        audit_events.push(audit(
            "llm_item_missing",
            "No LLM item for parser line; using fallback fields",
            Some(line.line_index),
            None,
        ));
    }
    if llm_item.map(|item| item.needs_review).unwrap_or(true) {
        needs_review = true;
    }

    let mut metadata: Metadata = source_metadata;
    metadata.insert(
        "merge_source".to_string(),
        json!(if llm_item.is_some() { "llm" } else { "fallback" }),
    );
    metadata.insert("fallback_reason".to_string(), json!(fallback_reason));
    metadata.insert(
        "catalog_valid".to_string(),
        json!(item_code.as_deref().map(|code| valid_catalog_ids.contains(code)).unwrap_or(false)),
    );

    NormalizedItem {
        line_index: line.line_index,
        raw_line: line.raw_line.clone(),
        name_raw: line.name_raw.clone(),
        qty,
        name_normalized,
        item_code,
        note_raw: line.note_raw.clone(),
        mods,
        group_id: llm_item.and_then(|item| item.group_id.clone()),
        confidence_item,
        confidence_mods,
        needs_review,
        metadata,
        version: llm_item.map(|item| item.version.clone()).unwrap_or_else(contract_version),
    }
}

fn merge_groups(
    raw_groups: &[GroupResult],
    valid_line_indices: &HashSet<usize>,
    group_threshold: f64,
    audit_events: &mut Vec<AuditEvent>,
) -> Vec<GroupResult> {
    let mut merged: Vec<GroupResult> = Vec::new();
    let mut occupied: HashMap<usize, String> = HashMap::new();

    for (idx, raw) in raw_groups.iter().enumerate() {
        let group_id = if raw.group_id.trim().is_empty() {
            format!("G{}", idx + 1)
        } else {
            raw.group_id.clone()
        };
        let label = if raw.label.trim().is_empty() { "group".to_string() } else { raw.label.clone() };

        let mut seen_local: HashSet<usize> = HashSet::new();
        let mut cleaned: Vec<usize> = Vec::new();
        let mut out_of_range_found = false;
        let mut duplicated_found = false;
        for &line_index in &raw.line_indices {
            if !valid_line_indices.contains(&line_index) {
                out_of_range_found = true;
                continue;
            }
            if !seen_local.insert(line_index) {
                duplicated_found = true;
                continue;
            }
            cleaned.push(line_index);
        }

        let mut conflict_found = false;
        let mut final_indices: Vec<usize> = Vec::new();
        for line_index in cleaned {
            if occupied.contains_key(&line_index) {
                conflict_found = true;
                continue;
            }
            occupied.insert(line_index, group_id.clone());
            final_indices.push(line_index);
        }

        let confidence_group = normalize_confidence(raw.confidence_group);
        let low_confidence = confidence_group.is_none_or(|value| value < group_threshold);
        let too_few_lines = final_indices.len() < 2;
        let needs_review = raw.needs_review
            || out_of_range_found
            || duplicated_found
            || conflict_found
            || too_few_lines
            || low_confidence;

        if out_of_range_found {
            audit_events.push(audit(
                "group_line_index_out_of_range",
                "Group contains line_indices outside parser lines",
                None,
                Some(json!({"group_id": group_id, "line_indices": raw.line_indices})),
            ));
        }
        if duplicated_found {
            audit_events.push(audit(
                "group_line_index_duplicated",
                "Group line_indices contain duplicates",
                None,
                Some(json!({"group_id": group_id})),
            ));
        }
        if conflict_found {
            audit_events.push(audit(
                "group_line_conflict",
                "Group conflicts with previous group; conflicting lines removed (first group wins)",
                None,
                Some(json!({"group_id": group_id})),
            ));
        }
        if too_few_lines {
            audit_events.push(audit(
                "group_too_few_lines",
                "Group must contain at least 2 valid line_indices",
                None,
                Some(json!({"group_id": group_id, "line_indices": final_indices})),
            ));
        }

        let mut metadata = as_metadata(json!({
            "source": "llm",
            "group_membership_rule": GROUP_MEMBERSHIP_RULE,
        }));
        for (key, value) in &raw.metadata {
            metadata.insert(key.clone(), value.clone());
        }

        merged.push(GroupResult {
            group_id,
            group_type: raw.group_type,
            label,
            line_indices: final_indices,
            confidence_group,
            needs_review,
            metadata,
            version: raw.version.clone(),
        });
    }

    merged
}

/// Non-binding routing hint for the external dispatcher.
fn build_dispatch_decision(
    order_raw: &OrderRawParsed,
    items: &[NormalizedItem],
    groups: &[GroupResult],
    overall_needs_review: bool,
) -> Value {
    let mut reasons: Vec<&str> = Vec::new();
    if order_raw.needs_review {
        reasons.push("order_raw_needs_review");
    }
    if items.iter().any(|item| item.needs_review) {
        reasons.push("item_needs_review");
    }
    if groups.iter().any(|group| group.needs_review) {
        reasons.push("group_needs_review");
    }
    if items.iter().any(|item| item.item_code.is_none()) {
        reasons.push("missing_item_code");
    }
    if items.iter().any(|item| item.qty == 0) {
        reasons.push("invalid_qty");
    }

    let should_review = overall_needs_review || !reasons.is_empty();
    json!({
        "route": if should_review { ROUTE_REVIEW_QUEUE } else { ROUTE_AUTO_DISPATCH },
        "should_auto_dispatch": !should_review,
        "reasons": reasons,
    })
}

/// Merge the structured result back onto the parser lines and enforce the
/// order-level invariants.
pub fn merge_and_validate(
    order_raw: &OrderRawParsed,
    candidates: &CandidatesByLine,
    structured: &StructuredResult,
    menu_catalog: Option<&Value>,
    allowed_mods: Option<&[String]>,
    thresholds: Thresholds,
) -> OrderNormalized {
    let thresholds = thresholds.normalized();
    let copied_lines: Vec<RawLine> = order_raw.lines.clone();
    let valid_line_indices: HashSet<usize> =
        copied_lines.iter().map(|line| line.line_index).collect();
    let valid_catalog_ids = catalog_ids(menu_catalog, candidates);
    debug!(
        lines = copied_lines.len(),
        catalog_ids = valid_catalog_ids.len(),
        "merging structured result"
    );

    let mut audit_events: Vec<AuditEvent> = structured.audit_events.clone();
    let llm_items_by_line =
        collect_llm_items(&structured.items, &valid_line_indices, &mut audit_events);

    let empty: Vec<CandidateItem> = Vec::new();
    let items: Vec<NormalizedItem> = copied_lines
        .iter()
        .map(|line| {
            merge_one_item(
                line,
                llm_items_by_line.get(&line.line_index).copied(),
                candidates.get(&line.line_index).unwrap_or(&empty),
                &valid_catalog_ids,
                thresholds.item,
                thresholds.mods,
                &mut audit_events,
            )
        })
        .collect();

    let groups = merge_groups(
        &structured.groups,
        &valid_line_indices,
        thresholds.group,
        &mut audit_events,
    );

    let overall_needs_review = order_raw.needs_review
        || items.iter().any(|item| item.needs_review)
        || groups.iter().any(|group| group.needs_review);
    let dispatch_decision =
        build_dispatch_decision(order_raw, &items, &groups, overall_needs_review);

    let mut metadata = order_raw.metadata.clone();
    metadata.insert(
        "structured_result_metadata".to_string(),
        Value::Object(structured.metadata.clone()),
    );
    metadata.insert(
        "thresholds".to_string(),
        json!({
            "item_threshold": thresholds.item,
            "mods_threshold": thresholds.mods,
            "group_threshold": thresholds.group,
        }),
    );
    metadata.insert(
        "validation_rules".to_string(),
        json!({
            "group_membership_rule": GROUP_MEMBERSHIP_RULE,
            "mods_filter_mode": "open",
            "allowed_mods_provided": allowed_mods.is_some(),
        }),
    );
    metadata.insert("dispatch_decision".to_string(), dispatch_decision);

    let mut confidence_values: Vec<f64> = Vec::new();
    for item in &items {
        confidence_values.extend(item.confidence_item);
        confidence_values.extend(item.confidence_mods);
    }
    for group in &groups {
        confidence_values.extend(group.confidence_group);
    }
    let order_confidence = confidence_values.iter().copied().reduce(f64::min);

    OrderNormalized {
        source_text: order_raw.source_text.clone(),
        items,
        groups,
        order_id: order_raw.order_id.clone(),
        lines: copied_lines,
        audit_events,
        overall_needs_review,
        order_confidence,
        metadata,
        version: contract_version(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{GroupType, Metadata};

    fn make_order() -> OrderRawParsed {
        let mut first = RawLine::new(0, "招牌鍋貼 x2 備註:加辣", "招牌鍋貼", 2);
        first.note_raw = Some("加辣".to_string());
        let second = RawLine::new(1, "酸辣湯 x1", "酸辣湯", 1);
        OrderRawParsed {
            source_text: "招牌鍋貼 x2 備註:加辣\n酸辣湯 x1".to_string(),
            lines: vec![first, second],
            order_id: None,
            parse_warnings: Vec::new(),
            needs_review: false,
            metadata: Metadata::new(),
            version: contract_version(),
        }
    }

    fn make_candidates(order: &OrderRawParsed) -> CandidatesByLine {
        let mut by_line = CandidatesByLine::new();
        for (line, (name, code)) in
            order.lines.iter().zip([("招牌鍋貼", "I001"), ("酸辣湯", "I002")])
        {
            by_line.insert(
                line.line_index,
                vec![CandidateItem {
                    line_index: line.line_index,
                    raw_line: line.raw_line.clone(),
                    name_raw: line.name_raw.clone(),
                    qty: line.qty,
                    candidate_name: name.to_string(),
                    candidate_code: Some(code.to_string()),
                    note_raw: line.note_raw.clone(),
                    confidence_item: Some(95.0),
                    needs_review: false,
                    metadata: Metadata::new(),
                    version: contract_version(),
                }],
            );
        }
        by_line
    }

    fn catalog() -> Value {
        json!({"I001": ["招牌鍋貼"], "I002": ["酸辣湯"], "I003": ["冰豆漿"]})
    }

    fn allowed() -> Vec<String> {
        vec!["加辣".to_string(), "去冰".to_string(), "少鹽".to_string()]
    }

    fn item(
        line_index: usize,
        item_code: Option<&str>,
        name: &str,
        qty: u32,
        confidence: f64,
    ) -> NormalizedItem {
        NormalizedItem {
            line_index,
            raw_line: "dummy_raw".to_string(),
            name_raw: "dummy_name".to_string(),
            qty,
            name_normalized: name.to_string(),
            item_code: item_code.map(str::to_string),
            note_raw: Some("dummy_note".to_string()),
            mods: Vec::new(),
            group_id: None,
            confidence_item: Some(confidence),
            confidence_mods: Some(confidence),
            needs_review: false,
            metadata: Metadata::new(),
            version: contract_version(),
        }
    }

    fn group(group_id: &str, line_indices: Vec<usize>, confidence: f64) -> GroupResult {
        GroupResult {
            group_id: group_id.to_string(),
            group_type: GroupType::PackTogether,
            label: "同袋".to_string(),
            line_indices,
            confidence_group: Some(confidence),
            needs_review: false,
            metadata: Metadata::new(),
            version: contract_version(),
        }
    }

    fn structured(items: Vec<NormalizedItem>, groups: Vec<GroupResult>) -> StructuredResult {
        StructuredResult {
            items,
            groups,
            audit_events: Vec::new(),
            metadata: Metadata::new(),
            version: contract_version(),
        }
    }

    fn merge(order: &OrderRawParsed, structured: &StructuredResult) -> OrderNormalized {
        let candidates = make_candidates(order);
        merge_and_validate(
            order,
            &candidates,
            structured,
            Some(&catalog()),
            Some(&allowed()),
            Thresholds::default(),
        )
    }

    fn assert_raw_fields_preserved(result: &OrderNormalized, order: &OrderRawParsed) {
        for merged in &result.items {
            let raw = order.lines.iter().find(|l| l.line_index == merged.line_index).unwrap();
            assert_eq!(merged.raw_line, raw.raw_line);
            assert_eq!(merged.name_raw, raw.name_raw);
            assert_eq!(merged.note_raw, raw.note_raw);
        }
    }

    #[test]
    fn test_happy_path_all_high_confidence() {
        let order = make_order();
        let mut first = item(0, Some("I001"), "招牌鍋貼", 2, 0.95);
        first.mods = vec![Mod::named("加辣", Some(0.95))];
        let structured = structured(
            vec![first, item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            vec![group("G1", vec![0, 1], 0.95)],
        );

        let result = merge(&order, &structured);

        assert!(!result.overall_needs_review);
        assert!(result.items.iter().all(|item| !item.needs_review));
        assert!(!result.groups[0].needs_review);
        let decision = &result.metadata["dispatch_decision"];
        assert_eq!(decision["route"], "auto-dispatch");
        assert_eq!(decision["should_auto_dispatch"], true);
        assert_raw_fields_preserved(&result, &order);
    }

    #[test]
    fn test_item_low_confidence_marks_review() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.4), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert!(result.items[0].needs_review);
        assert!(result.overall_needs_review);
        assert_eq!(result.metadata["dispatch_decision"]["route"], "review-queue");
        assert_eq!(result.metadata["dispatch_decision"]["should_auto_dispatch"], false);
    }

    #[test]
    fn test_mods_low_confidence_marks_review() {
        let order = make_order();
        let mut first = item(0, Some("I001"), "招牌鍋貼", 2, 0.95);
        first.confidence_mods = Some(0.2);
        first.mods = vec![Mod::named("加辣", Some(0.2))];
        let structured =
            structured(vec![first, item(1, Some("I002"), "酸辣湯", 1, 0.95)], Vec::new());

        let result = merge(&order, &structured);

        assert!(result.items[0].needs_review);
        assert!(result.items[0].mods[0].needs_review);
        assert!(result.overall_needs_review);
    }

    #[test]
    fn test_group_low_confidence_marks_review() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            vec![group("G1", vec![0, 1], 0.5)],
        );

        let result = merge(&order, &structured);

        assert!(result.groups[0].needs_review);
        assert!(result.overall_needs_review);
    }

    #[test]
    fn test_item_code_not_in_catalog_falls_back_to_candidate() {
        let order = make_order();
        let structured = structured(
            vec![
                item(0, Some("NOT_IN_MENU"), "未知品項", 2, 0.95),
                item(1, Some("I002"), "酸辣湯", 1, 0.95),
            ],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].item_code.as_deref(), Some("I001"));
        assert!(result.items[0].needs_review);
        assert!(result.audit_events.iter().any(|e| e.event_type == "item_code_not_in_catalog"));
        assert!(result.audit_events.iter().any(|e| e.event_type == "item_fallback_to_candidate"));
        assert_raw_fields_preserved(&result, &order);
    }

    #[test]
    fn test_item_code_not_in_line_candidates_falls_back() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I003"), "冰豆漿", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].item_code.as_deref(), Some("I001"));
        assert!(result.items[0].needs_review);
        assert!(
            result.audit_events.iter().any(|e| e.event_type == "item_code_not_in_line_candidates")
        );
        assert_eq!(result.items[0].metadata["fallback_reason"], "item_code_not_in_line_candidates");
    }

    #[test]
    fn test_mods_outside_reference_are_kept() {
        let order = make_order();
        let mut first = item(0, Some("I001"), "招牌鍋貼", 2, 0.95);
        first.mods = vec![Mod::named("加辣", Some(0.95)), Mod::named("神秘醬", Some(0.95))];
        let structured =
            structured(vec![first, item(1, Some("I002"), "酸辣湯", 1, 0.95)], Vec::new());

        let result = merge(&order, &structured);

        let tokens: Vec<&str> = result.items[0].mods.iter().map(|m| m.mod_raw.as_str()).collect();
        assert_eq!(tokens, vec!["加辣", "神秘醬"]);
    }

    #[test]
    fn test_blank_mod_drops_with_review() {
        let order = make_order();
        let mut first = item(0, Some("I001"), "招牌鍋貼", 2, 0.95);
        first.mods = vec![
            Mod { mod_raw: "  ".to_string(), ..Mod::named("x", Some(0.95)) },
            Mod::named("加辣", Some(0.95)),
        ];
        first.mods[0].mod_name = None;
        let structured =
            structured(vec![first, item(1, Some("I002"), "酸辣湯", 1, 0.95)], Vec::new());

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].mods.len(), 1);
        assert!(result.items[0].needs_review);
    }

    #[test]
    fn test_group_line_out_of_range_is_trimmed_and_reviewed() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            vec![group("G1", vec![0, 99, 0], 0.95)],
        );

        let result = merge(&order, &structured);

        assert_eq!(result.groups[0].line_indices, vec![0]);
        assert!(result.groups[0].needs_review);
        assert!(
            result.audit_events.iter().any(|e| e.event_type == "group_line_index_out_of_range")
        );
        assert!(
            result.audit_events.iter().any(|e| e.event_type == "group_line_index_duplicated")
        );
        assert!(result.audit_events.iter().any(|e| e.event_type == "group_too_few_lines"));
    }

    #[test]
    fn test_group_conflict_uses_first_wins_policy() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            vec![group("G1", vec![0, 1], 0.95), group("G2", vec![1], 0.95)],
        );

        let result = merge(&order, &structured);

        assert_eq!(result.groups[0].line_indices, vec![0, 1]);
        assert!(!result.groups[0].needs_review);
        assert!(result.groups[1].line_indices.is_empty());
        assert!(result.groups[1].needs_review);
        assert!(result.audit_events.iter().any(|e| e.event_type == "group_line_conflict"));
    }

    #[test]
    fn test_item_line_index_must_exist_in_raw_lines() {
        let order = make_order();
        let structured = structured(
            vec![
                item(0, Some("I001"), "招牌鍋貼", 2, 0.95),
                item(1, Some("I002"), "酸辣湯", 1, 0.95),
                item(99, Some("I003"), "冰豆漿", 1, 0.95),
            ],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        let indices: Vec<usize> = result.items.iter().map(|item| item.line_index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(result.audit_events.iter().any(|e| e.event_type == "item_invalid_line_index"));
    }

    #[test]
    fn test_duplicate_line_index_keeps_first() {
        let order = make_order();
        let structured = structured(
            vec![
                item(0, Some("I001"), "first", 2, 0.95),
                item(0, Some("I001"), "second", 2, 0.95),
                item(1, Some("I002"), "酸辣湯", 1, 0.95),
            ],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].name_normalized, "first");
        assert!(result.audit_events.iter().any(|e| e.event_type == "item_duplicate_line_index"));
    }

    #[test]
    fn test_qty_invalid_keeps_raw_qty_with_review() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 0, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].qty, 2);
        assert!(result.items[0].needs_review);
        assert!(result.audit_events.iter().any(|e| e.event_type == "qty_invalid"));
    }

    #[test]
    fn test_missing_llm_item_falls_back_with_review() {
        let order = make_order();
        let structured = structured(vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95)], Vec::new());

        let result = merge(&order, &structured);

        assert_eq!(result.items.len(), 2);
        assert!(result.items[1].needs_review);
        assert_eq!(result.items[1].item_code.as_deref(), Some("I002"));
        assert_eq!(result.items[1].metadata["merge_source"], "fallback");
        assert!(result.audit_events.iter().any(|e| e.event_type == "llm_item_missing"));
        assert_raw_fields_preserved(&result, &order);
    }

    #[test]
    fn test_percent_confidences_rescaled() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 95.0), item(1, Some("I002"), "酸辣湯", 1, 92.0)],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].confidence_item, Some(0.95));
        assert_eq!(result.items[1].confidence_item, Some(0.92));
        assert!(result.items.iter().all(|item| !item.needs_review));
        assert_eq!(result.order_confidence, Some(0.92));
    }

    #[test]
    fn test_out_of_range_confidence_becomes_null_and_reviews() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 250.0), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );

        let result = merge(&order, &structured);

        assert_eq!(result.items[0].confidence_item, None);
        assert!(result.items[0].needs_review);
    }

    #[test]
    fn test_custom_thresholds_can_be_relaxed() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.8), item(1, Some("I002"), "酸辣湯", 1, 0.8)],
            vec![group("G1", vec![0, 1], 0.8)],
        );

        let candidates = make_candidates(&order);
        let result = merge_and_validate(
            &order,
            &candidates,
            &structured,
            Some(&catalog()),
            Some(&allowed()),
            Thresholds { item: 0.75, mods: 0.75, group: 0.75 },
        );

        assert!(result.items.iter().all(|item| !item.needs_review));
        assert!(result.groups.iter().all(|group| !group.needs_review));
        assert!(!result.overall_needs_review);
    }

    #[test]
    fn test_list_catalog_codes_are_recognized() {
        let order = make_order();
        let list_catalog = json!([
            {"item_id": "I001", "canonical_name": "招牌鍋貼"},
            {"item_id": "I002", "canonical_name": "酸辣湯"},
        ]);
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );

        let candidates = make_candidates(&order);
        let result = merge_and_validate(
            &order,
            &candidates,
            &structured,
            Some(&list_catalog),
            None,
            Thresholds::default(),
        );

        let codes: Vec<_> = result.items.iter().map(|i| i.item_code.as_deref()).collect();
        assert_eq!(codes, vec![Some("I001"), Some("I002")]);
        assert!(!result.overall_needs_review);
    }

    #[test]
    fn test_catalog_ids_derived_from_candidates_when_absent() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );

        let candidates = make_candidates(&order);
        let result = merge_and_validate(
            &order,
            &candidates,
            &structured,
            None,
            None,
            Thresholds::default(),
        );

        assert_eq!(result.items[0].item_code.as_deref(), Some("I001"));
        assert!(!result.overall_needs_review);
    }

    #[test]
    fn test_group_metadata_source_is_preserved() {
        let order = make_order();
        let mut backstop = group("G1", vec![0, 1], 0.35);
        backstop.metadata = as_metadata(json!({"source": "rule_backstop"}));
        backstop.needs_review = true;
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            vec![backstop],
        );

        let result = merge(&order, &structured);

        assert_eq!(result.groups[0].metadata["source"], "rule_backstop");
        assert_eq!(result.groups[0].metadata["group_membership_rule"], GROUP_MEMBERSHIP_RULE);
    }

    #[test]
    fn test_order_confidence_is_minimum() {
        let order = make_order();
        let structured = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.9), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            vec![group("G1", vec![0, 1], 0.88)],
        );

        let result = merge(&order, &structured);
        assert_eq!(result.order_confidence, Some(0.88));
    }

    #[test]
    fn test_structured_audit_events_are_copied_in_order() {
        let order = make_order();
        let mut s = structured(
            vec![item(0, Some("I001"), "招牌鍋貼", 2, 0.95), item(1, Some("I002"), "酸辣湯", 1, 0.95)],
            Vec::new(),
        );
        s.audit_events.push(audit("llm_json_parse_retry", "retry", None, None));
        s.audit_events.push(audit("mods_beyond_reference", "kept", Some(0), None));

        let result = merge(&order, &s);

        assert_eq!(result.audit_events[0].event_type, "llm_json_parse_retry");
        assert_eq!(result.audit_events[1].event_type, "mods_beyond_reference");
    }
}
