//! Fuzzy candidate generation: raw line names against the menu catalog.
//!
//! The catalog payload is polymorphic (mapping, list, bare strings); it is
//! normalized once into `CatalogEntry` records before any scoring happens.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use unicode_normalization::UnicodeNormalization;

use crate::contracts::{
    CandidateItem, CandidatesByLine, CatalogEntry, RawLine, as_metadata, contract_version,
};

pub const DEFAULT_TOP_K: usize = 10;
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 55.0;

const W_CHAR: f64 = 0.50;
const W_PARTIAL: f64 = 0.30;
const W_TOKEN: f64 = 0.20;

static COMMON_SYMBOLS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"[!"\#$%&'()*+,\-./:;<=>?@\[\]\\^_`{|}~，。！？、；：／（）【】「」『』《》〈〉·．]"#,
    )
    .unwrap()
});
static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn normalize_text(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    let cleaned = COMMON_SYMBOLS_RE.replace_all(&folded, " ");
    MULTI_SPACE_RE.replace_all(&cleaned, " ").trim().to_string()
}

fn compact_text(text: &str) -> String {
    text.replace(' ', "")
}

fn tokenize(normalized: &str) -> HashSet<String> {
    let compact = compact_text(normalized);
    if compact.is_empty() {
        return HashSet::new();
    }
    let mut tokens: HashSet<String> =
        normalized.split(' ').filter(|part| !part.is_empty()).map(str::to_string).collect();
    let chars: Vec<char> = compact.chars().collect();
    if chars.len() == 1 {
        tokens.insert(compact);
        return tokens;
    }
    for pair in chars.windows(2) {
        tokens.insert(pair.iter().collect());
    }
    tokens
}

/// Longest common subsequence length over chars (rolling-row DP).
fn lcs_len(left: &[char], right: &[char]) -> usize {
    if left.is_empty() || right.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; right.len() + 1];
    let mut row = vec![0usize; right.len() + 1];
    for l in left {
        for (j, r) in right.iter().enumerate() {
            row[j + 1] = if l == r {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[right.len()]
}

/// Character-level similarity in 0–100: LCS ratio over both strings.
fn char_ratio(left: &str, right: &str) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let a: Vec<char> = left.chars().collect();
    let b: Vec<char> = right.chars().collect();
    2.0 * lcs_len(&a, &b) as f64 / (a.len() + b.len()) as f64 * 100.0
}

/// Best alignment of the shorter string against same-length windows of the
/// longer one, in 0–100.
fn partial_ratio(left: &str, right: &str) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let (short, long) = if left.chars().count() <= right.chars().count() {
        (left, right)
    } else {
        (right, left)
    };
    if long.contains(short) {
        return 100.0;
    }
    let short_chars: Vec<char> = short.chars().collect();
    let long_chars: Vec<char> = long.chars().collect();
    if short_chars.len() == long_chars.len() {
        return char_ratio(short, long);
    }
    let window = short_chars.len();
    let mut max_score = 0.0f64;
    for start in 0..=(long_chars.len() - window) {
        let slice = &long_chars[start..start + window];
        let score = 2.0 * lcs_len(&short_chars, slice) as f64 / (2 * window) as f64 * 100.0;
        if score > max_score {
            max_score = score;
        }
    }
    max_score
}

fn token_similarity(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let inter = left.intersection(right).count();
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64 * 100.0
}

/// Blend the three similarity signals; the bool reports a token-dominant
/// basis (token beats the character signals by at least 5 points).
fn score_match(query: &str, candidate: &str) -> (f64, bool) {
    let query_norm = normalize_text(query);
    let candidate_norm = normalize_text(candidate);
    let query_compact = compact_text(&query_norm);
    let candidate_compact = compact_text(&candidate_norm);

    let char_score = char_ratio(&query_compact, &candidate_compact);
    let partial_score = partial_ratio(&query_compact, &candidate_compact);
    let token_score = token_similarity(&tokenize(&query_norm), &tokenize(&candidate_norm));

    let mut score = W_CHAR * char_score + W_PARTIAL * partial_score + W_TOKEN * token_score;
    if !query_compact.is_empty()
        && !candidate_compact.is_empty()
        && (candidate_compact.contains(&query_compact) || query_compact.contains(&candidate_compact))
    {
        score += 5.0;
    }

    let score = score.clamp(0.0, 100.0);
    let token_basis = token_score >= char_score.max(partial_score) + 5.0;
    (score, token_basis)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_aliases(raw: Option<&Value>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match raw {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .values()
            .filter_map(scalar_to_string)
            .map(|alias| alias.trim().to_string())
            .filter(|alias| !alias.is_empty())
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(scalar_to_string)
            .map(|alias| alias.trim().to_string())
            .filter(|alias| !alias.is_empty())
            .collect(),
        other => scalar_to_string(other)
            .map(|alias| alias.trim().to_string())
            .filter(|alias| !alias.is_empty())
            .into_iter()
            .collect(),
    }
}

fn normalize_catalog_entry(item_id: &str, payload: &Value) -> CatalogEntry {
    let mut canonical_name = String::new();
    let mut aliases: Vec<String> = Vec::new();

    match payload {
        Value::String(name) => canonical_name = name.clone(),
        Value::Object(map) => {
            let raw_name = map
                .get("canonical_name")
                .and_then(scalar_to_string)
                .filter(|name| !name.trim().is_empty())
                .or_else(|| map.get("name").and_then(scalar_to_string));
            canonical_name = raw_name.unwrap_or_else(|| item_id.to_string());
            aliases = coerce_aliases(map.get("aliases").or_else(|| map.get("alias")));
        }
        Value::Array(items) => {
            let names: Vec<String> = items
                .iter()
                .filter_map(scalar_to_string)
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            if let Some((first, rest)) = names.split_first() {
                canonical_name = first.clone();
                aliases = rest.to_vec();
            } else {
                canonical_name = item_id.to_string();
            }
        }
        other => {
            canonical_name = scalar_to_string(other)
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| item_id.to_string());
        }
    }

    let canonical_name = canonical_name.trim().to_string();
    let mut item_id = item_id.trim().to_string();
    if item_id.is_empty() {
        item_id = if canonical_name.is_empty() {
            "unknown_item".to_string()
        } else {
            canonical_name.clone()
        };
    }
    let canonical_name = if canonical_name.is_empty() { item_id.clone() } else { canonical_name };

    CatalogEntry { item_id, canonical_name, aliases }
}

/// Normalize any accepted catalog shape into a flat entry list.
pub fn catalog_entries(menu_catalog: &Value) -> Vec<CatalogEntry> {
    match menu_catalog {
        Value::Object(map) => map
            .iter()
            .map(|(key, payload)| {
                let override_id = payload
                    .as_object()
                    .and_then(|obj| obj.get("item_id").or_else(|| obj.get("id")))
                    .and_then(scalar_to_string)
                    .filter(|id| !id.trim().is_empty());
                let entry_id = override_id.unwrap_or_else(|| key.clone());
                normalize_catalog_entry(&entry_id, payload)
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(index, payload)| {
                let obj = payload.as_object()?;
                let item_id = obj
                    .get("item_id")
                    .or_else(|| obj.get("id"))
                    .and_then(scalar_to_string)
                    .filter(|id| !id.trim().is_empty())
                    .or_else(|| {
                        obj.get("canonical_name")
                            .or_else(|| obj.get("name"))
                            .and_then(scalar_to_string)
                            .filter(|name| !name.trim().is_empty())
                    })
                    .unwrap_or_else(|| format!("list_item_{index}"));
                Some(normalize_catalog_entry(&item_id, payload))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Score every catalog entry against every line and keep the top `top_k`
/// per line. A `top_k` of zero yields empty candidate lists.
pub fn generate_candidates_with(
    lines: &[RawLine],
    menu_catalog: &Value,
    top_k: usize,
    low_confidence_threshold: f64,
) -> CandidatesByLine {
    let entries = catalog_entries(menu_catalog);
    let mut candidates_by_line = CandidatesByLine::new();

    for line in lines {
        struct Scored<'a> {
            score: f64,
            basis: &'static str,
            matched_text: &'a str,
            entry: &'a CatalogEntry,
        }

        let mut scored: Vec<Scored> = entries
            .iter()
            .map(|entry| {
                let (canonical_score, canonical_token) =
                    score_match(&line.name_raw, &entry.canonical_name);
                let mut best = Scored {
                    score: canonical_score,
                    basis: if canonical_token { "token" } else { "canonical" },
                    matched_text: &entry.canonical_name,
                    entry,
                };
                for alias in &entry.aliases {
                    let (alias_score, alias_token) = score_match(&line.name_raw, alias);
                    if alias_score > best.score {
                        best = Scored {
                            score: alias_score,
                            basis: if alias_token { "token" } else { "alias" },
                            matched_text: alias,
                            entry,
                        };
                    }
                }
                best
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.canonical_name.cmp(&b.entry.canonical_name))
                .then_with(|| a.entry.item_id.cmp(&b.entry.item_id))
        });
        scored.truncate(top_k);

        let best_line_score = scored.first().map(|s| s.score).unwrap_or(0.0);
        let low_confidence = best_line_score < low_confidence_threshold;

        let line_candidates: Vec<CandidateItem> = scored
            .iter()
            .enumerate()
            .map(|(rank, scored)| {
                let review_reason =
                    if low_confidence { "best_score_below_threshold" } else { "ok" };
                CandidateItem {
                    line_index: line.line_index,
                    raw_line: line.raw_line.clone(),
                    name_raw: line.name_raw.clone(),
                    qty: line.qty.max(1),
                    candidate_name: scored.entry.canonical_name.clone(),
                    candidate_code: Some(scored.entry.item_id.clone()),
                    note_raw: line.note_raw.clone(),
                    confidence_item: Some(round4(scored.score)),
                    needs_review: line.needs_review || low_confidence,
                    metadata: as_metadata(json!({
                        "match_basis": scored.basis,
                        "score": round4(scored.score),
                        "low_confidence": low_confidence,
                        "matched_text": scored.matched_text,
                        "rank": rank + 1,
                        "best_line_score": round4(best_line_score),
                        "low_confidence_threshold": round4(low_confidence_threshold),
                        "review_reason": review_reason,
                    })),
                    version: contract_version(),
                }
            })
            .collect();

        candidates_by_line.insert(line.line_index, line_candidates);
    }

    candidates_by_line
}

pub fn generate_candidates(lines: &[RawLine], menu_catalog: &Value) -> CandidatesByLine {
    generate_candidates_with(lines, menu_catalog, DEFAULT_TOP_K, LOW_CONFIDENCE_THRESHOLD)
}
