//! Receipt text parser: dirty free-form text in, `OrderRawParsed` out.
//!
//! Lines keep their original index even when surrounding noise lines are
//! dropped, so downstream line references stay stable.

use std::sync::LazyLock;

use regex::Regex;

use crate::contracts::{Metadata, OrderRawParsed, RawLine, contract_version};

static LEADING_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[*\-•●#]+|\d{1,3}[.)、]|[(（]\d{1,3}[)）]|[A-Za-z][.)])\s*").unwrap()
});
static SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\-=~_*#\s]{3,}$").unwrap());
static PHONE_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:電話|tel)?\s*:?\s*(?:\+?886[-\s]?)?(?:0\d{1,2}[-\s]?\d{6,8}|09\d{2}[-\s]?\d{3}[-\s]?\d{3})(?:\s*(?:#|ext\.?|轉)\s*\d{1,5})?\s*$",
    )
    .unwrap()
});
static DATETIME_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\d{4}[/\-]\d{1,2}[/\-]\d{1,2}(?:\s+\d{1,2}:\d{2}(?::\d{2})?)?|\d{1,2}:\d{2}(?::\d{2})?)\s*$",
    )
    .unwrap()
});
static NOISE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:電話|tel|地址|統編|單號|訂單|時間|日期|總計|小計|合計|應收|找零)(?:\s|:|$)")
        .unwrap()
});
static NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:備註|註記|附註|备注)\s*(?::\s*|\s+)(.+)$").unwrap());
static STANDALONE_NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:備註|註記|附註|备注)\s*(?::\s*|\s+)(.+)$").unwrap());
static TRAILING_PAREN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<base>.+?)\s*\((?P<note>[^()]+)\)\s*$").unwrap());
static QTY_X_OR_STAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<name>.+?)\s*[x*]\s*(?P<qty>-?\d+)\s*$").unwrap());
static QTY_FEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>.+?)\s+(?P<qty>-?\d+)\s*份\s*$").unwrap());
static QTY_PLAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>.+?)\s+(?P<qty>-?\d+)\s*$").unwrap());
static QTY_MARKER_ANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<name>.+?)\s*[x*]\s*(?P<qty_text>\S*)\s*$").unwrap());
static QTY_FEN_ANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>.+?)\s+(?P<qty_text>\S+)\s*份\s*$").unwrap());
static HAS_QTY_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[x*]\s*\S+|\d+\s*份").unwrap());
static HAS_QTY_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|\s)[x*]\s*\S+").unwrap());
static HAS_FEN_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\s*份").unwrap());
static TRAILING_CURRENCY_AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<body>.+?)\s*(?:ntd?\$?|twd|\$)\s*(?P<amount>\d+(?:\.\d{1,2})?)\s*$")
        .unwrap()
});
static TRAILING_AMOUNT_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<body>.+?)\s*(?P<amount>\d+(?:\.\d{1,2})?)\s*元\s*$").unwrap());
static TRAILING_PLAIN_AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<body>.+?)\s+(?P<amount>\d+(?:\.\d{1,2})?)\s*$").unwrap());
static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_QTY_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[x*]\s*-?\d+\s*$").unwrap());
static TRAILING_BARE_QTY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*-?\d+\s*份?\s*$").unwrap());

/// Map full-width and alternative symbols to their canonical ASCII forms.
/// Full-width digits are folded too so quantity parsing sees ASCII.
fn canonical_symbol(ch: char) -> char {
    match ch {
        '：' => ':',
        '（' => '(',
        '）' => ')',
        '＊' | '﹡' => '*',
        '＄' => '$',
        'Ｘ' | 'ｘ' | '×' => 'x',
        '　' => ' ',
        '０'..='９' => char::from(b'0' + (ch as u32 - '０' as u32) as u8),
        other => other,
    }
}

fn normalize_for_parse(line: &str) -> String {
    let translated: String = line.chars().map(canonical_symbol).collect();
    MULTI_SPACE_RE.replace_all(&translated, " ").trim().to_string()
}

fn strip_leading_markers(line: &str) -> String {
    let mut current = line.to_string();
    loop {
        let stripped = LEADING_MARKER_RE.replace(&current, "").trim().to_string();
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

fn is_noise_line(normalized: &str) -> bool {
    if normalized.is_empty() {
        return true;
    }
    if SEPARATOR_RE.is_match(normalized) {
        return true;
    }
    if NOISE_PREFIX_RE.is_match(normalized) {
        // Metadata-looking prefix, but a quantity hint means it is an item.
        return !HAS_QTY_HINT_RE.is_match(normalized);
    }
    PHONE_ONLY_RE.is_match(normalized) || DATETIME_ONLY_RE.is_match(normalized)
}

fn extract_inline_note(text: &str) -> (String, Option<String>) {
    if let Some(matched) = NOTE_RE.captures(text) {
        let full = matched.get(0).unwrap();
        let body = text[..full.start()].trim().to_string();
        let note = matched.get(1).unwrap().as_str().trim().to_string();
        return (body, Some(note));
    }
    (text.trim().to_string(), None)
}

/// Peel trailing parenthesized groups off the name, returning the residual
/// name and the notes in their original left-to-right order.
fn extract_parenthetical_notes(name_with_note: &str) -> (String, Vec<String>) {
    let mut notes: Vec<String> = Vec::new();
    let mut current = name_with_note.trim().to_string();
    loop {
        let Some((base, note)) = TRAILING_PAREN_RE
            .captures(&current)
            .map(|m| (m["base"].trim().to_string(), m["note"].trim().to_string()))
        else {
            return (current, notes);
        };
        notes.insert(0, note);
        current = base;
    }
}

fn fallback_name(text: &str) -> String {
    let name = TRAILING_QTY_MARKER_RE.replace(text, "").trim().to_string();
    let name = TRAILING_BARE_QTY_RE.replace(&name, "").trim().to_string();
    if name.is_empty() {
        text.trim().to_string()
    } else {
        name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QtyState {
    Ok,
    Missing,
    Invalid,
}

fn parse_qty(text: &str) -> Option<i64> {
    text.parse::<i64>().ok()
}

fn extract_name_and_qty_once(text: &str) -> (String, Option<i64>, QtyState) {
    if let Some(m) = QTY_X_OR_STAR_RE.captures(text) {
        let name = m["name"].trim().to_string();
        return match parse_qty(&m["qty"]) {
            Some(qty) => (name, Some(qty), QtyState::Ok),
            None => (name, None, QtyState::Invalid),
        };
    }

    if let Some(m) = QTY_FEN_RE.captures(text) {
        let name = m["name"].trim().to_string();
        return match parse_qty(&m["qty"]) {
            Some(qty) => (name, Some(qty), QtyState::Ok),
            None => (name, None, QtyState::Invalid),
        };
    }

    if let Some(m) = QTY_MARKER_ANY_RE.captures(text) {
        let qty_text = m["qty_text"].trim().to_string();
        let state = if qty_text.is_empty() {
            QtyState::Missing
        } else {
            QtyState::Invalid
        };
        return (m["name"].trim().to_string(), None, state);
    }

    if let Some(m) = QTY_FEN_ANY_RE.captures(text) {
        return (m["name"].trim().to_string(), None, QtyState::Invalid);
    }

    if HAS_QTY_MARKER_RE.is_match(text) || HAS_FEN_MARKER_RE.is_match(text) {
        return (text.to_string(), None, QtyState::Invalid);
    }

    if let Some(m) = QTY_PLAIN_RE.captures(text) {
        if let Some(qty) = parse_qty(&m["qty"]) {
            return (m["name"].trim().to_string(), Some(qty), QtyState::Ok);
        }
    }

    (text.to_string(), None, QtyState::Missing)
}

/// Strip a trailing price token (`NT$120`, `40元`, bare decimal) so the
/// quantity extractor can retry on the remaining body.
fn strip_trailing_amount(text: &str) -> String {
    let current = text.trim();
    for pattern in [&*TRAILING_CURRENCY_AMOUNT_RE, &*TRAILING_AMOUNT_UNIT_RE] {
        if let Some(m) = pattern.captures(current) {
            return m["body"].trim().to_string();
        }
    }

    if let Some(m) = TRAILING_PLAIN_AMOUNT_RE.captures(current) {
        let body = m["body"].trim().to_string();
        // A bare trailing number is only price noise when the body still
        // carries its own quantity hint.
        if HAS_QTY_HINT_RE.is_match(&body) {
            return body;
        }
    }

    current.to_string()
}

fn extract_name_and_qty(prepared: &str) -> (String, Option<i64>, QtyState) {
    let (name_raw, qty, state) = extract_name_and_qty_once(prepared);
    if qty.is_some() {
        return (name_raw, qty, state);
    }

    let trimmed = strip_trailing_amount(prepared);
    if trimmed != prepared {
        let (t_name, t_qty, t_state) = extract_name_and_qty_once(&trimmed);
        if t_qty.is_some() || t_state == QtyState::Invalid {
            return (t_name, t_qty, t_state);
        }
    }

    (name_raw, qty, state)
}

fn parse_line(raw_line: &str, line_index: usize, warnings: &mut Vec<String>) -> RawLine {
    let normalized = normalize_for_parse(raw_line);
    let prepared = strip_leading_markers(&normalized);
    let (body, inline_note) = extract_inline_note(&prepared);

    let (mut name_token, qty, qty_state) = extract_name_and_qty(&body);

    let mut needs_review = false;
    let qty = match qty {
        None => {
            needs_review = true;
            if qty_state == QtyState::Invalid {
                warnings.push(format!("line {line_index}: qty invalid, defaulted to 1"));
            } else {
                warnings.push(format!("line {line_index}: qty missing, defaulted to 1"));
            }
            name_token = fallback_name(&name_token);
            1
        }
        Some(value) if value <= 0 => {
            needs_review = true;
            warnings.push(format!(
                "line {line_index}: qty must be positive, defaulted to 1"
            ));
            1
        }
        Some(value) => value as u32,
    };

    let (mut name_raw, mut note_parts) = extract_parenthetical_notes(&name_token);
    if let Some(note) = inline_note {
        note_parts.push(note);
    }
    let note_parts: Vec<String> = note_parts.into_iter().filter(|part| !part.is_empty()).collect();
    let note_raw = if note_parts.is_empty() {
        None
    } else {
        Some(note_parts.join("; "))
    };

    if name_raw.is_empty() {
        let recovered = fallback_name(&body);
        name_raw = if !recovered.is_empty() {
            recovered
        } else if !normalized.is_empty() {
            normalized.clone()
        } else {
            raw_line.trim().to_string()
        };
        needs_review = true;
        warnings.push(format!(
            "line {line_index}: unable to confidently parse item name"
        ));
    }

    RawLine {
        line_index,
        raw_line: raw_line.to_string(),
        name_raw,
        qty,
        note_raw,
        needs_review,
        metadata: Metadata::new(),
        version: contract_version(),
    }
}

/// Return the note text when the whole line is a standalone note marker
/// (e.g. `備註:分裝`).
fn standalone_note(raw_line: &str) -> Option<String> {
    let normalized = normalize_for_parse(raw_line);
    STANDALONE_NOTE_RE.captures(&normalized).and_then(|m| {
        let note = m.get(1).unwrap().as_str().trim().to_string();
        if note.is_empty() { None } else { Some(note) }
    })
}

/// Parse receipt text into item-bearing lines. Never fails: unparseable
/// quantities and names degrade to defaults with review flags.
pub fn parse_receipt_text(text: &str) -> OrderRawParsed {
    let mut parse_warnings: Vec<String> = Vec::new();
    let parse_errors: Vec<String> = Vec::new();
    let mut lines: Vec<RawLine> = Vec::new();

    for (index, line) in text.split('\n').enumerate() {
        let raw_line = line.trim_end_matches('\r');
        let normalized = normalize_for_parse(raw_line);
        if is_noise_line(&normalized) {
            continue;
        }

        if let Some(note) = standalone_note(raw_line) {
            match lines.last_mut() {
                Some(prev) => {
                    prev.note_raw = Some(match prev.note_raw.take() {
                        Some(existing) => format!("{existing}; {note}"),
                        None => note,
                    });
                }
                None => {
                    parse_warnings
                        .push(format!("line {index}: standalone note with no preceding item"));
                }
            }
            continue;
        }

        lines.push(parse_line(raw_line, index, &mut parse_warnings));
    }

    let needs_review = !parse_warnings.is_empty()
        || !parse_errors.is_empty()
        || lines.iter().any(|line| line.needs_review);

    let mut metadata = Metadata::new();
    metadata.insert(
        "parse_errors".to_string(),
        serde_json::Value::Array(
            parse_errors.iter().map(|e| serde_json::Value::String(e.clone())).collect(),
        ),
    );

    OrderRawParsed {
        source_text: text.to_string(),
        lines,
        order_id: None,
        parse_warnings,
        needs_review,
        metadata,
        version: contract_version(),
    }
}
