//! Pipeline entry: parse → candidates → structured → merge, with each
//! stage isolated so one stage blowing up degrades the envelope instead of
//! aborting the request.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::candidates::generate_candidates;
use crate::contracts::{
    AuditEvent, CandidateItem, CandidatesByLine, Metadata, NormalizedItem, OrderNormalized,
    OrderRawParsed, RawLine, StructuredResult, as_metadata, contract_version,
};
use crate::llm_client::{LlmComplete, LlmRuntime, build_llm_client_from_env};
use crate::llm_stage::llm_normalize_and_group;
use crate::merge::{Thresholds, merge_and_validate};
use crate::parser::parse_receipt_text;
use crate::prompts::PromptEngine;

/// Optional collaborators for one ingest run.
#[derive(Default)]
pub struct IngestOptions<'a> {
    pub llm_client: Option<&'a dyn LlmComplete>,
    pub llm_timeout_s: Option<f64>,
    pub prompt_engine: Option<&'a PromptEngine>,
}

/// The JSON-safe envelope returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub accepted: bool,
    pub needs_review: bool,
    pub errors: Vec<String>,
    pub order_raw: OrderRawParsed,
    pub candidates: CandidatesByLine,
    pub structured: StructuredResult,
    pub merged: OrderNormalized,
    pub llm_runtime: LlmRuntime,
    pub version: String,
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_stage<T>(stage: &str, errors: &mut Vec<String>, f: impl FnOnce() -> T) -> Option<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let message = panic_message(&panic);
            warn!(stage, %message, "stage panicked, installing fallback");
            errors.push(format!("{stage}:panic:{message}"));
            None
        }
    }
}

fn fallback_metadata(reason: &str, error: &str) -> Metadata {
    as_metadata(json!({"fallback_reason": reason, "error": error}))
}

fn fallback_raw_lines(text: &str) -> Vec<RawLine> {
    let mut lines: Vec<RawLine> = Vec::new();
    for (index, raw) in text.split('\n').enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let mut line = RawLine::new(index, raw, raw.trim(), 1);
        line.needs_review = true;
        line.metadata = as_metadata(json!({"fallback_reason": "parser_exception"}));
        lines.push(line);
    }
    if lines.is_empty() {
        let name = text.trim();
        let mut line =
            RawLine::new(0, text, if name.is_empty() { "UNKNOWN_LINE" } else { name }, 1);
        line.needs_review = true;
        line.metadata = as_metadata(json!({"fallback_reason": "parser_exception_empty"}));
        lines.push(line);
    }
    lines
}

fn fallback_order_raw(receipt_text: &str, order_id: Option<&str>, error: &str) -> OrderRawParsed {
    OrderRawParsed {
        source_text: receipt_text.to_string(),
        lines: fallback_raw_lines(receipt_text),
        order_id: order_id.map(str::to_string),
        parse_warnings: vec![format!("pipeline parser fallback: {error}")],
        needs_review: true,
        metadata: as_metadata(json!({
            "parse_errors": [error],
            "fallback_reason": "parser_exception",
        })),
        version: contract_version(),
    }
}

fn fallback_candidates(order_raw: &OrderRawParsed, error: &str) -> CandidatesByLine {
    let mut by_line = CandidatesByLine::new();
    for line in &order_raw.lines {
        by_line.insert(
            line.line_index,
            vec![CandidateItem {
                line_index: line.line_index,
                raw_line: line.raw_line.clone(),
                name_raw: line.name_raw.clone(),
                qty: line.qty.max(1),
                candidate_name: if line.name_raw.is_empty() {
                    "UNKNOWN_ITEM".to_string()
                } else {
                    line.name_raw.clone()
                },
                candidate_code: None,
                note_raw: line.note_raw.clone(),
                confidence_item: Some(0.0),
                needs_review: true,
                metadata: fallback_metadata("candidates_exception", error),
                version: contract_version(),
            }],
        );
    }
    by_line
}

fn fallback_structured(
    order_raw: &OrderRawParsed,
    candidates: &CandidatesByLine,
    error: &str,
) -> StructuredResult {
    let items: Vec<NormalizedItem> = order_raw
        .lines
        .iter()
        .map(|line| {
            let top = candidates.get(&line.line_index).and_then(|list| list.first());
            NormalizedItem {
                line_index: line.line_index,
                raw_line: line.raw_line.clone(),
                name_raw: line.name_raw.clone(),
                qty: line.qty.max(1),
                name_normalized: top
                    .map(|c| c.candidate_name.clone())
                    .unwrap_or_else(|| {
                        if line.name_raw.is_empty() {
                            "UNKNOWN_ITEM".to_string()
                        } else {
                            line.name_raw.clone()
                        }
                    }),
                item_code: top.and_then(|c| c.candidate_code.clone()),
                note_raw: line.note_raw.clone(),
                mods: Vec::new(),
                group_id: None,
                confidence_item: Some(0.0),
                confidence_mods: Some(0.0),
                needs_review: true,
                metadata: fallback_metadata("structured_exception", error),
                version: contract_version(),
            }
        })
        .collect();

    StructuredResult {
        items,
        groups: Vec::new(),
        audit_events: vec![AuditEvent {
            event_type: "pipeline_structured_fallback".to_string(),
            message: "Structured stage failed, fallback generated".to_string(),
            line_index: None,
            item_index: None,
            metadata: as_metadata(json!({"error": error})),
            version: contract_version(),
        }],
        metadata: fallback_metadata("structured_exception", error),
        version: contract_version(),
    }
}

fn fallback_merged(
    order_raw: &OrderRawParsed,
    structured: &StructuredResult,
    error: &str,
) -> OrderNormalized {
    let mut safe_items: Vec<NormalizedItem> = structured
        .items
        .iter()
        .map(|item| {
            let mut safe = item.clone();
            safe.needs_review = true;
            safe.metadata.insert("fallback_reason".to_string(), json!("merge_exception"));
            safe.metadata.insert("error".to_string(), json!(error));
            safe
        })
        .collect();
    if safe_items.is_empty() {
        safe_items = order_raw
            .lines
            .iter()
            .map(|line| NormalizedItem {
                line_index: line.line_index,
                raw_line: line.raw_line.clone(),
                name_raw: line.name_raw.clone(),
                qty: line.qty.max(1),
                name_normalized: if line.name_raw.is_empty() {
                    "UNKNOWN_ITEM".to_string()
                } else {
                    line.name_raw.clone()
                },
                item_code: None,
                note_raw: line.note_raw.clone(),
                mods: Vec::new(),
                group_id: None,
                confidence_item: Some(0.0),
                confidence_mods: Some(0.0),
                needs_review: true,
                metadata: fallback_metadata("merge_exception", error),
                version: contract_version(),
            })
            .collect();
    }

    let mut audit_events = structured.audit_events.clone();
    audit_events.push(AuditEvent {
        event_type: "pipeline_merge_fallback".to_string(),
        message: "Merge stage failed, fallback generated".to_string(),
        line_index: None,
        item_index: None,
        metadata: as_metadata(json!({"error": error})),
        version: contract_version(),
    });

    OrderNormalized {
        source_text: order_raw.source_text.clone(),
        items: safe_items,
        groups: Vec::new(),
        order_id: order_raw.order_id.clone(),
        lines: order_raw.lines.clone(),
        audit_events,
        overall_needs_review: true,
        order_confidence: None,
        metadata: fallback_metadata("merge_exception", error),
        version: contract_version(),
    }
}

/// Run the full ingest pipeline over one receipt text.
pub fn ingest_receipt(
    receipt_text: &str,
    order_id: Option<&str>,
    menu_catalog: &Value,
    allowed_mods: &[String],
    options: IngestOptions<'_>,
) -> IngestResponse {
    let mut errors: Vec<String> = Vec::new();
    let default_engine = PromptEngine::default();
    let prompt_engine = options.prompt_engine.unwrap_or(&default_engine);

    let env_client;
    let (llm_client, llm_runtime): (Option<&dyn LlmComplete>, LlmRuntime) =
        match options.llm_client {
            Some(client) => (Some(client), LlmRuntime::injected()),
            None => {
                let (client, runtime) = build_llm_client_from_env();
                env_client = client;
                (env_client.as_ref().map(|c| c as &dyn LlmComplete), runtime)
            }
        };
    let timeout_s = options
        .llm_timeout_s
        .filter(|value| *value > 0.0)
        .unwrap_or(llm_runtime.timeout_s_default);
    let timeout = Duration::from_secs_f64(timeout_s);
    info!(enabled = llm_runtime.enabled, timeout_s, "ingesting receipt");

    let mut order_raw = run_stage("parse", &mut errors, || parse_receipt_text(receipt_text))
        .unwrap_or_else(|| {
            fallback_order_raw(receipt_text, order_id, errors.last().unwrap())
        });
    order_raw.order_id = order_id.map(str::to_string);

    let candidates = run_stage("candidates", &mut errors, || {
        generate_candidates(&order_raw.lines, menu_catalog)
    })
    .unwrap_or_else(|| fallback_candidates(&order_raw, errors.last().unwrap()));

    let mut structured = run_stage("structured", &mut errors, || {
        llm_normalize_and_group(
            &order_raw,
            &candidates,
            allowed_mods,
            llm_client,
            timeout,
            prompt_engine,
        )
    })
    .unwrap_or_else(|| fallback_structured(&order_raw, &candidates, errors.last().unwrap()));
    structured
        .metadata
        .insert("llm_runtime".to_string(), serde_json::to_value(&llm_runtime).unwrap_or_default());
    structured.metadata.insert("llm_timeout_s".to_string(), json!(timeout_s));

    let mut merged = run_stage("merge", &mut errors, || {
        merge_and_validate(
            &order_raw,
            &candidates,
            &structured,
            Some(menu_catalog),
            Some(allowed_mods),
            Thresholds::default(),
        )
    })
    .unwrap_or_else(|| fallback_merged(&order_raw, &structured, errors.last().unwrap()));

    let accepted = errors.is_empty();
    if !accepted {
        merged.overall_needs_review = true;
        merged.metadata.insert("pipeline_errors".to_string(), json!(errors));
    }
    merged
        .metadata
        .insert("llm_runtime".to_string(), serde_json::to_value(&llm_runtime).unwrap_or_default());
    merged.metadata.insert("llm_timeout_s".to_string(), json!(timeout_s));

    let needs_review = order_raw.needs_review || merged.overall_needs_review || !accepted;
    IngestResponse {
        accepted,
        needs_review,
        errors,
        order_raw,
        candidates,
        structured,
        merged,
        llm_runtime,
        version: contract_version(),
    }
}
