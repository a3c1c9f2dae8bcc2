mod cli;

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use serde_json::{Value, json};
use tracing::info;

use posnorm::audit::AuditLogger;
use posnorm::error::{Error, Result};
use posnorm::pipeline::{IngestOptions, ingest_receipt};
use posnorm::prompts::PromptEngine;

use crate::cli::Cli;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_stdin_payload() -> Result<Value> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Err(Error::Payload("stdin payload is empty".to_string()));
    }
    let payload: Value = serde_json::from_str(&raw)?;
    if !payload.is_object() {
        return Err(Error::Payload("payload must be a JSON object".to_string()));
    }
    Ok(payload)
}

fn payload_order_id(payload: &Value) -> Option<String> {
    match payload.get("order_id") {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn run(cli: &Cli) -> Result<Value> {
    let payload = read_stdin_payload()?;

    let receipt_text = ["receipt_text", "source_text", "text"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .unwrap_or("");

    let order_id = cli.order_id.clone().or_else(|| payload_order_id(&payload));
    let menu_catalog = payload.get("menu_catalog").cloned().unwrap_or_else(|| json!([]));
    let allowed_mods: Vec<String> = payload
        .get("allowed_mods")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let prompt_engine = PromptEngine::new(cli.prompt.as_deref().map(Path::new));
    let response = ingest_receipt(
        receipt_text,
        order_id.as_deref(),
        &menu_catalog,
        &allowed_mods,
        IngestOptions { prompt_engine: Some(&prompt_engine), ..Default::default() },
    );
    let result = serde_json::to_value(&response)?;

    if let Some(audit_path) = &cli.audit_log {
        let logger = AuditLogger::new(audit_path)?;
        logger.write_event(&json!({
            "order_id": order_id.as_deref().unwrap_or("unknown_order"),
            "event_type": "ingest",
            "raw_text": receipt_text,
            "fallback_reason": result["structured"]["metadata"]["fallback_reason"],
            "final_output": result,
            "needs_review": response.needs_review,
        }))?;
        info!(%audit_path, "ingest event appended");
    }

    Ok(result)
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();
    while let Some(inner) = source {
        chain.push(inner.to_string());
        source = inner.source();
    }
    chain.join(" <- ")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(&cli) {
        Ok(result) => {
            let envelope = json!({"ok": true, "result": result});
            let rendered = if cli.pretty {
                serde_json::to_string_pretty(&envelope)
            } else {
                serde_json::to_string(&envelope)
            }
            .expect("response envelope serializes");
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            let envelope = json!({
                "ok": false,
                "error": {
                    "type": error.kind(),
                    "message": error.to_string(),
                    "traceback": error_chain(&error),
                },
            });
            println!("{envelope}");
            ExitCode::FAILURE
        }
    }
}
