//! Binary tests for the ingest CLI protocol: JSON object on stdin,
//! `{ok, result|error}` envelope on stdout, exit code 0/1.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

fn posnorm() -> Command {
    let mut cmd = Command::cargo_bin("posnorm").unwrap();
    // Keep the subprocess off the network regardless of ambient env.
    cmd.env("POS_LLM_ENABLED", "false");
    cmd
}

fn payload() -> Value {
    json!({
        "receipt_text": "招牌鍋貼 x2\n酸辣湯 x1",
        "order_id": "O-100",
        "menu_catalog": {"I001": ["招牌鍋貼"], "I007": ["酸辣湯"]},
        "allowed_mods": ["加辣"],
    })
}

fn run_ok(cmd: &mut Command, input: String) -> Value {
    let output = cmd.write_stdin(input).assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.ends_with('\n'), "output must end with a newline");
    serde_json::from_str(&text).unwrap()
}

#[test]
fn ingest_happy_path_emits_result_envelope() {
    let envelope = run_ok(&mut posnorm(), payload().to_string());
    assert_eq!(envelope["ok"], true);
    let result = &envelope["result"];
    assert_eq!(result["accepted"], true);
    assert_eq!(result["merged"]["order_id"], "O-100");
    assert_eq!(result["merged"]["items"].as_array().unwrap().len(), 2);
    assert_eq!(result["merged"]["items"][0]["item_code"], "I001");
    // Without an LLM the order routes to the review queue.
    assert_eq!(
        result["merged"]["metadata"]["dispatch_decision"]["route"],
        "review-queue"
    );
    assert_eq!(result["needs_review"], true);
}

#[test]
fn alternative_text_keys_are_accepted() {
    for key in ["source_text", "text"] {
        let mut input = json!({"menu_catalog": {"I001": ["招牌鍋貼"]}});
        input[key] = json!("招牌鍋貼 x1");
        let envelope = run_ok(&mut posnorm(), input.to_string());
        assert_eq!(envelope["ok"], true);
        assert_eq!(envelope["result"]["merged"]["items"].as_array().unwrap().len(), 1);
    }
}

#[test]
fn empty_stdin_fails_with_error_envelope() {
    posnorm()
        .write_stdin("")
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""ok":false"#))
        .stdout(predicate::str::contains("stdin payload is empty"));
}

#[test]
fn non_object_payload_fails() {
    posnorm()
        .write_stdin("[1, 2, 3]")
        .assert()
        .failure()
        .stdout(predicate::str::contains("payload must be a JSON object"));
}

#[test]
fn invalid_json_fails_with_json_error_type() {
    let output = posnorm().write_stdin("{not json").assert().failure().get_output().stdout.clone();
    let envelope: Value = serde_json::from_str(&String::from_utf8(output).unwrap()).unwrap();
    assert_eq!(envelope["ok"], false);
    assert_eq!(envelope["error"]["type"], "json");
    assert!(envelope["error"]["message"].is_string());
    assert!(envelope["error"]["traceback"].is_string());
}

#[test]
fn order_id_flag_overrides_payload() {
    let envelope = run_ok(posnorm().arg("--order-id").arg("O-override"), payload().to_string());
    assert_eq!(envelope["result"]["merged"]["order_id"], "O-override");
}

#[test]
fn missing_catalog_defaults_to_empty() {
    let envelope =
        run_ok(&mut posnorm(), json!({"receipt_text": "招牌鍋貼 x1"}).to_string());
    assert_eq!(envelope["ok"], true);
    let items = envelope["result"]["merged"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0]["item_code"].is_null());
}

#[test]
fn pretty_flag_renders_indented_json() {
    posnorm()
        .arg("--pretty")
        .write_stdin(payload().to_string())
        .assert()
        .success()
        .stdout(predicate::str::starts_with("{\n"));
}

#[test]
fn audit_log_flag_appends_ingest_event() {
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.log.jsonl");

    let envelope = run_ok(
        posnorm().arg("--audit-log").arg(&audit_path),
        payload().to_string(),
    );
    assert_eq!(envelope["ok"], true);

    let content = std::fs::read_to_string(&audit_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let event: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(event["order_id"], "O-100");
    assert_eq!(event["event_type"], "ingest");
    assert_eq!(event["raw_text"], "招牌鍋貼 x2\n酸辣湯 x1");
    assert_eq!(event["fallback_reason"], "llm_client_missing");
    assert_eq!(event["needs_review"], true);
    assert!(event["final_output"]["merged"].is_object());
}

#[test]
fn prompt_override_file_is_used() {
    let dir = TempDir::new().unwrap();
    let prompt_path = dir.path().join("normalize_group.md");
    std::fs::write(
        &prompt_path,
        "{{ALLOWED_MODS_JSON}} {{ORDER_LINES_JSON}} {{STEP1_HINTS_JSON}}",
    )
    .unwrap();

    // The override only matters when a client renders it; without one the
    // run still succeeds and falls back.
    let envelope = run_ok(
        posnorm().arg("--prompt").arg(&prompt_path),
        payload().to_string(),
    );
    assert_eq!(envelope["ok"], true);
}

#[test]
fn unreadable_prompt_override_still_produces_envelope() {
    // A missing override file is only consulted when the LLM stage runs a
    // client; with the LLM disabled the pipeline must still answer.
    let envelope = run_ok(
        posnorm().arg("--prompt").arg("/nonexistent/prompt.md"),
        payload().to_string(),
    );
    assert_eq!(envelope["ok"], true);
    assert_eq!(envelope["result"]["accepted"], true);
}
