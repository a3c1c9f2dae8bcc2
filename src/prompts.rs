//! Prompt template for the normalize-and-group call.
//!
//! The default template is embedded; a file path can override it. Rendering
//! substitutes three JSON payloads; values are inserted verbatim and never
//! re-parsed as template syntax.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DEFAULT_NORMALIZE_GROUP: &str = include_str!("default_prompts/normalize_group.md");

/// Loads and renders the normalize-and-group prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptEngine {
    override_path: Option<PathBuf>,
}

impl PromptEngine {
    pub fn new(override_path: Option<&Path>) -> Self {
        Self { override_path: override_path.map(Path::to_path_buf) }
    }

    /// Load the template text. An override path must be readable; the
    /// embedded default cannot fail.
    pub fn load_template(&self) -> Result<String> {
        if let Some(path) = &self.override_path {
            return std::fs::read_to_string(path).map_err(|e| {
                Error::Prompt(format!("failed to read prompt template {}: {e}", path.display()))
            });
        }
        Ok(DEFAULT_NORMALIZE_GROUP.to_string())
    }

    /// Render the template with the three JSON payload strings.
    pub fn render(
        &self,
        allowed_mods_json: &str,
        order_lines_json: &str,
        step1_hints_json: &str,
    ) -> Result<String> {
        let template = self.load_template()?;
        render_template(&template, allowed_mods_json, order_lines_json, step1_hints_json)
    }
}

/// Render a template string using the `upon` engine. The placeholders are
/// `{{ALLOWED_MODS_JSON}}`, `{{ORDER_LINES_JSON}}`, `{{STEP1_HINTS_JSON}}`;
/// single braces (literal JSON in the template body) pass through.
pub fn render_template(
    template: &str,
    allowed_mods_json: &str,
    order_lines_json: &str,
    step1_hints_json: &str,
) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::value! {
                ALLOWED_MODS_JSON: allowed_mods_json,
                ORDER_LINES_JSON: order_lines_json,
                STEP1_HINTS_JSON: step1_hints_json,
            },
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}
