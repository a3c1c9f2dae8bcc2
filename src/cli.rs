use clap::Parser;

/// posnorm — normalize dirty POS receipt text into a structured order.
///
/// Reads a JSON object on stdin (`receipt_text`, optional `order_id`,
/// `menu_catalog`, `allowed_mods`) and writes the result envelope to
/// stdout.
#[derive(Parser, Debug)]
#[command(name = "posnorm", version, about)]
pub struct Cli {
    /// Pretty-print the response JSON
    #[arg(long)]
    pub pretty: bool,

    /// Override the payload's order_id
    #[arg(long)]
    pub order_id: Option<String>,

    /// Path to a prompt template overriding the embedded default
    #[arg(long)]
    pub prompt: Option<String>,

    /// Append an ingest event to this audit log file
    #[arg(long)]
    pub audit_log: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["posnorm"]);
        assert!(!cli.pretty);
        assert!(cli.order_id.is_none());
        assert!(cli.prompt.is_none());
        assert!(cli.audit_log.is_none());
    }

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::parse_from([
            "posnorm",
            "--pretty",
            "--order-id",
            "O-42",
            "--prompt",
            "/tmp/prompt.md",
            "--audit-log",
            "/tmp/audit.jsonl",
        ]);
        assert!(cli.pretty);
        assert_eq!(cli.order_id.as_deref(), Some("O-42"));
        assert_eq!(cli.prompt.as_deref(), Some("/tmp/prompt.md"));
        assert_eq!(cli.audit_log.as_deref(), Some("/tmp/audit.jsonl"));
    }
}
