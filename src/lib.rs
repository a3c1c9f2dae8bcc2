//! Normalizes free-form point-of-sale receipt text into a structured,
//! review-flagged order.
//!
//! The ingest pipeline runs four stages in order: parse dirty text into
//! raw lines, rank catalog candidates per line, ask a language model to
//! normalize and group (degrading to rule-based output on any failure),
//! then merge and validate against the parser's ground truth. A TTL cache
//! and an append-only audit log support the pipeline from the side.

pub mod audit;
pub mod cache;
pub mod candidates;
pub mod contracts;
pub mod error;
pub mod llm_client;
pub mod llm_stage;
pub mod merge;
pub mod parser;
pub mod pipeline;
pub mod prompts;

pub use contracts::{
    AuditEvent, CandidateItem, CandidatesByLine, CatalogEntry, GroupResult, GroupType, Metadata,
    Mod, NormalizedItem, OrderNormalized, OrderRawParsed, RawLine, StructuredResult,
    CONTRACT_VERSION,
};
pub use error::{Error, Result};
pub use pipeline::{IngestOptions, IngestResponse, ingest_receipt};
