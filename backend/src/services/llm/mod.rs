//! LLM Service Module
//!
//! Thin seam between the pipeline and OpenAI-compatible providers. Two
//! operations exist: per-event scoring and window meta-analysis. Everything
//! else (prompt assembly, config resolution, usage accounting) happens in
//! the calling services.

mod client;
mod models;
mod prompts;
mod service;

pub use models::*;
pub use prompts::{DEFAULT_META_PROMPT, build_scoring_prompt, default_guideline};
pub use service::{LlmService, LlmServiceImpl, MetaOptions, ScoreOptions};

#[allow(unused_imports)]
pub(crate) use client::{LlmClient, parse_lenient_json};
