//! Upstream AI layer for the summarization queue.
//!
//! This crate stays storage-agnostic: it defines the `Generator` seam the
//! router dispatches through, the error-kind taxonomy that drives provider
//! backoff, an HTTP implementation speaking the OpenAI-compatible chat
//! completions API, and the pure helpers for prompt assembly and content
//! extraction. Queue wiring lives in `briefly-infra`.

pub mod extract;
pub mod generate;
pub mod http;
pub mod prompt;

pub use extract::{extract_content, ExtractedContent};
pub use generate::{
    ErrorKind, GenerateError, Generator, GeneratorFactory, ScriptedGenerator,
    StaticGeneratorFactory,
};
pub use http::{HttpGenerator, HttpGeneratorFactory};
pub use prompt::{build_prompt, token_budget, SUMMARY_PREAMBLE};
