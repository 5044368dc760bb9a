//! Content extraction from submitted payloads.
//!
//! Payloads are JSON objects carrying either a flat `content` string or a
//! `blocks` array produced by an upstream cleaner. Blocks tagged as page
//! furniture (`nav`, `header`, `footer`, `aside`, `boilerplate`) count
//! toward the total but are excluded from the text handed to the model.

use serde_json::Value;

const FURNITURE_KINDS: &[&str] = &["nav", "header", "footer", "aside", "boilerplate"];

/// Result of extracting summarizable text from a payload.
///
/// The word counts feed the callback metadata verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub text: String,
    pub content_blocks: usize,
    pub total_words: usize,
    pub main_content_words: usize,
}

impl ExtractedContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Extract summarizable text and word statistics from a job payload.
pub fn extract_content(payload: &Value) -> ExtractedContent {
    let mut blocks: Vec<(String, bool)> = Vec::new();

    if let Some(title) = payload.get("title").and_then(Value::as_str) {
        if !title.trim().is_empty() {
            blocks.push((title.trim().to_string(), true));
        }
    }

    match payload.get("blocks").and_then(Value::as_array) {
        Some(items) => {
            for item in items {
                if let Some((text, main)) = block_text(item) {
                    blocks.push((text, main));
                }
            }
        }
        None => {
            if let Some(content) = payload.get("content").and_then(Value::as_str) {
                if !content.trim().is_empty() {
                    blocks.push((content.trim().to_string(), true));
                }
            }
        }
    }

    let content_blocks = blocks.len();
    let total_words: usize = blocks.iter().map(|(text, _)| word_count(text)).sum();
    let main_content_words: usize = blocks
        .iter()
        .filter(|(_, main)| *main)
        .map(|(text, _)| word_count(text))
        .sum();

    let text = blocks
        .iter()
        .filter(|(_, main)| *main)
        .map(|(text, _)| text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    ExtractedContent {
        text,
        content_blocks,
        total_words,
        main_content_words,
    }
}

fn block_text(item: &Value) -> Option<(String, bool)> {
    match item {
        Value::String(s) if !s.trim().is_empty() => Some((s.trim().to_string(), true)),
        Value::Object(obj) => {
            let text = obj.get("text").and_then(Value::as_str)?.trim();
            if text.is_empty() {
                return None;
            }
            let main = obj
                .get("kind")
                .and_then(Value::as_str)
                .map(|kind| !FURNITURE_KINDS.contains(&kind))
                .unwrap_or(true);
            Some((text.to_string(), main))
        }
        _ => None,
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
