//! Splits a custom node definition into its markup and logic blocks.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CompileError;

lazy_static! {
    static ref TEMPLATE_BLOCK_REGEX: Regex =
        Regex::new(r"(?is)<template\b[^>]*>(.*?)</template\s*>").unwrap();
    static ref SCRIPT_BLOCK_REGEX: Regex =
        Regex::new(r"(?is)<script\b[^>]*>(.*?)</script\s*>").unwrap();
    // A script opener, terminated or not, rules out the plain-markup fallback.
    static ref SCRIPT_OPENER_REGEX: Regex = Regex::new(r"(?i)<script").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedBlocks {
    pub markup: String,
    pub logic: String,
}

fn first_block(regex: &Regex, raw: &str) -> Option<String> {
    regex
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Extracts the first `<template>` and first `<script>` block.
///
/// Text with neither complete block and no `<script` opener is treated as
/// plain markup, so stray or unterminated `<template>` tags stay markup.
pub fn extract(raw: &str) -> Result<ExtractedBlocks, CompileError> {
    let logic = first_block(&SCRIPT_BLOCK_REGEX, raw);
    let template = first_block(&TEMPLATE_BLOCK_REGEX, raw);

    if template.is_none() && logic.is_none() && !SCRIPT_OPENER_REGEX.is_match(raw) {
        let markup = raw.trim();
        if markup.is_empty() {
            return Err(CompileError::missing_markup("the definition is empty"));
        }
        debug!(mode = "fallback", "definition has no complete blocks, using it as markup");
        return Ok(ExtractedBlocks {
            markup: markup.to_string(),
            logic: String::new(),
        });
    }

    let markup = match template {
        Some(markup) if markup.is_empty() => {
            return Err(CompileError::missing_markup("the <template> block is empty"));
        }
        Some(markup) => markup,
        None if logic.is_some() => {
            return Err(CompileError::missing_markup(
                "a <script> block was found without a <template> block",
            ));
        }
        None => {
            return Err(CompileError::missing_markup(
                "an unterminated <script> block was found without a <template> block",
            ));
        }
    };

    debug!(
        mode = "blocks",
        markup_len = markup.len(),
        logic_len = logic.as_ref().map_or(0, String::len),
        "extracted definition blocks"
    );
    Ok(ExtractedBlocks {
        markup,
        logic: logic.unwrap_or_default(),
    })
}
