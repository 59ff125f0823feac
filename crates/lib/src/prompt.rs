//! System prompt loader: read the agent's system prompt from the configured file.
//!
//! A missing or empty file is not fatal; the built-in prompt is used instead.

use std::fs;
use std::path::Path;

/// Prompt used when no system prompt file is available.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../config/system-prompt.txt");

/// Load the system prompt from `path`, trimmed.
///
/// Falls back to [`DEFAULT_SYSTEM_PROMPT`] when the file is missing or blank.
pub fn load_system_prompt(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
        Ok(_) => {
            log::warn!("system prompt file {} is empty, using default prompt", path.display());
            DEFAULT_SYSTEM_PROMPT.trim().to_string()
        }
        Err(e) => {
            log::warn!(
                "system prompt file {} not readable ({}), using default prompt",
                path.display(),
                e
            );
            DEFAULT_SYSTEM_PROMPT.trim().to_string()
        }
    }
}
