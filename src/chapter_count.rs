//! Asking the model for a bare chapter number and parsing its answer.

use crate::gemini::{GenerateRequest, TextModel};
use crate::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChapterCount {
    pub count: u32,
    pub usage: Usage,
}

/// A failed count. `usage` holds whatever the model call already cost.
#[derive(Debug, thiserror::Error)]
#[error("{error:#}")]
pub struct CountError {
    pub usage: Usage,
    pub error: anyhow::Error,
}

pub fn planned_chapters_prompt(abstract_text: &str) -> String {
    format!(
        "Given the following complete story abstract (plan), please return ONLY the total number of chapters planned within it.\n\
Do not include any other text, explanation, or formatting. Just the pure number.\n\
If no chapters are explicitly outlined, return 0.\n\
\n\
--- Story Abstract ---\n\
{abstract_text}\n\
--- End Story Abstract ---\n"
    )
}

pub fn written_chapters_prompt(story_text: &str) -> String {
    format!(
        "Given the following story text, identify the number of the last *fully written* chapter.\n\
Look for chapter headers like '## Chapter X' (where X is the chapter number).\n\
Return ONLY the number.\n\
If no fully written chapters are found, or if the last detected chapter appears incomplete (e.g., ends abruptly or contains error messages), return 0.\n\
Do not include any other text, explanation, or formatting. Just the pure integer number.\n\
\n\
--- Existing Story Content ---\n\
{story_text}\n\
--- End Existing Story Content ---\n"
    )
}

/// Parses a model answer that should be a bare non-negative integer.
///
/// Only the first line of the trimmed answer is considered.
pub fn parse_count(answer: &str) -> anyhow::Result<u32> {
    let first_line = answer.trim().lines().next().unwrap_or("").trim();
    first_line
        .parse::<u32>()
        .map_err(|err| anyhow::anyhow!("could not parse chapter count {first_line:?}: {err}"))
}

pub fn ask(model: &dyn TextModel, prompt: String) -> Result<ChapterCount, CountError> {
    let result = model
        .generate(&GenerateRequest::new(prompt))
        .map_err(|err| CountError {
            usage: Usage::default(),
            error: anyhow::Error::new(err).context("ask model for chapter count"),
        })?;
    let usage = Usage::from(&result);

    let count = parse_count(&result.text).map_err(|error| CountError { usage, error })?;
    Ok(ChapterCount { count, usage })
}
