//! Operator message to engine prompt conversion

use crate::protocol::UserMessage;

/// Instruction placed in front of the prompt when files are attached
const FILES_PREAMBLE: &str =
    "The user provided the following files; use the Read tool to read and process them:";

/// Prompt converter
///
/// Turns a `user_message` into the text submitted to the engine. Attached
/// files are not inlined; the engine is told to read them itself.
#[derive(Debug, Default)]
pub struct PromptConverter;

impl PromptConverter {
    pub fn new() -> Self {
        Self
    }

    /// Build the prompt for one operator message
    pub fn convert(&self, message: &UserMessage) -> String {
        build_query_content(&message.content, message.attachments())
    }
}

/// Prompt text for `content` with `file_paths` attached
pub fn build_query_content(content: &str, file_paths: &[String]) -> String {
    let paths: Vec<&str> = file_paths
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    if paths.is_empty() {
        return content.to_string();
    }

    let mut prompt = String::from(FILES_PREAMBLE);
    prompt.push('\n');
    for path in paths {
        prompt.push_str("- ");
        prompt.push_str(path);
        prompt.push('\n');
    }
    if !content.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(content);
    }
    prompt
}
