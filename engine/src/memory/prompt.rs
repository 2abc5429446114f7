//! Prompt rendering
//!
//! Turns a [`ContextWindow`] into the text block handed to the agent. The
//! output depends on the window alone, so the same window always renders to
//! the same string.

use sdk::types::ContextWindow;

/// Label of the summary block
pub const SUMMARY_LABEL: &str = "Previous conversation summary:";

/// Label of the recent-turns block
pub const TURNS_LABEL: &str = "Recent messages:";

/// Optional display caps, in characters
///
/// Each cap keeps the end of its block, since the newest material matters
/// most. Unset caps leave the text whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptLimits {
    pub max_summary_chars: Option<usize>,
    pub max_turns_chars: Option<usize>,
    pub max_total_chars: Option<usize>,
}

impl PromptLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_summary_chars.is_none()
            && self.max_turns_chars.is_none()
            && self.max_total_chars.is_none()
    }
}

/// Render a window with no caps
///
/// An empty window renders to the empty string. Otherwise the summary block
/// (if any) precedes the recent-turns block (if any), separated by a blank
/// line. Each turn is one `"<role>: <content>"` line.
pub fn build_prompt(window: &ContextWindow) -> String {
    render(window, &PromptLimits::default())
}

/// Render a window, applying display caps
pub fn render(window: &ContextWindow, limits: &PromptLimits) -> String {
    let mut blocks: Vec<String> = Vec::with_capacity(2);

    if let Some(summary) = window.summary() {
        let summary = keep_tail(summary, limits.max_summary_chars);
        blocks.push(format!("{}\n{}", SUMMARY_LABEL, summary));
    }

    if !window.turns.is_empty() {
        let lines = window
            .turns
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = keep_tail(&lines, limits.max_turns_chars);
        blocks.push(format!("{}\n{}", TURNS_LABEL, lines));
    }

    let prompt = blocks.join("\n\n");
    keep_tail(&prompt, limits.max_total_chars).to_string()
}

/// Last `max` characters of `text`, cut on a character boundary
fn keep_tail(text: &str, max: Option<usize>) -> &str {
    let Some(max) = max else {
        return text;
    };

    let len = text.chars().count();
    if len <= max {
        return text;
    }

    match text.char_indices().nth(len - max) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}
