//! Flatten a chat transcript into the `prompt` / `system_prompt` pair that the
//! any-llm endpoint accepts.
//!
//! Two strategies share the same per-turn rendering:
//! - `SimpleAssembler` concatenates every turn into the user prompt, unbounded.
//! - `BudgetedAssembler` normalizes whitespace and fits the transcript into two
//!   strings under a character budget, dropping the oldest history first.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::directives::{FeatureSet, RoleLabels};
use crate::models::ChatMessage;

/// Marker that suppresses the role prefix for the turn it appears in.
pub const REMOVE_ROLE_MARKER: &str = "<|removeRole|>";

/// Control character placed before each role label.
const ROLE_PREFIX: char = '\u{8}';

pub const DEFAULT_PROMPT_CHAR_LIMIT: usize = 4800;

static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").expect("newline pattern"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("{which} prompt is {len} characters, limit is {limit}")]
    TooLong {
        which: &'static str,
        len: usize,
        limit: usize,
    },
}

/// The prompt pair sent to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptBundle {
    pub system_prompt: String,
    pub user_prompt: String,
}

pub trait PromptAssembler: Send + Sync {
    fn assemble(
        &self,
        messages: &[ChatMessage],
        features: &FeatureSet,
    ) -> Result<PromptBundle, PromptError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PromptStrategy {
    Simple,
    Budgeted,
}

impl PromptStrategy {
    pub fn build(self, limit: usize) -> Arc<dyn PromptAssembler> {
        match self {
            PromptStrategy::Simple => Arc::new(SimpleAssembler),
            PromptStrategy::Budgeted => Arc::new(BudgetedAssembler::new(limit)),
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Image uploads are not supported by the backend; the reference resolves to
/// an empty placeholder so generation continues without it.
pub fn process_upload(src: &str) -> String {
    tracing::warn!("Unsupported upload: {}", src);
    String::new()
}

/// Render each text fragment of `message` as one labelled (or raw) turn.
fn render_turns(message: &ChatMessage, roles: &RoleLabels) -> Vec<String> {
    for url in message.content.image_urls() {
        let _placeholder = process_upload(url);
    }

    message
        .content
        .text_parts()
        .into_iter()
        .map(|text| {
            if text.contains(REMOVE_ROLE_MARKER) {
                text.replace(&format!("{REMOVE_ROLE_MARKER}\n"), "")
                    .replace(REMOVE_ROLE_MARKER, "")
            } else {
                format!("{ROLE_PREFIX}{}: {}", roles.label_for(&message.role), text)
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleAssembler;

impl PromptAssembler for SimpleAssembler {
    fn assemble(
        &self,
        messages: &[ChatMessage],
        features: &FeatureSet,
    ) -> Result<PromptBundle, PromptError> {
        let mut prompt = String::new();
        for message in messages {
            for turn in render_turns(message, &features.roles) {
                prompt.push_str(&turn);
                prompt.push_str("\n\n");
            }
        }
        Ok(PromptBundle {
            system_prompt: features.system_prompt.clone(),
            user_prompt: prompt,
        })
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetedAssembler {
    limit: usize,
}

impl BudgetedAssembler {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// One normalized block per message, each line trimmed, ending in `\n`.
    fn render_block(message: &ChatMessage, roles: &RoleLabels) -> String {
        let mut block = String::new();
        for turn in render_turns(message, roles) {
            let collapsed = NEWLINE_RUNS.replace_all(&turn, "\n");
            let lines: Vec<&str> = collapsed
                .split('\n')
                .map(|line| line.trim_matches(|c| c == ' ' || c == '\u{3000}'))
                .collect();
            block.push_str(&lines.join("\n"));
            block.push('\n');
        }
        block
    }

    fn check(&self, which: &'static str, prompt: &str) -> Result<(), PromptError> {
        let len = char_len(prompt);
        if len >= self.limit {
            return Err(PromptError::TooLong {
                which,
                len,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

impl PromptAssembler for BudgetedAssembler {
    fn assemble(
        &self,
        messages: &[ChatMessage],
        features: &FeatureSet,
    ) -> Result<PromptBundle, PromptError> {
        let blocks: Vec<String> = messages
            .iter()
            .map(|m| Self::render_block(m, &features.roles))
            .collect();

        let mut head = features.system_prompt.clone();
        if !head.is_empty() && !head.ends_with('\n') {
            head.push('\n');
        }
        let rest: &[String] = match blocks.split_first() {
            Some((first, rest)) => {
                head.push_str(first);
                rest
            }
            None => &[],
        };
        let head_len = char_len(&head);

        let mut recent: Vec<&str> = Vec::new();
        let mut recent_len = 0;
        let mut history: Vec<&str> = Vec::new();
        let mut history_len = 0;
        let mut filling_recent = true;

        for (pos, block) in rest.iter().enumerate().rev() {
            let len = char_len(block);
            if filling_recent {
                if recent.is_empty() || head_len + recent_len + len < self.limit {
                    recent.push(block);
                    recent_len += len;
                    continue;
                }
                filling_recent = false;
            }
            if head_len + history_len + len < self.limit {
                history.push(block);
                history_len += len;
            } else {
                tracing::debug!(
                    dropped = pos + 1,
                    "prompt budget exhausted; trimming oldest history"
                );
                break;
            }
        }

        recent.reverse();
        history.reverse();
        let bundle = PromptBundle {
            system_prompt: head + &history.concat(),
            user_prompt: recent.concat(),
        };
        self.check("system", &bundle.system_prompt)?;
        self.check("user", &bundle.user_prompt)?;
        Ok(bundle)
    }

    fn name(&self) -> &'static str {
        "budgeted"
    }
}
