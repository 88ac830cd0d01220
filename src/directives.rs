//! In-band directives carried by the first chat message.
//!
//! Clients that cannot send extra request fields steer the proxy through text:
//! a `<roleInfo>` block renames the role labels used when the conversation is
//! flattened into a prompt, and feature flag tokens switch optional behaviour
//! on. Both are stripped before the text reaches the backend.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{ChatMessage, MessageContent};

pub const ROLE_INFO_START: &str = "<roleInfo>";
pub const ROLE_INFO_END: &str = "</roleInfo>";

static ROLE_INFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"{}([\s\S]*){}",
        regex::escape(ROLE_INFO_START),
        regex::escape(ROLE_INFO_END)
    ))
    .expect("roleInfo pattern")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("malformed roleInfo line (expected `key: value`): {0:?}")]
    MalformedLine(String),
}

/// Display labels used when rendering each role into the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleLabels {
    pub user: String,
    pub assistant: String,
    pub system: String,
    pub developer: String,
}

impl Default for RoleLabels {
    fn default() -> Self {
        Self {
            user: "Human".to_string(),
            assistant: "Assistant".to_string(),
            system: "System".to_string(),
            developer: "System".to_string(),
        }
    }
}

impl RoleLabels {
    /// Label for `role` (case-insensitive); unknown roles use the system label.
    pub fn label_for(&self, role: &str) -> &str {
        match role.to_lowercase().as_str() {
            "user" => &self.user,
            "assistant" => &self.assistant,
            "system" => &self.system,
            "developer" => &self.developer,
            _ => &self.system,
        }
    }
}

/// Per-role overrides parsed from a `<roleInfo>` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleOverrides {
    pub user: Option<String>,
    pub assistant: Option<String>,
    pub system: Option<String>,
    pub developer: Option<String>,
}

impl RoleOverrides {
    /// Parse newline separated `key: value` pairs. Unknown keys are ignored.
    pub fn parse(body: &str) -> Result<Self, DirectiveError> {
        let mut overrides = Self::default();
        for line in body.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| DirectiveError::MalformedLine(line.to_string()))?;
            let value = Some(value.trim().to_string());
            match key.trim().to_lowercase().as_str() {
                "user" => overrides.user = value,
                "assistant" => overrides.assistant = value,
                "system" => overrides.system = value,
                "developer" => overrides.developer = value,
                other => tracing::debug!("ignoring unknown roleInfo key {:?}", other),
            }
        }
        Ok(overrides)
    }

    pub fn apply(self, labels: &mut RoleLabels) {
        if let Some(v) = self.user {
            labels.user = v;
        }
        if let Some(v) = self.assistant {
            labels.assistant = v;
        }
        if let Some(v) = self.system {
            labels.system = v;
        }
        if let Some(v) = self.developer {
            labels.developer = v;
        }
    }
}

/// Literal tokens recognised anywhere in the first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFlag {
    /// Show the model's reasoning wrapped in `<thinking>` markers.
    Reasoning,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 1] = [FeatureFlag::Reasoning];

    pub fn token(self) -> &'static str {
        match self {
            FeatureFlag::Reasoning => "<|reasoning|>",
        }
    }
}

/// Everything extracted from the first message of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub roles: RoleLabels,
    pub system_prompt: String,
    pub flags: HashMap<FeatureFlag, bool>,
}

impl FeatureSet {
    pub fn is_enabled(&self, flag: FeatureFlag) -> bool {
        self.flags.get(&flag).copied().unwrap_or(false)
    }
}

/// Pull the `<roleInfo>` block out of `content`.
///
/// Returns default labels and the untouched text when no block is present.
pub fn extract_role_info(content: &str) -> Result<(RoleLabels, String), DirectiveError> {
    let mut labels = RoleLabels::default();
    match ROLE_INFO_RE.captures(content) {
        Some(caps) => {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            RoleOverrides::parse(body)?.apply(&mut labels);
            Ok((labels, ROLE_INFO_RE.replace_all(content, "").into_owned()))
        }
        None => Ok((labels, content.to_string())),
    }
}

/// Remove every occurrence of `token` (and one newline right after it).
pub fn strip_token(content: &str, token: &str) -> (bool, String) {
    if !content.contains(token) {
        return (false, content.to_string());
    }
    let stripped = content
        .replace(&format!("{token}\n"), "")
        .replace(token, "");
    (true, stripped)
}

/// Consume directives from `messages[0]`.
///
/// A leading `system` message is removed and becomes the system prompt; any
/// other leading message has its content rewritten without the directives.
pub fn extract_features(messages: &mut Vec<ChatMessage>) -> Result<FeatureSet, DirectiveError> {
    let mut features = FeatureSet::default();
    let Some(first) = messages.first_mut() else {
        return Ok(features);
    };

    let cleaned = match &first.content {
        MessageContent::Text(text) => {
            let (roles, mut text) = extract_role_info(text)?;
            features.roles = roles;
            for flag in FeatureFlag::ALL {
                let (on, rest) = strip_token(&text, flag.token());
                features.flags.insert(flag, on);
                text = rest;
            }
            Some(text)
        }
        MessageContent::Parts(_) => None,
    };

    if first.role == "system" {
        features.system_prompt = match cleaned {
            Some(text) => text,
            None => first.content.text_parts().join("\n"),
        };
        messages.remove(0);
    } else if let Some(text) = cleaned {
        first.content = MessageContent::Text(text);
    }

    Ok(features)
}
