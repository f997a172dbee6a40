use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a usage record or conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planner,
    Generator,
    Validator,
    Sandbox,
    System,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentKind::Planner => "planner",
            AgentKind::Generator => "generator",
            AgentKind::Validator => "validator",
            AgentKind::Sandbox => "sandbox",
            AgentKind::System => "system",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Input,
    Output,
    Status,
    Sandbox,
    Error,
}

/// One line of `.tumbler/conversation.jsonl`. Entries are appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: AgentKind,
    pub role: Role,
    pub iteration: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ConversationEntry {
    pub fn new(agent: AgentKind, role: Role, iteration: u32, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            agent,
            role,
            iteration,
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
