use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::AgentKind;

/// One collaborator call's token and cost accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub agent: AgentKind,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<serde_json::Value>,
}

impl UsageRecord {
    pub fn new(agent: AgentKind, input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            agent,
            input_tokens,
            output_tokens,
            cost,
            compression: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub tokens: u64,
    pub cost: f64,
    pub calls: u64,
}

/// The usage document (`.tumbler/usage.json`).
///
/// Totals are accumulated as records are appended; history is never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageLedger {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_agent: BTreeMap<String, AgentUsage>,
    pub history: Vec<UsageRecord>,
}

impl UsageLedger {
    pub fn record(&mut self, record: UsageRecord) {
        let tokens = record.total_tokens();
        self.total_tokens += tokens;
        self.total_cost += record.cost;

        let entry = self.by_agent.entry(record.agent.to_string()).or_default();
        entry.tokens += tokens;
        entry.cost += record.cost;
        entry.calls += 1;

        self.history.push(record);
    }
}
