//! Scripted Agent
//!
//! Stands in for a real agent by answering requests from a list of canned
//! replies, usually loaded from YAML:
//!
//! ```yaml
//! replies:
//!   - action: LoadComponent
//!   - action: DumpACPITable
//!     when: { table_signature: FACP }
//!     success: false
//!     status: table not found
//!   - action: DumpACPITable
//!     when: { table_signature: DSDT }
//!     payloads:
//!       - acpi_tables: [{ table_address: 4096, table_blob: [1, 2, 3] }]
//! ```
//!
//! Rules are tried in order. A rule answers once unless `repeat` is set.
//! Its `when` keys must all equal the request parameters of the same name.

use std::error::Error;
use std::fs;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::actions::lookup;
use super::transport::{AgentReply, AgentRequest, QueueTransport};
use crate::error::EngineError;
use crate::execution::engine::FlowEngine;
use crate::flow::model::ResponseEnvelope;

/// One canned reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScriptedReply {
    pub action: String,
    #[serde(default)]
    pub when: Map<String, Value>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payloads: Vec<Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Keep answering after the first match
    #[serde(default)]
    pub repeat: bool,
}

fn default_success() -> bool {
    true
}

impl ScriptedReply {
    fn matches(&self, request: &AgentRequest) -> bool {
        self.action == request.action
            && self
                .when
                .iter()
                .all(|(key, expected)| request.params.get(key) == Some(expected))
    }

    fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope {
            success: self.success,
            status: self.status.clone(),
            payloads: self.payloads.clone(),
            logs: self.logs.clone(),
            request_data: None,
        }
    }
}

/// File format of an agent script.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AgentScript {
    #[serde(default)]
    pub replies: Vec<ScriptedReply>,
}

/// Answers agent requests from an [`AgentScript`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    rules: Vec<ScriptedReply>,
    used: Vec<bool>,
}

impl ScriptedAgent {
    pub fn new(script: AgentScript) -> Self {
        let used = vec![false; script.replies.len()];
        Self {
            rules: script.replies,
            used,
        }
    }

    /// Parses a YAML script.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        let script: AgentScript = serde_yaml::from_str(content)?;
        Ok(Self::new(script))
    }

    /// Loads a YAML script from disk.
    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read agent script '{}': {}", path, e))?;
        let agent = Self::from_yaml(&content)
            .map_err(|e| format!("Failed to parse agent script '{}': {}", path, e))?;
        debug!("Loaded {} scripted replies from {}", agent.rules.len(), path);
        for action in agent.unknown_actions() {
            warn!("Agent script '{}' answers unknown action '{}'", path, action);
        }
        Ok(agent)
    }

    /// Actions the script answers that no built-in flow ever calls.
    pub fn unknown_actions(&self) -> Vec<&str> {
        let mut unknown: Vec<&str> = self
            .rules
            .iter()
            .map(|rule| rule.action.as_str())
            .filter(|action| lookup(action).is_none())
            .collect();
        unknown.dedup();
        unknown
    }

    /// Produces the reply to `request`.
    ///
    /// Requests no rule matches are answered with a failure envelope.
    pub fn answer(&mut self, request: &AgentRequest) -> AgentReply {
        let found = self
            .rules
            .iter()
            .enumerate()
            .find(|(index, rule)| (rule.repeat || !self.used[*index]) && rule.matches(request))
            .map(|(index, _)| index);

        let envelope = match found {
            Some(index) => {
                self.used[index] = true;
                self.rules[index].envelope()
            }
            None => {
                warn!("No scripted reply for action '{}'", request.action);
                ResponseEnvelope::failure(format!("no scripted reply for action '{}'", request.action))
            }
        };

        AgentReply::to(request, envelope)
    }

    /// Number of one-shot rules that have not answered yet.
    pub fn remaining(&self) -> usize {
        self.rules
            .iter()
            .zip(&self.used)
            .filter(|(rule, used)| !rule.repeat && !**used)
            .count()
    }

    /// Answers everything `outbox` holds until the engine stops issuing
    /// requests. Returns the number of replies delivered.
    pub fn drive(&mut self, engine: &mut FlowEngine, outbox: &QueueTransport) -> Result<usize, EngineError> {
        let mut delivered = 0;
        while let Some(request) = outbox.pop() {
            debug!("Agent <- {} (request {})", request.action, request.request_id);
            let reply = self.answer(&request);
            engine.deliver(reply)?;
            delivered += 1;
        }
        Ok(delivered)
    }
}
