//! Flow Data Model
//!
//! Core data structures exchanged between state handlers, the engine and
//! the remote agent.
//!
//! - [`OutboundCall`]: one asynchronous request issued by a handler
//! - [`ResponseEnvelope`]: everything a reply carries back to the continuation
//! - [`Artifact`]: one item of the instance's result stream
//! - [`LogEntry`]: one line of the instance's durable log

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one flow instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an identifier previously produced by `to_string`.
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Where an outbound call is delivered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallTarget {
    /// An action executed by the remote agent.
    Agent {
        action: String,
        /// Component that must be loaded on the agent before dispatch
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
        /// Whether the agent may answer with more than one envelope
        #[serde(default)]
        multi_reply: bool,
    },
    /// A nested flow, started as a child instance.
    Flow { name: String },
    /// The issuing instance itself (pseudo self-transition).
    State,
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent { action, .. } => write!(f, "agent:{}", action),
            Self::Flow { name } => write!(f, "flow:{}", name),
            Self::State => write!(f, "self"),
        }
    }
}

/// One asynchronous request issued by a state handler.
///
/// `request_data` is owned by the issuing handler and comes back unchanged
/// in the reply's [`ResponseEnvelope::request_data`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub target: CallTarget,
    pub params: Value,
    pub next_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

impl OutboundCall {
    /// Creates a call to a remote agent action.
    pub fn agent(
        action: impl Into<String>,
        params: impl Serialize,
        next_state: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            target: CallTarget::Agent {
                action: action.into(),
                component: None,
                multi_reply: false,
            },
            params: serde_json::to_value(params)?,
            next_state: next_state.into(),
            request_data: None,
        })
    }

    /// Creates a call that starts a nested flow.
    pub fn flow(
        name: impl Into<String>,
        args: impl Serialize,
        next_state: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            target: CallTarget::Flow { name: name.into() },
            params: serde_json::to_value(args)?,
            next_state: next_state.into(),
            request_data: None,
        })
    }

    /// Creates a transition back into the issuing instance.
    pub fn state(next_state: impl Into<String>) -> Self {
        Self {
            target: CallTarget::State,
            params: Value::Null,
            next_state: next_state.into(),
            request_data: None,
        }
    }

    /// Declares the agent component this call depends on.
    pub fn requiring(mut self, component: impl Into<String>) -> Self {
        if let CallTarget::Agent { component: ref mut slot, .. } = self.target {
            *slot = Some(component.into());
        }
        self
    }

    /// Marks an agent call as answering with several envelopes.
    pub fn multi_reply(mut self) -> Self {
        if let CallTarget::Agent { ref mut multi_reply, .. } = self.target {
            *multi_reply = true;
        }
        self
    }

    /// Attaches correlation data echoed back with the reply.
    pub fn with_request_data(mut self, data: Value) -> Self {
        self.request_data = Some(data);
        self
    }
}

/// Data carried back to a continuation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResponseEnvelope {
    pub success: bool,

    /// Status or error detail; normally only set on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Ordered payload items (zero, one or many)
    #[serde(default)]
    pub payloads: Vec<Value>,

    /// Log lines produced while serving the request
    #[serde(default)]
    pub logs: Vec<String>,

    /// Correlation data from the originating call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

impl ResponseEnvelope {
    /// A successful envelope with the given payloads.
    pub fn ok(payloads: Vec<Value>) -> Self {
        Self {
            success: true,
            payloads,
            ..Self::default()
        }
    }

    /// A successful envelope with no payload, handed to start states and
    /// self-transitions.
    pub fn empty() -> Self {
        Self::ok(Vec::new())
    }

    /// A failed envelope carrying the given status.
    pub fn failure(status: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(status.into()),
            ..Self::default()
        }
    }

    /// Adds log lines to the envelope.
    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    /// Returns the first payload item, if any.
    pub fn first(&self) -> Option<&Value> {
        self.payloads.first()
    }

    /// Decodes the first payload item.
    pub fn first_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payloads
            .first()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// Status text suitable for error messages.
    pub fn status_text(&self) -> &str {
        self.status.as_deref().unwrap_or("unknown status")
    }

    /// Looks up a string field of the correlation data.
    pub fn request_str(&self, key: &str) -> Option<&str> {
        self.request_data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(Value::as_str)
    }
}

/// One item emitted to the instance's result stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates an artifact from any serializable payload.
    pub fn new(name: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
            created_at: Utc::now(),
        })
    }

    /// Decodes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// One line of an instance's durable log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_id_display_parses_back() {
        let id = InstanceId::new();
        let parsed = InstanceId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(InstanceId::parse("not-an-id").is_none());
    }

    #[test]
    fn test_agent_call_builder() {
        let call = OutboundCall::agent("DumpFlashImage", json!({"chunk_size": 4096}), "CollectImage")
            .unwrap()
            .requiring("grr-chipsec-component")
            .with_request_data(json!({"attempt": 1}));

        assert_eq!(call.next_state, "CollectImage");
        assert_eq!(call.params["chunk_size"], 4096);
        assert_eq!(call.request_data, Some(json!({"attempt": 1})));
        match call.target {
            CallTarget::Agent { action, component, multi_reply } => {
                assert_eq!(action, "DumpFlashImage");
                assert_eq!(component.as_deref(), Some("grr-chipsec-component"));
                assert!(!multi_reply);
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_requiring_ignored_for_non_agent_targets() {
        let call = OutboundCall::state("End").requiring("x").multi_reply();
        assert_eq!(call.target, CallTarget::State);
    }

    #[test]
    fn test_envelope_failure_status_text() {
        let envelope = ResponseEnvelope::failure("device busy");
        assert!(!envelope.success);
        assert_eq!(envelope.status_text(), "device busy");
        assert!(envelope.first().is_none());

        assert_eq!(ResponseEnvelope::empty().status_text(), "unknown status");
    }

    #[test]
    fn test_envelope_typed_access() {
        #[derive(Deserialize)]
        struct Item {
            path: String,
        }

        let envelope = ResponseEnvelope::ok(vec![json!({"path": "/tmp/a"}), json!({"path": "/tmp/b"})]);
        let first: Item = envelope.first_as().unwrap().unwrap();
        assert_eq!(first.path, "/tmp/a");
    }

    #[test]
    fn test_request_str_lookup() {
        let mut envelope = ResponseEnvelope::empty();
        assert!(envelope.request_str("image_path").is_none());

        envelope.request_data = Some(json!({"image_path": "/tmp/flash.bin"}));
        assert_eq!(envelope.request_str("image_path"), Some("/tmp/flash.bin"));
    }

    #[test]
    fn test_call_target_display() {
        assert_eq!(CallTarget::State.to_string(), "self");
        assert_eq!(
            CallTarget::Flow { name: "GetFiles".to_string() }.to_string(),
            "flow:GetFiles"
        );
    }
}
