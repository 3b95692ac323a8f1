//! Flow Instances
//!
//! One [`FlowInstance`] is one run of a registered flow: its arguments,
//! current state, workflow state bag, outstanding calls and everything it
//! has emitted so far. The whole struct is serializable so it can be
//! checkpointed between messages.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::actions::LoadComponentRequest;
use crate::agent::component::{load_request, ComponentSet};
use crate::flow::model::{Artifact, CallTarget, InstanceId, LogEntry, OutboundCall};
use crate::flow::state::WorkflowState;
use crate::monitoring::{EventType, FlowTimeline};

/// Lifecycle of an instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    /// Aborted with the given status text
    Failed(String),
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Parent call a child instance answers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub instance: InstanceId,
    pub request_id: u64,
}

/// An outbound call still waiting for its reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub target: CallTarget,
    pub next_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
    /// Response ids already consumed
    #[serde(default)]
    pub seen_responses: BTreeSet<u32>,
    /// Response id of the reply marked `last`, once it has arrived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<u32>,
    /// Component this call loads, if it is a component load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_load: Option<LoadComponentRequest>,
}

impl PendingCall {
    pub fn from_call(call: &OutboundCall) -> Self {
        Self {
            target: call.target.clone(),
            next_state: call.next_state.clone(),
            request_data: call.request_data.clone(),
            seen_responses: BTreeSet::new(),
            last_response: None,
            component_load: load_request(call),
        }
    }

    pub fn is_multi_reply(&self) -> bool {
        matches!(self.target, CallTarget::Agent { multi_reply: true, .. })
    }

    /// Records a consumed response, or returns why it must be dropped.
    pub fn accept_response(&mut self, response_id: u32, last: bool) -> Result<(), String> {
        if let Some(final_id) = self.last_response {
            if response_id > final_id {
                return Err(format!(
                    "response {} follows the last response {}",
                    response_id, final_id
                ));
            }
        }
        if !self.seen_responses.insert(response_id) {
            return Err(format!("duplicate response {}", response_id));
        }
        if last {
            self.last_response = Some(response_id);
        }
        Ok(())
    }

    /// Whether every reply to this call has been consumed.
    ///
    /// Single-reply calls finish with their first reply. Multi-reply calls
    /// finish once the last reply and every response id before it arrived,
    /// in whatever order.
    pub fn is_finished(&self) -> bool {
        if !self.is_multi_reply() {
            return !self.seen_responses.is_empty();
        }
        match self.last_response {
            Some(final_id) => (0..=final_id).all(|id| self.seen_responses.contains(&id)),
            None => false,
        }
    }
}

/// One run of a flow.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FlowInstance {
    pub id: InstanceId,
    pub flow_name: String,
    pub client_id: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    pub status: InstanceStatus,
    /// Last state whose handler ran
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub state: WorkflowState,
    #[serde(default)]
    pub components: ComponentSet,
    /// Outstanding calls keyed by request id
    #[serde(default)]
    pub pending: BTreeMap<u64, PendingCall>,
    pub next_request_id: u64,
    #[serde(default)]
    pub replies: Vec<Artifact>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub timeline: FlowTimeline,
    /// Whether the end state has already run
    #[serde(default)]
    pub end_ran: bool,
    pub created_at: DateTime<Utc>,
}

impl FlowInstance {
    pub fn new(
        flow_name: impl Into<String>,
        client_id: impl Into<String>,
        args: Value,
        parent: Option<ParentLink>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            flow_name: flow_name.into(),
            client_id: client_id.into(),
            args,
            parent,
            status: InstanceStatus::Running,
            current_state: None,
            state: WorkflowState::new(),
            components: ComponentSet::new(),
            pending: BTreeMap::new(),
            next_request_id: 1,
            replies: Vec::new(),
            log: Vec::new(),
            timeline: FlowTimeline::new(),
            end_ran: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Registers `call` as outstanding and returns its request id.
    pub fn register_call(&mut self, call: &OutboundCall) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        self.pending.insert(request_id, PendingCall::from_call(call));
        self.timeline.add_event(EventType::CallDispatched {
            request_id,
            target: call.target.to_string(),
            next_state: call.next_state.clone(),
        });
        request_id
    }

    /// Records a discarded reply on the timeline.
    pub fn discard_reply(&mut self, request_id: u64, reason: impl Into<String>) {
        let reason = reason.into();
        debug!("{}: discarding reply {} ({})", self.id, request_id, reason);
        self.timeline.add_event(EventType::ReplyDiscarded { request_id, reason });
    }

    /// Marks the instance failed and forgets every outstanding call.
    pub fn fail(&mut self, status: impl Into<String>) {
        let status = status.into();
        self.pending.clear();
        self.timeline.add_event(EventType::Failed {
            status: status.clone(),
        });
        self.status = InstanceStatus::Failed(status);
    }

    pub fn complete(&mut self) {
        self.pending.clear();
        self.timeline.add_event(EventType::Completed);
        self.status = InstanceStatus::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::component::load_call;
    use serde_json::json;

    #[test]
    fn test_new_instance() {
        let instance = FlowInstance::new("DumpACPITable", "C.1", json!({}), None);
        assert!(instance.is_running());
        assert!(!instance.has_pending());
        assert_eq!(instance.next_request_id, 1);
        assert!(instance.current_state.is_none());
    }

    #[test]
    fn test_register_call_allocates_ids() {
        let mut instance = FlowInstance::new("DumpACPITable", "C.1", json!({}), None);
        let call = OutboundCall::agent("DumpACPITable", json!({}), "TableReceived")
            .unwrap()
            .with_request_data(json!({"table_signature": "DSDT"}));

        let first = instance.register_call(&call);
        let second = instance.register_call(&call);

        assert_eq!((first, second), (1, 2));
        assert_eq!(instance.pending.len(), 2);
        assert_eq!(
            instance.pending[&first].request_data,
            Some(json!({"table_signature": "DSDT"}))
        );
        assert_eq!(instance.timeline.calls_dispatched(), 2);
    }

    #[test]
    fn test_pending_call_recognizes_component_load() {
        let call = load_call("grr-chipsec-component", "1.2.2", "StartCollection").unwrap();
        let pending = PendingCall::from_call(&call);
        assert_eq!(
            pending.component_load.as_ref().map(|c| c.name.as_str()),
            Some("grr-chipsec-component")
        );
        assert!(!pending.is_multi_reply());
    }

    #[test]
    fn test_multi_reply_finishes_when_all_ids_arrive() {
        let call = OutboundCall::agent("ListProcesses", json!({}), "Collect")
            .unwrap()
            .multi_reply();
        let mut pending = PendingCall::from_call(&call);

        pending.accept_response(0, false).unwrap();
        pending.accept_response(2, true).unwrap();
        assert!(!pending.is_finished());

        pending.accept_response(1, false).unwrap();
        assert!(pending.is_finished());
    }

    #[test]
    fn test_multi_reply_rejects_duplicates_and_ids_past_last() {
        let call = OutboundCall::agent("ListProcesses", json!({}), "Collect")
            .unwrap()
            .multi_reply();
        let mut pending = PendingCall::from_call(&call);

        pending.accept_response(1, true).unwrap();
        assert!(pending.accept_response(1, false).is_err());
        assert!(pending.accept_response(5, false).is_err());
        assert!(!pending.is_finished());
    }

    #[test]
    fn test_single_reply_finishes_on_first_reply() {
        let mut pending = PendingCall::from_call(&OutboundCall::state("Next"));
        assert!(!pending.is_finished());
        pending.accept_response(0, false).unwrap();
        assert!(pending.is_finished());
    }

    #[test]
    fn test_fail_clears_pending() {
        let mut instance = FlowInstance::new("GetFiles", "C.1", json!({}), None);
        instance.register_call(&OutboundCall::state("Next"));
        instance.fail("device busy");

        assert!(!instance.has_pending());
        assert_eq!(instance.status, InstanceStatus::Failed("device busy".to_string()));
        assert!(!instance.is_running());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(InstanceStatus::Failed("boom".to_string())).unwrap();
        assert_eq!(json, json!({"status": "failed", "detail": "boom"}));

        let back: InstanceStatus = serde_json::from_value(json!({"status": "running"})).unwrap();
        assert_eq!(back, InstanceStatus::Running);
    }

    #[test]
    fn test_instance_roundtrip_keeps_pending_registry() {
        let mut instance = FlowInstance::new("DumpFlashImage", "C.1", json!({"log_level": 1}), None);
        instance.register_call(&OutboundCall::state("End"));

        let json = serde_json::to_string(&instance).unwrap();
        let back: FlowInstance = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, instance.id);
        assert_eq!(back.pending, instance.pending);
        assert_eq!(back.next_request_id, 2);
    }
}
