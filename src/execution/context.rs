//! Handler Context
//!
//! [`FlowContext`] is everything a state handler may touch while it runs:
//! the instance's [`WorkflowState`], the artifact store and the operations
//! that advance the flow.
//!
//! Calls dispatched through the context are buffered and only committed by
//! the engine once the handler returns `Ok`. Log lines and replies are kept
//! whatever the handler returns.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::agent::actions::AgentAction;
use crate::agent::component::{load_call, ComponentSet};
use crate::error::FlowError;
use crate::flow::model::{Artifact, InstanceId, OutboundCall, ResponseEnvelope};
use crate::flow::state::WorkflowState;
use crate::storage::ArtifactStore;

/// What a handler produced, handed back to the engine.
#[derive(Debug, Default)]
pub(crate) struct HandlerOutput {
    pub calls: Vec<OutboundCall>,
    pub logs: Vec<String>,
    pub replies: Vec<Artifact>,
}

/// View of one instance given to a running state handler.
pub struct FlowContext<'a> {
    instance_id: InstanceId,
    client_id: &'a str,
    state_name: &'a str,
    state: &'a mut WorkflowState,
    components: &'a ComponentSet,
    store: &'a dyn ArtifactStore,
    output: HandlerOutput,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(
        instance_id: InstanceId,
        client_id: &'a str,
        state_name: &'a str,
        state: &'a mut WorkflowState,
        components: &'a ComponentSet,
        store: &'a dyn ArtifactStore,
    ) -> Self {
        Self {
            instance_id,
            client_id,
            state_name,
            state,
            components,
            store,
            output: HandlerOutput::default(),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Identifier of the agent this instance runs against.
    pub fn client_id(&self) -> &str {
        self.client_id
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store
    }

    /// Queues an outbound call.
    ///
    /// Agent calls that depend on a component fail with
    /// [`FlowError::ComponentNotLoaded`] until that component is loaded.
    pub fn dispatch(&mut self, call: OutboundCall) -> Result<(), FlowError> {
        self.components.check(&call)?;
        debug!(
            "{}: {} queued {} -> {}",
            self.instance_id, self.state_name, call.target, call.next_state
        );
        self.output.calls.push(call);
        Ok(())
    }

    /// Calls a remote agent action.
    pub fn call_client(
        &mut self,
        action: &AgentAction,
        params: impl Serialize,
        next_state: &str,
    ) -> Result<(), FlowError> {
        let call = action.call(params, next_state)?;
        self.dispatch(call)
    }

    /// Starts a nested flow whose replies arrive at `next_state`.
    pub fn call_flow(
        &mut self,
        name: &str,
        args: impl Serialize,
        next_state: &str,
    ) -> Result<(), FlowError> {
        let call = OutboundCall::flow(name, args, next_state)?;
        self.dispatch(call)
    }

    /// Moves to `next_state` without talking to anyone.
    pub fn call_state(&mut self, next_state: &str) -> Result<(), FlowError> {
        self.dispatch(OutboundCall::state(next_state))
    }

    /// Loads a component on the agent; `next_state` runs once it is ready.
    pub fn load_component(
        &mut self,
        name: &str,
        version: &str,
        next_state: &str,
    ) -> Result<(), FlowError> {
        let call = load_call(name, version, next_state)?;
        self.dispatch(call)
    }

    /// Appends a line to the instance log.
    pub fn log(&mut self, message: impl Into<String>) {
        self.output.logs.push(message.into());
    }

    /// Appends every log line carried by `responses`.
    pub fn forward_logs(&mut self, responses: &ResponseEnvelope) {
        self.output.logs.extend(responses.logs.iter().cloned());
    }

    /// Emits one artifact to the instance's result stream.
    pub fn send_reply(&mut self, artifact: Artifact) {
        self.output.replies.push(artifact);
    }

    /// Writes a workflow state key owned by the running state.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), FlowError> {
        self.state.set(self.state_name, key, value)?;
        Ok(())
    }

    /// Reads a workflow state key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FlowError> {
        Ok(self.state.get(key)?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.contains(key)
    }

    pub(crate) fn finish(self) -> HandlerOutput {
        self.output
    }
}
