//! Flow Execution Engine
//!
//! The engine drives flow instances through their state graphs:
//! - Argument validation before an instance exists
//! - Committing the calls a handler dispatched (agent, nested flow, self)
//! - Resuming continuations as replies arrive, in any order
//! - Fatal aborts, after which late replies are ignored
//! - End states and reporting child results to the parent flow
//! - Checkpointing every touched instance after each message
//!
//! Work produced while handling one message (self transitions, child
//! starts, child results) goes through an internal queue, so a handler
//! never runs inside another handler.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::agent::transport::{AgentReply, AgentRequest, AgentTransport};
use crate::error::EngineError;
use crate::execution::context::FlowContext;
use crate::execution::instance::{FlowInstance, InstanceStatus, ParentLink};
use crate::flow::graph::{FlowRegistry, Workflow};
use crate::flow::model::{Artifact, CallTarget, InstanceId, LogEntry, OutboundCall, ResponseEnvelope};
use crate::flow::state::InstanceCheckpoint;
use crate::monitoring::{EventType, FlowTimeline};
use crate::storage::ArtifactStore;

/// Engine settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Directory receiving `{instance_id}.state` checkpoints
    pub state_dir: Option<PathBuf>,
}

/// Outcome of delivering a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The reply resumed a continuation
    Processed,
    /// The reply was a duplicate, late, or for an unknown call
    Ignored,
}

enum WorkItem {
    Enter { instance: InstanceId, state: String },
    Reply(AgentReply),
}

/// Flow execution engine.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use flowrunner::agent::QueueTransport;
/// use flowrunner::execution::FlowEngine;
/// use flowrunner::flows::builtin_registry;
/// use flowrunner::storage::MemoryStore;
/// use serde_json::json;
///
/// let outbox = QueueTransport::new();
/// let mut engine = FlowEngine::new(builtin_registry(), outbox.clone(), Arc::new(MemoryStore::new()));
///
/// let id = engine
///     .start_flow("DumpACPITable", "C.1", json!({"table_signature_list": ["DSDT"]}))
///     .unwrap();
///
/// // The component load is on its way to the agent.
/// assert_eq!(outbox.pop().unwrap().action, "LoadComponent");
/// assert!(engine.status(id).is_some());
/// ```
pub struct FlowEngine {
    registry: FlowRegistry,
    transport: Box<dyn AgentTransport>,
    store: Arc<dyn ArtifactStore>,
    config: EngineConfig,
    instances: HashMap<InstanceId, FlowInstance>,
    queue: VecDeque<WorkItem>,
    dirty: BTreeSet<InstanceId>,
}

impl FlowEngine {
    /// Creates an engine for the flows in `registry`.
    pub fn new(
        registry: FlowRegistry,
        transport: impl AgentTransport + 'static,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            registry,
            transport: Box::new(transport),
            store,
            config: EngineConfig::default(),
            instances: HashMap::new(),
            queue: VecDeque::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables checkpointing into `dir`.
    pub fn set_state_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.state_dir = Some(dir.into());
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// Starts a new instance of `name`.
    ///
    /// Arguments are validated first; invalid arguments return an error
    /// and leave no trace (no instance, no log, no outbound call).
    pub fn start_flow(
        &mut self,
        name: &str,
        client_id: &str,
        args: Value,
    ) -> Result<InstanceId, EngineError> {
        let flow = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownFlow(name.to_string()))?;
        flow.validate_args(&args)?;

        let id = self.spawn(flow.as_ref(), client_id, args, None);
        info!("Started flow {} ({}) for {}", name, id, client_id);

        self.run_queue();
        self.save_dirty()?;
        Ok(id)
    }

    /// Feeds one agent reply into the engine.
    pub fn deliver(&mut self, reply: AgentReply) -> Result<Delivery, EngineError> {
        let delivery = self.process_reply(reply);
        self.run_queue();
        self.save_dirty()?;
        Ok(delivery)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&FlowInstance> {
        self.instances.get(&id)
    }

    pub fn status(&self, id: InstanceId) -> Option<&InstanceStatus> {
        self.instances.get(&id).map(|i| &i.status)
    }

    /// Result stream of an instance, in emission order.
    pub fn replies(&self, id: InstanceId) -> Option<&[Artifact]> {
        self.instances.get(&id).map(|i| i.replies.as_slice())
    }

    /// Durable log of an instance.
    pub fn logs(&self, id: InstanceId) -> Option<&[LogEntry]> {
        self.instances.get(&id).map(|i| i.log.as_slice())
    }

    pub fn timeline(&self, id: InstanceId) -> Option<&FlowTimeline> {
        self.instances.get(&id).map(|i| &i.timeline)
    }

    /// Child instances started by `id`.
    pub fn children(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut children: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| i.parent.map(|p| p.instance) == Some(id))
            .map(|i| i.id)
            .collect();
        children.sort();
        children
    }

    /// All known instance ids.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshots an instance.
    pub fn checkpoint(&self, id: InstanceId) -> Result<InstanceCheckpoint, EngineError> {
        self.instances
            .get(&id)
            .map(|instance| InstanceCheckpoint::new(instance.clone()))
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))
    }

    /// Adopts a checkpointed instance; replies for it are accepted again.
    pub fn restore(&mut self, checkpoint: InstanceCheckpoint) -> Result<InstanceId, EngineError> {
        let instance = checkpoint.instance;
        if !self.registry.contains(&instance.flow_name) {
            return Err(EngineError::UnknownFlow(instance.flow_name));
        }

        let id = instance.id;
        info!(
            "Restored flow {} ({}) with {} outstanding call(s)",
            instance.flow_name,
            id,
            instance.pending.len()
        );
        self.instances.insert(id, instance);
        Ok(id)
    }

    /// Restores every checkpoint found in the state directory.
    pub fn restore_all(&mut self) -> Result<Vec<InstanceId>, EngineError> {
        let Some(dir) = self.config.state_dir.clone() else {
            return Ok(Vec::new());
        };

        let mut restored = Vec::new();
        for id in InstanceCheckpoint::list(&dir)? {
            let checkpoint = InstanceCheckpoint::load(&dir, id)?;
            restored.push(self.restore(checkpoint)?);
        }
        Ok(restored)
    }

    /// Drops an instance and its checkpoint.
    pub fn forget(&mut self, id: InstanceId) -> Result<Option<FlowInstance>, EngineError> {
        if let Some(dir) = self.config.state_dir.as_deref() {
            InstanceCheckpoint::delete(dir, id)?;
        }
        Ok(self.instances.remove(&id))
    }

    fn spawn(
        &mut self,
        flow: &dyn Workflow,
        client_id: &str,
        args: Value,
        parent: Option<ParentLink>,
    ) -> InstanceId {
        let instance = FlowInstance::new(flow.name(), client_id, args, parent);
        let id = instance.id;

        self.instances.insert(id, instance);
        self.dirty.insert(id);
        self.queue.push_back(WorkItem::Enter {
            instance: id,
            state: flow.start_state().to_string(),
        });
        id
    }

    fn run_queue(&mut self) {
        while let Some(item) = self.queue.pop_front() {
            match item {
                WorkItem::Enter { instance, state } => {
                    self.run_state(instance, &state, ResponseEnvelope::empty());
                    self.settle(instance);
                }
                WorkItem::Reply(reply) => {
                    self.process_reply(reply);
                }
            }
        }
    }

    fn process_reply(&mut self, reply: AgentReply) -> Delivery {
        let id = reply.instance_id;
        let Some(instance) = self.instances.get_mut(&id) else {
            warn!("Ignoring reply {} for unknown instance {}", reply.request_id, id);
            return Delivery::Ignored;
        };
        self.dirty.insert(id);

        if !instance.is_running() {
            instance.discard_reply(reply.request_id, "instance is no longer running");
            return Delivery::Ignored;
        }

        let Some(pending) = instance.pending.get_mut(&reply.request_id) else {
            instance.discard_reply(reply.request_id, "no outstanding call");
            return Delivery::Ignored;
        };
        if let Err(reason) = pending.accept_response(reply.response_id, reply.last) {
            instance.discard_reply(reply.request_id, reason);
            return Delivery::Ignored;
        }

        let finished = pending.is_finished();
        let next_state = pending.next_state.clone();
        let request_data = pending.request_data.clone();
        let component_load = pending.component_load.clone();
        if finished {
            instance.pending.remove(&reply.request_id);
        }

        // Correlation data always comes from our own record of the call.
        let mut envelope = reply.envelope;
        envelope.request_data = request_data;

        if let Some(load) = component_load {
            if !envelope.success {
                let status = format!(
                    "Unable to load component {}: {}",
                    load.name,
                    envelope.status_text()
                );
                self.abort(id, status);
                return Delivery::Processed;
            }
            instance.components.record(&load.name, &load.version);
        }

        self.run_state(id, &next_state, envelope);
        self.settle(id);
        Delivery::Processed
    }

    fn run_state(&mut self, id: InstanceId, state: &str, envelope: ResponseEnvelope) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        if !instance.is_running() {
            return;
        }
        let Some(flow) = self.registry.get(&instance.flow_name) else {
            let status = format!("Flow '{}' is not registered", instance.flow_name);
            self.abort(id, status);
            return;
        };
        self.dirty.insert(id);

        instance.current_state = Some(state.to_string());
        instance.timeline.add_event(EventType::StateEntered {
            state: state.to_string(),
        });
        if flow.end_state() == Some(state) {
            instance.end_ran = true;
        }

        let mut ctx = FlowContext::new(
            id,
            &instance.client_id,
            state,
            &mut instance.state,
            &instance.components,
            self.store.as_ref(),
        );
        let result = flow.run_state(state, &instance.args, &mut ctx, envelope);
        let output = ctx.finish();

        for message in output.logs {
            debug!("{} [{}]: {}", instance.flow_name, id, message);
            instance.log.push(LogEntry::new(message));
        }
        instance.replies.extend(output.replies);

        match result {
            Ok(()) => self.commit(id, output.calls),
            // Buffered calls of a failing handler are never sent.
            Err(e) => self.abort(id, e.to_string()),
        }
    }

    fn commit(&mut self, id: InstanceId, calls: Vec<OutboundCall>) {
        for call in calls {
            let Some(instance) = self.instances.get_mut(&id) else {
                return;
            };
            if !instance.is_running() {
                return;
            }

            let request_id = instance.register_call(&call);
            let client_id = instance.client_id.clone();

            match call.target {
                CallTarget::Agent { action, .. } => {
                    let request = AgentRequest {
                        instance_id: id,
                        request_id,
                        client_id,
                        action: action.clone(),
                        params: call.params,
                        request_data: call.request_data,
                    };
                    debug!("{}: request {} -> agent:{}", id, request_id, action);

                    if let Err(e) = self.transport.send(request) {
                        self.abort(id, format!("Failed to dispatch '{}': {}", action, e));
                        return;
                    }
                }
                CallTarget::Flow { name } => {
                    let parent = ParentLink {
                        instance: id,
                        request_id,
                    };
                    self.start_child(parent, &name, &client_id, call.params);
                }
                CallTarget::State => {
                    self.queue.push_back(WorkItem::Reply(AgentReply::new(
                        id,
                        request_id,
                        ResponseEnvelope::empty(),
                    )));
                }
            }
        }
    }

    fn start_child(&mut self, parent: ParentLink, name: &str, client_id: &str, args: Value) {
        let Some(flow) = self.registry.get(name) else {
            warn!("{} called unknown flow '{}'", parent.instance, name);
            self.answer_parent(parent, ResponseEnvelope::failure(format!("unknown flow '{}'", name)));
            return;
        };

        if let Err(e) = flow.validate_args(&args) {
            warn!("{} called {} with invalid arguments: {}", parent.instance, name, e);
            self.answer_parent(
                parent,
                ResponseEnvelope::failure(format!("invalid arguments for {}: {}", name, e)),
            );
            return;
        }

        let child = self.spawn(flow.as_ref(), client_id, args, Some(parent));
        info!("{} started child flow {} ({})", parent.instance, name, child);
    }

    fn answer_parent(&mut self, parent: ParentLink, envelope: ResponseEnvelope) {
        self.queue.push_back(WorkItem::Reply(AgentReply::new(
            parent.instance,
            parent.request_id,
            envelope,
        )));
    }

    /// Runs the end state or completes the instance once it has no
    /// outstanding calls.
    fn settle(&mut self, id: InstanceId) {
        loop {
            let Some(instance) = self.instances.get(&id) else {
                return;
            };
            if !instance.is_running() || instance.has_pending() {
                return;
            }

            let end_state = self
                .registry
                .get(&instance.flow_name)
                .and_then(|flow| flow.end_state().map(str::to_string));

            match end_state {
                Some(end) if !instance.end_ran => {
                    self.run_state(id, &end, ResponseEnvelope::empty());
                }
                _ => {
                    self.complete(id);
                    return;
                }
            }
        }
    }

    fn complete(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        instance.complete();
        info!(
            "Flow {} ({}) completed with {} reply item(s)",
            instance.flow_name,
            id,
            instance.replies.len()
        );

        let parent = instance.parent;
        let payloads: Vec<Value> = instance.replies.iter().map(|a| a.payload.clone()).collect();
        self.dirty.insert(id);

        if let Some(parent) = parent {
            self.answer_parent(parent, ResponseEnvelope::ok(payloads));
        }
    }

    fn abort(&mut self, id: InstanceId, status: String) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        if !instance.is_running() {
            return;
        }

        error!("Flow {} ({}) failed: {}", instance.flow_name, id, status);
        if instance.has_pending() {
            info!(
                "Replies to {} outstanding call(s) of {} will be ignored",
                instance.pending.len(),
                id
            );
        }
        instance.fail(status.clone());

        let parent = instance.parent;
        self.dirty.insert(id);

        if let Some(parent) = parent {
            self.answer_parent(parent, ResponseEnvelope::failure(status));
        }
    }

    fn save_dirty(&mut self) -> Result<(), EngineError> {
        let dirty = std::mem::take(&mut self.dirty);
        let Some(dir) = self.config.state_dir.as_deref() else {
            return Ok(());
        };

        for id in dirty {
            if let Some(instance) = self.instances.get(&id) {
                InstanceCheckpoint::new(instance.clone()).save(dir)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::transport::QueueTransport;
    use crate::error::{FlowError, TransportError, ValidationError};
    use crate::flow::graph::StateGraph;
    use crate::flow::validator::{require_non_empty_list, FlowArgs};
    use crate::storage::MemoryStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct FanOutArgs {
        #[serde(default)]
        items: Vec<String>,
    }

    impl FlowArgs for FanOutArgs {
        fn validate(&self) -> Result<(), ValidationError> {
            require_non_empty_list("items", &self.items)
        }
    }

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct ParentArgs {
        #[serde(default)]
        items: Vec<String>,
    }

    impl FlowArgs for ParentArgs {}

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct NoArgs {}

    impl FlowArgs for NoArgs {}

    fn fan_start(args: &FanOutArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        for item in &args.items {
            let call = OutboundCall::agent("Echo", json!({"item": item}), "Received")?
                .with_request_data(json!({"item": item}));
            ctx.dispatch(call)?;
        }
        Ok(())
    }

    fn fan_received(_: &FanOutArgs, ctx: &mut FlowContext<'_>, responses: ResponseEnvelope) -> Result<(), FlowError> {
        let item = responses.request_str("item").unwrap_or("?").to_string();
        if !responses.success {
            return Err(FlowError::fatal(format!("{} failed: {}", item, responses.status_text())));
        }
        ctx.log(format!("received {}", item));
        ctx.send_reply(Artifact::new("Echo", json!({"item": item}))?);
        Ok(())
    }

    fn fan_end(_: &FanOutArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        ctx.log("end");
        Ok(())
    }

    fn parent_start(args: &ParentArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        ctx.call_flow("FanOut", json!({"items": args.items}), "Collected")
    }

    fn parent_collected(_: &ParentArgs, ctx: &mut FlowContext<'_>, responses: ResponseEnvelope) -> Result<(), FlowError> {
        if !responses.success {
            ctx.log(format!("child failed: {}", responses.status_text()));
            return Ok(());
        }
        ctx.log(format!("child returned {} item(s)", responses.payloads.len()));
        Ok(())
    }

    fn probe_start(_: &NoArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        ctx.load_component("test-component", "1.0", "Probe")
    }

    fn probe_run(_: &NoArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        ctx.dispatch(OutboundCall::agent("Probe", json!({}), "Done")?.requiring("test-component"))
    }

    fn noop(_: &NoArgs, _: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        Ok(())
    }

    fn stream_start(_: &NoArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        ctx.dispatch(OutboundCall::agent("List", json!({}), "Item")?.multi_reply())
    }

    fn stream_item(_: &NoArgs, ctx: &mut FlowContext<'_>, responses: ResponseEnvelope) -> Result<(), FlowError> {
        if let Some(item) = responses.first() {
            ctx.send_reply(Artifact::new("Item", item)?);
        }
        Ok(())
    }

    fn half_start(_: &NoArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
        ctx.dispatch(OutboundCall::agent("Never", json!({}), "Done")?)?;
        ctx.log("about to fail");
        Err(FlowError::fatal("gave up"))
    }

    fn registry() -> FlowRegistry {
        let mut registry = FlowRegistry::new();
        registry
            .register(
                StateGraph::<FanOutArgs>::new("FanOut", "Start")
                    .state("Start", fan_start)
                    .state("Received", fan_received)
                    .end("End", fan_end),
            )
            .unwrap();
        registry
            .register(
                StateGraph::<ParentArgs>::new("Parent", "Start")
                    .state("Start", parent_start)
                    .state("Collected", parent_collected),
            )
            .unwrap();
        registry
            .register(
                StateGraph::<NoArgs>::new("Probe", "Start")
                    .state("Start", probe_start)
                    .state("Probe", probe_run)
                    .state("Done", noop),
            )
            .unwrap();
        registry
            .register(
                StateGraph::<NoArgs>::new("Unprepared", "Start")
                    .state("Start", probe_run)
                    .state("Done", noop),
            )
            .unwrap();
        registry
            .register(
                StateGraph::<NoArgs>::new("Stream", "Start")
                    .state("Start", stream_start)
                    .state("Item", stream_item),
            )
            .unwrap();
        registry
            .register(
                StateGraph::<NoArgs>::new("HalfDone", "Start")
                    .state("Start", half_start)
                    .state("Done", noop),
            )
            .unwrap();
        registry
    }

    fn engine() -> (FlowEngine, QueueTransport) {
        let outbox = QueueTransport::new();
        let engine = FlowEngine::new(registry(), outbox.clone(), Arc::new(MemoryStore::new()));
        (engine, outbox)
    }

    fn messages(engine: &FlowEngine, id: InstanceId) -> Vec<String> {
        engine
            .logs(id)
            .unwrap()
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    #[test]
    fn test_invalid_args_leave_no_trace() {
        let (mut engine, outbox) = engine();

        let result = engine.start_flow("FanOut", "C.1", json!({"items": []}));
        assert!(matches!(result, Err(EngineError::Validation(ValidationError::EmptyList(_)))));
        assert!(engine.instance_ids().is_empty());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_unknown_flow() {
        let (mut engine, _) = engine();
        let result = engine.start_flow("Nope", "C.1", json!({}));
        assert!(matches!(result, Err(EngineError::UnknownFlow(_))));
    }

    #[test]
    fn test_fan_out_resumes_once_per_reply() {
        let (mut engine, outbox) = engine();
        let id = engine
            .start_flow("FanOut", "C.1", json!({"items": ["a", "b", "c"]}))
            .unwrap();

        let requests = outbox.drain();
        assert_eq!(requests.len(), 3);

        for request in requests.iter().rev() {
            let delivery = engine.deliver(AgentReply::to(request, ResponseEnvelope::empty())).unwrap();
            assert_eq!(delivery, Delivery::Processed);
        }

        assert_eq!(engine.timeline(id).unwrap().times_entered("Received"), 3);
        assert_eq!(engine.replies(id).unwrap().len(), 3);
        assert_eq!(
            messages(&engine, id),
            vec!["received c", "received b", "received a", "end"]
        );
        assert_eq!(engine.status(id), Some(&InstanceStatus::Completed));
    }

    #[test]
    fn test_request_data_comes_back_unchanged() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("FanOut", "C.1", json!({"items": ["x"]})).unwrap();

        let request = outbox.pop().unwrap();
        assert_eq!(request.request_data, Some(json!({"item": "x"})));

        let mut envelope = ResponseEnvelope::empty();
        envelope.request_data = Some(json!({"item": "forged"}));
        engine.deliver(AgentReply::to(&request, envelope)).unwrap();

        let reply = &engine.replies(id).unwrap()[0];
        assert_eq!(reply.payload, json!({"item": "x"}));
    }

    #[test]
    fn test_duplicate_delivery_is_ignored() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("FanOut", "C.1", json!({"items": ["a", "b"]})).unwrap();
        let requests = outbox.drain();

        let reply = AgentReply::to(&requests[0], ResponseEnvelope::empty());
        assert_eq!(engine.deliver(reply.clone()).unwrap(), Delivery::Processed);
        assert_eq!(engine.deliver(reply).unwrap(), Delivery::Ignored);

        assert_eq!(engine.replies(id).unwrap().len(), 1);
        assert_eq!(engine.timeline(id).unwrap().times_entered("Received"), 1);
        assert_eq!(engine.status(id), Some(&InstanceStatus::Running));
    }

    #[test]
    fn test_fatal_abort_ignores_late_siblings() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("FanOut", "C.1", json!({"items": ["a", "b"]})).unwrap();
        let requests = outbox.drain();

        engine
            .deliver(AgentReply::to(&requests[0], ResponseEnvelope::failure("device busy")))
            .unwrap();
        assert_eq!(
            engine.status(id),
            Some(&InstanceStatus::Failed("a failed: device busy".to_string()))
        );

        let late = engine
            .deliver(AgentReply::to(&requests[1], ResponseEnvelope::empty()))
            .unwrap();
        assert_eq!(late, Delivery::Ignored);
        assert!(engine.replies(id).unwrap().is_empty());
        assert!(!messages(&engine, id).contains(&"end".to_string()));
    }

    #[test]
    fn test_failing_handler_commits_no_calls() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("HalfDone", "C.1", json!({})).unwrap();

        assert!(outbox.is_empty());
        assert_eq!(engine.status(id), Some(&InstanceStatus::Failed("gave up".to_string())));
        assert_eq!(messages(&engine, id), vec!["about to fail"]);
    }

    #[test]
    fn test_component_must_be_loaded_first() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("Unprepared", "C.1", json!({})).unwrap();

        assert!(outbox.is_empty());
        match engine.status(id) {
            Some(InstanceStatus::Failed(status)) => assert!(status.contains("test-component")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_component_load_enables_dependent_actions() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("Probe", "C.1", json!({})).unwrap();

        let load = outbox.pop().unwrap();
        assert_eq!(load.action, "LoadComponent");
        assert_eq!(load.params, json!({"name": "test-component", "version": "1.0"}));
        engine.deliver(AgentReply::to(&load, ResponseEnvelope::empty())).unwrap();

        let probe = outbox.pop().unwrap();
        assert_eq!(probe.action, "Probe");
        assert_eq!(
            engine.instance(id).unwrap().components.get("test-component"),
            Some("1.0")
        );

        engine.deliver(AgentReply::to(&probe, ResponseEnvelope::empty())).unwrap();
        assert_eq!(engine.status(id), Some(&InstanceStatus::Completed));
    }

    #[test]
    fn test_component_load_failure_is_fatal() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("Probe", "C.1", json!({})).unwrap();

        let load = outbox.pop().unwrap();
        engine
            .deliver(AgentReply::to(&load, ResponseEnvelope::failure("not found")))
            .unwrap();

        assert_eq!(
            engine.status(id),
            Some(&InstanceStatus::Failed(
                "Unable to load component test-component: not found".to_string()
            ))
        );
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_multi_reply_call_stays_open_until_last() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("Stream", "C.1", json!({})).unwrap();
        let request = outbox.pop().unwrap();

        for (response_id, last) in [(0, false), (1, false), (2, true)] {
            let reply = AgentReply::to(&request, ResponseEnvelope::ok(vec![json!(response_id)]))
                .with_response(response_id, last);
            assert_eq!(engine.deliver(reply).unwrap(), Delivery::Processed);
        }

        let after = AgentReply::to(&request, ResponseEnvelope::ok(vec![json!(9)])).with_response(3, true);
        assert_eq!(engine.deliver(after).unwrap(), Delivery::Ignored);

        let items: Vec<Value> = engine.replies(id).unwrap().iter().map(|a| a.payload.clone()).collect();
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(engine.status(id), Some(&InstanceStatus::Completed));
    }

    #[test]
    fn test_multi_reply_out_of_order_keeps_every_response() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("Stream", "C.1", json!({})).unwrap();
        let request = outbox.pop().unwrap();

        for (response_id, last) in [(0, false), (2, true)] {
            let reply = AgentReply::to(&request, ResponseEnvelope::ok(vec![json!(response_id)]))
                .with_response(response_id, last);
            assert_eq!(engine.deliver(reply).unwrap(), Delivery::Processed);
        }
        assert_eq!(engine.status(id), Some(&InstanceStatus::Running));

        let late = AgentReply::to(&request, ResponseEnvelope::ok(vec![json!(1)])).with_response(1, false);
        assert_eq!(engine.deliver(late).unwrap(), Delivery::Processed);

        let items: Vec<Value> = engine.replies(id).unwrap().iter().map(|a| a.payload.clone()).collect();
        assert_eq!(items, vec![json!(0), json!(2), json!(1)]);
        assert_eq!(engine.status(id), Some(&InstanceStatus::Completed));
    }

    #[test]
    fn test_multi_reply_duplicate_response_id() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("Stream", "C.1", json!({})).unwrap();
        let request = outbox.pop().unwrap();

        let first = AgentReply::to(&request, ResponseEnvelope::ok(vec![json!(0)])).with_response(0, false);
        assert_eq!(engine.deliver(first.clone()).unwrap(), Delivery::Processed);
        assert_eq!(engine.deliver(first).unwrap(), Delivery::Ignored);
        assert_eq!(engine.replies(id).unwrap().len(), 1);
    }

    #[test]
    fn test_child_flow_replies_aggregate_into_one_envelope() {
        let (mut engine, outbox) = engine();
        let parent = engine.start_flow("Parent", "C.1", json!({"items": ["a", "b"]})).unwrap();

        let children = engine.children(parent);
        assert_eq!(children.len(), 1);

        for request in outbox.drain() {
            assert_eq!(request.instance_id, children[0]);
            engine.deliver(AgentReply::to(&request, ResponseEnvelope::empty())).unwrap();
        }

        assert_eq!(engine.status(children[0]), Some(&InstanceStatus::Completed));
        assert_eq!(engine.status(parent), Some(&InstanceStatus::Completed));
        assert_eq!(engine.timeline(parent).unwrap().times_entered("Collected"), 1);
        assert_eq!(messages(&engine, parent), vec!["child returned 2 item(s)"]);
    }

    #[test]
    fn test_child_failure_reaches_parent() {
        let (mut engine, outbox) = engine();
        let parent = engine.start_flow("Parent", "C.1", json!({"items": ["a"]})).unwrap();

        let request = outbox.pop().unwrap();
        engine
            .deliver(AgentReply::to(&request, ResponseEnvelope::failure("disk gone")))
            .unwrap();

        assert_eq!(messages(&engine, parent), vec!["child failed: a failed: disk gone"]);
        assert_eq!(engine.status(parent), Some(&InstanceStatus::Completed));
    }

    #[test]
    fn test_child_validation_failure_reaches_parent() {
        let (mut engine, outbox) = engine();
        let parent = engine.start_flow("Parent", "C.1", json!({"items": []})).unwrap();

        assert!(outbox.is_empty());
        assert!(engine.children(parent).is_empty());
        let log = messages(&engine, parent);
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("child failed: invalid arguments for FanOut"));
    }

    #[test]
    fn test_end_state_runs_once() {
        let (mut engine, outbox) = engine();
        let id = engine.start_flow("FanOut", "C.1", json!({"items": ["a"]})).unwrap();
        let request = outbox.pop().unwrap();

        let reply = AgentReply::to(&request, ResponseEnvelope::empty());
        engine.deliver(reply.clone()).unwrap();
        engine.deliver(reply).unwrap();

        assert_eq!(engine.timeline(id).unwrap().times_entered("End"), 1);
        assert!(engine.instance(id).unwrap().end_ran);
    }

    #[test]
    fn test_transport_failure_aborts() {
        struct Offline;

        impl AgentTransport for Offline {
            fn send(&mut self, _: AgentRequest) -> Result<(), TransportError> {
                Err(TransportError::Send("agent offline".to_string()))
            }
        }

        let mut engine = FlowEngine::new(registry(), Offline, Arc::new(MemoryStore::new()));
        let id = engine.start_flow("FanOut", "C.1", json!({"items": ["a"]})).unwrap();

        match engine.status(id) {
            Some(InstanceStatus::Failed(status)) => assert!(status.contains("agent offline")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_and_restore_across_engines() {
        let temp_dir = tempdir().unwrap();
        let (mut first, outbox) = engine();
        first.set_state_dir(temp_dir.path());

        let id = first.start_flow("FanOut", "C.1", json!({"items": ["a", "b"]})).unwrap();
        let requests = outbox.drain();
        first
            .deliver(AgentReply::to(&requests[0], ResponseEnvelope::empty()))
            .unwrap();
        assert!(temp_dir.path().join(format!("{}.state", id)).exists());

        let (second, _) = engine();
        let mut second = second.with_config(EngineConfig {
            state_dir: Some(temp_dir.path().to_path_buf()),
        });
        assert_eq!(second.restore_all().unwrap(), vec![id]);

        // Already consumed before the restart.
        let duplicate = second
            .deliver(AgentReply::to(&requests[0], ResponseEnvelope::empty()))
            .unwrap();
        assert_eq!(duplicate, Delivery::Ignored);

        second
            .deliver(AgentReply::to(&requests[1], ResponseEnvelope::empty()))
            .unwrap();
        assert_eq!(second.status(id), Some(&InstanceStatus::Completed));
        assert_eq!(second.replies(id).unwrap().len(), 2);

        second.forget(id).unwrap();
        assert!(!temp_dir.path().join(format!("{}.state", id)).exists());
    }

    #[test]
    fn test_restore_rejects_unknown_flow() {
        let (mut engine, _) = engine();
        let instance = FlowInstance::new("Elsewhere", "C.1", json!({}), None);
        let result = engine.restore(InstanceCheckpoint::new(instance));
        assert!(matches!(result, Err(EngineError::UnknownFlow(_))));
    }

    #[test]
    fn test_checkpoint_unknown_instance() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.checkpoint(InstanceId::new()),
            Err(EngineError::UnknownInstance(_))
        ));
    }
}
