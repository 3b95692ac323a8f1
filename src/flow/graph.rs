//! State Graphs
//!
//! A flow is a directed graph of named state handlers. [`StateGraph`]
//! binds a typed argument struct to its handlers; the engine only sees the
//! object-safe [`Workflow`] trait and looks flows up by name through the
//! [`FlowRegistry`].
//!
//! # Example
//!
//! ```rust
//! use flowrunner::flow::{FlowArgs, StateGraph};
//! use flowrunner::execution::FlowContext;
//! use flowrunner::{FlowError, ResponseEnvelope};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Clone)]
//! struct PingArgs {}
//!
//! impl FlowArgs for PingArgs {}
//!
//! fn start(_: &PingArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
//!     ctx.log("pong");
//!     Ok(())
//! }
//!
//! let graph = StateGraph::<PingArgs>::new("Ping", "Start").state("Start", start);
//! assert!(graph.validate().is_ok());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;

use crate::error::{EngineError, FlowError, ValidationError};
use crate::execution::context::FlowContext;
use crate::flow::model::ResponseEnvelope;
use crate::flow::validator::{parse_args, FlowArgs};

/// Signature of a state handler.
///
/// A handler advances the flow only by dispatching calls through the
/// context; returning `Ok` with nothing dispatched ends that branch, and
/// returning `Err` aborts the instance.
pub type StateHandler<A> =
    fn(&A, &mut FlowContext<'_>, ResponseEnvelope) -> Result<(), FlowError>;

/// Object-safe view of a flow used by the engine.
pub trait Workflow: Send + Sync {
    /// Registered flow name.
    fn name(&self) -> &str;

    /// State entered when an instance starts.
    fn start_state(&self) -> &str;

    /// State run once when the instance runs out of work, if declared.
    fn end_state(&self) -> Option<&str>;

    fn has_state(&self, state: &str) -> bool;

    /// Decodes and validates raw arguments without starting anything.
    fn validate_args(&self, args: &Value) -> Result<(), ValidationError>;

    /// Runs the handler registered for `state`.
    fn run_state(
        &self,
        state: &str,
        args: &Value,
        ctx: &mut FlowContext<'_>,
        responses: ResponseEnvelope,
    ) -> Result<(), FlowError>;
}

/// A flow built from typed handlers.
pub struct StateGraph<A: FlowArgs> {
    name: String,
    start: String,
    end: Option<String>,
    handlers: BTreeMap<String, StateHandler<A>>,
}

impl<A: FlowArgs> StateGraph<A> {
    /// Creates an empty graph whose instances begin in `start`.
    pub fn new(name: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: start.into(),
            end: None,
            handlers: BTreeMap::new(),
        }
    }

    /// Registers a state handler.
    pub fn state(mut self, name: impl Into<String>, handler: StateHandler<A>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Registers the end state handler.
    pub fn end(mut self, name: impl Into<String>, handler: StateHandler<A>) -> Self {
        let name = name.into();
        self.handlers.insert(name.clone(), handler);
        self.end = Some(name);
        self
    }

    /// Returns the registered state names in sorted order.
    pub fn states(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Checks that the graph is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Flow has an empty name".to_string());
        }
        if !self.handlers.contains_key(&self.start) {
            return Err(format!(
                "Flow '{}' has no handler for its start state '{}'",
                self.name, self.start
            ));
        }
        Ok(())
    }
}

impl<A: FlowArgs> Workflow for StateGraph<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_state(&self) -> &str {
        &self.start
    }

    fn end_state(&self) -> Option<&str> {
        self.end.as_deref()
    }

    fn has_state(&self, state: &str) -> bool {
        self.handlers.contains_key(state)
    }

    fn validate_args(&self, args: &Value) -> Result<(), ValidationError> {
        parse_args::<A>(args).map(|_| ())
    }

    fn run_state(
        &self,
        state: &str,
        args: &Value,
        ctx: &mut FlowContext<'_>,
        responses: ResponseEnvelope,
    ) -> Result<(), FlowError> {
        let handler = self
            .handlers
            .get(state)
            .ok_or_else(|| FlowError::UnknownState(state.to_string()))?;

        let args = parse_args::<A>(args)
            .map_err(|e| FlowError::fatal(format!("Stored arguments became invalid: {}", e)))?;

        debug!("{}: entering state {}", self.name, state);
        handler(&args, ctx, responses)
    }
}

/// Registry of flows available to the engine, keyed by name.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn Workflow>>,
}

impl FlowRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed graph after checking its shape.
    pub fn register<A: FlowArgs>(&mut self, graph: StateGraph<A>) -> Result<(), EngineError> {
        graph.validate().map_err(EngineError::InvalidGraph)?;
        info!("Registered flow '{}' ({} states)", graph.name, graph.handlers.len());
        self.flows.insert(graph.name.clone(), Arc::new(graph));
        Ok(())
    }

    /// Looks up a flow by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.flows.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    /// Returns all registered flow names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
