//! Flow Definition Module
//!
//! Provides the data structures flows are built from and the registry the
//! engine looks them up in.
//!
//! # Structure
//!
//! - [`model`]: Calls, reply envelopes, artifacts and instance ids
//! - [`graph`]: State graphs and the flow registry
//! - [`validator`]: Typed argument decoding and checks
//! - [`state`]: Per-instance key/value state and checkpoints
//! - [`parser`]: Loading arguments from YAML or JSON files

pub mod graph;
pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use graph::{FlowRegistry, StateGraph, StateHandler, Workflow};
pub use model::{Artifact, CallTarget, InstanceId, LogEntry, OutboundCall, ResponseEnvelope};
pub use parser::{load_args, parse_args_text, save_args};
pub use state::{InstanceCheckpoint, WorkflowState};
pub use validator::{parse_args, FlowArgs};
