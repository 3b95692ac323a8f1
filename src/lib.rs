//! FlowRunner - Durable Collection Flow Engine
//!
//! Runs multi-step collection flows against a remote agent. A flow is a
//! graph of named states; a state dispatches calls and names the state
//! that handles their replies, so an instance holds no thread while it
//! waits and can be checkpointed between any two messages.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`flow`]: Flow definitions, arguments, state and checkpoints
//! - [`execution`]: The engine resuming instances as replies arrive
//! - [`agent`]: Remote actions, components and the agent transport
//! - [`flows`]: Built-in flows (flash image and ACPI table dumps)
//! - [`storage`]: Durable artifact store
//! - [`monitoring`]: Per-instance execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::agent::{QueueTransport, ScriptedAgent};
//! use flowrunner::flows::builtin_registry;
//! use flowrunner::storage::FsStore;
//! use flowrunner::{load_args, FlowEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let outbox = QueueTransport::new();
//!     let store = Arc::new(FsStore::open("flowrunner-store")?);
//!     let mut engine = FlowEngine::new(builtin_registry(), outbox.clone(), store);
//!
//!     // Start a flow and answer its requests from a scripted agent
//!     let id = engine.start_flow("DumpACPITable", "C.0000000000000001", load_args("acpi.yaml")?)?;
//!     ScriptedAgent::load("agent.yaml")?.drive(&mut engine, &outbox)?;
//!
//!     println!("{:?}", engine.status(id));
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod error;
pub mod execution;
pub mod flow;
pub mod flows;
pub mod monitoring;
pub mod storage;

// Re-export commonly used types
pub use error::{EngineError, FlowError, ValidationError};
pub use execution::{FlowContext, FlowEngine, InstanceStatus};
pub use flow::model::{Artifact, InstanceId, OutboundCall, ResponseEnvelope};
pub use flow::parser::load_args;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
