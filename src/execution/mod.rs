//! Flow Execution Module
//!
//! Runs flow instances: suspends them when their handlers dispatch calls
//! and resumes them when replies arrive.
//!
//! # Architecture
//!
//! - [`engine`]: the engine driving instances from message to message
//! - [`context`]: what a state handler sees while it runs
//! - [`instance`]: per-instance data, including the outstanding call registry

pub mod context;
pub mod engine;
pub mod instance;

pub use context::FlowContext;
pub use engine::{Delivery, EngineConfig, FlowEngine};
pub use instance::{FlowInstance, InstanceStatus, ParentLink, PendingCall};
