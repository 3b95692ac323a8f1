//! Remote Agent Boundary
//!
//! Everything the engine knows about the agent it drives:
//!
//! - [`actions`]: catalog of remote actions and their payloads
//! - [`component`]: components that must be loaded before some actions run
//! - [`transport`]: request/reply messages and the outbound channel
//! - [`script`]: canned agent used by the CLI and tests

pub mod actions;
pub mod component;
pub mod script;
pub mod transport;

pub use actions::AgentAction;
pub use component::ComponentSet;
pub use script::{AgentScript, ScriptedAgent};
pub use transport::{AgentReply, AgentRequest, AgentTransport, QueueTransport};
