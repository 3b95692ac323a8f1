//! Monitoring Module
//!
//! Provides the per-instance event timeline used for diagnostics and for
//! the CLI's run report.
//!
//! # Components
//!
//! - [`FlowTimeline`]: ordered record of state transitions and calls

pub mod timeline;

pub use timeline::{EventType, FlowTimeline, TimelineEvent};
