//! Agent Transport
//!
//! The engine hands every agent call to an [`AgentTransport`] as an
//! [`AgentRequest`] and is later fed the answers as [`AgentReply`]
//! messages. Delivery is asynchronous and at-least-once: replies may come
//! in any order, late, or twice.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::flow::model::{InstanceId, ResponseEnvelope};

/// One call sent to the agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub instance_id: InstanceId,
    pub request_id: u64,
    pub client_id: String,
    pub action: String,
    pub params: Value,
    /// Correlation data of the call; the engine keeps its own copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

/// One answer to an [`AgentRequest`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub instance_id: InstanceId,
    pub request_id: u64,
    /// Position of this reply among the replies to one request
    #[serde(default)]
    pub response_id: u32,
    /// Whether no more replies follow for this request
    #[serde(default = "default_last")]
    pub last: bool,
    pub envelope: ResponseEnvelope,
}

fn default_last() -> bool {
    true
}

impl AgentReply {
    /// A single, final reply to a request.
    pub fn new(instance_id: InstanceId, request_id: u64, envelope: ResponseEnvelope) -> Self {
        Self {
            instance_id,
            request_id,
            response_id: 0,
            last: true,
            envelope,
        }
    }

    /// A single, final reply to `request`.
    pub fn to(request: &AgentRequest, envelope: ResponseEnvelope) -> Self {
        Self::new(request.instance_id, request.request_id, envelope)
    }

    /// Places the reply in a multi-reply sequence.
    pub fn with_response(mut self, response_id: u32, last: bool) -> Self {
        self.response_id = response_id;
        self.last = last;
        self
    }
}

/// Outbound channel to the agent.
pub trait AgentTransport: Send {
    fn send(&mut self, request: AgentRequest) -> Result<(), TransportError>;
}

/// In-process outbox; clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct QueueTransport {
    queue: Arc<Mutex<VecDeque<AgentRequest>>>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every queued request, oldest first.
    pub fn drain(&self) -> Vec<AgentRequest> {
        lock(&self.queue).drain(..).collect()
    }

    /// Takes the oldest queued request.
    pub fn pop(&self) -> Option<AgentRequest> {
        lock(&self.queue).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }
}

impl AgentTransport for QueueTransport {
    fn send(&mut self, request: AgentRequest) -> Result<(), TransportError> {
        lock(&self.queue).push_back(request);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
