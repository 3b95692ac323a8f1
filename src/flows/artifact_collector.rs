//! CollectHardwareInfo
//!
//! Asks the agent to describe the host's hardware and replies the result.
//! With `store_results` the description is also kept in the artifact store
//! under `{client}/hardware_info`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::actions::{HardwareInfo, GET_HARDWARE_INFO};
use crate::error::FlowError;
use crate::execution::context::FlowContext;
use crate::flow::graph::StateGraph;
use crate::flow::model::{Artifact, ResponseEnvelope};
use crate::flow::validator::FlowArgs;
use crate::storage::{client_path, write_object, ObjectKind};

pub const NAME: &str = "CollectHardwareInfo";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CollectHardwareInfoArgs {
    #[serde(default)]
    pub store_results: bool,
}

impl FlowArgs for CollectHardwareInfoArgs {}

pub fn graph() -> StateGraph<CollectHardwareInfoArgs> {
    StateGraph::new(NAME, "Start")
        .state("Start", start)
        .state("ProcessInfo", process_info)
}

fn start(_: &CollectHardwareInfoArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    ctx.call_client(&GET_HARDWARE_INFO, json!({}), "ProcessInfo")
}

fn process_info(
    args: &CollectHardwareInfoArgs,
    ctx: &mut FlowContext<'_>,
    responses: ResponseEnvelope,
) -> Result<(), FlowError> {
    ctx.forward_logs(&responses);
    if !responses.success {
        return Err(FlowError::fatal(format!(
            "Unable to collect hardware information: {}",
            responses.status_text()
        )));
    }

    let info: HardwareInfo = responses.first_as()?.unwrap_or_default();
    if args.store_results {
        let path = client_path(ctx.client_id(), &["hardware_info"]);
        write_object(ctx.store(), &path, ObjectKind::Json, &serde_json::to_vec_pretty(&info)?)?;
    }

    ctx.send_reply(Artifact::new("HardwareInfo", &info)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::transport::{AgentReply, QueueTransport};
    use crate::execution::{FlowEngine, InstanceStatus};
    use crate::flows::builtin_registry;
    use crate::storage::{ArtifactStore, MemoryStore};
    use std::sync::Arc;

    fn engine() -> (FlowEngine, QueueTransport, Arc<MemoryStore>) {
        let outbox = QueueTransport::new();
        let store = Arc::new(MemoryStore::new());
        let engine = FlowEngine::new(builtin_registry(), outbox.clone(), store.clone());
        (engine, outbox, store)
    }

    #[test]
    fn test_replies_and_stores_info() {
        let (mut engine, outbox, store) = engine();
        let id = engine.start_flow(NAME, "C.1", json!({"store_results": true})).unwrap();

        let request = outbox.pop().unwrap();
        assert_eq!(request.action, "GetHardwareInfo");
        let envelope = ResponseEnvelope::ok(vec![json!({"bios_vendor": "acme", "bios_version": "1.0"})]);
        engine.deliver(AgentReply::to(&request, envelope)).unwrap();

        assert_eq!(engine.status(id), Some(&InstanceStatus::Completed));
        let info: HardwareInfo = engine.replies(id).unwrap()[0].payload_as().unwrap();
        assert_eq!(info.bios_vendor, "acme");

        let stored: HardwareInfo = serde_json::from_slice(&store.read("C.1/hardware_info").unwrap()).unwrap();
        assert_eq!(stored, info);
    }

    #[test]
    fn test_without_storing() {
        let (mut engine, outbox, store) = engine();
        engine.start_flow(NAME, "C.1", json!(null)).unwrap();

        let request = outbox.pop().unwrap();
        engine.deliver(AgentReply::to(&request, ResponseEnvelope::empty())).unwrap();
        assert!(store.paths().is_empty());
    }

    #[test]
    fn test_failure_aborts() {
        let (mut engine, outbox, _) = engine();
        let id = engine.start_flow(NAME, "C.1", json!({})).unwrap();

        let request = outbox.pop().unwrap();
        engine
            .deliver(AgentReply::to(&request, ResponseEnvelope::failure("dmidecode missing")))
            .unwrap();

        assert_eq!(
            engine.status(id),
            Some(&InstanceStatus::Failed(
                "Unable to collect hardware information: dmidecode missing".to_string()
            ))
        );
    }
}
