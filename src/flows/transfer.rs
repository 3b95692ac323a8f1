//! GetFiles
//!
//! Copies files from the agent into the artifact store. Every path is
//! transferred by its own `TransferFile` call; the content lands under
//! `{client}/fs/os/{path}` and one [`TransferredFile`] is replied per file.
//! A failed transfer aborts the flow.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::actions::{TransferFileRequest, TransferFileResponse, TRANSFER_FILE};
use crate::error::{FlowError, ValidationError};
use crate::execution::context::FlowContext;
use crate::flow::graph::StateGraph;
use crate::flow::model::{Artifact, ResponseEnvelope};
use crate::flow::validator::{require_non_empty, require_non_empty_list, FlowArgs};
use crate::storage::{client_path, write_object, ObjectKind};

pub const NAME: &str = "GetFiles";

/// Store prefix of files copied from the agent's filesystem.
const FS_PREFIX: &str = "fs/os";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GetFilesArgs {
    #[serde(default)]
    pub paths: Vec<String>,
}

impl GetFilesArgs {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl FlowArgs for GetFilesArgs {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty_list("paths", &self.paths)?;
        for path in &self.paths {
            require_non_empty("paths", path)?;
        }
        Ok(())
    }
}

/// One file copied into the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransferredFile {
    /// Path on the agent
    pub source_path: String,
    /// Path of the stored copy
    pub store_path: String,
    pub size: u64,
}

pub fn graph() -> StateGraph<GetFilesArgs> {
    StateGraph::new(NAME, "Start")
        .state("Start", start)
        .state("StoreFile", store_file)
}

fn start(args: &GetFilesArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    for path in &args.paths {
        let call = TRANSFER_FILE
            .call(TransferFileRequest { path: path.clone() }, "StoreFile")?
            .with_request_data(json!({ "path": path }));
        ctx.dispatch(call)?;
    }
    Ok(())
}

fn store_file(_: &GetFilesArgs, ctx: &mut FlowContext<'_>, responses: ResponseEnvelope) -> Result<(), FlowError> {
    ctx.forward_logs(&responses);

    let source_path = responses
        .request_str("path")
        .ok_or_else(|| FlowError::fatal("Transfer reply without a source path"))?
        .to_string();

    if !responses.success {
        return Err(FlowError::fatal(format!(
            "Failed to transfer {}: {}",
            source_path,
            responses.status_text()
        )));
    }

    let content: TransferFileResponse = responses.first_as()?.unwrap_or_default();
    let store_path = client_path(ctx.client_id(), &[FS_PREFIX, &source_path]);
    write_object(ctx.store(), &store_path, ObjectKind::Blob, &content.data)?;

    let file = TransferredFile {
        source_path,
        store_path,
        size: content.data.len() as u64,
    };
    info!(
        "{}: stored {} as {} ({} bytes)",
        ctx.instance_id(),
        file.source_path,
        file.store_path,
        file.size
    );
    ctx.log(format!("Transferred {} ({} bytes)", file.source_path, file.size));
    ctx.send_reply(Artifact::new("TransferredFile", &file)?);
    Ok(())
}
