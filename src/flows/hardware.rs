//! Low-Level Hardware Flows
//!
//! # DumpFlashImage
//!
//! Dumps the SPI flash (BIOS) image of the host:
//!
//! ```text
//! Start -> CollectDebugInfo -> DumpImage -> CollectImage -> DeleteTemporaryImage -> TemporaryImageRemoved
//!                                                 \-> End (no image path)
//! ```
//!
//! The image is dumped to a temporary file on the agent, copied into the
//! store with [`GetFiles`](super::transfer), pointed at by
//! `{client}/spiflash` and then removed from the agent. A failure to remove
//! it aborts the flow, but the already transferred image stays delivered.
//!
//! # DumpACPITable
//!
//! Fetches every requested ACPI table signature with its own call. Each
//! reply is handled on its own: a failed signature is logged and the
//! others carry on.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::artifact_collector::{self, CollectHardwareInfoArgs};
use super::transfer::{self, GetFilesArgs, TransferredFile};
use crate::agent::actions::{
    DeleteTempFilesRequest, DumpAcpiTableRequest, DumpAcpiTableResponse, DumpFlashImageRequest,
    DumpFlashImageResponse, CHIPSEC_COMPONENT, DEFAULT_COMPONENT_VERSION, DELETE_TEMP_FILES,
    DUMP_ACPI_TABLE, DUMP_FLASH_IMAGE,
};
use crate::error::{FlowError, ValidationError};
use crate::execution::context::FlowContext;
use crate::flow::graph::StateGraph;
use crate::flow::model::{Artifact, OutboundCall, ResponseEnvelope};
use crate::flow::validator::{require_non_empty, require_non_empty_list, require_positive, FlowArgs};
use crate::storage::{client_path, write_object, ObjectKind};

pub const DUMP_FLASH_IMAGE_FLOW: &str = "DumpFlashImage";
pub const DUMP_ACPI_TABLE_FLOW: &str = "DumpACPITable";

/// Symbolic pointer to the latest flash image of a client.
const SPIFLASH_LINK: &str = "spiflash";

/// Store prefix of ACPI table collections.
const ACPI_TABLES_PREFIX: &str = "devices/chipsec/acpi/tables";

const DEFAULT_CHUNK_SIZE: u64 = 0x100000;

fn default_component_version() -> String {
    DEFAULT_COMPONENT_VERSION.to_string()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DumpFlashImageArgs {
    #[serde(default = "default_component_version")]
    pub component_version: String,
    /// Verbosity of the dump on the agent
    #[serde(default)]
    pub log_level: u32,
    /// Bytes read per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Whether the agent announces the dump in its syslog
    #[serde(default)]
    pub notify_syslog: bool,
}

impl Default for DumpFlashImageArgs {
    fn default() -> Self {
        Self {
            component_version: default_component_version(),
            log_level: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            notify_syslog: false,
        }
    }
}

impl FlowArgs for DumpFlashImageArgs {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("component_version", &self.component_version)?;
        require_positive("chunk_size", self.chunk_size)
    }
}

pub fn dump_flash_image() -> StateGraph<DumpFlashImageArgs> {
    StateGraph::new(DUMP_FLASH_IMAGE_FLOW, "Start")
        .state("Start", flash_start)
        .state("CollectDebugInfo", collect_debug_info)
        .state("DumpImage", dump_image)
        .state("CollectImage", collect_image)
        .state("DeleteTemporaryImage", delete_temporary_image)
        .state("TemporaryImageRemoved", temporary_image_removed)
        .end("End", flash_end)
}

fn flash_start(args: &DumpFlashImageArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    ctx.load_component(CHIPSEC_COMPONENT, &args.component_version, "CollectDebugInfo")
}

fn collect_debug_info(_: &DumpFlashImageArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    let args = CollectHardwareInfoArgs { store_results: true };
    ctx.call_flow(artifact_collector::NAME, args, "DumpImage")
}

fn dump_image(
    args: &DumpFlashImageArgs,
    ctx: &mut FlowContext<'_>,
    responses: ResponseEnvelope,
) -> Result<(), FlowError> {
    if responses.success {
        if let Some(info) = responses.first() {
            ctx.set("hardware_info", info)?;
        }
    } else {
        debug!("Hardware information unavailable: {}", responses.status_text());
        ctx.log(format!(
            "Unable to collect hardware information: {}",
            responses.status_text()
        ));
    }

    let request = DumpFlashImageRequest {
        log_level: args.log_level,
        chunk_size: args.chunk_size,
        notify_syslog: args.notify_syslog,
    };
    ctx.call_client(&DUMP_FLASH_IMAGE, request, "CollectImage")
}

fn collect_image(_: &DumpFlashImageArgs, ctx: &mut FlowContext<'_>, responses: ResponseEnvelope) -> Result<(), FlowError> {
    ctx.forward_logs(&responses);

    if !responses.success {
        return Err(FlowError::fatal(format!(
            "Failed to dump the flash image: {}",
            responses.status_text()
        )));
    }

    let image_path = responses
        .first_as::<DumpFlashImageResponse>()?
        .map(|response| response.path)
        .unwrap_or_default();

    if image_path.is_empty() {
        ctx.log("No path returned. Skipping host.");
        return ctx.call_state("End");
    }

    ctx.set("image_path", &image_path)?;
    let call = OutboundCall::flow(
        transfer::NAME,
        GetFilesArgs::new(vec![image_path.clone()]),
        "DeleteTemporaryImage",
    )?
    .with_request_data(json!({ "image_path": image_path }));
    ctx.dispatch(call)
}

fn delete_temporary_image(
    _: &DumpFlashImageArgs,
    ctx: &mut FlowContext<'_>,
    responses: ResponseEnvelope,
) -> Result<(), FlowError> {
    if !responses.success {
        return Err(FlowError::fatal(format!(
            "Unable to collect the flash image: {}",
            responses.status_text()
        )));
    }

    let image: TransferredFile = responses
        .first_as()?
        .ok_or_else(|| FlowError::fatal("Unable to collect the flash image: no file transferred"))?;
    ctx.send_reply(Artifact::new("TransferredFile", &image)?);

    let link = client_path(ctx.client_id(), &[SPIFLASH_LINK]);
    ctx.store().set_target(&link, &image.store_path)?;

    let image_path = responses
        .request_str("image_path")
        .ok_or_else(|| FlowError::fatal("Temporary image path missing from request data"))?;
    let request = DeleteTempFilesRequest {
        path: image_path.to_string(),
    };
    ctx.call_client(&DELETE_TEMP_FILES, request, "TemporaryImageRemoved")
}

fn temporary_image_removed(
    _: &DumpFlashImageArgs,
    _: &mut FlowContext<'_>,
    responses: ResponseEnvelope,
) -> Result<(), FlowError> {
    if !responses.success {
        return Err(FlowError::fatal(format!(
            "Unable to delete the temporary flash image: {}",
            responses.status_text()
        )));
    }
    Ok(())
}

fn flash_end(_: &DumpFlashImageArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    if ctx.contains("image_path") {
        ctx.log("Successfully wrote Flash image.");
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DumpAcpiTableArgs {
    #[serde(default = "default_component_version")]
    pub component_version: String,
    /// Whether the agent logs while reading tables
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub table_signature_list: Vec<String>,
}

impl DumpAcpiTableArgs {
    pub fn new(signatures: &[&str]) -> Self {
        Self {
            component_version: default_component_version(),
            logging: false,
            table_signature_list: signatures.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FlowArgs for DumpAcpiTableArgs {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("component_version", &self.component_version)?;
        require_non_empty_list("table_signature_list", &self.table_signature_list)?;

        for signature in &self.table_signature_list {
            let valid = signature.len() == 4 && signature.bytes().all(|b| b.is_ascii_graphic());
            if !valid {
                return Err(ValidationError::InvalidValue {
                    field: "table_signature_list".to_string(),
                    reason: format!("'{}' is not a 4-character ACPI signature", signature),
                });
            }
        }
        Ok(())
    }
}

pub fn dump_acpi_table() -> StateGraph<DumpAcpiTableArgs> {
    StateGraph::new(DUMP_ACPI_TABLE_FLOW, "Start")
        .state("Start", acpi_start)
        .state("StartCollection", start_collection)
        .state("TableReceived", table_received)
}

fn acpi_start(args: &DumpAcpiTableArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    ctx.load_component(CHIPSEC_COMPONENT, &args.component_version, "StartCollection")
}

fn start_collection(args: &DumpAcpiTableArgs, ctx: &mut FlowContext<'_>, _: ResponseEnvelope) -> Result<(), FlowError> {
    for signature in &args.table_signature_list {
        let request = DumpAcpiTableRequest {
            logging: args.logging,
            table_signature: signature.clone(),
        };
        let call = DUMP_ACPI_TABLE
            .call(request, "TableReceived")?
            .with_request_data(json!({ "table_signature": signature }));
        ctx.dispatch(call)?;
    }
    Ok(())
}

fn table_received(_: &DumpAcpiTableArgs, ctx: &mut FlowContext<'_>, responses: ResponseEnvelope) -> Result<(), FlowError> {
    ctx.forward_logs(&responses);

    // A failed reply may not carry the signature, the request data always does.
    let signature = responses
        .request_str("table_signature")
        .unwrap_or("unknown")
        .to_string();

    if !responses.success {
        ctx.log(format!("Error retrieving ACPI table with signature {}", signature));
        return Ok(());
    }

    let response: DumpAcpiTableResponse = responses.first_as()?.unwrap_or_default();
    if response.acpi_tables.is_empty() {
        return Ok(());
    }

    ctx.log(format!("Retrieved ACPI table(s) with signature {}", signature));

    let path = client_path(ctx.client_id(), &[ACPI_TABLES_PREFIX, &signature]);
    let collection = serde_json::to_vec(&response.acpi_tables)?;
    write_object(ctx.store(), &path, ObjectKind::AcpiTableCollection, &collection)?;

    for table in &response.acpi_tables {
        ctx.send_reply(Artifact::new("AcpiTable", table)?);
    }
    Ok(())
}
