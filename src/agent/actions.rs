//! Agent Action Catalog
//!
//! Remote actions the built-in flows invoke, together with the request and
//! response payloads exchanged with the agent. An action names the
//! component it depends on; the engine refuses to dispatch it until that
//! component has been loaded on the agent.

use serde::{Deserialize, Serialize};

use crate::flow::model::OutboundCall;

/// Component providing the low-level hardware actions.
pub const CHIPSEC_COMPONENT: &str = "grr-chipsec-component";

/// Default version of [`CHIPSEC_COMPONENT`].
pub const DEFAULT_COMPONENT_VERSION: &str = "1.2.2";

/// A remote agent action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentAction {
    pub name: &'static str,
    /// Component that must be loaded before dispatch
    pub component: Option<&'static str>,
    /// Whether one request may yield several replies
    pub multi_reply: bool,
}

impl AgentAction {
    /// Builds an outbound call to this action.
    pub fn call(
        &self,
        params: impl Serialize,
        next_state: impl Into<String>,
    ) -> Result<OutboundCall, serde_json::Error> {
        let mut call = OutboundCall::agent(self.name, params, next_state)?;
        if let Some(component) = self.component {
            call = call.requiring(component);
        }
        if self.multi_reply {
            call = call.multi_reply();
        }
        Ok(call)
    }
}

pub const LOAD_COMPONENT: AgentAction = AgentAction {
    name: "LoadComponent",
    component: None,
    multi_reply: false,
};

pub const DUMP_FLASH_IMAGE: AgentAction = AgentAction {
    name: "DumpFlashImage",
    component: Some(CHIPSEC_COMPONENT),
    multi_reply: false,
};

pub const DUMP_ACPI_TABLE: AgentAction = AgentAction {
    name: "DumpACPITable",
    component: Some(CHIPSEC_COMPONENT),
    multi_reply: false,
};

pub const DELETE_TEMP_FILES: AgentAction = AgentAction {
    name: "DeleteGRRTempFiles",
    component: None,
    multi_reply: false,
};

pub const TRANSFER_FILE: AgentAction = AgentAction {
    name: "TransferFile",
    component: None,
    multi_reply: false,
};

pub const GET_HARDWARE_INFO: AgentAction = AgentAction {
    name: "GetHardwareInfo",
    component: None,
    multi_reply: false,
};

/// Every action known to the built-in flows.
pub const ALL_ACTIONS: &[AgentAction] = &[
    LOAD_COMPONENT,
    DUMP_FLASH_IMAGE,
    DUMP_ACPI_TABLE,
    DELETE_TEMP_FILES,
    TRANSFER_FILE,
    GET_HARDWARE_INFO,
];

/// Looks up an action by name.
pub fn lookup(name: &str) -> Option<AgentAction> {
    ALL_ACTIONS.iter().copied().find(|action| action.name == name)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadComponentRequest {
    pub name: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DumpFlashImageRequest {
    pub log_level: u32,
    pub chunk_size: u64,
    pub notify_syslog: bool,
}

/// Reply of [`DUMP_FLASH_IMAGE`]; an empty path means nothing was dumped.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DumpFlashImageResponse {
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DumpAcpiTableRequest {
    pub logging: bool,
    pub table_signature: String,
}

/// One ACPI table as read from physical memory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcpiTable {
    pub table_address: u64,
    #[serde(default)]
    pub table_blob: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DumpAcpiTableResponse {
    #[serde(default)]
    pub acpi_tables: Vec<AcpiTable>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeleteTempFilesRequest {
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferFileRequest {
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TransferFileResponse {
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Host description returned by [`GET_HARDWARE_INFO`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HardwareInfo {
    #[serde(default)]
    pub bios_vendor: String,
    #[serde(default)]
    pub bios_version: String,
    #[serde(default)]
    pub bios_release_date: String,
    #[serde(default)]
    pub system_manufacturer: String,
    #[serde(default)]
    pub system_product_name: String,
    #[serde(default)]
    pub serial_number: String,
}
