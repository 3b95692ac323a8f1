//! Built-in Flows
//!
//! - [`hardware`]: `DumpFlashImage` and `DumpACPITable`
//! - [`transfer`]: `GetFiles`, used by the flash dump to copy the image
//! - [`artifact_collector`]: `CollectHardwareInfo`, run before every flash dump

pub mod artifact_collector;
pub mod hardware;
pub mod transfer;

use log::error;
use once_cell::sync::Lazy;

use crate::flow::graph::FlowRegistry;

pub use hardware::{DUMP_ACPI_TABLE_FLOW, DUMP_FLASH_IMAGE_FLOW};

static BUILTIN: Lazy<FlowRegistry> = Lazy::new(|| {
    let mut registry = FlowRegistry::new();

    let results = [
        registry.register(hardware::dump_flash_image()),
        registry.register(hardware::dump_acpi_table()),
        registry.register(transfer::graph()),
        registry.register(artifact_collector::graph()),
    ];
    for result in results {
        if let Err(e) = result {
            error!("Failed to register built-in flow: {}", e);
        }
    }
    registry
});

/// Returns a registry holding every built-in flow.
pub fn builtin_registry() -> FlowRegistry {
    BUILTIN.clone()
}
