//! Argument File Parser
//!
//! Loads flow arguments from YAML files. JSON is a subset of YAML, so
//! `.json` argument files load through the same path.
//!
//! # Example YAML Format
//!
//! ```yaml
//! component_version: "1.2.2"
//! logging: true
//! table_signature_list:
//!   - FACP
//!   - DSDT
//! ```

use std::error::Error;
use std::fs;

use log::{debug, info};
use serde_json::Value;

/// Loads flow arguments from a YAML or JSON file.
///
/// An empty file yields `null`, which flows whose fields all have defaults
/// accept as "use the defaults".
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::flow::load_args;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let args = load_args("acpi.yaml")?;
///     println!("Loaded {}", args);
///     Ok(())
/// }
/// ```
pub fn load_args(path: &str) -> Result<Value, Box<dyn Error>> {
    info!("Loading flow arguments from: {}", path);

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read argument file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("Argument file loaded ({} bytes)", content.len());
    parse_args_text(&content)
}

/// Parses argument text in YAML or JSON form.
pub fn parse_args_text(content: &str) -> Result<Value, Box<dyn Error>> {
    if content.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value: Value = serde_yaml::from_str(content)
        .map_err(|e| format!("Failed to parse flow arguments: {}. Check the file format.", e))?;

    if !matches!(value, Value::Object(_) | Value::Null) {
        return Err("Flow arguments must be a mapping of field names to values".into());
    }

    Ok(value)
}

/// Saves flow arguments to a YAML file.
pub fn save_args(args: &Value, path: &str) -> Result<(), Box<dyn Error>> {
    let yaml_content = serde_yaml::to_string(args)?;
    fs::write(path, yaml_content)?;
    info!("Flow arguments saved to: {}", path);
    Ok(())
}
