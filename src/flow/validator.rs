//! Argument Validation
//!
//! Every flow declares a typed argument struct implementing [`FlowArgs`].
//! Arguments arrive as JSON, are decoded with serde and then checked with
//! [`FlowArgs::validate`] before any instance exists, so invalid arguments
//! never cause side effects.

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ValidationError;

/// Typed arguments of a flow.
pub trait FlowArgs: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Checks semantic constraints serde cannot express.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Decodes and validates raw arguments.
///
/// `null` is treated as an empty object so that flows whose fields all have
/// defaults can be started without arguments.
pub fn parse_args<A: FlowArgs>(raw: &Value) -> Result<A, ValidationError> {
    let raw = match raw {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    let args: A = serde_json::from_value(raw).map_err(|e| {
        warn!("Rejected malformed flow arguments: {}", e);
        ValidationError::Malformed(e.to_string())
    })?;

    args.validate()?;
    debug!("Flow arguments validated");
    Ok(args)
}

/// Fails when a required string is empty or whitespace.
pub fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    Ok(())
}

/// Fails when a required list has no entries.
pub fn require_non_empty_list<T>(field: &str, values: &[T]) -> Result<(), ValidationError> {
    if values.is_empty() {
        return Err(ValidationError::EmptyList(field.to_string()));
    }
    Ok(())
}

/// Fails when a numeric setting is zero.
pub fn require_positive(field: &str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct SampleArgs {
        name: String,
        #[serde(default)]
        items: Vec<String>,
    }

    impl FlowArgs for SampleArgs {
        fn validate(&self) -> Result<(), ValidationError> {
            require_non_empty("name", &self.name)?;
            require_non_empty_list("items", &self.items)
        }
    }

    #[test]
    fn test_parse_valid_args() {
        let args: SampleArgs = parse_args(&json!({"name": "x", "items": ["a"]})).unwrap();
        assert_eq!(args.name, "x");
        assert_eq!(args.items, vec!["a"]);
    }

    #[test]
    fn test_parse_malformed_args() {
        let result: Result<SampleArgs, _> = parse_args(&json!({"items": "not-a-list"}));
        assert!(matches!(result, Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn test_parse_runs_validation() {
        let result: Result<SampleArgs, _> = parse_args(&json!({"name": "x"}));
        assert_eq!(result.unwrap_err(), ValidationError::EmptyList("items".to_string()));

        let result: Result<SampleArgs, _> = parse_args(&json!({"name": "  ", "items": ["a"]}));
        assert_eq!(result.unwrap_err(), ValidationError::MissingField("name".to_string()));
    }

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct DefaultedArgs {
        #[serde(default = "default_level")]
        level: u32,
    }

    fn default_level() -> u32 {
        3
    }

    impl FlowArgs for DefaultedArgs {}

    #[test]
    fn test_null_args_use_defaults() {
        let args: DefaultedArgs = parse_args(&Value::Null).unwrap();
        assert_eq!(args.level, 3);
    }

    #[test]
    fn test_require_positive() {
        assert!(require_positive("chunk_size", 1).is_ok());
        assert!(matches!(
            require_positive("chunk_size", 0),
            Err(ValidationError::InvalidValue { .. })
        ));
    }
}
