//! Agent Component Activation
//!
//! Some actions live in components the agent loads on demand. A flow
//! loads a component with [`LOAD_COMPONENT`]; once the agent confirms, the
//! component is recorded in the instance's [`ComponentSet`] and actions
//! that require it become dispatchable.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::actions::{LoadComponentRequest, LOAD_COMPONENT};
use crate::error::FlowError;
use crate::flow::model::{CallTarget, OutboundCall};

/// Components loaded on the agent for one instance, name to version.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ComponentSet {
    loaded: BTreeMap<String, String>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the loaded version of a component.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.loaded.get(name).map(String::as_str)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// Records a confirmed load.
    pub fn record(&mut self, name: &str, version: &str) {
        info!("Component '{}' {} is loaded", name, version);
        self.loaded.insert(name.to_string(), version.to_string());
    }

    /// Checks that every component `call` depends on is loaded.
    pub fn check(&self, call: &OutboundCall) -> Result<(), FlowError> {
        if let CallTarget::Agent {
            action,
            component: Some(component),
            ..
        } = &call.target
        {
            if !self.is_loaded(component) {
                return Err(FlowError::ComponentNotLoaded {
                    component: component.clone(),
                    action: action.clone(),
                });
            }
            debug!("Action '{}' satisfied by component '{}'", action, component);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

/// Builds the call that loads `name` at `version` on the agent.
pub fn load_call(
    name: &str,
    version: &str,
    next_state: impl Into<String>,
) -> Result<OutboundCall, serde_json::Error> {
    LOAD_COMPONENT.call(
        LoadComponentRequest {
            name: name.to_string(),
            version: version.to_string(),
        },
        next_state,
    )
}

/// Recognizes a component load call and returns what it loads.
pub fn load_request(call: &OutboundCall) -> Option<LoadComponentRequest> {
    match &call.target {
        CallTarget::Agent { action, .. } if action == LOAD_COMPONENT.name => {
            serde_json::from_value(call.params.clone()).ok()
        }
        _ => None,
    }
}
