//! Shared fixtures for integration tests: a small zoo of resource types
//! with link, filter, schema and inference hooks exercised by the suites.
#![allow(dead_code)]

use serde_json::Value;
use std::sync::{Arc, Mutex};
use weft_core::notify::{ChangeEvent, ChangeSink};
use weft_core::perm::{PermAction, PermissionGate};
use weft_core::registry::{LinkTypeDef, ResourceTypeDef, SourceTypeDef, TypeRegistry};
use weft_core::InferenceStep;

/// Builds the registry used across the integration suites.
///
/// - `snake` resources take `science` and `mythology` sources, allow
///   client identifiers, and derive `label`, `eats` and `identifier`.
/// - `rodent` resources take `science` sources only and never allow client
///   identifiers.
/// - `science` data hides its `restricted` subtree from everyone but the
///   `curator` committer, and requires `label` to be a string.
pub fn registry() -> Arc<TypeRegistry> {
    let science = SourceTypeDef::new("science")
        .with_schema(Arc::new(|data: &Value| match data.get("label") {
            None | Some(Value::String(_)) => Ok(()),
            Some(_) => Err("label must be a string".to_string()),
        }))
        .with_data_filter(Arc::new(|viewer: &str, data: &Value| {
            if viewer == "curator" {
                return data.clone();
            }
            let mut visible = data.clone();
            if let Some(map) = visible.as_object_mut() {
                map.remove("restricted");
            }
            visible
        }));

    let registry = TypeRegistry::builder()
        .source_type(science)
        .source_type(SourceTypeDef::new("mythology"))
        .link_type(LinkTypeDef::new("eats", "eatenBy"))
        .resource_type(
            ResourceTypeDef::new("snake")
                .with_source_types(["science", "mythology"])
                .with_client_identifier()
                .with_uri_templates(["https://example.org/snake/{identifier}"])
                .with_inference(vec![
                    InferenceStep::first_of(
                        "label",
                        ["@source/science/label", "@source/mythology/label"],
                    ),
                    InferenceStep::set(
                        "eats",
                        ["@source/science/eats", "@source/mythology/eats"],
                    ),
                    InferenceStep::first_of("identifier", ["@source/science/identifier"]),
                    InferenceStep::first_of("startDate", ["@source/science/startDate"]),
                    InferenceStep::first_of("endDate", ["@source/science/endDate"]),
                ]),
        )
        .resource_type(
            ResourceTypeDef::new("rodent")
                .with_source_types(["science"])
                .with_inference(vec![InferenceStep::first_of(
                    "label",
                    ["@source/science/label"],
                )]),
        )
        .build()
        .expect("fixture registry should build");
    Arc::new(registry)
}

/// Gate refusing every action for one named user.
pub struct DenyUserGate {
    pub denied_user: &'static str,
}

impl PermissionGate for DenyUserGate {
    fn has_perm(&self, user: &str, _action: PermAction, _object: &str) -> bool {
        user != self.denied_user
    }
}

/// Sink recording every event for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ChangeEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

impl ChangeSink for CollectingSink {
    fn notify(&self, event: &ChangeEvent) {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .push(event.clone());
    }
}
