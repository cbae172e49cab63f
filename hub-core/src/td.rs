//! Thing Description model.
//!
//! A deliberately lean WoT TD: the hub needs the id, the affordance maps and
//! the Forms it rewrites; everything else a device publishes is preserved
//! verbatim in `extra` and round-trips untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One operation endpoint in a TD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Form {
    /// Operation name(s) this form serves; string or array per WoT.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub op: Value,
    pub href: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Form {
    pub fn new(op: &str, href: impl Into<String>) -> Self {
        Self {
            op: Value::String(op.to_string()),
            href: href.into(),
            extra: Map::new(),
        }
    }
}

/// A property, event or action affordance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractionAffordance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forms: Vec<Form>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InteractionAffordance {
    pub fn with_title(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..Self::default()
        }
    }
}

/// A Thing Description document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThingDescription {
    #[serde(rename = "@context", default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, InteractionAffordance>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, InteractionAffordance>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, InteractionAffordance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forms: Vec<Form>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThingDescription {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn add_action(&mut self, name: &str, title: &str) -> &mut Self {
        self.actions
            .insert(name.to_string(), InteractionAffordance::with_title(title));
        self
    }

    pub fn add_event(&mut self, name: &str, title: &str) -> &mut Self {
        self.events
            .insert(name.to_string(), InteractionAffordance::with_title(title));
        self
    }

    pub fn add_property(&mut self, name: &str, title: &str) -> &mut Self {
        self.properties
            .insert(name.to_string(), InteractionAffordance::with_title(title));
        self
    }
}

/// Produces the Form clients use to reach an affordance through the runtime's
/// transports. Installed by the transport manager at startup; the directory
/// applies it to every stored TD.
pub type FormsHook = Arc<dyn Fn(&str, &str, &str) -> Form + Send + Sync>;
