//! Authorization model: roles and per-Thing permission entries.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use hub_core::Operation;

/// The closed set of built-in roles. Custom roles may be registered at
/// runtime on top of these.
pub fn builtin_roles() -> &'static [&'static str] {
    &[
        "none", "viewer", "operator", "manager", "admin", "agent", "service",
    ]
}

/// Per-Thing allow or deny list. When present for a Thing it overrides the
/// role table: a non-empty allow list admits only the listed roles; else a
/// non-empty deny list admits all but the listed roles; an entry with
/// neither denies everyone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThingPermission {
    pub agent_id: String,
    pub thing_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl ThingPermission {
    /// The digital-twin id this entry applies to.
    pub fn dthing_id(&self) -> String {
        hub_core::thing_id::make_dthing_id(&self.agent_id, &self.thing_id)
    }
}

/// Persisted shape of the ACL file: custom role definitions plus per-Thing
/// entries, keyed by digital-twin id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclDocument {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_roles: BTreeMap<String, Vec<Operation>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thing_permissions: BTreeMap<String, ThingPermission>,
}

/// Seed the default role-to-operations table.
pub fn default_role_permissions() -> HashMap<String, HashSet<Operation>> {
    use Operation::*;

    let viewer: HashSet<Operation> = [
        ReadProperty,
        ReadAllProperties,
        ObserveProperty,
        ObserveAllProperties,
        UnobserveProperty,
        UnobserveAllProperties,
        SubscribeEvent,
        SubscribeAllEvents,
        UnsubscribeEvent,
        UnsubscribeAllEvents,
        QueryAction,
        QueryAllActions,
        // directory reads ride along with value reads
        ReadTd,
        ReadAllTds,
    ]
    .into();

    let mut operator = viewer.clone();
    operator.insert(InvokeAction);

    let mut manager = operator.clone();
    manager.insert(WriteProperty);

    // admin holds the manager set; services extend themselves through
    // set_permissions rather than a wider default
    let admin = manager.clone();

    let agent: HashSet<Operation> = [InvokeAction].into();

    let service: HashSet<Operation> = [
        ReadProperty,
        ReadAllProperties,
        ObserveProperty,
        ObserveAllProperties,
        UnobserveProperty,
        UnobserveAllProperties,
        InvokeAction,
        WriteProperty,
        QueryAction,
        QueryAllActions,
        ReadTd,
        ReadAllTds,
    ]
    .into();

    HashMap::from([
        ("none".to_string(), HashSet::new()),
        ("viewer".to_string(), viewer),
        ("operator".to_string(), operator),
        ("manager".to_string(), manager),
        ("admin".to_string(), admin),
        ("agent".to_string(), agent),
        ("service".to_string(), service),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_builtin_role() {
        let table = default_role_permissions();
        for role in builtin_roles() {
            assert!(table.contains_key(*role), "missing defaults for {role}");
        }
    }

    #[test]
    fn viewer_cannot_invoke_or_write() {
        let table = default_role_permissions();
        let viewer = &table["viewer"];
        assert!(viewer.contains(&Operation::ReadProperty));
        assert!(viewer.contains(&Operation::SubscribeEvent));
        assert!(!viewer.contains(&Operation::InvokeAction));
        assert!(!viewer.contains(&Operation::WriteProperty));
    }

    #[test]
    fn role_ladder_is_monotonic() {
        let table = default_role_permissions();
        assert!(table["viewer"].is_subset(&table["operator"]));
        assert!(table["operator"].is_subset(&table["manager"]));
        assert_eq!(table["manager"], table["admin"]);
    }

    #[test]
    fn none_role_has_no_operations() {
        assert!(default_role_permissions()["none"].is_empty());
    }
}
