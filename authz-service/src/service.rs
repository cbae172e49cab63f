//! The authorization decision service.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use authn_service::{AuthnStore, ClientType};
use hub_core::{HubError, Operation};

use crate::acl;
use crate::models::{builtin_roles, default_role_permissions, AclDocument, ThingPermission};

pub struct AuthzService {
    store: Arc<AuthnStore>,
    role_permissions: RwLock<HashMap<String, HashSet<Operation>>>,
    thing_permissions: RwLock<HashMap<String, ThingPermission>>,
    acl_path: Option<PathBuf>,
}

impl AuthzService {
    /// Build the service with the default role table, loading custom roles
    /// and per-Thing entries from the ACL file when one is configured.
    pub fn open(store: Arc<AuthnStore>, acl_path: Option<PathBuf>) -> Result<Self, HubError> {
        let mut role_permissions = default_role_permissions();
        let mut thing_permissions = HashMap::new();

        if let Some(path) = &acl_path {
            let doc = acl::load(path)?;
            for (role, ops) in doc.custom_roles {
                role_permissions.insert(role, ops.into_iter().collect());
            }
            for (dthing_id, perm) in doc.thing_permissions {
                thing_permissions.insert(dthing_id, perm);
            }
            info!(path = %path.display(), "acl loaded");
        }

        Ok(Self {
            store,
            role_permissions: RwLock::new(role_permissions),
            thing_permissions: RwLock::new(thing_permissions),
            acl_path,
        })
    }

    /// Decide whether `sender_id` may perform `operation` on `dthing_id`.
    ///
    /// A per-Thing entry, when present, fully overrides the role table.
    /// Unknown senders and unknown or empty roles are denied.
    pub fn has_permission(&self, sender_id: &str, operation: Operation, dthing_id: &str) -> bool {
        let role = match self.store.get_profile(sender_id) {
            Ok(profile) => profile.role,
            Err(_) => {
                debug!(sender_id, "permission denied: unknown sender");
                return false;
            }
        };

        if let Some(perm) = self
            .thing_permissions
            .read()
            .expect("authz lock poisoned")
            .get(dthing_id)
        {
            if !perm.allow.is_empty() {
                return perm.allow.iter().any(|r| r == &role);
            }
            if !perm.deny.is_empty() {
                return !perm.deny.iter().any(|r| r == &role);
            }
            return false;
        }

        self.role_permissions
            .read()
            .expect("authz lock poisoned")
            .get(&role)
            .map(|ops| ops.contains(&operation))
            .unwrap_or(false)
    }

    /// Install or replace a per-Thing permission entry.
    ///
    /// Admins may write any entry; agents and services may register entries
    /// for their own Things only.
    pub fn set_permissions(&self, sender_id: &str, perm: ThingPermission) -> Result<(), HubError> {
        let profile = self
            .store
            .get_profile(sender_id)
            .map_err(|_| HubError::Forbidden(format!("unknown sender '{sender_id}'")))?;

        let self_scoped = matches!(profile.client_type, ClientType::Agent | ClientType::Service)
            && perm.agent_id == sender_id;
        if profile.role != "admin" && !self_scoped {
            return Err(HubError::Forbidden(format!(
                "sender '{sender_id}' may not set permissions for agent '{}'",
                perm.agent_id
            )));
        }
        if perm.agent_id.is_empty() || perm.thing_id.is_empty() {
            return Err(HubError::InvalidArgument(
                "thing permission requires agent_id and thing_id".to_string(),
            ));
        }

        let dthing_id = perm.dthing_id();
        info!(sender_id, dthing_id = %dthing_id, allow = ?perm.allow, deny = ?perm.deny,
            "thing permissions set");
        self.thing_permissions
            .write()
            .expect("authz lock poisoned")
            .insert(dthing_id, perm);
        self.persist()
    }

    /// Admin-gated read of a per-Thing entry, for the service Thing surface.
    pub fn get_permissions_checked(
        &self,
        sender_id: &str,
        dthing_id: &str,
    ) -> Result<Option<ThingPermission>, HubError> {
        self.require_admin(sender_id)?;
        Ok(self.get_permissions(dthing_id))
    }

    pub fn get_permissions(&self, dthing_id: &str) -> Option<ThingPermission> {
        self.thing_permissions
            .read()
            .expect("authz lock poisoned")
            .get(dthing_id)
            .cloned()
    }

    /// Register a custom role with its operation set. Built-in roles cannot
    /// be redefined.
    pub fn register_role(
        &self,
        sender_id: &str,
        role: &str,
        operations: Vec<Operation>,
    ) -> Result<(), HubError> {
        self.require_admin(sender_id)?;
        if role.is_empty() {
            return Err(HubError::InvalidArgument("role name is empty".to_string()));
        }
        if builtin_roles().contains(&role) {
            return Err(HubError::AlreadyExists(format!("built-in role '{role}'")));
        }
        self.role_permissions
            .write()
            .expect("authz lock poisoned")
            .insert(role.to_string(), operations.into_iter().collect());
        info!(role, "custom role registered");
        self.persist()
    }

    /// Assign a role to a client; the role lands on the client record owned
    /// by the authentication store.
    pub fn set_client_role(
        &self,
        sender_id: &str,
        client_id: &str,
        role: &str,
    ) -> Result<(), HubError> {
        self.require_admin(sender_id)?;
        if !self.is_known_role(role) {
            return Err(HubError::InvalidArgument(format!("unknown role '{role}'")));
        }
        self.store.set_role(client_id, role)
    }

    pub fn is_known_role(&self, role: &str) -> bool {
        self.role_permissions
            .read()
            .expect("authz lock poisoned")
            .contains_key(role)
    }

    fn require_admin(&self, sender_id: &str) -> Result<(), HubError> {
        let profile = self
            .store
            .get_profile(sender_id)
            .map_err(|_| HubError::Forbidden(format!("unknown sender '{sender_id}'")))?;
        match profile.role.as_str() {
            "admin" | "service" => Ok(()),
            other => Err(HubError::Forbidden(format!(
                "sender '{sender_id}' with role '{other}' is not an administrator"
            ))),
        }
    }

    /// Rewrite the ACL file from the live tables. A no-op without a path:
    /// in that configuration custom state is in-memory only.
    fn persist(&self) -> Result<(), HubError> {
        let Some(path) = &self.acl_path else {
            return Ok(());
        };
        let defaults = default_role_permissions();
        let doc = AclDocument {
            custom_roles: self
                .role_permissions
                .read()
                .expect("authz lock poisoned")
                .iter()
                .filter(|(role, _)| !defaults.contains_key(*role))
                .map(|(role, ops)| {
                    let mut ops: Vec<Operation> = ops.iter().copied().collect();
                    ops.sort_by_key(|op| op.as_str());
                    (role.clone(), ops)
                })
                .collect(),
            thing_permissions: self
                .thing_permissions
                .read()
                .expect("authz lock poisoned")
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        acl::save(path, &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authn_service::{ClientProfile, HashAlgorithm};
    use tempfile::tempdir;

    struct Fixture {
        authz: AuthzService,
        store: Arc<AuthnStore>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id)
                .expect("open"),
        );
        seed(&store, "admin1", ClientType::Service, "admin");
        seed(&store, "v", ClientType::Consumer, "viewer");
        seed(&store, "op", ClientType::Consumer, "operator");
        seed(&store, "mgr", ClientType::Consumer, "manager");
        seed(&store, "a1", ClientType::Agent, "agent");
        let authz = AuthzService::open(store.clone(), Some(dir.path().join("authz.acl")))
            .expect("authz");
        Fixture { authz, store, dir }
    }

    fn seed(store: &AuthnStore, client_id: &str, client_type: ClientType, role: &str) {
        store
            .add(&ClientProfile {
                role: role.to_string(),
                ..ClientProfile::new(client_id, client_type)
            })
            .expect("seed");
    }

    #[test]
    fn role_table_decides_without_thing_entry() {
        let fx = fixture();
        assert!(fx
            .authz
            .has_permission("v", Operation::ReadProperty, "dtw:a1:thing1"));
        assert!(!fx
            .authz
            .has_permission("v", Operation::InvokeAction, "dtw:a1:thing1"));
        assert!(fx
            .authz
            .has_permission("op", Operation::InvokeAction, "dtw:a1:thing1"));
        assert!(!fx
            .authz
            .has_permission("op", Operation::WriteProperty, "dtw:a1:thing1"));
        assert!(fx
            .authz
            .has_permission("mgr", Operation::WriteProperty, "dtw:a1:thing1"));
    }

    #[test]
    fn unknown_sender_and_unknown_role_are_denied() {
        let fx = fixture();
        assert!(!fx
            .authz
            .has_permission("ghost", Operation::ReadProperty, "dtw:a1:thing1"));
        seed(&fx.store, "weird", ClientType::Consumer, "no-such-role");
        assert!(!fx
            .authz
            .has_permission("weird", Operation::ReadProperty, "dtw:a1:thing1"));
        seed(&fx.store, "bare", ClientType::Consumer, "");
        assert!(!fx
            .authz
            .has_permission("bare", Operation::ReadProperty, "dtw:a1:thing1"));
    }

    #[test]
    fn allow_list_overrides_role_table() {
        let fx = fixture();
        fx.authz
            .set_permissions(
                "admin1",
                ThingPermission {
                    agent_id: "svc".to_string(),
                    thing_id: "admin".to_string(),
                    allow: vec!["admin".to_string()],
                    deny: Vec::new(),
                },
            )
            .expect("set");

        // manager normally may invoke, but the allow list shuts it out
        assert!(!fx
            .authz
            .has_permission("mgr", Operation::InvokeAction, "dtw:svc:admin"));
        assert!(fx
            .authz
            .has_permission("admin1", Operation::InvokeAction, "dtw:svc:admin"));
    }

    #[test]
    fn deny_list_admits_everyone_else() {
        let fx = fixture();
        fx.authz
            .set_permissions(
                "admin1",
                ThingPermission {
                    agent_id: "a1".to_string(),
                    thing_id: "thing1".to_string(),
                    allow: Vec::new(),
                    deny: vec!["viewer".to_string()],
                },
            )
            .expect("set");

        assert!(!fx
            .authz
            .has_permission("v", Operation::ReadProperty, "dtw:a1:thing1"));
        assert!(fx
            .authz
            .has_permission("op", Operation::InvokeAction, "dtw:a1:thing1"));
    }

    #[test]
    fn empty_entry_denies_everyone() {
        let fx = fixture();
        fx.authz
            .set_permissions(
                "admin1",
                ThingPermission {
                    agent_id: "a1".to_string(),
                    thing_id: "thing1".to_string(),
                    allow: Vec::new(),
                    deny: Vec::new(),
                },
            )
            .expect("set");
        assert!(!fx
            .authz
            .has_permission("admin1", Operation::ReadProperty, "dtw:a1:thing1"));
    }

    #[test]
    fn agents_may_only_self_register() {
        let fx = fixture();
        fx.authz
            .set_permissions(
                "a1",
                ThingPermission {
                    agent_id: "a1".to_string(),
                    thing_id: "thing1".to_string(),
                    allow: vec!["operator".to_string()],
                    deny: Vec::new(),
                },
            )
            .expect("self-scoped set");

        let err = fx
            .authz
            .set_permissions(
                "a1",
                ThingPermission {
                    agent_id: "other-agent".to_string(),
                    thing_id: "thing1".to_string(),
                    allow: vec!["operator".to_string()],
                    deny: Vec::new(),
                },
            )
            .expect_err("must fail");
        assert_eq!(err.kind(), "Forbidden");

        let err = fx
            .authz
            .set_permissions(
                "v",
                ThingPermission {
                    agent_id: "v".to_string(),
                    thing_id: "thing1".to_string(),
                    allow: vec!["viewer".to_string()],
                    deny: Vec::new(),
                },
            )
            .expect_err("consumers may not set permissions");
        assert_eq!(err.kind(), "Forbidden");
    }

    #[test]
    fn custom_roles_and_thing_permissions_persist() {
        let fx = fixture();
        fx.authz
            .register_role(
                "admin1",
                "auditor",
                vec![Operation::ReadProperty, Operation::ReadAllTds],
            )
            .expect("register");
        fx.authz
            .set_permissions(
                "admin1",
                ThingPermission {
                    agent_id: "svc".to_string(),
                    thing_id: "admin".to_string(),
                    allow: vec!["admin".to_string()],
                    deny: Vec::new(),
                },
            )
            .expect("set");

        let reopened =
            AuthzService::open(fx.store.clone(), Some(fx.dir.path().join("authz.acl")))
                .expect("reopen");
        assert!(reopened.is_known_role("auditor"));
        assert!(reopened.get_permissions("dtw:svc:admin").is_some());

        seed(&fx.store, "aud", ClientType::Consumer, "auditor");
        assert!(reopened.has_permission("aud", Operation::ReadProperty, "dtw:a1:thing1"));
        assert!(!reopened.has_permission("aud", Operation::InvokeAction, "dtw:a1:thing1"));
    }

    #[test]
    fn set_client_role_validates_role_and_sender() {
        let fx = fixture();
        fx.authz
            .set_client_role("admin1", "v", "operator")
            .expect("set role");
        assert_eq!(fx.store.get_profile("v").expect("get").role, "operator");

        let err = fx
            .authz
            .set_client_role("admin1", "v", "archduke")
            .expect_err("unknown role");
        assert_eq!(err.kind(), "InvalidArgument");

        let err = fx
            .authz
            .set_client_role("v", "v", "admin")
            .expect_err("non-admin sender");
        assert_eq!(err.kind(), "Forbidden");
    }
}
