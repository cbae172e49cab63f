//! File-backed client store.
//!
//! A process-wide map of `client_id` to [`ClientRecord`], persisted as a
//! single JSON document. Every write goes through write-to-temp-then-rename
//! so the file on disk is valid JSON at every observable instant. An
//! external change (editing the password file by hand, a provisioning tool
//! rewriting it) is picked up by a debounced watcher and atomically swapped
//! into memory.
//!
//! Single-writer, many-reader. Concurrent writers are not supported.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hub_core::{now_ms, thing_id::validate_client_id, HubError};

use crate::models::{ClientProfile, ClientRecord};
use crate::password::{hash_password, verify_password_hash, HashAlgorithm};

/// Quiet period before an externally-changed file is re-read.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(50);

pub struct AuthnStore {
    path: PathBuf,
    algorithm: HashAlgorithm,
    clients: RwLock<HashMap<String, ClientRecord>>,
    /// Modification time of the file as last written or loaded by us; the
    /// watcher treats any other mtime as an external change.
    last_mtime: Mutex<Option<SystemTime>>,
}

impl AuthnStore {
    /// Open the store, creating an empty file when none exists.
    ///
    /// An unparseable existing file is an error: startup must not silently
    /// discard credentials.
    pub fn open(path: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Result<Self, HubError> {
        let path = path.into();
        let store = Self {
            path,
            algorithm,
            clients: RwLock::new(HashMap::new()),
            last_mtime: Mutex::new(None),
        };

        if store.path.exists() {
            let map = store.read_file()?;
            info!(path = %store.path.display(), clients = map.len(), "client store loaded");
            *store.clients.write().expect("store lock poisoned") = map;
            store.note_mtime();
        } else {
            store.persist(&HashMap::new())?;
            info!(path = %store.path.display(), "client store created");
        }
        Ok(store)
    }

    /// Add or replace a client profile.
    ///
    /// Replacing preserves the stored password hash, since profiles never
    /// carry one.
    pub fn add(&self, profile: &ClientProfile) -> Result<(), HubError> {
        validate_client_id(&profile.client_id)?;
        let mut guard = self.clients.write().expect("store lock poisoned");
        let mut map = guard.clone();
        let password_hash = map
            .get(&profile.client_id)
            .map(|existing| existing.password_hash.clone())
            .unwrap_or_default();
        map.insert(
            profile.client_id.clone(),
            ClientRecord {
                client_id: profile.client_id.clone(),
                client_type: profile.client_type,
                display_name: profile.display_name.clone(),
                public_key: profile.public_key.clone(),
                password_hash,
                role: profile.role.clone(),
                token_validity_days: profile.token_validity_days,
                updated_ms: now_ms(),
            },
        );
        self.persist(&map)?;
        *guard = map;
        Ok(())
    }

    pub fn get_profile(&self, client_id: &str) -> Result<ClientProfile, HubError> {
        self.clients
            .read()
            .expect("store lock poisoned")
            .get(client_id)
            .map(ClientRecord::profile)
            .ok_or_else(|| HubError::NotFound(format!("client '{client_id}'")))
    }

    /// Unordered snapshot of all profiles.
    pub fn list_profiles(&self) -> Vec<ClientProfile> {
        self.clients
            .read()
            .expect("store lock poisoned")
            .values()
            .map(ClientRecord::profile)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.clients.read().expect("store lock poisoned").len()
    }

    /// Hash and store a new password for an existing client.
    pub fn set_password(&self, client_id: &str, plain: &str) -> Result<(), HubError> {
        let hash = hash_password(plain, self.algorithm)?;
        self.set_password_hash(client_id, &hash)
    }

    /// Store a pre-computed encoded hash verbatim.
    pub fn set_password_hash(&self, client_id: &str, hash: &str) -> Result<(), HubError> {
        self.update_record(client_id, |record| {
            record.password_hash = hash.to_string();
        })
    }

    /// Verify a password, returning the profile on success.
    ///
    /// Unknown clients and hash mismatches both surface as
    /// `InvalidCredentials` so probing cannot distinguish them.
    pub fn verify_password(&self, client_id: &str, plain: &str) -> Result<ClientProfile, HubError> {
        let record = self
            .clients
            .read()
            .expect("store lock poisoned")
            .get(client_id)
            .cloned()
            .ok_or_else(|| HubError::InvalidCredentials(format!("client '{client_id}'")))?;
        verify_password_hash(plain, &record.password_hash)
            .map_err(|_| HubError::InvalidCredentials(format!("client '{client_id}'")))?;
        Ok(record.profile())
    }

    pub fn set_role(&self, client_id: &str, role: &str) -> Result<(), HubError> {
        self.update_record(client_id, |record| {
            record.role = role.to_string();
        })
    }

    pub fn set_display_name(&self, client_id: &str, display_name: &str) -> Result<(), HubError> {
        self.update_record(client_id, |record| {
            record.display_name = display_name.to_string();
        })
    }

    pub fn set_public_key(&self, client_id: &str, public_key_pem: &str) -> Result<(), HubError> {
        self.update_record(client_id, |record| {
            record.public_key = public_key_pem.to_string();
        })
    }

    /// Remove a client. Idempotent: removing an absent client succeeds.
    pub fn remove(&self, client_id: &str) -> Result<(), HubError> {
        let mut guard = self.clients.write().expect("store lock poisoned");
        if !guard.contains_key(client_id) {
            return Ok(());
        }
        let mut map = guard.clone();
        map.remove(client_id);
        self.persist(&map)?;
        *guard = map;
        Ok(())
    }

    /// Start the file watcher. On an external change, the file is re-read
    /// after a quiet period and the in-memory map atomically replaced; a
    /// parse failure leaves the live map untouched.
    pub fn spawn_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(WATCH_DEBOUNCE);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // mtime observed last tick but not yet loaded
            let mut settling: Option<SystemTime> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let mtime = match fs::metadata(&store.path).and_then(|m| m.modified()) {
                    Ok(mtime) => mtime,
                    Err(_) => continue,
                };
                let known = *store.last_mtime.lock().expect("mtime lock poisoned");
                if known == Some(mtime) {
                    settling = None;
                    continue;
                }
                if settling == Some(mtime) {
                    // unchanged for a full quiet period
                    match store.reload() {
                        Ok(count) => {
                            info!(path = %store.path.display(), clients = count,
                                "client store reloaded after external change");
                        }
                        Err(e) => {
                            warn!(path = %store.path.display(), error = %e,
                                "client store reload failed; keeping previous state");
                        }
                    }
                    settling = None;
                } else {
                    debug!(path = %store.path.display(), "client store change detected");
                    settling = Some(mtime);
                }
            }
        })
    }

    /// Re-read the backing file and swap the in-memory map.
    pub fn reload(&self) -> Result<usize, HubError> {
        let map = self.read_file()?;
        let count = map.len();
        *self.clients.write().expect("store lock poisoned") = map;
        self.note_mtime();
        Ok(count)
    }

    fn update_record(
        &self,
        client_id: &str,
        apply: impl FnOnce(&mut ClientRecord),
    ) -> Result<(), HubError> {
        let mut guard = self.clients.write().expect("store lock poisoned");
        let mut map = guard.clone();
        let record = map
            .get_mut(client_id)
            .ok_or_else(|| HubError::NotFound(format!("client '{client_id}'")))?;
        apply(record);
        record.updated_ms = now_ms();
        self.persist(&map)?;
        *guard = map;
        Ok(())
    }

    fn read_file(&self) -> Result<HashMap<String, ClientRecord>, HubError> {
        let data = fs::read(&self.path)
            .map_err(|e| HubError::InternalError(format!("read {}: {e}", self.path.display())))?;
        serde_json::from_slice(&data).map_err(|e| {
            HubError::InternalError(format!("parse {}: {e}", self.path.display()))
        })
    }

    /// Write the whole map via temp-file-then-rename. On failure the
    /// previous file is intact and the in-memory map is not committed.
    fn persist(&self, map: &HashMap<String, ClientRecord>) -> Result<(), HubError> {
        let data = serde_json::to_vec_pretty(map)?;
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, &data)
            .map_err(|e| HubError::InternalError(format!("write {}: {e}", tmp.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .map_err(|e| HubError::InternalError(format!("chmod {}: {e}", tmp.display())))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            HubError::InternalError(format!("rename into {}: {e}", self.path.display()))
        })?;
        self.note_mtime();
        Ok(())
    }

    fn note_mtime(&self) {
        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        *self.last_mtime.lock().expect("mtime lock poisoned") = mtime;
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClientType;
    use tempfile::tempdir;

    fn profile(client_id: &str, role: &str) -> ClientProfile {
        ClientProfile {
            role: role.to_string(),
            ..ClientProfile::new(client_id, ClientType::Consumer)
        }
    }

    #[test]
    fn add_get_remove() {
        let dir = tempdir().expect("tempdir");
        let store =
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id).expect("open");

        store.add(&profile("alice", "viewer")).expect("add");
        let loaded = store.get_profile("alice").expect("get");
        assert_eq!(loaded.role, "viewer");
        assert_eq!(store.count(), 1);

        store.remove("alice").expect("remove");
        assert!(matches!(
            store.get_profile("alice"),
            Err(HubError::NotFound(_))
        ));
        // idempotent
        store.remove("alice").expect("second remove");
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn empty_client_id_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store =
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id).expect("open");
        let err = store.add(&profile("", "viewer")).expect_err("must fail");
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn set_and_verify_password() {
        let dir = tempdir().expect("tempdir");
        let store =
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id).expect("open");
        store.add(&profile("alice", "viewer")).expect("add");
        store.set_password("alice", "hunter2hunter").expect("set");

        let verified = store
            .verify_password("alice", "hunter2hunter")
            .expect("verify");
        assert_eq!(verified.client_id, "alice");

        let err = store
            .verify_password("alice", "wrong-password")
            .expect_err("must fail");
        assert_eq!(err.kind(), "InvalidCredentials");
        let err = store
            .verify_password("nobody", "hunter2hunter")
            .expect_err("must fail");
        assert_eq!(err.kind(), "InvalidCredentials");
    }

    #[test]
    fn replacing_profile_preserves_password_hash() {
        let dir = tempdir().expect("tempdir");
        let store =
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id).expect("open");
        store.add(&profile("alice", "viewer")).expect("add");
        store.set_password("alice", "hunter2hunter").expect("set");

        store.add(&profile("alice", "operator")).expect("re-add");
        assert!(store.verify_password("alice", "hunter2hunter").is_ok());
        assert_eq!(store.get_profile("alice").expect("get").role, "operator");
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("authn.json");
        {
            let store = AuthnStore::open(&path, HashAlgorithm::Argon2id).expect("open");
            store.add(&profile("alice", "viewer")).expect("add");
        }
        let reopened = AuthnStore::open(&path, HashAlgorithm::Argon2id).expect("reopen");
        assert_eq!(reopened.count(), 1);
        assert_eq!(reopened.get_profile("alice").expect("get").role, "viewer");
    }

    #[test]
    fn file_is_valid_json_after_every_operation() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("authn.json");
        let store = AuthnStore::open(&path, HashAlgorithm::Argon2id).expect("open");
        for i in 0..5 {
            store.add(&profile(&format!("client-{i}"), "viewer")).expect("add");
            let raw = fs::read(&path).expect("read");
            let _: HashMap<String, ClientRecord> =
                serde_json::from_slice(&raw).expect("always valid json");
        }
    }

    #[test]
    fn unparseable_file_fails_open() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("authn.json");
        fs::write(&path, b"{ not json").expect("write");
        assert!(AuthnStore::open(&path, HashAlgorithm::Argon2id).is_err());
    }

    #[test]
    fn reload_picks_up_external_change_and_keeps_state_on_bad_parse() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("authn.json");
        let store = AuthnStore::open(&path, HashAlgorithm::Argon2id).expect("open");
        store.add(&profile("alice", "viewer")).expect("add");

        // external edit: flip alice's role
        let mut map: HashMap<String, ClientRecord> =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        map.get_mut("alice").expect("alice").role = "operator".to_string();
        fs::write(&path, serde_json::to_vec(&map).expect("encode")).expect("write");
        store.reload().expect("reload");
        assert_eq!(store.get_profile("alice").expect("get").role, "operator");

        // corrupt file: reload errors, live map untouched
        fs::write(&path, b"garbage").expect("write");
        assert!(store.reload().is_err());
        assert_eq!(store.get_profile("alice").expect("get").role, "operator");
    }

    #[tokio::test]
    async fn watcher_reloads_after_quiet_period() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("authn.json");
        let store =
            Arc::new(AuthnStore::open(&path, HashAlgorithm::Argon2id).expect("open"));
        store.add(&profile("alice", "viewer")).expect("add");

        let cancel = CancellationToken::new();
        let watcher = store.spawn_watcher(cancel.clone());

        // external edit
        let mut map: HashMap<String, ClientRecord> =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        map.get_mut("alice").expect("alice").role = "manager".to_string();
        fs::write(&path, serde_json::to_vec(&map).expect("encode")).expect("write");

        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get_profile("alice").expect("get").role == "manager" {
                reloaded = true;
                break;
            }
        }
        cancel.cancel();
        let _ = watcher.await;
        assert!(reloaded, "watcher did not pick up external change");
    }
}
