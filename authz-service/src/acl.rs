//! ACL file persistence.
//!
//! Custom roles and per-Thing permissions live in a single YAML document,
//! rewritten whole on every change via temp-file-then-rename, mirroring the
//! password file's torn-read guarantee.

use std::fs;
use std::path::{Path, PathBuf};

use hub_core::HubError;

use crate::models::AclDocument;

/// Load the ACL document; a missing file yields an empty document.
pub fn load(path: &Path) -> Result<AclDocument, HubError> {
    if !path.exists() {
        return Ok(AclDocument::default());
    }
    let data = fs::read(path)
        .map_err(|e| HubError::InternalError(format!("read {}: {e}", path.display())))?;
    serde_yaml::from_slice(&data)
        .map_err(|e| HubError::InternalError(format!("parse {}: {e}", path.display())))
}

/// Rewrite the ACL document atomically.
pub fn save(path: &Path, doc: &AclDocument) -> Result<(), HubError> {
    let data = serde_yaml::to_string(doc)
        .map_err(|e| HubError::InternalError(format!("encode acl: {e}")))?;
    let tmp = tmp_path(path);
    fs::write(&tmp, data.as_bytes())
        .map_err(|e| HubError::InternalError(format!("write {}: {e}", tmp.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .map_err(|e| HubError::InternalError(format!("chmod {}: {e}", tmp.display())))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        HubError::InternalError(format!("rename into {}: {e}", path.display()))
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
