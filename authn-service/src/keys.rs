//! Asymmetric key management.
//!
//! Two key types are supported: ECDSA P-256 for interop with existing TLS
//! clients and Ed25519 for compact tokens. Keys serialize as PKCS#8 PEM and
//! are written with owner-read-only permissions.

use std::fs;
use std::path::Path;

use ed25519_dalek::pkcs8::{
    self as ed_pkcs8, DecodePrivateKey as _, DecodePublicKey as _, EncodePrivateKey as _,
    EncodePublicKey as _,
};
use ed25519_dalek::{Signer as _, Verifier as _};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use hub_core::HubError;

/// Supported asymmetric key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    #[serde(rename = "ecdsa")]
    EcdsaP256,
    Ed25519,
}

#[derive(Clone)]
enum KeyMaterial {
    P256 {
        signing: Option<p256::ecdsa::SigningKey>,
        verifying: p256::ecdsa::VerifyingKey,
    },
    Ed25519 {
        signing: Option<ed25519_dalek::SigningKey>,
        verifying: ed25519_dalek::VerifyingKey,
    },
}

/// An asymmetric key pair, or a public half imported from a peer.
#[derive(Clone)]
pub struct KeyPair {
    material: KeyMaterial,
}

impl KeyPair {
    /// Generate a fresh key pair of the given kind.
    pub fn new_key(kind: KeyKind) -> Self {
        let material = match kind {
            KeyKind::EcdsaP256 => {
                let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
                let verifying = p256::ecdsa::VerifyingKey::from(&signing);
                KeyMaterial::P256 {
                    signing: Some(signing),
                    verifying,
                }
            }
            KeyKind::Ed25519 => {
                let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
                let verifying = signing.verifying_key();
                KeyMaterial::Ed25519 {
                    signing: Some(signing),
                    verifying,
                }
            }
        };
        Self { material }
    }

    pub fn kind(&self) -> KeyKind {
        match &self.material {
            KeyMaterial::P256 { .. } => KeyKind::EcdsaP256,
            KeyMaterial::Ed25519 { .. } => KeyKind::Ed25519,
        }
    }

    pub fn has_private(&self) -> bool {
        match &self.material {
            KeyMaterial::P256 { signing, .. } => signing.is_some(),
            KeyMaterial::Ed25519 { signing, .. } => signing.is_some(),
        }
    }

    /// Import a PKCS#8 PEM private key, detecting the algorithm.
    pub fn import_private(pem: &str) -> Result<Self, HubError> {
        if let Ok(signing) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
            let verifying = signing.verifying_key();
            return Ok(Self {
                material: KeyMaterial::Ed25519 {
                    signing: Some(signing),
                    verifying,
                },
            });
        }
        if let Ok(signing) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            let verifying = p256::ecdsa::VerifyingKey::from(&signing);
            return Ok(Self {
                material: KeyMaterial::P256 {
                    signing: Some(signing),
                    verifying,
                },
            });
        }
        Err(HubError::InvalidArgument(
            "malformed private key PEM".to_string(),
        ))
    }

    /// Import a SPKI PEM public key, detecting the algorithm.
    pub fn import_public(pem: &str) -> Result<Self, HubError> {
        if let Ok(verifying) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
            return Ok(Self {
                material: KeyMaterial::Ed25519 {
                    signing: None,
                    verifying,
                },
            });
        }
        if let Ok(verifying) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(Self {
                material: KeyMaterial::P256 {
                    signing: None,
                    verifying,
                },
            });
        }
        Err(HubError::InvalidArgument(
            "malformed public key PEM".to_string(),
        ))
    }

    /// Serialize the private key as PKCS#8 PEM.
    pub fn export_private(&self) -> Result<String, HubError> {
        match &self.material {
            KeyMaterial::P256 {
                signing: Some(signing),
                ..
            } => signing
                .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|e| HubError::InternalError(format!("encode private key: {e}"))),
            KeyMaterial::Ed25519 {
                signing: Some(signing),
                ..
            } => signing
                .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|e| HubError::InternalError(format!("encode private key: {e}"))),
            _ => Err(HubError::InvalidArgument(
                "key pair has no private half".to_string(),
            )),
        }
    }

    /// Serialize the public key as SPKI PEM.
    pub fn export_public(&self) -> Result<String, HubError> {
        match &self.material {
            KeyMaterial::P256 { verifying, .. } => verifying
                .to_public_key_pem(p256::pkcs8::LineEnding::LF)
                .map_err(|e| HubError::InternalError(format!("encode public key: {e}"))),
            KeyMaterial::Ed25519 { verifying, .. } => verifying
                .to_public_key_pem(p256::pkcs8::LineEnding::LF)
                .map_err(|e| HubError::InternalError(format!("encode public key: {e}"))),
        }
    }

    /// Sign a message, returning the raw fixed-size signature.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, HubError> {
        match &self.material {
            KeyMaterial::P256 {
                signing: Some(signing),
                ..
            } => {
                let sig: p256::ecdsa::Signature = signing.sign(data);
                Ok(sig.to_bytes().to_vec())
            }
            KeyMaterial::Ed25519 {
                signing: Some(signing),
                ..
            } => Ok(signing.sign(data).to_bytes().to_vec()),
            _ => Err(HubError::InvalidArgument(
                "key pair has no private half".to_string(),
            )),
        }
    }

    /// Verify a raw signature produced by [`KeyPair::sign`].
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match &self.material {
            KeyMaterial::P256 { verifying, .. } => {
                match p256::ecdsa::Signature::from_slice(signature) {
                    Ok(sig) => verifying.verify(data, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            KeyMaterial::Ed25519 { verifying, .. } => {
                match ed25519_dalek::Signature::from_slice(signature) {
                    Ok(sig) => verifying.verify(data, &sig).is_ok(),
                    Err(_) => false,
                }
            }
        }
    }

    /// Write the private key PEM with owner-read-only permissions.
    /// Fails if the parent directory is missing.
    pub fn save_to_file(&self, path: &Path) -> Result<(), HubError> {
        let pem = self.export_private()?;
        write_restricted(path, pem.as_bytes(), 0o400)
    }

    /// Write the public key PEM alongside the private one.
    pub fn save_public_to_file(&self, path: &Path) -> Result<(), HubError> {
        let pem = self.export_public()?;
        write_restricted(path, pem.as_bytes(), 0o400)
    }

    /// Load a private key PEM written by [`KeyPair::save_to_file`].
    pub fn load_from_file(path: &Path) -> Result<Self, HubError> {
        let pem = fs::read_to_string(path)
            .map_err(|e| HubError::InternalError(format!("read key {}: {e}", path.display())))?;
        Self::import_private(&pem)
    }
}

fn write_restricted(path: &Path, data: &[u8], mode: u32) -> Result<(), HubError> {
    // An existing read-only key file blocks a plain rewrite.
    if path.exists() {
        fs::remove_file(path)?;
    }
    fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sign_verify_round_trip_both_kinds() {
        for kind in [KeyKind::EcdsaP256, KeyKind::Ed25519] {
            let key = KeyPair::new_key(kind);
            let sig = key.sign(b"nonce-123").expect("sign");
            assert!(key.verify(b"nonce-123", &sig));
            assert!(!key.verify(b"other", &sig));
        }
    }

    #[test]
    fn pem_round_trip() {
        for kind in [KeyKind::EcdsaP256, KeyKind::Ed25519] {
            let key = KeyPair::new_key(kind);
            let private_pem = key.export_private().expect("export private");
            let public_pem = key.export_public().expect("export public");

            let reloaded = KeyPair::import_private(&private_pem).expect("import private");
            assert_eq!(reloaded.kind(), kind);
            assert_eq!(reloaded.export_public().expect("public"), public_pem);

            let public_only = KeyPair::import_public(&public_pem).expect("import public");
            assert!(!public_only.has_private());
            let sig = key.sign(b"payload").expect("sign");
            assert!(public_only.verify(b"payload", &sig));
        }
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(KeyPair::import_private("not a key").is_err());
        assert!(KeyPair::import_public("not a key").is_err());
    }

    #[test]
    fn save_and_load_key_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("svc.key");
        let key = KeyPair::new_key(KeyKind::Ed25519);
        key.save_to_file(&path).expect("save");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("stat").permissions().mode();
            assert_eq!(mode & 0o777, 0o400);
        }

        let reloaded = KeyPair::load_from_file(&path).expect("load");
        assert_eq!(
            reloaded.export_public().expect("public"),
            key.export_public().expect("public")
        );
    }

    #[test]
    fn save_fails_without_directory() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("svc.key");
        let key = KeyPair::new_key(KeyKind::Ed25519);
        assert!(key.save_to_file(&path).is_err());
    }
}
