//! Token issuance and validation.
//!
//! Tokens are self-contained signed JWS envelopes binding the client id,
//! client type, role and the client's public key to an expiry. Nothing is
//! tracked server-side: invalidation is by expiry or by rotating the
//! runtime's signing key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use hub_core::{now_ms, HubError};

use crate::keys::{KeyKind, KeyPair};
use crate::models::{AuthInfo, ClientType};

/// Signature algorithms accepted when validating a token.
const ALLOWED_ALGORITHMS: &[Algorithm] =
    &[Algorithm::ES256, Algorithm::ES384, Algorithm::EdDSA];

/// Token lifetime defaults per client type, overridable per record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenValidity {
    pub agent_days: u32,
    pub service_days: u32,
    pub consumer_days: u32,
}

impl Default for TokenValidity {
    fn default() -> Self {
        Self {
            agent_days: 90,
            service_days: 365,
            consumer_days: 30,
        }
    }
}

impl TokenValidity {
    fn days_for(&self, client_type: ClientType, record_override: u32) -> u32 {
        if record_override != 0 {
            return record_override;
        }
        match client_type {
            ClientType::Agent => self.agent_days,
            ClientType::Service => self.service_days,
            ClientType::Consumer => self.consumer_days,
        }
    }
}

/// The signed claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Token type marker.
    pub typ: String,
    /// Subject: the client's public key PEM.
    pub sub: String,
    /// Audience: the client type.
    pub aud: String,
    /// Issuer: the runtime's signing public key PEM.
    pub iss: String,
    /// Issued at, seconds since epoch.
    pub iat: i64,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    pub client_id: String,
    pub client_type: ClientType,
    pub role: String,
}

pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    signing_public_pem: String,
    validity: TokenValidity,
}

impl TokenIssuer {
    /// Build an issuer around the runtime's signing key pair.
    pub fn new(signing_key: &KeyPair, validity: TokenValidity) -> Result<Self, HubError> {
        let private_pem = signing_key.export_private()?;
        let public_pem = signing_key.export_public()?;
        let (algorithm, encoding_key, decoding_key) = match signing_key.kind() {
            KeyKind::EcdsaP256 => (
                Algorithm::ES256,
                EncodingKey::from_ec_pem(private_pem.as_bytes())
                    .map_err(|e| HubError::InvalidArgument(format!("signing key: {e}")))?,
                DecodingKey::from_ec_pem(public_pem.as_bytes())
                    .map_err(|e| HubError::InvalidArgument(format!("signing key: {e}")))?,
            ),
            KeyKind::Ed25519 => (
                Algorithm::EdDSA,
                EncodingKey::from_ed_pem(private_pem.as_bytes())
                    .map_err(|e| HubError::InvalidArgument(format!("signing key: {e}")))?,
                DecodingKey::from_ed_pem(public_pem.as_bytes())
                    .map_err(|e| HubError::InvalidArgument(format!("signing key: {e}")))?,
            ),
        };
        Ok(Self {
            encoding_key,
            decoding_key,
            algorithm,
            signing_public_pem: public_pem,
            validity,
        })
    }

    /// The PEM of the key tokens are verified against; placed in `iss`.
    pub fn signing_public_key_pem(&self) -> &str {
        &self.signing_public_pem
    }

    /// Create a signed token for an authenticated client.
    ///
    /// `validity_days_override` of 0 selects the default for the client type.
    pub fn create_token(
        &self,
        auth: &AuthInfo,
        validity_days_override: u32,
    ) -> Result<String, HubError> {
        auth.validate_for_token()?;
        let days = self
            .validity
            .days_for(auth.client_type, validity_days_override);
        let iat = now_ms() / 1000;
        let claims = TokenClaims {
            typ: "hiveot".to_string(),
            sub: auth.public_key.clone(),
            aud: auth.client_type.as_str().to_string(),
            iss: self.signing_public_pem.clone(),
            iat,
            exp: iat + i64::from(days) * 86_400,
            client_id: auth.client_id.clone(),
            client_type: auth.client_type,
            role: auth.role.clone(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| HubError::InternalError(format!("sign token: {e}")))
    }

    fn decode_claims(&self, token: &str) -> Result<TokenClaims, HubError> {
        let header = decode_header(token)
            .map_err(|e| HubError::InvalidToken(format!("header: {e}")))?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(HubError::InvalidToken(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_aud = false;

        let data = decode::<TokenClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    HubError::TokenExpired("token expiry is in the past".to_string())
                }
                _ => HubError::InvalidToken(e.to_string()),
            }
        })?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(HubError::InvalidToken("missing public key".to_string()));
        }
        if claims.role.is_empty() {
            return Err(HubError::InvalidToken("missing role".to_string()));
        }
        Ok(claims)
    }

    /// Validate a token where the transport has no identity channel of its
    /// own; the verified subject claims are the identity.
    pub fn validate_bearer(&self, token: &str) -> Result<AuthInfo, HubError> {
        let claims = self.decode_claims(token)?;
        Ok(AuthInfo {
            client_id: claims.client_id,
            client_type: claims.client_type,
            role: claims.role,
            public_key: claims.sub,
        })
    }

    /// Decode and verify a token presented by `expected_client_id`.
    ///
    /// When a connect-time challenge is in play, `nonce` and `signed_nonce`
    /// prove possession of the private key matching the token's subject.
    pub fn validate_token(
        &self,
        expected_client_id: &str,
        token: &str,
        signed_nonce: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<AuthInfo, HubError> {
        let claims = self.decode_claims(token)?;

        if claims.client_id != expected_client_id {
            return Err(HubError::TokenMismatch(format!(
                "token for '{}' presented by '{expected_client_id}'",
                claims.client_id
            )));
        }

        if let (Some(signed_nonce), Some(nonce)) = (signed_nonce, nonce) {
            let client_key = KeyPair::import_public(&claims.sub)
                .map_err(|_| HubError::InvalidToken("unparseable public key".to_string()))?;
            let signature = BASE64
                .decode(signed_nonce)
                .map_err(|_| HubError::InvalidToken("signed nonce not base64".to_string()))?;
            if !client_key.verify(nonce.as_bytes(), &signature) {
                return Err(HubError::InvalidToken(
                    "nonce signature mismatch".to_string(),
                ));
            }
        }

        Ok(AuthInfo {
            client_id: claims.client_id,
            client_type: claims.client_type,
            role: claims.role,
            public_key: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer_with(kind: KeyKind) -> (TokenIssuer, KeyPair) {
        let signing = KeyPair::new_key(kind);
        let issuer = TokenIssuer::new(&signing, TokenValidity::default()).expect("issuer");
        (issuer, signing)
    }

    fn consumer_auth(client_key: &KeyPair) -> AuthInfo {
        AuthInfo {
            client_id: "alice".to_string(),
            client_type: ClientType::Consumer,
            role: "viewer".to_string(),
            public_key: client_key.export_public().expect("public pem"),
        }
    }

    #[test]
    fn round_trip_preserves_identity() {
        for kind in [KeyKind::EcdsaP256, KeyKind::Ed25519] {
            let (issuer, _) = issuer_with(kind);
            let client_key = KeyPair::new_key(KeyKind::Ed25519);
            let token = issuer
                .create_token(&consumer_auth(&client_key), 0)
                .expect("create");

            let auth = issuer
                .validate_token("alice", &token, None, None)
                .expect("validate");
            assert_eq!(auth.client_id, "alice");
            assert_eq!(auth.role, "viewer");
            assert_eq!(auth.client_type, ClientType::Consumer);
        }
    }

    #[test]
    fn missing_fields_fail_issuance() {
        let (issuer, _) = issuer_with(KeyKind::EcdsaP256);
        let client_key = KeyPair::new_key(KeyKind::Ed25519);
        let mut auth = consumer_auth(&client_key);
        auth.public_key = String::new();
        assert!(issuer.create_token(&auth, 0).is_err());

        let mut auth = consumer_auth(&client_key);
        auth.role = String::new();
        assert!(issuer.create_token(&auth, 0).is_err());
    }

    #[test]
    fn forged_token_is_rejected() {
        let (issuer, _) = issuer_with(KeyKind::EcdsaP256);
        let (forger, _) = issuer_with(KeyKind::EcdsaP256);
        let client_key = KeyPair::new_key(KeyKind::Ed25519);
        let forged = forger
            .create_token(&consumer_auth(&client_key), 0)
            .expect("create");

        let err = issuer
            .validate_token("alice", &forged, None, None)
            .expect_err("must fail");
        assert_eq!(err.kind(), "InvalidToken");
    }

    #[test]
    fn expired_token_is_rejected() {
        let (issuer, signing) = issuer_with(KeyKind::EcdsaP256);
        let client_key = KeyPair::new_key(KeyKind::Ed25519);
        let iat = now_ms() / 1000 - 120;
        let claims = TokenClaims {
            typ: "hiveot".to_string(),
            sub: client_key.export_public().expect("public"),
            aud: "consumer".to_string(),
            iss: issuer.signing_public_key_pem().to_string(),
            iat,
            exp: iat + 60,
            client_id: "alice".to_string(),
            client_type: ClientType::Consumer,
            role: "viewer".to_string(),
        };
        let encoding = EncodingKey::from_ec_pem(
            signing.export_private().expect("private").as_bytes(),
        )
        .expect("key");
        let token =
            encode(&Header::new(Algorithm::ES256), &claims, &encoding).expect("encode");

        let err = issuer
            .validate_token("alice", &token, None, None)
            .expect_err("must fail");
        assert_eq!(err.kind(), "TokenExpired");
    }

    #[test]
    fn token_for_other_client_is_mismatch() {
        let (issuer, _) = issuer_with(KeyKind::EcdsaP256);
        let client_key = KeyPair::new_key(KeyKind::Ed25519);
        let token = issuer
            .create_token(&consumer_auth(&client_key), 0)
            .expect("create");

        let err = issuer
            .validate_token("mallory", &token, None, None)
            .expect_err("must fail");
        assert_eq!(err.kind(), "TokenMismatch");
    }

    #[test]
    fn nonce_challenge_requires_matching_key() {
        let (issuer, _) = issuer_with(KeyKind::EcdsaP256);
        let client_key = KeyPair::new_key(KeyKind::Ed25519);
        let token = issuer
            .create_token(&consumer_auth(&client_key), 0)
            .expect("create");

        let nonce = "challenge-42";
        let signed = BASE64.encode(client_key.sign(nonce.as_bytes()).expect("sign"));
        assert!(issuer
            .validate_token("alice", &token, Some(&signed), Some(nonce))
            .is_ok());

        let other_key = KeyPair::new_key(KeyKind::Ed25519);
        let bad = BASE64.encode(other_key.sign(nonce.as_bytes()).expect("sign"));
        let err = issuer
            .validate_token("alice", &token, Some(&bad), Some(nonce))
            .expect_err("must fail");
        assert_eq!(err.kind(), "InvalidToken");
    }
}
