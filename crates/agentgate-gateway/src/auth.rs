use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;

/// Paths served without authentication.
pub const PUBLIC_PATHS: &[&str] = &["/health", "/ready", "/openapi.json"];

pub fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

/// The caller identity established per request. Never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct Principal {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub dev: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    exp: u64,
}

/// Bearer-token verifier. With a configured secret, tokens are standard
/// three-segment HS256 credentials whose `exp` must be in the future.
/// Without one the gateway runs in explicit development mode and every
/// request gets a synthetic admin principal.
#[derive(Clone)]
pub enum AuthVerifier {
    Hs256 {
        key: DecodingKey,
        validation: Validation,
    },
    Development,
}

impl AuthVerifier {
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret.filter(|secret| !secret.is_empty()) {
            Some(secret) => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.leeway = 0;
                AuthVerifier::Hs256 {
                    key: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                }
            }
            None => AuthVerifier::Development,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, AuthVerifier::Development)
    }

    pub fn verify(&self, authorization: Option<&str>) -> Result<Principal, ApiError> {
        match self {
            AuthVerifier::Development => Ok(Principal {
                sub: "anonymous".to_string(),
                role: Some("admin".to_string()),
                dev: true,
            }),
            AuthVerifier::Hs256 { key, validation } => {
                let header = authorization.ok_or_else(|| {
                    ApiError::Unauthorized("missing Authorization header".to_string())
                })?;
                let token = header.strip_prefix("Bearer ").ok_or_else(|| {
                    ApiError::Unauthorized("expected a Bearer token".to_string())
                })?;
                let data = decode::<Claims>(token, key, validation)
                    .map_err(|_| ApiError::Unauthorized("token rejected".to_string()))?;
                Ok(Principal {
                    sub: data.claims.sub,
                    role: data.claims.role,
                    dev: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "unit-test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn mint(sub: &str, exp: u64) -> String {
        encode(
            &Header::default(),
            &Claims {
                sub: sub.to_string(),
                role: Some("agent".to_string()),
                exp,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_principal() {
        let verifier = AuthVerifier::from_secret(Some(SECRET));
        let token = mint("agent-7", now() + 600);
        let principal = verifier
            .verify(Some(&format!("Bearer {token}")))
            .expect("token accepted");
        assert_eq!(principal.sub, "agent-7");
        assert_eq!(principal.role.as_deref(), Some("agent"));
        assert!(!principal.dev);
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let verifier = AuthVerifier::from_secret(Some(SECRET));
        assert!(matches!(
            verifier.verify(None),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn non_bearer_scheme_is_unauthorized() {
        let verifier = AuthVerifier::from_secret(Some(SECRET));
        assert!(matches!(
            verifier.verify(Some("Basic abc")),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let verifier = AuthVerifier::from_secret(Some(SECRET));
        let token = mint("agent-7", now() - 3600);
        assert!(matches!(
            verifier.verify(Some(&format!("Bearer {token}"))),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let verifier = AuthVerifier::from_secret(Some("different-secret"));
        let token = mint("agent-7", now() + 600);
        assert!(matches!(
            verifier.verify(Some(&format!("Bearer {token}"))),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn dev_mode_synthesizes_admin() {
        let verifier = AuthVerifier::from_secret(None);
        assert!(verifier.is_dev());
        let principal = verifier.verify(None).expect("dev principal");
        assert_eq!(principal.sub, "anonymous");
        assert_eq!(principal.role.as_deref(), Some("admin"));
        assert!(principal.dev);

        let empty = AuthVerifier::from_secret(Some(""));
        assert!(empty.is_dev());
    }
}
