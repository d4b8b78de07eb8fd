//! Authentication utilities
//!
//! Provides:
//! - API key hashing, validation and generation
//! - Account directory built from configuration
//! - `AuthContext` extractor for handlers

use crate::config::AuthConfig;
use crate::errors::{AppError, Result};
use crate::quota::Plan;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Extracted authentication context available to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated (or declared, when anonymous) user
    pub user_id: Uuid,

    /// Plan that determines quota limits
    pub plan: Plan,

    /// Request ID for tracing
    pub request_id: String,
}

/// A known API key holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: Uuid,
    pub plan: Plan,
}

/// Lookup table from API key hash to account
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    accounts: HashMap<String, Account>,
    allow_anonymous: bool,
    anonymous_plan: Plan,
    user_header: String,
    request_id_header: String,
}

impl AccountDirectory {
    pub fn from_config(config: &AuthConfig, anonymous_plan: Plan) -> Self {
        let accounts = config
            .accounts
            .iter()
            .map(|entry| {
                (
                    entry.api_key_hash.to_lowercase(),
                    Account {
                        user_id: entry.user_id,
                        plan: entry.plan,
                    },
                )
            })
            .collect();

        Self {
            accounts,
            allow_anonymous: config.allow_anonymous,
            anonymous_plan,
            user_header: config.user_header.to_lowercase(),
            request_id_header: config.request_id_header.to_lowercase(),
        }
    }

    /// Resolve a raw API key
    pub fn lookup(&self, api_key: &str) -> Option<&Account> {
        self.accounts.get(&hash_api_key(api_key))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn allows_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    /// Resolve the caller from request headers
    pub fn authenticate(&self, parts: &Parts) -> Result<AuthContext> {
        let request_id = parts
            .headers
            .get(self.request_id_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        if let Some(header) = auth_header {
            let key = extract_api_key(header).ok_or_else(|| AppError::Unauthorized {
                message: "Authorization header must use the Bearer scheme".to_string(),
            })?;
            let account = self.lookup(key).ok_or(AppError::InvalidApiKey)?;
            return Ok(AuthContext {
                user_id: account.user_id,
                plan: account.plan,
                request_id,
            });
        }

        if !self.allow_anonymous {
            return Err(AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
            });
        }

        let user_id = parts
            .headers
            .get(self.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: format!("Missing or invalid {} header", self.user_header),
            })?;

        Ok(AuthContext {
            user_id,
            plan: self.anonymous_plan,
            request_id,
        })
    }
}

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new API key
pub fn generate_api_key() -> String {
    let random_bytes: [u8; 32] = rand::random();
    format!("rd_{}", hex::encode(random_bytes))
}

/// Extract API key from Authorization header
pub fn extract_api_key(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Axum extractor for AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
    Arc<AccountDirectory>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let directory = Arc::<AccountDirectory>::from_ref(state);
        let context = directory.authenticate(parts)?;
        parts.extensions.insert(context.clone());
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountEntry;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/v1/search");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn directory(allow_anonymous: bool) -> (AccountDirectory, Uuid) {
        let user_id = Uuid::new_v4();
        let config = AuthConfig {
            accounts: vec![AccountEntry {
                api_key_hash: hash_api_key("rd_known"),
                user_id,
                plan: Plan::Pro,
            }],
            allow_anonymous,
            ..AuthConfig::default()
        };
        (AccountDirectory::from_config(&config, Plan::Free), user_id)
    }

    #[test]
    fn test_hash_api_key() {
        let key = "rd_test_12345";
        let hash = hash_api_key(key);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key(key));
        assert_ne!(hash, hash_api_key("wrong_key"));
    }

    #[test]
    fn test_generate_api_key() {
        let key = generate_api_key();
        assert!(key.starts_with("rd_"));
        assert_eq!(key.len(), 3 + 64);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_extract_api_key() {
        assert_eq!(extract_api_key("Bearer rd_123"), Some("rd_123"));
        assert_eq!(extract_api_key("rd_123"), None);
        assert_eq!(extract_api_key("Basic abc"), None);
        assert_eq!(extract_api_key("Bearer "), None);
    }

    #[test]
    fn test_known_key_resolves_account() {
        let (dir, user_id) = directory(false);
        let ctx = dir
            .authenticate(&parts(&[
                ("authorization", "Bearer rd_known"),
                ("x-request-id", "req-1"),
            ]))
            .unwrap();
        assert_eq!(ctx.user_id, user_id);
        assert_eq!(ctx.plan, Plan::Pro);
        assert_eq!(ctx.request_id, "req-1");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let (dir, _) = directory(true);
        let err = dir
            .authenticate(&parts(&[("authorization", "Bearer rd_other")]))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidApiKey));
    }

    #[test]
    fn test_missing_header_without_anonymous() {
        let (dir, _) = directory(false);
        let err = dir.authenticate(&parts(&[])).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized { .. }));
    }

    #[test]
    fn test_anonymous_uses_user_header() {
        let (dir, _) = directory(true);
        let user = Uuid::new_v4();
        let ctx = dir
            .authenticate(&parts(&[("X-User-ID", &user.to_string())]))
            .unwrap();
        assert_eq!(ctx.user_id, user);
        assert_eq!(ctx.plan, Plan::Free);
        assert!(!ctx.request_id.is_empty());

        let err = dir
            .authenticate(&parts(&[("X-User-ID", "not-a-uuid")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized { .. }));
    }
}
