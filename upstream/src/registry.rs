//! Endpoint registry.
//!
//! Built once at start-up from configuration and shared read-only by every
//! component afterwards.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Logical names of the services the gateway knows about.
pub mod services {
    pub const USER_MANAGEMENT: &str = "user_management";
    pub const PROPERTY_LISTING: &str = "property_listing";
    pub const PAYMENT_PROCESSING: &str = "payment_processing";
    pub const SEARCH_FILTERS: &str = "search_filters";
    pub const AI_RECOMMENDATION: &str = "ai_recommendation";
    pub const NOTIFICATION: &str = "notification";
}

const API_PREFIX: &str = "/api/v1";

// ------------------------------------------------------------------ //
//  Auth token                                                         //
// ------------------------------------------------------------------ //

/// Internal bearer token for an upstream. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("AuthToken(<none>)")
        } else {
            f.write_str("AuthToken(<redacted>)")
        }
    }
}

// ------------------------------------------------------------------ //
//  Errors                                                             //
// ------------------------------------------------------------------ //

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid base URL for `{name}`: {url} ({reason})")]
    InvalidUrl {
        name: String,
        url: String,
        reason: String,
    },
    #[error("endpoint `{0}` registered twice")]
    Duplicate(String),
    #[error("endpoint `{0}` is not registered")]
    Unknown(String),
}

// ------------------------------------------------------------------ //
//  Descriptor                                                         //
// ------------------------------------------------------------------ //

/// One upstream service.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    name: String,
    base_url: String,
    auth_token: AuthToken,
    optional: bool,
}

impl EndpointDescriptor {
    /// Validate and normalise a base URL.
    ///
    /// Trailing slashes and a `/docs` suffix (a lot of deployments hand out
    /// their Swagger URL) are stripped.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        auth_token: AuthToken,
        optional: bool,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let mut base = base_url.trim().trim_end_matches('/').to_string();
        if let Some(stripped) = base.strip_suffix("/docs") {
            base = stripped.trim_end_matches('/').to_string();
        }

        let invalid = |reason: String| RegistryError::InvalidUrl {
            name: name.clone(),
            url: base_url.to_string(),
            reason,
        };
        let parsed = reqwest::Url::parse(&base).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme `{}`", parsed.scheme())));
        }

        Ok(Self {
            name,
            base_url: base,
            auth_token,
            optional,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth_token(&self) -> &AuthToken {
        &self.auth_token
    }

    /// Optional services never pull the overall status down to `down`.
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Base with the `/api/v1` prefix, added only when missing.
    pub fn api_base(&self) -> String {
        if self.base_url.ends_with(API_PREFIX) {
            self.base_url.clone()
        } else {
            format!("{}{API_PREFIX}", self.base_url)
        }
    }

    /// Base without a trailing `/api/v1`.
    pub fn root_url(&self) -> &str {
        self.base_url
            .strip_suffix(API_PREFIX)
            .unwrap_or(&self.base_url)
    }

    pub fn has_api_prefix(&self) -> bool {
        self.base_url.ends_with(API_PREFIX)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base(), path)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

// ------------------------------------------------------------------ //
//  Registry                                                           //
// ------------------------------------------------------------------ //

/// Immutable endpoint table. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Arc<[EndpointDescriptor]>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Result<Self, RegistryError> {
        for (i, endpoint) in endpoints.iter().enumerate() {
            if endpoints[..i].iter().any(|e| e.name == endpoint.name) {
                return Err(RegistryError::Duplicate(endpoint.name.clone()));
            }
        }
        Ok(Self {
            endpoints: endpoints.into(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&EndpointDescriptor, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, url: &str) -> EndpointDescriptor {
        EndpointDescriptor::new(name, url, AuthToken::new("secret"), false).unwrap()
    }

    #[test]
    fn trailing_slash_and_docs_are_stripped() {
        let e = endpoint("svc", "https://svc.example.com/docs/");
        assert_eq!(e.base_url(), "https://svc.example.com");
    }

    #[test]
    fn api_prefix_added_once() {
        let plain = endpoint("a", "http://a.local");
        assert_eq!(plain.api_url("/users"), "http://a.local/api/v1/users");

        let prefixed = endpoint("b", "http://b.local/api/v1/");
        assert_eq!(prefixed.api_url("/users"), "http://b.local/api/v1/users");
        assert_eq!(prefixed.root_url(), "http://b.local");
        assert!(prefixed.has_api_prefix());
    }

    #[test]
    fn rejects_non_http_urls() {
        let err = EndpointDescriptor::new("x", "ftp://x.local", AuthToken::default(), false);
        assert!(matches!(err, Err(RegistryError::InvalidUrl { .. })));

        let err = EndpointDescriptor::new("y", "not a url", AuthToken::default(), false);
        assert!(matches!(err, Err(RegistryError::InvalidUrl { .. })));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = EndpointRegistry::new(vec![endpoint("a", "http://a"), endpoint("a", "http://b")]);
        assert!(matches!(err, Err(RegistryError::Duplicate(name)) if name == "a"));
    }

    #[test]
    fn lookup_by_name() {
        let registry =
            EndpointRegistry::new(vec![endpoint("a", "http://a"), endpoint("b", "http://b")])
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("b").unwrap().base_url(), "http://b");
        assert!(matches!(registry.require("c"), Err(RegistryError::Unknown(_))));
    }

    #[test]
    fn token_is_redacted_in_debug_output() {
        let e = endpoint("svc", "http://svc");
        let printed = format!("{e:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("<redacted>"));
    }
}
