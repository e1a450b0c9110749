//! Bitwarden Secrets Manager client.
//!
//! Upstream bearer tokens can live in Bitwarden Secrets Manager. When
//! `BWS_ACCESS_TOKEN` is set each token is looked up there first; the value
//! from the environment is kept whenever the lookup fails, so local
//! development and CI work without a Bitwarden account.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};
use upstream::AuthToken;

use crate::config::GatewayConfig;

pub struct SecretsClient {
    /// BWS machine-account access token.
    access_token: Option<String>,
    api_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct BwsSecretResponse {
    value: String,
}

impl SecretsClient {
    /// Reads `BWS_ACCESS_TOKEN` and `BWS_API_URL`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("BWS_ACCESS_TOKEN").ok(),
            std::env::var("BWS_API_URL").unwrap_or_else(|_| "https://api.bitwarden.com".to_string()),
        )
    }

    pub fn new(access_token: Option<String>, api_url: String) -> Self {
        Self {
            access_token: access_token.filter(|t| !t.trim().is_empty()),
            api_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.access_token.is_some()
    }

    /// Secret `secret_id`, or `fallback` when Bitwarden is not configured or
    /// the lookup fails.
    pub async fn resolve(&self, secret_id: &str, fallback: AuthToken) -> AuthToken {
        let Some(token) = &self.access_token else {
            return fallback;
        };
        match self.fetch_from_bitwarden(token, secret_id).await {
            Ok(value) => {
                debug!(secret_id, "secret resolved from Bitwarden");
                AuthToken::new(value)
            }
            Err(e) => {
                warn!(
                    secret_id,
                    error = %e,
                    "Failed to fetch secret from Bitwarden, keeping configured value"
                );
                fallback
            }
        }
    }

    /// Replace each upstream token with its Bitwarden counterpart.
    pub async fn resolve_upstream_tokens(&self, config: &mut GatewayConfig) {
        if !self.is_enabled() {
            return;
        }
        for upstream in &mut config.upstreams {
            let fallback = upstream.token.clone();
            upstream.token = self.resolve(upstream.token_secret_id, fallback).await;
        }
    }

    async fn fetch_from_bitwarden(&self, token: &str, secret_id: &str) -> Result<String> {
        let url = format!("{}/secrets/{}", self.api_url, secret_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("HTTP request to Bitwarden Secrets Manager failed")?;

        if !resp.status().is_success() {
            return Err(anyhow!("Bitwarden API returned status {}", resp.status()));
        }

        let body: BwsSecretResponse = resp
            .json()
            .await
            .context("Failed to parse Bitwarden response")?;
        Ok(body.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn without_access_token_the_configured_value_is_kept() {
        let client = SecretsClient::new(Some("  ".into()), "http://127.0.0.1:9".into());
        assert!(!client.is_enabled());

        let token = client.resolve("user-token", AuthToken::new("from-env")).await;
        assert_eq!(token.expose(), "from-env");
    }

    #[tokio::test]
    async fn failed_lookup_falls_back() {
        // Port 9 (discard) is not listening; the request fails to connect.
        let client = SecretsClient::new(Some("bws".into()), "http://127.0.0.1:9".into());
        let token = client.resolve("user-token", AuthToken::new("from-env")).await;
        assert_eq!(token.expose(), "from-env");
    }
}
