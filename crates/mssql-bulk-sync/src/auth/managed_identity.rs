//! Azure managed identity token acquisition.
//!
//! Uses the App Service identity endpoint when `IDENTITY_ENDPOINT` and
//! `IDENTITY_HEADER` are set, otherwise the instance metadata service.

use super::{AccessToken, AccessTokenProvider};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Resource every Azure SQL token is requested for.
pub const SQL_RESOURCE: &str = "https://database.windows.net/";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

#[derive(Debug, Clone)]
enum Endpoint {
    Imds,
    AppService { url: String, header: String },
}

/// Token provider backed by the host's managed identity.
#[derive(Debug, Clone)]
pub struct ManagedIdentityTokenProvider {
    client: Client,
    endpoint: Endpoint,
    /// User-assigned identity; system-assigned when `None`.
    client_id: Option<String>,
}

impl ManagedIdentityTokenProvider {
    /// Detect the endpoint from the environment. `AZURE_CLIENT_ID` selects a
    /// user-assigned identity.
    pub fn from_env() -> Self {
        let endpoint = match (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            (Ok(url), Ok(header)) if !url.is_empty() => Endpoint::AppService { url, header },
            _ => Endpoint::Imds,
        };
        Self {
            client: Client::new(),
            endpoint,
            client_id: std::env::var("AZURE_CLIENT_ID").ok().filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

fn as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl TokenResponse {
    /// Absolute expiry: `expires_on` (epoch seconds) when present, else
    /// `now + expires_in`, else one hour.
    fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self
            .expires_on
            .as_ref()
            .and_then(as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            return at;
        }
        let secs = self.expires_in.as_ref().and_then(as_i64).unwrap_or(3600);
        now + Duration::seconds(secs)
    }
}

#[async_trait]
impl AccessTokenProvider for ManagedIdentityTokenProvider {
    async fn acquire(&self, tenant_id: &str) -> Result<AccessToken> {
        let token_err = |message: String| SyncError::Token {
            tenant: tenant_id.to_string(),
            message,
        };

        let mut request = match &self.endpoint {
            Endpoint::Imds => self
                .client
                .get(IMDS_ENDPOINT)
                .header("Metadata", "true")
                .query(&[("api-version", IMDS_API_VERSION), ("resource", SQL_RESOURCE)]),
            Endpoint::AppService { url, header } => self
                .client
                .get(url)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", APP_SERVICE_API_VERSION), ("resource", SQL_RESOURCE)]),
        };
        if let Some(client_id) = &self.client_id {
            request = request.query(&[("client_id", client_id)]);
        }

        debug!("Requesting managed identity token for tenant {}", tenant_id);
        let response = request
            .send()
            .await
            .map_err(|e| token_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(token_err(format!("identity endpoint returned {}: {}", status, body)));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| token_err(format!("invalid token response: {}", e)))?;

        Ok(AccessToken {
            expires_on: body.expires_at(Utc::now()),
            token: body.access_token,
        })
    }
}
