//! Access tokens per datacenter.
//!
//! One [`CredentialCache`] is built at startup and shared by every gateway.
//! Tokens are cached by datacenter name until shortly before they expire.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::GatewayError;
use crate::model::DatacenterRecord;

/// Tokens are refreshed this long before their stated expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Credential material stored on a datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// A pre-issued OAuth access token.
    AccessToken {
        access_token: String,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Token minted by the GCE metadata server for a service account.
    MetadataServer {
        #[serde(default)]
        service_account: Option<String>,
    },
}

impl CredentialSource {
    pub fn from_datacenter(datacenter: &DatacenterRecord) -> Result<Self, GatewayError> {
        serde_json::from_value(datacenter.credentials.clone()).map_err(|e| {
            GatewayError::Credentials(format!(
                "datacenter {} has unusable credentials: {e}",
                datacenter.name
            ))
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) > now)
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

/// Token cache keyed by datacenter name.
pub struct CredentialCache {
    http: reqwest::Client,
    /// Base of the metadata server's service-account endpoints.
    metadata_url: String,
    tokens: RwLock<HashMap<String, CachedToken>>,
}

impl CredentialCache {
    pub fn new(http: reqwest::Client, metadata_url: impl Into<String>) -> Self {
        Self {
            http,
            metadata_url: metadata_url.into(),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a bearer token for the datacenter, minting one if the cached
    /// token is missing or about to expire.
    pub async fn token(&self, datacenter: &DatacenterRecord) -> Result<String, GatewayError> {
        let now = Utc::now();
        if let Some(cached) = self.tokens.read().await.get(&datacenter.name) {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let fresh = match CredentialSource::from_datacenter(datacenter)? {
            CredentialSource::AccessToken {
                access_token,
                expires_at,
            } => CachedToken {
                token: access_token,
                expires_at,
            },
            CredentialSource::MetadataServer { service_account } => {
                self.fetch_metadata_token(service_account.as_deref().unwrap_or("default"))
                    .await?
            }
        };

        if !fresh.is_fresh(now) {
            return Err(GatewayError::Credentials(format!(
                "token for datacenter {} is expired",
                datacenter.name
            )));
        }

        debug!(datacenter = %datacenter.name, expires_at = ?fresh.expires_at, "Cached access token");
        let token = fresh.token.clone();
        self.tokens
            .write()
            .await
            .insert(datacenter.name.clone(), fresh);
        Ok(token)
    }

    /// Drops a datacenter's token so the next call mints a new one.
    pub async fn invalidate(&self, datacenter: &str) {
        if self.tokens.write().await.remove(datacenter).is_some() {
            info!(datacenter, "Invalidated cached access token");
        }
    }

    async fn fetch_metadata_token(&self, service_account: &str) -> Result<CachedToken, GatewayError> {
        let url = format!("{}/{}/token", self.metadata_url, service_account);
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                operation: "fetch metadata token",
                status: status.as_u16(),
                body,
            });
        }

        let token: MetadataToken = response.json().await?;
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Some(Utc::now() + Duration::seconds(token.expires_in)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prescale_id::DatacenterId;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn datacenter(credentials: serde_json::Value) -> DatacenterRecord {
        DatacenterRecord {
            id: DatacenterId::new(),
            name: "gcp-main".to_string(),
            credentials,
        }
    }

    #[tokio::test]
    async fn test_static_token() {
        let cache = CredentialCache::new(reqwest::Client::new(), "http://unused");
        let dc = datacenter(json!({"type": "access_token", "access_token": "ya29.static"}));
        assert_eq!(cache.token(&dc).await.unwrap(), "ya29.static");
    }

    #[tokio::test]
    async fn test_expired_static_token_rejected() {
        let cache = CredentialCache::new(reqwest::Client::new(), "http://unused");
        let dc = datacenter(json!({
            "type": "access_token",
            "access_token": "ya29.old",
            "expires_at": "2020-01-01T00:00:00Z"
        }));
        assert!(matches!(
            cache.token(&dc).await,
            Err(GatewayError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_credential_type() {
        let cache = CredentialCache::new(reqwest::Client::new(), "http://unused");
        let dc = datacenter(json!({"type": "service_account_key", "key": "..."}));
        assert!(matches!(
            cache.token(&dc).await,
            Err(GatewayError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_token_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/service-accounts/default/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.minted",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(
            reqwest::Client::new(),
            format!("{}/service-accounts", server.uri()),
        );
        let dc = datacenter(json!({"type": "metadata_server"}));

        assert_eq!(cache.token(&dc).await.unwrap(), "ya29.minted");
        assert_eq!(cache.token(&dc).await.unwrap(), "ya29.minted");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/service-accounts/builder@proj.iam.gserviceaccount.com/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.minted",
                "expires_in": 3599
            })))
            .expect(2)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(
            reqwest::Client::new(),
            format!("{}/service-accounts", server.uri()),
        );
        let dc = datacenter(json!({
            "type": "metadata_server",
            "service_account": "builder@proj.iam.gserviceaccount.com"
        }));

        cache.token(&dc).await.unwrap();
        cache.invalidate("gcp-main").await;
        cache.token(&dc).await.unwrap();
    }
}
