//! step-ca HTTP API Client
//!
//! The engine talks to the CA before its root is trusted anywhere, so the
//! discovery client skips certificate validation; root integrity comes from
//! fingerprint pinning in the credential acquirer instead.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::error::{Result, TrustError};

pub const HEALTH_PATH: &str = "/health";
pub const ACME_DIRECTORY_PATH: &str = "/acme/acme/directory";
pub const ROOTS_PATH: &str = "/roots";
pub const INTERMEDIATES_PATH: &str = "/intermediates";

/// Endpoints of the CA consumed by readiness and acquisition
#[async_trait]
pub trait CaApi: Send + Sync {
    /// `GET /health` returned a success status
    async fn health(&self, base_url: &str) -> Result<()>;

    /// Body of the ACME directory
    async fn acme_directory(&self, base_url: &str) -> Result<serde_json::Value>;

    /// PEM entries of `GET /roots`, current root first
    async fn roots(&self, base_url: &str) -> Result<Vec<String>>;

    /// PEM entries of `GET /intermediates`
    async fn intermediates(&self, base_url: &str) -> Result<Vec<String>>;

    /// `GET /health` validated against the local system trust store
    async fn verify_trusted(&self, base_url: &str) -> Result<()>;
}

/// Certificate list body shared by `/roots` and `/intermediates`
#[derive(Debug, Deserialize)]
struct CertificateList {
    #[serde(default)]
    crts: Vec<String>,
}

/// reqwest backed CA client
pub struct HttpCaApi {
    http_client: Client,
    timeout: Duration,
}

impl HttpCaApi {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TrustError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            timeout,
        })
    }

    async fn get(&self, client: &Client, url: &str) -> Result<reqwest::Response> {
        debug!(url = %url, "Calling CA API");
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| TrustError::Http(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TrustError::Http(format!("GET {} returned {}: {}", url, status, text.trim())));
        }
        Ok(response)
    }

    async fn certificate_list(&self, url: &str) -> Result<Vec<String>> {
        let list: CertificateList = self
            .get(&self.http_client, url)
            .await?
            .json()
            .await
            .map_err(|e| TrustError::Http(format!("GET {}: bad body: {}", url, e)))?;
        Ok(list.crts)
    }
}

#[async_trait]
impl CaApi for HttpCaApi {
    async fn health(&self, base_url: &str) -> Result<()> {
        self.get(&self.http_client, &format!("{}{}", base_url, HEALTH_PATH))
            .await
            .map(|_| ())
    }

    async fn acme_directory(&self, base_url: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", base_url, ACME_DIRECTORY_PATH);
        self.get(&self.http_client, &url)
            .await?
            .json()
            .await
            .map_err(|e| TrustError::Http(format!("GET {}: bad body: {}", url, e)))
    }

    async fn roots(&self, base_url: &str) -> Result<Vec<String>> {
        self.certificate_list(&format!("{}{}", base_url, ROOTS_PATH)).await
    }

    async fn intermediates(&self, base_url: &str) -> Result<Vec<String>> {
        self.certificate_list(&format!("{}{}", base_url, INTERMEDIATES_PATH))
            .await
    }

    async fn verify_trusted(&self, base_url: &str) -> Result<()> {
        // Fresh client so it loads the trust store as it is now.
        let strict = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TrustError::Http(format!("failed to create HTTP client: {}", e)))?;

        self.get(&strict, &format!("{}{}", base_url, HEALTH_PATH))
            .await
            .map(|_| ())
    }
}
