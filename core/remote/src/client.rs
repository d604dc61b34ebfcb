//! HTTP API client.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use clientsync_common::{read_config, ConfigSource, DatasetKind, Error, Payload, Result};

use crate::provider::RemoteSource;

/// Time allowed to establish a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for a whole request, body included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for the reachability check.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Response from the login endpoint.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Client for the remote API.
pub struct ApiClient {
    http: Client,
    config: Arc<dyn ConfigSource>,
    token: RwLock<Option<Zeroizing<String>>>,
}

impl ApiClient {
    /// Create a new API client.
    pub fn new(config: Arc<dyn ConfigSource>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("ClientSync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            token: RwLock::new(None),
        })
    }

    /// Path of a dataset relative to the API base URL.
    pub fn endpoint(kind: DatasetKind) -> &'static str {
        match kind {
            DatasetKind::Clients => "/clientes",
            DatasetKind::Contacts => "/contactos",
            DatasetKind::FeaturedClients => "/clientes/destacados",
        }
    }

    /// Log in with the configured credentials and cache the bearer token.
    pub async fn authenticate(&self) -> Result<()> {
        let base = read_config(&self.config, |c| c.api_url()).await?;
        let token = self.login(&base).await?;
        *self.token.write().await = Some(token);
        Ok(())
    }

    /// Drop the cached token; the next fetch logs in again.
    pub async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    async fn login(&self, base: &str) -> Result<Zeroizing<String>> {
        let credentials = read_config(&self.config, |c| c.credentials()).await?;
        let url = format!("{}/login", base);

        debug!("Authenticating against {}", url);

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "username": credentials.username,
                "password": credentials.password.as_str(),
            }))
            .send()
            .await
            .map_err(|e| transport_error("login", e))?;

        let response = check_status(response).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("login", e))?;
        let login: LoginResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::Decode(format!("Login response is not JSON: {}", e)))?;

        match login.token {
            Some(token) if !token.is_empty() => Ok(Zeroizing::new(token)),
            _ => Err(Error::Auth("No token in login response".to_string())),
        }
    }

    /// Authorization header, logging in first if needed.
    async fn auth_header(&self, base: &str) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(format!("Bearer {}", token.as_str()));
        }

        let token = self.login(base).await?;
        let header = format!("Bearer {}", token.as_str());
        *self.token.write().await = Some(token);
        Ok(header)
    }

    /// Send a HEAD request to the configured ping URL.
    ///
    /// Returns the HTTP status code on success.
    pub async fn ping(&self) -> Result<u16> {
        let url = read_config(&self.config, |c| c.ping_url()).await?;

        let response = self
            .http
            .head(&url)
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error("ping", e))?;

        let response = check_status(response).await?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl RemoteSource for ApiClient {
    fn name(&self) -> &str {
        "api"
    }

    async fn fetch(&self, kind: DatasetKind) -> Result<Payload> {
        let base = read_config(&self.config, |c| c.api_url()).await?;
        let url = format!("{}{}", base, Self::endpoint(kind));
        let auth = self.auth_header(&base).await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(kind.as_str(), e))?;

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(err @ Error::Auth(_)) => {
                warn!(dataset = %kind, "Token rejected, dropping it");
                self.invalidate_token().await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(kind.as_str(), e))?;

        serde_json::from_slice(&body).map_err(|e| {
            Error::Decode(format!("Response for {} is not JSON: {}", kind, e))
        })
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Network(format!("Request for {} timed out: {}", what, e))
    } else {
        Error::Network(format!("Request for {} failed: {}", what, e))
    }
}

/// Turn non-success responses into categorized errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(Error::Auth(format!("{} from {}", status, response.url())))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::HttpStatus {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        })
    }
}
