//! HTTP client for the remote CRUD API.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use satchel_common::{CollectionName, Collections, Error, Result};

use crate::api::{record_from_value, records_from_value, unwrap_envelope, RemoteApi, RemoteRecord};

/// Source of the bearer token sent with every request.
///
/// The credential store itself lives outside the engine; this seam is all
/// the engine knows about it.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token.
    async fn token(&self) -> Result<String>;
}

/// Fixed token, for deployments where the credential is provisioned once.
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a provisioned token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Remote API client over HTTP.
///
/// Each collection maps to one resource path under the base URL; bodies are
/// JSON inside the `{ "data": ... }` envelope. Every request carries the
/// bearer token and a bounded timeout.
pub struct HttpRemote {
    http: Client,
    base: Url,
    collections: Collections,
    token: Arc<dyn TokenSource>,
}

impl HttpRemote {
    /// Create a new client.
    ///
    /// # Errors
    /// - Invalid base URL
    /// - HTTP client construction failure
    pub fn new(
        base_url: &str,
        collections: Collections,
        token: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        let http = Client::builder()
            .user_agent("Satchel/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            collections,
            token,
        })
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.token.token().await?;
        Ok(format!("Bearer {}", token))
    }

    fn collection_url(&self, collection: &CollectionName) -> Result<Url> {
        let path = self.collections.remote_path(collection)?;
        self.base
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid resource path: {}", e)))
    }

    fn resource_url(&self, collection: &CollectionName, id: &str) -> Result<Url> {
        let path = self.collections.remote_path(collection)?;
        self.base
            .join(&format!("{}/{}", path.trim_end_matches('/'), id))
            .map_err(|e| Error::InvalidInput(format!("Invalid resource path: {}", e)))
    }

    fn transport_error(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }

    /// Map a response to the envelope payload or a classified error.
    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status.is_success() {
            let body: Value = response
                .json()
                .await
                .map_err(|e| Error::UnexpectedShape(format!("Response is not JSON: {}", e)))?;
            unwrap_envelope(body)
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Unauthorized("Invalid or expired token".to_string()))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::Forbidden("Access denied".to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Api {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn ping(&self) -> Result<()> {
        // Any answer at all proves reachability; only transport failures
        // count as offline.
        self.http
            .get(self.base.clone())
            .send()
            .await
            .map_err(Self::transport_error)?;
        Ok(())
    }

    async fn fetch_all(&self, collection: &CollectionName) -> Result<Vec<RemoteRecord>> {
        let url = self.collection_url(collection)?;
        let auth = self.auth_header().await?;
        debug!(%collection, "Fetching collection snapshot");

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(Self::transport_error)?;

        records_from_value(self.handle_response(response).await?)
    }

    async fn fetch(&self, collection: &CollectionName, id: &str) -> Result<RemoteRecord> {
        let url = self.resource_url(collection, id)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(Self::transport_error)?;

        record_from_value(self.handle_response(response).await?)
    }

    async fn create(&self, collection: &CollectionName, payload: &Value) -> Result<RemoteRecord> {
        let url = self.collection_url(collection)?;
        let auth = self.auth_header().await?;
        debug!(%collection, "Creating resource");

        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, auth)
            .json(payload)
            .send()
            .await
            .map_err(Self::transport_error)?;

        record_from_value(self.handle_response(response).await?)
    }

    async fn update(
        &self,
        collection: &CollectionName,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord> {
        let url = self.resource_url(collection, id)?;
        let auth = self.auth_header().await?;
        debug!(%collection, id, "Updating resource");

        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, auth)
            .json(payload)
            .send()
            .await
            .map_err(Self::transport_error)?;

        record_from_value(self.handle_response(response).await?)
    }

    async fn delete(&self, collection: &CollectionName, id: &str) -> Result<()> {
        let url = self.resource_url(collection, id)?;
        let auth = self.auth_header().await?;
        debug!(%collection, id, "Deleting resource");

        let response = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Unauthorized("Invalid or expired token".to_string()))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::Forbidden("Access denied".to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Api {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}
