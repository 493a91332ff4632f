//! REST/JSON implementation of [`Upstream`].
//!
//! | Call | Endpoint |
//! |------|----------|
//! | `list_directories` | `GET {base}/directories` |
//! | `list_projects` | `GET {base}/directories/{id}/projects` |
//! | `list_phases` | `GET {base}/projects/{id}/phases` |
//! | `list_elevations` | `GET {base}/phases/{id}/elevations` |
//! | `fetch_blob` | `GET {base}/elevations/{id}/blob` |
//!
//! Requests carry `Authorization: Bearer <token>` where the token is read
//! from the environment variable named by `upstream.credentials_env`.
//!
//! # Error classification
//!
//! - 401 / 403 → [`UpstreamError::Configuration`] (aborts the session)
//! - 404 → [`UpstreamError::NotFound`]
//! - 408 / 429 / 5xx → [`UpstreamError::Transient`] (retried)
//! - any other 4xx → [`UpstreamError::Configuration`]
//! - network errors and undecodable bodies → [`UpstreamError::Transient`]
//!
//! Retries are not done here; the orchestrator wraps every call in
//! [`with_retry`](crate::upstream::with_retry).

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::upstream::{Upstream, UpstreamDirectory, UpstreamEntity};

pub struct HttpUpstream {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpUpstream {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not a valid base URL or the
    /// credentials environment variable is not set.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)?;
        if base.cannot_be_a_base() {
            bail!("upstream.base_url cannot be used as a base: {}", base);
        }

        let token = match std::env::var(&config.credentials_env) {
            Ok(token) if !token.is_empty() => token,
            _ => bail!(
                "{} environment variable not set",
                config.credentials_env
            ),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Configuration(format!("invalid base url: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, url: Url) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &format!("GET {}: {}", url.path(), body)))
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, UpstreamError> {
        let url = self.endpoint(segments)?;
        let response = self.send(url).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Transient(format!("malformed upstream response: {}", e)))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_directories(&self) -> Result<Vec<UpstreamDirectory>, UpstreamError> {
        self.get_json(&["directories"]).await
    }

    async fn list_projects(&self, directory_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError> {
        self.get_json(&["directories", directory_id, "projects"])
            .await
    }

    async fn list_phases(&self, project_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError> {
        self.get_json(&["projects", project_id, "phases"]).await
    }

    async fn list_elevations(&self, phase_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError> {
        self.get_json(&["phases", phase_id, "elevations"]).await
    }

    async fn fetch_blob(&self, elevation_id: &str) -> Result<Vec<u8>, UpstreamError> {
        let url = self.endpoint(&["elevations", elevation_id, "blob"])?;
        let response = self.send(url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(classify_transport)?;
        Ok(bytes.to_vec())
    }
}

/// Map a non-success HTTP status to an [`UpstreamError`].
pub fn classify_status(status: StatusCode, context: &str) -> UpstreamError {
    let message = format!("{} ({})", context, status);
    match status.as_u16() {
        401 | 403 => UpstreamError::Configuration(message),
        404 => UpstreamError::NotFound(message),
        408 | 429 => UpstreamError::Transient(message),
        _ if status.is_server_error() => UpstreamError::Transient(message),
        _ => UpstreamError::Configuration(message),
    }
}

fn classify_transport(err: reqwest::Error) -> UpstreamError {
    if err.is_builder() {
        UpstreamError::Configuration(err.to_string())
    } else {
        UpstreamError::Transient(err.to_string())
    }
}
