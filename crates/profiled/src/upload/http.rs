//! HTTP publisher posting finished profiles to a collector.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{PublishError, Publisher};
use crate::config::{Secret, UploadConfig};
use crate::profile::ProfileSnapshot;
use crate::store::RotatedProfile;
use crate::ProfiledError;

/// Path appended to the collector endpoint.
pub const PROFILES_PATH: &str = "/v1/profiles";

/// Body of a publish request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePayload<'a> {
    org_id: &'a str,
    dataset_id: &'a str,
    tags: BTreeMap<&'a str, &'a str>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    epoch: u64,
    profile: &'a ProfileSnapshot,
}

impl<'a> From<&'a RotatedProfile> for ProfilePayload<'a> {
    fn from(rotated: &'a RotatedProfile) -> Self {
        Self {
            org_id: rotated.key.org_id(),
            dataset_id: rotated.key.dataset_id(),
            tags: rotated
                .key
                .tags()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect(),
            window_start: rotated.window_start,
            window_end: rotated.window_end,
            epoch: rotated.epoch,
            profile: &rotated.snapshot,
        }
    }
}

/// Publishes profiles as JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: Client,
    url: String,
    auth_token: Option<Secret>,
}

impl HttpPublisher {
    /// Creates a publisher for the given collector base URL.
    pub fn new(
        endpoint: &str,
        auth_token: Option<Secret>,
        timeout: Duration,
    ) -> Result<Self, ProfiledError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: format!("{}{PROFILES_PATH}", endpoint.trim_end_matches('/')),
            auth_token,
        })
    }

    /// Creates a publisher from upload configuration.
    pub fn from_config(config: &UploadConfig) -> Result<Self, ProfiledError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| ProfiledError::Config("upload.endpoint must be set".into()))?;
        Self::new(
            endpoint,
            config.auth_token.clone(),
            config.request_timeout(),
        )
    }

    /// Full URL profiles are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, profile: &RotatedProfile) -> Result<(), PublishError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&ProfilePayload::from(profile));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose());
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        classify_status(response.status())
    }
}

/// Maps a collector response status to a publish outcome.
///
/// Timeouts, throttling and server errors are transient; any other client error
/// means the collector will keep rejecting the same payload.
pub fn classify_status(status: StatusCode) -> Result<(), PublishError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("collector responded {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(PublishError::Retryable(reason))
    } else {
        Err(PublishError::NonRetryable(reason))
    }
}

fn classify_transport_error(err: reqwest::Error) -> PublishError {
    if err.is_builder() {
        PublishError::NonRetryable(err.to_string())
    } else {
        PublishError::Retryable(err.to_string())
    }
}
