use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode, Url};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::retry::{RetryPolicy, is_retryable_status};
use super::{Fetch, FetchedBody, ObjectSource};
use crate::build_info;
use crate::error::FetchError;

/// Result of a single attempt
enum Attempt {
    Success(FetchedBody),
    /// Worth retrying; carries the error to report if no attempt succeeds
    Retry(Option<FetchError>),
    Fail(FetchError),
}

/// HTTP fetcher with bounded retry and exponential backoff.
///
/// Locations claimed by the configured [`ObjectSource`] are retrieved through
/// it instead; those attempts are retried on any error but never classified
/// by status code. An object is read to its end within the attempt, so a
/// body that breaks off mid-read costs an attempt rather than the archive.
pub struct RetryingFetcher {
    client: Client,
    policy: RetryPolicy,
    user_agent: String,
    object_source: Option<Arc<dyn ObjectSource>>,
}

impl RetryingFetcher {
    /// Create a fetcher whose attempts time out after `timeout` without
    /// progress (connecting, or waiting for the next body chunk).
    pub fn new(policy: RetryPolicy, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            user_agent: build_info::user_agent(),
            object_source: None,
        }
    }

    pub fn with_object_source(mut self, source: Arc<dyn ObjectSource>) -> Self {
        self.object_source = Some(source);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt_http(&self, location: &Url) -> Attempt {
        let result = self
            .client
            .get(location.clone())
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == StatusCode::OK => {
                let stream = resp.bytes_stream().map_err(std::io::Error::other);
                Attempt::Success(Box::pin(StreamReader::new(stream)))
            }
            Ok(resp) if is_retryable_status(resp.status()) => {
                debug!(url = %location, status = %resp.status(), "retryable status");
                Attempt::Retry(None)
            }
            Ok(resp) => Attempt::Fail(FetchError::Status(resp.status())),
            Err(e) if e.is_builder() => Attempt::Fail(FetchError::InvalidRequest {
                url: location.to_string(),
                source: e,
            }),
            Err(e) => Attempt::Retry(Some(FetchError::Transport(e))),
        }
    }

    async fn attempt_object(&self, source: &dyn ObjectSource, location: &Url) -> Attempt {
        let mut body = match source.get_object(location).await {
            Ok(body) => body,
            Err(e) => return Attempt::Retry(Some(FetchError::ObjectStore(e))),
        };

        let mut buf = Vec::new();
        match body.read_to_end(&mut buf).await {
            Ok(_) => Attempt::Success(Box::pin(Cursor::new(buf))),
            Err(e) => {
                let e = anyhow::Error::new(e).context("object body read failed");
                Attempt::Retry(Some(FetchError::ObjectStore(e)))
            }
        }
    }
}

#[async_trait]
impl Fetch for RetryingFetcher {
    async fn fetch(&self, location: &Url) -> Result<FetchedBody, FetchError> {
        let object_source = self
            .object_source
            .as_deref()
            .filter(|source| source.handles(location));

        let mut last_error = None;
        for attempt in 0..self.policy.max_attempts {
            let outcome = match object_source {
                Some(source) => self.attempt_object(source, location).await,
                None => self.attempt_http(location).await,
            };

            match outcome {
                Attempt::Success(body) => return Ok(body),
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry(e) => {
                    if let Some(e) = &e {
                        warn!(
                            url = %location,
                            attempt = attempt + 1,
                            max_attempts = self.policy.max_attempts,
                            error = %e,
                            "fetch attempt failed"
                        );
                    }
                    // Keep the last error that carried detail.
                    if e.is_some() {
                        last_error = e;
                    }
                    if let Some(delay) = self.policy.delay_after(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::MaxRetriesExceeded))
    }
}
