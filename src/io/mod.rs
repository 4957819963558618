mod http;
mod retry;
mod s3;

pub use http::RetryingFetcher;
pub use retry::{RETRYABLE_STATUS_CODES, RetryPolicy, is_retryable_status};
pub use s3::{S3ObjectSource, parse_object_location};

use async_trait::async_trait;
use reqwest::Url;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::FetchError;

/// Byte stream of a successfully retrieved source.
pub type FetchedBody = Pin<Box<dyn AsyncRead + Send>>;

/// Trait for retrieving the contents of a remote source
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Retrieve `location`, retrying as the implementation sees fit
    async fn fetch(&self, location: &Url) -> Result<FetchedBody, FetchError>;
}

/// Trait for an authenticated object store reachable through its own protocol
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Whether `location` belongs to this store
    fn handles(&self, location: &Url) -> bool;

    /// Single attempt at retrieving the object behind `location`
    async fn get_object(&self, location: &Url) -> anyhow::Result<FetchedBody>;
}
