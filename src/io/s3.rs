use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use reqwest::Url;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use super::{FetchedBody, ObjectSource};

const DEFAULT_REGION: &str = "us-east-1";

/// S3 object source for virtual-hosted-style URLs
/// (`https://<bucket>.s3.<region>.amazonaws.com/<key>`).
///
/// Locations are claimed by substring match on a configured marker. The
/// client is built on first use from the default AWS credential chain.
pub struct S3ObjectSource {
    marker: String,
    client: OnceCell<Client>,
}

impl S3ObjectSource {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let region = region_from(
                    std::env::var("AWS_REGION").ok(),
                    std::env::var("AWS_DEFAULT_REGION").ok(),
                );
                let config = aws_config::from_env()
                    .region(aws_config::Region::new(region.clone()))
                    .load()
                    .await;
                info!(%region, "S3 client initialised");
                Client::new(&config)
            })
            .await
    }
}

#[async_trait]
impl ObjectSource for S3ObjectSource {
    fn handles(&self, location: &Url) -> bool {
        !self.marker.is_empty() && location.as_str().contains(&self.marker)
    }

    #[instrument(skip(self, location), fields(url = %location))]
    async fn get_object(&self, location: &Url) -> Result<FetchedBody> {
        let (bucket, key) = parse_object_location(location)?;

        let output = self
            .client()
            .await
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("S3 GetObject s3://{bucket}/{key}"))?;

        debug!(%bucket, %key, content_length = ?output.content_length(), "object retrieved");
        Ok(Box::pin(output.body.into_async_read()))
    }
}

/// Split an object URL into bucket (first host label) and key (decoded path
/// without the leading `/`).
pub fn parse_object_location(location: &Url) -> Result<(String, String)> {
    let host = location
        .host_str()
        .ok_or_else(|| anyhow!("object URL has no host: {location}"))?;
    let bucket = host.split('.').next().unwrap_or_default();
    if bucket.is_empty() {
        bail!("object URL has no bucket: {location}");
    }

    let path = location.path().trim_start_matches('/');
    let key = urlencoding::decode(path)
        .with_context(|| format!("object key is not valid UTF-8: {path}"))?
        .into_owned();
    if key.is_empty() {
        bail!("object URL has no key: {location}");
    }

    Ok((bucket.to_string(), key))
}

fn region_from(region: Option<String>, default_region: Option<String>) -> String {
    region
        .filter(|r| !r.is_empty())
        .or(default_region.filter(|r| !r.is_empty()))
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}
