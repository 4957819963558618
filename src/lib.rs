//! # zipstreamer
//!
//! Streams a list of remotely hosted files to a client as a single ZIP
//! archive, assembled on the fly without buffering the archive.
//!
//! Each source is fetched over HTTP (or from an object store) with bounded
//! retry and written into the archive as soon as it arrives. A source that
//! cannot be retrieved becomes an empty member, so a few broken links do not
//! fail a whole download. Archive sizes are unknown up front, so members use
//! data descriptors and ZIP64 records where sizes or offsets demand them.
//!
//! ## Features
//!
//! - Single-pass ZIP writer with STORED and DEFLATE members
//! - ZIP64 support for members and archives beyond 4 GiB
//! - Retrying fetcher with capped exponential backoff
//! - Short-lived download links for previously submitted manifests
//! - axum HTTP front end that cuts the connection when a transfer fails
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use zipstreamer::{ArchiveRequest, RetryPolicy, RetryingFetcher, ZipStreamer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manifest = br#"{"suggestedFilename":"photos.zip","files":[
//!         {"url":"https://example.com/1.jpg","zipPath":"photos/1.jpg"}]}"#;
//!     let request = ArchiveRequest::from_json(manifest)?;
//!
//!     let fetcher = RetryingFetcher::new(RetryPolicy::default(), Duration::from_secs(30))?;
//!     let streamer = ZipStreamer::new(fetcher);
//!
//!     let file = tokio::fs::File::create(request.suggested_filename()).await?;
//!     let summary = streamer.stream_all(&request, file).await?;
//!     println!("{} of {} files archived", summary.succeeded, request.entries().len());
//!     Ok(())
//! }
//! ```

pub mod build_info;
pub mod cache;
pub mod cli;
pub mod descriptor;
pub mod error;
pub mod io;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod zip;

pub use cache::{DEFAULT_LINK_TTL, LinkCache};
pub use cli::Cli;
pub use descriptor::{ArchiveRequest, EntryDescriptor};
pub use error::{DescriptorError, FetchError, StreamError, ZipError};
pub use io::{Fetch, FetchedBody, ObjectSource, RetryPolicy, RetryingFetcher, S3ObjectSource};
pub use server::{AppState, ServerConfig, create_router, spawn_link_sweeper};
pub use stream::{AbortSignal, StreamSummary, ZipStreamer};
pub use telemetry::{NoopReporter, Reporter, TracingReporter};
pub use zip::{CompressionMethod, ZipAssembler};
