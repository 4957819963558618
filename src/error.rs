//! Error types for every stage of an archive transfer.
//!
//! Construction problems ([`DescriptorError`]) are caught before any I/O.
//! Per-entry retrieval problems ([`FetchError`]) are recoverable. Anything
//! that goes wrong once bytes are committed to the container
//! ([`ZipError`], [`StreamError`]) ends the transfer.

use reqwest::StatusCode;
use thiserror::Error;

/// Invalid archive request or entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("archive request must have at least 1 entry")]
    NoEntries,

    #[error("invalid source url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid archive path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid manifest: {0}")]
    Manifest(String),
}

/// Failure to retrieve one source.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid request for {url}: {source}")]
    InvalidRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream responded with status {0}")]
    Status(StatusCode),

    #[error("object store error: {0:#}")]
    ObjectStore(anyhow::Error),

    #[error("max retries exceeded")]
    MaxRetriesExceeded,
}

/// Misuse of the ZIP writer, or a failure writing to its sink.
#[derive(Error, Debug)]
pub enum ZipError {
    #[error("invalid member name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("member `{0}` is still open")]
    MemberOpen(String),

    #[error("no member is open")]
    NoOpenMember,

    #[error("archive already finished")]
    Finished,

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal outcome of a whole-archive transfer.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to open member `{path}`: {source}")]
    Header {
        path: String,
        #[source]
        source: ZipError,
    },

    #[error("failed to copy `{path}` into archive: {source}")]
    Copy {
        path: String,
        #[source]
        source: ZipError,
    },

    #[error("failed to flush archive output: {0}")]
    Flush(#[source] std::io::Error),

    #[error("no entries could be retrieved")]
    NothingRetrieved,

    #[error("failed to finalize archive: {0}")]
    Finish(#[source] ZipError),
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
