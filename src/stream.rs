//! Drives fetcher and ZIP writer to turn an [`ArchiveRequest`] into an
//! archive byte stream.
//!
//! Entries are fetched and written strictly in request order, one at a time.
//! A source that cannot be retrieved becomes an empty member at its path; a
//! failure after bytes were committed to the archive ends the transfer.

use chrono::Utc;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::ArchiveRequest;
use crate::error::{Result, StreamError};
use crate::io::Fetch;
use crate::telemetry::{NoopReporter, Reporter};
use crate::zip::{CompressionMethod, ZipAssembler};

/// Signal owned by the transport that carries the archive, used to end a
/// failed transfer in a way the client cannot mistake for success.
pub trait AbortSignal: Send {
    fn abort(self, reason: &StreamError);
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub bytes_written: u64,
}

/// Streams archives for any number of requests; holds no per-transfer state.
pub struct ZipStreamer<F> {
    fetcher: F,
    reporter: Arc<dyn Reporter>,
    compression: CompressionMethod,
}

impl<F: Fetch> ZipStreamer<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            reporter: Arc::new(NoopReporter),
            compression: CompressionMethod::default(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Write every entry of `request` into a ZIP archive on `sink`.
    ///
    /// Output is flushed after each member. If no entry could be fetched the
    /// archive is left unfinalized and [`StreamError::NothingRetrieved`] is
    /// returned.
    #[instrument(
        skip_all,
        fields(entries = request.entries().len(), filename = request.suggested_filename())
    )]
    pub async fn stream_all<W>(&self, request: &ArchiveRequest, sink: W) -> Result<StreamSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut zip = ZipAssembler::new(sink);
        let mut succeeded = 0;

        for entry in request.entries() {
            let path = entry.zip_path();
            let body = match self.fetcher.fetch(entry.url()).await {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!(
                        url = %entry.url(),
                        path,
                        error = %e,
                        "entry failed, writing empty member"
                    );
                    self.reporter.report_exception(&e);
                    None
                }
            };

            let mut member = zip
                .begin_member(path, self.compression, Utc::now())
                .await
                .map_err(|source| StreamError::Header {
                    path: path.to_string(),
                    source,
                })?;

            let copy_err = |source| StreamError::Copy {
                path: path.to_string(),
                source,
            };
            match body {
                Some(mut body) => {
                    let copied = member.copy_from(&mut body).await.map_err(copy_err)?;
                    member.finish().await.map_err(copy_err)?;
                    succeeded += 1;
                    debug!(path, bytes = copied, "entry written");
                }
                None => member.finish().await.map_err(copy_err)?,
            }

            zip.flush().await.map_err(StreamError::Flush)?;
        }

        let failed = request.entries().len() - succeeded;
        if succeeded == 0 {
            self.reporter
                .report_message("archive aborted: none of its entries could be retrieved");
            return Err(StreamError::NothingRetrieved);
        }

        zip.finish().await.map_err(StreamError::Finish)?;

        let summary = StreamSummary {
            succeeded,
            failed,
            bytes_written: zip.bytes_written(),
        };
        info!(
            succeeded,
            failed,
            bytes = summary.bytes_written,
            "archive streamed"
        );
        Ok(summary)
    }

    /// [`stream_all`](Self::stream_all), invoking `abort` if it fails.
    pub async fn stream_or_abort<W, A>(
        &self,
        request: &ArchiveRequest,
        sink: W,
        abort: A,
    ) -> Result<StreamSummary>
    where
        W: AsyncWrite + Unpin + Send,
        A: AbortSignal,
    {
        let result = self.stream_all(request, sink).await;
        if let Err(e) = &result {
            warn!(error = %e, "archive transfer failed, aborting");
            abort.abort(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EntryDescriptor;
    use crate::error::{FetchError, ZipError};
    use crate::io::FetchedBody;
    use crate::telemetry::tests::RecordingReporter;
    use async_trait::async_trait;
    use reqwest::{StatusCode, Url};
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::AsyncRead;

    #[derive(Clone)]
    enum Source {
        Body(&'static [u8]),
        Status(u16),
        /// Yields some bytes, then a read error
        Broken,
    }

    /// Serves canned sources and records the sink length seen at each call.
    struct CannedFetcher {
        sources: HashMap<String, Source>,
        sink: Option<Arc<Mutex<Vec<u8>>>>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl CannedFetcher {
        fn new(sources: &[(&str, Source)]) -> Self {
            Self {
                sources: sources
                    .iter()
                    .map(|(url, source)| (url.to_string(), source.clone()))
                    .collect(),
                sink: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    struct BrokenReader {
        sent: bool,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(std::io::Error::other("connection reset")));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl Fetch for CannedFetcher {
        async fn fetch(&self, location: &Url) -> std::result::Result<FetchedBody, FetchError> {
            let seen = self.sink.as_ref().map_or(0, |s| s.lock().unwrap().len());
            self.calls.lock().unwrap().push((location.to_string(), seen));
            match self.sources.get(location.as_str()) {
                Some(Source::Body(data)) => Ok(Box::pin(Cursor::new(data.to_vec()))),
                Some(Source::Broken) => Ok(Box::pin(BrokenReader { sent: false })),
                Some(Source::Status(code)) => {
                    Err(FetchError::Status(StatusCode::from_u16(*code).unwrap()))
                }
                None => Err(FetchError::MaxRetriesExceeded),
            }
        }
    }

    /// Sink shared with the test, counting flushes.
    #[derive(Clone, Default)]
    struct SharedSink {
        data: Arc<Mutex<Vec<u8>>>,
        flushes: Arc<Mutex<usize>>,
        fail_writes: bool,
    }

    impl AsyncWrite for SharedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.fail_writes {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.data.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            *self.flushes.lock().unwrap() += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct RecordingAbort(Arc<Mutex<Option<String>>>);

    impl AbortSignal for RecordingAbort {
        fn abort(self, reason: &StreamError) {
            *self.0.lock().unwrap() = Some(reason.to_string());
        }
    }

    fn request(entries: &[(&str, &str)]) -> ArchiveRequest {
        let entries = entries
            .iter()
            .map(|(url, path)| EntryDescriptor::parse(url, *path).unwrap())
            .collect();
        ArchiveRequest::new(entries, None).unwrap()
    }

    fn read_members(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = ::zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                file.read_to_end(&mut data).unwrap();
                (file.name().to_string(), data)
            })
            .collect()
    }

    const A: &str = "https://example.com/a";
    const B: &str = "https://example.com/b";
    const C: &str = "https://example.com/c";

    #[tokio::test]
    async fn members_follow_request_order() {
        for compression in [CompressionMethod::Stored, CompressionMethod::Deflate] {
            let fetcher = CannedFetcher::new(&[
                (A, Source::Body(b"first")),
                (B, Source::Body(b"second")),
            ]);
            let streamer = ZipStreamer::new(fetcher).with_compression(compression);
            let sink = SharedSink::default();

            let summary = streamer
                .stream_all(&request(&[(B, "z.txt"), (A, "a/b.txt"), (B, "z2.txt")]), sink.clone())
                .await
                .unwrap();
            assert_eq!(summary.succeeded, 3);
            assert_eq!(summary.failed, 0);

            let bytes = sink.data.lock().unwrap().clone();
            assert_eq!(summary.bytes_written, bytes.len() as u64);
            assert_eq!(
                read_members(bytes),
                vec![
                    ("z.txt".to_string(), b"second".to_vec()),
                    ("a/b.txt".to_string(), b"first".to_vec()),
                    ("z2.txt".to_string(), b"second".to_vec()),
                ]
            );
        }
    }

    #[tokio::test]
    async fn failed_entries_become_empty_members() {
        let fetcher = CannedFetcher::new(&[(A, Source::Body(b"hi")), (B, Source::Status(500))]);
        let reporter = Arc::new(RecordingReporter::default());
        let streamer = ZipStreamer::new(fetcher).with_reporter(reporter.clone());
        let sink = SharedSink::default();

        let summary = streamer
            .stream_all(&request(&[(A, "a.txt"), (B, "b/c.txt"), (C, "d.txt")]), sink.clone())
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);

        let members = read_members(sink.data.lock().unwrap().clone());
        assert_eq!(
            members,
            vec![
                ("a.txt".to_string(), b"hi".to_vec()),
                ("b/c.txt".to_string(), Vec::new()),
                ("d.txt".to_string(), Vec::new()),
            ]
        );
        assert_eq!(reporter.exceptions.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn total_failure_is_not_finalized_and_aborts() {
        let fetcher = CannedFetcher::new(&[(A, Source::Status(404)), (B, Source::Status(503))]);
        let reporter = Arc::new(RecordingReporter::default());
        let streamer = ZipStreamer::new(fetcher).with_reporter(reporter.clone());
        let sink = SharedSink::default();
        let aborted = Arc::new(Mutex::new(None));

        let err = streamer
            .stream_or_abort(
                &request(&[(A, "a"), (B, "b")]),
                sink.clone(),
                RecordingAbort(aborted.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NothingRetrieved));
        assert_eq!(
            aborted.lock().unwrap().as_deref(),
            Some("no entries could be retrieved")
        );
        assert_eq!(reporter.messages.lock().unwrap().len(), 1);

        let bytes = sink.data.lock().unwrap().clone();
        assert!(::zip::ZipArchive::new(Cursor::new(bytes)).is_err());
    }

    #[tokio::test]
    async fn success_does_not_abort() {
        let fetcher = CannedFetcher::new(&[(A, Source::Body(b"x"))]);
        let aborted = Arc::new(Mutex::new(None));
        ZipStreamer::new(fetcher)
            .stream_or_abort(
                &request(&[(A, "a")]),
                SharedSink::default(),
                RecordingAbort(aborted.clone()),
            )
            .await
            .unwrap();
        assert!(aborted.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn copy_error_is_fatal() {
        let fetcher = CannedFetcher::new(&[(A, Source::Broken), (B, Source::Body(b"never"))]);
        let streamer = ZipStreamer::new(fetcher);

        let err = streamer
            .stream_all(&request(&[(A, "a"), (B, "b")]), SharedSink::default())
            .await
            .unwrap_err();
        assert!(matches!(&err, StreamError::Copy { path, source: ZipError::Io(_) } if path == "a"));

        let calls = streamer.fetcher().calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "no fetch after a fatal copy error");
    }

    #[tokio::test]
    async fn sink_failure_is_fatal() {
        let fetcher = CannedFetcher::new(&[(A, Source::Body(b"x"))]);
        let sink = SharedSink {
            fail_writes: true,
            ..SharedSink::default()
        };
        let err = ZipStreamer::new(fetcher)
            .stream_all(&request(&[(A, "a"), (A, "b")]), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Flush(_)), "{err}");
    }

    #[tokio::test]
    async fn each_member_reaches_sink_before_next_fetch() {
        let sink = SharedSink::default();
        let mut fetcher =
            CannedFetcher::new(&[(A, Source::Body(b"one")), (B, Source::Status(404))]);
        fetcher.sink = Some(sink.data.clone());
        let streamer = ZipStreamer::new(fetcher);

        streamer
            .stream_all(&request(&[(A, "1"), (B, "2"), (A, "3")]), sink.clone())
            .await
            .unwrap();

        let calls = streamer.fetcher().calls.lock().unwrap();
        let seen: Vec<usize> = calls.iter().map(|(_, len)| *len).collect();
        assert_eq!(seen[0], 0);
        assert!(seen[1] > seen[0]);
        assert!(seen[2] > seen[1]);
        assert!(*sink.flushes.lock().unwrap() >= 3);
    }
}
