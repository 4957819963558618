//! Single-pass ZIP writer.
//!
//! Members are written as local header, data, data descriptor, so nothing
//! about a member needs to be known before its bytes arrive. The central
//! directory is kept in memory (one small record per member) and written by
//! [`ZipAssembler::finish`].

use chrono::{DateTime, Utc};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::trace;

use crate::error::ZipError;

use super::structures::*;

/// Read size used when copying a source into a member.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Buffered sink that counts every byte handed to it.
///
/// The count is the archive offset, needed for local header positions and
/// the central directory location.
struct CountingWriter<W> {
    inner: BufWriter<W>,
    written: u64,
}

impl<W: AsyncWrite + Unpin> CountingWriter<W> {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

struct OpenMember {
    header: MemberHeader,
    lfh_offset: u64,
    crc: Crc,
    compressed_size: u64,
    uncompressed_size: u64,
    /// Present for deflate members; compressed output accumulates in the Vec
    /// and is drained after every write.
    encoder: Option<DeflateEncoder<Vec<u8>>>,
}

/// Streaming ZIP writer over an async sink.
///
/// Only one member can be open at a time. Flushing the assembler flushes the
/// sink too, so a sink that forwards bytes to a network peer on flush sees
/// every completed member promptly.
pub struct ZipAssembler<W> {
    out: CountingWriter<W>,
    members: Vec<CentralDirectoryRecord>,
    open: Option<OpenMember>,
    finished: bool,
}

impl<W: AsyncWrite + Unpin + Send> ZipAssembler<W> {
    pub fn new(sink: W) -> Self {
        Self {
            out: CountingWriter {
                inner: BufWriter::new(sink),
                written: 0,
            },
            members: Vec::new(),
            open: None,
            finished: false,
        }
    }

    /// Number of closed members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Bytes handed to the sink so far, including buffered ones.
    pub fn bytes_written(&self) -> u64 {
        self.out.written
    }

    /// Start a new member and return a writer for its contents.
    ///
    /// Fails if the previous member was not finished, if the archive is
    /// already finalized, or if `name` cannot be stored in a ZIP header.
    pub async fn begin_member(
        &mut self,
        name: &str,
        method: CompressionMethod,
        modified: DateTime<Utc>,
    ) -> Result<MemberWriter<'_, W>, ZipError> {
        if self.finished {
            return Err(ZipError::Finished);
        }
        if let Some(open) = &self.open {
            return Err(ZipError::MemberOpen(open.header.file_name.clone()));
        }
        validate_member_name(name)?;

        let header = MemberHeader::new(name, method, &modified);
        let lfh_offset = self.out.written;

        let mut buf = Vec::with_capacity(LFH_SIZE + name.len() + 9);
        header.write_local_header(&mut buf)?;
        self.out.write_all(&buf).await?;

        trace!(name, %method, lfh_offset, "member opened");

        let encoder = match method {
            CompressionMethod::Stored => None,
            CompressionMethod::Deflate => {
                Some(DeflateEncoder::new(Vec::new(), Compression::default()))
            }
        };
        self.open = Some(OpenMember {
            header,
            lfh_offset,
            crc: Crc::new(),
            compressed_size: 0,
            uncompressed_size: 0,
            encoder,
        });

        Ok(MemberWriter { assembler: self })
    }

    async fn write_member_data(&mut self, data: &[u8]) -> Result<(), ZipError> {
        let member = self.open.as_mut().ok_or(ZipError::NoOpenMember)?;
        member.crc.update(data);
        member.uncompressed_size += data.len() as u64;

        match member.encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(data)?;
                let compressed = std::mem::take(encoder.get_mut());
                member.compressed_size += compressed.len() as u64;
                self.out.write_all(&compressed).await?;
            }
            None => {
                member.compressed_size += data.len() as u64;
                self.out.write_all(data).await?;
            }
        }
        Ok(())
    }

    /// Close the open member and write its data descriptor.
    pub async fn finish_member(&mut self) -> Result<(), ZipError> {
        let mut member = self.open.take().ok_or(ZipError::NoOpenMember)?;

        if let Some(encoder) = member.encoder.take() {
            let tail = encoder.finish()?;
            member.compressed_size += tail.len() as u64;
            self.out.write_all(&tail).await?;
        }

        let descriptor = DataDescriptor {
            crc32: member.crc.sum(),
            compressed_size: member.compressed_size,
            uncompressed_size: member.uncompressed_size,
        };
        let mut buf = Vec::with_capacity(descriptor.encoded_len());
        descriptor.write_to(&mut buf)?;
        self.out.write_all(&buf).await?;

        trace!(
            name = %member.header.file_name,
            crc32 = descriptor.crc32,
            compressed = descriptor.compressed_size,
            uncompressed = descriptor.uncompressed_size,
            "member closed"
        );

        self.members.push(CentralDirectoryRecord {
            header: member.header,
            descriptor,
            lfh_offset: member.lfh_offset,
        });
        Ok(())
    }

    /// Push buffered bytes into the sink and flush the sink.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.out.inner.flush().await
    }

    /// Write the central directory and end records, then shut the sink down.
    ///
    /// The archive is only a complete, readable ZIP file after this returns.
    pub async fn finish(&mut self) -> Result<(), ZipError> {
        if self.finished {
            return Err(ZipError::Finished);
        }
        if let Some(open) = &self.open {
            return Err(ZipError::MemberOpen(open.header.file_name.clone()));
        }
        self.finished = true;

        let cd_offset = self.out.written;
        let mut buf = Vec::with_capacity(self.members.len() * (CDFH_MIN_SIZE + 32));
        for record in &self.members {
            record.write_to(&mut buf)?;
        }
        let cd_size = buf.len() as u64;

        let eocd = EndOfCentralDirectory {
            total_entries: self.members.len() as u64,
            cd_size,
            cd_offset,
        };
        if eocd.is_zip64() {
            let eocd64_offset = cd_offset + cd_size;
            Zip64EOCD {
                total_entries: eocd.total_entries,
                cd_size,
                cd_offset,
            }
            .write_to(&mut buf)?;
            Zip64EOCDLocator { eocd64_offset }.write_to(&mut buf)?;
        }
        eocd.write_to(&mut buf)?;
        self.out.write_all(&buf).await?;

        self.out.inner.flush().await?;
        self.out.inner.shutdown().await?;

        trace!(
            members = self.members.len(),
            total_bytes = self.out.written,
            "archive finished"
        );
        Ok(())
    }

    /// Consume the assembler and return the sink.
    pub fn into_inner(self) -> W {
        self.out.inner.into_inner()
    }
}

/// Writer for the contents of the currently open member.
///
/// Dropping it without calling [`MemberWriter::finish`] leaves the member
/// open; it can still be closed with [`ZipAssembler::finish_member`].
pub struct MemberWriter<'a, W> {
    assembler: &'a mut ZipAssembler<W>,
}

impl<W: AsyncWrite + Unpin + Send> MemberWriter<'_, W> {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ZipError> {
        self.assembler.write_member_data(data).await
    }

    /// Copy `reader` to its end into the member, returning the number of
    /// uncompressed bytes copied.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64, ZipError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.assembler.write_member_data(&buf[..n]).await?;
            total += n as u64;
        }
    }

    pub async fn finish(self) -> Result<(), ZipError> {
        self.assembler.finish_member().await
    }
}

/// Check that `name` can be stored as a member name.
pub fn validate_member_name(name: &str) -> Result<(), ZipError> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.len() > U16_MAX as usize {
        Some("name is longer than 65535 bytes")
    } else if name.starts_with('/') {
        Some("name must not start with `/`")
    } else if name.contains('\\') {
        Some("name must use `/` as separator")
    } else if name.contains('\0') {
        Some("name contains a NUL byte")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ZipError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn read_archive(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
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

    #[tokio::test]
    async fn stored_and_deflated_members_round_trip() {
        let mut zip = ZipAssembler::new(Vec::new());

        let mut member = zip
            .begin_member("a.txt", CompressionMethod::Stored, Utc::now())
            .await
            .unwrap();
        member.write_all(b"hello ").await.unwrap();
        member.write_all(b"world").await.unwrap();
        member.finish().await.unwrap();

        let payload = "compressible ".repeat(1000);
        let mut member = zip
            .begin_member("dir/b.txt", CompressionMethod::Deflate, Utc::now())
            .await
            .unwrap();
        let mut source = Cursor::new(payload.as_bytes().to_vec());
        let copied = member.copy_from(&mut source).await.unwrap();
        assert_eq!(copied, payload.len() as u64);
        member.finish().await.unwrap();

        zip.finish().await.unwrap();
        let bytes = zip.into_inner();
        assert!(bytes.len() < payload.len());

        let members = read_archive(bytes);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], ("a.txt".to_string(), b"hello world".to_vec()));
        assert_eq!(members[1].0, "dir/b.txt");
        assert_eq!(members[1].1, payload.as_bytes());
    }

    #[tokio::test]
    async fn empty_member_is_readable() {
        let mut zip = ZipAssembler::new(Vec::new());
        zip.begin_member("empty.bin", CompressionMethod::Deflate, Utc::now())
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();
        zip.finish().await.unwrap();

        let members = read_archive(zip.into_inner());
        assert_eq!(members, vec![("empty.bin".to_string(), Vec::new())]);
    }

    #[tokio::test]
    async fn second_member_requires_first_to_be_closed() {
        let mut zip = ZipAssembler::new(Vec::new());
        let member = zip
            .begin_member("one", CompressionMethod::Stored, Utc::now())
            .await
            .unwrap();
        drop(member);

        let err = zip
            .begin_member("two", CompressionMethod::Stored, Utc::now())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ZipError::MemberOpen(name) if name == "one"));

        assert!(matches!(zip.finish().await, Err(ZipError::MemberOpen(_))));

        zip.finish_member().await.unwrap();
        zip.finish().await.unwrap();
        assert_eq!(zip.member_count(), 1);
    }

    #[tokio::test]
    async fn writes_after_finish_are_rejected() {
        let mut zip = ZipAssembler::new(Vec::new());
        zip.begin_member("x", CompressionMethod::Stored, Utc::now())
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();
        zip.finish().await.unwrap();

        assert!(matches!(
            zip.begin_member("y", CompressionMethod::Stored, Utc::now()).await,
            Err(ZipError::Finished)
        ));
        assert!(matches!(zip.finish().await, Err(ZipError::Finished)));
        assert!(matches!(zip.finish_member().await, Err(ZipError::NoOpenMember)));
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_before_writing() {
        let mut zip = ZipAssembler::new(Vec::new());
        for name in ["", "/abs", "win\\path", "nul\0"] {
            assert!(matches!(
                zip.begin_member(name, CompressionMethod::Stored, Utc::now()).await,
                Err(ZipError::InvalidName { .. })
            ));
        }
        assert_eq!(zip.bytes_written(), 0);
    }

    #[tokio::test]
    async fn unfinished_archive_has_no_end_record() {
        let mut zip = ZipAssembler::new(Vec::new());
        let mut member = zip
            .begin_member("partial.txt", CompressionMethod::Stored, Utc::now())
            .await
            .unwrap();
        member.write_all(b"data").await.unwrap();
        member.finish().await.unwrap();
        zip.flush().await.unwrap();

        let bytes = zip.into_inner();
        assert_eq!(&bytes[0..4], LFH_SIGNATURE);
        assert!(::zip::ZipArchive::new(Cursor::new(bytes)).is_err());
    }

    #[tokio::test]
    async fn offsets_track_every_byte() {
        let mut zip = ZipAssembler::new(Vec::new());
        let mut member = zip
            .begin_member("abc", CompressionMethod::Stored, Utc::now())
            .await
            .unwrap();
        member.write_all(b"12345").await.unwrap();
        member.finish().await.unwrap();
        // header (30 + 3 + 9) + data (5) + descriptor (16)
        assert_eq!(zip.bytes_written(), 63);

        zip.finish().await.unwrap();
        let written = zip.bytes_written();
        assert_eq!(zip.into_inner().len() as u64, written);
    }
}
