//! Streaming ZIP archive writer.
//!
//! This module writes ZIP archives in a single forward pass, for sinks that
//! cannot seek (network responses, pipes). Member sizes and checksums are not
//! known until a member's last byte has been written, so each member is laid
//! out as:
//!
//! 1. Local file header with the data descriptor flag set and zero sizes
//! 2. Member data, stored or deflated
//! 3. Data descriptor carrying CRC-32 and both sizes
//!
//! After the last member the central directory and end-of-central-directory
//! record are appended. A stream cut off before that point is not a readable
//! archive.
//!
//! ## Module layout
//!
//! - [`structures`]: record layouts (headers, descriptors, end records)
//! - [`writer`]: the stateful [`ZipAssembler`] and its [`MemberWriter`]
//!
//! ## Supported Features
//!
//! - STORED and DEFLATE compression
//! - ZIP64 extensions, emitted only when sizes, offsets or entry counts overflow
//! - UTF-8 member names and extended (Unix) modification timestamps
//!
//! ## Limitations
//!
//! - No encryption
//! - No directory entries or comments

mod structures;
mod writer;

pub use structures::{CompressionMethod, DosDateTime};
pub use writer::{MemberWriter, ZipAssembler, validate_member_name};
