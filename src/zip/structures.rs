use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

/// ZIP compression methods supported by the writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionMethod {
    #[default]
    Stored,
    Deflate,
}

impl CompressionMethod {
    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
        }
    }
}

impl FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "store" | "stored" | "none" => Ok(CompressionMethod::Stored),
            "deflate" => Ok(CompressionMethod::Deflate),
            other => Err(format!(
                "unknown compression method `{other}` (expected `store` or `deflate`)"
            )),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMethod::Stored => f.write_str("store"),
            CompressionMethod::Deflate => f.write_str("deflate"),
        }
    }
}

/// Local File Header (LFH) - 30 bytes before the name and extra field
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Data descriptor, written after member data when sizes are not known up front
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// General purpose flag: sizes and CRC live in the data descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
/// General purpose flag: file name is UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

pub const VERSION_DEFAULT: u16 = 20;
pub const VERSION_ZIP64: u16 = 45;
const CREATOR_UNIX: u16 = 3;

/// Regular file, rw-r--r--, in the upper half of the external attributes.
const EXTERNAL_ATTRS_FILE: u32 = 0o100644 << 16;

const EXTRA_ZIP64: u16 = 0x0001;
const EXTRA_EXTENDED_TIMESTAMP: u16 = 0x5455;
const EXTENDED_TIMESTAMP_LEN: u16 = 5;

pub const U16_MAX: u64 = 0xFFFF;
pub const U32_MAX: u64 = 0xFFFF_FFFF;

/// MS-DOS packed modification time and date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

impl DosDateTime {
    /// Pack a timestamp into DOS fields.
    ///
    /// DOS dates only cover 1980..=2107; timestamps outside that range are
    /// clamped to its bounds.
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        if dt.year() < 1980 {
            return Self {
                time: 0,
                date: (1 << 5) | 1,
            };
        }
        if dt.year() > 2107 {
            return Self {
                time: (23 << 11) | (59 << 5) | 29,
                date: (127 << 9) | (12 << 5) | 31,
            };
        }

        let date =
            (((dt.year() - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time =
            ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() / 2) as u16;
        Self { time, date }
    }
}

/// Per-member metadata fixed when the member is opened
#[derive(Debug, Clone)]
pub struct MemberHeader {
    pub file_name: String,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub modified: DosDateTime,
    /// Seconds since the Unix epoch, for the extended timestamp extra field
    pub unix_mtime: u32,
}

impl MemberHeader {
    pub fn new(
        file_name: &str,
        compression_method: CompressionMethod,
        modified: &DateTime<Utc>,
    ) -> Self {
        let mut flags = FLAG_DATA_DESCRIPTOR;
        if !file_name.is_ascii() {
            flags |= FLAG_UTF8;
        }

        Self {
            file_name: file_name.to_string(),
            flags,
            compression_method,
            modified: DosDateTime::from_datetime(modified),
            unix_mtime: modified.timestamp().clamp(0, U32_MAX as i64) as u32,
        }
    }

    fn write_extended_timestamp<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u16::<LittleEndian>(EXTRA_EXTENDED_TIMESTAMP)?;
        out.write_u16::<LittleEndian>(EXTENDED_TIMESTAMP_LEN)?;
        out.write_u8(0x01)?; // mtime present
        out.write_u32::<LittleEndian>(self.unix_mtime)?;
        Ok(())
    }

    /// Write the Local File Header.
    ///
    /// CRC and sizes are zero because the data descriptor flag is set; the
    /// real values follow the member data.
    pub fn write_local_header<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(LFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(VERSION_DEFAULT)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(self.modified.time)?;
        out.write_u16::<LittleEndian>(self.modified.date)?;
        out.write_u32::<LittleEndian>(0)?; // crc32
        out.write_u32::<LittleEndian>(0)?; // compressed size
        out.write_u32::<LittleEndian>(0)?; // uncompressed size
        out.write_u16::<LittleEndian>(self.file_name.len() as u16)?;
        out.write_u16::<LittleEndian>(4 + EXTENDED_TIMESTAMP_LEN)?;
        out.write_all(self.file_name.as_bytes())?;
        self.write_extended_timestamp(out)
    }
}

/// Data descriptor trailing each member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    pub fn is_zip64(&self) -> bool {
        self.compressed_size >= U32_MAX || self.uncompressed_size >= U32_MAX
    }

    /// Size in bytes of the encoded descriptor.
    pub fn encoded_len(&self) -> usize {
        if self.is_zip64() { 24 } else { 16 }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(DATA_DESCRIPTOR_SIGNATURE)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        if self.is_zip64() {
            out.write_u64::<LittleEndian>(self.compressed_size)?;
            out.write_u64::<LittleEndian>(self.uncompressed_size)?;
        } else {
            out.write_u32::<LittleEndian>(self.compressed_size as u32)?;
            out.write_u32::<LittleEndian>(self.uncompressed_size as u32)?;
        }
        Ok(())
    }
}

/// Everything the central directory needs to know about a closed member
#[derive(Debug, Clone)]
pub struct CentralDirectoryRecord {
    pub header: MemberHeader,
    pub descriptor: DataDescriptor,
    pub lfh_offset: u64,
}

impl CentralDirectoryRecord {
    /// ZIP64 extended information, holding only the fields that overflow.
    fn zip64_extra(&self) -> Vec<u64> {
        let mut fields = Vec::new();
        if self.descriptor.uncompressed_size >= U32_MAX {
            fields.push(self.descriptor.uncompressed_size);
        }
        if self.descriptor.compressed_size >= U32_MAX {
            fields.push(self.descriptor.compressed_size);
        }
        if self.lfh_offset >= U32_MAX {
            fields.push(self.lfh_offset);
        }
        fields
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let zip64 = self.zip64_extra();
        let version_needed = if zip64.is_empty() {
            VERSION_DEFAULT
        } else {
            VERSION_ZIP64
        };
        let mut extra_len = 4 + EXTENDED_TIMESTAMP_LEN;
        if !zip64.is_empty() {
            extra_len += 4 + 8 * zip64.len() as u16;
        }

        out.write_all(CDFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>((CREATOR_UNIX << 8) | version_needed)?;
        out.write_u16::<LittleEndian>(version_needed)?;
        out.write_u16::<LittleEndian>(self.header.flags)?;
        out.write_u16::<LittleEndian>(self.header.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(self.header.modified.time)?;
        out.write_u16::<LittleEndian>(self.header.modified.date)?;
        out.write_u32::<LittleEndian>(self.descriptor.crc32)?;
        out.write_u32::<LittleEndian>(self.descriptor.compressed_size.min(U32_MAX) as u32)?;
        out.write_u32::<LittleEndian>(self.descriptor.uncompressed_size.min(U32_MAX) as u32)?;
        out.write_u16::<LittleEndian>(self.header.file_name.len() as u16)?;
        out.write_u16::<LittleEndian>(extra_len)?;
        out.write_u16::<LittleEndian>(0)?; // comment length
        out.write_u16::<LittleEndian>(0)?; // disk number start
        out.write_u16::<LittleEndian>(0)?; // internal attributes
        out.write_u32::<LittleEndian>(EXTERNAL_ATTRS_FILE)?;
        out.write_u32::<LittleEndian>(self.lfh_offset.min(U32_MAX) as u32)?;
        out.write_all(self.header.file_name.as_bytes())?;

        if !zip64.is_empty() {
            out.write_u16::<LittleEndian>(EXTRA_ZIP64)?;
            out.write_u16::<LittleEndian>(8 * zip64.len() as u16)?;
            for field in zip64 {
                out.write_u64::<LittleEndian>(field)?;
            }
        }
        self.header.write_extended_timestamp(out)
    }
}

/// End of Central Directory (EOCD) - 22 bytes, no comment
pub struct EndOfCentralDirectory {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn is_zip64(&self) -> bool {
        self.total_entries >= U16_MAX || self.cd_size >= U32_MAX || self.cd_offset >= U32_MAX
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let entries = self.total_entries.min(U16_MAX) as u16;

        out.write_all(Self::SIGNATURE)?;
        out.write_u16::<LittleEndian>(0)?; // disk number
        out.write_u16::<LittleEndian>(0)?; // disk with central directory
        out.write_u16::<LittleEndian>(entries)?;
        out.write_u16::<LittleEndian>(entries)?;
        out.write_u32::<LittleEndian>(self.cd_size.min(U32_MAX) as u32)?;
        out.write_u32::<LittleEndian>(self.cd_offset.min(U32_MAX) as u32)?;
        out.write_u16::<LittleEndian>(0)?; // comment length
        Ok(())
    }
}

/// ZIP64 End of Central Directory - 56 bytes
pub struct Zip64EOCD {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const SIZE: usize = 56;

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        // Size of the remaining record, excluding the leading 12 bytes
        out.write_u64::<LittleEndian>((Self::SIZE - 12) as u64)?;
        out.write_u16::<LittleEndian>((CREATOR_UNIX << 8) | VERSION_ZIP64)?;
        out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        out.write_u32::<LittleEndian>(0)?; // disk number
        out.write_u32::<LittleEndian>(0)?; // disk with central directory
        out.write_u64::<LittleEndian>(self.total_entries)?;
        out.write_u64::<LittleEndian>(self.total_entries)?;
        out.write_u64::<LittleEndian>(self.cd_size)?;
        out.write_u64::<LittleEndian>(self.cd_offset)?;
        Ok(())
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub eocd64_offset: u64,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        out.write_u32::<LittleEndian>(0)?; // disk with ZIP64 EOCD
        out.write_u64::<LittleEndian>(self.eocd64_offset)?;
        out.write_u32::<LittleEndian>(1)?; // total disks
        Ok(())
    }
}
