//! Archive requests: which files go into an archive, and under which names.

use reqwest::Url;
use serde::Deserialize;

use crate::error::DescriptorError;
use crate::zip::validate_member_name;

/// Filename offered to clients when the manifest does not suggest one.
pub const DEFAULT_ARCHIVE_FILENAME: &str = "archive.zip";

/// One archive member: where to fetch it and where it goes in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    url: Url,
    zip_path: String,
}

impl EntryDescriptor {
    pub fn new(url: Url, zip_path: impl Into<String>) -> Result<Self, DescriptorError> {
        let zip_path = zip_path.into();
        validate_zip_path(&zip_path)?;
        Ok(Self { url, zip_path })
    }

    /// Parse `url` and build the entry.
    pub fn parse(url: &str, zip_path: impl Into<String>) -> Result<Self, DescriptorError> {
        let url = Url::parse(url).map_err(|e| DescriptorError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Self::new(url, zip_path)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn zip_path(&self) -> &str {
        &self.zip_path
    }
}

/// An ordered, non-empty list of entries plus the archive's suggested filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    entries: Vec<EntryDescriptor>,
    suggested_filename: String,
}

impl ArchiveRequest {
    pub fn new(
        entries: Vec<EntryDescriptor>,
        suggested_filename: Option<String>,
    ) -> Result<Self, DescriptorError> {
        if entries.is_empty() {
            return Err(DescriptorError::NoEntries);
        }

        let suggested_filename = suggested_filename
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ARCHIVE_FILENAME.to_string());

        Ok(Self {
            entries,
            suggested_filename,
        })
    }

    /// Parse a JSON manifest of the form
    /// `{"suggestedFilename": "...", "files": [{"url": "...", "zipPath": "..."}]}`.
    pub fn from_json(body: &[u8]) -> Result<Self, DescriptorError> {
        let manifest: Manifest =
            serde_json::from_slice(body).map_err(|e| DescriptorError::Manifest(e.to_string()))?;

        let entries = manifest
            .files
            .into_iter()
            .map(|file| EntryDescriptor::parse(&file.url, file.zip_path))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(entries, manifest.suggested_filename)
    }

    pub fn entries(&self) -> &[EntryDescriptor] {
        &self.entries
    }

    pub fn suggested_filename(&self) -> &str {
        &self.suggested_filename
    }

    /// Suggested filename made safe for a quoted `Content-Disposition` parameter.
    pub fn escaped_suggested_filename(&self) -> String {
        let mut escaped = String::with_capacity(self.suggested_filename.len());
        for c in self.suggested_filename.chars().filter(|c| !c.is_control()) {
            if c == '"' || c == '\\' {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    suggested_filename: Option<String>,
    files: Vec<ManifestFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    url: String,
    zip_path: String,
}

/// Validate an archive-relative path.
///
/// On top of what the ZIP format itself requires, paths must name a file
/// (no trailing `/`) and must not contain empty, `.` or `..` segments, so an
/// extracted archive cannot write outside its target directory.
fn validate_zip_path(path: &str) -> Result<(), DescriptorError> {
    validate_member_name(path).map_err(|e| match e {
        crate::error::ZipError::InvalidName { reason, .. } => DescriptorError::InvalidPath {
            path: path.to_string(),
            reason,
        },
        _ => DescriptorError::InvalidPath {
            path: path.to_string(),
            reason: "not a valid member name",
        },
    })?;

    let reason = if path.ends_with('/') {
        Some("path must name a file, not a directory")
    } else if path.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        Some("path contains an empty, `.` or `..` segment")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(DescriptorError::InvalidPath {
            path: path.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
