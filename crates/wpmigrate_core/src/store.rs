use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::record::{QueryFilter, Record, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CategoryId(pub u64);

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermAssignment {
    pub taxonomy: String,
    pub term_ids: Vec<CategoryId>,
    /// Keep the record's existing terms in `taxonomy` instead of replacing them.
    pub append: bool,
}

/// A downloaded remote asset. The temp file is removed on drop.
#[derive(Debug)]
pub struct DownloadedFile {
    pub source_url: String,
    pub content_type: Option<String>,
    pub bytes: u64,
    file: NamedTempFile,
}

impl DownloadedFile {
    pub fn new(
        source_url: impl Into<String>,
        content_type: Option<String>,
        bytes: u64,
        file: NamedTempFile,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            content_type,
            bytes,
            file,
        }
    }

    pub fn from_bytes(
        source_url: impl Into<String>,
        content_type: Option<String>,
        payload: &[u8],
    ) -> io::Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(payload)?;
        file.flush()?;
        Ok(Self::new(source_url, content_type, payload.len() as u64, file))
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn read_bytes(&self) -> io::Result<Vec<u8>> {
        fs::read(self.file.path())
    }
}

pub trait RecordStore {
    fn fetch_records(&mut self, filter: &QueryFilter) -> Result<Vec<Record>>;
    /// Must be safe to repeat with identical content.
    fn update_record(&mut self, record: &Record) -> Result<()>;
}

/// Term lookups and writes, scoped to one taxonomy (`category`, `post_tag`, ...).
pub trait TaxonomyStore {
    fn category_exists(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> Result<bool>;
    fn create_category(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> Result<CategoryId>;
    fn get_category_by_name(&mut self, taxonomy: &str, name: &str) -> Result<Option<CategoryId>>;
    fn set_record_terms(
        &mut self,
        record_id: RecordId,
        term_ids: &[CategoryId],
        taxonomy: &str,
        append: bool,
    ) -> Result<()>;
}

pub trait RemoteFetcher {
    fn download(&mut self, url: &str) -> Result<DownloadedFile>;
}

pub trait MediaLibrary {
    fn sideload(
        &mut self,
        file: &DownloadedFile,
        filename: &str,
        attach_to: RecordId,
    ) -> Result<ResourceId>;
    fn resource_url(&mut self, id: ResourceId) -> Result<String>;
}

/// Everything a WordPress backend offers to the migrations.
pub trait WordPressSite: RecordStore + TaxonomyStore + MediaLibrary {
    fn describe(&self) -> String;
}

pub fn mime_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpe" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::{DownloadedFile, mime_type_for};

    #[test]
    fn mime_types_follow_extension_case_insensitively() {
        assert_eq!(mime_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(mime_type_for("photo.jpe"), "image/jpeg");
        assert_eq!(mime_type_for("anim.gif"), "image/gif");
        assert_eq!(mime_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn downloaded_file_round_trips_payload() {
        let file = DownloadedFile::from_bytes("https://a.test/x.png", None, b"png-bytes")
            .expect("temp file");
        assert_eq!(file.bytes, 9);
        assert_eq!(file.read_bytes().expect("read"), b"png-bytes");
        assert!(file.path().exists());
    }
}
