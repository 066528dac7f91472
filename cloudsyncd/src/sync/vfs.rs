use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::item::ItemRecord;

pub const PLACEHOLDER_SUFFIX: &str = ".cloudsync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfsMode {
    /// Every remote file is downloaded.
    #[default]
    Off,
    /// Unpinned remote files are represented by `name.cloudsync` stubs.
    Suffix,
}

impl VfsMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(VfsMode::Off),
            "suffix" => Some(VfsMode::Suffix),
            _ => None,
        }
    }
}

/// Contents of a placeholder file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderMeta {
    pub size: u64,
    pub modified: i64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl PlaceholderMeta {
    pub fn from_record(record: &ItemRecord) -> Self {
        Self {
            size: record.size,
            modified: record.modified,
            checksum: record.checksum.as_ref().map(|c| c.to_string()),
            resource_id: record.resource_id.clone(),
        }
    }
}

/// `dir/name` -> `dir/name.cloudsync`
pub fn placeholder_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(PLACEHOLDER_SUFFIX);
    local.with_file_name(name)
}

/// Real item name for a placeholder file name.
pub fn strip_placeholder_suffix(name: &str) -> Option<&str> {
    name.strip_suffix(PLACEHOLDER_SUFFIX)
        .filter(|real| !real.is_empty())
}

pub fn write_placeholder(local: &Path, record: &ItemRecord) -> io::Result<PathBuf> {
    let path = placeholder_path(local);
    let body = serde_json::to_vec_pretty(&PlaceholderMeta::from_record(record))
        .map_err(io::Error::other)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

pub fn read_placeholder(path: &Path) -> io::Result<PlaceholderMeta> {
    let body = std::fs::read(path)?;
    serde_json::from_slice(&body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_naming() {
        assert_eq!(
            placeholder_path(Path::new("/sync/Docs/a.txt")),
            PathBuf::from("/sync/Docs/a.txt.cloudsync")
        );
        assert_eq!(strip_placeholder_suffix("a.txt.cloudsync"), Some("a.txt"));
        assert_eq!(strip_placeholder_suffix(".cloudsync"), None);
        assert_eq!(strip_placeholder_suffix("a.txt"), None);
    }

    #[test]
    fn writes_and_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = ItemRecord::file("a.txt", 12, 1_700_000_000);
        record.resource_id = Some("r1".into());
        let written = write_placeholder(&dir.path().join("a.txt"), &record).unwrap();

        let meta = read_placeholder(&written).unwrap();
        assert_eq!(meta.size, 12);
        assert_eq!(meta.resource_id.as_deref(), Some("r1"));
    }

    #[test]
    fn parses_mode() {
        assert_eq!(VfsMode::parse("Suffix"), Some(VfsMode::Suffix));
        assert_eq!(VfsMode::parse("off"), Some(VfsMode::Off));
        assert_eq!(VfsMode::parse("wat"), None);
    }
}
