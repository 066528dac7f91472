use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid item type: {0}")]
    InvalidItemType(String),
    #[error("unsupported checksum: {0}")]
    InvalidChecksum(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Dir,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Dir => "dir",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ItemError> {
        match value {
            "file" => Ok(ItemType::File),
            "dir" => Ok(ItemType::Dir),
            other => Err(ItemError::InvalidItemType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha256 => "SHA256",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Some(ChecksumAlgorithm::Md5),
            "SHA256" | "SHA-256" => Some(ChecksumAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            ChecksumAlgorithm::Md5 => ChecksumHasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
        }
    }
}

/// Content checksum in the wire form `ALGO:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, ItemError> {
        let (algo, hex) = value
            .split_once(':')
            .ok_or_else(|| ItemError::InvalidChecksum(value.to_string()))?;
        let algorithm = ChecksumAlgorithm::parse(algo)
            .ok_or_else(|| ItemError::InvalidChecksum(value.to_string()))?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ItemError::InvalidChecksum(value.to_string()));
        }
        Ok(Self::new(algorithm, hex))
    }

    pub fn of_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finish()
    }

    pub fn of_file(algorithm: ChecksumAlgorithm, path: &Path) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finish())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

pub enum ChecksumHasher {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Md5(ctx) => ctx.consume(data),
            ChecksumHasher::Sha256(ctx) => ctx.update(data),
        }
    }

    pub fn finish(self) -> Checksum {
        match self {
            ChecksumHasher::Md5(ctx) => {
                Checksum::new(ChecksumAlgorithm::Md5, format!("{:x}", ctx.compute()))
            }
            ChecksumHasher::Sha256(ctx) => {
                let digest = ctx.finalize();
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                Checksum::new(ChecksumAlgorithm::Sha256, hex)
            }
        }
    }
}

/// Server permission string. Unknown permissions allow everything.
///
/// `W` write, `D` delete, `N` rename, `V` move, `C` add file, `K` add
/// subdirectory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePermissions(pub String);

impl RemotePermissions {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn has(&self, flag: char) -> bool {
        self.0.contains(flag)
    }

    pub fn can_write(&self) -> bool {
        self.has('W')
    }

    pub fn can_delete(&self) -> bool {
        self.has('D')
    }

    pub fn can_rename(&self) -> bool {
        self.has('N')
    }

    pub fn can_move(&self) -> bool {
        self.has('V')
    }

    pub fn can_add_file(&self) -> bool {
        self.has('C')
    }

    pub fn can_add_subdir(&self) -> bool {
        self.has('K')
    }
}

/// One filesystem entry as seen by a walker or remembered by the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    /// Relative, `/`-separated, no leading slash.
    pub path: String,
    pub item_type: ItemType,
    pub resource_id: Option<String>,
    pub size: u64,
    /// Unix seconds.
    pub modified: i64,
    pub checksum: Option<Checksum>,
    pub permissions: Option<RemotePermissions>,
    pub read_only: bool,
    /// Inode on unix, 0 when unknown.
    pub fingerprint: u64,
    pub placeholder: bool,
}

impl ItemRecord {
    pub fn file(path: impl Into<String>, size: u64, modified: i64) -> Self {
        Self {
            path: path.into(),
            item_type: ItemType::File,
            resource_id: None,
            size,
            modified,
            checksum: None,
            permissions: None,
            read_only: false,
            fingerprint: 0,
            placeholder: false,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            item_type: ItemType::Dir,
            resource_id: None,
            size: 0,
            modified: 0,
            checksum: None,
            permissions: None,
            read_only: false,
            fingerprint: 0,
            placeholder: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.item_type == ItemType::Dir
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// `Some(equal)` when both sides carry a checksum of the same algorithm.
    pub fn checksum_matches(&self, other: &ItemRecord) -> Option<bool> {
        match (&self.checksum, &other.checksum) {
            (Some(a), Some(b)) if a.algorithm == b.algorithm => Some(a.hex == b.hex),
            _ => None,
        }
    }

    /// Content equality: checksums when comparable, size and mtime otherwise.
    pub fn same_content(&self, other: &ItemRecord) -> bool {
        if self.item_type != other.item_type {
            return false;
        }
        if self.is_dir() {
            return true;
        }
        if self.size != other.size {
            return false;
        }
        match self.checksum_matches(other) {
            Some(equal) => equal,
            None => self.modified == other.modified,
        }
    }
}
