use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use cloudsync_core::{ApiErrorClass, RemoteError};
use futures_util::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::exclude::partial_name;
use super::item::{Checksum, ChecksumAlgorithm, ChecksumHasher, ItemRecord};
use super::job::FailureKind;
use super::journal::{Journal, JournalError, UploadSessionRecord, now_unix};
use super::local_walker::{stat_path, unchanged_since};
use super::paths::{self, PathError};
use super::remote::RemoteStore;

const HASH_BLOCK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote request failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("{0} changed while it was being transferred")]
    ChangedDuringSync(String),
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransferError::Remote(err) => classify_remote(err),
            TransferError::Io(err) => classify_io(err),
            TransferError::Path(_) => FailureKind::NameInvalid,
            TransferError::Journal(_) => FailureKind::LocalIo,
            TransferError::IntegrityMismatch { .. } => FailureKind::ChecksumMismatch,
            TransferError::ChangedDuringSync(_) => FailureKind::Transient,
            TransferError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            TransferError::Remote(err) => err.retry_after_secs(),
            _ => None,
        }
    }
}

pub fn classify_remote(err: &RemoteError) -> FailureKind {
    match err.classification() {
        Some(ApiErrorClass::Quota) => FailureKind::QuotaExceeded,
        Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => FailureKind::Transient,
        Some(ApiErrorClass::Auth) if err.status() == Some(StatusCode::FORBIDDEN) => {
            FailureKind::PermissionDenied
        }
        Some(ApiErrorClass::Auth) => FailureKind::Transient,
        Some(ApiErrorClass::Permanent) => match err.status() {
            Some(StatusCode::URI_TOO_LONG | StatusCode::UNPROCESSABLE_ENTITY) => {
                FailureKind::NameInvalid
            }
            _ => FailureKind::Conflict,
        },
        None => FailureKind::Transient,
    }
}

pub fn classify_io(err: &io::Error) -> FailureKind {
    match err.kind() {
        io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
        io::ErrorKind::StorageFull => FailureKind::QuotaExceeded,
        _ => FailureKind::LocalIo,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Files above this size go through an upload session.
    pub chunk_threshold: u64,
    pub chunk_size: u64,
    /// Extra download attempts after an integrity mismatch.
    pub checksum_retries: u32,
    pub algorithm: ChecksumAlgorithm,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 10 * 1024 * 1024,
            chunk_size: 10 * 1024 * 1024,
            checksum_retries: 3,
            algorithm: ChecksumAlgorithm::Md5,
        }
    }
}

/// Progress callback, called with the bytes transferred so far.
pub type Progress<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Moves file content between the local root and the remote store.
#[derive(Clone)]
pub struct TransferClient {
    remote: Arc<dyn RemoteStore>,
    journal: Arc<Journal>,
    local_root: PathBuf,
    config: TransferConfig,
}

impl TransferClient {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        journal: Arc<Journal>,
        local_root: impl Into<PathBuf>,
        config: TransferConfig,
    ) -> Self {
        Self {
            remote,
            journal,
            local_root: local_root.into(),
            config,
        }
    }

    /// Downloads `remote` into a partial file next to the target, verifies
    /// it and renames it over the target if the target still matches
    /// `expected`. Returns the local record of the new file.
    pub async fn download(
        &self,
        rel: &str,
        remote: &ItemRecord,
        expected: Option<&ItemRecord>,
        cancel: &CancellationToken,
        progress: Progress<'_>,
    ) -> Result<ItemRecord, TransferError> {
        let target = paths::local_path_for(&self.local_root, rel)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.local_root.clone());
        tokio::fs::create_dir_all(&parent).await?;
        let partial = parent.join(partial_name(paths::file_name(rel)));

        let mut attempt = 0;
        let checksum = loop {
            match self.download_once(rel, remote, &partial, cancel, progress).await {
                Ok(checksum) => break checksum,
                Err(err @ TransferError::IntegrityMismatch { .. })
                    if attempt < self.config.checksum_retries =>
                {
                    attempt += 1;
                    tracing::warn!(path = %rel, attempt, error = %err, "download corrupted, retrying");
                    remove_if_exists(&partial).await?;
                }
                Err(err @ (TransferError::IntegrityMismatch { .. } | TransferError::Cancelled)) => {
                    remove_if_exists(&partial).await?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        };

        let modified = UNIX_EPOCH + Duration::from_secs(remote.modified.max(0) as u64);
        let stamped = partial.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&stamped)?
                .set_modified(modified)
        })
        .await
        .map_err(io::Error::other)??;
        apply_permissions(&partial, &target, remote.read_only).await?;

        let current = stat_path(&target, rel)?;
        if !unchanged_since(expected, current.as_ref()) {
            remove_if_exists(&partial).await?;
            return Err(TransferError::ChangedDuringSync(rel.to_string()));
        }
        tokio::fs::rename(&partial, &target).await?;

        let mut record = stat_path(&target, rel)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "downloaded file vanished"))?;
        record.checksum = Some(checksum);
        Ok(record)
    }

    async fn download_once(
        &self,
        rel: &str,
        remote: &ItemRecord,
        partial: &Path,
        cancel: &CancellationToken,
        progress: Progress<'_>,
    ) -> Result<Checksum, TransferError> {
        let existing = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        let offset = if existing < remote.size { existing } else { 0 };
        let download = self.remote.download(rel, offset).await?;

        let algorithm = remote
            .checksum
            .as_ref()
            .map(|c| c.algorithm)
            .unwrap_or(self.config.algorithm);
        let mut hasher = algorithm.hasher();
        let mut file = if download.offset > 0 && download.offset == existing {
            tracing::debug!(path = %rel, offset = download.offset, "resuming download");
            hash_prefix(partial, &mut hasher).await?;
            tokio::fs::OpenOptions::new().append(true).open(partial).await?
        } else {
            tokio::fs::File::create(partial).await?
        };

        let mut written = download.offset;
        let mut stream = download.stream;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                file.flush().await?;
                return Err(TransferError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
            progress(written);
        }
        file.flush().await?;
        file.sync_all().await?;

        if written != remote.size {
            return Err(TransferError::IntegrityMismatch {
                path: rel.to_string(),
                expected: format!("{} bytes", remote.size),
                actual: format!("{written} bytes"),
            });
        }
        let actual = hasher.finish();
        if let Some(expected) = &remote.checksum
            && expected.hex != actual.hex
        {
            return Err(TransferError::IntegrityMismatch {
                path: rel.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(actual)
    }

    /// Uploads the local file at `rel`. Small files go in one request,
    /// larger ones through a resumable session recorded in the journal.
    pub async fn upload(
        &self,
        rel: &str,
        local: &ItemRecord,
        cancel: &CancellationToken,
        progress: Progress<'_>,
    ) -> Result<ItemRecord, TransferError> {
        let source = paths::local_path_for(&self.local_root, rel)?;
        if local.size <= self.config.chunk_threshold {
            let data = tokio::fs::read(&source).await?;
            self.ensure_unchanged(&source, rel, local)?;
            let record = self
                .remote
                .upload(rel, Bytes::from(data), local.modified)
                .await?;
            progress(local.size);
            verify_uploaded(rel, local, &record)?;
            return Ok(record);
        }
        self.upload_chunked(rel, &source, local, cancel, progress)
            .await
    }

    async fn upload_chunked(
        &self,
        rel: &str,
        source: &Path,
        local: &ItemRecord,
        cancel: &CancellationToken,
        progress: Progress<'_>,
    ) -> Result<ItemRecord, TransferError> {
        let (session, mut offset) = self.resume_or_create_session(rel, local).await?;
        let chunk_size = session.chunk_size.max(1);

        let mut file = tokio::fs::File::open(source).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        while offset < local.size {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let index = offset / chunk_size;
            let len = chunk_size.min(local.size - offset) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            self.remote
                .upload_chunk(&session.session_id, index, Bytes::from(buf))
                .await?;
            offset += len as u64;
            self.journal.update_upload_offset(rel, offset).await?;
            progress(offset);
        }

        if let Err(err) = self.ensure_unchanged(source, rel, local) {
            self.journal.delete_upload_session(rel).await?;
            return Err(err);
        }
        let record = match self
            .remote
            .commit_upload(
                &session.session_id,
                rel,
                local.checksum.as_ref(),
                local.modified,
            )
            .await
        {
            Ok(record) => record,
            Err(err) => {
                if err.is_not_found() {
                    self.journal.delete_upload_session(rel).await?;
                }
                return Err(err.into());
            }
        };
        verify_uploaded(rel, local, &record)?;
        Ok(record)
    }

    async fn resume_or_create_session(
        &self,
        rel: &str,
        local: &ItemRecord,
    ) -> Result<(UploadSessionRecord, u64), TransferError> {
        let source_checksum = local.checksum.as_ref().map(Checksum::to_string);
        if let Some(saved) = self.journal.get_upload_session(rel).await? {
            let same_source = saved.total_size == local.size
                && saved.source_modified == local.modified
                && saved.source_checksum == source_checksum;
            if same_source {
                match self.remote.upload_progress(&saved.session_id).await {
                    Ok(acked) if acked <= local.size && acked % saved.chunk_size.max(1) == 0 => {
                        tracing::info!(path = %rel, acked, "resuming upload session");
                        return Ok((saved, acked));
                    }
                    Ok(acked) => {
                        tracing::warn!(path = %rel, acked, "upload session out of step, starting over");
                    }
                    Err(err) if err.is_not_found() => {
                        tracing::info!(path = %rel, "upload session expired, starting over");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            self.journal.delete_upload_session(rel).await?;
        }

        let created = self
            .remote
            .create_upload_session(rel, local.size, self.config.chunk_size)
            .await?;
        let session = UploadSessionRecord {
            path: rel.to_string(),
            session_id: created.session_id,
            total_size: local.size,
            chunk_size: created.chunk_size,
            acked_offset: 0,
            source_checksum,
            source_modified: local.modified,
            created: now_unix(),
        };
        self.journal.save_upload_session(&session).await?;
        Ok((session, 0))
    }

    fn ensure_unchanged(&self, source: &Path, rel: &str, local: &ItemRecord) -> Result<(), TransferError> {
        let current = stat_path(source, rel)?;
        if unchanged_since(Some(local), current.as_ref()) {
            Ok(())
        } else {
            Err(TransferError::ChangedDuringSync(rel.to_string()))
        }
    }
}

fn verify_uploaded(rel: &str, local: &ItemRecord, remote: &ItemRecord) -> Result<(), TransferError> {
    if local.checksum_matches(remote) == Some(false) || remote.size != local.size {
        return Err(TransferError::IntegrityMismatch {
            path: rel.to_string(),
            expected: local
                .checksum
                .as_ref()
                .map(Checksum::to_string)
                .unwrap_or_else(|| format!("{} bytes", local.size)),
            actual: remote
                .checksum
                .as_ref()
                .map(Checksum::to_string)
                .unwrap_or_else(|| format!("{} bytes", remote.size)),
        });
    }
    Ok(())
}

async fn hash_prefix(path: &Path, hasher: &mut ChecksumHasher) -> io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; HASH_BLOCK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        hasher.update(&buf[..read]);
    }
}

/// Carries the old file's permissions over and honours a read-only remote.
async fn apply_permissions(partial: &Path, target: &Path, read_only: bool) -> io::Result<()> {
    let mut permissions = match tokio::fs::metadata(target).await {
        Ok(meta) if meta.is_file() => meta.permissions(),
        _ => tokio::fs::metadata(partial).await?.permissions(),
    };
    if read_only {
        permissions.set_readonly(true);
    } else if permissions.readonly() {
        make_writable(&mut permissions);
    }
    tokio::fs::set_permissions(partial, permissions).await
}

#[cfg(unix)]
fn make_writable(permissions: &mut std::fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(permissions.mode() | 0o200);
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(permissions: &mut std::fs::Permissions) {
    permissions.set_readonly(false);
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Free bytes on the filesystem holding a path.
pub trait FreeSpace: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

pub struct StatvfsSpace;

impl FreeSpace for StatvfsSpace {
    #[cfg(unix)]
    fn available(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        // SAFETY: statvfs is a plain C struct of integers, so all-zero is a
        // valid value.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c_path` is NUL-terminated and outlives the call, and
        // `stat` is a live, writable statvfs.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;
