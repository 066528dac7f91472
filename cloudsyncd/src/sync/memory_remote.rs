//! In-memory [`RemoteStore`] used by engine and propagator tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use cloudsync_core::{RemoteError, UploadSession};
use futures_util::stream;
use reqwest::StatusCode;

use super::item::{Checksum, ChecksumAlgorithm, ItemRecord, ItemType, RemotePermissions};
use super::paths;
use super::remote::{RemoteDownload, RemoteStore};

const FULL_PERMISSIONS: &str = "RGDNVWCK";

#[derive(Debug, Clone)]
struct MemItem {
    item_type: ItemType,
    data: Bytes,
    resource_id: String,
    modified: i64,
    permissions: String,
}

#[derive(Debug, Clone)]
struct MemSession {
    path: String,
    total_size: u64,
    chunk_size: u64,
    received: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    deletes: Vec<String>,
    uploads: Vec<String>,
    chunks: Vec<(String, u64)>,
    downloads: Vec<String>,
    moves: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MemoryRemote {
    items: Mutex<BTreeMap<String, MemItem>>,
    sessions: Mutex<HashMap<String, MemSession>>,
    counters: Mutex<Counters>,
    next_id: AtomicU64,
    quota: Mutex<Option<u64>>,
    fail_chunk: Mutex<Option<u64>>,
    fail_moves: Mutex<Option<StatusCode>>,
    corrupt_downloads: AtomicU64,
}

fn api_error(status: StatusCode, body: &str) -> RemoteError {
    RemoteError::Api {
        status,
        body: body.to_string(),
        retry_after: None,
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_id(&self) -> String {
        format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn put_dir(&self, path: &str) -> String {
        let rid = self.next_resource_id();
        self.items.lock().unwrap().insert(
            path.to_string(),
            MemItem {
                item_type: ItemType::Dir,
                data: Bytes::new(),
                resource_id: rid.clone(),
                modified: 0,
                permissions: FULL_PERMISSIONS.to_string(),
            },
        );
        rid
    }

    /// Creates or replaces a file, keeping the resource id of a replaced one.
    pub fn put_file(&self, path: &str, data: &[u8], modified: i64) -> String {
        let mut items = self.items.lock().unwrap();
        let rid = match items.get(path) {
            Some(existing) if existing.item_type == ItemType::File => existing.resource_id.clone(),
            _ => self.next_resource_id(),
        };
        items.insert(
            path.to_string(),
            MemItem {
                item_type: ItemType::File,
                data: Bytes::copy_from_slice(data),
                resource_id: rid.clone(),
                modified,
                permissions: FULL_PERMISSIONS.to_string(),
            },
        );
        rid
    }

    pub fn remove(&self, path: &str) {
        self.items
            .lock()
            .unwrap()
            .retain(|p, _| !paths::is_same_or_descendant(p, path));
    }

    /// Server-side rename, keeping resource ids.
    pub fn rename(&self, from: &str, to: &str) {
        let mut items = self.items.lock().unwrap();
        let moved: Vec<(String, MemItem)> = items
            .iter()
            .filter_map(|(p, item)| paths::rebase(p, from, to).map(|np| (np, item.clone())))
            .collect();
        items.retain(|p, _| !paths::is_same_or_descendant(p, from));
        items.extend(moved);
    }

    pub fn set_permissions(&self, path: &str, permissions: &str) {
        if let Some(item) = self.items.lock().unwrap().get_mut(path) {
            item.permissions = permissions.to_string();
        }
    }

    pub fn set_quota(&self, available: Option<u64>) {
        *self.quota.lock().unwrap() = available;
    }

    /// The next upload of chunk `index` fails with 503.
    pub fn fail_chunk_once(&self, index: u64) {
        *self.fail_chunk.lock().unwrap() = Some(index);
    }

    pub fn fail_moves_with(&self, status: Option<StatusCode>) {
        *self.fail_moves.lock().unwrap() = status;
    }

    /// The next `count` downloads deliver flipped bytes.
    pub fn corrupt_next_downloads(&self, count: u64) {
        self.corrupt_downloads.store(count, Ordering::SeqCst);
    }

    pub fn expire_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.items
            .lock()
            .unwrap()
            .get(path)
            .filter(|item| item.item_type == ItemType::File)
            .map(|item| item.data.to_vec())
    }

    pub fn modified(&self, path: &str) -> Option<i64> {
        self.items.lock().unwrap().get(path).map(|item| item.modified)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.items.lock().unwrap().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.items.lock().unwrap().keys().cloned().collect()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.counters.lock().unwrap().deletes.clone()
    }

    pub fn upload_calls(&self) -> Vec<String> {
        self.counters.lock().unwrap().uploads.clone()
    }

    pub fn chunk_calls(&self) -> Vec<(String, u64)> {
        self.counters.lock().unwrap().chunks.clone()
    }

    pub fn download_calls(&self) -> Vec<String> {
        self.counters.lock().unwrap().downloads.clone()
    }

    pub fn move_calls(&self) -> Vec<(String, String)> {
        self.counters.lock().unwrap().moves.clone()
    }

    pub fn reset_calls(&self) {
        *self.counters.lock().unwrap() = Counters::default();
    }

    fn record(path: &str, item: &MemItem) -> ItemRecord {
        let permissions = RemotePermissions::new(item.permissions.clone());
        ItemRecord {
            path: path.to_string(),
            item_type: item.item_type,
            resource_id: Some(item.resource_id.clone()),
            size: item.data.len() as u64,
            modified: item.modified,
            checksum: (item.item_type == ItemType::File)
                .then(|| Checksum::of_bytes(ChecksumAlgorithm::Md5, &item.data)),
            read_only: !permissions.can_write(),
            permissions: Some(permissions),
            fingerprint: 0,
            placeholder: false,
        }
    }

    fn check_parent(items: &BTreeMap<String, MemItem>, path: &str) -> Result<(), RemoteError> {
        match paths::parent_path(path) {
            Some("") | None => Ok(()),
            Some(parent) => match items.get(parent) {
                Some(item) if item.item_type == ItemType::Dir => Ok(()),
                _ => Err(api_error(StatusCode::CONFLICT, "parent missing")),
            },
        }
    }

    fn store_file(&self, path: &str, data: Bytes, modified: i64) -> Result<ItemRecord, RemoteError> {
        let mut items = self.items.lock().unwrap();
        Self::check_parent(&items, path)?;
        let rid = match items.get(path) {
            Some(existing) if existing.item_type == ItemType::Dir => {
                return Err(api_error(StatusCode::CONFLICT, "directory in the way"));
            }
            Some(existing) => existing.resource_id.clone(),
            None => self.next_resource_id(),
        };
        let item = MemItem {
            item_type: ItemType::File,
            data,
            resource_id: rid,
            modified,
            permissions: FULL_PERMISSIONS.to_string(),
        };
        let record = Self::record(path, &item);
        items.insert(path.to_string(), item);
        Ok(record)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_tree(&self) -> Result<Vec<ItemRecord>, RemoteError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .map(|(path, item)| Self::record(path, item))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<ItemRecord>, RemoteError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(path)
            .map(|item| Self::record(path, item)))
    }

    async fn quota(&self) -> Result<Option<u64>, RemoteError> {
        Ok(*self.quota.lock().unwrap())
    }

    async fn download(&self, path: &str, offset: u64) -> Result<RemoteDownload, RemoteError> {
        self.counters.lock().unwrap().downloads.push(path.to_string());
        let mut data = self
            .file_data(path)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "not found"))?;
        let corrupt = self
            .corrupt_downloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            for byte in &mut data {
                *byte ^= 0xff;
            }
        }
        let start = (offset as usize).min(data.len());
        let body: Vec<Result<Bytes, RemoteError>> = data[start..]
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(RemoteDownload {
            offset: start as u64,
            stream: Box::pin(stream::iter(body)),
        })
    }

    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        modified: i64,
    ) -> Result<ItemRecord, RemoteError> {
        self.counters.lock().unwrap().uploads.push(path.to_string());
        self.store_file(path, data, modified)
    }

    async fn create_upload_session(
        &self,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<UploadSession, RemoteError> {
        let session_id = format!("session-{}", self.next_resource_id());
        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            MemSession {
                path: path.to_string(),
                total_size,
                chunk_size,
                received: Vec::new(),
            },
        );
        Ok(UploadSession {
            session_id,
            chunk_size,
        })
    }

    async fn upload_progress(&self, session_id: &str) -> Result<u64, RemoteError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|session| session.received.len() as u64)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session expired"))
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        {
            let mut fail = self.fail_chunk.lock().unwrap();
            if *fail == Some(index) {
                *fail = None;
                return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "chunk rejected"));
            }
        }
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session expired"))?;
        let expected = index * session.chunk_size;
        if expected != session.received.len() as u64 {
            return Err(api_error(StatusCode::BAD_REQUEST, "chunk out of order"));
        }
        session.received.extend_from_slice(&data);
        let path = session.path.clone();
        drop(sessions);
        self.counters.lock().unwrap().chunks.push((path, index));
        Ok(())
    }

    async fn commit_upload(
        &self,
        session_id: &str,
        path: &str,
        checksum: Option<&Checksum>,
        modified: i64,
    ) -> Result<ItemRecord, RemoteError> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(session_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session expired"))?;
        if session.received.len() as u64 != session.total_size {
            return Err(api_error(StatusCode::BAD_REQUEST, "incomplete upload"));
        }
        if let Some(expected) = checksum {
            let actual = Checksum::of_bytes(expected.algorithm, &session.received);
            if &actual != expected {
                return Err(api_error(StatusCode::BAD_REQUEST, "checksum mismatch"));
            }
        }
        self.counters.lock().unwrap().uploads.push(path.to_string());
        self.store_file(path, Bytes::from(session.received), modified)
    }

    async fn mkdir(&self, path: &str) -> Result<ItemRecord, RemoteError> {
        let mut items = self.items.lock().unwrap();
        Self::check_parent(&items, path)?;
        if items.contains_key(path) {
            return Err(api_error(StatusCode::CONFLICT, "already exists"));
        }
        let item = MemItem {
            item_type: ItemType::Dir,
            data: Bytes::new(),
            resource_id: self.next_resource_id(),
            modified: 0,
            permissions: FULL_PERMISSIONS.to_string(),
        };
        let record = Self::record(path, &item);
        items.insert(path.to_string(), item);
        Ok(record)
    }

    async fn move_item(&self, from: &str, to: &str) -> Result<ItemRecord, RemoteError> {
        self.counters
            .lock()
            .unwrap()
            .moves
            .push((from.to_string(), to.to_string()));
        if let Some(status) = *self.fail_moves.lock().unwrap() {
            return Err(api_error(status, "move rejected"));
        }
        {
            let items = self.items.lock().unwrap();
            if !items.contains_key(from) {
                return Err(api_error(StatusCode::NOT_FOUND, "source missing"));
            }
            if items.contains_key(to) {
                return Err(api_error(StatusCode::CONFLICT, "target exists"));
            }
            Self::check_parent(&items, to)?;
        }
        self.rename(from, to);
        let items = self.items.lock().unwrap();
        items
            .get(to)
            .map(|item| Self::record(to, item))
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "moved item vanished"))
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.counters.lock().unwrap().deletes.push(path.to_string());
        if !self.contains(path) {
            return Err(api_error(StatusCode::NOT_FOUND, "not found"));
        }
        self.remove(path);
        Ok(())
    }
}
