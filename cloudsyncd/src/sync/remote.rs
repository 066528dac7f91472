use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use cloudsync_core::{RemoteClient, RemoteError, Resource, ResourceType, UploadSession};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::item::{Checksum, ItemRecord, ItemType, RemotePermissions};
use super::paths;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

const LIST_PAGE_SIZE: u32 = 1000;

/// Body of a (possibly ranged) download.
pub struct RemoteDownload {
    /// Offset the body starts at. Zero when the server ignored the range.
    pub offset: u64,
    pub stream: ByteStream,
}

/// The remote replica, addressed by relative sync paths.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every item below the sync root, parents before children.
    async fn list_tree(&self) -> Result<Vec<ItemRecord>, RemoteError>;

    async fn stat(&self, path: &str) -> Result<Option<ItemRecord>, RemoteError>;

    /// Available bytes, `None` when unlimited.
    async fn quota(&self) -> Result<Option<u64>, RemoteError>;

    async fn download(&self, path: &str, offset: u64) -> Result<RemoteDownload, RemoteError>;

    /// Single-request upload; the server adopts `modified`.
    async fn upload(&self, path: &str, data: Bytes, modified: i64)
    -> Result<ItemRecord, RemoteError>;

    async fn create_upload_session(
        &self,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<UploadSession, RemoteError>;

    /// Bytes the server has acknowledged for the session.
    async fn upload_progress(&self, session_id: &str) -> Result<u64, RemoteError>;

    async fn upload_chunk(&self, session_id: &str, index: u64, data: Bytes)
    -> Result<(), RemoteError>;

    async fn commit_upload(
        &self,
        session_id: &str,
        path: &str,
        checksum: Option<&Checksum>,
        modified: i64,
    ) -> Result<ItemRecord, RemoteError>;

    async fn mkdir(&self, path: &str) -> Result<ItemRecord, RemoteError>;

    async fn move_item(&self, from: &str, to: &str) -> Result<ItemRecord, RemoteError>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;
}

/// [`RemoteStore`] over the HTTP client, rooted at `remote_root`.
#[derive(Clone)]
pub struct HttpRemote {
    client: RemoteClient,
    remote_root: String,
}

impl HttpRemote {
    pub fn new(client: RemoteClient, remote_root: impl Into<String>) -> Self {
        Self {
            client,
            remote_root: remote_root.into(),
        }
    }

    fn remote_path(&self, rel: &str) -> String {
        paths::remote_path_for(&self.remote_root, rel)
    }

    fn record(&self, resource: &Resource) -> Result<ItemRecord, RemoteError> {
        record_from_resource(&self.remote_root, resource).ok_or_else(|| RemoteError::Api {
            status: StatusCode::BAD_GATEWAY,
            body: format!("resource {} is outside the sync root", resource.path),
            retry_after: None,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_tree(&self) -> Result<Vec<ItemRecord>, RemoteError> {
        let root = self.remote_path("");
        let resources = self.client.list_tree_all(&root, LIST_PAGE_SIZE).await?;
        Ok(resources
            .iter()
            .filter_map(|resource| record_from_resource(&self.remote_root, resource))
            .filter(|record| !record.path.is_empty())
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<ItemRecord>, RemoteError> {
        match self.client.get_resource(&self.remote_path(path)).await {
            Ok(resource) => Ok(Some(self.record(&resource)?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn quota(&self) -> Result<Option<u64>, RemoteError> {
        Ok(self.client.get_quota().await?.available())
    }

    async fn download(&self, path: &str, offset: u64) -> Result<RemoteDownload, RemoteError> {
        let response = self.client.download(&self.remote_path(path), offset).await?;
        let offset = if response.status() == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RemoteError::from));
        Ok(RemoteDownload {
            offset,
            stream: Box::pin(stream),
        })
    }

    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        modified: i64,
    ) -> Result<ItemRecord, RemoteError> {
        let resource = self
            .client
            .upload(&self.remote_path(path), data, Some(modified))
            .await?;
        self.record(&resource)
    }

    async fn create_upload_session(
        &self,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<UploadSession, RemoteError> {
        self.client
            .create_upload_session(&self.remote_path(path), total_size, chunk_size)
            .await
    }

    async fn upload_progress(&self, session_id: &str) -> Result<u64, RemoteError> {
        Ok(self.client.get_upload_progress(session_id).await?.received_bytes)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        self.client.upload_chunk(session_id, index, data.to_vec()).await
    }

    async fn commit_upload(
        &self,
        session_id: &str,
        path: &str,
        checksum: Option<&Checksum>,
        modified: i64,
    ) -> Result<ItemRecord, RemoteError> {
        let checksum = checksum.map(|c| c.to_string());
        let resource = self
            .client
            .commit_upload(
                session_id,
                &self.remote_path(path),
                checksum.as_deref(),
                Some(modified),
            )
            .await?;
        self.record(&resource)
    }

    async fn mkdir(&self, path: &str) -> Result<ItemRecord, RemoteError> {
        let resource = self.client.create_folder(&self.remote_path(path)).await?;
        self.record(&resource)
    }

    async fn move_item(&self, from: &str, to: &str) -> Result<ItemRecord, RemoteError> {
        let resource = self
            .client
            .move_resource(&self.remote_path(from), &self.remote_path(to), false)
            .await?;
        self.record(&resource)
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.client.delete_resource(&self.remote_path(path)).await
    }
}

/// Maps a server resource to a record keyed by its relative path. Resources
/// outside the root are dropped; unparsable metadata degrades to "unknown".
pub fn record_from_resource(remote_root: &str, resource: &Resource) -> Option<ItemRecord> {
    let path = match paths::rel_path_from_remote(remote_root, &resource.path) {
        Ok(path) => path,
        Err(err) => {
            tracing::warn!(path = %resource.path, error = %err, "ignoring remote resource");
            return None;
        }
    };
    let modified = resource
        .modified
        .as_deref()
        .and_then(|value| match parse_rfc3339(value) {
            Some(ts) => Some(ts),
            None => {
                tracing::warn!(path = %resource.path, modified = %value, "unparsable modification time");
                None
            }
        })
        .unwrap_or(0);
    let checksum = resource
        .checksum
        .as_deref()
        .and_then(|value| Checksum::parse(value).ok());
    let permissions = resource.permissions.clone().map(RemotePermissions::new);
    let read_only = permissions
        .as_ref()
        .is_some_and(|perms| !perms.can_write());
    Some(ItemRecord {
        path,
        item_type: match resource.resource_type {
            ResourceType::File => ItemType::File,
            ResourceType::Dir => ItemType::Dir,
        },
        resource_id: resource.resource_id.clone(),
        size: resource.size.unwrap_or(0),
        modified,
        checksum,
        permissions,
        read_only,
        fingerprint: 0,
        placeholder: false,
    })
}

pub fn parse_rfc3339(value: &str) -> Option<i64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|dt| dt.unix_timestamp())
}

pub fn format_rfc3339(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Server answers that mean the move target is invalid and the source should
/// be put back.
pub fn is_invalid_move_target(err: &RemoteError) -> bool {
    matches!(
        err.status().map(|s| s.as_u16()),
        Some(400 | 403 | 409 | 412 | 415)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resource(path: &str, kind: ResourceType) -> Resource {
        Resource {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            resource_type: kind,
            size: Some(5),
            modified: Some("2024-01-01T00:00:00Z".into()),
            resource_id: Some("r1".into()),
            checksum: Some("MD5:5d41402abc4b2a76b9719d911017c592".into()),
            permissions: Some("RGDNV".into()),
        }
    }

    #[test]
    fn maps_resource_to_relative_record() {
        let record = record_from_resource("/Sync", &resource("/Sync/Docs/a.txt", ResourceType::File))
            .unwrap();
        assert_eq!(record.path, "Docs/a.txt");
        assert_eq!(record.modified, 1_704_067_200);
        assert_eq!(record.size, 5);
        assert!(record.read_only);
        assert!(record.checksum.is_some());
        assert!(record_from_resource("/Sync", &resource("/Else/a.txt", ResourceType::File)).is_none());
    }

    #[test]
    fn rfc3339_round_trip() {
        assert_eq!(parse_rfc3339(&format_rfc3339(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(parse_rfc3339("yesterday"), None);
    }

    #[tokio::test]
    async fn stat_maps_not_found_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources"))
            .and(query_param("path", "/Sync/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/resources"))
            .and(query_param("path", "/Sync/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "path": "/Sync/a.txt",
                "name": "a.txt",
                "type": "file",
                "size": 1,
                "resource_id": "r9"
            })))
            .mount(&server)
            .await;

        let client = RemoteClient::with_base_url(&server.uri(), "token").unwrap();
        let remote = HttpRemote::new(client, "/Sync");

        assert!(remote.stat("missing.txt").await.unwrap().is_none());
        let record = remote.stat("a.txt").await.unwrap().unwrap();
        assert_eq!(record.resource_id.as_deref(), Some("r9"));
    }

    #[tokio::test]
    async fn download_reports_ignored_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole"))
            .mount(&server)
            .await;

        let client = RemoteClient::with_base_url(&server.uri(), "token").unwrap();
        let remote = HttpRemote::new(client, "/");
        let mut download = remote.download("a.txt", 3).await.unwrap();

        assert_eq!(download.offset, 0);
        let mut body = Vec::new();
        while let Some(chunk) = download.stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"whole");
    }

    #[test]
    fn invalid_move_targets() {
        let err = RemoteError::Api {
            status: StatusCode::CONFLICT,
            body: String::new(),
            retry_after: None,
        };
        assert!(is_invalid_move_target(&err));
        let err = RemoteError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
            retry_after: None,
        };
        assert!(!is_invalid_move_target(&err));
    }
}
