use std::time::SystemTime;

use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("api response missing embedded items")]
    MissingEmbedded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Quota,
    Permanent,
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl RemoteClient {
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_quota(&self) -> Result<QuotaInfo, RemoteError> {
        let url = self.endpoint("/v1/quota")?;
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_resource(&self, path: &str) -> Result<Resource, RemoteError> {
        let mut url = self.endpoint("/v1/resources")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// One page of the recursive listing below `path`.
    pub async fn list_tree(
        &self,
        path: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<ResourceList, RemoteError> {
        let mut url = self.endpoint("/v1/tree")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        let payload: ResourceListResponse = Self::handle_response(response).await?;
        payload.embedded.ok_or(RemoteError::MissingEmbedded)
    }

    pub async fn list_tree_all(
        &self,
        path: &str,
        page_size: u32,
    ) -> Result<Vec<Resource>, RemoteError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_tree(path, Some(page_size), Some(offset))
                .await?;
            let fetched = page.items.len() as u32;
            offset = offset.saturating_add(fetched);
            let total = page.total;
            items.extend(page.items);
            if offset >= total || fetched == 0 {
                break;
            }
        }
        Ok(items)
    }

    /// Starts a content download, resuming at `offset` through a range request.
    ///
    /// The caller must check the status: a server that ignores the range
    /// answers 200 with the whole body instead of 206.
    pub async fn download(&self, path: &str, offset: u64) -> Result<Response, RemoteError> {
        let mut url = self.endpoint("/v1/content")?;
        url.query_pairs_mut().append_pair("path", path);
        let mut request = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value());
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    /// Single-request upload. `modified` (unix seconds) is adopted by the
    /// server as the item's modification time.
    pub async fn upload(
        &self,
        path: &str,
        body: impl Into<reqwest::Body>,
        modified: Option<i64>,
    ) -> Result<Resource, RemoteError> {
        let mut url = self.endpoint("/v1/content")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            query.append_pair("overwrite", "true");
            if let Some(modified) = modified {
                query.append_pair("modified", &modified.to_string());
            }
        }
        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_upload_session(
        &self,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<UploadSession, RemoteError> {
        let mut url = self.endpoint("/v1/uploads")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("size", &total_size.to_string())
            .append_pair("chunk_size", &chunk_size.to_string());
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_upload_progress(&self, session_id: &str) -> Result<UploadProgress, RemoteError> {
        let url = self.endpoint(&format!("/v1/uploads/{session_id}"))?;
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn upload_chunk(
        &self,
        session_id: &str,
        index: u64,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("/v1/uploads/{session_id}/chunks/{index}"))?;
        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .body(data)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn commit_upload(
        &self,
        session_id: &str,
        path: &str,
        checksum: Option<&str>,
        modified: Option<i64>,
    ) -> Result<Resource, RemoteError> {
        let mut url = self.endpoint(&format!("/v1/uploads/{session_id}/commit"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if let Some(checksum) = checksum {
                query.append_pair("checksum", checksum);
            }
            if let Some(modified) = modified {
                query.append_pair("modified", &modified.to_string());
            }
        }
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<Resource, RemoteError> {
        let mut url = self.endpoint("/v1/folders")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn move_resource(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Resource, RemoteError> {
        let mut url = self.endpoint("/v1/resources/move")?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_resource(&self, path: &str) -> Result<(), RemoteError> {
        let mut url = self.endpoint("/v1/resources")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, RemoteError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: Response) -> RemoteError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        RemoteError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl RemoteError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RemoteError::Api { status, .. } => Some(*status),
            RemoteError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            RemoteError::Api { status, .. } => Some(classify_api_status(*status)),
            RemoteError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            RemoteError::Request(err) => err.status().map(classify_api_status),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::INSUFFICIENT_STORAGE {
        ApiErrorClass::Quota
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value.trim()).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaInfo {
    #[serde(default)]
    pub total_space: Option<u64>,
    pub used_space: u64,
}

impl QuotaInfo {
    /// `None` means the server reports no limit.
    pub fn available(&self) -> Option<u64> {
        self.total_space
            .map(|total| total.saturating_sub(self.used_space))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Resource {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize, Serialize)]
struct ResourceListResponse {
    #[serde(rename = "_embedded")]
    embedded: Option<ResourceList>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UploadProgress {
    pub session_id: String,
    pub received_bytes: u64,
}
