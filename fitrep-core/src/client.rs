use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::encoding::{decode_content, encode_content};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("fitrep-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ContentsError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("content is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("content is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("path {0} is a directory, expected a file")]
    NotAFile(String),
    #[error("base url cannot carry path segments")]
    CannotBeABase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Conflict,
    Transient,
    Permanent,
}

/// Repository coordinates for the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub branch: Option<String>,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

#[derive(Clone)]
pub struct ContentsClient {
    http: Client,
    base_url: Url,
    repository: Repository,
    token: String,
}

impl ContentsClient {
    pub fn new(repository: Repository, token: impl Into<String>) -> Result<Self, ContentsError> {
        Self::with_base_url(DEFAULT_BASE_URL, repository, token)
    }

    pub fn with_base_url(
        base_url: &str,
        repository: Repository,
        token: impl Into<String>,
    ) -> Result<Self, ContentsError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ContentsError::CannotBeABase);
        }
        Ok(Self {
            http: Client::builder().user_agent(USER_AGENT).build()?,
            base_url,
            repository,
            token: token.into(),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Reads a file. A 404 is reported as `Ok(None)`.
    pub async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, ContentsError> {
        let Some(payload) = self.fetch(path).await? else {
            return Ok(None);
        };
        match payload {
            ContentsPayload::File(file) => {
                let content = match file.content.as_deref() {
                    Some(encoded) => decode_content(encoded)?,
                    None => String::new(),
                };
                Ok(Some(RemoteFile {
                    path: file.path,
                    sha: file.sha,
                    content,
                }))
            }
            ContentsPayload::Dir(_) => Err(ContentsError::NotAFile(path.to_string())),
        }
    }

    /// Returns the current content digest of `path`, or `None` when the file is absent.
    pub async fn get_sha(&self, path: &str) -> Result<Option<String>, ContentsError> {
        match self.fetch(path).await? {
            Some(ContentsPayload::File(file)) => Ok(Some(file.sha)),
            Some(ContentsPayload::Dir(_)) => Err(ContentsError::NotAFile(path.to_string())),
            None => Ok(None),
        }
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<ContentEntry>, ContentsError> {
        match self.fetch(path).await? {
            Some(ContentsPayload::Dir(entries)) => Ok(entries),
            Some(ContentsPayload::File(file)) => Ok(vec![ContentEntry {
                name: file.name,
                path: file.path,
                sha: file.sha,
                entry_type: EntryType::File,
                size: file.size,
            }]),
            None => Ok(Vec::new()),
        }
    }

    /// Creates or updates `path`. `sha` must be the current digest for updates and
    /// `None` for new files; the API rejects a stale digest with 409.
    pub async fn put_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> Result<CommitInfo, ContentsError> {
        let url = self.contents_url(path)?;
        let body = WriteRequest {
            message,
            content: Some(encode_content(content)),
            sha,
            branch: self.repository.branch.as_deref(),
        };
        debug!(path, has_sha = sha.is_some(), "writing remote file");
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;
        let payload: WriteResponse = Self::handle_response(response).await?;
        Ok(payload.into_commit_info(path))
    }

    pub async fn delete_file(
        &self,
        path: &str,
        message: &str,
        sha: &str,
    ) -> Result<CommitInfo, ContentsError> {
        let url = self.contents_url(path)?;
        let body = WriteRequest {
            message,
            content: None,
            sha: Some(sha),
            branch: self.repository.branch.as_deref(),
        };
        debug!(path, "deleting remote file");
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;
        let payload: WriteResponse = Self::handle_response(response).await?;
        Ok(payload.into_commit_info(path))
    }

    async fn fetch(&self, path: &str) -> Result<Option<ContentsPayload>, ContentsError> {
        let mut url = self.contents_url(path)?;
        if let Some(branch) = &self.repository.branch {
            url.query_pairs_mut().append_pair("ref", branch);
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn contents_url(&self, path: &str) -> Result<Url, ContentsError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ContentsError::CannotBeABase)?;
            segments.pop_if_empty().extend([
                "repos",
                self.repository.owner.as_str(),
                self.repository.name.as_str(),
                "contents",
            ]);
            segments.extend(path.split('/').filter(|part| !part.is_empty()));
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ContentsError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ContentsError::Api { status, body })
        }
    }
}

impl ContentsError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ContentsError::Api { status, body } => Some(classify_api_status(*status, body)),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ContentsError::Api { status, .. } => Some(*status),
            ContentsError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Conflict))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ContentsError::Request(_) => true,
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient | ApiErrorClass::Conflict)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    if status == StatusCode::CONFLICT || is_digest_mismatch(status, body) {
        ApiErrorClass::Conflict
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

// The API reports a stale or missing digest as 422 with a message instead of 409.
fn is_digest_mismatch(status: StatusCode, body: &str) -> bool {
    if !matches!(
        status,
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST
    ) {
        return false;
    }
    let body = body.to_ascii_lowercase();
    body.contains("does not match") || (body.contains("sha") && body.contains("wasn't supplied"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub sha: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub path: String,
    pub content_sha: Option<String>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub name: String,
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Submodule,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsPayload {
    Dir(Vec<ContentEntry>),
    File(FileResponse),
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    name: String,
    path: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    content: Option<ContentRef>,
    #[serde(default)]
    commit: Option<CommitRef>,
}

#[derive(Debug, Deserialize)]
struct ContentRef {
    path: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

impl WriteResponse {
    fn into_commit_info(self, requested_path: &str) -> CommitInfo {
        let (path, content_sha) = match self.content {
            Some(content) => (content.path, Some(content.sha)),
            None => (requested_path.to_string(), None),
        };
        CommitInfo {
            path,
            content_sha,
            commit_sha: self.commit.map(|commit| commit.sha),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_conflicts() {
        assert_eq!(
            classify_api_status(StatusCode::CONFLICT, ""),
            ApiErrorClass::Conflict
        );
        assert_eq!(
            classify_api_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"message":"users/a.json does not match 1234"}"#
            ),
            ApiErrorClass::Conflict
        );
        assert_eq!(
            classify_api_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"message":"\"sha\" wasn't supplied."}"#
            ),
            ApiErrorClass::Conflict
        );
    }

    #[test]
    fn classifies_transient_and_auth() {
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY, ""),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED, ""),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY, "invalid"),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn contents_url_keeps_base_path() {
        let client = ContentsClient::with_base_url(
            "https://ghe.example/api/v3/",
            Repository::new("acme", "fitreps"),
            "t",
        )
        .unwrap();
        let url = client.contents_url("users/jdoe/evaluations/index.json").unwrap();
        assert_eq!(
            url.as_str(),
            "https://ghe.example/api/v3/repos/acme/fitreps/contents/users/jdoe/evaluations/index.json"
        );
    }
}
