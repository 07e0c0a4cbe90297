//! Remote record store: direct repository access or the backend proxy.

mod direct;
pub mod paths;
mod proxy;

#[cfg(test)]
pub(crate) mod memory;

use fitrep_core::{ContentsError, OriginPolicy, ProxyError, Repository};
use thiserror::Error;

use crate::model::{Evaluation, EvaluationIndex, Profile};

pub use direct::DirectRemoteClient;
pub use paths::PathError;
pub use proxy::ProxyRemoteClient;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Contents(#[from] ContentsError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote sync is not configured: {0}")]
    NotConfigured(String),
}

impl RemoteError {
    /// Transport failures, throttling and server errors; worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Contents(err) => err.is_retryable(),
            RemoteError::Proxy(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Failures no retry can fix: credentials, origin policy, missing setup.
    pub fn is_configuration(&self) -> bool {
        match self {
            RemoteError::Contents(err) => matches!(
                err.classification(),
                Some(fitrep_core::ApiErrorClass::Auth)
            ) || matches!(err, ContentsError::Url(_) | ContentsError::CannotBeABase),
            RemoteError::Proxy(err) => err.is_configuration(),
            RemoteError::NotConfigured(_) => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Contents(err) if err.is_conflict())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub success: bool,
    pub file_path: Option<String>,
    pub commit_sha: Option<String>,
    pub message: String,
}

impl RemoteOutcome {
    pub fn saved(file_path: impl Into<String>, commit_sha: Option<String>, message: &str) -> Self {
        Self {
            success: true,
            file_path: Some(file_path.into()),
            commit_sha,
            message: message.to_string(),
        }
    }

    pub fn unsupported(message: &str) -> Self {
        Self {
            success: false,
            file_path: None,
            commit_sha: None,
            message: message.to_string(),
        }
    }
}

/// Operations every remote backend offers. Writes are per record; the
/// evaluation index is kept consistent with every full-record save or delete.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    async fn save_evaluation(
        &self,
        login: &str,
        evaluation: &Evaluation,
    ) -> Result<RemoteOutcome, RemoteError>;

    async fn load_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<Option<Evaluation>, RemoteError>;

    async fn list_evaluations(&self, login: &str) -> Result<Vec<Evaluation>, RemoteError>;

    async fn delete_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<RemoteOutcome, RemoteError>;

    async fn load_index(&self, login: &str) -> Result<Option<EvaluationIndex>, RemoteError>;

    async fn save_index(
        &self,
        login: &str,
        index: &EvaluationIndex,
    ) -> Result<RemoteOutcome, RemoteError>;

    async fn save_profile(&self, profile: &Profile) -> Result<RemoteOutcome, RemoteError>;

    async fn load_profile(&self, login: &str) -> Result<Option<Profile>, RemoteError>;

    async fn delete_profile(&self, login: &str) -> Result<RemoteOutcome, RemoteError>;
}

/// How to reach the remote: a repository token takes precedence over the proxy.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub token: Option<String>,
    pub repository: Option<Repository>,
    pub api_base: String,
    pub backend_url: Option<String>,
    pub origin_policy: OriginPolicy,
}

pub enum RemoteSyncClient {
    Direct(DirectRemoteClient),
    Proxy(ProxyRemoteClient),
}

impl RemoteSyncClient {
    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        if let (Some(token), Some(repository)) = (&config.token, &config.repository) {
            let client = DirectRemoteClient::with_base_url(
                &config.api_base,
                repository.clone(),
                token,
            )?;
            return Ok(RemoteSyncClient::Direct(client));
        }
        if let Some(backend_url) = &config.backend_url {
            let client = ProxyRemoteClient::new(backend_url, config.origin_policy.clone())?;
            return Ok(RemoteSyncClient::Proxy(client));
        }
        Err(RemoteError::NotConfigured(
            "set a repository token or a backend URL".to_string(),
        ))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            RemoteSyncClient::Direct(_) => "direct",
            RemoteSyncClient::Proxy(_) => "proxy",
        }
    }
}

impl RemoteStore for RemoteSyncClient {
    async fn save_evaluation(
        &self,
        login: &str,
        evaluation: &Evaluation,
    ) -> Result<RemoteOutcome, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.save_evaluation(login, evaluation).await,
            RemoteSyncClient::Proxy(c) => c.save_evaluation(login, evaluation).await,
        }
    }

    async fn load_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<Option<Evaluation>, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.load_evaluation(login, evaluation_id).await,
            RemoteSyncClient::Proxy(c) => c.load_evaluation(login, evaluation_id).await,
        }
    }

    async fn list_evaluations(&self, login: &str) -> Result<Vec<Evaluation>, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.list_evaluations(login).await,
            RemoteSyncClient::Proxy(c) => c.list_evaluations(login).await,
        }
    }

    async fn delete_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<RemoteOutcome, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.delete_evaluation(login, evaluation_id).await,
            RemoteSyncClient::Proxy(c) => c.delete_evaluation(login, evaluation_id).await,
        }
    }

    async fn load_index(&self, login: &str) -> Result<Option<EvaluationIndex>, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.load_index(login).await,
            RemoteSyncClient::Proxy(c) => c.load_index(login).await,
        }
    }

    async fn save_index(
        &self,
        login: &str,
        index: &EvaluationIndex,
    ) -> Result<RemoteOutcome, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.save_index(login, index).await,
            RemoteSyncClient::Proxy(c) => c.save_index(login, index).await,
        }
    }

    async fn save_profile(&self, profile: &Profile) -> Result<RemoteOutcome, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.save_profile(profile).await,
            RemoteSyncClient::Proxy(c) => c.save_profile(profile).await,
        }
    }

    async fn load_profile(&self, login: &str) -> Result<Option<Profile>, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.load_profile(login).await,
            RemoteSyncClient::Proxy(c) => c.load_profile(login).await,
        }
    }

    async fn delete_profile(&self, login: &str) -> Result<RemoteOutcome, RemoteError> {
        match self {
            RemoteSyncClient::Direct(c) => c.delete_profile(login).await,
            RemoteSyncClient::Proxy(c) => c.delete_profile(login).await,
        }
    }
}
