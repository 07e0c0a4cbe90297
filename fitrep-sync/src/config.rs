use std::path::{Path, PathBuf};
use std::time::Duration;

use fitrep_core::{OriginPolicy, Repository};
use thiserror::Error;

use crate::remote::RemoteConfig;
use crate::session::LoginIdentity;
use crate::store::{BackendKind, StoreError};
use crate::sync::SyncPolicy;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_BRANCH: &str = "main";
const DEFAULT_SYNC_ATTEMPTS: u64 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 8000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown FITREP_STORE_BACKEND `{0}`")]
    UnknownBackend(String),
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub store_backend: BackendKind,
    pub token: Option<String>,
    pub repository: Option<Repository>,
    pub api_base: String,
    pub backend_url: Option<String>,
    pub app_origin: Option<String>,
    pub allowed_origins: Vec<String>,
    pub offline: bool,
    pub sync_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub user_rank: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHome)?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let data_dir = match var("FITREP_DATA_DIR") {
            Some(value) => expand_with_home(&value, home),
            None => crate::store::default_data_dir()?,
        };
        let store_backend = match var("FITREP_STORE_BACKEND") {
            Some(value) => {
                BackendKind::parse(&value).ok_or(ConfigError::UnknownBackend(value))?
            }
            None => BackendKind::default(),
        };
        let repository = match (var("FITREP_GITHUB_OWNER"), var("FITREP_GITHUB_REPO")) {
            (Some(owner), Some(repo)) => Some(Repository::new(owner, repo).with_branch(
                var("FITREP_GITHUB_BRANCH").unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            )),
            _ => None,
        };
        let allowed_origins = var("FITREP_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            data_dir,
            store_backend,
            token: var("FITREP_GITHUB_TOKEN"),
            repository,
            api_base: var("FITREP_GITHUB_API").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            backend_url: var("FITREP_BACKEND_URL"),
            app_origin: var("FITREP_APP_ORIGIN"),
            allowed_origins,
            offline: read_bool(var("FITREP_OFFLINE"), false),
            sync_attempts: read_u64(var("FITREP_SYNC_ATTEMPTS"), DEFAULT_SYNC_ATTEMPTS)
                .min(u64::from(u32::MAX)) as u32,
            base_delay: Duration::from_millis(read_u64(
                var("FITREP_SYNC_BASE_DELAY_MS"),
                DEFAULT_BASE_DELAY_MS,
            )),
            max_delay: Duration::from_millis(read_u64(
                var("FITREP_SYNC_MAX_DELAY_MS"),
                DEFAULT_MAX_DELAY_MS,
            )),
            user_email: var("FITREP_USER_EMAIL"),
            user_name: var("FITREP_USER_NAME"),
            user_rank: var("FITREP_USER_RANK"),
        })
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy::new(self.sync_attempts, self.base_delay, self.max_delay)
    }

    /// Remote settings. `token` overrides the one read from the environment.
    pub fn remote_config(&self, token: Option<String>) -> RemoteConfig {
        RemoteConfig {
            token: token.or_else(|| self.token.clone()),
            repository: self.repository.clone(),
            api_base: self.api_base.clone(),
            backend_url: self.backend_url.clone(),
            origin_policy: OriginPolicy::new(&self.allowed_origins, self.app_origin.as_deref()),
        }
    }

    pub fn identity(&self) -> Option<LoginIdentity> {
        let email = self.user_email.clone()?;
        let name = self
            .user_name
            .clone()
            .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
        Some(LoginIdentity {
            name,
            email,
            rank: self.user_rank.clone().unwrap_or_default(),
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
