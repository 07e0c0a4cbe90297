use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("backend returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("malformed backend response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("origin {0} is not allowed")]
    OriginNotAllowed(String),
    #[error("backend url cannot carry path segments")]
    CannotBeABase,
}

impl ProxyError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::Api { status, .. } => Some(*status),
            ProxyError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// Origin and auth failures are configuration problems and are never retried.
    pub fn is_configuration(&self) -> bool {
        match self {
            ProxyError::OriginNotAllowed(_) | ProxyError::CannotBeABase | ProxyError::Url(_) => {
                true
            }
            _ => matches!(
                self.status(),
                Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            ),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Request(_) => true,
            _ => self.status().is_some_and(|status| {
                status.is_server_error()
                    || matches!(
                        status,
                        StatusCode::REQUEST_TIMEOUT
                            | StatusCode::CONFLICT
                            | StatusCode::TOO_MANY_REQUESTS
                    )
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsMode {
    Include,
    Omit,
}

/// Decides which backend origins may be contacted and whether cookies travel with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    caller_origin: Option<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I, caller_origin: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .filter_map(|origin| {
                let normalized = normalize_origin(origin.as_ref());
                if normalized.is_none() {
                    warn!(origin = origin.as_ref(), "ignoring malformed allowed origin");
                }
                normalized
            })
            .collect();
        Self {
            allowed,
            caller_origin: caller_origin.and_then(normalize_origin),
        }
    }

    pub fn evaluate(&self, target: &Url) -> Result<CredentialsMode, ProxyError> {
        let origin = target.origin().ascii_serialization();
        if self.caller_origin.as_deref() == Some(origin.as_str()) {
            return Ok(CredentialsMode::Include);
        }
        if self.allowed.iter().any(|allowed| allowed == &origin) {
            return Ok(if target.scheme() == "https" {
                CredentialsMode::Include
            } else {
                CredentialsMode::Omit
            });
        }
        Err(ProxyError::OriginNotAllowed(origin))
    }
}

fn normalize_origin(value: &str) -> Option<String> {
    let url = Url::parse(value.trim()).ok()?;
    let origin = url.origin();
    origin
        .is_tuple()
        .then(|| origin.ascii_serialization())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEndpoint {
    AccountCreate,
    AccountLogin,
    AccountLogout,
    UserSave,
    UserLoad,
    EvaluationSave,
    EvaluationList,
    EvaluationDelete,
}

impl ProxyEndpoint {
    pub fn segments(self) -> [&'static str; 3] {
        match self {
            ProxyEndpoint::AccountCreate => ["api", "account", "create"],
            ProxyEndpoint::AccountLogin => ["api", "account", "login"],
            ProxyEndpoint::AccountLogout => ["api", "account", "logout"],
            ProxyEndpoint::UserSave => ["api", "user", "save"],
            ProxyEndpoint::UserLoad => ["api", "user", "load"],
            ProxyEndpoint::EvaluationSave => ["api", "evaluation", "save"],
            ProxyEndpoint::EvaluationList => ["api", "evaluation", "list"],
            ProxyEndpoint::EvaluationDelete => ["api", "evaluation", "delete"],
        }
    }
}

#[derive(Clone)]
pub struct ProxyClient {
    with_credentials: Client,
    without_credentials: Client,
    base_url: Url,
    policy: OriginPolicy,
}

impl ProxyClient {
    pub fn new(base_url: &str, policy: OriginPolicy) -> Result<Self, ProxyError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ProxyError::CannotBeABase);
        }
        Ok(Self {
            with_credentials: Client::builder().cookie_store(true).build()?,
            without_credentials: Client::new(),
            base_url,
            policy,
        })
    }

    pub fn endpoint_url(&self, endpoint: ProxyEndpoint) -> Result<Url, ProxyError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProxyError::CannotBeABase)?
            .pop_if_empty()
            .extend(endpoint.segments());
        Ok(url)
    }

    pub async fn create_account(
        &self,
        request: &AccountCreateRequest<'_>,
    ) -> Result<AccountResponse, ProxyError> {
        self.call(ProxyEndpoint::AccountCreate, request).await
    }

    pub async fn login(&self, request: &LoginRequest<'_>) -> Result<AccountResponse, ProxyError> {
        self.call(ProxyEndpoint::AccountLogin, request).await
    }

    pub async fn logout(&self) -> Result<(), ProxyError> {
        let _: Value = self.call(ProxyEndpoint::AccountLogout, &json!({})).await?;
        Ok(())
    }

    pub async fn save_user<T: Serialize>(&self, user: &T) -> Result<SaveResponse, ProxyError> {
        self.call(ProxyEndpoint::UserSave, &json!({ "userData": user }))
            .await
    }

    /// Loads a user record. A 404 or an empty payload is reported as `Ok(None)`.
    pub async fn load_user<T: DeserializeOwned>(&self, email: &str) -> Result<Option<T>, ProxyError> {
        let response: Result<UserPayload, ProxyError> = self
            .call(ProxyEndpoint::UserLoad, &json!({ "email": email }))
            .await;
        match response {
            Ok(payload) => match payload.profile.or(payload.data) {
                Some(Value::Null) | None => Ok(None),
                Some(value) => Ok(Some(serde_json::from_value(value)?)),
            },
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn save_evaluation<T: Serialize>(
        &self,
        email: &str,
        evaluation: &T,
    ) -> Result<SaveResponse, ProxyError> {
        self.call(
            ProxyEndpoint::EvaluationSave,
            &json!({ "userEmail": email, "evaluation": evaluation }),
        )
        .await
    }

    pub async fn list_evaluations<T: DeserializeOwned>(
        &self,
        email: &str,
    ) -> Result<Vec<T>, ProxyError> {
        let response: Result<EvaluationListPayload, ProxyError> = self
            .call(ProxyEndpoint::EvaluationList, &json!({ "email": email }))
            .await;
        match response {
            Ok(payload) => payload
                .evaluations
                .into_iter()
                .map(|value| serde_json::from_value(value).map_err(ProxyError::from))
                .collect(),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_evaluation(
        &self,
        email: &str,
        evaluation_id: &str,
    ) -> Result<SaveResponse, ProxyError> {
        self.call(
            ProxyEndpoint::EvaluationDelete,
            &json!({ "email": email, "id": evaluation_id }),
        )
        .await
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: ProxyEndpoint,
        body: &B,
    ) -> Result<T, ProxyError> {
        let url = self.endpoint_url(endpoint)?;
        let http = match self.policy.evaluate(&url)? {
            CredentialsMode::Include => &self.with_credentials,
            CredentialsMode::Omit => &self.without_credentials,
        };
        debug!(endpoint = ?endpoint, "calling backend proxy");
        let response = http.post(url).json(body).send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProxyError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            // Error envelopes still carry a readable message.
            if let Ok(Envelope { error: Some(error), .. }) = serde_json::from_str(&body) {
                return Err(ProxyError::Api {
                    status,
                    body: error,
                });
            }
            return Err(ProxyError::Api { status, body });
        }
        let value: Value = serde_json::from_str(&body)?;
        let envelope: Envelope = serde_json::from_value(value.clone())?;
        if !envelope.ok {
            return Err(ProxyError::Rejected(
                envelope
                    .error
                    .unwrap_or_else(|| "unspecified backend error".to_string()),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(default)]
    profile: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EvaluationListPayload {
    #[serde(default)]
    evaluations: Vec<Value>,
}

#[derive(Serialize)]
pub struct AccountCreateRequest<'a> {
    pub rank: &'a str,
    pub name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AccountResponse {
    #[serde(default)]
    pub profile: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
