use fitrep_core::{OriginPolicy, ProxyClient, SaveResponse};

use super::{RemoteError, RemoteOutcome, RemoteStore};
use crate::model::{Evaluation, EvaluationIndex, Profile, SyncStatus};

/// Remote access through the backend proxy. The backend owns file layout and
/// the evaluation index.
#[derive(Clone)]
pub struct ProxyRemoteClient {
    client: ProxyClient,
}

impl ProxyRemoteClient {
    pub fn new(base_url: &str, policy: OriginPolicy) -> Result<Self, RemoteError> {
        Ok(Self {
            client: ProxyClient::new(base_url, policy)?,
        })
    }

    pub fn client(&self) -> &ProxyClient {
        &self.client
    }
}

fn outcome(response: SaveResponse, fallback: &str) -> RemoteOutcome {
    RemoteOutcome {
        success: true,
        file_path: response.file_path,
        commit_sha: response.commit_sha,
        message: response.message.unwrap_or_else(|| fallback.to_string()),
    }
}

impl RemoteStore for ProxyRemoteClient {
    async fn save_evaluation(
        &self,
        login: &str,
        evaluation: &Evaluation,
    ) -> Result<RemoteOutcome, RemoteError> {
        let mut stored = evaluation.clone();
        stored.sync_status = SyncStatus::Synced;
        let response = self.client.save_evaluation(login, &stored).await?;
        Ok(outcome(response, "Evaluation saved"))
    }

    async fn load_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<Option<Evaluation>, RemoteError> {
        let evaluations = self.list_evaluations(login).await?;
        Ok(evaluations.into_iter().find(|e| e.id == evaluation_id))
    }

    async fn list_evaluations(&self, login: &str) -> Result<Vec<Evaluation>, RemoteError> {
        Ok(self.client.list_evaluations(login).await?)
    }

    async fn delete_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<RemoteOutcome, RemoteError> {
        let response = self.client.delete_evaluation(login, evaluation_id).await?;
        Ok(outcome(response, "Evaluation deleted"))
    }

    async fn load_index(&self, _login: &str) -> Result<Option<EvaluationIndex>, RemoteError> {
        Ok(None)
    }

    async fn save_index(
        &self,
        _login: &str,
        _index: &EvaluationIndex,
    ) -> Result<RemoteOutcome, RemoteError> {
        Ok(RemoteOutcome::unsupported("index is maintained by the backend"))
    }

    async fn save_profile(&self, profile: &Profile) -> Result<RemoteOutcome, RemoteError> {
        let response = self.client.save_user(&profile.metadata_only()).await?;
        Ok(outcome(response, "Profile saved"))
    }

    async fn load_profile(&self, login: &str) -> Result<Option<Profile>, RemoteError> {
        Ok(self.client.load_user(login).await?)
    }

    async fn delete_profile(&self, _login: &str) -> Result<RemoteOutcome, RemoteError> {
        Ok(RemoteOutcome::unsupported(
            "backend does not delete profiles",
        ))
    }
}
