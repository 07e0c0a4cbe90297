use fitrep_core::{CommitInfo, ContentsClient, EntryType, Repository};
use tracing::{debug, info, warn};

use super::paths::{
    evaluation_file_path, evaluation_id_from_file_name, generate_user_file_name, index_file_path,
    user_evaluations_dir,
};
use super::{RemoteError, RemoteOutcome, RemoteStore};
use crate::model::{
    Evaluation, EvaluationIndex, EvaluationIndexEntry, Profile, SyncStatus, normalize_email,
};

/// Reads and writes records as files in a repository through the contents API.
#[derive(Clone)]
pub struct DirectRemoteClient {
    contents: ContentsClient,
}

impl DirectRemoteClient {
    pub fn new(contents: ContentsClient) -> Self {
        Self { contents }
    }

    pub fn with_base_url(
        base_url: &str,
        repository: Repository,
        token: &str,
    ) -> Result<Self, RemoteError> {
        Ok(Self::new(ContentsClient::with_base_url(
            base_url, repository, token,
        )?))
    }

    /// Writes `content` to `path` with the current digest. On a digest
    /// conflict the digest is fetched again and the write retried once.
    pub async fn create_or_update(
        &self,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<CommitInfo, RemoteError> {
        let sha = self.contents.get_sha(path).await?;
        match self
            .contents
            .put_file(path, content, message, sha.as_deref())
            .await
        {
            Ok(commit) => Ok(commit),
            Err(err) if err.is_conflict() => {
                warn!(path, error = %err, "digest conflict, retrying with fresh digest");
                let fresh = self.contents.get_sha(path).await?;
                Ok(self
                    .contents
                    .put_file(path, content, message, fresh.as_deref())
                    .await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes `path` if present. Returns `None` when there was nothing to delete.
    async fn delete_if_present(
        &self,
        path: &str,
        message: &str,
    ) -> Result<Option<CommitInfo>, RemoteError> {
        let Some(sha) = self.contents.get_sha(path).await? else {
            return Ok(None);
        };
        match self.contents.delete_file(path, message, &sha).await {
            Ok(commit) => Ok(Some(commit)),
            Err(err) if err.is_conflict() => {
                warn!(path, error = %err, "digest conflict on delete, retrying");
                let Some(fresh) = self.contents.get_sha(path).await? else {
                    return Ok(None);
                };
                Ok(Some(self.contents.delete_file(path, message, &fresh).await?))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_index<F>(&self, login: &str, update: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut EvaluationIndex),
    {
        let mut index = self
            .load_index(login)
            .await?
            .unwrap_or_else(|| EvaluationIndex::new(login));
        update(&mut index);
        self.save_index(login, &index).await?;
        Ok(())
    }

    async fn read_evaluation_file(&self, path: &str) -> Result<Option<Evaluation>, RemoteError> {
        let Some(file) = self.contents.get_file(path).await? else {
            return Ok(None);
        };
        Ok(Some(serde_yaml::from_str(&file.content)?))
    }

    async fn rebuild_from_directory(&self, login: &str) -> Result<Vec<Evaluation>, RemoteError> {
        let dir = user_evaluations_dir(login)?;
        let entries = self.contents.list_directory(&dir).await?;
        let mut evaluations = Vec::new();
        for entry in entries {
            if entry.entry_type != EntryType::File
                || evaluation_id_from_file_name(&entry.name).is_none()
            {
                continue;
            }
            match self.read_evaluation_file(&entry.path).await {
                Ok(Some(evaluation)) => evaluations.push(evaluation),
                Ok(None) => {}
                Err(err) => warn!(path = %entry.path, error = %err, "skipping unreadable evaluation"),
            }
        }
        Ok(evaluations)
    }
}

impl RemoteStore for DirectRemoteClient {
    async fn save_evaluation(
        &self,
        login: &str,
        evaluation: &Evaluation,
    ) -> Result<RemoteOutcome, RemoteError> {
        let path = evaluation_file_path(login, &evaluation.id)?;
        let mut stored = evaluation.clone();
        stored.sync_status = SyncStatus::Synced;
        let body = serde_yaml::to_string(&stored)?;

        let commit = self
            .create_or_update(&path, &body, &format!("Save evaluation {}", evaluation.id))
            .await?;
        let entry = EvaluationIndexEntry::for_evaluation(evaluation, path.clone());
        self.update_index(login, |index| index.upsert(entry)).await?;

        info!(path = %path, "saved evaluation");
        Ok(RemoteOutcome::saved(path, commit.commit_sha, "Evaluation saved"))
    }

    async fn load_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<Option<Evaluation>, RemoteError> {
        let path = evaluation_file_path(login, evaluation_id)?;
        self.read_evaluation_file(&path).await
    }

    /// Lists through the index when one exists, else by scanning the directory.
    async fn list_evaluations(&self, login: &str) -> Result<Vec<Evaluation>, RemoteError> {
        let Some(index) = self.load_index(login).await? else {
            debug!(login, "no remote index, scanning evaluations directory");
            return self.rebuild_from_directory(login).await;
        };
        let mut evaluations = Vec::with_capacity(index.len());
        for entry in &index.entries {
            match self.read_evaluation_file(&entry.file_path).await {
                Ok(Some(evaluation)) => evaluations.push(evaluation),
                Ok(None) => warn!(path = %entry.file_path, "index entry points at a missing file"),
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => warn!(path = %entry.file_path, error = %err, "skipping unreadable evaluation"),
            }
        }
        Ok(evaluations)
    }

    async fn delete_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<RemoteOutcome, RemoteError> {
        let path = evaluation_file_path(login, evaluation_id)?;
        let commit = self
            .delete_if_present(&path, &format!("Delete evaluation {evaluation_id}"))
            .await?;

        if let Some(mut index) = self.load_index(login).await?
            && index.remove(evaluation_id)
        {
            self.save_index(login, &index).await?;
        }

        Ok(match commit {
            Some(commit) => RemoteOutcome::saved(path, commit.commit_sha, "Evaluation deleted"),
            None => RemoteOutcome::saved(path, None, "Evaluation was already absent"),
        })
    }

    async fn load_index(&self, login: &str) -> Result<Option<EvaluationIndex>, RemoteError> {
        let path = index_file_path(login)?;
        let Some(file) = self.contents.get_file(&path).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<EvaluationIndex>(&file.content) {
            Ok(mut index) => {
                if index.email.is_empty() {
                    index.email = normalize_email(login);
                }
                Ok(Some(index))
            }
            Err(err) => {
                warn!(path = %path, error = %err, "remote index is unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    async fn save_index(
        &self,
        login: &str,
        index: &EvaluationIndex,
    ) -> Result<RemoteOutcome, RemoteError> {
        let path = index_file_path(login)?;
        let mut index = index.clone();
        index.updated_at = Some(time::OffsetDateTime::now_utc());
        let body = serde_json::to_string_pretty(&index)?;
        let commit = self
            .create_or_update(&path, &body, "Update evaluation index")
            .await?;
        Ok(RemoteOutcome::saved(path, commit.commit_sha, "Index saved"))
    }

    async fn save_profile(&self, profile: &Profile) -> Result<RemoteOutcome, RemoteError> {
        let path = generate_user_file_name(&profile.rs_email)?;
        let body = serde_json::to_string_pretty(&profile.metadata_only())?;
        let commit = self
            .create_or_update(&path, &body, &format!("Update profile {}", profile.rs_name))
            .await?;
        Ok(RemoteOutcome::saved(path, commit.commit_sha, "Profile saved"))
    }

    async fn load_profile(&self, login: &str) -> Result<Option<Profile>, RemoteError> {
        let path = generate_user_file_name(login)?;
        let Some(file) = self.contents.get_file(&path).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&file.content)?))
    }

    async fn delete_profile(&self, login: &str) -> Result<RemoteOutcome, RemoteError> {
        let path = generate_user_file_name(login)?;
        let commit = self.delete_if_present(&path, "Delete profile").await?;
        Ok(RemoteOutcome::saved(
            path,
            commit.and_then(|c| c.commit_sha),
            "Profile deleted",
        ))
    }
}
