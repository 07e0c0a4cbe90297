use std::collections::HashMap;
use std::sync::Mutex;

use fitrep_core::{ProxyError, StatusCode};

use super::paths::{
    evaluation_file_path, generate_user_file_name, index_file_path, user_evaluations_dir,
};
use super::{RemoteError, RemoteOutcome, RemoteStore};
use crate::model::{Evaluation, EvaluationIndex, EvaluationIndexEntry, Profile, SyncStatus};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    /// Fails this many times with a 503, then succeeds.
    Transient(u32),
    /// Always refused with a 403.
    Forbidden,
}

/// Profiles are keyed by profile file path, evaluations and indexes by the
/// user's evaluations directory, so logins sharing a path share records.
#[derive(Default)]
struct State {
    profiles: HashMap<String, Profile>,
    evaluations: HashMap<String, Vec<Evaluation>>,
    indexes: HashMap<String, EvaluationIndex>,
    failures: HashMap<String, Failure>,
    save_calls: HashMap<String, u32>,
}

/// In-process remote used by tests.
#[derive(Default)]
pub(crate) struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub(crate) fn fail(&self, evaluation_id: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(evaluation_id.to_string(), failure);
    }

    pub(crate) fn insert_profile(&self, profile: Profile) {
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(generate_user_file_name(&profile.rs_email).unwrap(), profile);
    }

    pub(crate) fn insert_evaluation(&self, login: &str, evaluation: Evaluation) {
        let mut state = self.state.lock().unwrap();
        let list = state
            .evaluations
            .entry(user_evaluations_dir(login).unwrap())
            .or_default();
        list.retain(|e| e.id != evaluation.id);
        list.push(evaluation);
    }

    pub(crate) fn profile(&self, login: &str) -> Option<Profile> {
        self.state
            .lock()
            .unwrap()
            .profiles
            .get(&generate_user_file_name(login).unwrap())
            .cloned()
    }

    pub(crate) fn evaluations(&self, login: &str) -> Vec<Evaluation> {
        self.state
            .lock()
            .unwrap()
            .evaluations
            .get(&user_evaluations_dir(login).unwrap())
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn index(&self, login: &str) -> Option<EvaluationIndex> {
        self.state
            .lock()
            .unwrap()
            .indexes
            .get(&user_evaluations_dir(login).unwrap())
            .cloned()
    }

    pub(crate) fn save_calls(&self, evaluation_id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .save_calls
            .get(evaluation_id)
            .copied()
            .unwrap_or(0)
    }
}

fn injected(status: StatusCode) -> RemoteError {
    RemoteError::Proxy(ProxyError::Api {
        status,
        body: "injected failure".into(),
    })
}

impl RemoteStore for MemoryRemote {
    async fn save_evaluation(
        &self,
        login: &str,
        evaluation: &Evaluation,
    ) -> Result<RemoteOutcome, RemoteError> {
        let mut state = self.state.lock().unwrap();
        *state.save_calls.entry(evaluation.id.clone()).or_default() += 1;
        match state.failures.get(&evaluation.id).copied() {
            Some(Failure::Forbidden) => return Err(injected(StatusCode::FORBIDDEN)),
            Some(Failure::Transient(remaining)) if remaining > 0 => {
                state
                    .failures
                    .insert(evaluation.id.clone(), Failure::Transient(remaining - 1));
                return Err(injected(StatusCode::SERVICE_UNAVAILABLE));
            }
            _ => {}
        }

        let key = user_evaluations_dir(login)?;
        let path = evaluation_file_path(login, &evaluation.id)?;
        let mut stored = evaluation.clone();
        stored.sync_status = SyncStatus::Synced;
        let list = state.evaluations.entry(key.clone()).or_default();
        list.retain(|e| e.id != stored.id);
        list.push(stored);
        state
            .indexes
            .entry(key)
            .or_insert_with(|| EvaluationIndex::new(login))
            .upsert(EvaluationIndexEntry::for_evaluation(evaluation, path.clone()));
        Ok(RemoteOutcome::saved(path, None, "Evaluation saved"))
    }

    async fn load_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<Option<Evaluation>, RemoteError> {
        let key = user_evaluations_dir(login)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .evaluations
            .get(&key)
            .and_then(|list| list.iter().find(|e| e.id == evaluation_id).cloned()))
    }

    async fn list_evaluations(&self, login: &str) -> Result<Vec<Evaluation>, RemoteError> {
        let key = user_evaluations_dir(login)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .evaluations
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_evaluation(
        &self,
        login: &str,
        evaluation_id: &str,
    ) -> Result<RemoteOutcome, RemoteError> {
        let key = user_evaluations_dir(login)?;
        let path = evaluation_file_path(login, evaluation_id)?;
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.evaluations.get_mut(&key) {
            list.retain(|e| e.id != evaluation_id);
        }
        if let Some(index) = state.indexes.get_mut(&key) {
            index.remove(evaluation_id);
        }
        Ok(RemoteOutcome::saved(path, None, "Evaluation deleted"))
    }

    async fn load_index(&self, login: &str) -> Result<Option<EvaluationIndex>, RemoteError> {
        let key = user_evaluations_dir(login)?;
        Ok(self.state.lock().unwrap().indexes.get(&key).cloned())
    }

    async fn save_index(
        &self,
        login: &str,
        index: &EvaluationIndex,
    ) -> Result<RemoteOutcome, RemoteError> {
        let key = user_evaluations_dir(login)?;
        let path = index_file_path(login)?;
        self.state.lock().unwrap().indexes.insert(key, index.clone());
        Ok(RemoteOutcome::saved(path, None, "Index saved"))
    }

    async fn save_profile(&self, profile: &Profile) -> Result<RemoteOutcome, RemoteError> {
        let path = generate_user_file_name(&profile.rs_email)?;
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(path.clone(), profile.metadata_only());
        Ok(RemoteOutcome::saved(path, None, "Profile saved"))
    }

    async fn load_profile(&self, login: &str) -> Result<Option<Profile>, RemoteError> {
        let path = generate_user_file_name(login)?;
        Ok(self.state.lock().unwrap().profiles.get(&path).cloned())
    }

    async fn delete_profile(&self, login: &str) -> Result<RemoteOutcome, RemoteError> {
        let path = generate_user_file_name(login)?;
        self.state.lock().unwrap().profiles.remove(&path);
        Ok(RemoteOutcome::saved(path, None, "Profile deleted"))
    }
}
