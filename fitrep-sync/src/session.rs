//! The per-user workspace: login reconciliation, local-first writes and
//! pushing pending work to the remote.

use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::entities::{EntityError, EntityStorage};
use crate::merge::{merge_evaluations, merge_profiles, migrate_legacy_profile};
use crate::model::{
    Evaluation, EvaluationIndex, EvaluationIndexEntry, Profile, Session, SyncStatus,
    generate_evaluation_id, normalize_email,
};
use crate::remote::paths::{evaluation_file_path, generate_user_file_name};
use crate::remote::{RemoteError, RemoteStore};
use crate::sync::{SyncError, SyncOrchestrator, SyncPolicy, SyncReport};

pub const SESSION_TTL: Duration = Duration::hours(24);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("login email is empty")]
    MissingEmail,
    #[error("remote sync is unavailable while offline")]
    Offline,
    #[error("evaluation `{0}` not found")]
    UnknownEvaluation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginIdentity {
    pub name: String,
    pub email: String,
    pub rank: String,
}

/// State of one logged-in reporting senior.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: Session,
    profile: Profile,
    evaluations: Vec<Evaluation>,
}

impl SessionContext {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn email(&self) -> &str {
        &self.profile.rs_email
    }

    pub fn evaluations(&self) -> &[Evaluation] {
        &self.evaluations
    }

    pub fn evaluation(&self, id: &str) -> Option<&Evaluation> {
        self.evaluations.iter().find(|e| e.id == id)
    }

    pub fn pending_count(&self) -> usize {
        self.evaluations
            .iter()
            .filter(|e| e.sync_status != SyncStatus::Synced)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    pub evaluation_id: String,
    pub synced: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub removed_locally: bool,
    pub removed_remotely: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub rank: Option<String>,
    pub branch: Option<String>,
}

pub struct Workspace<R> {
    storage: EntityStorage,
    remote: Option<R>,
    online: bool,
    policy: SyncPolicy,
}

impl<R: RemoteStore> Workspace<R> {
    pub fn new(storage: EntityStorage, remote: Option<R>, online: bool, policy: SyncPolicy) -> Self {
        Self {
            storage,
            remote,
            online,
            policy,
        }
    }

    pub fn storage(&self) -> &EntityStorage {
        &self.storage
    }

    pub fn is_online(&self) -> bool {
        self.online && self.remote.is_some()
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    fn reachable_remote(&self) -> Option<&R> {
        if self.online { self.remote.as_ref() } else { None }
    }

    /// Opens a session: local state first, then remote reconciliation when
    /// reachable. A failing remote leaves the user working offline.
    pub async fn login(&self, identity: &LoginIdentity) -> Result<SessionContext, SessionError> {
        let email = normalize_email(&identity.email);
        if email.is_empty() {
            return Err(SessionError::MissingEmail);
        }
        let now = OffsetDateTime::now_utc();

        let local_profile = match self.storage.profiles.get_by_email(&email).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(email = %email, error = %err, "local profile unreadable, starting fresh");
                None
            }
        };
        let mut profile = local_profile
            .unwrap_or_else(|| Profile::new(&identity.name, &email, &identity.rank, now));
        let mut evaluations = self.storage.evaluations.get_all_for_user(&email).await?;

        if let Some(remote) = self.reachable_remote() {
            match reconcile(remote, &profile, &evaluations, now).await {
                Ok((merged_profile, merged)) => {
                    profile = merged_profile;
                    evaluations = merged;
                }
                Err(err) => {
                    warn!(email = %email, error = %err, "remote unavailable, continuing offline");
                }
            }
        }

        for evaluation in &mut evaluations {
            evaluation.rs_info.email = email.clone();
        }
        profile.total_evaluations = profile.total_evaluations.max(evaluations.len() as u32);

        self.storage.profiles.save(&profile).await?;
        self.storage.evaluations.save_all(&evaluations).await?;
        self.storage
            .indexes
            .save(&local_index(&email, &evaluations))
            .await?;

        let cleared = self.storage.sessions.clear_expired(now).await?;
        let session = Session {
            id: session_id(),
            email: email.clone(),
            profile_key: profile.profile_key(),
            created_at: now,
            expires_at: now + SESSION_TTL,
        };
        self.storage.sessions.save(&session).await?;

        info!(
            email = %email,
            evaluations = evaluations.len(),
            expired_sessions = cleared,
            "session opened"
        );
        Ok(SessionContext {
            session,
            profile,
            evaluations,
        })
    }

    /// Saves locally as pending, then pushes when online. A failed push keeps
    /// the record pending for the next sync.
    pub async fn save_evaluation(
        &self,
        ctx: &mut SessionContext,
        mut evaluation: Evaluation,
    ) -> Result<SaveResult, SessionError> {
        let now = OffsetDateTime::now_utc();
        let email = ctx.email().to_string();
        if evaluation.id.trim().is_empty() {
            evaluation.id = generate_evaluation_id(
                now.date(),
                &evaluation.marine_info.rank,
                &evaluation.marine_info.name,
            );
        }
        evaluation.rs_info.email = email.clone();
        if evaluation.rs_info.name.is_empty() {
            evaluation.rs_info.name = ctx.profile.rs_name.clone();
        }
        if evaluation.rs_info.rank.is_empty() {
            evaluation.rs_info.rank = ctx.profile.rs_rank.clone();
        }
        evaluation.recompute_average();
        evaluation.completed_date.get_or_insert(now);
        evaluation.last_updated = Some(now);
        evaluation.sync_status = SyncStatus::Pending;

        self.storage.evaluations.save(&evaluation).await?;
        upsert_in_place(&mut ctx.evaluations, evaluation.clone());
        self.refresh_local_index(&email, &ctx.evaluations).await?;

        let Some(remote) = self.reachable_remote() else {
            return Ok(SaveResult {
                evaluation_id: evaluation.id,
                synced: false,
                message: "Saved locally; will sync when online".to_string(),
            });
        };

        match remote.save_evaluation(&email, &evaluation).await {
            Ok(outcome) if outcome.success => {
                evaluation.sync_status = SyncStatus::Synced;
                self.storage.evaluations.save(&evaluation).await?;
                let id = evaluation.id.clone();
                upsert_in_place(&mut ctx.evaluations, evaluation);
                Ok(SaveResult {
                    evaluation_id: id,
                    synced: true,
                    message: outcome.message,
                })
            }
            Ok(outcome) => Ok(SaveResult {
                evaluation_id: evaluation.id,
                synced: false,
                message: outcome.message,
            }),
            Err(err) => {
                warn!(id = %evaluation.id, error = %err, "remote save failed, kept pending");
                Ok(SaveResult {
                    evaluation_id: evaluation.id,
                    synced: false,
                    message: format!("Saved locally; remote save failed: {err}"),
                })
            }
        }
    }

    pub async fn delete_evaluation(
        &self,
        ctx: &mut SessionContext,
        evaluation_id: &str,
    ) -> Result<DeleteResult, SessionError> {
        let email = ctx.email().to_string();
        let before = ctx.evaluations.len();
        ctx.evaluations.retain(|e| e.id != evaluation_id);
        let removed_from_memory = ctx.evaluations.len() != before;
        let removed_locally = self
            .storage
            .evaluations
            .delete_for_user(&email, evaluation_id)
            .await?
            || removed_from_memory;
        if !removed_locally {
            return Err(SessionError::UnknownEvaluation(evaluation_id.to_string()));
        }
        self.refresh_local_index(&email, &ctx.evaluations).await?;

        let Some(remote) = self.reachable_remote() else {
            return Ok(DeleteResult {
                removed_locally,
                removed_remotely: false,
                message: "Deleted locally; remote copy remains until next online delete".into(),
            });
        };
        match remote.delete_evaluation(&email, evaluation_id).await {
            Ok(outcome) => Ok(DeleteResult {
                removed_locally,
                removed_remotely: outcome.success,
                message: outcome.message,
            }),
            Err(err) => {
                warn!(id = evaluation_id, error = %err, "remote delete failed");
                Ok(DeleteResult {
                    removed_locally,
                    removed_remotely: false,
                    message: format!("Deleted locally; remote delete failed: {err}"),
                })
            }
        }
    }

    /// Applies profile edits. A new email re-keys every local record and, when
    /// online, writes the remote profile under the new login before removing
    /// the old one. Evaluations are marked pending so the next sync moves them.
    pub async fn update_profile(
        &self,
        ctx: &mut SessionContext,
        update: ProfileUpdate,
    ) -> Result<Profile, SessionError> {
        let now = OffsetDateTime::now_utc();
        let old_email = ctx.email().to_string();
        let mut profile = ctx.profile.clone();
        if let Some(name) = update.name {
            profile.rs_name = name.trim().to_string();
        }
        if let Some(rank) = update.rank {
            profile.rs_rank = rank.trim().to_string();
        }
        if let Some(branch) = update.branch {
            profile.branch = branch.trim().to_string();
        }
        let new_email = update
            .email
            .map(|email| normalize_email(&email))
            .filter(|email| !email.is_empty() && *email != old_email);
        if let Some(email) = &new_email {
            profile.rs_email = email.clone();
        }
        profile.last_updated = Some(now);

        if let Some(email) = &new_email {
            for evaluation in &mut ctx.evaluations {
                evaluation.rs_info.email = email.clone();
                evaluation.sync_status = SyncStatus::Pending;
            }
            self.storage.evaluations.save_all(&ctx.evaluations).await?;
            self.storage.evaluations.delete_all_for_user(&old_email).await?;
            self.storage.profiles.delete(&old_email).await?;
            self.storage.indexes.delete(&old_email).await?;
            self.refresh_local_index(email, &ctx.evaluations).await?;
        }
        self.storage.profiles.save(&profile).await?;

        ctx.session.profile_key = profile.profile_key();
        ctx.session.email = profile.rs_email.clone();
        self.storage.sessions.save(&ctx.session).await?;

        if let Some(remote) = self.reachable_remote() {
            let pushed = match remote.save_profile(&profile).await {
                Ok(_) => match &new_email {
                    Some(email) if !shares_profile_file(&old_email, email) => {
                        remote.delete_profile(&old_email).await.map(|_| ())
                    }
                    _ => Ok(()),
                },
                Err(err) => Err(err),
            };
            if let Err(err) = pushed {
                warn!(error = %err, "remote profile update failed");
            }
        }

        ctx.profile = profile.clone();
        info!(email = %profile.rs_email, renamed = new_email.is_some(), "profile updated");
        Ok(profile)
    }

    /// Pushes every record not yet synced.
    pub async fn sync_pending(
        &self,
        ctx: &mut SessionContext,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SessionError> {
        let remote = self.reachable_remote().ok_or(SessionError::Offline)?;
        let email = ctx.email().to_string();
        let report = SyncOrchestrator::new(remote, &self.storage.evaluations, self.policy)
            .sync_all(&email, &mut ctx.evaluations, cancel)
            .await?;
        Ok(report)
    }

    /// Ends the session and drops it from the store.
    pub async fn logout(&self, ctx: SessionContext) -> Result<(), SessionError> {
        self.storage.sessions.delete(&ctx.session.id).await?;
        info!(email = %ctx.profile.rs_email, "session closed");
        Ok(())
    }

    async fn refresh_local_index(
        &self,
        email: &str,
        evaluations: &[Evaluation],
    ) -> Result<(), SessionError> {
        self.storage
            .indexes
            .save(&local_index(email, evaluations))
            .await?;
        Ok(())
    }
}

async fn reconcile<R: RemoteStore>(
    remote: &R,
    local_profile: &Profile,
    local_evaluations: &[Evaluation],
    now: OffsetDateTime,
) -> Result<(Profile, Vec<Evaluation>), RemoteError> {
    let email = local_profile.rs_email.clone();
    let profile = match remote.load_profile(&email).await? {
        Some(remote_profile) => {
            let migration = migrate_legacy_profile(remote, remote_profile).await?;
            merge_profiles(local_profile.clone(), migration.profile, now)
        }
        None => {
            remote.save_profile(local_profile).await?;
            local_profile.clone()
        }
    };

    let remote_evaluations = remote.list_evaluations(&email).await?;
    if remote.load_index(&email).await?.is_none() && !remote_evaluations.is_empty() {
        let index = remote_index(&email, &remote_evaluations)?;
        if let Err(err) = remote.save_index(&email, &index).await {
            warn!(email = %email, error = %err, "could not rebuild remote index");
        }
    }

    let merged = merge_evaluations(local_evaluations.to_vec(), remote_evaluations);
    Ok((profile, merged))
}

fn remote_index(email: &str, evaluations: &[Evaluation]) -> Result<EvaluationIndex, RemoteError> {
    let mut index = EvaluationIndex::new(email);
    for evaluation in evaluations {
        let path = evaluation_file_path(email, &evaluation.id)?;
        index.upsert(EvaluationIndexEntry::for_evaluation(evaluation, path));
    }
    Ok(index)
}

/// Local mirror of the index. Paths are best effort: ids that cannot form a
/// path keep an empty one.
fn local_index(email: &str, evaluations: &[Evaluation]) -> EvaluationIndex {
    let mut index = EvaluationIndex::from_evaluations(email, evaluations, |evaluation| {
        evaluation_file_path(email, &evaluation.id).unwrap_or_default()
    });
    index.updated_at = Some(OffsetDateTime::now_utc());
    index
}

/// Logins that differ only after the `@` resolve to the same remote profile.
fn shares_profile_file(old_email: &str, new_email: &str) -> bool {
    matches!(
        (generate_user_file_name(old_email), generate_user_file_name(new_email)),
        (Ok(old), Ok(new)) if old == new
    )
}

fn upsert_in_place(list: &mut Vec<Evaluation>, evaluation: Evaluation) {
    match list.iter_mut().find(|e| e.id == evaluation.id) {
        Some(existing) => *existing = evaluation,
        None => list.push(evaluation),
    }
}

fn session_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("session-{suffix}")
}
