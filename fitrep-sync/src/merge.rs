//! Reconciliation of local and remote records, and migration of profiles that
//! still embed their evaluations.

use std::collections::HashMap;

use time::OffsetDateTime;
use tracing::info;

use crate::model::{Evaluation, EvaluationIndex, EvaluationIndexEntry, Profile};
use crate::remote::paths::evaluation_file_path;
use crate::remote::{RemoteError, RemoteStore};

/// Identity used to pair local and remote copies. Records without an id fall
/// back to a composite of subject, rank, occasion, period and timestamp.
pub fn evaluation_identity(evaluation: &Evaluation) -> String {
    if !evaluation.id.trim().is_empty() {
        return evaluation.id.clone();
    }
    let timestamp = evaluation
        .effective_timestamp()
        .map(|t| t.unix_timestamp().to_string())
        .unwrap_or_default();
    [
        evaluation.marine_info.name.trim(),
        evaluation.marine_info.rank.trim(),
        evaluation.occasion.trim(),
        evaluation.marine_info.evaluation_period.from.trim(),
        evaluation.marine_info.evaluation_period.to.trim(),
        timestamp.as_str(),
    ]
    .join("|")
}

/// Last-writer-wins merge keyed by [`evaluation_identity`]. Ties go to the
/// copy seen last, so remote beats local. Output keeps first-seen order, local records first.
pub fn merge_evaluations(local: Vec<Evaluation>, remote: Vec<Evaluation>) -> Vec<Evaluation> {
    let mut merged: Vec<Evaluation> = Vec::with_capacity(local.len() + remote.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for evaluation in local {
        let identity = evaluation_identity(&evaluation);
        match positions.get(&identity) {
            Some(&pos) => {
                if !newer(&merged[pos], &evaluation) {
                    merged[pos] = evaluation;
                }
            }
            None => {
                positions.insert(identity, merged.len());
                merged.push(evaluation);
            }
        }
    }

    for evaluation in remote {
        let identity = evaluation_identity(&evaluation);
        match positions.get(&identity) {
            Some(&pos) => {
                if !newer(&merged[pos], &evaluation) {
                    merged[pos] = evaluation;
                }
            }
            None => {
                positions.insert(identity, merged.len());
                merged.push(evaluation);
            }
        }
    }
    merged
}

fn newer(a: &Evaluation, b: &Evaluation) -> bool {
    a.effective_timestamp() > b.effective_timestamp()
}

/// Remote fields win where set; the evaluation count never goes down.
pub fn merge_profiles(local: Profile, remote: Profile, now: OffsetDateTime) -> Profile {
    fn pick(remote: String, local: String) -> String {
        if remote.trim().is_empty() { local } else { remote }
    }

    Profile {
        rs_name: pick(remote.rs_name, local.rs_name),
        rs_email: pick(remote.rs_email, local.rs_email),
        rs_rank: pick(remote.rs_rank, local.rs_rank),
        branch: pick(remote.branch, local.branch),
        created_date: remote.created_date.or(local.created_date),
        last_updated: Some(now),
        total_evaluations: remote.total_evaluations.max(local.total_evaluations),
        evaluations: if remote.evaluations.is_empty() {
            local.evaluations
        } else {
            remote.evaluations
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyMigration {
    pub profile: Profile,
    pub index: Option<EvaluationIndex>,
    pub migrated: usize,
}

/// Moves evaluations embedded in a profile into per-record files and an
/// index, then rewrites the profile as metadata only. Profiles without
/// embedded evaluations pass through untouched, so re-running is harmless.
pub async fn migrate_legacy_profile<R: RemoteStore>(
    remote: &R,
    profile: Profile,
) -> Result<LegacyMigration, RemoteError> {
    if !profile.is_legacy() {
        return Ok(LegacyMigration {
            profile,
            index: None,
            migrated: 0,
        });
    }

    let login = profile.rs_email.clone();
    let mut index = remote
        .load_index(&login)
        .await?
        .unwrap_or_else(|| EvaluationIndex::new(&login));

    for evaluation in &profile.evaluations {
        remote.save_evaluation(&login, evaluation).await?;
        let path = evaluation_file_path(&login, &evaluation.id)?;
        index.upsert(EvaluationIndexEntry::for_evaluation(evaluation, path));
    }
    remote.save_index(&login, &index).await?;

    let migrated = profile.evaluations.len();
    let mut metadata = profile.metadata_only();
    metadata.total_evaluations = metadata.total_evaluations.max(migrated as u32);
    remote.save_profile(&metadata).await?;

    info!(login = %login, migrated, "migrated embedded evaluations to per-record files");
    Ok(LegacyMigration {
        profile: metadata,
        index: Some(index),
        migrated,
    })
}
