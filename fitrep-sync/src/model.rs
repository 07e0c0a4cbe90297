//! FITREP domain records: evaluations, profiles, index entries, sessions and preferences.

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

/// Section holding the optional fourteenth trait.
pub const EVALUATOR_RESPONSIBILITIES_SECTION: &str = "Fulfillment of Evaluation Responsibilities";

const ID_SUFFIX_LEN: usize = 6;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl Grade {
    pub fn numeric(self) -> u8 {
        match self {
            Grade::A => 1,
            Grade::B => 2,
            Grade::C => 3,
            Grade::D => 4,
            Grade::E => 5,
            Grade::F => 6,
            Grade::G => 7,
        }
    }

    pub fn from_numeric(value: u8) -> Option<Self> {
        match value {
            1 => Some(Grade::A),
            2 => Some(Grade::B),
            3 => Some(Grade::C),
            4 => Some(Grade::D),
            5 => Some(Grade::E),
            6 => Some(Grade::F),
            7 => Some(Grade::G),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitScore {
    pub section: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub grade: Grade,
    pub grade_number: u8,
    #[serde(default)]
    pub justification: String,
}

impl TraitScore {
    pub fn new(
        section: impl Into<String>,
        trait_name: impl Into<String>,
        grade: Grade,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            section: section.into(),
            trait_name: trait_name.into(),
            grade,
            grade_number: grade.numeric(),
            justification: justification.into(),
        }
    }

    pub fn is_evaluator_responsibility(&self) -> bool {
        self.section == EVALUATOR_RESPONSIBILITIES_SECTION
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationPeriod {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarineInfo {
    pub name: String,
    #[serde(default)]
    pub rank: String,
    #[serde(default)]
    pub evaluation_period: EvaluationPeriod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingSenior {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub rank: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Empty for records written before ids were assigned.
    #[serde(rename = "evaluationId", default)]
    pub id: String,
    #[serde(default)]
    pub occasion: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub marine_info: MarineInfo,
    pub rs_info: ReportingSenior,
    #[serde(default)]
    pub trait_evaluations: Vec<TraitScore>,
    #[serde(default)]
    pub fitrep_average: Option<String>,
    #[serde(default)]
    pub section_i_comments: String,
    #[serde(default)]
    pub directed_comments: String,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl Evaluation {
    pub fn new(id: impl Into<String>, marine_info: MarineInfo, rs_info: ReportingSenior) -> Self {
        Self {
            id: id.into(),
            occasion: String::new(),
            completed_date: None,
            last_updated: None,
            marine_info,
            rs_info,
            trait_evaluations: Vec::new(),
            fitrep_average: None,
            section_i_comments: String::new(),
            directed_comments: String::new(),
            sync_status: SyncStatus::Pending,
        }
    }

    /// The timestamp merges compare: last update, else completion.
    pub fn effective_timestamp(&self) -> Option<OffsetDateTime> {
        self.last_updated.or(self.completed_date)
    }

    pub fn recompute_average(&mut self) -> Option<&str> {
        self.fitrep_average = fitrep_average(&self.trait_evaluations).map(format_average);
        self.fitrep_average.as_deref()
    }

    /// Numeric grades must mirror their letter grades.
    pub fn grades_consistent(&self) -> bool {
        self.trait_evaluations
            .iter()
            .all(|score| score.grade_number == score.grade.numeric())
    }

    pub fn has_evaluator_responsibilities(&self) -> bool {
        self.trait_evaluations
            .iter()
            .any(TraitScore::is_evaluator_responsibility)
    }
}

/// Mean numeric grade over all scored traits (13, or 14 with evaluator responsibilities).
pub fn fitrep_average(traits: &[TraitScore]) -> Option<f64> {
    if traits.is_empty() {
        return None;
    }
    let total: u32 = traits
        .iter()
        .map(|score| u32::from(score.grade.numeric()))
        .sum();
    Some(f64::from(total) / traits.len() as f64)
}

pub fn format_average(value: f64) -> String {
    format!("{value:.2}")
}

/// Builds `eval-<date>-<rank>-<name>-<suffix>` with a random base36 suffix.
pub fn generate_evaluation_id(date: Date, rank: &str, name: &str) -> String {
    let mut rng = rand::thread_rng();
    generate_evaluation_id_with_rng(date, rank, name, &mut rng)
}

pub fn generate_evaluation_id_with_rng<R: Rng + ?Sized>(
    date: Date,
    rank: &str,
    name: &str,
    rng: &mut R,
) -> String {
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect();
    let mut parts = vec![
        "eval".to_string(),
        format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        ),
    ];
    parts.extend([slug(rank), slug(name)].into_iter().filter(|s| !s.is_empty()));
    parts.push(suffix);
    parts.join("-")
}

fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Namespace for one reporting senior's local state, derived from name and login.
pub fn profile_key(name: &str, login: &str) -> String {
    let name = name
        .trim()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    format!("{}__{}", name, normalize_email(login))
}

pub fn evaluation_key(email: &str, evaluation_id: &str) -> String {
    format!("{}|{}", normalize_email(email), evaluation_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub rs_name: String,
    pub rs_email: String,
    #[serde(default)]
    pub rs_rank: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    #[serde(default)]
    pub total_evaluations: u32,
    /// Older profile files embed every evaluation here; migrated records leave it empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluations: Vec<Evaluation>,
}

impl Profile {
    pub fn new(name: &str, email: &str, rank: &str, now: OffsetDateTime) -> Self {
        Self {
            rs_name: name.trim().to_string(),
            rs_email: normalize_email(email),
            rs_rank: rank.trim().to_string(),
            branch: "USMC".to_string(),
            created_date: Some(now),
            last_updated: Some(now),
            total_evaluations: 0,
            evaluations: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        normalize_email(&self.rs_email)
    }

    pub fn profile_key(&self) -> String {
        profile_key(&self.rs_name, &self.rs_email)
    }

    pub fn is_legacy(&self) -> bool {
        !self.evaluations.is_empty()
    }

    pub fn metadata_only(&self) -> Self {
        Self {
            evaluations: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationIndexEntry {
    pub id: String,
    #[serde(default)]
    pub marine_name: String,
    #[serde(default)]
    pub marine_rank: String,
    #[serde(default)]
    pub occasion: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub fitrep_average: Option<String>,
    pub file_path: String,
}

impl EvaluationIndexEntry {
    pub fn for_evaluation(evaluation: &Evaluation, file_path: impl Into<String>) -> Self {
        Self {
            id: evaluation.id.clone(),
            marine_name: evaluation.marine_info.name.clone(),
            marine_rank: evaluation.marine_info.rank.clone(),
            occasion: evaluation.occasion.clone(),
            completed_date: evaluation.completed_date,
            fitrep_average: evaluation.fitrep_average.clone(),
            file_path: file_path.into(),
        }
    }
}

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationIndex {
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_index_version")]
    pub version: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub entries: Vec<EvaluationIndexEntry>,
}

fn default_index_version() -> u32 {
    INDEX_VERSION
}

impl EvaluationIndex {
    pub fn new(email: &str) -> Self {
        Self {
            email: normalize_email(email),
            version: INDEX_VERSION,
            updated_at: None,
            entries: Vec::new(),
        }
    }

    /// One entry per evaluation id; later duplicates replace earlier ones.
    pub fn from_evaluations<F>(email: &str, evaluations: &[Evaluation], file_path: F) -> Self
    where
        F: Fn(&Evaluation) -> String,
    {
        let mut index = Self::new(email);
        for evaluation in evaluations {
            index.upsert(EvaluationIndexEntry::for_evaluation(
                evaluation,
                file_path(evaluation),
            ));
        }
        index
    }

    /// Replaces the entry with the same id in place, or appends it.
    pub fn upsert(&mut self, entry: EvaluationIndexEntry) {
        match self.entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, evaluation_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != evaluation_id);
        self.entries.len() != before
    }

    pub fn get(&self, evaluation_id: &str) -> Option<&EvaluationIndexEntry> {
        self.entries.iter().find(|entry| entry.id == evaluation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub profile_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl Session {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub email: String,
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

fn default_auto_sync() -> bool {
    true
}

impl Preferences {
    pub fn new(email: &str) -> Self {
        Self {
            email: normalize_email(email),
            auto_sync: true,
            theme: None,
            updated_at: None,
        }
    }
}
