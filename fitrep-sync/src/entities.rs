//! Typed entity access over [`LocalStore`]. Every record is wrapped with the
//! integrity codec on write and checked (and repaired if asked) on read.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::codec::{
    self, CODEC_VERSION, CodecError, RepairOptions, Schema, UnwrapOptions, ValueKind, WrapOptions,
    validate_schema,
};
use crate::merge::evaluation_identity;
use crate::model::{
    Evaluation, EvaluationIndex, Preferences, Profile, Session, SyncStatus, evaluation_key,
    normalize_email,
};
use crate::store::{IndexName, KEY_FIELD, LocalStore, StoreError, StoreName};

#[derive(Debug, Error)]
pub enum EntityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{entity} `{key}` failed integrity checks: {reason}")]
    Invalid {
        entity: &'static str,
        key: String,
        reason: String,
    },
    #[error("{entity} `{key}` is corrupted beyond repair: {reason}")]
    Corrupted {
        entity: &'static str,
        key: String,
        reason: String,
    },
}

/// A record type persisted through the codec.
pub trait Entity: Serialize + DeserializeOwned {
    const TYPE: &'static str;
    const STORE: StoreName;

    fn storage_key(&self) -> String;

    fn email(&self) -> Option<String> {
        None
    }

    fn sync_status(&self) -> Option<SyncStatus> {
        None
    }

    fn schema() -> &'static Schema;

    fn repair_defaults() -> Map<String, Value> {
        Map::new()
    }
}

impl Entity for Profile {
    const TYPE: &'static str = "profile";
    const STORE: StoreName = StoreName::Profiles;

    fn storage_key(&self) -> String {
        self.key()
    }

    fn email(&self) -> Option<String> {
        Some(normalize_email(&self.rs_email))
    }

    fn schema() -> &'static Schema {
        const SCHEMA: Schema = Schema {
            kind: ValueKind::Object,
            required: &["rsName", "rsEmail"],
            fields: &[
                ("rsRank", ValueKind::String),
                ("branch", ValueKind::String),
                ("totalEvaluations", ValueKind::Number),
                ("evaluations", ValueKind::Array),
            ],
        };
        &SCHEMA
    }

    fn repair_defaults() -> Map<String, Value> {
        defaults(json!({"rsRank": "", "branch": "USMC", "totalEvaluations": 0}))
    }
}

impl Entity for Evaluation {
    const TYPE: &'static str = "evaluation";
    const STORE: StoreName = StoreName::Evaluations;

    fn storage_key(&self) -> String {
        evaluation_key(&self.rs_info.email, &evaluation_identity(self))
    }

    fn email(&self) -> Option<String> {
        Some(normalize_email(&self.rs_info.email))
    }

    fn sync_status(&self) -> Option<SyncStatus> {
        Some(self.sync_status)
    }

    fn schema() -> &'static Schema {
        const SCHEMA: Schema = Schema {
            kind: ValueKind::Object,
            required: &["marineInfo", "rsInfo"],
            fields: &[
                ("evaluationId", ValueKind::String),
                ("marineInfo", ValueKind::Object),
                ("rsInfo", ValueKind::Object),
                ("occasion", ValueKind::String),
                ("traitEvaluations", ValueKind::Array),
                ("fitrepAverage", ValueKind::String),
                ("syncStatus", ValueKind::String),
            ],
        };
        &SCHEMA
    }

    fn repair_defaults() -> Map<String, Value> {
        defaults(json!({
            "evaluationId": "",
            "occasion": "",
            "traitEvaluations": [],
            "sectionIComments": "",
            "directedComments": "",
            "syncStatus": "pending"
        }))
    }
}

impl Entity for EvaluationIndex {
    const TYPE: &'static str = "evaluationIndex";
    const STORE: StoreName = StoreName::EvaluationIndexes;

    fn storage_key(&self) -> String {
        normalize_email(&self.email)
    }

    fn email(&self) -> Option<String> {
        Some(normalize_email(&self.email))
    }

    fn schema() -> &'static Schema {
        const SCHEMA: Schema = Schema {
            kind: ValueKind::Object,
            required: &["email"],
            fields: &[("entries", ValueKind::Array), ("version", ValueKind::Number)],
        };
        &SCHEMA
    }

    fn repair_defaults() -> Map<String, Value> {
        defaults(json!({"entries": [], "version": crate::model::INDEX_VERSION}))
    }
}

impl Entity for Session {
    const TYPE: &'static str = "session";
    const STORE: StoreName = StoreName::Sessions;

    fn storage_key(&self) -> String {
        self.id.clone()
    }

    fn email(&self) -> Option<String> {
        Some(normalize_email(&self.email))
    }

    fn schema() -> &'static Schema {
        const SCHEMA: Schema = Schema {
            kind: ValueKind::Object,
            required: &["id", "email", "createdAt", "expiresAt"],
            fields: &[("profileKey", ValueKind::String)],
        };
        &SCHEMA
    }

    fn repair_defaults() -> Map<String, Value> {
        defaults(json!({"profileKey": ""}))
    }
}

impl Entity for Preferences {
    const TYPE: &'static str = "preferences";
    const STORE: StoreName = StoreName::Preferences;

    fn storage_key(&self) -> String {
        normalize_email(&self.email)
    }

    fn email(&self) -> Option<String> {
        Some(normalize_email(&self.email))
    }

    fn schema() -> &'static Schema {
        const SCHEMA: Schema = Schema {
            kind: ValueKind::Object,
            required: &["email"],
            fields: &[("autoSync", ValueKind::Boolean), ("theme", ValueKind::String)],
        };
        &SCHEMA
    }

    fn repair_defaults() -> Map<String, Value> {
        defaults(json!({"autoSync": true}))
    }
}

fn defaults(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub attempt_repair: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            attempt_repair: true,
        }
    }
}

impl LoadOptions {
    pub fn strict() -> Self {
        Self {
            attempt_repair: false,
        }
    }
}

fn encode_row<E: Entity>(entity: &E) -> Result<Value, EntityError> {
    let record = codec::wrap(entity, WrapOptions::new(E::TYPE))?;
    let mut row = Map::new();
    row.insert(KEY_FIELD.into(), Value::String(entity.storage_key()));
    row.insert("type".into(), Value::String(E::TYPE.into()));
    if let Some(email) = entity.email() {
        row.insert(IndexName::Email.field().into(), Value::String(email));
    }
    if let Some(status) = entity.sync_status() {
        row.insert(
            IndexName::SyncStatus.field().into(),
            Value::String(status.as_str().into()),
        );
    }
    row.insert(
        "record".into(),
        serde_json::to_value(record).map_err(CodecError::from)?,
    );
    Ok(Value::Object(row))
}

/// Turns a stored row back into an entity. Rows written before the codec
/// existed (no `record` envelope) go straight to repair.
fn decode_row<E: Entity>(key: &str, row: &Value, options: LoadOptions) -> Result<E, EntityError> {
    let envelope = row.get("record").unwrap_or(row);
    let validator = |data: &Value| validate_schema(data, E::schema());
    let unwrapped = codec::unwrap_value(
        envelope,
        &UnwrapOptions {
            max_version: Some(CODEC_VERSION),
            validator: Some(&validator),
        },
    );

    let reason = match (unwrapped.valid, unwrapped.error) {
        (true, _) => match serde_json::from_value::<E>(unwrapped.data.clone()) {
            Ok(entity) => return Ok(entity),
            Err(err) => err.to_string(),
        },
        (false, Some(issue)) => issue.to_string(),
        (false, None) => "record failed integrity checks".to_string(),
    };
    warn!(entity = E::TYPE, key, reason = %reason, "stored record failed integrity checks");

    if !options.attempt_repair {
        return Err(EntityError::Invalid {
            entity: E::TYPE,
            key: key.to_string(),
            reason,
        });
    }

    let defaults = E::repair_defaults();
    let repaired = codec::repair(
        &unwrapped.data,
        &RepairOptions {
            remove_nulls: true,
            defaults: Some(&defaults),
        },
    );
    let check = validate_schema(&repaired.data, E::schema());
    if !repaired.success || !check.valid {
        return Err(EntityError::Corrupted {
            entity: E::TYPE,
            key: key.to_string(),
            reason: check.error.unwrap_or(reason),
        });
    }
    let entity = serde_json::from_value::<E>(repaired.data).map_err(|err| EntityError::Corrupted {
        entity: E::TYPE,
        key: key.to_string(),
        reason: err.to_string(),
    })?;
    let repairs: Vec<String> = repaired.repairs.iter().map(ToString::to_string).collect();
    info!(entity = E::TYPE, key, ?repairs, "repaired stored record");
    Ok(entity)
}

fn row_key(row: &Value) -> &str {
    row.get(KEY_FIELD).and_then(Value::as_str).unwrap_or_default()
}

pub struct EntityStore<E> {
    store: LocalStore,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _entity: PhantomData,
        }
    }
}

pub type ProfileStore = EntityStore<Profile>;
pub type EvaluationStore = EntityStore<Evaluation>;
pub type IndexStore = EntityStore<EvaluationIndex>;
pub type SessionStore = EntityStore<Session>;
pub type PreferencesStore = EntityStore<Preferences>;

impl<E: Entity> EntityStore<E> {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    pub async fn save(&self, entity: &E) -> Result<String, EntityError> {
        let row = encode_row(entity)?;
        Ok(self.store.put(E::STORE, &row).await?)
    }

    pub async fn load(&self, key: &str, options: LoadOptions) -> Result<Option<E>, EntityError> {
        let Some(row) = self.store.get(E::STORE, key).await? else {
            return Ok(None);
        };
        decode_row(key, &row, options).map(Some)
    }

    pub async fn delete(&self, key: &str) -> Result<bool, EntityError> {
        Ok(self.store.delete(E::STORE, key).await?)
    }

    /// Loads every record, repairing where possible. Records that cannot be
    /// recovered are skipped.
    pub async fn get_all(&self) -> Result<Vec<E>, EntityError> {
        let rows = self.store.get_all(E::STORE).await?;
        Ok(decode_rows(&rows))
    }

    pub async fn get_all_by_email(&self, email: &str) -> Result<Vec<E>, EntityError> {
        let rows = self
            .store
            .query_by_index(E::STORE, IndexName::Email, &normalize_email(email))
            .await?;
        Ok(decode_rows(&rows))
    }

    /// Writes every entity in one atomic batch.
    pub async fn save_all(&self, entities: &[E]) -> Result<(), EntityError> {
        let rows = entities
            .iter()
            .map(encode_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.store.put_many(E::STORE, &rows).await?)
    }
}

fn decode_rows<E: Entity>(rows: &[Value]) -> Vec<E> {
    rows.iter()
        .filter_map(|row| {
            let key = row_key(row);
            match decode_row(key, row, LoadOptions::default()) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    warn!(entity = E::TYPE, key, error = %err, "skipping unrecoverable record");
                    None
                }
            }
        })
        .collect()
}

impl EntityStore<Profile> {
    pub async fn get_by_email(&self, email: &str) -> Result<Option<Profile>, EntityError> {
        self.load(&normalize_email(email), LoadOptions::default())
            .await
    }
}

impl EntityStore<Evaluation> {
    pub async fn get_all_for_user(&self, email: &str) -> Result<Vec<Evaluation>, EntityError> {
        self.get_all_by_email(email).await
    }

    pub async fn get_pending_sync(&self, email: &str) -> Result<Vec<Evaluation>, EntityError> {
        let email = normalize_email(email);
        let rows = self
            .store
            .query_by_index(StoreName::Evaluations, IndexName::SyncStatus, SyncStatus::Pending.as_str())
            .await?;
        Ok(decode_rows::<Evaluation>(&rows)
            .into_iter()
            .filter(|evaluation| normalize_email(&evaluation.rs_info.email) == email)
            .collect())
    }

    pub async fn delete_for_user(&self, email: &str, evaluation_id: &str) -> Result<bool, EntityError> {
        self.delete(&evaluation_key(email, evaluation_id)).await
    }

    /// Removes every evaluation stored for `email`.
    pub async fn delete_all_for_user(&self, email: &str) -> Result<usize, EntityError> {
        let rows = self
            .store
            .query_by_index(StoreName::Evaluations, IndexName::Email, &normalize_email(email))
            .await?;
        let mut removed = 0;
        for row in &rows {
            if self.store.delete(StoreName::Evaluations, row_key(row)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl EntityStore<EvaluationIndex> {
    pub async fn load_for_user(&self, email: &str) -> Result<Option<EvaluationIndex>, EntityError> {
        self.load(&normalize_email(email), LoadOptions::default())
            .await
    }
}

impl EntityStore<Session> {
    /// Deletes sessions whose expiry is before `now`. Returns how many were removed.
    pub async fn clear_expired(&self, now: OffsetDateTime) -> Result<usize, EntityError> {
        let mut removed = 0;
        for session in self.get_all().await? {
            if session.is_expired(now) && self.delete(&session.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl EntityStore<Preferences> {
    pub async fn get_for_user(&self, email: &str) -> Result<Preferences, EntityError> {
        Ok(self
            .load(&normalize_email(email), LoadOptions::default())
            .await?
            .unwrap_or_else(|| Preferences::new(email)))
    }
}

/// The entity helpers for one local store.
#[derive(Clone)]
pub struct EntityStorage {
    pub profiles: ProfileStore,
    pub evaluations: EvaluationStore,
    pub indexes: IndexStore,
    pub sessions: SessionStore,
    pub preferences: PreferencesStore,
    store: LocalStore,
}

impl EntityStorage {
    pub fn new(store: LocalStore) -> Self {
        Self {
            profiles: EntityStore::new(store.clone()),
            evaluations: EntityStore::new(store.clone()),
            indexes: EntityStore::new(store.clone()),
            sessions: EntityStore::new(store.clone()),
            preferences: EntityStore::new(store.clone()),
            store,
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Grade, MarineInfo, ReportingSenior, TraitScore};
    use time::macros::datetime;

    fn evaluation(id: &str, email: &str, status: SyncStatus) -> Evaluation {
        let mut evaluation = Evaluation::new(
            id,
            MarineInfo {
                name: "Cpl Hicks".into(),
                rank: "Cpl".into(),
                ..Default::default()
            },
            ReportingSenior {
                name: "Capt Doe".into(),
                email: email.into(),
                rank: "Capt".into(),
            },
        );
        evaluation
            .trait_evaluations
            .push(TraitScore::new("Mission Accomplishment", "Performance", Grade::C, ""));
        evaluation.recompute_average();
        evaluation.sync_status = status;
        evaluation
    }

    fn storage() -> EntityStorage {
        EntityStorage::new(LocalStore::in_memory())
    }

    #[tokio::test]
    async fn saved_entities_load_back_intact() {
        let storage = storage();
        let profile = Profile::new("John Doe", "JDoe@Example.com", "Capt", datetime!(2024-01-01 0:00 UTC));
        let key = storage.profiles.save(&profile).await.unwrap();
        assert_eq!(key, "jdoe@example.com");

        let loaded = storage
            .profiles
            .get_by_email("jdoe@example.com")
            .await
            .unwrap();
        assert_eq!(loaded, Some(profile));
    }

    #[tokio::test]
    async fn rows_carry_type_and_index_fields() {
        let storage = storage();
        storage
            .evaluations
            .save(&evaluation("e1", "a@b.c", SyncStatus::Pending))
            .await
            .unwrap();

        let row = storage
            .local_store()
            .get(StoreName::Evaluations, "a@b.c|e1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["type"], "evaluation");
        assert_eq!(row["email"], "a@b.c");
        assert_eq!(row["syncStatus"], "pending");
        assert!(row["record"]["checksum"].as_str().unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn tampered_records_are_refused_without_repair() {
        let storage = storage();
        storage
            .evaluations
            .save(&evaluation("e1", "a@b.c", SyncStatus::Pending))
            .await
            .unwrap();

        let store = storage.local_store();
        let mut row = store.get(StoreName::Evaluations, "a@b.c|e1").await.unwrap().unwrap();
        row["record"]["data"]["occasion"] = json!("TR");
        store.put(StoreName::Evaluations, &row).await.unwrap();

        let strict = storage.evaluations.load("a@b.c|e1", LoadOptions::strict()).await;
        assert!(matches!(strict, Err(EntityError::Invalid { .. })));

        let repaired = storage
            .evaluations
            .load("a@b.c|e1", LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repaired.occasion, "TR");
    }

    #[tokio::test]
    async fn repair_fills_defaults_for_nulled_fields() {
        let storage = storage();
        let row = json!({
            "key": "a@b.c",
            "type": "profile",
            "email": "a@b.c",
            "record": {
                "version": 1,
                "timestamp": 0,
                "data": {"rsName": "A", "rsEmail": "a@b.c", "rsRank": null},
                "checksum": "sha256:stale",
                "metadata": {"type": "profile", "source": "local"}
            }
        });
        storage
            .local_store()
            .put(StoreName::Profiles, &row)
            .await
            .unwrap();

        let profile = storage.profiles.get_by_email("a@b.c").await.unwrap().unwrap();
        assert_eq!(profile.rs_rank, "");
        assert_eq!(profile.branch, "USMC");
    }

    #[tokio::test]
    async fn unrecoverable_records_are_reported_as_corrupted() {
        let storage = storage();
        let row = json!({"key": "a@b.c", "email": "a@b.c", "record": "{broken"});
        storage
            .local_store()
            .put(StoreName::Profiles, &row)
            .await
            .unwrap();

        let err = storage.profiles.get_by_email("a@b.c").await.unwrap_err();
        assert!(matches!(err, EntityError::Corrupted { .. }));
        assert!(storage.profiles.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_queries_are_scoped_to_the_user() {
        let storage = storage();
        storage
            .evaluations
            .save_all(&[
                evaluation("e1", "a@b.c", SyncStatus::Pending),
                evaluation("e2", "a@b.c", SyncStatus::Synced),
                evaluation("e3", "other@b.c", SyncStatus::Pending),
            ])
            .await
            .unwrap();

        let pending = storage.evaluations.get_pending_sync("A@B.C").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "e1");
        assert_eq!(storage.evaluations.get_all_for_user("a@b.c").await.unwrap().len(), 2);

        assert_eq!(storage.evaluations.delete_all_for_user("a@b.c").await.unwrap(), 2);
        assert_eq!(storage.evaluations.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_without_ids_are_keyed_by_composite_identity() {
        let storage = storage();
        let mut annual = evaluation("", "a@b.c", SyncStatus::Synced);
        annual.occasion = "AN".into();
        let mut transfer = evaluation("", "a@b.c", SyncStatus::Synced);
        transfer.occasion = "TR".into();
        storage.evaluations.save_all(&[annual, transfer]).await.unwrap();

        let stored = storage.evaluations.get_all_for_user("a@b.c").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|e| e.id.is_empty()));
        let key = storage
            .evaluations
            .save(&evaluation("", "a@b.c", SyncStatus::Synced))
            .await
            .unwrap();
        assert_eq!(key, "a@b.c|Cpl Hicks|Cpl||||");
    }

    #[tokio::test]
    async fn expired_sessions_are_cleared() {
        let storage = storage();
        let session = |id: &str, expires_at| Session {
            id: id.into(),
            email: "a@b.c".into(),
            profile_key: String::new(),
            created_at: datetime!(2024-01-01 0:00 UTC),
            expires_at,
        };
        storage
            .sessions
            .save(&session("old", datetime!(2024-01-02 0:00 UTC)))
            .await
            .unwrap();
        storage
            .sessions
            .save(&session("live", datetime!(2024-01-04 0:00 UTC)))
            .await
            .unwrap();

        let removed = storage
            .sessions
            .clear_expired(datetime!(2024-01-03 0:00 UTC))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = storage.sessions.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "live");
    }

    #[tokio::test]
    async fn preferences_default_when_missing() {
        let prefs = storage().preferences.get_for_user("A@b.c").await.unwrap();
        assert!(prefs.auto_sync);
        assert_eq!(prefs.email, "a@b.c");
    }
}
