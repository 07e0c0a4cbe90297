use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::Value;
use tokio::{fs, sync::Mutex};
use tracing::warn;

use super::{IndexName, StoreError, StoreName, record_key};

type Records = BTreeMap<String, Value>;

/// JSON-file backed store: one file per named store, each behind its own lock.
/// Without a root directory it lives only in memory.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: Option<PathBuf>,
    stores: [Mutex<Records>; 5],
}

impl FileStore {
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root).await?;
        let mut loaded: [Records; 5] = Default::default();
        for store in StoreName::ALL {
            loaded[store.ordinal()] = load_records(&store_file(root, store)).await?;
        }
        Ok(Self::with_records(Some(root.to_path_buf()), loaded))
    }

    pub fn in_memory() -> Self {
        Self::with_records(None, Default::default())
    }

    fn with_records(root: Option<PathBuf>, records: [Records; 5]) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                stores: records.map(Mutex::new),
            }),
        }
    }

    pub async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.lock(store).await;
        Ok(records.get(key).cloned())
    }

    pub async fn put(&self, store: StoreName, record: &Value) -> Result<String, StoreError> {
        let key = record_key(store, record)?;
        let mut records = self.lock(store).await;
        let mut next = records.clone();
        next.insert(key.clone(), record.clone());
        self.persist(store, &next).await?;
        *records = next;
        Ok(key)
    }

    pub async fn put_many(&self, store: StoreName, batch: &[Value]) -> Result<(), StoreError> {
        let keyed = batch
            .iter()
            .map(|record| record_key(store, record).map(|key| (key, record.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let mut records = self.lock(store).await;
        let mut next = records.clone();
        next.extend(keyed);
        self.persist(store, &next).await?;
        *records = next;
        Ok(())
    }

    pub async fn delete(&self, store: StoreName, key: &str) -> Result<bool, StoreError> {
        let mut records = self.lock(store).await;
        if !records.contains_key(key) {
            return Ok(false);
        }
        let mut next = records.clone();
        next.remove(key);
        self.persist(store, &next).await?;
        *records = next;
        Ok(true)
    }

    pub async fn get_all(&self, store: StoreName) -> Result<Vec<Value>, StoreError> {
        let records = self.lock(store).await;
        Ok(records.values().cloned().collect())
    }

    pub async fn clear(&self, store: StoreName) -> Result<(), StoreError> {
        let mut records = self.lock(store).await;
        let next = Records::new();
        self.persist(store, &next).await?;
        *records = next;
        Ok(())
    }

    pub async fn query_by_index(
        &self,
        store: StoreName,
        index: IndexName,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let records = self.lock(store).await;
        Ok(records
            .values()
            .filter(|record| index.value_of(record) == Some(value))
            .cloned()
            .collect())
    }

    async fn lock(&self, store: StoreName) -> tokio::sync::MutexGuard<'_, Records> {
        self.inner.stores[store.ordinal()].lock().await
    }

    async fn persist(&self, store: StoreName, records: &Records) -> Result<(), StoreError> {
        let Some(root) = &self.inner.root else {
            return Ok(());
        };
        let target = store_file(root, store);
        let partial = target.with_extension("json.partial");
        let bytes = serde_json::to_vec_pretty(records)?;
        fs::write(&partial, bytes).await?;
        fs::rename(&partial, &target).await?;
        Ok(())
    }
}

fn store_file(root: &Path, store: StoreName) -> PathBuf {
    root.join(format!("{}.json", store.as_str()))
}

async fn load_records(path: &Path) -> Result<Records, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Records::new()),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(records) => Ok(records),
        Err(err) => {
            let backup = path.with_extension("json.corrupt");
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %err,
                "store file is unreadable, starting empty"
            );
            fs::rename(path, &backup).await?;
            Ok(Records::new())
        }
    }
}
