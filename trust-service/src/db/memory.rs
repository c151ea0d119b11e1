use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Query, RecordStore, SecretColumns, StoreError, StoreTransaction, StoredRow};

type Key = (String, String);

struct MemoryRow {
    seq: u64,
    row: StoredRow,
    secrets: SecretColumns,
}

#[derive(Default)]
struct Inner {
    rows: RwLock<BTreeMap<Key, MemoryRow>>,
    locks: DashMap<Key, Arc<Mutex<()>>>,
    sequence: AtomicU64,
    unavailable: AtomicBool,
    failing_deletes: DashMap<Key, ()>,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "in-memory store switched off"
            )));
        }
        Ok(())
    }

    fn check_delete(&self, key: &Key) -> Result<(), StoreError> {
        if self.failing_deletes.contains_key(key) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected delete failure for {} {}",
                key.0,
                key.1
            )));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<Key, MemoryRow>>, StoreError> {
        self.rows
            .read()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("in-memory store poisoned")))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<Key, MemoryRow>>, StoreError> {
        self.rows
            .write()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("in-memory store poisoned")))
    }

    async fn lock(&self, key: &Key) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Forgets the lock of `key` once no guard or waiter holds it.
    fn release(&self, key: &Key) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Process-local record store with row locks and buffered transactional
/// writes. Also offers fault injection for tests.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes deletes of one record fail.
    pub fn fail_deletes_of(&self, kind: &str, id: &str) {
        self.inner
            .failing_deletes
            .insert((kind.to_string(), id.to_string()), ());
    }

    /// Edits a stored row in place without re-signing it.
    pub fn tamper<F>(&self, kind: &str, id: &str, edit: F) -> bool
    where
        F: FnOnce(&mut serde_json::Value),
    {
        let Ok(mut rows) = self.inner.write() else {
            return false;
        };
        match rows.get_mut(&(kind.to_string(), id.to_string())) {
            Some(stored) => {
                edit(&mut stored.row.data);
                true
            }
            None => false,
        }
    }

    /// Swaps the detached signature of a stored row.
    pub fn replace_signature(&self, kind: &str, id: &str, signature: String) -> bool {
        let Ok(mut rows) = self.inner.write() else {
            return false;
        };
        match rows.get_mut(&(kind.to_string(), id.to_string())) {
            Some(stored) => {
                stored.row.signature = signature;
                true
            }
            None => false,
        }
    }

    /// Raw row as persisted, for inspection.
    pub fn raw(&self, kind: &str, id: &str) -> Option<(StoredRow, SecretColumns)> {
        let rows = self.inner.read().ok()?;
        rows.get(&(kind.to_string(), id.to_string()))
            .map(|stored| (stored.row.clone(), stored.secrets.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn select_one(&self, query: &Query) -> Result<Option<StoredRow>, StoreError> {
        Ok(self.select_all(query).await?.into_iter().next())
    }

    async fn select_all(&self, query: &Query) -> Result<Vec<StoredRow>, StoreError> {
        self.inner.check_available()?;
        let rows = self.inner.read()?;
        let mut matched: Vec<_> = rows
            .values()
            .filter(|stored| query.matches(&stored.row))
            .collect();
        matched.sort_by_key(|stored| stored.seq);
        Ok(matched.into_iter().map(|stored| stored.row.clone()).collect())
    }

    async fn select_secrets(
        &self,
        kind: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SecretColumns>, StoreError> {
        self.inner.check_available()?;
        let rows = self.inner.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(&(kind.to_string(), id.clone()))
                    .map(|stored| (id.clone(), stored.secrets.clone()))
            })
            .collect())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        self.inner.check_available()?;
        let key = (kind.to_string(), id.to_string());
        self.inner.check_delete(&key)?;
        let guard = self.inner.lock(&key).await;
        let removed = self.inner.write()?.remove(&key).is_some();
        drop(guard);
        self.inner.release(&key);
        Ok(removed)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.inner.check_available()?;
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            guards: Vec::new(),
            locked: HashSet::new(),
            pending: Vec::new(),
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.check_available()
    }
}

enum Pending {
    Insert(StoredRow),
    Update(StoredRow),
    Secrets(Key, SecretColumns),
    Delete(Key),
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    guards: Vec<OwnedMutexGuard<()>>,
    locked: HashSet<Key>,
    pending: Vec<Pending>,
}

impl MemoryTransaction {
    async fn lock(&mut self, key: &Key) {
        if self.locked.insert(key.clone()) {
            let guard = self.inner.lock(key).await;
            self.guards.push(guard);
        }
    }

    /// Committed state of `key` with this transaction's writes applied.
    fn current(&self, key: &Key) -> Result<Option<(StoredRow, SecretColumns)>, StoreError> {
        let mut state = self
            .inner
            .read()?
            .get(key)
            .map(|stored| (stored.row.clone(), stored.secrets.clone()));

        for write in &self.pending {
            match write {
                Pending::Insert(row) if (&row.kind, &row.id) == (&key.0, &key.1) => {
                    state = Some((row.clone(), SecretColumns::new()));
                }
                Pending::Update(row) if (&row.kind, &row.id) == (&key.0, &key.1) => {
                    if let Some((current, _)) = state.as_mut() {
                        *current = row.clone();
                    }
                }
                Pending::Secrets(k, secrets) if k == key => {
                    if let Some((_, current)) = state.as_mut() {
                        current.extend(secrets.clone());
                    }
                }
                Pending::Delete(k) if k == key => state = None,
                _ => {}
            }
        }
        Ok(state)
    }
}

fn key_of(row: &StoredRow) -> Key {
    (row.kind.clone(), row.id.clone())
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn select_for_update(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredRow>, StoreError> {
        self.inner.check_available()?;
        let key = (kind.to_string(), id.to_string());
        self.lock(&key).await;
        Ok(self.current(&key)?.map(|(row, _)| row))
    }

    async fn select_secrets(&mut self, kind: &str, id: &str) -> Result<SecretColumns, StoreError> {
        self.inner.check_available()?;
        let key = (kind.to_string(), id.to_string());
        Ok(self
            .current(&key)?
            .map(|(_, secrets)| secrets)
            .unwrap_or_default())
    }

    async fn insert(&mut self, row: &StoredRow) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let key = key_of(row);
        self.lock(&key).await;
        if self.current(&key)?.is_some() {
            return Err(StoreError::Conflict {
                kind: key.0,
                id: key.1,
            });
        }
        self.pending.push(Pending::Insert(row.clone()));
        Ok(())
    }

    async fn update(&mut self, row: &StoredRow) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let key = key_of(row);
        self.lock(&key).await;
        if self.current(&key)?.is_none() {
            return Err(StoreError::not_found(&key.0, &key.1));
        }
        self.pending.push(Pending::Update(row.clone()));
        Ok(())
    }

    async fn update_secrets(
        &mut self,
        kind: &str,
        id: &str,
        secrets: &SecretColumns,
    ) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let key = (kind.to_string(), id.to_string());
        self.lock(&key).await;
        if self.current(&key)?.is_none() {
            return Err(StoreError::not_found(kind, id));
        }
        self.pending.push(Pending::Secrets(key, secrets.clone()));
        Ok(())
    }

    async fn delete(&mut self, kind: &str, id: &str) -> Result<bool, StoreError> {
        self.inner.check_available()?;
        let key = (kind.to_string(), id.to_string());
        self.inner.check_delete(&key)?;
        self.lock(&key).await;
        let existed = self.current(&key)?.is_some();
        if existed {
            self.pending.push(Pending::Delete(key));
        }
        Ok(existed)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let pending = std::mem::take(&mut self.pending);
        let inner = self.inner.clone();

        {
            let mut rows = inner.write()?;
            for write in pending {
                match write {
                    Pending::Insert(row) => {
                        let seq = inner.sequence.fetch_add(1, Ordering::SeqCst);
                        rows.insert(
                            key_of(&row),
                            MemoryRow {
                                seq,
                                row,
                                secrets: SecretColumns::new(),
                            },
                        );
                    }
                    Pending::Update(row) => {
                        if let Some(stored) = rows.get_mut(&key_of(&row)) {
                            stored.row = row;
                        }
                    }
                    Pending::Secrets(key, secrets) => {
                        if let Some(stored) = rows.get_mut(&key) {
                            stored.secrets.extend(secrets);
                        }
                    }
                    Pending::Delete(key) => {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.locked {
            self.inner.release(key);
        }
    }
}
