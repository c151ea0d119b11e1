use std::sync::Arc;

use super::{CanonicalSigner, FieldEncryptor, Signable};
use crate::db::{Query, RecordStore, SecretColumns, StoreTransaction, StoredRow};
use crate::services::error::ServiceError;
use crate::services::metrics::SECURED_RECORDS_CORRUPTED;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Decrypt secret fields instead of leaving them masked.
    pub with_decryption: bool,
}

impl LoadOptions {
    pub fn decrypted() -> Self {
        Self {
            with_decryption: true,
        }
    }
}

/// Persists records with a detached signature and encrypted secret fields.
///
/// Every write signs the newest canonical form. Every read verifies the
/// signature; a row that fails is treated as absent and reported.
#[derive(Clone)]
pub struct SecuredStore {
    store: Arc<dyn RecordStore>,
    signer: Arc<CanonicalSigner>,
    encryptor: Arc<FieldEncryptor>,
}

fn secret_aad(kind: &str, id: &str, field: &str) -> Vec<u8> {
    format!("{}:{}:{}", kind, id, field).into_bytes()
}

impl SecuredStore {
    pub fn new(
        store: Arc<dyn RecordStore>,
        signer: Arc<CanonicalSigner>,
        encryptor: Arc<FieldEncryptor>,
    ) -> Self {
        Self {
            store,
            signer,
            encryptor,
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Inserts a new record. Secret fields are masked in `record` afterwards.
    pub async fn insert<T: Signable>(&self, record: &mut T) -> Result<(), ServiceError> {
        let mut tx = self.store.begin().await?;
        self.write(tx.as_mut(), record, true).await?;
        tx.commit().await?;
        mask(record);
        Ok(())
    }

    /// Locked edit of the stored record with its secret fields decrypted.
    /// `change` sees the current row, never a caller's snapshot. Every
    /// secret field is written back under the newest key. The returned
    /// record is masked.
    pub async fn update<T, F>(&self, id: &str, change: F) -> Result<T, ServiceError>
    where
        T: Signable,
        F: FnOnce(&mut T) -> Result<(), ServiceError> + Send,
    {
        let mut tx = self.store.begin().await?;
        let row = tx
            .select_for_update(T::KIND, id)
            .await?
            .ok_or_else(|| not_found::<T>(id))?;
        let mut record = self.open::<T>(row).ok_or_else(|| not_found::<T>(id))?;

        let stored = tx.select_secrets(T::KIND, id).await?;
        self.reveal(&mut record, id, &stored)?;
        change(&mut record)?;

        self.write(tx.as_mut(), &mut record, false).await?;
        tx.commit().await?;
        mask(&mut record);
        Ok(record)
    }

    /// Locked read-modify-write. `change` returns whether it modified the
    /// record; nothing is written when it did not. Secret fields are left
    /// as stored.
    pub async fn mutate<T, F>(&self, id: &str, change: F) -> Result<T, ServiceError>
    where
        T: Signable,
        F: FnOnce(&mut T) -> Result<bool, ServiceError> + Send,
    {
        let mut tx = self.store.begin().await?;
        let row = tx
            .select_for_update(T::KIND, id)
            .await?
            .ok_or_else(|| not_found::<T>(id))?;
        let mut record = self.open::<T>(row).ok_or_else(|| not_found::<T>(id))?;

        if !change(&mut record)? {
            return Ok(record);
        }

        self.write(tx.as_mut(), &mut record, false).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn delete<T: Signable>(&self, id: &str) -> Result<bool, ServiceError> {
        Ok(self.store.delete(T::KIND, id).await?)
    }

    /// First matching record. A corrupted match is reported as not found.
    pub async fn load_one<T: Signable>(
        &self,
        query: &Query,
        opts: LoadOptions,
    ) -> Result<T, ServiceError> {
        let row = self
            .store
            .select_one(query)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("{} not found", T::KIND)))?;
        let id = row.id.clone();
        let mut record = self.open::<T>(row).ok_or_else(|| not_found::<T>(&id))?;

        if opts.with_decryption {
            let secrets = self
                .store
                .select_secrets(T::KIND, std::slice::from_ref(&id))
                .await?;
            if let Some(stored) = secrets.get(&id) {
                self.reveal(&mut record, &id, stored)?;
            }
        }
        Ok(record)
    }

    /// Every matching record, in insertion order. Corrupted rows are dropped.
    pub async fn load_all<T: Signable>(
        &self,
        query: &Query,
        opts: LoadOptions,
    ) -> Result<Vec<T>, ServiceError> {
        let rows = self.store.select_all(query).await?;
        let mut records: Vec<T> = rows.into_iter().filter_map(|row| self.open(row)).collect();

        if opts.with_decryption && !records.is_empty() {
            let ids: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
            let secrets = self.store.select_secrets(T::KIND, &ids).await?;
            for (record, id) in records.iter_mut().zip(&ids) {
                if let Some(stored) = secrets.get(id) {
                    self.reveal(record, id, stored)?;
                }
            }
        }
        Ok(records)
    }

    async fn write<T: Signable>(
        &self,
        tx: &mut dyn StoreTransaction,
        record: &mut T,
        insert: bool,
    ) -> Result<(), ServiceError> {
        let row = StoredRow {
            kind: T::KIND.to_string(),
            id: record.id().to_string(),
            data: serde_json::to_value(&*record).map_err(anyhow::Error::new)?,
            signature: self.signer.sign(record)?,
        };

        let mut secrets = SecretColumns::new();
        for field in record.secret_fields() {
            if let Some(plain) = field.slot.to_plain()? {
                let aad = secret_aad(&row.kind, &row.id, field.name);
                secrets.insert(field.name.to_string(), self.encryptor.encrypt(&plain, &aad)?);
            }
        }

        if insert {
            tx.insert(&row).await?;
        } else {
            tx.update(&row).await?;
        }
        if !secrets.is_empty() {
            tx.update_secrets(&row.kind, &row.id, &secrets).await?;
        }
        Ok(())
    }

    /// Decodes and verifies a row. `None` means the row is corrupted.
    fn open<T: Signable>(&self, row: StoredRow) -> Option<T> {
        let record: T = match serde_json::from_value(row.data) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(kind = %row.kind, id = %row.id, error = %e, "Stored record could not be decoded");
                metrics::counter!(SECURED_RECORDS_CORRUPTED, "kind" => row.kind).increment(1);
                return None;
            }
        };

        if record.id() != row.id || !self.signer.verify(&record, &row.signature) {
            tracing::error!(kind = %row.kind, id = %row.id, "Stored record failed signature verification");
            metrics::counter!(SECURED_RECORDS_CORRUPTED, "kind" => row.kind).increment(1);
            return None;
        }
        Some(record)
    }

    /// Fills placeholder secret fields from their stored ciphertext.
    fn reveal<T: Signable>(
        &self,
        record: &mut T,
        id: &str,
        stored: &SecretColumns,
    ) -> Result<(), ServiceError> {
        for mut field in record.secret_fields() {
            if !field.slot.is_placeholder() {
                continue;
            }
            if let Some(sealed) = stored.get(field.name) {
                let plain = self
                    .encryptor
                    .decrypt(sealed, &secret_aad(T::KIND, id, field.name))?;
                field.slot.set_plain(&plain)?;
            }
        }
        Ok(())
    }
}

fn mask<T: Signable>(record: &mut T) {
    for mut field in record.secret_fields() {
        field.slot.mask();
    }
}

fn not_found<T: Signable>(id: &str) -> ServiceError {
    ServiceError::NotFound(format!("{} {} not found", T::KIND, id))
}
