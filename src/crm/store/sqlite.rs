use super::dao::{RecordDao, StoredRecord};
use super::{apply_patch, prepare_new, CollectionRepository};
use crate::crm::entities::Entity;
use crate::crm::error::{StoreError, StoreResult};
use crate::crm::serialization::format_ts;
use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// 基于 SQLite 的集合存储，每次修改只写一行
pub struct SqliteCollection<T> {
    dao: RecordDao,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for SqliteCollection<T> {
    fn clone(&self) -> Self {
        Self {
            dao: self.dao.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> SqliteCollection<T> {
    pub fn new(dao: RecordDao) -> Self {
        Self {
            dao,
            _entity: PhantomData,
        }
    }

    pub fn dao(&self) -> &RecordDao {
        &self.dao
    }

    fn decode_all(records: Vec<StoredRecord>) -> Vec<T> {
        records
            .into_iter()
            .filter_map(|r| match serde_json::from_value::<T>(r.body) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!("[Store] 跳过无法解析的 {} 记录 {}: {}", T::COLLECTION, r.id, e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl<T: Entity> CollectionRepository<T> for SqliteCollection<T> {
    async fn get_all(&self) -> StoreResult<Vec<T>> {
        let records = self.dao.fetch_live(T::COLLECTION).await?;
        Ok(Self::decode_all(records))
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<T>> {
        match self.dao.fetch(T::COLLECTION, id).await? {
            Some(record) if !record.deleted => Ok(Some(serde_json::from_value(record.body)?)),
            _ => Ok(None),
        }
    }

    async fn add(&self, entity: T) -> StoreResult<T> {
        let entity = prepare_new(entity)?;
        let body = serde_json::to_value(&entity)?;
        self.dao
            .insert(
                T::COLLECTION,
                entity.id(),
                &body,
                &format_ts(&entity.created_at()),
                &format_ts(&entity.updated_at()),
            )
            .await?;
        debug!("[Store] 新增 {} {}", T::COLLECTION, entity.id());
        Ok(entity)
    }

    async fn update(&self, id: &str, patch: Value) -> StoreResult<T> {
        let record = match self.dao.fetch(T::COLLECTION, id).await? {
            Some(r) if !r.deleted => r,
            _ => return Err(StoreError::not_found(T::COLLECTION.storage_key(), id)),
        };
        let current: T = serde_json::from_value(record.body)?;
        let updated = apply_patch(&current, patch)?;
        let body = serde_json::to_value(&updated)?;

        let written = self
            .dao
            .update_body(
                T::COLLECTION,
                id,
                &body,
                &record.updated_at,
                &format_ts(&updated.updated_at()),
            )
            .await?;
        if !written {
            return Err(StoreError::Conflict(format!(
                "{} {} 在更新期间被修改",
                T::COLLECTION,
                id
            )));
        }
        debug!("[Store] 更新 {} {}", T::COLLECTION, id);
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        if self.dao.tombstone(T::COLLECTION, id).await? {
            debug!("[Store] 删除 {} {}", T::COLLECTION, id);
        }
        Ok(())
    }

    async fn filter_by(&self, field: &str, value: &str) -> StoreResult<Vec<T>> {
        let records = self
            .dao
            .fetch_live_by_field(T::COLLECTION, field, value)
            .await?;
        Ok(Self::decode_all(records))
    }

    async fn purge(&self) -> StoreResult<()> {
        self.dao.purge(T::COLLECTION).await?;
        Ok(())
    }
}
