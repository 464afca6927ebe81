use super::{apply_patch, prepare_new, CollectionRepository};
use crate::crm::entities::Entity;
use crate::crm::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// 进程内集合存储（测试、演示用，不参与同步）
pub struct MemoryCollection<T> {
    rows: RwLock<Vec<T>>,
}

impl<T: Entity> MemoryCollection<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Entity> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> CollectionRepository<T> for MemoryCollection<T> {
    async fn get_all(&self) -> StoreResult<Vec<T>> {
        Ok(self.rows.read().await.clone())
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<T>> {
        Ok(self.rows.read().await.iter().find(|e| e.id() == id).cloned())
    }

    async fn add(&self, entity: T) -> StoreResult<T> {
        let entity = prepare_new(entity)?;
        let mut rows = self.rows.write().await;
        if rows.iter().any(|e| e.id() == entity.id()) {
            return Err(StoreError::Conflict(format!(
                "{} 已存在 id: {}",
                T::COLLECTION,
                entity.id()
            )));
        }
        rows.push(entity.clone());
        Ok(entity)
    }

    async fn update(&self, id: &str, patch: Value) -> StoreResult<T> {
        let mut rows = self.rows.write().await;
        let slot = rows
            .iter_mut()
            .find(|e| e.id() == id)
            .ok_or_else(|| StoreError::not_found(T::COLLECTION.storage_key(), id))?;
        let updated = apply_patch(slot, patch)?;
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.rows.write().await.retain(|e| e.id() != id);
        Ok(())
    }

    async fn filter_by(&self, field: &str, value: &str) -> StoreResult<Vec<T>> {
        let rows = self.rows.read().await;
        let mut matched = Vec::new();
        for entity in rows.iter() {
            let json = serde_json::to_value(entity)?;
            if json.get(field).and_then(Value::as_str) == Some(value) {
                matched.push(entity.clone());
            }
        }
        Ok(matched)
    }

    async fn purge(&self) -> StoreResult<()> {
        self.rows.write().await.clear();
        Ok(())
    }
}
