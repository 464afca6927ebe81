//! 本地集合存储
//!
//! [`CollectionRepository`] 是所有实体的统一读写接口，调用方通过注入具体实现
//! （SQLite 或内存）来访问数据，而不是直接读写全局存储。

pub mod dao;
pub mod memory;
pub mod sqlite;

use crate::crm::entities::Entity;
use crate::crm::error::{StoreError, StoreResult};
use crate::crm::serialization::{generate_id, next_timestamp, now_utc};
use async_trait::async_trait;
use serde_json::Value;

pub use dao::{MergeOutcome, RecordDao, StoredRecord};
pub use memory::MemoryCollection;
pub use sqlite::SqliteCollection;

/// 更新时不可修改的字段
const IMMUTABLE_FIELDS: [&str; 2] = ["id", "created_at"];

/// 单个集合的存储接口
#[async_trait]
pub trait CollectionRepository<T: Entity>: Send + Sync {
    /// 读取全部记录；无法解析的记录会被跳过
    async fn get_all(&self) -> StoreResult<Vec<T>>;

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<T>>;

    /// 新增记录：分配 id（为空时）、写入时间戳并校验必填字段
    async fn add(&self, entity: T) -> StoreResult<T>;

    /// 浅合并 JSON 补丁到已有记录，`id` 与 `created_at` 不可修改
    async fn update(&self, id: &str, patch: Value) -> StoreResult<T>;

    /// 删除记录；记录不存在时同样成功
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// 按顶层字符串字段过滤
    async fn filter_by(&self, field: &str, value: &str) -> StoreResult<Vec<T>>;

    /// 清空本地集合（不产生远端删除）
    async fn purge(&self) -> StoreResult<()>;
}

/// 新增前的准备：分配 id、时间戳并校验
pub(crate) fn prepare_new<T: Entity>(mut entity: T) -> StoreResult<T> {
    if entity.id().trim().is_empty() {
        entity.set_id(generate_id());
    }
    let now = now_utc();
    entity.set_created_at(now);
    entity.set_updated_at(now);
    entity.validate()?;
    Ok(entity)
}

/// 把补丁合并到当前记录上，返回新的记录（updated_at 严格递增）
pub(crate) fn apply_patch<T: Entity>(current: &T, patch: Value) -> StoreResult<T> {
    let Value::Object(fields) = patch else {
        return Err(StoreError::Validation("补丁必须是 JSON 对象".to_string()));
    };

    let mut merged = serde_json::to_value(current)?;
    if let Value::Object(target) = &mut merged {
        for (key, value) in fields {
            if IMMUTABLE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            target.insert(key, value);
        }
    }

    let mut updated: T = serde_json::from_value(merged)
        .map_err(|e| StoreError::Validation(format!("补丁字段类型错误: {}", e)))?;
    updated.set_updated_at(next_timestamp(current.updated_at()));
    updated.validate()?;
    Ok(updated)
}
