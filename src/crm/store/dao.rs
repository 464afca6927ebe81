//! 本地记录数据访问层（DAO）
//!
//! 所有集合共用一张 `local_records` 表，按 `(collection, id)` 单行读写。
//! 每次本地修改都会把行标记为 `dirty`；删除只留下墓碑（`deleted = 1`），
//! 由同步服务推送到远端后再清理。

use crate::crm::entities::Collection;
use crate::crm::error::{StoreError, StoreResult};
use crate::crm::serialization::{format_ts, now_utc, parse_ts};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// 远端同步附带的字段，本地不保存
const REMOTE_ONLY_FIELDS: [&str; 1] = ["last_synced"];

/// 本地存储中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub collection: Collection,
    pub id: String,
    pub body: Value,
    pub created_at: String,
    pub updated_at: String,
    pub dirty: bool,
    pub deleted: bool,
}

/// 远端记录合并到本地的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// 本地有更新的未推送修改，保留本地版本
    KeptLocal,
}

/// 本地记录 DAO（基于 sqlx）
#[derive(Clone)]
pub struct RecordDao {
    db: Pool<Sqlite>,
}

impl RecordDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.db
    }

    fn map_row(collection: Collection, row: SqliteRow) -> StoreResult<StoredRecord> {
        let body: String = row.get("body");
        let dirty: i64 = row.get("dirty");
        let deleted: i64 = row.get("deleted");
        Ok(StoredRecord {
            collection,
            id: row.get("id"),
            body: serde_json::from_str(&body)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            dirty: dirty != 0,
            deleted: deleted != 0,
        })
    }

    /// 映射多行，body 无法解析的行记录日志后跳过
    fn map_rows(collection: Collection, rows: Vec<SqliteRow>) -> Vec<StoredRecord> {
        rows.into_iter()
            .filter_map(|row| {
                let id: String = row.get("id");
                match Self::map_row(collection, row) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!("[StoreDAO] 跳过损坏的记录 {}/{}: {}", collection, id, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// 查询集合中所有未删除的记录（按创建顺序）
    pub async fn fetch_live(&self, collection: Collection) -> StoreResult<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, created_at, updated_at, dirty, deleted
            FROM local_records
            WHERE collection = ? AND deleted = 0
            ORDER BY created_at, rowid
            "#,
        )
        .bind(collection.storage_key())
        .fetch_all(&self.db)
        .await?;

        let records = Self::map_rows(collection, rows);
        debug!("[StoreDAO] 读取 {}，共 {} 条", collection, records.len());
        Ok(records)
    }

    /// 按顶层 JSON 字段过滤（走 json_extract 表达式索引）
    pub async fn fetch_live_by_field(
        &self,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<StoredRecord>> {
        if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Validation(format!("非法字段名: {}", field)));
        }
        // 字段名已校验，只能内联（绑定参数会导致表达式索引失效）
        let sql = format!(
            r#"
            SELECT id, body, created_at, updated_at, dirty, deleted
            FROM local_records
            WHERE collection = ? AND deleted = 0
              AND json_extract(body, '$.{}') = ?
            ORDER BY created_at, rowid
            "#,
            field
        );
        let rows = sqlx::query(&sql)
            .bind(collection.storage_key())
            .bind(value)
            .fetch_all(&self.db)
            .await?;
        Ok(Self::map_rows(collection, rows))
    }

    /// 查询单条记录（包含墓碑）
    pub async fn fetch(&self, collection: Collection, id: &str) -> StoreResult<Option<StoredRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, body, created_at, updated_at, dirty, deleted
            FROM local_records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection.storage_key())
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| Self::map_row(collection, r)).transpose()
    }

    /// 插入新记录；同 id 的存活记录已存在时返回冲突，墓碑会被覆盖
    pub async fn insert(
        &self,
        collection: Collection,
        id: &str,
        body: &Value,
        created_at: &str,
        updated_at: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO local_records (collection, id, body, created_at, updated_at, dirty, deleted)
            VALUES (?, ?, ?, ?, ?, 1, 0)
            ON CONFLICT(collection, id) DO UPDATE SET
                body = excluded.body,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                dirty = 1,
                deleted = 0
            WHERE local_records.deleted = 1
            "#,
        )
        .bind(collection.storage_key())
        .bind(id)
        .bind(serde_json::to_string(body)?)
        .bind(created_at)
        .bind(updated_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("{} 已存在 id: {}", collection, id)));
        }
        debug!("[StoreDAO] 新增 {}/{}", collection, id);
        Ok(())
    }

    /// 在一个事务中写回备份记录（覆盖同 id 记录），全部标记为 dirty 等待推送
    pub async fn restore_rows(&self, rows: &[(Collection, Value)]) -> StoreResult<u64> {
        let mut tx = self.db.begin().await?;
        let mut restored = 0;
        for (collection, body) in rows {
            let id = body
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| StoreError::Validation(format!("{} 备份记录缺少 id", collection)))?;
            let updated = body
                .get("updated_at")
                .and_then(Value::as_str)
                .and_then(parse_ts)
                .unwrap_or_else(now_utc);
            let created = body
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(parse_ts)
                .unwrap_or(updated);

            sqlx::query(
                r#"
                INSERT INTO local_records (collection, id, body, created_at, updated_at, dirty, deleted)
                VALUES (?, ?, ?, ?, ?, 1, 0)
                ON CONFLICT(collection, id) DO UPDATE SET
                    body = excluded.body,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    dirty = 1,
                    deleted = 0
                "#,
            )
            .bind(collection.storage_key())
            .bind(id)
            .bind(serde_json::to_string(body)?)
            .bind(format_ts(&created))
            .bind(format_ts(&updated))
            .execute(&mut *tx)
            .await?;
            restored += 1;
        }
        tx.commit().await?;
        info!("[StoreDAO] 从备份恢复 {} 条记录", restored);
        Ok(restored)
    }

    /// 乐观并发更新：仅当 updated_at 仍为 `expected_updated_at` 时写入
    pub async fn update_body(
        &self,
        collection: Collection,
        id: &str,
        body: &Value,
        expected_updated_at: &str,
        updated_at: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE local_records
            SET body = ?, updated_at = ?, dirty = 1
            WHERE collection = ? AND id = ? AND deleted = 0 AND updated_at = ?
            "#,
        )
        .bind(serde_json::to_string(body)?)
        .bind(updated_at)
        .bind(collection.storage_key())
        .bind(id)
        .bind(expected_updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// 把存活记录变成墓碑；不存在或已删除时返回 false
    pub async fn tombstone(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        self.tombstone_many(&[(collection, vec![id.to_string()])])
            .await
            .map(|n| n > 0)
    }

    /// 在一个事务中删除多个集合中的记录（级联删除使用）
    pub async fn tombstone_many(&self, plan: &[(Collection, Vec<String>)]) -> StoreResult<u64> {
        let ts = format_ts(&now_utc());
        let mut tx = self.db.begin().await?;
        let mut affected = 0;
        for (collection, ids) in plan {
            for id in ids {
                let result = sqlx::query(
                    r#"
                    UPDATE local_records
                    SET deleted = 1, dirty = 1, updated_at = ?
                    WHERE collection = ? AND id = ? AND deleted = 0
                    "#,
                )
                .bind(&ts)
                .bind(collection.storage_key())
                .bind(id)
                .execute(&mut *tx)
                .await?;
                affected += result.rows_affected();
            }
        }
        tx.commit().await?;
        debug!("[StoreDAO] 事务内删除 {} 条记录", affected);
        Ok(affected)
    }

    /// 清空集合的所有本地数据（不留墓碑），同时重置该集合的同步游标
    pub async fn purge(&self, collection: Collection) -> StoreResult<u64> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("DELETE FROM local_records WHERE collection = ?")
            .bind(collection.storage_key())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM local_sync_cursor WHERE table_name = ?")
            .bind(collection.remote_table())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(
            "[StoreDAO] 已清空本地集合 {}，删除 {} 行",
            collection,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// 查询待推送的记录（含墓碑）
    pub async fn fetch_dirty(&self, collection: Collection) -> StoreResult<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, created_at, updated_at, dirty, deleted
            FROM local_records
            WHERE collection = ? AND dirty = 1
            ORDER BY created_at, rowid
            "#,
        )
        .bind(collection.storage_key())
        .fetch_all(&self.db)
        .await?;
        Ok(Self::map_rows(collection, rows))
    }

    /// 推送成功后清除 dirty 标记；推送期间行又被修改（updated_at 变化）则保持 dirty
    pub async fn mark_clean(
        &self,
        collection: Collection,
        id: &str,
        pushed_updated_at: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE local_records SET dirty = 0
            WHERE collection = ? AND id = ? AND deleted = 0 AND updated_at = ?
            "#,
        )
        .bind(collection.storage_key())
        .bind(id)
        .bind(pushed_updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// 远端删除成功后移除墓碑
    pub async fn drop_tombstone(
        &self,
        collection: Collection,
        id: &str,
        pushed_updated_at: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM local_records
            WHERE collection = ? AND id = ? AND deleted = 1 AND updated_at = ?
            "#,
        )
        .bind(collection.storage_key())
        .bind(id)
        .bind(pushed_updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// 将一条远端记录合并到本地（按 updated_at 后写者胜）
    pub async fn apply_remote(&self, collection: Collection, remote: Value) -> StoreResult<MergeOutcome> {
        let mut body = remote;
        let obj = body
            .as_object_mut()
            .ok_or_else(|| StoreError::Validation(format!("{} 远端记录不是对象", collection)))?;
        for field in REMOTE_ONLY_FIELDS {
            obj.remove(field);
        }
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Validation(format!("{} 远端记录缺少 id", collection)))?;
        let updated = obj
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_ts)
            .unwrap_or_else(now_utc);
        let created = obj
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_ts)
            .unwrap_or(updated);
        let updated_at = format_ts(&updated);
        let created_at = format_ts(&created);

        let mut tx = self.db.begin().await?;
        let existing = sqlx::query(
            r#"
            SELECT id, body, created_at, updated_at, dirty, deleted
            FROM local_records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection.storage_key())
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| Self::map_row(collection, r))
        .transpose()?;

        let outcome = match existing {
            Some(local) if local.dirty && local.updated_at > updated_at => MergeOutcome::KeptLocal,
            Some(local) if !local.dirty && !local.deleted && local.body == body => {
                MergeOutcome::Unchanged
            }
            existing => {
                sqlx::query(
                    r#"
                    INSERT INTO local_records (collection, id, body, created_at, updated_at, dirty, deleted)
                    VALUES (?, ?, ?, ?, ?, 0, 0)
                    ON CONFLICT(collection, id) DO UPDATE SET
                        body = excluded.body,
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at,
                        dirty = 0,
                        deleted = 0
                    "#,
                )
                .bind(collection.storage_key())
                .bind(&id)
                .bind(serde_json::to_string(&body)?)
                .bind(&created_at)
                .bind(&updated_at)
                .execute(&mut *tx)
                .await?;
                if existing.is_some() {
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Inserted
                }
            }
        };
        tx.commit().await?;
        debug!("[StoreDAO] 合并远端记录 {}/{}: {:?}", collection, id, outcome);
        Ok(outcome)
    }

    /// 远端已删除：本地没有未推送修改时物理删除
    pub async fn delete_if_clean(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM local_records WHERE collection = ? AND id = ? AND dirty = 0",
        )
        .bind(collection.storage_key())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// 全量拉取后：删除远端已不存在、且本地没有未推送修改的记录
    pub async fn remove_clean_missing(
        &self,
        collection: Collection,
        remote_ids: &HashSet<String>,
    ) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM local_records WHERE collection = ? AND dirty = 0 AND deleted = 0",
        )
        .bind(collection.storage_key())
        .fetch_all(&self.db)
        .await?;

        let mut removed = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            if !remote_ids.contains(&id) && self.delete_if_clean(collection, &id).await? {
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            info!(
                "[StoreDAO] 远端已删除，本地移除 {} 条 {} 记录",
                removed.len(),
                collection
            );
        }
        Ok(removed)
    }

    /// 各集合的存活记录数
    pub async fn count_live(&self, collection: Collection) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM local_records WHERE collection = ? AND deleted = 0",
        )
        .bind(collection.storage_key())
        .fetch_one(&self.db)
        .await?;
        Ok(row.get("n"))
    }

    /// 所有集合中等待推送的行数（含墓碑）
    pub async fn count_dirty(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM local_records WHERE dirty = 1")
            .fetch_one(&self.db)
            .await?;
        Ok(row.get("n"))
    }
}
