//! 同步游标数据访问层（DAO）

use crate::crm::sync::models::SyncCursor;
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 同步游标 DAO（基于 sqlx）
#[derive(Clone)]
pub struct SyncStateDao {
    db: Pool<Sqlite>,
    user_id: String,
}

impl SyncStateDao {
    pub fn new(db: Pool<Sqlite>, user_id: String) -> Self {
        Self { db, user_id }
    }

    /// 读取某张远端表的游标
    pub async fn get_cursor(&self, table_name: &str) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            r#"
            SELECT table_name, user_id, high_water, last_synced_at
            FROM local_sync_cursor
            WHERE table_name = ? AND user_id = ?
            "#,
        )
        .bind(table_name)
        .bind(&self.user_id)
        .fetch_optional(&self.db)
        .await
        .context("查询同步游标失败")?;

        Ok(row.map(|m| SyncCursor {
            table_name: m.get("table_name"),
            user_id: m.get("user_id"),
            high_water: m.get("high_water"),
            last_synced_at: m.get("last_synced_at"),
        }))
    }

    /// 保存游标（高水位只前进不后退）
    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let sql = r#"
            INSERT INTO local_sync_cursor (
                table_name, user_id, high_water, last_synced_at
            ) VALUES (?, ?, ?, ?)
            ON CONFLICT(table_name, user_id) DO UPDATE SET
                high_water = MAX(local_sync_cursor.high_water, excluded.high_water),
                last_synced_at = excluded.last_synced_at
        "#;

        sqlx::query(sql)
            .bind(&cursor.table_name)
            .bind(&cursor.user_id)
            .bind(&cursor.high_water)
            .bind(&cursor.last_synced_at)
            .execute(&self.db)
            .await
            .context("保存同步游标失败")?;
        debug!(
            "[SyncDAO] 游标 {} -> {}",
            cursor.table_name, cursor.high_water
        );
        Ok(())
    }

    /// 清除当前用户的所有游标，下次同步变为全量拉取
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM local_sync_cursor WHERE user_id = ?")
            .bind(&self.user_id)
            .execute(&self.db)
            .await
            .context("清除同步游标失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::create_sqlite_pool_with_migration;

    #[tokio::test]
    async fn cursor_never_moves_backwards() -> Result<()> {
        let pool = create_sqlite_pool_with_migration("sqlite::memory:").await?;
        let dao = SyncStateDao::new(pool, "u1".into());
        assert!(dao.get_cursor("clients").await?.is_none());

        let mut cursor = SyncCursor {
            table_name: "clients".into(),
            user_id: "u1".into(),
            high_water: "2024-12-13T10:00:00.000000Z".into(),
            last_synced_at: "2024-12-13T10:00:05.000000Z".into(),
        };
        dao.save_cursor(&cursor).await?;
        cursor.high_water = "2024-12-01T00:00:00.000000Z".into();
        dao.save_cursor(&cursor).await?;
        assert_eq!(
            dao.get_cursor("clients").await?.unwrap().high_water,
            "2024-12-13T10:00:00.000000Z"
        );

        dao.clear_all().await?;
        assert!(dao.get_cursor("clients").await?.is_none());
        Ok(())
    }
}
