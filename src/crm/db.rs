//! SQLite 数据库工具：统一创建连接池并执行 sqlx 迁移
//!
//! 约定：本 crate 根目录下存在 `migrations/` 目录，存放所有迁移 SQL 文件。
//! 通过 `sqlx::migrate!()` 自动管理 schema 升级。

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

/// 创建 SQLite 连接池并执行所有未执行的迁移
///
/// 内存数据库（`sqlite::memory:`）每个连接都是独立的库，因此只开一个连接。
pub async fn create_sqlite_pool_with_migration(db_url: &str) -> Result<Pool<Sqlite>> {
    let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");
    let max_connections = if in_memory { 1 } else { 5 };

    let options = SqliteConnectOptions::from_str(db_url)
        .context(format!("无效的 SQLite 地址: {}", db_url))?
        .create_if_missing(true);

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        // 连接被回收后内存库的数据也随之丢失
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options
        .connect_with(options)
        .await
        .context(format!("连接SQLite数据库失败: {}", db_url))?;

    // 从 `migrations/` 目录读取迁移并执行
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("执行数据库迁移失败")?;

    info!(
        "[DB] SQLite 连接池已就绪: {} (最大连接数 {})",
        db_url, max_connections
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn migrations_create_local_tables() -> Result<()> {
        let pool = create_sqlite_pool_with_migration("sqlite::memory:").await?;
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'local_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await?;
        let names: Vec<String> = rows.into_iter().map(|r| r.get("name")).collect();
        assert_eq!(names, vec!["local_records", "local_sync_cursor"]);
        Ok(())
    }

    #[tokio::test]
    async fn file_database_is_created_on_demand() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("crm.db");
        let url = format!("sqlite://{}", path.display());
        let pool = create_sqlite_pool_with_migration(&url).await?;
        pool.close().await;
        assert!(path.exists());
        Ok(())
    }
}
