//! 同步结果与远端日志 DTO

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 单张表的同步统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncStats {
    pub table: String,
    /// 推送（upsert）到远端的行数
    pub pushed: usize,
    /// 在远端删除的行数
    pub deleted_remote: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// 全量拉取时发现远端已删除、本地随之移除的行数
    pub removed_local: usize,
    pub conflicts: usize,
}

impl TableSyncStats {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn pulled(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// 一次完整同步的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableSyncStats>,
}

impl SyncReport {
    pub fn table(&self, name: &str) -> Option<&TableSyncStats> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// 写入 `sync_logs.details` 的摘要：表名 → 各项计数
    pub fn details(&self) -> Value {
        let mut map = Map::new();
        for t in &self.tables {
            map.insert(
                t.table.clone(),
                json!({
                    "pushed": t.pushed,
                    "deleted_remote": t.deleted_remote,
                    "pulled": t.pulled(),
                    "removed_local": t.removed_local,
                    "conflicts": t.conflicts,
                }),
            );
        }
        Value::Object(map)
    }
}

/// 面向界面的同步结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Success,
    Error,
}

/// 远端 `sync_logs` 表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub status: SyncStatus,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub error_details: Option<String>,
    pub last_sync: DateTime<Utc>,
}
