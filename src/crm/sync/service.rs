//! 云端镜像同步服务层
//!
//! 两阶段同步：先推送本地 dirty 行（父表先 upsert，子表先删除），
//! 再按游标拉取远端变更，逐条按 updated_at 后写者胜合并到本地。

use crate::crm::entities::{Client, Collection};
use crate::crm::error::StoreResult;
use crate::crm::relations::CascadeSummary;
use crate::crm::serialization::{format_ts, now_utc, parse_ts};
use crate::crm::store::{CollectionRepository, MergeOutcome, RecordDao, SqliteCollection};
use crate::crm::sync::api::RemoteTableApi;
use crate::crm::sync::dao::SyncStateDao;
use crate::crm::sync::listener::{EmptySyncListener, SyncListener};
use crate::crm::sync::models::{SyncConfig, SyncCursor};
use crate::crm::sync::types::{
    SyncLogEntry, SyncOutcome, SyncReport, SyncStatus, TableSyncStats,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 镜像同步器
pub struct MirrorSyncer {
    config: SyncConfig,
    api: RemoteTableApi,
    records: RecordDao,
    state: SyncStateDao,
    listener: RwLock<Arc<dyn SyncListener>>,
    /// 保证同一时间只有一个 sync_all 在运行
    sync_lock: Mutex<()>,
}

impl MirrorSyncer {
    /// 创建新的同步器（使用默认空监听器）
    pub fn new(config: SyncConfig, records: RecordDao) -> Result<Self> {
        Self::with_listener(config, records, Arc::new(EmptySyncListener))
    }

    /// 创建新的同步器（带自定义监听器，使用共享连接池）
    pub fn with_listener(
        config: SyncConfig,
        records: RecordDao,
        listener: Arc<dyn SyncListener>,
    ) -> Result<Self> {
        info!(
            "[Sync] 创建镜像同步器，用户ID: {}, 远端: {}",
            config.user_id, config.api_base_url
        );
        let api = RemoteTableApi::from_config(&config)?;
        let state = SyncStateDao::new(records.pool().clone(), config.user_id.clone());
        Ok(Self {
            config,
            api,
            records,
            state,
            listener: RwLock::new(listener),
            sync_lock: Mutex::new(()),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn SyncListener>) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = listener;
        }
    }

    pub(crate) fn listener(&self) -> Arc<dyn SyncListener> {
        match self.listener.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// 推送单个集合的新增与修改，返回推送行数
    async fn push_upserts(&self, collection: Collection) -> Result<usize> {
        let table = collection.remote_table();
        let dirty: Vec<_> = self
            .records
            .fetch_dirty(collection)
            .await
            .context(format!("读取 {} 待推送记录失败", table))?
            .into_iter()
            .filter(|r| !r.deleted)
            .collect();
        if dirty.is_empty() {
            debug!("[Sync] {} 无待推送修改", table);
            return Ok(0);
        }

        let synced_at = format_ts(&now_utc());
        let rows: Vec<Value> = dirty
            .iter()
            .map(|r| {
                let mut body = r.body.clone();
                if let Value::Object(map) = &mut body {
                    map.insert("user_id".into(), json!(self.config.user_id));
                    map.insert("last_synced".into(), json!(synced_at));
                }
                body
            })
            .collect();

        self.api
            .upsert_rows(table, &rows)
            .await
            .context(format!("推送 {} 失败", table))?;

        for record in &dirty {
            if !self
                .records
                .mark_clean(collection, &record.id, &record.updated_at)
                .await?
            {
                debug!("[Sync] {} {} 推送期间被修改，保留 dirty", table, record.id);
            }
        }
        info!("[Sync] ⬆️ {} 推送 {} 行", table, dirty.len());
        Ok(dirty.len())
    }

    /// 推送单个集合的删除，返回远端删除行数
    async fn push_deletes(&self, collection: Collection) -> Result<usize> {
        let table = collection.remote_table();
        let tombstones: Vec<_> = self
            .records
            .fetch_dirty(collection)
            .await?
            .into_iter()
            .filter(|r| r.deleted)
            .collect();
        if tombstones.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = tombstones.iter().map(|r| r.id.clone()).collect();
        self.api
            .delete_rows(table, &ids)
            .await
            .context(format!("远端删除 {} 失败", table))?;

        for record in &tombstones {
            self.records
                .drop_tombstone(collection, &record.id, &record.updated_at)
                .await?;
        }
        info!("[Sync] 🗑️ {} 远端删除 {} 行", table, ids.len());
        Ok(ids.len())
    }

    /// 把单个集合的本地修改推送到云端
    pub async fn sync_table_to_cloud(&self, collection: Collection) -> Result<TableSyncStats> {
        let mut stats = TableSyncStats::new(collection.remote_table());
        stats.pushed = self.push_upserts(collection).await?;
        stats.deleted_remote = self.push_deletes(collection).await?;
        Ok(stats)
    }

    /// 从云端拉取单个集合并合并到本地
    pub async fn sync_table_from_cloud(&self, collection: Collection) -> Result<TableSyncStats> {
        let mut stats = TableSyncStats::new(collection.remote_table());
        self.pull_into(collection, &mut stats).await?;
        Ok(stats)
    }

    async fn pull_into(&self, collection: Collection, stats: &mut TableSyncStats) -> Result<()> {
        let table = collection.remote_table();
        let cursor = self.state.get_cursor(table).await?;
        let is_full = cursor.is_none();
        if let Some(ref c) = cursor {
            debug!("[Sync] {} 本地游标: {}", table, c.high_water);
        } else {
            debug!("[Sync] {} 本地无游标，执行全量拉取", table);
        }

        let rows = self
            .api
            .fetch_rows(
                table,
                cursor.as_ref().map(|c| c.high_water.as_str()),
            )
            .await
            .context(format!("拉取 {} 失败", table))?;

        let mut remote_ids = HashSet::with_capacity(rows.len());
        let mut high_water: Option<DateTime<Utc>> = None;
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                remote_ids.insert(id.to_string());
            }
            // 游标取推送戳；没有 last_synced 的行不推进游标
            let stamped = row
                .get("last_synced")
                .and_then(Value::as_str)
                .and_then(parse_ts);
            if let Some(ts) = stamped {
                high_water = Some(high_water.map_or(ts, |h| h.max(ts)));
            }

            match self.apply_remote_row(collection, row).await {
                Ok(MergeOutcome::Inserted) => stats.inserted += 1,
                Ok(MergeOutcome::Updated) => stats.updated += 1,
                Ok(MergeOutcome::Unchanged) => stats.unchanged += 1,
                Ok(MergeOutcome::KeptLocal) => stats.conflicts += 1,
                Err(e) => warn!("[Sync] {} 跳过无法合并的远端记录: {}", table, e),
            }
        }

        // 全量拉取时远端列表视为权威，删除本地多余且未修改的记录
        if is_full {
            stats.removed_local = self
                .records
                .remove_clean_missing(collection, &remote_ids)
                .await?
                .len();
        }

        if let Some(ts) = high_water {
            self.state
                .save_cursor(&SyncCursor {
                    table_name: table.to_string(),
                    user_id: self.config.user_id.clone(),
                    high_water: format_ts(&ts),
                    last_synced_at: format_ts(&now_utc()),
                })
                .await?;
        }

        info!(
            "[Sync] ⬇️ {} 拉取完成 - 新增: {}, 更新: {}, 未变: {}, 冲突: {}, 移除: {}",
            table, stats.inserted, stats.updated, stats.unchanged, stats.conflicts, stats.removed_local
        );
        Ok(())
    }

    /// 合并一条远端记录；本地较新的未推送修改会触发冲突回调
    pub async fn apply_remote_row(
        &self,
        collection: Collection,
        row: Value,
    ) -> StoreResult<MergeOutcome> {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let outcome = self.records.apply_remote(collection, row).await?;
        if outcome == MergeOutcome::KeptLocal {
            info!("[Sync] ⚠️ {} {} 本地修改较新，保留本地版本", collection, id);
            self.listener()
                .on_conflict(collection.remote_table().to_string(), id)
                .await;
        }
        Ok(outcome)
    }

    /// 远端删除：本地有未推送修改时保留
    pub async fn apply_remote_delete(
        &self,
        collection: Collection,
        id: &str,
    ) -> StoreResult<bool> {
        let removed = self.records.delete_if_clean(collection, id).await?;
        if !removed {
            debug!("[Sync] {} {} 本地不存在或有未推送修改，忽略远端删除", collection, id);
        }
        Ok(removed)
    }

    /// 完整同步：推送全部集合后再拉取全部集合
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let listener = self.listener();
        listener.on_sync_started().await;
        info!("[Sync] 🔄 开始完整同步...");

        let log_id = Uuid::new_v4().to_string();
        self.write_sync_log(&log_id, SyncStatus::InProgress, None, None)
            .await;

        let started_at = now_utc();
        match self.run_sync().await {
            Ok(tables) => {
                let report = SyncReport {
                    started_at,
                    finished_at: now_utc(),
                    tables,
                };
                self.write_sync_log(&log_id, SyncStatus::Success, Some(report.details()), None)
                    .await;
                if let Ok(json) = serde_json::to_string(&report) {
                    listener.on_sync_finished(json).await;
                }
                info!("[Sync] ✅ 完整同步完成");
                Ok(report)
            }
            Err(e) => {
                error!("[Sync] ❌ 同步失败: {:#}", e);
                self.write_sync_log(&log_id, SyncStatus::Error, None, Some(format!("{:#}", e)))
                    .await;
                listener.on_sync_failed(format!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    async fn run_sync(&self) -> Result<Vec<TableSyncStats>> {
        let mut tables: Vec<TableSyncStats> = Collection::ALL
            .iter()
            .map(|c| TableSyncStats::new(c.remote_table()))
            .collect();

        // 父表先 upsert，避免远端外键失败
        for (i, collection) in Collection::ALL.iter().enumerate() {
            tables[i].pushed = self.push_upserts(*collection).await?;
        }
        // 子表先删除
        for (i, collection) in Collection::ALL.iter().enumerate().rev() {
            tables[i].deleted_remote = self.push_deletes(*collection).await?;
        }

        let listener = self.listener();
        for (i, collection) in Collection::ALL.iter().enumerate() {
            self.pull_into(*collection, &mut tables[i]).await?;
            if let Ok(json) = serde_json::to_string(&tables[i]) {
                listener.on_table_synced(json).await;
            }
        }
        Ok(tables)
    }

    /// 清除游标后完整同步（全量拉取）
    pub async fn resync_all(&self) -> Result<SyncReport> {
        self.state.clear_all().await?;
        self.sync_all().await
    }

    /// 面向界面的同步入口：错误转换为失败结果
    pub async fn sync_outcome(&self) -> SyncOutcome {
        match self.sync_all().await {
            Ok(report) => {
                let pushed: usize = report.tables.iter().map(|t| t.pushed + t.deleted_remote).sum();
                let pulled: usize = report.tables.iter().map(|t| t.inserted + t.updated).sum();
                SyncOutcome {
                    success: true,
                    message: format!("同步完成：推送 {} 条，拉取 {} 条", pushed, pulled),
                }
            }
            Err(e) => SyncOutcome {
                success: false,
                message: format!("{:#}", e),
            },
        }
    }

    /// 同步日志写入失败不影响同步本身
    async fn write_sync_log(
        &self,
        id: &str,
        status: SyncStatus,
        details: Option<Value>,
        error_details: Option<String>,
    ) {
        let entry = SyncLogEntry {
            id: Some(id.to_string()),
            user_id: self.config.user_id.clone(),
            status,
            details,
            error_details,
            last_sync: now_utc(),
        };
        if let Err(e) = self.api.upsert_sync_log(&entry).await {
            warn!("[Sync] 写入同步日志失败: {}", e);
        }
    }

    /// 最近一次同步时间
    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let entry = self
            .api
            .latest_sync_log()
            .await
            .context("读取同步日志失败")?;
        Ok(entry.map(|e| e.last_sync))
    }

    /// 在远端级联删除项目（RPC），返回各表删除行数
    pub async fn delete_project_remote(&self, project_id: &str) -> Result<CascadeSummary> {
        let summary = self
            .api
            .delete_project_cascade(project_id)
            .await
            .context(format!("远端删除项目 {} 失败", project_id))?;
        info!(
            "[Sync] 远端删除项目 {}，共 {} 行，耗时 {:?} ms",
            project_id,
            summary.total(),
            summary.execution_time_ms
        );
        Ok(summary)
    }

    /// 同步客户收藏：上传本地收藏，再以远端列表为准设置本地标记
    pub async fn sync_favorites(&self) -> Result<usize> {
        let clients = SqliteCollection::<Client>::new(self.records.clone());
        let local = clients.get_all().await?;
        let favorites: Vec<String> = local
            .iter()
            .filter(|c| c.favorite)
            .map(|c| c.id.clone())
            .collect();
        self.api
            .upsert_favorites(&favorites)
            .await
            .context("上传收藏失败")?;

        let remote: HashSet<String> = self
            .api
            .fetch_favorite_ids()
            .await
            .context("拉取收藏失败")?
            .into_iter()
            .collect();

        let mut changed = 0;
        for client in local {
            let favorite = remote.contains(&client.id);
            if client.favorite != favorite {
                clients
                    .update(&client.id, json!({ "favorite": favorite }))
                    .await?;
                changed += 1;
            }
        }
        info!(
            "[Sync] ⭐ 收藏同步完成，远端 {} 条，本地更新 {} 条",
            remote.len(),
            changed
        );
        Ok(changed)
    }

    /// 启动定时同步任务
    pub fn start_auto_sync(self: &Arc<Self>, period: Duration) -> AutoSyncHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let syncer = self.clone();
        let task = tokio::spawn(async move {
            info!("[Sync] ⏱️ 启动定时同步，间隔 {:?}", period);
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match syncer.sync_all().await {
                            Ok(_) => debug!("[Sync] 定时同步完成"),
                            Err(e) => error!("[Sync] 定时同步失败: {:#}", e),
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("[Sync] 定时同步已停止");
        });
        AutoSyncHandle { stop_tx, task }
    }
}

/// 定时同步任务句柄
pub struct AutoSyncHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    /// 停止定时同步并等待正在进行的同步结束
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("[Sync] 定时同步任务异常退出: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
