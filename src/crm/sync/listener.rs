//! 同步监听器回调接口

use async_trait::async_trait;

/// 同步监听器，参数均为 JSON 字符串，方便跨语言桥接
#[async_trait]
pub trait SyncListener: Send + Sync {
    async fn on_sync_started(&self);

    /// 单张表同步完成，参数为 `TableSyncStats` JSON
    async fn on_table_synced(&self, stats_json: String);

    /// 本地未推送的修改比远端更新，保留本地版本
    async fn on_conflict(&self, table: String, record_id: String);

    /// 全部同步完成，参数为 `SyncReport` JSON
    async fn on_sync_finished(&self, report_json: String);

    async fn on_sync_failed(&self, error: String);

    /// 实时通道收到并已应用的远端变更，参数为 `RemoteChange` JSON
    async fn on_remote_change(&self, change_json: String);
}

/// 默认空实现（无操作）
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_sync_started(&self) {}

    async fn on_table_synced(&self, _stats_json: String) {}

    async fn on_conflict(&self, _table: String, _record_id: String) {}

    async fn on_sync_finished(&self, _report_json: String) {}

    async fn on_sync_failed(&self, _error: String) {}

    async fn on_remote_change(&self, _change_json: String) {}
}
