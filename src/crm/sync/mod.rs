//! 云端镜像同步模块
//!
//! 把本地集合存储推送到远端 PostgREST 表，并把远端变更拉回本地。

pub mod api;
pub mod dao;
pub mod listener;
pub mod models;
pub mod service;
pub mod types;

// 重新导出主要类型
pub use api::RemoteTableApi;
pub use dao::SyncStateDao;
pub use listener::{EmptySyncListener, SyncListener};
pub use models::{SyncConfig, SyncCursor};
pub use service::{AutoSyncHandle, MirrorSyncer};
pub use types::{SyncLogEntry, SyncOutcome, SyncReport, SyncStatus, TableSyncStats};
