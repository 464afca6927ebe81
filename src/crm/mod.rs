pub mod auth;
pub mod db;
pub mod entities;
pub mod error;
pub mod export;
pub mod import;
pub mod realtime;
pub mod relations;
pub mod serialization;
pub mod store;
pub mod sync;
pub mod types;
pub mod workspace;

// 重新导出认证相关函数
pub use auth::sign_in_with_password;

// 重新导出常用的存储与同步类型
pub use error::{ErrorKind, StoreError, StoreResult};
pub use relations::{CascadeSummary, ReferentialAction, RelationManager};
pub use store::{CollectionRepository, MemoryCollection, RecordDao, SqliteCollection};
pub use sync::{MirrorSyncer, SyncConfig, SyncListener, SyncOutcome, SyncReport};
pub use workspace::{Workspace, WorkspaceConfig};
