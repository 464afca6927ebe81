//! 同步本地模型定义

use crate::crm::types::RetryPolicy;

/// 每张远端表的同步游标（对应 `local_sync_cursor` 表）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub table_name: String,
    pub user_id: String,
    /// 已拉取到的远端 `last_synced` 高水位（固定宽度 UTC 格式）
    ///
    /// `last_synced` 在推送时盖章，离线编辑晚推送的行也一定比旧游标新；
    /// `updated_at` 是编辑时刻，不能用作游标。
    pub high_water: String,
    pub last_synced_at: String,
}

/// 同步器配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 用户 ID（远端行级权限按它过滤）
    pub user_id: String,
    /// API 基础 URL，例如 `https://xyz.supabase.co`
    pub api_base_url: String,
    /// 项目公开 key（`apikey` 请求头）
    pub api_key: String,
    /// 登录后的访问令牌
    pub access_token: String,
    pub retry: RetryPolicy,
    /// 分页拉取的每页行数
    pub page_size: usize,
}

impl SyncConfig {
    pub fn new(
        api_base_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: access_token.into(),
            retry: RetryPolicy::default(),
            page_size: 1000,
        }
    }
}
