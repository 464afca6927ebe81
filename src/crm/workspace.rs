//! 工作区：本地数据库、仓库、同步器与实时通道的统一入口

use crate::crm::auth::sign_in_with_password;
use crate::crm::db::create_sqlite_pool_with_migration;
use crate::crm::entities::{AIProjectInsight, Client, Company, Entity, Project, Property, Task};
use crate::crm::export::{export_snapshot, restore_snapshot};
use crate::crm::import::{import_clients, parse_import_rows, ImportSummary};
use crate::crm::realtime::{RealtimeConfig, RealtimeFeed, RealtimeHandle};
use crate::crm::relations::RelationManager;
use crate::crm::store::{RecordDao, SqliteCollection};
use crate::crm::sync::{
    AutoSyncHandle, EmptySyncListener, MirrorSyncer, SyncConfig, SyncListener, SyncReport,
};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 默认本地数据库
pub const DEFAULT_DB_URL: &str = "sqlite://crm.db?mode=rwc";

/// 工作区配置
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// 本地 SQLite 数据库 URL
    pub db_url: String,
    /// 远端基础地址，例如 `https://xyz.supabase.co`
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    /// 邮箱密码登录
    pub email: Option<String>,
    pub password: Option<String>,
    /// 已有令牌时跳过登录
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    /// 未设置时由 `api_base_url` 推导
    pub realtime_url: Option<String>,
}

impl WorkspaceConfig {
    /// 仅本地存储的配置
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            api_base_url: None,
            api_key: None,
            email: None,
            password: None,
            access_token: None,
            user_id: None,
            realtime_url: None,
        }
    }

    /// 从环境变量读取配置
    ///
    /// `CRM_DB_URL`、`CRM_API_URL`、`CRM_API_KEY`、`CRM_EMAIL`、`CRM_PASSWORD`、
    /// `CRM_ACCESS_TOKEN`、`CRM_USER_ID`、`CRM_REALTIME_URL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            db_url: get("CRM_DB_URL").unwrap_or_else(|| DEFAULT_DB_URL.to_string()),
            api_base_url: get("CRM_API_URL"),
            api_key: get("CRM_API_KEY"),
            email: get("CRM_EMAIL"),
            password: get("CRM_PASSWORD"),
            access_token: get("CRM_ACCESS_TOKEN"),
            user_id: get("CRM_USER_ID"),
            realtime_url: get("CRM_REALTIME_URL"),
        }
    }

    /// 是否配置了远端
    pub fn has_remote(&self) -> bool {
        self.api_base_url.is_some() && self.api_key.is_some()
    }
}

/// 工作区
pub struct Workspace {
    config: WorkspaceConfig,
    records: RecordDao,
    listener: Arc<dyn SyncListener>,
    syncer: Option<Arc<MirrorSyncer>>,
    realtime_config: Option<RealtimeConfig>,
    auto_sync: Option<AutoSyncHandle>,
    realtime: Option<RealtimeHandle>,
}

impl Workspace {
    /// 打开本地数据库并执行迁移
    pub async fn open(config: WorkspaceConfig) -> Result<Self> {
        info!("[Workspace] 打开本地数据库: {}", config.db_url);
        let pool = create_sqlite_pool_with_migration(&config.db_url).await?;
        Ok(Self {
            config,
            records: RecordDao::new(pool),
            listener: Arc::new(EmptySyncListener),
            syncer: None,
            realtime_config: None,
            auto_sync: None,
            realtime: None,
        })
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn records(&self) -> &RecordDao {
        &self.records
    }

    /// 任意实体的仓库
    pub fn repository<T: Entity>(&self) -> SqliteCollection<T> {
        SqliteCollection::new(self.records.clone())
    }

    pub fn companies(&self) -> SqliteCollection<Company> {
        self.repository()
    }

    pub fn projects(&self) -> SqliteCollection<Project> {
        self.repository()
    }

    pub fn properties(&self) -> SqliteCollection<Property> {
        self.repository()
    }

    pub fn clients(&self) -> SqliteCollection<Client> {
        self.repository()
    }

    pub fn tasks(&self) -> SqliteCollection<Task> {
        self.repository()
    }

    pub fn insights(&self) -> SqliteCollection<AIProjectInsight> {
        self.repository()
    }

    pub fn relations(&self) -> RelationManager {
        RelationManager::new(self.records.clone())
    }

    /// 导入客户文件（JSON 数组），已连接远端时写入当前用户 ID
    pub async fn import_clients(&self, text: &str) -> Result<ImportSummary> {
        let rows = parse_import_rows(text)?;
        let user_id = self.syncer.as_ref().map(|s| s.user_id().to_string());
        let summary = import_clients(&self.clients(), rows, user_id.as_deref()).await?;
        Ok(summary)
    }

    pub async fn export_snapshot(&self) -> Result<String> {
        Ok(export_snapshot(&self.records).await?)
    }

    pub async fn restore_snapshot(&self, encoded: &str) -> Result<u64> {
        Ok(restore_snapshot(&self.records, encoded).await?)
    }

    /// 设置同步监听器（已连接时同时替换同步器上的监听器）
    pub fn set_sync_listener(&mut self, listener: Arc<dyn SyncListener>) {
        if let Some(syncer) = &self.syncer {
            syncer.set_listener(listener.clone());
        }
        self.listener = listener;
    }

    /// 连接远端：有令牌时直接使用，否则用邮箱密码登录
    pub async fn connect_remote(&mut self) -> Result<()> {
        let api_base_url = self
            .config
            .api_base_url
            .clone()
            .ok_or_else(|| anyhow!("未配置远端地址 CRM_API_URL"))?;
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("未配置 CRM_API_KEY"))?;

        let (access_token, user_id) =
            match (&self.config.access_token, &self.config.user_id) {
                (Some(token), Some(user_id)) => (token.clone(), user_id.clone()),
                _ => {
                    let email = self
                        .config
                        .email
                        .clone()
                        .ok_or_else(|| anyhow!("未配置令牌，也未配置 CRM_EMAIL"))?;
                    let password = self
                        .config
                        .password
                        .clone()
                        .ok_or_else(|| anyhow!("未配置 CRM_PASSWORD"))?;
                    let session =
                        sign_in_with_password(&api_base_url, &api_key, email, password).await?;
                    (session.access_token, session.user.id)
                }
            };

        let sync_config = SyncConfig::new(&api_base_url, &api_key, &access_token, &user_id);
        let syncer = MirrorSyncer::with_listener(
            sync_config,
            self.records.clone(),
            self.listener.clone(),
        )
        .context("创建同步器失败")?;

        let mut realtime =
            RealtimeConfig::from_api_base(&api_base_url, &api_key, &access_token, &user_id);
        if let Some(url) = &self.config.realtime_url {
            realtime.realtime_url = url.clone();
        }

        self.syncer = Some(Arc::new(syncer));
        self.realtime_config = Some(realtime);
        info!("[Workspace] ✅ 已连接远端，用户ID: {}", user_id);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.syncer.is_some()
    }

    pub fn syncer(&self) -> Result<Arc<MirrorSyncer>> {
        self.syncer
            .clone()
            .ok_or_else(|| anyhow!("尚未连接远端，请先调用 connect_remote"))
    }

    pub async fn sync_all(&self) -> Result<SyncReport> {
        self.syncer()?.sync_all().await
    }

    /// 启动定时同步；已在运行时先停止旧任务
    pub async fn start_auto_sync(&mut self, period: Duration) -> Result<()> {
        let syncer = self.syncer()?;
        if let Some(handle) = self.auto_sync.take() {
            handle.stop().await;
        }
        self.auto_sync = Some(syncer.start_auto_sync(period));
        Ok(())
    }

    pub async fn stop_auto_sync(&mut self) {
        if let Some(handle) = self.auto_sync.take() {
            handle.stop().await;
        }
    }

    /// 启动实时通道
    pub async fn start_realtime(&mut self) -> Result<()> {
        let syncer = self.syncer()?;
        let config = self
            .realtime_config
            .clone()
            .ok_or_else(|| anyhow!("尚未连接远端，请先调用 connect_remote"))?;
        if let Some(handle) = self.realtime.take() {
            handle.stop().await;
        }
        self.realtime = Some(RealtimeFeed::new(config, syncer).start());
        Ok(())
    }

    pub async fn stop_realtime(&mut self) {
        if let Some(handle) = self.realtime.take() {
            handle.stop().await;
        }
    }

    /// 停止后台任务并关闭连接池
    pub async fn close(mut self) {
        self.stop_auto_sync().await;
        self.stop_realtime().await;
        if self.records.count_dirty().await.unwrap_or(0) > 0 {
            warn!("[Workspace] 关闭时仍有未同步的本地修改");
        }
        self.records.pool().close().await;
        info!("[Workspace] 👋 工作区已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::store::CollectionRepository;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn config_reads_prefixed_variables() {
        let vars: HashMap<&str, &str> = [
            ("CRM_API_URL", "https://xyz.supabase.co"),
            ("CRM_API_KEY", "anon"),
            ("CRM_EMAIL", " agent@example.com "),
            ("CRM_PASSWORD", ""),
        ]
        .into_iter()
        .collect();
        let cfg = WorkspaceConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.db_url, DEFAULT_DB_URL);
        assert_eq!(cfg.email.as_deref(), Some("agent@example.com"));
        assert_eq!(cfg.password, None);
        assert!(cfg.has_remote());
        assert!(!WorkspaceConfig::new("sqlite::memory:").has_remote());
    }

    #[tokio::test]
    async fn local_only_workspace() {
        let ws = Workspace::open(WorkspaceConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        let acme = ws.companies().add(Company::new("Acme")).await.unwrap();
        ws.relations()
            .add_project(Project::for_company("Tower A", &acme.id))
            .await
            .unwrap();
        let summary = ws
            .import_clients(r#"[{"name": "Sara", "phone": "0100"}]"#)
            .await
            .unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(ws.clients().get_all().await.unwrap()[0].user_id, None);

        assert!(!ws.is_connected());
        assert!(ws.sync_all().await.is_err());
        ws.close().await;
    }

    #[tokio::test]
    async fn connect_signs_in_when_no_token_is_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "jwt",
                "user": {"id": "u-7"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = WorkspaceConfig::new("sqlite::memory:");
        cfg.api_base_url = Some(server.uri());
        cfg.api_key = Some("anon".into());
        cfg.email = Some("agent@example.com".into());
        cfg.password = Some("pw".into());

        let mut ws = Workspace::open(cfg).await.unwrap();
        ws.connect_remote().await.unwrap();
        assert_eq!(ws.syncer().unwrap().user_id(), "u-7");

        let summary = ws
            .import_clients(r#"[{"name": "Omar", "phone": "0111"}]"#)
            .await
            .unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(
            ws.clients().get_all().await.unwrap()[0].user_id.as_deref(),
            Some("u-7")
        );
        ws.close().await;
    }

    #[tokio::test]
    async fn connect_requires_credentials() {
        let mut cfg = WorkspaceConfig::new("sqlite::memory:");
        cfg.api_base_url = Some("http://127.0.0.1:9".into());
        cfg.api_key = Some("anon".into());
        let mut ws = Workspace::open(cfg).await.unwrap();
        assert!(ws.connect_remote().await.is_err());
        assert!(ws.start_realtime().await.is_err());
    }
}
