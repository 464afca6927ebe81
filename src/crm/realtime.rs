//! 实时变更通道
//!
//! 通过 WebSocket 订阅远端表的 `postgres_changes` 事件（Phoenix channel 协议），
//! 把 INSERT / UPDATE 按与拉取相同的后写者胜规则合并到本地，DELETE 在本地没有
//! 未推送修改时删除本地记录。

use crate::crm::entities::Collection;
use crate::crm::sync::MirrorSyncer;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// 订阅的频道名
pub const CHANNEL_TOPIC: &str = "realtime:db-changes";

/// 远端变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 一条远端行变更
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteChange {
    pub collection: Collection,
    pub kind: ChangeKind,
    /// INSERT / UPDATE 的新行
    pub record: Option<Value>,
    /// 变更行的 id（DELETE 时取自 old_record）
    pub id: String,
}

/// 实时通道配置
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// 例如 `wss://xyz.supabase.co/realtime/v1`
    pub realtime_url: String,
    pub api_key: String,
    pub access_token: String,
    pub user_id: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl RealtimeConfig {
    /// 由 REST 基础地址推导实时地址（http → ws，https → wss）
    pub fn from_api_base(
        api_base_url: &str,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let base = api_base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self {
            realtime_url: format!("{}/realtime/v1", ws_base),
            api_key: api_key.into(),
            access_token: access_token.into(),
            user_id: user_id.into(),
            heartbeat_interval: Duration::from_secs(25),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    fn websocket_url(&self) -> String {
        format!(
            "{}/websocket?apikey={}&vsn=1.0.0",
            self.realtime_url.trim_end_matches('/'),
            self.api_key
        )
    }
}

/// 加入频道的消息：订阅所有镜像表中当前用户的行
pub fn join_message(config: &RealtimeConfig) -> String {
    let changes: Vec<Value> = Collection::ALL
        .iter()
        .map(|c| {
            json!({
                "event": "*",
                "schema": "public",
                "table": c.remote_table(),
                "filter": format!("user_id=eq.{}", config.user_id),
            })
        })
        .collect();
    json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": {
            "config": { "postgres_changes": changes },
            "access_token": config.access_token,
        },
        "ref": "1",
    })
    .to_string()
}

/// Phoenix 心跳消息
pub fn heartbeat_message(msg_ref: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
    .to_string()
}

/// 解析一条服务端文本消息；不是行变更（回复、心跳、未知表）时返回 None
pub fn parse_change(text: &str) -> Option<RemoteChange> {
    let msg: Value = serde_json::from_str(text).ok()?;
    let event = msg.get("event")?.as_str()?;
    let payload = msg.get("payload")?;

    // 新协议：event = postgres_changes，数据在 payload.data 中；旧协议直接是 INSERT/UPDATE/DELETE
    let data = match event {
        "postgres_changes" => payload.get("data")?,
        "INSERT" | "UPDATE" | "DELETE" => payload,
        _ => return None,
    };

    let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let collection = Collection::from_remote_table(data.get("table")?.as_str()?)?;
    let record = data.get("record").filter(|r| r.is_object()).cloned();
    let old_record = data.get("old_record").filter(|r| r.is_object());

    let id = match kind {
        ChangeKind::Delete => old_record?.get("id")?.as_str()?.to_string(),
        _ => record.as_ref()?.get("id")?.as_str()?.to_string(),
    };

    Some(RemoteChange {
        collection,
        kind,
        record: if kind == ChangeKind::Delete { None } else { record },
        id,
    })
}

/// 实时通道
#[derive(Clone)]
pub struct RealtimeFeed {
    config: RealtimeConfig,
    syncer: Arc<MirrorSyncer>,
}

impl RealtimeFeed {
    pub fn new(config: RealtimeConfig, syncer: Arc<MirrorSyncer>) -> Self {
        Self { config, syncer }
    }

    /// 启动后台任务，断线后按 `reconnect_delay` 重连，直到句柄被停止
    pub fn start(self) -> RealtimeHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                match self.run_session(&mut stop_rx).await {
                    Ok(true) => break,
                    Ok(false) => warn!("[Realtime] 连接已断开"),
                    Err(e) => error!("[Realtime] 连接错误: {:#}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {
                        info!("[Realtime] 🔁 尝试重新连接");
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("[Realtime] 实时通道已停止");
        });
        RealtimeHandle { stop_tx, task }
    }

    /// 单次连接会话；返回 true 表示收到停止信号
    async fn run_session(&self, stop_rx: &mut watch::Receiver<bool>) -> Result<bool> {
        if *stop_rx.borrow() {
            return Ok(true);
        }
        info!("[Realtime] 🔗 连接实时通道 (user={})", self.config.user_id);
        let (ws_stream, response) = connect_async(self.config.websocket_url())
            .await
            .context("实时通道连接失败")?;
        info!("[Realtime] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (mut write, mut read) = ws_stream.split();
        write
            .send(WsMessage::Text(join_message(&self.config)))
            .await
            .context("发送加入频道消息失败")?;

        let mut ticker = interval(self.config.heartbeat_interval);
        // 第一次 tick 立即返回，跳过
        ticker.tick().await;
        let mut msg_ref: u64 = 1;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(true);
                }
                _ = ticker.tick() => {
                    msg_ref += 1;
                    debug!("[Realtime] 💓 心跳 ref={}", msg_ref);
                    write
                        .send(WsMessage::Text(heartbeat_message(msg_ref)))
                        .await
                        .context("发送心跳失败")?;
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(WsMessage::Close(frame))) => {
                        warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                        return Ok(false);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("读取实时消息失败"),
                    None => return Ok(false),
                },
            }
        }
    }

    /// 处理一条文本消息
    pub(crate) async fn handle_text(&self, text: &str) {
        let Some(change) = parse_change(text) else {
            if text.contains("\"status\":\"error\"") {
                warn!("[Realtime] 服务端返回错误: {}", text);
            } else {
                debug!("[Realtime] 忽略消息: {}", text);
            }
            return;
        };

        let applied = match (change.kind, change.record.clone()) {
            (ChangeKind::Delete, _) => self
                .syncer
                .apply_remote_delete(change.collection, &change.id)
                .await,
            (_, Some(record)) => self
                .syncer
                .apply_remote_row(change.collection, record)
                .await
                .map(|_| true),
            (_, None) => Ok(false),
        };

        match applied {
            Ok(true) => {
                info!(
                    "[Realtime] 📥 {:?} {} {}",
                    change.kind, change.collection, change.id
                );
                if let Ok(json) = serde_json::to_string(&change) {
                    self.syncer.listener().on_remote_change(json).await;
                }
            }
            Ok(false) => {}
            Err(e) => error!(
                "[Realtime] 应用远端变更失败 {} {}: {}",
                change.collection, change.id, e
            ),
        }
    }
}

/// 实时通道任务句柄
pub struct RealtimeHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("[Realtime] 任务异常退出: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::create_sqlite_pool_with_migration;
    use crate::crm::entities::Client;
    use crate::crm::store::{CollectionRepository, RecordDao, SqliteCollection};
    use crate::crm::sync::SyncConfig;
    use tokio::net::TcpListener;

    fn change(table: &str, kind: &str, record: Value, old: Value) -> String {
        json!({
            "topic": CHANNEL_TOPIC,
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "schema": "public",
                    "table": table,
                    "commit_timestamp": "2024-12-13T10:00:00Z",
                    "type": kind,
                    "record": record,
                    "old_record": old,
                },
                "ids": [1]
            },
            "ref": null
        })
        .to_string()
    }

    #[test]
    fn parses_postgres_change_events() {
        let text = change(
            "ai_project_insights",
            "INSERT",
            json!({"id": "i1", "project_id": "p1"}),
            json!({}),
        );
        let c = parse_change(&text).unwrap();
        assert_eq!(c.collection, Collection::ProjectInsights);
        assert_eq!(c.kind, ChangeKind::Insert);
        assert_eq!(c.id, "i1");

        let text = change(
            "clients",
            "DELETE",
            json!(null),
            json!({"id": "c9"}),
        );
        let c = parse_change(&text).unwrap();
        assert_eq!(c.kind, ChangeKind::Delete);
        assert_eq!(c.id, "c9");
        assert!(c.record.is_none());
    }

    #[test]
    fn ignores_replies_and_unknown_tables() {
        assert!(parse_change(r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#).is_none());
        assert!(parse_change("not json").is_none());
        let text = change("notes", "INSERT", json!({"id": "n"}), json!({}));
        assert!(parse_change(&text).is_none());
    }

    #[test]
    fn protocol_messages() {
        let cfg = RealtimeConfig::from_api_base("https://xyz.supabase.co/", "anon", "jwt", "u1");
        assert_eq!(
            cfg.websocket_url(),
            "wss://xyz.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        let join: Value = serde_json::from_str(&join_message(&cfg)).unwrap();
        assert_eq!(join["event"], json!("phx_join"));
        let tables = join["payload"]["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(tables.len(), Collection::ALL.len());
        assert_eq!(tables[0]["filter"], json!("user_id=eq.u1"));
        let hb: Value = serde_json::from_str(&heartbeat_message(7)).unwrap();
        assert_eq!(hb["topic"], json!("phoenix"));
        assert_eq!(hb["ref"], json!("7"));
    }

    async fn feed(realtime_url: String) -> (RealtimeFeed, SqliteCollection<Client>) {
        let pool = create_sqlite_pool_with_migration("sqlite::memory:")
            .await
            .unwrap();
        let records = RecordDao::new(pool);
        let syncer = Arc::new(
            MirrorSyncer::new(
                SyncConfig::new("http://127.0.0.1:9", "anon", "jwt", "u1"),
                records.clone(),
            )
            .unwrap(),
        );
        let mut cfg = RealtimeConfig::from_api_base("http://127.0.0.1:9", "anon", "jwt", "u1");
        cfg.realtime_url = realtime_url;
        (RealtimeFeed::new(cfg, syncer), SqliteCollection::new(records))
    }

    #[tokio::test]
    async fn deletes_skip_rows_with_local_edits() {
        let (feed, clients) = feed("ws://127.0.0.1:9".into()).await;
        let mut remote = serde_json::to_value(Client::new("Sara", "0100")).unwrap();
        remote["id"] = json!("c1");
        remote["updated_at"] = json!("2024-12-13T10:00:00Z");
        feed.handle_text(&change("clients", "INSERT", remote, json!({})))
            .await;
        assert!(clients.get_by_id("c1").await.unwrap().is_some());

        clients.update("c1", json!({"city": "Cairo"})).await.unwrap();
        let delete = change("clients", "DELETE", json!(null), json!({"id": "c1"}));
        feed.handle_text(&delete).await;
        assert!(clients.get_by_id("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn websocket_feed_applies_pushed_changes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let join = ws.next().await.unwrap().unwrap();
            assert!(join.to_text().unwrap().contains("phx_join"));
            let record = json!({
                "id": "c2",
                "name": "Omar",
                "phone": "0111",
                "updated_at": "2024-12-13T10:00:00Z",
                "created_at": "2024-12-13T10:00:00Z"
            });
            ws.send(WsMessage::Text(change(
                "clients",
                "INSERT",
                record,
                json!({}),
            )))
            .await
            .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let (feed, clients) = feed(format!("ws://{}", addr)).await;
        let handle = feed.start();

        let mut found = None;
        for _ in 0..100 {
            found = clients.get_by_id("c2").await.unwrap();
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(found.unwrap().name, "Omar");
        assert!(handle.is_running());
        handle.stop().await;
        server.await.unwrap();
    }
}
