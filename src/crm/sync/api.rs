//! 远端表 HTTP API 客户端（PostgREST）
//!
//! 负责所有远端表的读写请求，统一带上 `apikey` 与 `Authorization` 请求头。

use crate::crm::error::{ErrorKind, StoreError, StoreResult};
use crate::crm::relations::CascadeSummary;
use crate::crm::sync::models::SyncConfig;
use crate::crm::sync::types::SyncLogEntry;
use crate::crm::types::{check_http_response, handle_http_response, send_with_retry, RetryPolicy};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单次 upsert 请求的最大行数
const UPSERT_CHUNK: usize = 500;

/// 远端表 API 客户端
#[derive(Clone)]
pub struct RemoteTableApi {
    client: reqwest::Client,
    api_base_url: String,
    user_id: String,
    retry: RetryPolicy,
    page_size: usize,
}

impl RemoteTableApi {
    /// 创建新的远端 API 客户端
    ///
    /// `client` 应该已经在外部配置好认证请求头
    pub fn new(client: reqwest::Client, config: &SyncConfig) -> Self {
        Self {
            client,
            api_base_url: config.api_base_url.clone(),
            user_id: config.user_id.clone(),
            retry: config.retry,
            page_size: config.page_size.max(1),
        }
    }

    /// 按配置创建带认证请求头的 HTTP 客户端
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = HeaderMap::new();
                headers.insert(
                    HeaderName::from_static("apikey"),
                    HeaderValue::from_str(&config.api_key).context("无效的 apikey")?,
                );
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", config.access_token))
                        .context("无效的 access token")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self::new(http_client, config))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_base_url, table)
    }

    /// 批量 upsert（`on_conflict=id`，冲突时合并）
    pub async fn upsert_rows(&self, table: &str, rows: &[Value]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table);
        let operation = format!("推送 {}", table);
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let operation_id = Uuid::new_v4().to_string();
            debug!(
                "[SyncAPI] 📤 upsert {} 行到 {}，操作ID: {}",
                chunk.len(),
                table,
                operation_id
            );
            let response = send_with_retry(&self.retry, &operation, || {
                self.client
                    .post(&url)
                    .query(&[("on_conflict", "id")])
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .header("operationID", &operation_id)
                    .json(chunk)
            })
            .await?;
            check_http_response(response, &operation).await?;
        }
        info!("[SyncAPI] ✅ {} 推送完成，共 {} 行", table, rows.len());
        Ok(())
    }

    /// 拉取当前用户的远端行（按 created_at 倒序，分页）
    ///
    /// `since` 为游标时只返回 `last_synced` 更晚的行。
    /// 排序带 `id` 作为次序键，`created_at` 相同的行跨页时不会重复或遗漏。
    pub async fn fetch_rows(&self, table: &str, since: Option<&str>) -> StoreResult<Vec<Value>> {
        let url = self.table_url(table);
        let operation = format!("拉取 {}", table);
        let user_filter = format!("eq.{}", self.user_id);
        let since_filter = since.map(|c| format!("gt.{}", c));

        info!(
            "[SyncAPI] 📡 请求{}同步: {}",
            if since.is_some() { "增量" } else { "全量" },
            table
        );

        let mut rows = Vec::new();
        loop {
            let offset = rows.len().to_string();
            let limit = self.page_size.to_string();
            let response = send_with_retry(&self.retry, &operation, || {
                let mut req = self
                    .client
                    .get(&url)
                    .query(&[
                        ("select", "*"),
                        ("user_id", user_filter.as_str()),
                        ("order", "created_at.desc,id.desc"),
                        ("limit", limit.as_str()),
                        ("offset", offset.as_str()),
                    ]);
                if let Some(filter) = &since_filter {
                    req = req.query(&[("last_synced", filter.as_str())]);
                }
                req
            })
            .await?;
            let page: Vec<Value> = handle_http_response(response, &operation).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < self.page_size {
                break;
            }
        }
        debug!("[SyncAPI] {} 拉取到 {} 行", table, rows.len());
        Ok(rows)
    }

    /// 按 id 删除远端行
    pub async fn delete_rows(&self, table: &str, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table);
        let operation = format!("删除 {}", table);
        let quoted: Vec<String> = ids.iter().map(|id| format!("\"{}\"", id)).collect();
        let id_filter = format!("in.({})", quoted.join(","));
        let user_filter = format!("eq.{}", self.user_id);

        let response = send_with_retry(&self.retry, &operation, || {
            self.client
                .delete(&url)
                .query(&[("id", id_filter.as_str()), ("user_id", user_filter.as_str())])
        })
        .await?;
        check_http_response(response, &operation).await?;
        info!("[SyncAPI] 🗑️ {} 远端删除 {} 行", table, ids.len());
        Ok(())
    }

    /// 写入（或更新）一条同步日志
    pub async fn upsert_sync_log(&self, entry: &SyncLogEntry) -> StoreResult<()> {
        self.upsert_rows("sync_logs", &[serde_json::to_value(entry)?])
            .await
    }

    /// 最近一次同步日志；远端没有 `sync_logs` 表时返回 None
    pub async fn latest_sync_log(&self) -> StoreResult<Option<SyncLogEntry>> {
        let url = self.table_url("sync_logs");
        let user_filter = format!("eq.{}", self.user_id);
        let result = async {
            let response = send_with_retry(&self.retry, "读取同步日志", || {
                self.client.get(&url).query(&[
                    ("select", "*"),
                    ("user_id", user_filter.as_str()),
                    ("order", "last_sync.desc"),
                    ("limit", "1"),
                ])
            })
            .await?;
            handle_http_response::<Vec<SyncLogEntry>>(response, "读取同步日志").await
        }
        .await;

        match result {
            Ok(rows) => Ok(rows.into_iter().next()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("[SyncAPI] 远端没有 sync_logs 表: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 调用 `delete_project_cascade` RPC，在远端删除项目及其依赖
    pub async fn delete_project_cascade(&self, project_id: &str) -> StoreResult<CascadeSummary> {
        let url = format!("{}/rest/v1/rpc/delete_project_cascade", self.api_base_url);
        let body = json!({ "p_project_id": project_id });
        let response = send_with_retry(&self.retry, "远端级联删除项目", || {
            self.client.post(&url).json(&body)
        })
        .await?;
        handle_http_response(response, "远端级联删除项目").await
    }

    /// 上传收藏的客户 id，重复收藏（23505）忽略
    pub async fn upsert_favorites(&self, client_ids: &[String]) -> StoreResult<()> {
        if client_ids.is_empty() {
            return Ok(());
        }
        let url = self.table_url("client_favorites");
        let rows: Vec<Value> = client_ids
            .iter()
            .map(|id| json!({ "client_id": id, "user_id": self.user_id }))
            .collect();
        let response = send_with_retry(&self.retry, "上传收藏", || {
            self.client
                .post(&url)
                .query(&[("on_conflict", "client_id,user_id")])
                .header("Prefer", "resolution=ignore-duplicates,return=minimal")
                .json(&rows)
        })
        .await?;
        match check_http_response(response, "上传收藏").await {
            Err(StoreError::Remote { code, .. }) if code == "23505" => {
                debug!("[SyncAPI] 收藏已存在，忽略");
                Ok(())
            }
            other => other,
        }
    }

    /// 拉取远端收藏的客户 id
    pub async fn fetch_favorite_ids(&self) -> StoreResult<Vec<String>> {
        #[derive(Deserialize)]
        struct FavoriteRow {
            client_id: String,
        }

        let url = self.table_url("client_favorites");
        let user_filter = format!("eq.{}", self.user_id);
        let response = send_with_retry(&self.retry, "拉取收藏", || {
            self.client
                .get(&url)
                .query(&[("select", "client_id"), ("user_id", user_filter.as_str())])
        })
        .await?;
        let rows: Vec<FavoriteRow> = handle_http_response(response, "拉取收藏").await?;
        Ok(rows.into_iter().map(|r| r.client_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer, page_size: usize) -> RemoteTableApi {
        let mut config = SyncConfig::new(server.uri(), "anon", "jwt", "u1");
        config.retry = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        };
        config.page_size = page_size;
        RemoteTableApi::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn incremental_pull_filters_on_push_stamp_with_stable_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/clients"))
            .and(query_param("user_id", "eq.u1"))
            .and(query_param("order", "created_at.desc,id.desc"))
            .and(query_param("last_synced", "gt.2024-12-13T10:00:00.000000Z"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "c2", "name": "Mona"},
                {"id": "c1", "name": "Omar"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/clients"))
            .and(query_param("order", "created_at.desc,id.desc"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let rows = api_for(&server, 2)
            .fetch_rows("clients", Some("2024-12-13T10:00:00.000000Z"))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
    }
}
