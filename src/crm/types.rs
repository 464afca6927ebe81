//! 远端 HTTP 通用类型：PostgREST 错误体、统一响应处理、重试策略

use crate::crm::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, warn};

/// PostgREST / Supabase 返回的错误体
#[derive(Debug, Default, Deserialize)]
pub struct PostgrestError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl PostgrestError {
    /// 把非 2xx 响应转换为 [`StoreError::Remote`]，错误体不是 JSON 时原样保留
    pub fn into_store_error(body: &str, status: u16) -> StoreError {
        let parsed: PostgrestError = serde_json::from_str(body).unwrap_or_default();
        let mut message = parsed.message.unwrap_or_else(|| body.to_string());
        if let Some(details) = parsed.details.filter(|d| !d.is_empty()) {
            message = format!("{} ({})", message, details);
        }
        StoreError::Remote {
            status,
            code: parsed.code.unwrap_or_default(),
            message,
        }
    }
}

/// 读取响应 body，非 2xx 时转换为远端错误
async fn read_body(response: reqwest::Response, operation_name: &str) -> StoreResult<Vec<u8>> {
    let status = response.status();
    // body 只能读取一次
    let body_bytes = response.bytes().await?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(PostgrestError::into_store_error(&body_str, status.as_u16()));
    }
    debug!(
        "[HTTP] {}请求成功，HTTP状态: {}，响应 {} 字节",
        operation_name,
        status,
        body_bytes.len()
    );
    Ok(body_bytes.to_vec())
}

/// 通用 HTTP 响应处理：检查状态码并反序列化 body
pub async fn handle_http_response<T: DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> StoreResult<T> {
    let body = read_body(response, operation_name).await?;
    serde_json::from_slice(&body).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name,
            e,
            String::from_utf8_lossy(&body)
        );
        StoreError::Serialization(e)
    })
}

/// 只检查状态码（`Prefer: return=minimal` 时 body 为空）
pub async fn check_http_response(response: reqwest::Response, operation_name: &str) -> StoreResult<()> {
    read_body(response, operation_name).await.map(|_| ())
}

/// 重试策略：线性退避，只对网络错误和 5xx 重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// 发送请求并按策略重试
///
/// `build` 每次尝试都会重新构造请求。4xx 响应原样返回给调用方处理，
/// 5xx 与网络错误在用尽重试次数后返回错误。
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    operation_name: &str,
    build: F,
) -> StoreResult<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match build().send().await {
            Ok(response) if response.status().is_server_error() => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                PostgrestError::into_store_error(&body, status)
            }
            Ok(response) => return Ok(response),
            Err(e) => StoreError::from(e),
        };

        if !err.is_retryable() || attempt >= max_attempts {
            error!(
                "[HTTP] {}失败（第 {}/{} 次）: {}",
                operation_name, attempt, max_attempts, err
            );
            return Err(err);
        }
        let delay = policy.delay_for(attempt);
        warn!(
            "[HTTP] {}失败（第 {}/{} 次），{:?} 后重试: {}",
            operation_name, attempt, max_attempts, delay, err
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
        }
    }

    /// 前 `failures` 次返回 503，之后返回 200
    struct Flaky {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl Respond for Flaky {
        fn respond(&self, _: &Request) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ResponseTemplate::new(503).set_body_string("upstream busy")
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!([]))
            }
        }
    }

    #[test]
    fn linear_backoff() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
    }

    #[test]
    fn postgrest_error_bodies_are_parsed() {
        let err = PostgrestError::into_store_error(
            r#"{"code":"23503","message":"violates foreign key","details":"Key (company_id)"}"#,
            409,
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("Key (company_id)"));
        let err = PostgrestError::into_store_error("<html>bad gateway</html>", 502);
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/rest/v1/clients"))
            .respond_with(Flaky {
                calls: calls.clone(),
                failures: 2,
            })
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let url = format!("{}/rest/v1/clients", server.uri());
        let response = send_with_retry(&fast(), "拉取客户", || http.get(&url))
            .await
            .unwrap();
        let rows: Vec<serde_json::Value> = handle_http_response(response, "拉取客户").await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_give_up_after_max_attempts() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .respond_with(Flaky {
                calls: calls.clone(),
                failures: 10,
            })
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = send_with_retry(&fast(), "拉取", || http.get(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"message": "JWT expired"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let response = send_with_retry(&fast(), "拉取", || http.get(server.uri()))
            .await
            .unwrap();
        let err = check_http_response(response, "拉取").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
