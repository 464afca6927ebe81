use crate::crm::types::handle_http_response;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct PasswordSignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// 登录会话（Supabase GoTrue 返回）
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: AuthUser,
}

/// 邮箱密码登录，返回访问令牌和用户 ID
pub async fn sign_in_with_password(
    api_base_url: &str,
    api_key: &str,
    email: String,
    password: String,
) -> anyhow::Result<Session> {
    use anyhow::Context;
    use uuid::Uuid;

    let client = reqwest::Client::new();
    let operation_id = Uuid::new_v4().to_string();
    let url = format!(
        "{}/auth/v1/token?grant_type=password",
        api_base_url.trim_end_matches('/')
    );

    info!("🔐 正在登录...");
    debug!("   URL: {}", url);
    debug!("   邮箱: {}", email);
    debug!("   OperationID: {}", operation_id);

    let response = client
        .post(&url)
        .header("apikey", api_key)
        .header("Content-Type", "application/json")
        .header("operationID", &operation_id)
        .json(&PasswordSignInRequest { email, password })
        .send()
        .await
        .context("登录请求失败")?;

    let session: Session = handle_http_response(response, "登录")
        .await
        .context("登录失败")?;
    debug!("✅ 登录成功，用户ID: {}", session.user.id);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn password_sign_in_returns_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon"))
            .and(body_json(serde_json::json!({"email": "a@b.co", "password": "pw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "jwt",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "r",
                "user": {"id": "u-1", "email": "a@b.co"}
            })))
            .mount(&server)
            .await;

        let session = sign_in_with_password(&server.uri(), "anon", "a@b.co".into(), "pw".into())
            .await
            .unwrap();
        assert_eq!(session.access_token, "jwt");
        assert_eq!(session.user.id, "u-1");
    }

    #[tokio::test]
    async fn bad_credentials_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                serde_json::json!({"error": "invalid_grant", "error_description": "Invalid login credentials"}),
            ))
            .mount(&server)
            .await;
        assert!(sign_in_with_password(&server.uri(), "anon", "a@b.co".into(), "x".into())
            .await
            .is_err());
    }
}
