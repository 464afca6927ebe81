//! 数据层错误类型
//!
//! 数据访问函数统一返回 [`StoreError`]，调用方通过 [`StoreError::kind`] 分支处理，
//! 不再依赖错误字符串匹配。

use thiserror::Error;

/// 错误类别标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Network,
    Validation,
    PermissionDenied,
    Unauthorized,
    Storage,
    Serialization,
}

/// 数据层错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} 记录不存在: {id}")]
    NotFound { collection: &'static str, id: String },

    #[error("数据冲突: {0}")]
    Conflict(String),

    #[error("校验失败: {0}")]
    Validation(String),

    #[error("网络错误: {0}")]
    Network(String),

    /// 远端（PostgREST）返回的错误，`code` 为 Postgres / PostgREST 错误码
    #[error("远端错误 HTTP {status} [{code}]: {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    #[error("数据库错误: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(collection: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection,
            id: id.into(),
        }
    }

    /// 错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Network(_) => ErrorKind::Network,
            StoreError::Remote { status, code, .. } => remote_kind(*status, code),
            StoreError::Storage(_) => ErrorKind::Storage,
            StoreError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// 是否值得重试（网络错误或服务端 5xx）
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(_) => true,
            StoreError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// 将 HTTP 状态码 / Postgres 错误码映射为错误类别
fn remote_kind(status: u16, code: &str) -> ErrorKind {
    match code {
        // 外键约束 / 唯一约束
        "23503" | "23505" => return ErrorKind::Conflict,
        // RLS 拒绝
        "42501" => return ErrorKind::PermissionDenied,
        // .single() 没有返回行
        "PGRST116" => return ErrorKind::NotFound,
        "42P01" => return ErrorKind::NotFound,
        _ => {}
    }
    match status {
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        s if s >= 500 => ErrorKind::Network,
        _ => ErrorKind::Validation,
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Network(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(status: u16, code: &str) -> StoreError {
        StoreError::Remote {
            status,
            code: code.to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn postgres_codes_take_precedence_over_status() {
        assert_eq!(remote(409, "23503").kind(), ErrorKind::Conflict);
        assert_eq!(remote(400, "23505").kind(), ErrorKind::Conflict);
        assert_eq!(remote(403, "42501").kind(), ErrorKind::PermissionDenied);
        assert_eq!(remote(406, "PGRST116").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn status_fallbacks() {
        assert_eq!(remote(401, "").kind(), ErrorKind::Unauthorized);
        assert_eq!(remote(404, "").kind(), ErrorKind::NotFound);
        assert_eq!(remote(503, "").kind(), ErrorKind::Network);
        assert_eq!(remote(400, "22P02").kind(), ErrorKind::Validation);
    }

    #[test]
    fn only_network_and_server_errors_retry() {
        assert!(StoreError::Network("reset".into()).is_retryable());
        assert!(remote(502, "").is_retryable());
        assert!(!remote(401, "").is_retryable());
        assert!(!StoreError::not_found("clients", "x").is_retryable());
    }
}
