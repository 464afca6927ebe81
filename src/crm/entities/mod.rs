//! CRM 实体定义
//!
//! 所有实体都以 JSON 形式存入本地集合存储，并以同样的 JSON 形状镜像到远端表。
//! 可选字段序列化为 `null`（不省略），列表字段在读取旧数据时默认为 `[]`。

pub mod client;
pub mod company;
pub mod insight;
pub mod project;
pub mod property;
pub mod task;

use crate::crm::error::StoreResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use client::{Client, ClientStatus};
pub use company::Company;
pub use insight::AIProjectInsight;
pub use project::{Project, ProjectStatus};
pub use property::{Property, PropertyStatus};
pub use task::{Task, TaskPriority, TaskStatus};

/// 集合（实体类型）标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Companies,
    Projects,
    Properties,
    Clients,
    Tasks,
    ProjectInsights,
}

impl Collection {
    /// 父表在前，推送 upsert 时按此顺序，删除时逆序
    pub const ALL: [Collection; 6] = [
        Collection::Companies,
        Collection::Projects,
        Collection::Properties,
        Collection::Clients,
        Collection::Tasks,
        Collection::ProjectInsights,
    ];

    /// 本地存储键
    pub fn storage_key(&self) -> &'static str {
        match self {
            Collection::Companies => "companies",
            Collection::Projects => "projects",
            Collection::Properties => "properties",
            Collection::Clients => "clients",
            Collection::Tasks => "tasks",
            Collection::ProjectInsights => "project_insights",
        }
    }

    /// 远端表名
    pub fn remote_table(&self) -> &'static str {
        match self {
            Collection::ProjectInsights => "ai_project_insights",
            other => other.storage_key(),
        }
    }

    pub fn from_remote_table(table: &str) -> Option<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.remote_table() == table)
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        Collection::ALL.into_iter().find(|c| c.storage_key() == key)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.storage_key())
    }
}

/// 可存入集合存储的实体
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn created_at(&self) -> DateTime<Utc>;
    fn set_created_at(&mut self, ts: DateTime<Utc>);
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_updated_at(&mut self, ts: DateTime<Utc>);

    /// 必填字段校验
    fn validate(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// 为带有 `id` / `created_at` / `updated_at` 字段的结构体实现 [`Entity`]
macro_rules! impl_entity {
    ($ty:ty, $collection:expr, |$this:ident| $validate:block) => {
        impl $crate::crm::entities::Entity for $ty {
            const COLLECTION: $crate::crm::entities::Collection = $collection;

            fn id(&self) -> &str {
                &self.id
            }
            fn set_id(&mut self, id: String) {
                self.id = id;
            }
            fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.created_at
            }
            fn set_created_at(&mut self, ts: chrono::DateTime<chrono::Utc>) {
                self.created_at = ts;
            }
            fn updated_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.updated_at
            }
            fn set_updated_at(&mut self, ts: chrono::DateTime<chrono::Utc>) {
                self.updated_at = ts;
            }
            fn validate(&self) -> $crate::crm::error::StoreResult<()> {
                let $this = self;
                $validate
            }
        }
    };
}
pub(crate) use impl_entity;

/// 必填字符串字段校验
pub(crate) fn require_text(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(crate::crm::error::StoreError::Validation(format!(
            "{} 不能为空",
            field
        )));
    }
    Ok(())
}

/// 将状态字符串规范化：小写，`-`/空格 转为 `_`，驼峰拆分
pub(crate) fn normalize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    for (i, c) in raw.trim().chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' || c == ' ' {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insights_live_in_their_own_remote_table() {
        assert_eq!(Collection::ProjectInsights.storage_key(), "project_insights");
        assert_eq!(Collection::ProjectInsights.remote_table(), "ai_project_insights");
        assert_eq!(
            Collection::from_remote_table("ai_project_insights"),
            Some(Collection::ProjectInsights)
        );
        assert_eq!(Collection::from_remote_table("notes"), None);
    }

    #[test]
    fn tokens_normalize_across_spellings() {
        assert_eq!(normalize_token("in-progress"), "in_progress");
        assert_eq!(normalize_token("In Progress"), "in_progress");
        assert_eq!(normalize_token("inProgress"), "in_progress");
        assert_eq!(normalize_token("underContract"), "under_contract");
        assert_eq!(normalize_token("on_hold"), "on_hold");
    }
}
