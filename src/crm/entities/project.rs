//! 项目实体

use super::{impl_entity, normalize_token, require_text, Collection};
use crate::crm::error::StoreError;
use crate::crm::serialization::{
    deserialize_flexible_f64, deserialize_null_default, deserialize_vec_or_null,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// 项目状态
///
/// 历史数据中存在 `in_progress` / `in-progress` / `active`、`on-hold` 等多种写法，
/// 读取时统一归一到这里的规范值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Planning,
    InProgress,
    Completed,
    OnHold,
    Cancelled,
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "planning" | "pending" | "planned" => Ok(ProjectStatus::Planning),
            "in_progress" | "active" | "ongoing" => Ok(ProjectStatus::InProgress),
            "completed" | "done" | "finished" => Ok(ProjectStatus::Completed),
            "on_hold" | "paused" => Ok(ProjectStatus::OnHold),
            "cancelled" | "canceled" => Ok(ProjectStatus::Cancelled),
            _ => Err(format!("未知的项目状态: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for ProjectStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl ProjectStatus {
    pub fn label(&self, arabic: bool) -> &'static str {
        match (self, arabic) {
            (ProjectStatus::Planning, false) => "Planning",
            (ProjectStatus::Planning, true) => "قيد التخطيط",
            (ProjectStatus::InProgress, false) => "In Progress",
            (ProjectStatus::InProgress, true) => "قيد التنفيذ",
            (ProjectStatus::Completed, false) => "Completed",
            (ProjectStatus::Completed, true) => "مكتمل",
            (ProjectStatus::OnHold, false) => "On Hold",
            (ProjectStatus::OnHold, true) => "معلق",
            (ProjectStatus::Cancelled, false) => "Cancelled",
            (ProjectStatus::Cancelled, true) => "ملغي",
        }
    }
}

/// 房地产项目，可归属某个公司（`company_id`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub company_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub manager: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub status: ProjectStatus,
    #[serde(default, deserialize_with = "deserialize_flexible_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_flexible_f64")]
    pub project_area: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// 图片 URL 或 base64
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub images: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            company_id: None,
            name: name.into(),
            description: None,
            project_type: None,
            manager: None,
            status: ProjectStatus::default(),
            price: None,
            project_area: None,
            location: None,
            start_date: None,
            end_date: None,
            images: Vec::new(),
            user_id: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn for_company(name: impl Into<String>, company_id: impl Into<String>) -> Self {
        let mut project = Self::new(name);
        project.company_id = Some(company_id.into());
        project
    }
}

impl_entity!(Project, Collection::Projects, |project| {
    require_text("name", &project.name)?;
    if let Some(price) = project.price {
        if price < 0.0 {
            return Err(StoreError::Validation("price 不能为负数".to_string()));
        }
    }
    if let (Some(start), Some(end)) = (project.start_date.as_deref(), project.end_date.as_deref()) {
        // 日期均为 YYYY-MM-DD，字典序即时间序
        if !start.is_empty() && !end.is_empty() && end < start {
            return Err(StoreError::Validation(format!(
                "end_date ({}) 早于 start_date ({})",
                end, start
            )));
        }
    }
    Ok(())
});
