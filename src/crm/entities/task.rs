//! 任务实体

use super::{impl_entity, normalize_token, require_text, Collection};
use crate::crm::serialization::deserialize_null_default;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "pending" | "todo" | "new" => Ok(TaskStatus::Pending),
            "in_progress" | "active" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            _ => Err(format!("未知的任务状态: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// 任务，可关联项目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            description: None,
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            due_date: None,
            project_id: None,
            assigned_to: None,
            user_id: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl_entity!(Task, Collection::Tasks, |task| {
    require_text("title", &task.title)
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::entities::Entity;
    use serde_json::json;

    #[test]
    fn legacy_statuses_and_missing_fields() {
        let task: Task = serde_json::from_value(json!({
            "id": "t1",
            "title": "Call back",
            "status": "in-progress",
            "priority": "high"
        }))
        .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.project_id, None);

        let back: Task = serde_json::from_value(serde_json::to_value(&task).unwrap()).unwrap();
        assert_eq!(back, task);
        assert!(serde_json::from_value::<Task>(json!({"title": "x", "status": "blocked"})).is_err());
    }

    #[test]
    fn full_task_survives_json() {
        let mut task = Task::new("Site visit");
        task.id = "t9".into();
        task.description = Some("Bring the brochure".into());
        task.status = TaskStatus::Completed;
        task.priority = TaskPriority::Low;
        task.due_date = Some("2024-12-20".into());
        task.project_id = Some("p1".into());
        task.assigned_to = Some("Mona".into());
        task.user_id = Some("u1".into());
        task.created_at = "2024-12-13T10:00:00.123456Z".parse().unwrap();
        task.updated_at = "2024-12-14T08:30:00Z".parse().unwrap();

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["status"], json!("completed"));
        assert_eq!(value["priority"], json!("low"));
        assert_eq!(value["project_id"], json!("p1"));
        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn null_status_and_priority_read_as_defaults() {
        let task: Task = serde_json::from_value(json!({
            "title": "x", "status": null, "priority": null
        }))
        .unwrap();
        assert_eq!(task.status, TaskStatus::default());
        assert_eq!(task.priority, TaskPriority::Medium);
    }

    #[test]
    fn title_is_required() {
        assert!(Task::new("Visit site").validate().is_ok());
        assert!(Task::new("").validate().is_err());
    }
}
