//! AI 项目洞察

use super::{impl_entity, require_text, Collection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 针对某个项目生成的洞察，`payload` 为自由格式 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIProjectInsight {
    #[serde(default)]
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub insight_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl AIProjectInsight {
    pub fn new(project_id: impl Into<String>, insight_type: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            project_id: project_id.into(),
            insight_type: insight_type.into(),
            content: String::new(),
            payload: serde_json::Value::Null,
            user_id: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl_entity!(AIProjectInsight, Collection::ProjectInsights, |insight| {
    require_text("project_id", &insight.project_id)
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn free_form_payload_round_trips() {
        let mut i = AIProjectInsight::new("p1", "pricing");
        i.payload = json!({"score": 0.82, "tags": ["demand", "roi"], "nested": {"x": null}});
        let back: AIProjectInsight =
            serde_json::from_str(&serde_json::to_string(&i).unwrap()).unwrap();
        assert_eq!(back, i);
    }
}
