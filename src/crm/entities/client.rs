//! 客户实体（销售线索）

use super::{impl_entity, normalize_token, require_text, Collection};
use crate::crm::serialization::{deserialize_null_default, deserialize_vec_or_null};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// 客户跟进阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientStatus {
    #[default]
    New,
    Potential,
    Interested,
    Responded,
    NoResponse,
    MeetingScheduled,
    MeetingDone,
    Negotiation,
    Reserved,
    Sold,
    Postponed,
    Cancelled,
}

impl ClientStatus {
    pub const ALL: [ClientStatus; 12] = [
        ClientStatus::New,
        ClientStatus::Potential,
        ClientStatus::Interested,
        ClientStatus::Responded,
        ClientStatus::NoResponse,
        ClientStatus::MeetingScheduled,
        ClientStatus::MeetingDone,
        ClientStatus::Negotiation,
        ClientStatus::Reserved,
        ClientStatus::Sold,
        ClientStatus::Postponed,
        ClientStatus::Cancelled,
    ];
}

impl FromStr for ClientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match normalize_token(s).as_str() {
            "new" => ClientStatus::New,
            "potential" => ClientStatus::Potential,
            "interested" => ClientStatus::Interested,
            "responded" => ClientStatus::Responded,
            "no_response" | "not_responded" => ClientStatus::NoResponse,
            "meeting_scheduled" => ClientStatus::MeetingScheduled,
            "meeting_done" => ClientStatus::MeetingDone,
            "negotiation" => ClientStatus::Negotiation,
            "reserved" => ClientStatus::Reserved,
            "sold" => ClientStatus::Sold,
            "postponed" => ClientStatus::Postponed,
            "cancelled" | "canceled" => ClientStatus::Cancelled,
            _ => return Err(format!("未知的客户状态: {}", s)),
        };
        Ok(status)
    }
}

impl<'de> Deserialize<'de> for ClientStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn default_country() -> Option<String> {
    Some("Egypt".to_string())
}

fn default_contact_method() -> Option<String> {
    Some("phone".to_string())
}

/// 客户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// 去重键（导入时按电话号码去重）
    pub phone: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub status: ClientStatus,
    #[serde(default = "default_country")]
    pub country: Option<String>,
    #[serde(default = "default_contact_method")]
    pub contact_method: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub facebook: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub favorite: bool,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            phone: phone.into(),
            status: ClientStatus::New,
            country: default_country(),
            contact_method: default_contact_method(),
            email: None,
            facebook: None,
            city: None,
            project: None,
            budget: None,
            campaign: None,
            assigned_to: None,
            favorite: false,
            comments: Vec::new(),
            user_id: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

/// 电话号码归一化：去掉空白、`-`、括号，用于去重比较
pub fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '.'))
        .collect()
}

impl_entity!(Client, Collection::Clients, |client| {
    require_text("name", &client.name)?;
    require_text("phone", &client.phone)?;
    Ok(())
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn twelve_pipeline_stages_round_trip() {
        for status in ClientStatus::ALL {
            let v = serde_json::to_value(status).unwrap();
            let back: ClientStatus = serde_json::from_value(v).unwrap();
            assert_eq!(back, status);
        }
        let s: ClientStatus = serde_json::from_value(json!("meeting-scheduled")).unwrap();
        assert_eq!(s, ClientStatus::MeetingScheduled);
    }

    #[test]
    fn legacy_rows_get_defaults() {
        let c: Client = serde_json::from_value(json!({
            "id": "c1",
            "name": "Sara",
            "phone": "0100 123 4567",
            "comments": null
        }))
        .unwrap();
        assert_eq!(c.country.as_deref(), Some("Egypt"));
        assert_eq!(c.contact_method.as_deref(), Some("phone"));
        assert_eq!(c.status, ClientStatus::New);
        assert!(c.comments.is_empty());
        assert!(!c.favorite);
    }

    #[test]
    fn null_columns_read_as_defaults() {
        let c: Client = serde_json::from_value(json!({
            "id": "c1",
            "name": "Hany",
            "phone": "01001112222",
            "status": null,
            "favorite": null
        }))
        .unwrap();
        assert_eq!(c.status, ClientStatus::New);
        assert!(!c.favorite);
    }

    #[test]
    fn phones_normalize() {
        assert_eq!(normalize_phone(" 0100-123 (45) 67 "), "01001234567");
    }
}
