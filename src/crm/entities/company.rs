//! 公司实体

use super::{impl_entity, require_text, Collection};
use crate::crm::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 公司（开发商），拥有零个或多个项目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Logo 地址或 base64
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Company {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: None,
            email: None,
            phone: None,
            address: None,
            logo: None,
            user_id: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl_entity!(Company, Collection::Companies, |company| {
    require_text("name", &company.name)?;
    if let Some(email) = company.email.as_deref() {
        if !email.is_empty() && !email.contains('@') {
            return Err(StoreError::Validation(format!("邮箱格式不正确: {}", email)));
        }
    }
    Ok(())
});
