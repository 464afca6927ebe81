//! 房源实体

use super::{impl_entity, normalize_token, require_text, Collection};
use crate::crm::error::StoreError;
use crate::crm::serialization::{
    deserialize_flexible_f64, deserialize_null_default, deserialize_vec_or_null,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// 房源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyStatus {
    #[default]
    Available,
    Sold,
    Rented,
    UnderContract,
}

impl FromStr for PropertyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "available" => Ok(PropertyStatus::Available),
            "sold" => Ok(PropertyStatus::Sold),
            "rented" => Ok(PropertyStatus::Rented),
            "under_contract" => Ok(PropertyStatus::UnderContract),
            _ => Err(format!("未知的房源状态: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for PropertyStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl PropertyStatus {
    pub fn label(&self, arabic: bool) -> &'static str {
        match (self, arabic) {
            (PropertyStatus::Available, false) => "Available",
            (PropertyStatus::Available, true) => "متاح",
            (PropertyStatus::Sold, false) => "Sold",
            (PropertyStatus::Sold, true) => "تم البيع",
            (PropertyStatus::Rented, false) => "Rented",
            (PropertyStatus::Rented, true) => "مؤجر",
            (PropertyStatus::UnderContract, false) => "Under Contract",
            (PropertyStatus::UnderContract, true) => "تحت العقد",
        }
    }
}

/// 房源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub property_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_flexible_f64")]
    pub area: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(rename = "ownerName", default)]
    pub owner_name: Option<String>,
    #[serde(rename = "ownerPhone", default)]
    pub owner_phone: Option<String>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub features: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub images: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub status: PropertyStatus,
    #[serde(rename = "hasBasement", default, deserialize_with = "deserialize_null_default")]
    pub has_basement: bool,
    #[serde(rename = "otherDetails", default)]
    pub other_details: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Property {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            description: None,
            property_type: None,
            price: None,
            area: None,
            location: None,
            city: None,
            owner_name: None,
            owner_phone: None,
            features: Vec::new(),
            images: Vec::new(),
            status: PropertyStatus::default(),
            has_basement: false,
            other_details: None,
            user_id: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl_entity!(Property, Collection::Properties, |property| {
    require_text("title", &property.title)?;
    for (field, value) in [("price", property.price), ("area", property.area)] {
        if matches!(value, Some(v) if v < 0.0) {
            return Err(StoreError::Validation(format!("{} 不能为负数", field)));
        }
    }
    Ok(())
});
