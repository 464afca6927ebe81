//! 客户批量导入（按电话号码去重）

use crate::crm::entities::client::normalize_phone;
use crate::crm::entities::Client;
use crate::crm::error::{StoreError, StoreResult};
use crate::crm::store::CollectionRepository;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info};

/// 导入文件中的一行（表格导出的 JSON，字段名大小写不统一）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportRow {
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub country: Option<String>,
    #[serde(default, alias = "contactMethod", deserialize_with = "deserialize_loose_string")]
    pub contact_method: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub facebook: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub project: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub budget: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub campaign: Option<String>,
}

/// 表格中的数字（电话、预算）可能被解析成数值，统一转为字符串；空串视为缺失
fn deserialize_loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let text = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => {
            return Err(serde::de::Error::custom(format!("不支持的字段值: {}", other)))
        }
    };
    let trimmed = text.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

/// 导入结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub duplicates: usize,
    pub duplicate_phones: Vec<String>,
    /// 缺少电话号码而跳过的行
    pub skipped: usize,
    pub total: usize,
}

/// 解析导入文件内容（JSON 数组）
pub fn parse_import_rows(text: &str) -> StoreResult<Vec<ImportRow>> {
    let rows: Vec<ImportRow> = serde_json::from_str(text)
        .map_err(|e| StoreError::Validation(format!("导入文件格式错误: {}", e)))?;
    Ok(rows)
}

fn row_to_client(row: ImportRow, phone: String, user_id: Option<&str>) -> Client {
    // 缺少姓名时用电话号码代替，保证必填字段
    let name = row.name.unwrap_or_else(|| phone.clone());
    let mut client = Client::new(name, phone);
    if let Some(country) = row.country {
        client.country = Some(country);
    }
    if let Some(method) = row.contact_method {
        client.contact_method = Some(method);
    }
    client.email = row.email;
    client.facebook = row.facebook;
    client.city = row.city;
    client.project = row.project;
    client.budget = row.budget;
    client.campaign = row.campaign;
    client.user_id = user_id.map(str::to_string);
    client
}

/// 批量导入客户
///
/// 电话号码（归一化后）与已有客户或本批次前面的行重复的行计为重复，不导入。
pub async fn import_clients<R>(
    repo: &R,
    rows: Vec<ImportRow>,
    user_id: Option<&str>,
) -> StoreResult<ImportSummary>
where
    R: CollectionRepository<Client> + ?Sized,
{
    let mut summary = ImportSummary {
        total: rows.len(),
        ..Default::default()
    };
    let mut seen: HashSet<String> = repo
        .get_all()
        .await?
        .iter()
        .map(|c| normalize_phone(&c.phone))
        .filter(|p| !p.is_empty())
        .collect();

    for mut row in rows {
        let Some(phone) = row.phone.take() else {
            summary.skipped += 1;
            continue;
        };
        let key = normalize_phone(&phone);
        if key.is_empty() {
            summary.skipped += 1;
            continue;
        }
        if !seen.insert(key) {
            debug!("[Import] 跳过重复电话: {}", phone);
            summary.duplicates += 1;
            summary.duplicate_phones.push(phone);
            continue;
        }
        repo.add(row_to_client(row, phone, user_id)).await?;
        summary.imported += 1;
    }

    info!(
        "[Import] 导入完成: 共 {} 行，导入 {}，重复 {}，跳过 {}",
        summary.total, summary.imported, summary.duplicates, summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::entities::ClientStatus;
    use crate::crm::store::MemoryCollection;

    #[tokio::test]
    async fn duplicates_by_phone_are_not_imported() {
        let repo = MemoryCollection::<Client>::new();
        repo.add(Client::new("Existing A", "0100 111 2222")).await.unwrap();
        repo.add(Client::new("Existing B", "0100-333-4444")).await.unwrap();

        let rows = parse_import_rows(
            r#"[
                {"name": "New 1", "phone": "01005556666", "contactMethod": "whatsapp"},
                {"name": "Dup A", "phone": "01001112222"},
                {"name": "New 2", "phone": 1007778888, "budget": 2500000},
                {"name": "Dup B", "phone": "0100 333 4444"},
                {"name": "New 3", "phone": "01009990000", "country": "KSA"}
            ]"#,
        )
        .unwrap();
        let n = rows.len();

        let summary = import_clients(&repo, rows, Some("u1")).await.unwrap();
        assert_eq!(summary.total, n);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.imported, n - 2);
        assert_eq!(summary.duplicate_phones, vec!["01001112222", "0100 333 4444"]);

        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 2 + summary.imported);
        let new2 = all.iter().find(|c| c.name == "New 2").unwrap();
        assert_eq!(new2.phone, "1007778888");
        assert_eq!(new2.budget.as_deref(), Some("2500000"));
        assert_eq!(new2.country.as_deref(), Some("Egypt"));
        assert_eq!(new2.status, ClientStatus::New);
        assert_eq!(new2.user_id.as_deref(), Some("u1"));
        let new1 = all.iter().find(|c| c.name == "New 1").unwrap();
        assert_eq!(new1.contact_method.as_deref(), Some("whatsapp"));
    }

    #[tokio::test]
    async fn repeated_phone_within_batch_counts_once() {
        let repo = MemoryCollection::<Client>::new();
        let rows = parse_import_rows(
            r#"[
                {"name": "A", "phone": "0101"},
                {"name": "A again", "phone": "0101"},
                {"name": "No phone"},
                {"phone": "0102"}
            ]"#,
        )
        .unwrap();
        let summary = import_clients(&repo, rows, None).await.unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.skipped, 1);
        assert!(repo
            .get_all()
            .await
            .unwrap()
            .iter()
            .any(|c| c.name == "0102"));
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let err = parse_import_rows("{\"name\": 1}").unwrap_err();
        assert_eq!(err.kind(), crate::crm::error::ErrorKind::Validation);
    }
}
