//! 分享与导出
//!
//! - 房源 / 项目分享页：按所选字段生成自包含的 HTML（阿拉伯语为 RTL）
//! - 单个实体导出为格式化 JSON
//! - 全量备份：所有集合打包为 JSON，gzip 压缩后 base64 编码

use crate::crm::entities::{Collection, Entity, Project, Property};
use crate::crm::error::{StoreError, StoreResult};
use crate::crm::serialization::{compress_gzip, decompress_gzip, now_utc};
use crate::crm::store::RecordDao;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;
use tracing::{info, warn};

/// 备份格式版本
pub const SNAPSHOT_VERSION: u32 = 1;

/// 分享页语言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareLang {
    #[default]
    Ar,
    En,
}

impl ShareLang {
    pub fn is_rtl(&self) -> bool {
        matches!(self, ShareLang::Ar)
    }

    fn code(&self) -> &'static str {
        match self {
            ShareLang::Ar => "ar",
            ShareLang::En => "en",
        }
    }
}

impl FromStr for ShareLang {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ar" | "arabic" => Ok(ShareLang::Ar),
            "en" | "english" => Ok(ShareLang::En),
            other => Err(format!("不支持的语言: {}", other)),
        }
    }
}

/// 分享页中可选择的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareField {
    pub id: &'static str,
    pub label_ar: &'static str,
    pub label_en: &'static str,
    /// 分享对话框打开时是否默认勾选
    pub selected_by_default: bool,
}

impl ShareField {
    const fn new(
        id: &'static str,
        label_ar: &'static str,
        label_en: &'static str,
        selected_by_default: bool,
    ) -> Self {
        Self {
            id,
            label_ar,
            label_en,
            selected_by_default,
        }
    }

    pub fn label(&self, lang: ShareLang) -> &'static str {
        match lang {
            ShareLang::Ar => self.label_ar,
            ShareLang::En => self.label_en,
        }
    }
}

pub const PROPERTY_SHARE_FIELDS: [ShareField; 11] = [
    ShareField::new("images", "صور العقار", "Property Images", true),
    ShareField::new("title", "عنوان العقار", "Property Title", true),
    ShareField::new("description", "الوصف", "Description", true),
    ShareField::new("type", "النوع", "Type", true),
    ShareField::new("price", "السعر", "Price", true),
    ShareField::new("area", "المساحة", "Area", true),
    ShareField::new("location", "الموقع", "Location", true),
    ShareField::new("city", "المدينة", "City", true),
    ShareField::new("features", "المميزات", "Features", false),
    ShareField::new("ownerName", "اسم المالك", "Owner Name", false),
    ShareField::new("ownerPhone", "رقم هاتف المالك", "Owner Phone", false),
];

pub const PROJECT_SHARE_FIELDS: [ShareField; 11] = [
    ShareField::new("images", "الصور", "Images", true),
    ShareField::new("name", "اسم المشروع", "Project Name", true),
    ShareField::new("description", "الوصف", "Description", true),
    ShareField::new("type", "النوع", "Type", true),
    ShareField::new("status", "الحالة", "Status", true),
    ShareField::new("price", "السعر", "Price", true),
    ShareField::new("project_area", "المساحة", "Area", true),
    ShareField::new("location", "الموقع", "Location", true),
    ShareField::new("manager", "مدير المشروع", "Project Manager", false),
    ShareField::new("start_date", "تاريخ البدء", "Start Date", false),
    ShareField::new("end_date", "تاريخ الانتهاء", "End Date", false),
];

/// 默认勾选的字段 id
pub fn default_selection(fields: &[ShareField]) -> Vec<&'static str> {
    fields
        .iter()
        .filter(|f| f.selected_by_default)
        .map(|f| f.id)
        .collect()
}

/// HTML 转义
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// 千分位格式化，最多保留两位小数
fn format_number(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let int_part = rounded.trunc().abs() as u64;
    let frac = ((rounded.abs() - rounded.abs().trunc()) * 100.0).round() as u64;

    let digits = int_part.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if rounded < 0.0 { "-" } else { "" };
    if frac == 0 {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{:02}", sign, grouped, frac)
            .trim_end_matches('0')
            .to_string()
    }
}

fn format_price(value: f64, lang: ShareLang) -> String {
    match lang {
        ShareLang::Ar => format!("{} ج.م", format_number(value)),
        ShareLang::En => format!("EGP {}", format_number(value)),
    }
}

fn format_area(value: f64, lang: ShareLang) -> String {
    match lang {
        ShareLang::Ar => format!("{} م²", format_number(value)),
        ShareLang::En => format!("{} m²", format_number(value)),
    }
}

/// 分享页内容块
enum Block {
    Images(Vec<String>),
    Heading(String),
    Paragraph(String),
    Detail { label: &'static str, value: String },
    List { label: &'static str, items: Vec<String> },
}

fn render_document(title: &str, lang: ShareLang, blocks: Vec<Block>) -> String {
    let dir = if lang.is_rtl() { "rtl" } else { "ltr" };
    let align = if lang.is_rtl() { "right" } else { "left" };

    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html lang=\"{lang}\" dir=\"{dir}\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n<style>\n\
         body {{ font-family: 'Cairo', 'Segoe UI', sans-serif; background: #f5f5f5; margin: 0; padding: 24px; text-align: {align}; }}\n\
         .card {{ max-width: 800px; margin: 0 auto; background: #fff; border-radius: 12px; box-shadow: 0 2px 12px rgba(0,0,0,.08); overflow: hidden; }}\n\
         .images {{ display: grid; grid-template-columns: repeat(2, 1fr); gap: 8px; padding: 16px; }}\n\
         .images img {{ width: 100%; aspect-ratio: 16 / 9; object-fit: cover; border-radius: 8px; }}\n\
         .content {{ padding: 24px; }}\n\
         h1 {{ margin: 0 0 12px; color: #111; }}\n\
         .description {{ color: #555; line-height: 1.6; }}\n\
         .details {{ display: grid; grid-template-columns: repeat(2, 1fr); gap: 16px; margin-top: 16px; }}\n\
         .label {{ font-size: 13px; color: #777; margin: 0; }}\n\
         .value {{ margin: 4px 0 0; color: #111; }}\n\
         </style>\n</head>\n<body>\n<div class=\"card\">\n",
        lang = lang.code(),
        dir = dir,
        title = escape_html(title),
        align = align,
    );

    let mut details = String::new();
    let mut content = String::new();
    for block in blocks {
        match block {
            Block::Images(images) => {
                html.push_str("<div class=\"images\">\n");
                for (i, src) in images.iter().take(4).enumerate() {
                    let _ = writeln!(
                        html,
                        "<img src=\"{}\" alt=\"{} - {}\">",
                        escape_html(src),
                        escape_html(title),
                        i + 1
                    );
                }
                html.push_str("</div>\n");
            }
            Block::Heading(text) => {
                let _ = writeln!(content, "<h1>{}</h1>", escape_html(&text));
            }
            Block::Paragraph(text) => {
                let _ = writeln!(content, "<p class=\"description\">{}</p>", escape_html(&text));
            }
            Block::Detail { label, value } => {
                let _ = writeln!(
                    details,
                    "<div><p class=\"label\">{}</p><p class=\"value\">{}</p></div>",
                    escape_html(label),
                    escape_html(&value)
                );
            }
            Block::List { label, items } => {
                let _ = write!(details, "<div><p class=\"label\">{}</p><ul>", escape_html(label));
                for item in items {
                    let _ = write!(details, "<li>{}</li>", escape_html(&item));
                }
                details.push_str("</ul></div>\n");
            }
        }
    }

    html.push_str("<div class=\"content\">\n");
    html.push_str(&content);
    if !details.is_empty() {
        html.push_str("<div class=\"details\">\n");
        html.push_str(&details);
        html.push_str("</div>\n");
    }
    html.push_str("</div>\n</div>\n</body>\n</html>\n");
    html
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 生成房源分享页；字段按定义顺序输出，未知或为空的字段跳过
pub fn render_property_html(property: &Property, selected: &[&str], lang: ShareLang) -> String {
    let mut blocks = Vec::new();
    for field in PROPERTY_SHARE_FIELDS.iter().filter(|f| selected.contains(&f.id)) {
        let label = field.label(lang);
        let block = match field.id {
            "images" if !property.images.is_empty() => Some(Block::Images(property.images.clone())),
            "title" => Some(Block::Heading(property.title.clone())),
            "description" => non_empty(&property.description).map(Block::Paragraph),
            "type" => non_empty(&property.property_type).map(|value| Block::Detail { label, value }),
            "price" => property.price.map(|p| Block::Detail {
                label,
                value: format_price(p, lang),
            }),
            "area" => property.area.map(|a| Block::Detail {
                label,
                value: format_area(a, lang),
            }),
            "location" => non_empty(&property.location).map(|value| Block::Detail { label, value }),
            "city" => non_empty(&property.city).map(|value| Block::Detail { label, value }),
            "features" if !property.features.is_empty() => Some(Block::List {
                label,
                items: property.features.clone(),
            }),
            "ownerName" => non_empty(&property.owner_name).map(|value| Block::Detail { label, value }),
            "ownerPhone" => {
                non_empty(&property.owner_phone).map(|value| Block::Detail { label, value })
            }
            _ => None,
        };
        blocks.extend(block);
    }
    render_document(&property.title, lang, blocks)
}

/// 生成项目分享页
pub fn render_project_html(project: &Project, selected: &[&str], lang: ShareLang) -> String {
    let mut blocks = Vec::new();
    for field in PROJECT_SHARE_FIELDS.iter().filter(|f| selected.contains(&f.id)) {
        let label = field.label(lang);
        let block = match field.id {
            "images" if !project.images.is_empty() => Some(Block::Images(project.images.clone())),
            "name" => Some(Block::Heading(project.name.clone())),
            "description" => non_empty(&project.description).map(Block::Paragraph),
            "type" => non_empty(&project.project_type).map(|value| Block::Detail { label, value }),
            "status" => Some(Block::Detail {
                label,
                value: project.status.label(lang.is_rtl()).to_string(),
            }),
            "price" => project.price.map(|p| Block::Detail {
                label,
                value: format_price(p, lang),
            }),
            "project_area" => project.project_area.map(|a| Block::Detail {
                label,
                value: format_area(a, lang),
            }),
            "location" => non_empty(&project.location).map(|value| Block::Detail { label, value }),
            "manager" => non_empty(&project.manager).map(|value| Block::Detail { label, value }),
            "start_date" => non_empty(&project.start_date).map(|value| Block::Detail { label, value }),
            "end_date" => non_empty(&project.end_date).map(|value| Block::Detail { label, value }),
            _ => None,
        };
        blocks.extend(block);
    }
    render_document(&project.name, lang, blocks)
}

/// 单个实体的 JSON 导出结果
#[derive(Debug, Clone, PartialEq)]
pub struct JsonExport {
    pub file_name: String,
    pub content: String,
}

/// 导出单个实体为格式化 JSON
pub fn export_entity_json<T: Entity>(entity: &T) -> StoreResult<JsonExport> {
    let content = serde_json::to_string_pretty(entity)?;
    Ok(JsonExport {
        file_name: format!("{}-{}.json", T::COLLECTION.storage_key(), entity.id()),
        content,
    })
}

/// 全量备份内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// 集合存储键 → 记录
    pub collections: BTreeMap<String, Vec<Value>>,
}

impl Snapshot {
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

/// 导出全部集合：JSON → gzip → base64
pub async fn export_snapshot(dao: &RecordDao) -> StoreResult<String> {
    let mut collections = BTreeMap::new();
    for collection in Collection::ALL {
        let rows = dao.fetch_live(collection).await?;
        collections.insert(
            collection.storage_key().to_string(),
            rows.into_iter().map(|r| r.body).collect::<Vec<_>>(),
        );
    }
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        created_at: now_utc(),
        collections,
    };
    let json = serde_json::to_vec(&snapshot)?;
    let packed = compress_gzip(&json)
        .map_err(|e| StoreError::Validation(format!("备份压缩失败: {}", e)))?;
    info!(
        "[Export] 📦 导出备份 {} 条记录，压缩后 {} 字节",
        snapshot.record_count(),
        packed.len()
    );
    Ok(B64.encode(packed))
}

/// 解码备份（base64 → gunzip → JSON）
pub fn decode_snapshot(encoded: &str) -> StoreResult<Snapshot> {
    let packed = B64
        .decode(encoded.trim())
        .map_err(|e| StoreError::Validation(format!("备份不是有效的 base64: {}", e)))?;
    let json = decompress_gzip(&packed)
        .map_err(|e| StoreError::Validation(format!("备份解压失败: {}", e)))?;
    let snapshot: Snapshot = serde_json::from_slice(&json)?;
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(StoreError::Validation(format!(
            "不支持的备份版本: {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

/// 恢复备份；恢复的记录标记为 dirty，下次同步时推送到远端
pub async fn restore_snapshot(dao: &RecordDao, encoded: &str) -> StoreResult<u64> {
    let snapshot = decode_snapshot(encoded)?;
    let mut rows = Vec::with_capacity(snapshot.record_count());
    for (key, records) in snapshot.collections {
        let Some(collection) = Collection::from_storage_key(&key) else {
            warn!("[Export] 跳过未知集合: {}", key);
            continue;
        };
        rows.extend(records.into_iter().map(|body| (collection, body)));
    }
    dao.restore_rows(&rows).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::create_sqlite_pool_with_migration;
    use crate::crm::entities::{Client, Company, ProjectStatus};
    use crate::crm::store::{CollectionRepository, SqliteCollection};

    fn villa() -> Property {
        let mut p = Property::new("Villa <Sea View>");
        p.id = "p1".into();
        p.description = Some("Quiet & bright".into());
        p.price = Some(1_250_000.0);
        p.area = Some(320.5);
        p.city = Some("Alexandria".into());
        p.owner_phone = Some("0100".into());
        p.images = vec!["https://img/1.jpg".into()];
        p
    }

    #[test]
    fn default_selections_follow_the_share_dialog() {
        let property = default_selection(&PROPERTY_SHARE_FIELDS);
        assert_eq!(
            property,
            vec!["images", "title", "description", "type", "price", "area", "location", "city"]
        );
        assert!(!property.contains(&"ownerPhone"));
        assert!(default_selection(&PROJECT_SHARE_FIELDS).contains(&"status"));
    }

    #[test]
    fn arabic_share_page_is_rtl_and_escaped() {
        let fields = default_selection(&PROPERTY_SHARE_FIELDS);
        let html = render_property_html(&villa(), &fields, ShareLang::Ar);
        assert!(html.contains("dir=\"rtl\""));
        assert!(html.contains("Villa &lt;Sea View&gt;"));
        assert!(html.contains("Quiet &amp; bright"));
        assert!(html.contains("<img src=\"https://img/1.jpg\""));
        assert!(html.contains("السعر"));
        assert!(html.contains("1,250,000 ج.م"));
        assert!(html.contains("320.5 م²"));
        assert!(!html.contains("0100"));
    }

    #[test]
    fn english_share_page_only_renders_selected_fields() {
        let html = render_property_html(&villa(), &["title", "ownerPhone"], ShareLang::En);
        assert!(html.contains("dir=\"ltr\""));
        assert!(html.contains("Owner Phone"));
        assert!(html.contains("0100"));
        assert!(!html.contains("<img"));
        assert!(!html.contains("EGP"));
    }

    #[test]
    fn project_share_page_labels_status() {
        let mut project = Project::new("Tower A");
        project.status = ProjectStatus::OnHold;
        project.manager = Some("Mona".into());
        let html = render_project_html(&project, &["name", "status", "manager"], ShareLang::En);
        assert!(html.contains("<h1>Tower A</h1>"));
        assert!(html.contains("On Hold"));
        assert!(html.contains("Project Manager"));
        let html = render_project_html(&project, &["status"], ShareLang::Ar);
        assert!(html.contains("معلق"));
    }

    #[test]
    fn numbers_are_grouped() {
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(999.0), "999");
        assert_eq!(format_number(1000.0), "1,000");
        assert_eq!(format_number(1234567.891), "1,234,567.89");
        assert_eq!(format_number(12.5), "12.5");
    }

    #[test]
    fn entity_json_export() {
        let export = export_entity_json(&villa()).unwrap();
        assert_eq!(export.file_name, "properties-p1.json");
        let back: Property = serde_json::from_str(&export.content).unwrap();
        assert_eq!(back, villa());
        assert!(export.content.contains("\n  \"title\""));
    }

    #[tokio::test]
    async fn snapshot_restores_into_an_empty_database() {
        let source = RecordDao::new(
            create_sqlite_pool_with_migration("sqlite::memory:")
                .await
                .unwrap(),
        );
        let companies = SqliteCollection::<Company>::new(source.clone());
        let clients = SqliteCollection::<Client>::new(source.clone());
        let acme = companies.add(Company::new("Acme")).await.unwrap();
        clients.add(Client::new("Sara", "0100")).await.unwrap();
        let gone = clients.add(Client::new("Omar", "0111")).await.unwrap();
        clients.delete(&gone.id).await.unwrap();

        let encoded = export_snapshot(&source).await.unwrap();
        let snapshot = decode_snapshot(&encoded).unwrap();
        assert_eq!(snapshot.record_count(), 2);

        let target = RecordDao::new(
            create_sqlite_pool_with_migration("sqlite::memory:")
                .await
                .unwrap(),
        );
        assert_eq!(restore_snapshot(&target, &encoded).await.unwrap(), 2);
        let restored = SqliteCollection::<Company>::new(target.clone());
        assert_eq!(restored.get_by_id(&acme.id).await.unwrap(), Some(acme));
        assert_eq!(target.fetch_dirty(Collection::Clients).await.unwrap().len(), 1);
    }

    #[test]
    fn corrupt_backups_are_rejected() {
        assert_eq!(
            decode_snapshot("not base64!").unwrap_err().kind(),
            crate::crm::error::ErrorKind::Validation
        );
        let not_gzip = B64.encode(b"plain");
        assert!(decode_snapshot(&not_gzip).is_err());
    }
}
