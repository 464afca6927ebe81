//! 房地产 CRM 命令行工具
//!
//! 本地数据保存在 SQLite 中；配置了远端（`CRM_API_URL` 等环境变量）时可以同步到云端。

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use realty_crm_core::crm::entities::{Client, Collection, Company, Project};
use realty_crm_core::crm::export::{
    default_selection, export_entity_json, render_project_html, render_property_html, ShareLang,
    PROJECT_SHARE_FIELDS, PROPERTY_SHARE_FIELDS,
};
use realty_crm_core::crm::relations::ReferentialAction;
use realty_crm_core::crm::store::CollectionRepository;
use realty_crm_core::crm::sync::SyncListener;
use realty_crm_core::crm::workspace::{Workspace, WorkspaceConfig, DEFAULT_DB_URL};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 房地产 CRM 命令行工具
#[derive(Parser, Debug)]
#[command(name = "crm-cli")]
#[command(about = "房地产 CRM 命令行工具 - 本地管理公司、项目、客户并同步到云端", long_about = None)]
struct Args {
    /// 本地数据库地址
    #[arg(long, env = "CRM_DB_URL", default_value = DEFAULT_DB_URL)]
    db: String,

    /// 日志级别（默认: info,realty_crm_core=debug）
    #[arg(long, default_value = "info,realty_crm_core=debug")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 公司管理
    Company {
        #[command(subcommand)]
        action: CompanyCommand,
    },
    /// 项目管理
    Project {
        #[command(subcommand)]
        action: ProjectCommand,
    },
    /// 客户管理
    Client {
        #[command(subcommand)]
        action: ClientCommand,
    },
    /// 与云端同步
    Sync {
        /// 定时同步间隔（秒），同时开启实时通道，按 Ctrl+C 退出
        #[arg(long)]
        auto: Option<u64>,
        /// 清空游标后全量同步
        #[arg(long)]
        full: bool,
    },
    /// 生成分享页（HTML）
    Share {
        #[command(subcommand)]
        target: ShareTarget,
    },
    /// 备份与恢复
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CompanyCommand {
    Add {
        name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    List,
    Delete {
        id: String,
        /// 公司下还有项目时拒绝删除
        #[arg(long)]
        restrict: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Add {
        name: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    List {
        /// 只列出某个公司的项目
        #[arg(long)]
        company: Option<String>,
    },
    Delete {
        id: String,
        /// 同时调用远端级联删除
        #[arg(long)]
        remote: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    Add {
        name: String,
        phone: String,
        #[arg(long)]
        city: Option<String>,
    },
    List,
    /// 从 JSON 文件导入客户（按电话号码去重）
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ShareTarget {
    Property {
        id: String,
        #[arg(long, default_value = "ar")]
        lang: String,
        /// 输出文件，不指定时输出到标准输出
        #[arg(long)]
        out: Option<PathBuf>,
        /// 同时导出 JSON
        #[arg(long)]
        json: bool,
    },
    Project {
        id: String,
        #[arg(long, default_value = "ar")]
        lang: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    Export { file: PathBuf },
    Restore { file: PathBuf },
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("crm.log")
        .context("无法创建日志文件 crm.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// 输出同步事件
struct CliSyncListener;

#[async_trait::async_trait]
impl SyncListener for CliSyncListener {
    async fn on_sync_started(&self) {
        info!("[CLI/Sync] 🔄 同步开始");
    }

    async fn on_table_synced(&self, stats_json: String) {
        info!("[CLI/Sync] 📊 {}", stats_json);
    }

    async fn on_conflict(&self, table: String, record_id: String) {
        warn!("[CLI/Sync] ⚠️ 冲突，保留本地版本: {} {}", table, record_id);
    }

    async fn on_sync_finished(&self, _report_json: String) {
        info!("[CLI/Sync] ✅ 同步完成");
    }

    async fn on_sync_failed(&self, error: String) {
        error!("[CLI/Sync] ❌ 同步失败: {}", error);
    }

    async fn on_remote_change(&self, change_json: String) {
        info!("[CLI/Realtime] 📥 {}", change_json);
    }
}

fn write_output(out: Option<PathBuf>, content: &str) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(&path, content).context(format!("写入文件失败: {}", path.display()))?;
            info!("[CLI] 💾 已写入 {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

async fn run_company(ws: &Workspace, action: CompanyCommand) -> Result<()> {
    match action {
        CompanyCommand::Add { name, email, phone } => {
            let mut company = Company::new(name);
            company.email = email;
            company.phone = phone;
            let company = ws.companies().add(company).await?;
            println!("{}", company.id);
        }
        CompanyCommand::List => {
            for company in ws.companies().get_all().await? {
                let projects = ws.relations().company_projects(&company.id).await?;
                println!("{}\t{}\t{} 个项目", company.id, company.name, projects.len());
            }
            let total = ws.records().count_live(Collection::Companies).await?;
            println!("共 {} 个公司", total);
        }
        CompanyCommand::Delete { id, restrict } => {
            let action = if restrict {
                ReferentialAction::Restrict
            } else {
                ReferentialAction::Cascade
            };
            let summary = ws.relations().delete_company(&id, action).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

async fn run_project(ws: &mut Workspace, action: ProjectCommand) -> Result<()> {
    match action {
        ProjectCommand::Add {
            name,
            company,
            location,
        } => {
            let mut project = Project::new(name);
            project.company_id = company;
            project.location = location;
            let project = ws.relations().add_project(project).await?;
            println!("{}", project.id);
        }
        ProjectCommand::List { company } => {
            let projects = match company {
                Some(company_id) => ws.relations().company_projects(&company_id).await?,
                None => ws.projects().get_all().await?,
            };
            for p in projects {
                println!(
                    "{}\t{}\t{}\t{}",
                    p.id,
                    p.name,
                    p.status.label(false),
                    p.company_id.as_deref().unwrap_or("-")
                );
            }
            let total = ws.records().count_live(Collection::Projects).await?;
            println!("本地共 {} 个项目", total);
        }
        ProjectCommand::Delete { id, remote } => {
            let summary = ws.relations().delete_project(&id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if remote {
                ws.connect_remote().await?;
                let remote_summary = ws.syncer()?.delete_project_remote(&id).await?;
                println!("{}", serde_json::to_string_pretty(&remote_summary)?);
            }
        }
    }
    Ok(())
}

async fn run_client(ws: &mut Workspace, action: ClientCommand) -> Result<()> {
    match action {
        ClientCommand::Add { name, phone, city } => {
            let mut client = Client::new(name, phone);
            client.city = city;
            let client = ws.clients().add(client).await?;
            println!("{}", client.id);
        }
        ClientCommand::List => {
            for c in ws.clients().get_all().await? {
                println!(
                    "{}\t{}\t{}\t{:?}{}",
                    c.id,
                    c.name,
                    c.phone,
                    c.status,
                    if c.favorite { "\t★" } else { "" }
                );
            }
            let total = ws.records().count_live(Collection::Clients).await?;
            println!("共 {} 个客户", total);
        }
        ClientCommand::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .context(format!("读取导入文件失败: {}", file.display()))?;
            if ws.config().has_remote() {
                if let Err(e) = ws.connect_remote().await {
                    warn!("[CLI] 未能连接远端，导入的客户不带用户ID: {:#}", e);
                }
            }
            let summary = ws.import_clients(&text).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

async fn run_sync(ws: &mut Workspace, auto: Option<u64>, full: bool) -> Result<()> {
    ws.set_sync_listener(Arc::new(CliSyncListener));
    ws.connect_remote().await?;
    let syncer = ws.syncer()?;

    match auto {
        Some(secs) => {
            let period = Duration::from_secs(secs.max(1));
            ws.start_auto_sync(period).await?;
            ws.start_realtime().await?;
            info!("[CLI] ⏰ 每 {} 秒同步一次，按 Ctrl+C 退出", period.as_secs());
            tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
            info!("[CLI] 👋 正在退出");
        }
        None => {
            let report = if full {
                syncer.resync_all().await?
            } else {
                syncer.sync_all().await?
            };
            println!("{}", serde_json::to_string_pretty(&report.details())?);
            match syncer.sync_favorites().await {
                Ok(n) => info!("[CLI] ⭐ 收藏同步完成，共 {} 个", n),
                Err(e) => warn!("[CLI] 收藏同步失败: {:#}", e),
            }
            if let Some(last) = syncer.last_sync_time().await? {
                info!("[CLI] 🕒 最近一次同步: {}", last);
            }
        }
    }
    Ok(())
}

async fn run_share(ws: &Workspace, target: ShareTarget) -> Result<()> {
    match target {
        ShareTarget::Property {
            id,
            lang,
            out,
            json,
        } => {
            let lang: ShareLang = lang.parse().map_err(|e: String| anyhow!(e))?;
            let property = ws
                .properties()
                .get_by_id(&id)
                .await?
                .ok_or_else(|| anyhow!("房源不存在: {}", id))?;
            if json {
                let export = export_entity_json(&property)?;
                write_output(Some(PathBuf::from(export.file_name)), &export.content)?;
            }
            let fields = default_selection(&PROPERTY_SHARE_FIELDS);
            write_output(out, &render_property_html(&property, &fields, lang))?;
        }
        ShareTarget::Project {
            id,
            lang,
            out,
            json,
        } => {
            let lang: ShareLang = lang.parse().map_err(|e: String| anyhow!(e))?;
            let project = ws
                .projects()
                .get_by_id(&id)
                .await?
                .ok_or_else(|| anyhow!("项目不存在: {}", id))?;
            if json {
                let export = export_entity_json(&project)?;
                write_output(Some(PathBuf::from(export.file_name)), &export.content)?;
            }
            let fields = default_selection(&PROJECT_SHARE_FIELDS);
            write_output(out, &render_project_html(&project, &fields, lang))?;
        }
    }
    Ok(())
}

async fn run_backup(ws: &Workspace, action: BackupCommand) -> Result<()> {
    match action {
        BackupCommand::Export { file } => {
            let encoded = ws.export_snapshot().await?;
            write_output(Some(file), &encoded)?;
        }
        BackupCommand::Restore { file } => {
            let encoded = std::fs::read_to_string(&file)
                .context(format!("读取备份失败: {}", file.display()))?;
            let restored = ws.restore_snapshot(&encoded).await?;
            info!("[CLI] ✅ 已恢复 {} 条记录，下次同步时推送到云端", restored);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level)?;

    let mut config = WorkspaceConfig::from_env();
    config.db_url = args.db.clone();
    let mut ws = Workspace::open(config).await?;

    let result = match args.command {
        Command::Company { action } => run_company(&ws, action).await,
        Command::Project { action } => run_project(&mut ws, action).await,
        Command::Client { action } => run_client(&mut ws, action).await,
        Command::Sync { auto, full } => run_sync(&mut ws, auto, full).await,
        Command::Share { target } => run_share(&ws, target).await,
        Command::Backup { action } => run_backup(&ws, action).await,
    };

    ws.close().await;
    if let Err(e) = &result {
        error!("[CLI] ❌ {:#}", e);
    }
    result
}
