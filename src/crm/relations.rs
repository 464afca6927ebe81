//! 公司 ↔ 项目 ↔（洞察、任务）关系维护
//!
//! 项目通过 `company_id` 外键归属公司，洞察和任务通过 `project_id` 归属项目。
//! 级联删除在同一个 SQLite 事务中完成，不会留下孤儿记录。

use crate::crm::entities::{AIProjectInsight, Collection, Company, Project, Task};
use crate::crm::error::{StoreError, StoreResult};
use crate::crm::store::{CollectionRepository, RecordDao, SqliteCollection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// 删除父记录时对子记录的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// 连同子记录一起删除
    #[default]
    Cascade,
    /// 存在子记录时拒绝删除
    Restrict,
}

/// 级联删除结果：各远端表删除的行数
///
/// 本地级联与远端 `delete_project_cascade` RPC 返回同样的结构。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeSummary {
    #[serde(default)]
    pub deleted: BTreeMap<String, u64>,
    #[serde(default)]
    pub execution_time_ms: Option<f64>,
}

impl CascadeSummary {
    pub fn count(&self, collection: Collection) -> u64 {
        self.deleted
            .get(collection.remote_table())
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.deleted.values().sum()
    }
}

/// 关系管理器
#[derive(Clone)]
pub struct RelationManager {
    dao: RecordDao,
    companies: SqliteCollection<Company>,
    projects: SqliteCollection<Project>,
    insights: SqliteCollection<AIProjectInsight>,
    tasks: SqliteCollection<Task>,
}

impl RelationManager {
    pub fn new(dao: RecordDao) -> Self {
        Self {
            companies: SqliteCollection::new(dao.clone()),
            projects: SqliteCollection::new(dao.clone()),
            insights: SqliteCollection::new(dao.clone()),
            tasks: SqliteCollection::new(dao.clone()),
            dao,
        }
    }

    /// 公司下的所有项目（走 company_id 索引）
    pub async fn company_projects(&self, company_id: &str) -> StoreResult<Vec<Project>> {
        self.projects.filter_by("company_id", company_id).await
    }

    /// 新增项目，`company_id` 存在时必须指向已有公司
    pub async fn add_project(&self, project: Project) -> StoreResult<Project> {
        if let Some(company_id) = project.company_id.as_deref() {
            self.ensure_company(company_id).await?;
        }
        self.projects.add(project).await
    }

    pub async fn assign_project(&self, project_id: &str, company_id: &str) -> StoreResult<Project> {
        self.ensure_company(company_id).await?;
        self.projects
            .update(project_id, json!({ "company_id": company_id }))
            .await
    }

    pub async fn unassign_project(&self, project_id: &str) -> StoreResult<Project> {
        self.projects
            .update(project_id, json!({ "company_id": null }))
            .await
    }

    /// 新增 AI 洞察，`project_id` 必须指向已有项目
    pub async fn add_insight(&self, insight: AIProjectInsight) -> StoreResult<AIProjectInsight> {
        self.ensure_project(&insight.project_id).await?;
        self.insights.add(insight).await
    }

    /// 新增任务，`project_id` 存在时必须指向已有项目
    pub async fn add_task(&self, task: Task) -> StoreResult<Task> {
        if let Some(project_id) = task.project_id.as_deref() {
            self.ensure_project(project_id).await?;
        }
        self.tasks.add(task).await
    }

    pub async fn project_insights(&self, project_id: &str) -> StoreResult<Vec<AIProjectInsight>> {
        self.insights.filter_by("project_id", project_id).await
    }

    pub async fn project_tasks(&self, project_id: &str) -> StoreResult<Vec<Task>> {
        self.tasks.filter_by("project_id", project_id).await
    }

    /// 删除公司
    pub async fn delete_company(
        &self,
        company_id: &str,
        action: ReferentialAction,
    ) -> StoreResult<CascadeSummary> {
        let projects = self.company_projects(company_id).await?;
        if action == ReferentialAction::Restrict && !projects.is_empty() {
            return Err(StoreError::Conflict(format!(
                "公司 {} 下仍有 {} 个项目",
                company_id,
                projects.len()
            )));
        }

        let mut plan = vec![(Collection::Companies, vec![company_id.to_string()])];
        let project_ids: Vec<String> = projects.into_iter().map(|p| p.id).collect();
        self.plan_project_dependents(&project_ids, &mut plan).await?;
        plan.push((Collection::Projects, project_ids));

        let summary = self.execute(plan).await?;
        info!(
            "[Relations] 删除公司 {}（{:?}），共删除 {} 条记录",
            company_id,
            action,
            summary.total()
        );
        Ok(summary)
    }

    /// 删除项目及其洞察、任务
    pub async fn delete_project(&self, project_id: &str) -> StoreResult<CascadeSummary> {
        let mut plan = Vec::new();
        let ids = vec![project_id.to_string()];
        self.plan_project_dependents(&ids, &mut plan).await?;
        plan.push((Collection::Projects, ids));

        let summary = self.execute(plan).await?;
        info!(
            "[Relations] 删除项目 {}，共删除 {} 条记录",
            project_id,
            summary.total()
        );
        Ok(summary)
    }

    async fn plan_project_dependents(
        &self,
        project_ids: &[String],
        plan: &mut Vec<(Collection, Vec<String>)>,
    ) -> StoreResult<()> {
        let mut insight_ids = Vec::new();
        let mut task_ids = Vec::new();
        for project_id in project_ids {
            insight_ids.extend(
                self.project_insights(project_id)
                    .await?
                    .into_iter()
                    .map(|i| i.id),
            );
            task_ids.extend(self.project_tasks(project_id).await?.into_iter().map(|t| t.id));
        }
        plan.push((Collection::ProjectInsights, insight_ids));
        plan.push((Collection::Tasks, task_ids));
        Ok(())
    }

    async fn execute(&self, plan: Vec<(Collection, Vec<String>)>) -> StoreResult<CascadeSummary> {
        let mut summary = CascadeSummary::default();
        for (collection, ids) in &plan {
            for id in ids {
                // 只统计实际存活的记录
                if let Some(record) = self.dao.fetch(*collection, id).await? {
                    if !record.deleted {
                        *summary
                            .deleted
                            .entry(collection.remote_table().to_string())
                            .or_default() += 1;
                    }
                }
            }
        }
        self.dao.tombstone_many(&plan).await?;
        Ok(summary)
    }

    async fn ensure_company(&self, company_id: &str) -> StoreResult<()> {
        if self.companies.get_by_id(company_id).await?.is_none() {
            return Err(StoreError::Validation(format!(
                "company_id 指向不存在的公司: {}",
                company_id
            )));
        }
        Ok(())
    }

    async fn ensure_project(&self, project_id: &str) -> StoreResult<()> {
        if self.projects.get_by_id(project_id).await?.is_none() {
            return Err(StoreError::Validation(format!(
                "project_id 指向不存在的项目: {}",
                project_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::create_sqlite_pool_with_migration;
    use crate::crm::error::ErrorKind;

    async fn manager() -> RelationManager {
        let pool = create_sqlite_pool_with_migration("sqlite::memory:")
            .await
            .unwrap();
        RelationManager::new(RecordDao::new(pool))
    }

    /// Acme 公司 / Tower A 项目 / 两条洞察 / 一个任务
    async fn seed(m: &RelationManager) -> (Company, Project, Project) {
        let acme = m.companies.add(Company::new("Acme")).await.unwrap();
        let tower = m
            .add_project(Project::for_company("Tower A", &acme.id))
            .await
            .unwrap();
        let loose = m.add_project(Project::new("Loose Villa")).await.unwrap();
        m.add_insight(AIProjectInsight::new(&tower.id, "market"))
            .await
            .unwrap();
        m.add_insight(AIProjectInsight::new(&tower.id, "pricing"))
            .await
            .unwrap();
        let mut task = Task::new("Call contractor");
        task.project_id = Some(tower.id.clone());
        m.add_task(task).await.unwrap();
        (acme, tower, loose)
    }

    #[tokio::test]
    async fn company_cascade_removes_every_dependent() {
        let m = manager().await;
        let (acme, tower, loose) = seed(&m).await;

        let names: Vec<String> = m
            .company_projects(&acme.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Tower A"]);

        let summary = m
            .delete_company(&acme.id, ReferentialAction::Cascade)
            .await
            .unwrap();
        assert_eq!(summary.count(Collection::Companies), 1);
        assert_eq!(summary.count(Collection::Projects), 1);
        assert_eq!(summary.count(Collection::ProjectInsights), 2);
        assert_eq!(summary.count(Collection::Tasks), 1);

        assert!(m.companies.get_by_id(&acme.id).await.unwrap().is_none());
        assert!(m.projects.get_by_id(&tower.id).await.unwrap().is_none());
        assert!(m.project_insights(&tower.id).await.unwrap().is_empty());
        assert!(m.project_tasks(&tower.id).await.unwrap().is_empty());
        assert!(m.projects.get_by_id(&loose.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restrict_refuses_while_projects_exist() {
        let m = manager().await;
        let (acme, tower, _) = seed(&m).await;

        let err = m
            .delete_company(&acme.id, ReferentialAction::Restrict)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(m.companies.get_by_id(&acme.id).await.unwrap().is_some());

        m.unassign_project(&tower.id).await.unwrap();
        let summary = m
            .delete_company(&acme.id, ReferentialAction::Restrict)
            .await
            .unwrap();
        assert_eq!(summary.total(), 1);
        assert_eq!(m.project_insights(&tower.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dangling_references_are_rejected() {
        let m = manager().await;
        let err = m
            .add_project(Project::for_company("Ghost", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = m
            .add_insight(AIProjectInsight::new("missing", "market"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn assign_moves_project_between_companies() {
        let m = manager().await;
        let (acme, tower, loose) = seed(&m).await;
        m.assign_project(&loose.id, &acme.id).await.unwrap();
        let ids: Vec<String> = m
            .company_projects(&acme.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&tower.id) && ids.contains(&loose.id));
    }

    #[tokio::test]
    async fn project_delete_reports_counts() {
        let m = manager().await;
        let (_, tower, _) = seed(&m).await;
        let summary = m.delete_project(&tower.id).await.unwrap();
        assert_eq!(summary.total(), 4);
        // 再次删除是空操作
        assert_eq!(m.delete_project(&tower.id).await.unwrap().total(), 0);
    }
}
