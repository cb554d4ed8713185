//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `fragmentflow-core` using sqlx with
//! split read/write pools. Definitions and template bodies are stored as JSON
//! documents; executions keep their status and timestamps in columns so they
//! can be filtered and ordered without decoding.

use fragmentflow_core::repository::workflow::WorkflowRepository;
use fragmentflow_types::error::RepositoryError;
use fragmentflow_types::workflow::{
    ExecutionStatus, Page, Pagination, WorkflowDefinition, WorkflowExecution, WorkflowTemplate,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn count(&self, sql: &str, bind: Option<&str>) -> Result<u64, RepositoryError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let row = query
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        let total: i64 = row.try_get(0).map_err(query_error)?;
        Ok(total.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_id: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    input_data: String,
    output_data: Option<String>,
    logs: String,
    error: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            logs: row.try_get("logs")?,
            error: row.try_get("error")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid execution status: {}", self.status)))?;

        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            status,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            input_data: parse_json(&self.input_data, "input_data")?,
            output_data: self
                .output_data
                .as_deref()
                .map(|s| parse_json(s, "output_data"))
                .transpose()?,
            logs: parse_json(&self.logs, "logs")?,
            error: self.error,
        })
    }
}

struct TemplateRow {
    id: String,
    name: String,
    description: String,
    category: String,
    definition: String,
    is_public: bool,
    usage_count: i64,
    created_at: String,
}

impl TemplateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            category: row.try_get("category")?,
            definition: row.try_get("definition")?,
            is_public: row.try_get("is_public")?,
            usage_count: row.try_get("usage_count")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_template(self) -> Result<WorkflowTemplate, RepositoryError> {
        Ok(WorkflowTemplate {
            id: parse_uuid(&self.id)?,
            name: self.name,
            description: self.description,
            category: self.category,
            definition: parse_json(&self.definition, "template definition")?,
            is_public: self.is_public,
            usage_count: self.usage_count.max(0) as u64,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn insert_error(e: sqlx::Error, id: &Uuid) -> RepositoryError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepositoryError::Conflict(id.to_string()),
        _ => query_error(e),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn decode_definitions(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let body: String = row.try_get("definition").map_err(query_error)?;
            parse_json(&body, "workflow definition")
        })
        .collect()
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO workflows (id, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.version as i64)
        .bind(to_json(def)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, &def.id))?;

        Ok(())
    }

    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflows SET name = ?, version = ?, definition = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&def.name)
        .bind(def.version as i64)
        .bind(to_json(def)?)
        .bind(format_datetime(&Utc::now()))
        .bind(def.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(decode_definitions(&[row])?.pop()),
            None => Ok(None),
        }
    }

    async fn list_definitions(
        &self,
        page: &Pagination,
    ) -> Result<Page<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition FROM workflows ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(Page {
            items: decode_definitions(&rows)?,
            total: self.count("SELECT COUNT(*) FROM workflows", None).await?,
        })
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, e: &WorkflowExecution) -> Result<(), RepositoryError> {
        let output = e.output_data.as_ref().map(to_json).transpose()?;
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_id, status, started_at, completed_at, input_data, output_data, logs, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(e.id.to_string())
        .bind(e.workflow_id.to_string())
        .bind(e.status.to_string())
        .bind(format_datetime(&e.started_at))
        .bind(e.completed_at.as_ref().map(format_datetime))
        .bind(to_json(&e.input_data)?)
        .bind(output)
        .bind(to_json(&e.logs)?)
        .bind(&e.error)
        .execute(&self.pool.writer)
        .await
        .map_err(|err| insert_error(err, &e.id))?;

        Ok(())
    }

    async fn update_execution(&self, e: &WorkflowExecution) -> Result<(), RepositoryError> {
        let output = e.output_data.as_ref().map(to_json).transpose()?;
        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = ?, completed_at = ?, output_data = ?, logs = ?, error = ?
               WHERE id = ?"#,
        )
        .bind(e.status.to_string())
        .bind(e.completed_at.as_ref().map(format_datetime))
        .bind(output)
        .bind(to_json(&e.logs)?)
        .bind(&e.error)
        .bind(e.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        page: &Pagination,
    ) -> Result<Page<WorkflowExecution>, RepositoryError> {
        let workflow_id = workflow_id.map(Uuid::to_string);
        let rows = match &workflow_id {
            Some(wf) => {
                sqlx::query(
                    r#"SELECT * FROM workflow_executions WHERE workflow_id = ?
                       ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?"#,
                )
                .bind(wf)
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM workflow_executions ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            items.push(r.into_execution()?);
        }

        let total = match &workflow_id {
            Some(wf) => {
                self.count(
                    "SELECT COUNT(*) FROM workflow_executions WHERE workflow_id = ?",
                    Some(wf),
                )
                .await?
            }
            None => {
                self.count("SELECT COUNT(*) FROM workflow_executions", None)
                    .await?
            }
        };
        Ok(Page { items, total })
    }

    async fn create_template(&self, t: &WorkflowTemplate) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_templates
               (id, name, description, category, definition, is_public, usage_count, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(t.id.to_string())
        .bind(&t.name)
        .bind(&t.description)
        .bind(&t.category)
        .bind(to_json(&t.definition)?)
        .bind(t.is_public)
        .bind(t.usage_count as i64)
        .bind(format_datetime(&t.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, &t.id))?;

        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<WorkflowTemplate>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_templates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = TemplateRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_template()?))
            }
            None => Ok(None),
        }
    }

    async fn list_templates(
        &self,
        category: Option<&str>,
        page: &Pagination,
    ) -> Result<Page<WorkflowTemplate>, RepositoryError> {
        let rows = match category {
            Some(c) => {
                sqlx::query(
                    r#"SELECT * FROM workflow_templates WHERE category = ?
                       ORDER BY usage_count DESC, created_at DESC LIMIT ? OFFSET ?"#,
                )
                .bind(c)
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM workflow_templates ORDER BY usage_count DESC, created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TemplateRow::from_row(row).map_err(query_error)?;
            items.push(r.into_template()?);
        }

        let total = match category {
            Some(c) => {
                self.count(
                    "SELECT COUNT(*) FROM workflow_templates WHERE category = ?",
                    Some(c),
                )
                .await?
            }
            None => {
                self.count("SELECT COUNT(*) FROM workflow_templates", None)
                    .await?
            }
        };
        Ok(Page { items, total })
    }

    async fn increment_template_usage(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE workflow_templates SET usage_count = usage_count + 1 WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fragmentflow_types::workflow::LogEntryType;
    use serde_json::json;
    use std::collections::HashMap;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_definition(name: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": name,
            "description": "Load and chart sales data",
            "nodes": [
                {
                    "id": "load",
                    "config": { "template": "code-interpreter-v1" },
                    "outputs": [
                        { "id": "result", "name": "result", "direction": "output", "data_type": "object" }
                    ]
                },
                {
                    "id": "chart",
                    "config": { "template": "code-interpreter-v1" },
                    "dependencies": ["load"]
                }
            ]
        }))
        .unwrap()
    }

    fn sample_execution(workflow_id: Uuid) -> WorkflowExecution {
        let mut e = WorkflowExecution::new(workflow_id, HashMap::from([("n".into(), json!(3))]));
        e.status = ExecutionStatus::Completed;
        e.completed_at = Some(Utc::now());
        e.output_data = Some(HashMap::from([("final_chart".into(), json!({"ok": true}))]));
        e.log("chart", LogEntryType::Complete, "node chart completed", None);
        e
    }

    fn sample_template(def: WorkflowDefinition, category: &str) -> WorkflowTemplate {
        WorkflowTemplate {
            id: Uuid::now_v7(),
            name: def.name.clone(),
            description: String::new(),
            category: category.to_string(),
            definition: def,
            is_public: true,
            usage_count: 0,
            created_at: Utc::now(),
        }
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_create_and_get_definition() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition("sales-report");

        repo.create_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "sales-report");
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.nodes[1].dependencies, vec!["load"]);
    }

    #[tokio::test]
    async fn test_create_definition_conflict() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition("dup");

        repo.create_definition(&def).await.unwrap();
        let err = repo.create_definition(&def).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_definition() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let mut def = sample_definition("v1");
        repo.create_definition(&def).await.unwrap();

        def.version = 2;
        def.name = "v2".to_string();
        repo.update_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.name, "v2");

        let missing = sample_definition("ghost");
        assert!(matches!(
            repo.update_definition(&missing).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_definitions_paginated() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        for i in 0..3 {
            repo.create_definition(&sample_definition(&format!("wf-{i}")))
                .await
                .unwrap();
        }

        let page = repo
            .list_definitions(&Pagination { limit: 2, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 3);

        let rest = repo
            .list_definitions(&Pagination { limit: 2, offset: 2 })
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_definition_cascades() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition("doomed");
        repo.create_definition(&def).await.unwrap();
        let exec = sample_execution(def.id);
        repo.create_execution(&exec).await.unwrap();

        assert!(repo.delete_definition(&def.id).await.unwrap());
        assert!(!repo.delete_definition(&def.id).await.unwrap());
        assert!(repo.get_execution(&exec.id).await.unwrap().is_none());
    }

    // -- Executions --

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition("exec");
        repo.create_definition(&def).await.unwrap();
        let exec = sample_execution(def.id);

        repo.create_execution(&exec).await.unwrap();

        let loaded = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.input_data["n"], json!(3));
        assert_eq!(
            loaded.output_data.unwrap()["final_chart"],
            json!({"ok": true})
        );
        assert_eq!(loaded.logs.len(), 1);
        assert_eq!(loaded.logs[0].entry_type, LogEntryType::Complete);
    }

    #[tokio::test]
    async fn test_update_execution() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition("exec");
        repo.create_definition(&def).await.unwrap();
        let mut exec = WorkflowExecution::new(def.id, HashMap::new());
        exec.status = ExecutionStatus::Running;
        repo.create_execution(&exec).await.unwrap();

        exec.status = ExecutionStatus::Failed;
        exec.error = Some("node 'chart' failed after 1 attempt(s): boom".to_string());
        exec.completed_at = Some(Utc::now());
        repo.update_execution(&exec).await.unwrap();

        let loaded = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert!(loaded.error.unwrap().contains("boom"));
        assert!(loaded.completed_at.is_some());
        assert!(loaded.output_data.is_none());
    }

    #[tokio::test]
    async fn test_list_executions_by_workflow() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let a = sample_definition("a");
        let b = sample_definition("b");
        repo.create_definition(&a).await.unwrap();
        repo.create_definition(&b).await.unwrap();
        repo.create_execution(&sample_execution(a.id)).await.unwrap();
        repo.create_execution(&sample_execution(a.id)).await.unwrap();
        repo.create_execution(&sample_execution(b.id)).await.unwrap();

        let only_a = repo
            .list_executions(Some(&a.id), &Pagination::default())
            .await
            .unwrap();
        assert_eq!(only_a.total, 2);
        assert!(only_a.items.iter().all(|e| e.workflow_id == a.id));

        let all = repo
            .list_executions(None, &Pagination::default())
            .await
            .unwrap();
        assert_eq!(all.total, 3);
    }

    // -- Templates --

    #[tokio::test]
    async fn test_templates_by_category_and_usage() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let popular = sample_template(sample_definition("popular"), "data");
        let quiet = sample_template(sample_definition("quiet"), "data");
        let other = sample_template(sample_definition("web"), "web");
        for t in [&popular, &quiet, &other] {
            repo.create_template(t).await.unwrap();
        }
        repo.increment_template_usage(&popular.id).await.unwrap();
        repo.increment_template_usage(&popular.id).await.unwrap();

        let data = repo
            .list_templates(Some("data"), &Pagination::default())
            .await
            .unwrap();
        assert_eq!(data.total, 2);
        assert_eq!(data.items[0].id, popular.id);
        assert_eq!(data.items[0].usage_count, 2);

        let loaded = repo.get_template(&other.id).await.unwrap().unwrap();
        assert_eq!(loaded.definition.name, "web");
        assert!(loaded.is_public);

        assert!(matches!(
            repo.increment_template_usage(&Uuid::now_v7()).await,
            Err(RepositoryError::NotFound)
        ));
    }
}
