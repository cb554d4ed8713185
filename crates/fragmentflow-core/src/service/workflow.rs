//! Workflow service.
//!
//! Ties persistence to execution: definitions are validated before they are
//! saved, executions run on the shared `DagExecutor` and are stored once
//! they reach a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fragmentflow_types::error::RepositoryError;
use fragmentflow_types::workflow::{
    Page, Pagination, WorkflowDefinition, WorkflowExecution, WorkflowTemplate,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::executor::DagExecutor;
use crate::workflow::runner::NodeRunner;
use crate::workflow::validator::{ValidationError, validate};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Generic over repository and node runner so the core never depends on
/// fragmentflow-infra.
pub struct WorkflowService<R: WorkflowRepository, N: NodeRunner> {
    repo: R,
    executor: Arc<DagExecutor<N>>,
}

impl<R: WorkflowRepository, N: NodeRunner> WorkflowService<R, N> {
    pub fn new(repo: R, executor: Arc<DagExecutor<N>>) -> Self {
        Self { repo, executor }
    }

    /// Validate and store a definition.
    ///
    /// Unknown ids are created at version 1; known ids are replaced and
    /// their version bumped.
    pub async fn save_workflow(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ServiceError> {
        validate(&def)?;
        match self.repo.get_definition(&def.id).await? {
            Some(existing) => {
                def.version = existing.version + 1;
                self.repo.update_definition(&def).await?;
            }
            None => {
                def.version = def.version.max(1);
                self.repo.create_definition(&def).await?;
            }
        }
        tracing::info!(workflow_id = %def.id, version = def.version, "workflow saved");
        Ok(def)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowDefinition, ServiceError> {
        self.repo
            .get_definition(&id)
            .await?
            .ok_or(ServiceError::NotFound {
                kind: "workflow",
                id,
            })
    }

    pub async fn list_workflows(
        &self,
        page: &Pagination,
    ) -> Result<Page<WorkflowDefinition>, ServiceError> {
        Ok(self.repo.list_definitions(page).await?)
    }

    pub async fn delete_workflow(&self, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.repo.delete_definition(&id).await?)
    }

    /// Load a stored workflow, run it to completion, and persist the execution.
    ///
    /// The executor's in-memory copy is dropped once the row is written; a
    /// failed write leaves it there so `get_execution` still finds it.
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        input_data: HashMap<String, Value>,
    ) -> Result<WorkflowExecution, ServiceError> {
        let def = self.get_workflow(workflow_id).await?;
        let execution = self.executor.execute(&def, input_data).await;
        self.repo.create_execution(&execution).await?;
        self.executor.remove_execution(execution.id);
        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %workflow_id,
            status = %execution.status,
            "execution persisted"
        );
        Ok(execution)
    }

    /// Live executions come from the executor, finished ones from storage.
    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, ServiceError> {
        if let Some(live) = self.executor.get_execution(id) {
            return Ok(live);
        }
        self.repo
            .get_execution(&id)
            .await?
            .ok_or(ServiceError::NotFound {
                kind: "execution",
                id,
            })
    }

    pub async fn list_executions(
        &self,
        workflow_id: Option<Uuid>,
        page: &Pagination,
    ) -> Result<Page<WorkflowExecution>, ServiceError> {
        Ok(self.repo.list_executions(workflow_id.as_ref(), page).await?)
    }

    pub fn cancel_execution(&self, id: Uuid) -> bool {
        self.executor.cancel_execution(id)
    }

    /// Store an existing workflow as a reusable template.
    pub async fn save_as_template(
        &self,
        workflow_id: Uuid,
        category: &str,
        is_public: bool,
    ) -> Result<WorkflowTemplate, ServiceError> {
        let def = self.get_workflow(workflow_id).await?;
        let template = WorkflowTemplate {
            id: Uuid::now_v7(),
            name: def.name.clone(),
            description: def.description.clone().unwrap_or_default(),
            category: category.to_string(),
            definition: def,
            is_public,
            usage_count: 0,
            created_at: Utc::now(),
        };
        self.repo.create_template(&template).await?;
        Ok(template)
    }

    pub async fn list_templates(
        &self,
        category: Option<&str>,
        page: &Pagination,
    ) -> Result<Page<WorkflowTemplate>, ServiceError> {
        Ok(self.repo.list_templates(category, page).await?)
    }

    /// Create a new workflow from a template and count the use.
    pub async fn instantiate_template(
        &self,
        template_id: Uuid,
        name: Option<&str>,
    ) -> Result<WorkflowDefinition, ServiceError> {
        let template = self
            .repo
            .get_template(&template_id)
            .await?
            .ok_or(ServiceError::NotFound {
                kind: "template",
                id: template_id,
            })?;

        let mut def = template.definition;
        def.id = Uuid::now_v7();
        def.version = 1;
        if let Some(name) = name {
            def.name = name.to_string();
        }
        let def = self.save_workflow(def).await?;
        self.repo.increment_template_usage(&template_id).await?;
        Ok(def)
    }
}
