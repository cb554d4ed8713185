//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions and
//! named templates. The infrastructure layer (fragmentflow-infra) implements
//! this trait with SQLite persistence.

use std::future::Future;

use fragmentflow_types::error::RepositoryError;
use fragmentflow_types::workflow::{
    Page, Pagination, WorkflowDefinition, WorkflowExecution, WorkflowTemplate,
};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** create/read/update/delete, listed newest first.
/// - **Executions:** stored once terminal, listed newest first.
/// - **Templates:** reusable definitions with a usage counter.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new definition. `Conflict` if the id already exists.
    fn create_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace an existing definition. `NotFound` if the id is unknown.
    fn update_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    fn list_definitions(
        &self,
        page: &Pagination,
    ) -> impl Future<Output = Result<Page<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a definition and its executions. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace status, outputs, logs and error of a stored execution.
    fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions, optionally for one workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        page: &Pagination,
    ) -> impl Future<Output = Result<Page<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    fn create_template(
        &self,
        template: &WorkflowTemplate,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_template(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowTemplate>, RepositoryError>> + Send;

    /// List templates, optionally by category, most used first.
    fn list_templates(
        &self,
        category: Option<&str>,
        page: &Pagination,
    ) -> impl Future<Output = Result<Page<WorkflowTemplate>, RepositoryError>> + Send;

    /// Bump a template's usage counter. `NotFound` if the id is unknown.
    fn increment_template_usage(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
