//! Sandbox collaborator contract.
//!
//! The sandbox runtime is an external service: create an isolated
//! environment from a template, write files into it, run commands or code,
//! expose a port, tear it down. Implementations live in fragmentflow-infra.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use fragmentflow_types::workflow::ResourceHints;
use serde::{Deserialize, Serialize};

/// Longest relative path accepted by [`validate_file_path`].
pub const MAX_FILE_PATH_LEN: usize = 200;

/// Extensions a fragment may write into a sandbox.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".js", ".ts", ".jsx", ".tsx", ".vue", ".html", ".css", ".json", ".md", ".txt", ".py",
    ".java", ".php", ".rb", ".go", ".rs", ".sql", ".yml", ".yaml",
];

/// Errors raised by a sandbox implementation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox creation failed for template '{template}': {message}")]
    Create { template: String, message: String },

    #[error("failed to write '{path}': {message}")]
    WriteFile { path: String, message: String },

    #[error("command failed: {0}")]
    Command(String),

    #[error("code execution failed: {0}")]
    Code(String),

    #[error("no public url for port {port}: {message}")]
    Url { port: u16, message: String },

    #[error("sandbox teardown failed: {0}")]
    Destroy(String),

    #[error("invalid file path '{0}'")]
    InvalidPath(String),
}

/// Reference to a live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub template: String,
}

/// Options for [`SandboxService::create`].
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Lifetime of the sandbox before the runtime reclaims it.
    pub timeout: Duration,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub resources: ResourceHints,
}

/// Options for [`SandboxService::run_command`].
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub env: HashMap<String, String>,
    /// Start the command and return without waiting for it to exit.
    pub background: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` for background commands or when the process was killed.
    pub exit_code: Option<i32>,
}

/// Error raised by the code itself (not by the sandbox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub traceback: String,
}

/// Output of [`SandboxService::run_code`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeOutput {
    pub results: Vec<serde_json::Value>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<RuntimeError>,
}

/// Trait for sandbox runtimes.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait SandboxService: Send + Sync {
    fn create(
        &self,
        template: &str,
        options: &SandboxOptions,
    ) -> impl Future<Output = Result<SandboxHandle, SandboxError>> + Send;

    fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &str,
    ) -> impl Future<Output = Result<(), SandboxError>> + Send;

    fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        options: &CommandOptions,
    ) -> impl Future<Output = Result<CommandOutput, SandboxError>> + Send;

    fn run_code(
        &self,
        handle: &SandboxHandle,
        code: &str,
    ) -> impl Future<Output = Result<CodeOutput, SandboxError>> + Send;

    fn public_url(
        &self,
        handle: &SandboxHandle,
        port: u16,
    ) -> impl Future<Output = Result<String, SandboxError>> + Send;

    fn destroy(&self, handle: &SandboxHandle)
    -> impl Future<Output = Result<(), SandboxError>> + Send;
}

/// Reject paths that could escape the sandbox root or write unexpected files.
pub fn validate_file_path(path: &str) -> Result<(), SandboxError> {
    let invalid = path.is_empty()
        || path.contains("..")
        || path.contains('~')
        || path.starts_with('/')
        || path.starts_with('\\')
        || path.len() > MAX_FILE_PATH_LEN
        || !ALLOWED_EXTENSIONS.iter().any(|ext| path.ends_with(ext));
    if invalid {
        return Err(SandboxError::InvalidPath(path.to_string()));
    }
    Ok(())
}
