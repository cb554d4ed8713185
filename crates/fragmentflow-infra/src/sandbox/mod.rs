//! Local process sandbox.
//!
//! Implements [`SandboxService`] on the host: each sandbox is a temporary
//! directory, commands run through `sh -c` inside it, and code runs through
//! a configurable interpreter (`python3` by default). Background commands are
//! killed when the sandbox is destroyed.
//!
//! This gives no isolation beyond a private working directory. It exists for
//! development and tests; production deployments plug a remote runtime into
//! the same trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use dashmap::DashMap;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use uuid::Uuid;

use fragmentflow_core::sandbox::{
    CodeOutput, CommandOptions, CommandOutput, RuntimeError, SandboxError, SandboxHandle,
    SandboxOptions, SandboxService, validate_file_path,
};

/// File the code of a `run_code` call is written to.
const CODE_FILE: &str = ".fragment_main";

struct LocalSandbox {
    dir: TempDir,
    env: HashMap<String, String>,
    background: Mutex<Vec<Child>>,
}

/// Host-process implementation of [`SandboxService`].
pub struct LocalProcessSandbox {
    root: PathBuf,
    interpreter: String,
    sandboxes: DashMap<String, LocalSandbox>,
}

impl LocalProcessSandbox {
    /// Sandboxes are created as temporary directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            interpreter: "python3".to_string(),
            sandboxes: DashMap::new(),
        }
    }

    /// Program used by `run_code`, invoked as `<interpreter> <file>`.
    pub fn with_interpreter(mut self, interpreter: &str) -> Self {
        self.interpreter = interpreter.to_string();
        self
    }

    /// Number of live sandboxes.
    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    fn workdir(&self, handle: &SandboxHandle) -> Result<(PathBuf, HashMap<String, String>), SandboxError> {
        let sandbox = self
            .sandboxes
            .get(&handle.id)
            .ok_or_else(|| SandboxError::Command(format!("unknown sandbox '{}'", handle.id)))?;
        Ok((sandbox.dir.path().to_path_buf(), sandbox.env.clone()))
    }
}

fn shell(command: &str, dir: &Path, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(dir)
        .envs(env)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Last stderr line of the form `Name: value`, as raised by Python.
fn parse_runtime_error(stderr: &str) -> RuntimeError {
    let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    let (name, value) = match last.split_once(": ") {
        Some((name, value)) if !name.contains(' ') => (name.to_string(), value.to_string()),
        _ => ("Error".to_string(), last.trim().to_string()),
    };
    RuntimeError {
        name,
        value,
        traceback: stderr.to_string(),
    }
}

impl SandboxService for LocalProcessSandbox {
    async fn create(
        &self,
        template: &str,
        options: &SandboxOptions,
    ) -> Result<SandboxHandle, SandboxError> {
        let create_err = |message: String| SandboxError::Create {
            template: template.to_string(),
            message,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| create_err(e.to_string()))?;
        let dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&self.root)
            .map_err(|e| create_err(e.to_string()))?;

        let handle = SandboxHandle {
            id: Uuid::now_v7().to_string(),
            template: template.to_string(),
        };
        tracing::info!(
            sandbox_id = %handle.id,
            template,
            dir = %dir.path().display(),
            "local sandbox created"
        );
        self.sandboxes.insert(
            handle.id.clone(),
            LocalSandbox {
                dir,
                env: options.env.clone(),
                background: Mutex::new(Vec::new()),
            },
        );
        Ok(handle)
    }

    async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        validate_file_path(path)?;
        let (dir, _) = self.workdir(handle)?;
        let target = dir.join(path);
        let write_err = |e: std::io::Error| SandboxError::WriteFile {
            path: path.to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&target, content).await.map_err(write_err)
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput, SandboxError> {
        let (dir, mut env) = self.workdir(handle)?;
        env.extend(options.env.clone());
        let mut cmd = shell(command, &dir, &env);

        if options.background {
            let child = cmd
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| SandboxError::Command(format!("failed to spawn '{command}': {e}")))?;
            if let Some(sandbox) = self.sandboxes.get(&handle.id) {
                sandbox
                    .background
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(child);
            }
            return Ok(CommandOutput::default());
        }

        let run = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).output();
        let output = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                SandboxError::Command(format!("'{command}' timed out after {}ms", limit.as_millis()))
            })?,
            None => run.await,
        }
        .map_err(|e| SandboxError::Command(format!("failed to run '{command}': {e}")))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// Runs the code to completion. A non-zero exit becomes a
    /// [`RuntimeError`]; a last stdout line holding JSON becomes the result.
    async fn run_code(&self, handle: &SandboxHandle, code: &str) -> Result<CodeOutput, SandboxError> {
        let (dir, env) = self.workdir(handle)?;
        let file = dir.join(CODE_FILE);
        tokio::fs::write(&file, code)
            .await
            .map_err(|e| SandboxError::Code(format!("failed to stage code: {e}")))?;

        let output = Command::new(&self.interpreter)
            .arg(&file)
            .current_dir(&dir)
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Code(format!("failed to start {}: {e}", self.interpreter)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let error = (!output.status.success()).then(|| parse_runtime_error(&stderr));
        let results = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter(|v| v.is_object() || v.is_array())
            .into_iter()
            .collect();

        Ok(CodeOutput {
            results,
            stdout: stdout.lines().map(|l| format!("{l}\n")).collect(),
            stderr: stderr.lines().map(|l| format!("{l}\n")).collect(),
            error,
        })
    }

    async fn public_url(&self, handle: &SandboxHandle, port: u16) -> Result<String, SandboxError> {
        if !self.sandboxes.contains_key(&handle.id) {
            return Err(SandboxError::Url {
                port,
                message: format!("unknown sandbox '{}'", handle.id),
            });
        }
        Ok(format!("http://127.0.0.1:{port}"))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let Some((_, sandbox)) = self.sandboxes.remove(&handle.id) else {
            return Err(SandboxError::Destroy(format!("unknown sandbox '{}'", handle.id)));
        };

        let children = std::mem::take(
            &mut *sandbox.background.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for mut child in children {
            if let Err(e) = child.kill().await {
                tracing::warn!(sandbox_id = %handle.id, error = %e, "failed to kill background process");
            }
        }

        sandbox
            .dir
            .close()
            .map_err(|e| SandboxError::Destroy(e.to_string()))?;
        tracing::info!(sandbox_id = %handle.id, "local sandbox destroyed");
        Ok(())
    }
}
