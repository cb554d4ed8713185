//! Fragment executor: adapts one workflow node into a sandbox lifecycle.
//!
//! Compute fragments run their code once and the sandbox is always torn
//! down afterwards. Service fragments install dependencies, optionally
//! start a server, and return a public URL; on success their sandbox is
//! left running to back a live preview.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fragmentflow_types::fragment::{FragmentSpec, NodeResult, TemplateClass, env};
use fragmentflow_types::workflow::FragmentNode;
use serde_json::Value;

use super::mapper::{DEFAULT_SERVICE_PORT, node_to_fragment, template, template_class};
use crate::sandbox::{
    CommandOptions, SandboxHandle, SandboxOptions, SandboxService, validate_file_path,
};
use crate::workflow::runner::{NodeContext, NodeExecutionError, NodeRunner};

/// File the resolved inputs are written to, relative to the sandbox root.
pub const INPUTS_FILE: &str = "fragment_inputs.json";

/// Environment variable pointing fragment code at [`INPUTS_FILE`].
pub const INPUTS_ENV: &str = "FRAGMENT_INPUTS";

/// Time allowed for a dependency install command.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Sandbox lifetime requested from the runtime (service previews outlive the node).
pub const SANDBOX_LIFETIME: Duration = Duration::from_secs(600);

pub struct FragmentExecutor<S> {
    sandbox: Arc<S>,
}

impl<S: SandboxService> FragmentExecutor<S> {
    pub fn new(sandbox: Arc<S>) -> Self {
        Self { sandbox }
    }

    /// Run a node's fragment with resolved inputs.
    ///
    /// The attempt is bounded by `ctx.timeout` and interrupted by
    /// `ctx.cancel`; a compute sandbox is destroyed in every case.
    pub async fn execute(
        &self,
        node: &FragmentNode,
        inputs: &HashMap<String, Value>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, NodeExecutionError> {
        let fragment = node_to_fragment(node);
        if fragment.code.trim().is_empty() {
            return Err(NodeExecutionError::InvalidNode(format!(
                "node '{}' has no code",
                node.id
            )));
        }
        validate_file_path(&fragment.file_path)?;

        let class = template_class(&fragment.template, fragment.port);
        let options = SandboxOptions {
            timeout: SANDBOX_LIFETIME.max(ctx.timeout),
            env: sandbox_env(node),
            metadata: HashMap::from([
                ("node_id".to_string(), node.id.clone()),
                ("template".to_string(), fragment.template.clone()),
                ("execution_id".to_string(), ctx.execution_id.to_string()),
            ]),
            resources: node.config.resources.clone(),
        };

        let handle = self.sandbox.create(&fragment.template, &options).await?;
        tracing::debug!(
            node_id = %node.id,
            sandbox_id = %handle.id,
            template = %fragment.template,
            ?class,
            "sandbox created"
        );

        let work = async {
            self.prepare(&handle, &fragment, inputs, &options.env).await?;
            match class {
                TemplateClass::Compute => self.run_compute(&handle, &fragment).await,
                TemplateClass::Service => self.start_service(&handle, &fragment, &options.env).await,
            }
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(ctx.timeout, work) => match res {
                Ok(inner) => inner,
                Err(_) => Err(NodeExecutionError::Timeout(ctx.timeout.as_millis() as u64)),
            },
            _ = ctx.cancel.cancelled() => Err(NodeExecutionError::Cancelled),
        };

        // Service sandboxes stay up only when they produced a URL.
        if class == TemplateClass::Compute || outcome.is_err() {
            self.teardown(&handle).await;
        }
        outcome
    }

    /// Write inputs and code, install dependencies.
    async fn prepare(
        &self,
        handle: &SandboxHandle,
        fragment: &FragmentSpec,
        inputs: &HashMap<String, Value>,
        vars: &HashMap<String, String>,
    ) -> Result<(), NodeExecutionError> {
        let inputs_json = serde_json::to_string(inputs)
            .map_err(|e| NodeExecutionError::InvalidNode(format!("unserializable inputs: {e}")))?;
        self.sandbox
            .write_file(handle, INPUTS_FILE, &inputs_json)
            .await?;

        if let Some(cmd) = fragment
            .install_dependencies_command
            .as_deref()
            .filter(|_| !fragment.additional_dependencies.is_empty())
        {
            let opts = CommandOptions {
                env: vars.clone(),
                background: false,
                timeout: Some(INSTALL_TIMEOUT),
            };
            // Install failures are tolerated; the code may still run.
            match self.sandbox.run_command(handle, cmd, &opts).await {
                Ok(out) if out.exit_code == Some(0) => {
                    tracing::debug!(sandbox_id = %handle.id, "dependencies installed");
                }
                Ok(out) => {
                    tracing::warn!(
                        sandbox_id = %handle.id,
                        exit_code = ?out.exit_code,
                        stderr = %out.stderr,
                        "dependency installation failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %handle.id, error = %e, "dependency installation failed");
                }
            }
        }

        self.sandbox
            .write_file(handle, &fragment.file_path, &fragment.code)
            .await?;
        Ok(())
    }

    async fn run_compute(
        &self,
        handle: &SandboxHandle,
        fragment: &FragmentSpec,
    ) -> Result<NodeResult, NodeExecutionError> {
        let output = self.sandbox.run_code(handle, &fragment.code).await?;
        if let Some(err) = output.error {
            return Err(NodeExecutionError::Runtime {
                name: err.name,
                value: err.value,
            });
        }
        Ok(NodeResult {
            sandbox_id: handle.id.clone(),
            template: fragment.template.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            results: output.results,
            url: None,
        })
    }

    async fn start_service(
        &self,
        handle: &SandboxHandle,
        fragment: &FragmentSpec,
        vars: &HashMap<String, String>,
    ) -> Result<NodeResult, NodeExecutionError> {
        let port = fragment
            .port
            .or_else(|| template(&fragment.template).and_then(|t| t.default_port))
            .unwrap_or(DEFAULT_SERVICE_PORT);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(cmd) = vars.get(env::START_COMMAND).filter(|c| !c.trim().is_empty()) {
            let opts = CommandOptions {
                env: vars.clone(),
                background: true,
                timeout: None,
            };
            let out = self.sandbox.run_command(handle, cmd, &opts).await?;
            stdout.push(out.stdout);
            stderr.push(out.stderr);
        }

        let url = self.sandbox.public_url(handle, port).await?;
        tracing::info!(sandbox_id = %handle.id, %url, "service fragment started");
        Ok(NodeResult {
            sandbox_id: handle.id.clone(),
            template: fragment.template.clone(),
            stdout,
            stderr,
            results: Vec::new(),
            url: Some(url),
        })
    }

    async fn teardown(&self, handle: &SandboxHandle) {
        match self.sandbox.destroy(handle).await {
            Ok(()) => tracing::debug!(sandbox_id = %handle.id, "sandbox destroyed"),
            Err(e) => tracing::warn!(sandbox_id = %handle.id, error = %e, "sandbox teardown failed"),
        }
    }
}

/// Node environment minus the code payload, plus the inputs file pointer.
fn sandbox_env(node: &FragmentNode) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = node
        .config
        .environment
        .iter()
        .filter(|(k, _)| k.as_str() != env::CODE)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    vars.insert(INPUTS_ENV.to_string(), INPUTS_FILE.to_string());
    vars
}

impl<S: SandboxService + 'static> NodeRunner for FragmentExecutor<S> {
    async fn run(
        &self,
        node: &FragmentNode,
        inputs: &HashMap<String, Value>,
        ctx: &NodeContext,
    ) -> Result<Value, NodeExecutionError> {
        self.execute(node, inputs, ctx)
            .await
            .map(|result| result.to_output_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CodeOutput, CommandOutput, RuntimeError, SandboxError};
    use fragmentflow_types::workflow::{NodeConfig, Position};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    /// Scripted sandbox that records every call.
    #[derive(Default)]
    struct MockSandbox {
        calls: Mutex<Vec<String>>,
        fail_create: bool,
        runtime_error: bool,
        install_exit: Option<i32>,
        hang_code: bool,
        fail_url: bool,
    }

    impl MockSandbox {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl SandboxService for MockSandbox {
        async fn create(
            &self,
            template: &str,
            _options: &SandboxOptions,
        ) -> Result<SandboxHandle, SandboxError> {
            self.record(format!("create:{template}"));
            if self.fail_create {
                return Err(SandboxError::Create {
                    template: template.to_string(),
                    message: "quota exceeded".into(),
                });
            }
            Ok(SandboxHandle {
                id: "sb-1".into(),
                template: template.to_string(),
            })
        }

        async fn write_file(
            &self,
            _handle: &SandboxHandle,
            path: &str,
            _content: &str,
        ) -> Result<(), SandboxError> {
            self.record(format!("write:{path}"));
            Ok(())
        }

        async fn run_command(
            &self,
            _handle: &SandboxHandle,
            command: &str,
            options: &CommandOptions,
        ) -> Result<CommandOutput, SandboxError> {
            self.record(format!("cmd:{command}:bg={}", options.background));
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "pip error".into(),
                exit_code: if options.background { None } else { self.install_exit },
            })
        }

        async fn run_code(
            &self,
            _handle: &SandboxHandle,
            _code: &str,
        ) -> Result<CodeOutput, SandboxError> {
            self.record("run_code".into());
            if self.hang_code {
                std::future::pending::<()>().await;
            }
            if self.runtime_error {
                return Ok(CodeOutput {
                    error: Some(RuntimeError {
                        name: "ZeroDivisionError".into(),
                        value: "division by zero".into(),
                        traceback: String::new(),
                    }),
                    ..Default::default()
                });
            }
            Ok(CodeOutput {
                results: vec![serde_json::json!({"answer": 42})],
                stdout: vec!["42\n".into()],
                stderr: vec![],
                error: None,
            })
        }

        async fn public_url(&self, _handle: &SandboxHandle, port: u16) -> Result<String, SandboxError> {
            self.record(format!("url:{port}"));
            if self.fail_url {
                return Err(SandboxError::Url {
                    port,
                    message: "not exposed".into(),
                });
            }
            Ok(format!("https://{port}-sb-1.sandbox.local"))
        }

        async fn destroy(&self, _handle: &SandboxHandle) -> Result<(), SandboxError> {
            self.record("destroy".into());
            Ok(())
        }
    }

    fn node(template: &str, env_pairs: &[(&str, &str)]) -> FragmentNode {
        FragmentNode {
            id: "n1".into(),
            fragment_id: None,
            position: Position::default(),
            inputs: vec![],
            outputs: vec![],
            config: NodeConfig {
                template: template.into(),
                environment: env_pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                resources: Default::default(),
                retry_policy: Default::default(),
            },
            dependencies: vec![],
            timeout_ms: None,
        }
    }

    fn ctx(timeout: Duration) -> NodeContext {
        NodeContext {
            execution_id: Uuid::now_v7(),
            attempt: 1,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_compute_runs_and_destroys() {
        let sandbox = Arc::new(MockSandbox {
            install_exit: Some(0),
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node(
            "code-interpreter-v1",
            &[
                (env::CODE, "print(42)"),
                (env::DEPENDENCIES, "numpy"),
                (env::INSTALL_COMMAND, "pip install numpy"),
            ],
        );
        let result = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.results[0]["answer"], 42);
        assert!(result.url.is_none());
        assert_eq!(
            sandbox.calls(),
            vec![
                "create:code-interpreter-v1",
                "write:fragment_inputs.json",
                "cmd:pip install numpy:bg=false",
                "write:main.py",
                "run_code",
                "destroy",
            ]
        );
    }

    #[tokio::test]
    async fn test_install_failure_is_tolerated() {
        let sandbox = Arc::new(MockSandbox {
            install_exit: Some(1),
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node(
            "code-interpreter-v1",
            &[
                (env::CODE, "print(1)"),
                (env::DEPENDENCIES, "nope"),
                (env::INSTALL_COMMAND, "pip install nope"),
            ],
        );
        assert!(
            exec.execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_runtime_error_fails_and_destroys() {
        let sandbox = Arc::new(MockSandbox {
            runtime_error: true,
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node("code-interpreter-v1", &[(env::CODE, "1/0")]);
        let err = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeExecutionError::Runtime { ref name, .. } if name == "ZeroDivisionError"));
        assert_eq!(sandbox.calls().last().unwrap(), "destroy");
    }

    #[tokio::test]
    async fn test_service_keeps_sandbox_alive() {
        let sandbox = Arc::new(MockSandbox::default());
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node(
            "streamlit-developer",
            &[
                (env::CODE, "import streamlit"),
                (env::START_COMMAND, "streamlit run app.py"),
            ],
        );
        let result = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.url.as_deref(), Some("https://8501-sb-1.sandbox.local"));
        let calls = sandbox.calls();
        assert!(calls.contains(&"cmd:streamlit run app.py:bg=true".to_string()));
        assert!(!calls.contains(&"destroy".to_string()));
        assert!(!calls.contains(&"run_code".to_string()));
    }

    #[tokio::test]
    async fn test_service_failure_tears_down() {
        let sandbox = Arc::new(MockSandbox {
            fail_url: true,
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node("nextjs-developer", &[(env::CODE, "export default 1"), (env::PORT, "4000")]);
        let err = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeExecutionError::Sandbox(SandboxError::Url { port: 4000, .. })));
        assert_eq!(sandbox.calls().last().unwrap(), "destroy");
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let sandbox = Arc::new(MockSandbox {
            fail_create: true,
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node("code-interpreter-v1", &[(env::CODE, "print(1)")]);
        let err = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(sandbox.calls(), vec!["create:code-interpreter-v1"]);
    }

    #[tokio::test]
    async fn test_invalid_path_rejected_before_create() {
        let sandbox = Arc::new(MockSandbox::default());
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node(
            "code-interpreter-v1",
            &[(env::CODE, "print(1)"), (env::FILE_PATH, "../escape.py")],
        );
        let err = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeExecutionError::Sandbox(SandboxError::InvalidPath(_))));
        assert!(sandbox.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_destroys() {
        let sandbox = Arc::new(MockSandbox {
            hang_code: true,
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node("code-interpreter-v1", &[(env::CODE, "while True: pass")]);
        let err = exec
            .execute(&n, &HashMap::new(), &ctx(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeExecutionError::Timeout(50)));
        assert_eq!(sandbox.calls().last().unwrap(), "destroy");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_and_destroys() {
        let sandbox = Arc::new(MockSandbox {
            hang_code: true,
            ..Default::default()
        });
        let exec = FragmentExecutor::new(sandbox.clone());
        let n = node("code-interpreter-v1", &[(env::CODE, "while True: pass")]);
        let c = ctx(Duration::from_secs(60));
        c.cancel.cancel();
        let err = exec.execute(&n, &HashMap::new(), &c).await.unwrap_err();
        assert!(matches!(err, NodeExecutionError::Cancelled));
        assert_eq!(sandbox.calls().last().unwrap(), "destroy");
    }
}
