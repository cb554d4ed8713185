//! Fragment types: generated code units, node templates, and the result
//! of running one fragment in a sandbox.

use serde::{Deserialize, Serialize};

use crate::workflow::{Port, ResourceHints, RetryPolicy};

/// Environment keys a node uses to carry its fragment payload.
pub mod env {
    pub const CODE: &str = "CODE";
    pub const FILE_PATH: &str = "FILE_PATH";
    pub const DEPENDENCIES: &str = "DEPENDENCIES";
    pub const INSTALL_COMMAND: &str = "INSTALL_COMMAND";
    pub const PORT: &str = "PORT";
    pub const TITLE: &str = "TITLE";
    pub const DESCRIPTION: &str = "DESCRIPTION";
    /// Optional command that starts a service fragment's server.
    pub const START_COMMAND: &str = "START_COMMAND";
}

/// A generated, self-contained unit of code plus the metadata needed to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpec {
    #[serde(default)]
    pub commentary: String,
    /// Sandbox template id.
    pub template: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub additional_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dependencies_command: Option<String>,
    /// Port a service fragment listens on. `None` for compute fragments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Path of the main file, relative to the sandbox root.
    #[serde(default)]
    pub file_path: String,
    pub code: String,
}

/// How a template's sandbox is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateClass {
    /// Run code once, capture output, always tear the sandbox down.
    Compute,
    /// Start a server and keep the sandbox alive behind a public URL.
    Service,
}

/// Defaults applied to nodes created from a given template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub id: String,
    pub class: TemplateClass,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub default_resources: ResourceHints,
    pub retry_policy: RetryPolicy,
    pub default_file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
}

/// Outcome of running one fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub sandbox_id: String,
    pub template: String,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    /// Structured results produced by the code (compute class).
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    /// Public URL of the running service (service class).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl NodeResult {
    /// The value stored in the result store for this node.
    ///
    /// The object carries a `result` field (last structured result, else
    /// stdout parsed as JSON, else raw stdout) and, for services, a `url`
    /// field, so output ports named `result`/`url` resolve by name.
    pub fn to_output_value(&self) -> serde_json::Value {
        let stdout = self.stdout.join("");
        let result = match self.results.last() {
            Some(v) => v.clone(),
            None => serde_json::from_str(stdout.trim())
                .unwrap_or_else(|_| serde_json::Value::String(stdout.trim_end().to_string())),
        };
        let mut obj = serde_json::json!({
            "result": result,
            "stdout": self.stdout,
            "stderr": self.stderr,
            "sandbox_id": self.sandbox_id,
            "template": self.template,
        });
        if let Some(url) = &self.url {
            obj["url"] = serde_json::Value::String(url.clone());
        }
        obj
    }
}
