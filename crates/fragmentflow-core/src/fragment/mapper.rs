//! Built-in node templates and fragment <-> node conversion.
//!
//! A node carries its fragment payload in `config.environment` under the
//! keys in [`fragmentflow_types::fragment::env`], so a node can be turned
//! back into a runnable fragment without any other lookup.

use std::collections::HashMap;

use fragmentflow_types::fragment::{FragmentSpec, NodeTemplate, TemplateClass, env};
use fragmentflow_types::workflow::{
    BackoffStrategy, DataType, FragmentNode, NodeConfig, Port, PortDirection, Position,
    ResourceHints, RetryPolicy,
};
use uuid::Uuid;

/// Port used for service fragments that do not declare one.
pub const DEFAULT_SERVICE_PORT: u16 = 80;

/// Main file used when neither the node nor its template names one.
pub const FALLBACK_FILE_PATH: &str = "main.py";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MapperError {
    #[error("unsupported template: {0}")]
    UnsupportedTemplate(String),
}

fn port(id: &str, name: &str, direction: PortDirection, data_type: DataType) -> Port {
    Port {
        id: id.to_string(),
        name: name.to_string(),
        direction,
        data_type,
        required: false,
        default_value: None,
    }
}

fn object_input(id: &str, name: &str, default: serde_json::Value) -> Port {
    Port {
        default_value: Some(default),
        ..port(id, name, PortDirection::Input, DataType::Object)
    }
}

fn resources(memory: &str, cpu: &str, timeout_ms: u64) -> ResourceHints {
    ResourceHints {
        memory: Some(memory.to_string()),
        cpu: Some(cpu.to_string()),
        timeout_ms: Some(timeout_ms),
    }
}

fn retry(max_retries: u32, backoff_strategy: BackoffStrategy, initial_delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_strategy,
        initial_delay_ms,
    }
}

fn web_template(
    id: &str,
    input: Port,
    res: ResourceHints,
    policy: RetryPolicy,
    file: &str,
    default_port: u16,
) -> NodeTemplate {
    NodeTemplate {
        id: id.to_string(),
        class: TemplateClass::Service,
        inputs: vec![input],
        outputs: vec![port("url_output", "url", PortDirection::Output, DataType::String)],
        default_resources: res,
        retry_policy: policy,
        default_file_path: file.to_string(),
        default_port: Some(default_port),
    }
}

/// The templates a node may be created from.
pub fn builtin_templates() -> Vec<NodeTemplate> {
    let result_output = || port("result_output", "result", PortDirection::Output, DataType::Object);
    let empty_object = || serde_json::json!({});

    vec![
        NodeTemplate {
            id: "code-interpreter-v1".to_string(),
            class: TemplateClass::Compute,
            inputs: vec![object_input("data_input", "data", serde_json::Value::Null)],
            outputs: vec![result_output()],
            default_resources: resources("512MB", "0.5", 120_000),
            retry_policy: retry(2, BackoffStrategy::Exponential, 1000),
            default_file_path: "main.py".to_string(),
            default_port: None,
        },
        web_template(
            "nextjs-developer",
            object_input("config_input", "config", empty_object()),
            resources("1GB", "1.0", 300_000),
            retry(1, BackoffStrategy::Linear, 2000),
            "pages/index.tsx",
            3000,
        ),
        web_template(
            "vue-developer",
            object_input("config_input", "config", empty_object()),
            resources("1GB", "1.0", 300_000),
            retry(1, BackoffStrategy::Linear, 2000),
            "app.vue",
            3000,
        ),
        web_template(
            "streamlit-developer",
            object_input("data_input", "data", serde_json::Value::Null),
            resources("512MB", "0.5", 180_000),
            retry(2, BackoffStrategy::Exponential, 1500),
            "app.py",
            8501,
        ),
        web_template(
            "gradio-developer",
            object_input("config_input", "config", empty_object()),
            resources("512MB", "0.5", 180_000),
            retry(2, BackoffStrategy::Exponential, 1500),
            "app.py",
            7860,
        ),
        NodeTemplate {
            id: "codinit-engineer".to_string(),
            class: TemplateClass::Compute,
            inputs: vec![Port {
                required: true,
                ..port("task_input", "task", PortDirection::Input, DataType::String)
            }],
            outputs: vec![result_output()],
            default_resources: resources("2GB", "2.0", 600_000),
            retry_policy: retry(1, BackoffStrategy::Linear, 5000),
            default_file_path: "main.py".to_string(),
            default_port: None,
        },
    ]
}

/// Look up a built-in template.
pub fn template(id: &str) -> Option<NodeTemplate> {
    builtin_templates().into_iter().find(|t| t.id == id)
}

/// Compute or service. Unknown templates are services when they expose a
/// port, compute otherwise.
pub fn template_class(template_id: &str, port: Option<u16>) -> TemplateClass {
    match template(template_id) {
        Some(t) => t.class,
        None if port.is_some() => TemplateClass::Service,
        None => TemplateClass::Compute,
    }
}

/// Place a fragment into a workflow as a node with the template's defaults.
pub fn fragment_to_node(
    fragment: &FragmentSpec,
    position: Position,
) -> Result<FragmentNode, MapperError> {
    let tpl = template(&fragment.template)
        .ok_or_else(|| MapperError::UnsupportedTemplate(fragment.template.clone()))?;

    let node_id = format!("node_{}", Uuid::now_v7().simple());
    let port = fragment
        .port
        .or(tpl.default_port)
        .map(|p| p.to_string())
        .unwrap_or_default();

    let mut environment = HashMap::from([
        (env::CODE.to_string(), fragment.code.clone()),
        (env::FILE_PATH.to_string(), fragment.file_path.clone()),
        (
            env::DEPENDENCIES.to_string(),
            fragment.additional_dependencies.join(" "),
        ),
        (
            env::INSTALL_COMMAND.to_string(),
            fragment.install_dependencies_command.clone().unwrap_or_default(),
        ),
        (env::PORT.to_string(), port),
        (env::TITLE.to_string(), fragment.title.clone()),
        (env::DESCRIPTION.to_string(), fragment.description.clone()),
    ]);
    environment.retain(|_, v| !v.is_empty());

    Ok(FragmentNode {
        id: node_id.clone(),
        fragment_id: Some(node_id),
        position,
        inputs: tpl.inputs,
        outputs: tpl.outputs,
        config: NodeConfig {
            template: tpl.id,
            environment,
            resources: tpl.default_resources,
            retry_policy: tpl.retry_policy,
        },
        dependencies: Vec::new(),
        timeout_ms: None,
    })
}

/// Rebuild the runnable fragment a node carries.
pub fn node_to_fragment(node: &FragmentNode) -> FragmentSpec {
    let env_map = &node.config.environment;
    let get = |key: &str| env_map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let file_path = get(env::FILE_PATH)
        .map(str::to_string)
        .or_else(|| template(&node.config.template).map(|t| t.default_file_path))
        .unwrap_or_else(|| FALLBACK_FILE_PATH.to_string());

    FragmentSpec {
        commentary: format!("Executing workflow node: {}", node.id),
        template: node.config.template.clone(),
        title: get(env::TITLE)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Node {}", node.id)),
        description: get(env::DESCRIPTION)
            .map(str::to_string)
            .unwrap_or_else(|| "Workflow node execution".to_string()),
        additional_dependencies: get(env::DEPENDENCIES)
            .map(|d| d.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        install_dependencies_command: get(env::INSTALL_COMMAND).map(str::to_string),
        port: get(env::PORT).and_then(|p| p.parse().ok()),
        file_path,
        code: env_map.get(env::CODE).cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(template: &str) -> FragmentSpec {
        FragmentSpec {
            commentary: String::new(),
            template: template.to_string(),
            title: "Sales chart".to_string(),
            description: "Plot monthly sales".to_string(),
            additional_dependencies: vec!["pandas".into(), "matplotlib".into()],
            install_dependencies_command: Some("pip install pandas matplotlib".into()),
            port: None,
            file_path: "chart.py".to_string(),
            code: "print('hi')".to_string(),
        }
    }

    #[test]
    fn test_catalog_classes() {
        assert_eq!(builtin_templates().len(), 6);
        assert_eq!(template_class("code-interpreter-v1", None), TemplateClass::Compute);
        assert_eq!(template_class("nextjs-developer", None), TemplateClass::Service);
        assert_eq!(template_class("custom", Some(8080)), TemplateClass::Service);
        assert_eq!(template_class("custom", None), TemplateClass::Compute);
        assert!(template("codinit-engineer").unwrap().inputs[0].required);
    }

    #[test]
    fn test_fragment_to_node_applies_template_defaults() {
        let node = fragment_to_node(&spec("code-interpreter-v1"), Position::default()).unwrap();
        assert!(node.id.starts_with("node_"));
        assert_eq!(node.config.retry_policy.max_retries, 2);
        assert_eq!(node.config.resources.timeout_ms, Some(120_000));
        assert_eq!(node.outputs[0].name, "result");
        assert_eq!(node.config.environment[env::DEPENDENCIES], "pandas matplotlib");
    }

    #[test]
    fn test_fragment_to_node_unsupported() {
        let err = fragment_to_node(&spec("php-developer"), Position::default()).unwrap_err();
        assert_eq!(err, MapperError::UnsupportedTemplate("php-developer".into()));
    }

    #[test]
    fn test_conversion_preserves_payload() {
        let original = spec("code-interpreter-v1");
        let node = fragment_to_node(&original, Position { x: 1.0, y: 2.0 }).unwrap();
        let back = node_to_fragment(&node);
        assert_eq!(back.code, original.code);
        assert_eq!(back.file_path, "chart.py");
        assert_eq!(back.additional_dependencies, original.additional_dependencies);
        assert_eq!(
            back.install_dependencies_command,
            original.install_dependencies_command
        );
        assert_eq!(back.title, "Sales chart");
    }

    #[test]
    fn test_node_to_fragment_defaults() {
        let mut node = fragment_to_node(&spec("vue-developer"), Position::default()).unwrap();
        node.config.environment.clear();
        let frag = node_to_fragment(&node);
        assert_eq!(frag.file_path, "app.vue");
        assert_eq!(frag.title, format!("Node {}", node.id));
        assert!(frag.additional_dependencies.is_empty());
        assert!(frag.install_dependencies_command.is_none());
        assert!(frag.port.is_none());
        assert_eq!(frag.code, "");

        node.config.template = "unknown".into();
        assert_eq!(node_to_fragment(&node).file_path, FALLBACK_FILE_PATH);
    }
}
