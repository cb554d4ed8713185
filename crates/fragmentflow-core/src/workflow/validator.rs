//! Structural validation of a workflow before any node runs.
//!
//! Checks, in order: node ids are unique and every dependency exists,
//! connections join existing ports of matching type, the dependency graph
//! is acyclic, and every required input is satisfied.

use std::collections::HashSet;

use fragmentflow_types::workflow::{PortDirection, WorkflowDefinition};

use super::dag::DependencyGraph;

/// Structural error. Always fatal, never retried.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow contains circular dependencies: {}", path.join(" -> "))]
    CyclicGraph { path: Vec<String> },

    #[error("required input '{port}' for node '{node_id}' is not connected")]
    UnsatisfiedInput { node_id: String, port: String },

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    UnknownDependency { node_id: String, dependency: String },

    #[error("connection '{connection_id}' references unknown node '{node_id}'")]
    UnknownNode {
        connection_id: String,
        node_id: String,
    },

    #[error("connection '{connection_id}' references unknown port '{node_id}.{port_id}'")]
    UnknownPort {
        connection_id: String,
        node_id: String,
        port_id: String,
    },

    #[error("port '{node_id}.{port_id}' is declared with the wrong direction")]
    PortDirection { node_id: String, port_id: String },

    #[error("connection '{connection_id}' type mismatch: {detail}")]
    TypeMismatch {
        connection_id: String,
        detail: String,
    },
}

/// Validate a workflow and return its dependency graph.
pub fn validate(workflow: &WorkflowDefinition) -> Result<DependencyGraph, ValidationError> {
    let graph = DependencyGraph::build(workflow)?;
    check_ports(workflow)?;
    check_connections(workflow)?;

    if let Some(path) = graph.find_cycle() {
        return Err(ValidationError::CyclicGraph { path });
    }

    check_required_inputs(workflow)?;
    Ok(graph)
}

fn check_ports(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
    for node in &workflow.nodes {
        let wrong_input = node.inputs.iter().find(|p| p.direction != PortDirection::Input);
        let wrong_output = node
            .outputs
            .iter()
            .find(|p| p.direction != PortDirection::Output);
        if let Some(port) = wrong_input.or(wrong_output) {
            return Err(ValidationError::PortDirection {
                node_id: node.id.clone(),
                port_id: port.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_connections(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
    for conn in &workflow.connections {
        // Endpoints were resolved when the graph was built.
        let Some(target_node) = workflow.node(&conn.target.node_id) else {
            continue;
        };
        let target = target_node
            .input(&conn.target.port_id)
            .ok_or_else(|| ValidationError::UnknownPort {
                connection_id: conn.id.clone(),
                node_id: conn.target.node_id.clone(),
                port_id: conn.target.port_id.clone(),
            })?;
        if target.data_type != conn.data_type {
            return Err(ValidationError::TypeMismatch {
                connection_id: conn.id.clone(),
                detail: format!(
                    "connection carries {} but input '{}.{}' expects {}",
                    conn.data_type, conn.target.node_id, target.id, target.data_type
                ),
            });
        }

        if conn.source.is_seeded() {
            continue;
        }
        let Some(source_node) = workflow.node(&conn.source.node_id) else {
            continue;
        };
        let source = source_node
            .output(&conn.source.port_id)
            .ok_or_else(|| ValidationError::UnknownPort {
                connection_id: conn.id.clone(),
                node_id: conn.source.node_id.clone(),
                port_id: conn.source.port_id.clone(),
            })?;
        if source.data_type != conn.data_type {
            return Err(ValidationError::TypeMismatch {
                connection_id: conn.id.clone(),
                detail: format!(
                    "output '{}.{}' produces {} but connection carries {}",
                    conn.source.node_id, source.id, source.data_type, conn.data_type
                ),
            });
        }
    }
    Ok(())
}

fn check_required_inputs(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
    let connected: HashSet<(&str, &str)> = workflow
        .connections
        .iter()
        .map(|c| (c.target.node_id.as_str(), c.target.port_id.as_str()))
        .collect();

    for node in &workflow.nodes {
        for port in node.inputs.iter().filter(|p| p.required) {
            if port.default_value.is_none()
                && !connected.contains(&(node.id.as_str(), port.id.as_str()))
            {
                return Err(ValidationError::UnsatisfiedInput {
                    node_id: node.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
    }
    Ok(())
}
