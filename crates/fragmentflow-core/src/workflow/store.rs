//! Execution-scoped result store.
//!
//! Holds every value a node can read: `global.<name>` and `input.<key>`
//! entries seeded before the run, then `<nodeId>` and `<nodeId>.<portId>`
//! entries as nodes complete. Owned by the executor's coordinating task,
//! which is its only writer.

use std::collections::HashMap;

use fragmentflow_types::workflow::{
    Connection, FINAL_OUTPUT_PREFIX, FragmentNode, WorkflowDefinition,
};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    values: HashMap<String, Value>,
}

impl ResultStore {
    /// Seed a store with the workflow's globals and the caller's input data.
    pub fn seeded(workflow: &WorkflowDefinition, input_data: &HashMap<String, Value>) -> Self {
        let mut values = HashMap::new();
        for var in &workflow.variables {
            values.insert(format!("global.{}", var.name), var.value.clone());
        }
        for (key, value) in input_data {
            values.insert(format!("input.{key}"), value.clone());
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Record a completed node's result under `nodeId` and under
    /// `nodeId.portId` for each declared output.
    ///
    /// An output port takes the result's field named after the port when the
    /// result is an object carrying it, otherwise the whole result.
    pub fn record_node_output(&mut self, node: &FragmentNode, result: Value) {
        for port in &node.outputs {
            let value = result
                .get(&port.name)
                .cloned()
                .unwrap_or_else(|| result.clone());
            self.values.insert(format!("{}.{}", node.id, port.id), value);
        }
        self.values.insert(node.id.clone(), result);
    }

    /// Resolve a node's inputs keyed by port name.
    ///
    /// A connected port reads its source key; an unconnected port, or one
    /// whose source produced nothing, falls back to its default value.
    /// Ports with neither are omitted.
    pub fn resolve_inputs(
        &self,
        node: &FragmentNode,
        connections: &[Connection],
    ) -> HashMap<String, Value> {
        let mut inputs = HashMap::new();
        for port in &node.inputs {
            let connected = connections
                .iter()
                .find(|c| c.target.node_id == node.id && c.target.port_id == port.id)
                .and_then(|c| self.values.get(&c.source.store_key()));
            if let Some(value) = connected.or(port.default_value.as_ref()) {
                inputs.insert(port.name.clone(), value.clone());
            }
        }
        inputs
    }

    /// Collect `final_`-prefixed output ports of completed nodes, keyed by
    /// the port name with the prefix stripped.
    pub fn final_outputs(&self, workflow: &WorkflowDefinition) -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        for node in &workflow.nodes {
            for port in &node.outputs {
                let Some(name) = port.name.strip_prefix(FINAL_OUTPUT_PREFIX) else {
                    continue;
                };
                if let Some(value) = self.values.get(&format!("{}.{}", node.id, port.id)) {
                    outputs.insert(name.to_string(), value.clone());
                }
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{connect, node, output, workflow};
    use fragmentflow_types::workflow::GlobalVariable;
    use serde_json::json;

    #[test]
    fn test_seeded_keys() {
        let mut wf = workflow(vec![], vec![]);
        wf.variables.push(GlobalVariable {
            name: "region".into(),
            value: json!("eu"),
            data_type: None,
        });
        let input = HashMap::from([("query".to_string(), json!("sales"))]);
        let store = ResultStore::seeded(&wf, &input);
        assert_eq!(store.get("global.region"), Some(&json!("eu")));
        assert_eq!(store.get("input.query"), Some(&json!("sales")));
    }

    #[test]
    fn test_record_output_by_port_name() {
        let mut a = node("a", &[]);
        a.outputs.push(output("url_output", "url"));
        let mut store = ResultStore::default();
        store.record_node_output(&a, json!({"url": "https://x", "result": 1}));

        assert_eq!(store.get("a.url_output"), Some(&json!("https://x")));
        // "out" has no matching field: whole result.
        assert_eq!(store.get("a.out"), Some(&json!({"url": "https://x", "result": 1})));
        assert!(store.contains("a"));
    }

    #[test]
    fn test_resolve_inputs_connection_then_default() {
        let mut b = node("b", &[]);
        b.inputs[0].default_value = Some(json!("fallback"));
        let wf = workflow(
            vec![node("a", &[]), b.clone()],
            vec![connect("a", "out", "b", "in")],
        );
        let mut store = ResultStore::default();

        // Source not produced yet: default wins.
        let inputs = store.resolve_inputs(&b, &wf.connections);
        assert_eq!(inputs.get("in"), Some(&json!("fallback")));

        store.record_node_output(&wf.nodes[0], json!(42));
        let inputs = store.resolve_inputs(&b, &wf.connections);
        assert_eq!(inputs.get("in"), Some(&json!(42)));
    }

    #[test]
    fn test_resolve_seeded_input() {
        let a = node("a", &[]);
        let wf = workflow(vec![a.clone()], vec![connect("input", "query", "a", "in")]);
        let store = ResultStore::seeded(
            &wf,
            &HashMap::from([("query".to_string(), json!("q"))]),
        );
        assert_eq!(store.resolve_inputs(&a, &wf.connections)["in"], json!("q"));
    }

    #[test]
    fn test_unresolved_input_omitted() {
        let a = node("a", &[]);
        let store = ResultStore::default();
        assert!(store.resolve_inputs(&a, &[]).is_empty());
    }

    #[test]
    fn test_final_outputs_strip_prefix() {
        let mut c = node("c", &[]);
        c.outputs.push(output("report_port", "final_report"));
        let wf = workflow(vec![c.clone()], vec![]);
        let mut store = ResultStore::default();
        store.record_node_output(&c, json!({"final_report": "done"}));

        let outputs = store.final_outputs(&wf);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["report"], json!("done"));
    }

    #[test]
    fn test_large_output_kept_intact() {
        let mut a = node("a", &[]);
        a.outputs.push(output("blob_port", "final_blob"));
        let wf = workflow(vec![a.clone()], vec![]);
        let blob = "x".repeat(1_100_000);
        let mut store = ResultStore::default();
        store.record_node_output(&a, json!({"final_blob": blob}));

        assert_eq!(store.final_outputs(&wf)["blob"], json!(blob));
        assert!(store.get("a").unwrap().get("_truncated").is_none());
    }
}
