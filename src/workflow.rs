//! Workflow Builder: merges user parameters into an engine workflow template
//! according to a YAML parameter-mapping config.
//!
//! Reads the JSON template, reads the YAML mapping config, and for every
//! parameter that has a mapping, writes its value verbatim into
//! `workflow[node_id].inputs[property]`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("template not found at {}: {source}", path.display()))]
    TemplateNotFound {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse template {}: {source}", path.display()))]
    TemplateParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("workflow template {} is not a JSON object", path.display()))]
    TemplateNotObject { path: PathBuf },

    #[snafu(display("config not found at {}: {source}", path.display()))]
    ConfigNotFound {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config {}: {source}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("node {node_id} not found or is not an object"))]
    NodeMissing { node_id: String },

    #[snafu(display("inputs for node {node_id} not found or is not an object"))]
    InputsMissing { node_id: String },

    #[snafu(display("failed to serialize workflow: {source}"))]
    Serialize { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single `param_name -> (node_id, property)` write site.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeMapping {
    pub node_id: String,
    pub property: String,
}

/// The full set of mappings for one workflow name, as read from `<name>.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub node_mappings: HashMap<String, NodeMapping>,
}

/// Merges user parameters into engine workflow templates.
///
/// Templates are read on every call to `build` — no caching.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    template_dir: PathBuf,
    config_dir: PathBuf,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new(template_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            config_dir: config_dir.into(),
        }
    }

    /// Build the final workflow document for `workflow_name` given `params`,
    /// returning the serialized JSON bytes.
    pub fn build(&self, workflow_name: &str, params: &HashMap<String, Value>) -> Result<Vec<u8>> {
        let mut workflow = self.load_template(workflow_name)?;
        let config = self.load_config(workflow_name)?;

        for (key, value) in params {
            let Some(mapping) = config.node_mappings.get(key) else {
                // Not every param needs a mapping; silently skip.
                continue;
            };

            let node = workflow
                .get_mut(&mapping.node_id)
                .and_then(Value::as_object_mut)
                .context(NodeMissingSnafu {
                    node_id: mapping.node_id.clone(),
                })?;

            let inputs = node
                .get_mut("inputs")
                .and_then(Value::as_object_mut)
                .context(InputsMissingSnafu {
                    node_id: mapping.node_id.clone(),
                })?;

            inputs.insert(mapping.property.clone(), value.clone());
        }

        serde_json::to_vec(&workflow).context(SerializeSnafu)
    }

    fn load_template(&self, workflow_name: &str) -> Result<Map<String, Value>> {
        let path = self.template_dir.join(format!("{workflow_name}.json"));
        let data = std::fs::read(&path).context(TemplateNotFoundSnafu { path: path.clone() })?;
        let value: Value =
            serde_json::from_slice(&data).context(TemplateParseSnafu { path: path.clone() })?;
        value
            .as_object()
            .cloned()
            .context(TemplateNotObjectSnafu { path })
    }

    fn load_config(&self, workflow_name: &str) -> Result<WorkflowConfig> {
        let path = self.config_dir.join(format!("{workflow_name}.yaml"));
        let data = std::fs::read(&path).context(ConfigNotFoundSnafu { path: path.clone() })?;
        serde_yaml::from_slice(&data).context(ConfigParseSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(template: &str, config: &str) -> (TempDir, TempDir, WorkflowBuilder) {
        let template_dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        fs::write(template_dir.path().join("starter.json"), template).unwrap();
        fs::write(config_dir.path().join("starter.yaml"), config).unwrap();
        let builder = WorkflowBuilder::new(template_dir.path(), config_dir.path());
        (template_dir, config_dir, builder)
    }

    #[test]
    fn mapped_param_is_written_and_unmapped_is_ignored() {
        let (_t, _c, builder) = fixture(
            r#"{"3":{"inputs":{"seed":0}}}"#,
            "node_mappings:\n  seed:\n    node_id: \"3\"\n    property: seed\n",
        );

        let mut params = HashMap::new();
        params.insert("seed".to_string(), json!(42));
        params.insert("unused".to_string(), json!("x"));

        let bytes = builder.build("starter", &params).unwrap();
        let out: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(out["3"]["inputs"]["seed"], json!(42));
        assert_eq!(out.as_object().unwrap().len(), 1);
        assert!(!bytes_contains(&bytes, "unused"));
    }

    fn bytes_contains(bytes: &[u8], needle: &str) -> bool {
        String::from_utf8_lossy(bytes).contains(needle)
    }

    #[test]
    fn type_is_preserved_verbatim() {
        let (_t, _c, builder) = fixture(
            r#"{"3":{"inputs":{"seed":0,"text":""}}}"#,
            "node_mappings:\n  seed:\n    node_id: \"3\"\n    property: seed\n  text:\n    node_id: \"3\"\n    property: text\n",
        );

        let mut params = HashMap::new();
        params.insert("seed".to_string(), json!(7));
        params.insert("text".to_string(), json!("a cat"));

        let bytes = builder.build("starter", &params).unwrap();
        let out: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(out["3"]["inputs"]["seed"].is_number());
        assert!(out["3"]["inputs"]["text"].is_string());
    }

    #[test]
    fn build_is_order_independent() {
        // Any two orderings of params produce the same output.
        let (_t, _c, builder) = fixture(
            r#"{"1":{"inputs":{"a":0}},"2":{"inputs":{"b":0}}}"#,
            "node_mappings:\n  a:\n    node_id: \"1\"\n    property: a\n  b:\n    node_id: \"2\"\n    property: b\n",
        );

        let mut p1 = HashMap::new();
        p1.insert("a".to_string(), json!(1));
        p1.insert("b".to_string(), json!(2));

        let mut p2 = HashMap::new();
        p2.insert("b".to_string(), json!(2));
        p2.insert("a".to_string(), json!(1));

        let out1: Value = serde_json::from_slice(&builder.build("starter", &p1).unwrap()).unwrap();
        let out2: Value = serde_json::from_slice(&builder.build("starter", &p2).unwrap()).unwrap();
        assert_eq!(out1, out2);
    }

    #[test]
    fn missing_template_is_template_not_found() {
        let template_dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let builder = WorkflowBuilder::new(template_dir.path(), config_dir.path());
        let err = builder.build("missing", &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound { .. }));
    }

    #[test]
    fn node_missing_from_template_is_reported() {
        let (_t, _c, builder) = fixture(
            r#"{"1":{"inputs":{"a":0}}}"#,
            "node_mappings:\n  a:\n    node_id: \"99\"\n    property: a\n",
        );
        let mut params = HashMap::new();
        params.insert("a".to_string(), json!(1));
        let err = builder.build("starter", &params).unwrap_err();
        assert!(matches!(err, Error::NodeMissing { node_id } if node_id == "99"));
    }

    #[test]
    fn inputs_missing_on_node_is_reported() {
        let (_t, _c, builder) = fixture(
            r#"{"1":{"class_type":"Foo"}}"#,
            "node_mappings:\n  a:\n    node_id: \"1\"\n    property: a\n",
        );
        let mut params = HashMap::new();
        params.insert("a".to_string(), json!(1));
        let err = builder.build("starter", &params).unwrap_err();
        assert!(matches!(err, Error::InputsMissing { node_id } if node_id == "1"));
    }

}
