// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Declarative pipeline configuration loaded from JSON or YAML files.
//!
//! # Example
//!
//! ```json
//! {
//!   "name": "bars-to-console",
//!   "platform": "generic",
//!   "blocks": [
//!     { "name": "pattern", "type": "TestPatternSource",
//!       "parameters": { "width": "640", "height": "480", "fps": "30" } },
//!     { "name": "console", "type": "ConsoleSink",
//!       "parameters": { "queue_depth": "10" } }
//!   ],
//!   "connections": [
//!     ["pattern.output", "console.input"]
//!   ]
//! }
//! ```
//!
//! Connections accept the shorthand pair form above or a record form
//! `{ "source": "pattern", "sink": "console" }` with optional
//! `source_output` / `sink_input` tags (defaulting to `"output"` and
//! `"input"`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::block::BlockParams;
use super::error::{PipelineError, Result};

pub const DEFAULT_OUTPUT_TAG: &str = "output";
pub const DEFAULT_INPUT_TAG: &str = "input";

/// A block definition inside a pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    /// Instance name, unique within the pipeline.
    pub name: String,

    /// Block type name; must exist in the registry.
    #[serde(rename = "type")]
    pub block_type: String,

    #[serde(default)]
    pub parameters: BlockParams,
}

/// A directed source -> sink edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub source_block: String,
    pub source_output: String,
    pub sink_block: String,
    pub sink_input: String,
}

impl Connection {
    pub fn new(source_block: &str, sink_block: &str) -> Self {
        Self {
            source_block: source_block.to_string(),
            source_output: DEFAULT_OUTPUT_TAG.to_string(),
            sink_block: sink_block.to_string(),
            sink_input: DEFAULT_INPUT_TAG.to_string(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source_block, self.source_output, self.sink_block, self.sink_input
        )
    }
}

/// Split `"block.port"` into its components; a bare block name gets the
/// given default port tag.
fn parse_endpoint(s: &str, default_port: &str) -> (String, String) {
    match s.split_once('.') {
        Some((block, port)) => (block.to_string(), port.to_string()),
        None => (s.to_string(), default_port.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConnectionRepr {
    Shorthand([String; 2]),
    Record {
        source: String,
        sink: String,
        #[serde(default)]
        source_output: Option<String>,
        #[serde(default)]
        sink_input: Option<String>,
    },
}

impl<'de> Deserialize<'de> for Connection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match ConnectionRepr::deserialize(deserializer)? {
            ConnectionRepr::Shorthand([from, to]) => {
                let (source_block, source_output) = parse_endpoint(&from, DEFAULT_OUTPUT_TAG);
                let (sink_block, sink_input) = parse_endpoint(&to, DEFAULT_INPUT_TAG);
                Ok(Connection {
                    source_block,
                    source_output,
                    sink_block,
                    sink_input,
                })
            }
            ConnectionRepr::Record {
                source,
                sink,
                source_output,
                sink_input,
            } => Ok(Connection {
                source_block: source,
                source_output: source_output.unwrap_or_else(|| DEFAULT_OUTPUT_TAG.to_string()),
                sink_block: sink,
                sink_input: sink_input.unwrap_or_else(|| DEFAULT_INPUT_TAG.to_string()),
            }),
        }
    }
}

impl Serialize for Connection {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut record = serializer.serialize_struct("Connection", 4)?;
        record.serialize_field("source", &self.source_block)?;
        record.serialize_field("source_output", &self.source_output)?;
        record.serialize_field("sink", &self.sink_block)?;
        record.serialize_field("sink_input", &self.sink_input)?;
        record.end()
    }
}

/// Complete parsed pipeline description handed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub platform: String,

    #[serde(default)]
    pub blocks: Vec<BlockDef>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Free-form pipeline-level settings.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl PipelineConfig {
    /// Load from a file; the format is chosen by extension
    /// (`.json`, `.yaml`, `.yml`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let config = match extension.as_str() {
            "json" => Self::from_json_str(&content)?,
            "yaml" | "yml" => Self::from_yaml_str(&content)?,
            other => {
                return Err(PipelineError::InvalidArgument(format!(
                    "unsupported configuration format '.{other}' ({})",
                    path.display()
                )))
            }
        };

        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            PipelineError::InvalidArgument(format!("failed to parse pipeline JSON: {e}"))
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            PipelineError::InvalidArgument(format!("failed to parse pipeline YAML: {e}"))
        })
    }

    /// Structural validation: unique block names and resolvable connection
    /// endpoints. Capability checks happen when the orchestrator connects.
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for block in &self.blocks {
            if block.name.is_empty() {
                return Err(PipelineError::InvalidArgument(
                    "block with empty name".into(),
                ));
            }
            if !names.insert(block.name.as_str()) {
                return Err(PipelineError::InvalidArgument(format!(
                    "duplicate block name '{}'",
                    block.name
                )));
            }
        }

        for connection in &self.connections {
            if !names.contains(connection.source_block.as_str()) {
                return Err(PipelineError::NotFound(format!(
                    "connection {connection}: unknown source block '{}'",
                    connection.source_block
                )));
            }
            if !names.contains(connection.sink_block.as_str()) {
                return Err(PipelineError::NotFound(format!(
                    "connection {connection}: unknown sink block '{}'",
                    connection.sink_block
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_CONFIG: &str = r#"{
        "name": "bars-to-console",
        "platform": "generic",
        "blocks": [
            { "name": "pattern", "type": "TestPatternSource",
              "parameters": { "width": "640", "fps": "30" } },
            { "name": "console", "type": "ConsoleSink" }
        ],
        "connections": [
            ["pattern.output", "console.input"]
        ]
    }"#;

    #[test]
    fn test_parse_json_config() {
        let config = PipelineConfig::from_json_str(JSON_CONFIG).unwrap();
        assert_eq!(config.name, "bars-to-console");
        assert_eq!(config.blocks.len(), 2);
        assert_eq!(config.blocks[0].block_type, "TestPatternSource");
        assert_eq!(
            config.blocks[0].parameters.get("width").map(String::as_str),
            Some("640")
        );
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].source_block, "pattern");
        assert_eq!(config.connections[0].sink_input, "input");
        config.validate().unwrap();
    }

    #[test]
    fn test_shorthand_without_port_tags() {
        let config = PipelineConfig::from_json_str(
            r#"{ "blocks": [
                   { "name": "a", "type": "T" }, { "name": "b", "type": "U" } ],
                 "connections": [ ["a", "b"] ] }"#,
        )
        .unwrap();
        let connection = &config.connections[0];
        assert_eq!(connection.source_output, "output");
        assert_eq!(connection.sink_input, "input");
    }

    #[test]
    fn test_record_connection_form() {
        let config = PipelineConfig::from_json_str(
            r#"{ "blocks": [
                   { "name": "a", "type": "T" }, { "name": "b", "type": "U" } ],
                 "connections": [ { "source": "a", "sink": "b", "sink_input": "video" } ] }"#,
        )
        .unwrap();
        let connection = &config.connections[0];
        assert_eq!(connection.source_block, "a");
        assert_eq!(connection.source_output, "output");
        assert_eq!(connection.sink_input, "video");
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
name: cam-pipeline
blocks:
  - name: pattern
    type: TestPatternSource
    parameters:
      pattern: gradient
  - name: files
    type: FileSink
connections:
  - ["pattern.output", "files.input"]
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name, "cam-pipeline");
        assert_eq!(config.blocks[1].block_type, "FileSink");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_duplicate_names() {
        let config = PipelineConfig::from_json_str(
            r#"{ "blocks": [
                   { "name": "x", "type": "T" }, { "name": "x", "type": "U" } ] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_dangling_connection() {
        let config = PipelineConfig::from_json_str(
            r#"{ "blocks": [ { "name": "a", "type": "T" } ],
                 "connections": [ ["a.output", "ghost.input"] ] }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_connection_serializes_to_record_form() {
        let connection = Connection::new("a", "b");
        let json = serde_json::to_string(&connection).unwrap();
        let parsed: Connection = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, connection);
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "name = \"x\"").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&path),
            Err(PipelineError::InvalidArgument(_))
        ));
    }
}
