use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;
use crate::node::Node;
use crate::schema::Schema;

const DEFAULT_SCHEMA: &str = "workpad-doc";
const DEFAULT_VERSION: u32 = 1;

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

fn default_version() -> u32 {
    DEFAULT_VERSION
}

/// Versioned persistence envelope around the document JSON. The document
/// itself is only decoded against a concrete [`Schema`], so unknown or
/// legacy-aliased types surface as [`ParseError`], never as silent
/// corruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorValue {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub document: Value,
}

impl EditorValue {
    pub fn from_document(document: &Node) -> Self {
        Self {
            schema: default_schema(),
            version: default_version(),
            document: document.to_json(),
        }
    }

    pub fn document(&self, schema: &Schema) -> Result<Node, ParseError> {
        Node::from_json(schema, &self.document)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
