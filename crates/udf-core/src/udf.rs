use crate::schema::TableSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Auxiliary source registered under an import name for the duration of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderModule {
    pub module_name: String,
    pub source: String,
}

/// A named, parameterized block of code with a declared entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdfDefinition {
    pub name: String,
    pub entrypoint: String,
    pub code: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderModule>,

    /// Default parameter values bound at registration time.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_schema: Option<TableSchema>,

    /// Top-level modules the code imports, checked against an allow-list when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
}

impl UdfDefinition {
    pub fn new(
        name: impl Into<String>,
        entrypoint: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entrypoint: entrypoint.into(),
            code: code.into(),
            headers: Vec::new(),
            parameters: Map::new(),
            table_schema: None,
            imports: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_schema(mut self, schema: TableSchema) -> Self {
        self.table_schema = Some(schema);
        self
    }

    pub fn with_header(mut self, module_name: impl Into<String>, source: impl Into<String>) -> Self {
        self.headers.push(HeaderModule {
            module_name: module_name.into(),
            source: source.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.code.trim().is_empty()
    }
}

/// Where a remote job persists its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub url: String,
    #[serde(default)]
    pub overwrite: bool,
}

/// A unit of work plus the records it should run against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub udf: UdfDefinition,

    /// Ordered call records, or `None` to run once with no input.
    #[serde(default)]
    pub input: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputTarget>,
}

impl JobStep {
    pub fn new(udf: UdfDefinition) -> Self {
        Self {
            udf,
            input: None,
            output: None,
        }
    }

    pub fn with_input(mut self, input: Vec<Value>) -> Self {
        self.input = Some(input);
        self
    }

    /// The job-step configuration shipped to remote engines.
    pub fn step_config(&self) -> Value {
        serde_json::json!({
            "type": "udf",
            "udf": self.udf,
            "input": self.input,
            "output": self.output,
        })
    }
}
