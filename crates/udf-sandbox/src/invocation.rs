use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::{self, Write as _},
    path::Path,
};
use udf_core::{Table, TableSchema};

use crate::{geo::GeoTable, registry::ModuleScope, value::ArgValue};

/// Column label as the entrypoint produced it. Labels are stringified during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKey {
    Text(String),
    Int(i64),
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKey::Text(s) => f.write_str(s),
            ColumnKey::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for ColumnKey {
    fn from(value: &str) -> Self {
        ColumnKey::Text(value.to_string())
    }
}

impl From<i64> for ColumnKey {
    fn from(value: i64) -> Self {
        ColumnKey::Int(value)
    }
}

/// What an entrypoint hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum UdfReturn {
    Nothing,
    Table(Table),
    Records(Vec<Value>),
    Columns(Vec<(ColumnKey, Vec<Value>)>),
    Geo(GeoTable),
    Value(Value),
}

/// An error raised by the unit of work itself.
#[derive(Debug, Clone, PartialEq)]
pub struct UdfError {
    pub message: String,
    pub exception_class: Option<String>,
    pub lineno: Option<u32>,
}

impl UdfError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exception_class: None,
            lineno: None,
        }
    }

    pub fn class(mut self, exception_class: impl Into<String>) -> Self {
        self.exception_class = Some(exception_class.into());
        self
    }

    pub fn at_line(mut self, lineno: u32) -> Self {
        self.lineno = Some(lineno);
        self
    }
}

impl fmt::Display for UdfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exception_class {
            Some(class) => write!(f, "{class}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for UdfError {}

impl From<udf_core::Error> for UdfError {
    fn from(err: udf_core::Error) -> Self {
        UdfError::new(err.to_string())
    }
}

/// Write-output handle bound under `output`.
///
/// An entrypoint may set `data` instead of returning a value, declare its schema, attach a
/// sidecar, or waive the identity-column check for this call.
#[derive(Debug, Default)]
pub struct OutputHandle {
    pub data: Option<UdfReturn>,
    pub table_schema: Option<TableSchema>,
    pub sidecar: Option<Vec<u8>>,
    pub skip_index_validation: bool,
}

/// Scratch directories bound under `context`, removed when the call ends.
#[derive(Debug)]
pub struct ExecutionContext {
    tempdir: tempfile::TempDir,
    partition_tempdir: tempfile::TempDir,
}

impl ExecutionContext {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            tempdir: tempfile::Builder::new().prefix("udf-").tempdir()?,
            partition_tempdir: tempfile::Builder::new().prefix("udf-partition-").tempdir()?,
        })
    }

    pub fn tempdir(&self) -> &Path {
        self.tempdir.path()
    }

    pub fn partition_tempdir(&self) -> &Path {
        self.partition_tempdir.path()
    }
}

/// Everything one call of an entrypoint can see.
pub struct Invocation<'a> {
    pub(crate) args: BTreeMap<String, ArgValue>,
    pub(crate) output: Option<OutputHandle>,
    pub(crate) context: Option<ExecutionContext>,
    pub(crate) modules: &'a ModuleScope,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(args: BTreeMap<String, ArgValue>, modules: &'a ModuleScope) -> Self {
        Self {
            args,
            output: None,
            context: None,
            modules,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name)
    }

    /// Like [`Invocation::arg`], but a missing argument is a `TypeError`.
    pub fn require(&self, name: &str) -> Result<&ArgValue, UdfError> {
        self.args.get(name).ok_or_else(|| {
            UdfError::new(format!("missing required argument: '{name}'")).class("TypeError")
        })
    }

    pub fn output(&mut self) -> Option<&mut OutputHandle> {
        self.output.as_mut()
    }

    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    /// Header modules visible to this call only.
    pub fn modules(&self) -> &ModuleScope {
        self.modules
    }

    pub fn print(&mut self, line: impl fmt::Display) {
        let _ = writeln!(self.stdout, "{line}");
    }

    pub fn eprint(&mut self, line: impl fmt::Display) {
        let _ = writeln!(self.stderr, "{line}");
    }
}
