//! Resolved code: the symbol table a sandbox executes from.
//!
//! Nothing here compiles source text. Callers register already-built callables together with the
//! source they were built from; the sandbox refuses a unit whose recorded source digest no longer
//! matches the definition it is asked to run.

use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use udf_core::sha256_hex;

use crate::{
    coerce::ParameterShape,
    invocation::{Invocation, UdfError, UdfReturn},
};

pub type UdfFn = Arc<dyn Fn(&mut Invocation<'_>) -> Result<UdfReturn, UdfError> + Send + Sync>;

pub type HeaderFn = Arc<dyn Fn(&[Value]) -> Result<Value, UdfError> + Send + Sync>;

/// One declared parameter of an entrypoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: ParameterShape,
    pub default: Option<Value>,
    /// `null` passes through instead of being coerced.
    pub optional: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: ParameterShape) -> Self {
        Self {
            name: name.into(),
            shape,
            default: None,
            optional: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Clone)]
pub struct Entrypoint {
    pub params: Vec<ParamSpec>,
    pub(crate) func: UdfFn,
}

impl Entrypoint {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entrypoint")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Callables built from one definition's source.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    source_digest: String,
    entrypoints: HashMap<String, Entrypoint>,
}

impl CompiledUnit {
    pub fn new(source: &str) -> Self {
        Self {
            source_digest: sha256_hex(source.as_bytes()),
            entrypoints: HashMap::new(),
        }
    }

    pub fn entrypoint<F>(mut self, name: impl Into<String>, params: Vec<ParamSpec>, func: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> Result<UdfReturn, UdfError> + Send + Sync + 'static,
    {
        self.entrypoints.insert(
            name.into(),
            Entrypoint {
                params,
                func: Arc::new(func),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Entrypoint> {
        self.entrypoints.get(name)
    }

    pub fn matches(&self, source: &str) -> bool {
        self.source_digest == sha256_hex(source.as_bytes())
    }
}

/// Functions exported by one header module.
#[derive(Clone)]
pub struct HeaderUnit {
    source_digest: String,
    functions: HashMap<String, HeaderFn>,
}

impl HeaderUnit {
    pub fn new(source: &str) -> Self {
        Self {
            source_digest: sha256_hex(source.as_bytes()),
            functions: HashMap::new(),
        }
    }

    pub fn function<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, UdfError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    pub fn matches(&self, source: &str) -> bool {
        self.source_digest == sha256_hex(source.as_bytes())
    }
}

impl fmt::Debug for HeaderUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("HeaderUnit").field("functions", &names).finish()
    }
}

/// Definition name → compiled unit, module name → header unit.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    units: HashMap<String, Arc<CompiledUnit>>,
    headers: HashMap<String, Arc<HeaderUnit>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, udf_name: impl Into<String>, unit: CompiledUnit) -> &mut Self {
        self.units.insert(udf_name.into(), Arc::new(unit));
        self
    }

    pub fn register_header(&mut self, module_name: impl Into<String>, unit: HeaderUnit) -> &mut Self {
        self.headers.insert(module_name.into(), Arc::new(unit));
        self
    }

    pub fn unit(&self, udf_name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.get(udf_name).cloned()
    }

    pub fn header(&self, module_name: &str) -> Option<Arc<HeaderUnit>> {
        self.headers.get(module_name).cloned()
    }
}

/// Header modules registered for a single execution.
#[derive(Debug, Default)]
pub struct ModuleScope {
    modules: HashMap<String, Arc<HeaderUnit>>,
}

impl ModuleScope {
    pub(crate) fn insert(&mut self, module_name: String, unit: Arc<HeaderUnit>) {
        self.modules.insert(module_name, unit);
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.modules.contains_key(module_name)
    }

    pub fn call(&self, module_name: &str, function: &str, args: &[Value]) -> Result<Value, UdfError> {
        let unit = self.modules.get(module_name).ok_or_else(|| {
            UdfError::new(format!("No module named '{module_name}'")).class("ModuleNotFoundError")
        })?;
        let func = unit.functions.get(function).ok_or_else(|| {
            UdfError::new(format!(
                "module '{module_name}' has no attribute '{function}'"
            ))
            .class("AttributeError")
        })?;
        func(args)
    }
}
