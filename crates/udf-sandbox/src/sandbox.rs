use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use udf_core::{Error, ExecutionResult, Result, Stage, TableSchema, UdfData, UdfDefinition};

use crate::{
    coerce::{coerce, ParameterShape},
    imports::ImportAllowlist,
    invocation::{ExecutionContext, Invocation, OutputHandle, UdfReturn},
    registry::{CompiledUnit, Entrypoint, ModuleScope, SymbolTable},
    validate::{normalize, raw_data, validate},
    value::ArgValue,
};

const OUTPUT_PARAM: &str = "output";
const CONTEXT_PARAM: &str = "context";

/// The one sample record an execution runs against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleInput {
    pub positional: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl SampleInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.positional.push(value);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// A job-step input record: objects bind by name, anything else is the first positional.
    pub fn from_record(record: &Value) -> Self {
        match record {
            Value::Null => Self::new(),
            Value::Object(kwargs) => Self {
                positional: Vec::new(),
                kwargs: kwargs.clone(),
            },
            other => Self::new().arg(other.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Normalize and check the return value. When off, the raw value is returned.
    pub validate_output: bool,
    /// Store the schema used for validation on a definition that declares none.
    pub update_schema: bool,
    pub skip_index_validation: bool,
    /// Reject the definition up front when its imports are not available remotely.
    pub allowed_imports: Option<ImportAllowlist>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            validate_output: true,
            update_schema: true,
            skip_index_validation: false,
            allowed_imports: None,
        }
    }
}

/// Executes a definition against one sample input.
///
/// Stages run in order, PREPARE → BIND → COERCE → INVOKE → VALIDATE, and nothing is retried.
/// Nothing here touches the network.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    symbols: Arc<SymbolTable>,
}

impl Sandbox {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn execute(
        &self,
        udf: &mut UdfDefinition,
        input: &SampleInput,
        options: &SandboxOptions,
    ) -> Result<ExecutionResult> {
        if udf.is_empty() {
            return Err(Error::validation(format!(
                "UDF `{}` has no code to execute",
                udf.name
            )));
        }
        let mut warnings = Warnings::new(&udf.name);

        let (unit, modules) = self.prepare(udf, options)?;

        let entrypoint = unit.get(&udf.entrypoint).ok_or_else(|| {
            Error::sandbox(
                Stage::Bind,
                format!("entrypoint `{}` not found in `{}`", udf.entrypoint, udf.name),
                None,
            )
        })?;
        let (wants_output, wants_context) = bind_reserved(udf, entrypoint, &mut warnings)?;

        let args = coerce_args(udf, entrypoint, input, &mut warnings)?;

        let mut invocation = Invocation::new(args, &modules);
        if wants_output {
            invocation.output = Some(OutputHandle::default());
        }
        if wants_context {
            let context = ExecutionContext::new().map_err(|e| {
                Error::sandbox(Stage::Bind, format!("create scratch directories: {e}"), None)
            })?;
            invocation.context = Some(context);
        }

        let started = Instant::now();
        let outcome = (entrypoint.func)(&mut invocation);
        let elapsed = started.elapsed();
        let Invocation {
            output,
            stdout,
            stderr,
            ..
        } = invocation;

        let ret = match outcome {
            Ok(ret) => ret,
            Err(err) => {
                tracing::warn!(
                    event = "udf.sandbox.invoke_failed",
                    udf = %udf.name,
                    error = %err,
                    "UDF raised during execution"
                );
                return Err(Error::UdfRuntime {
                    message: err.message,
                    exception_class: err.exception_class,
                    lineno: err.lineno,
                    stdout,
                    stderr,
                });
            }
        };
        tracing::debug!(
            event = "udf.sandbox.invoked",
            udf = %udf.name,
            elapsed_ms = elapsed.as_millis() as u64
        );

        let mut output = output.unwrap_or_default();
        let ret = match ret {
            UdfReturn::Nothing => output.data.take().unwrap_or(UdfReturn::Nothing),
            ret => ret,
        };
        let declared = output
            .table_schema
            .take()
            .or_else(|| udf.table_schema.clone());

        let mut result = ExecutionResult {
            sidecar: output.sidecar.take(),
            time_taken: Some(elapsed),
            stdout,
            stderr,
            ..Default::default()
        };

        if !options.validate_output {
            result.data = raw_data(ret);
            result.table_schema = declared;
            result.warnings = warnings.into_inner();
            return Ok(result);
        }

        let table = normalize(ret).map_err(|m| Error::sandbox(Stage::Validate, m, None))?;
        match table {
            None => {
                if declared.as_ref().is_some_and(|s| !s.is_empty()) {
                    warnings.push(
                        "UDF is configured with a schema but returns `None`. An empty schema was set for this execution.",
                    );
                }
                result.table_schema = Some(TableSchema::default());
            }
            Some(table) => {
                let schema = match declared {
                    Some(schema) => schema,
                    None => TableSchema::infer(&table)
                        .map_err(|e| Error::sandbox(Stage::Validate, e.to_string(), None))?,
                };
                let mut found = Vec::new();
                validate(
                    &table,
                    &schema,
                    options.skip_index_validation || output.skip_index_validation,
                    &mut found,
                )
                .map_err(|m| Error::sandbox(Stage::Validate, m, None))?;
                for warning in found {
                    warnings.push(warning);
                }

                if options.update_schema && udf.table_schema.is_none() {
                    udf.table_schema = Some(schema.clone());
                }
                result.table_schema = Some(schema);
                result.data = Some(UdfData::Table(table));
            }
        }

        result.warnings = warnings.into_inner();
        Ok(result)
    }

    /// Resolve the compiled unit and the header modules this call may see.
    fn prepare(
        &self,
        udf: &UdfDefinition,
        options: &SandboxOptions,
    ) -> Result<(Arc<CompiledUnit>, ModuleScope)> {
        if let Some(allowlist) = &options.allowed_imports {
            allowlist.check(udf)?;
        }

        let unit = self.symbols.unit(&udf.name).ok_or_else(|| {
            Error::sandbox(
                Stage::Prepare,
                format!("no compiled code registered for `{}`", udf.name),
                None,
            )
        })?;
        if !unit.matches(&udf.code) {
            return Err(Error::sandbox(
                Stage::Prepare,
                format!("compiled code for `{}` is stale: its source changed", udf.name),
                None,
            ));
        }

        let mut modules = ModuleScope::default();
        for header in &udf.headers {
            let resolved = self
                .symbols
                .header(&header.module_name)
                .filter(|h| h.matches(&header.source))
                .ok_or_else(|| {
                    Error::sandbox(
                        Stage::Prepare,
                        format!(
                            "header module `{}` is not registered for this source",
                            header.module_name
                        ),
                        line_of(&udf.code, 0, &header.module_name),
                    )
                })?;
            modules.insert(header.module_name.clone(), resolved);
        }
        Ok((unit, modules))
    }
}

/// Which reserved handles the entrypoint declares.
fn bind_reserved(
    udf: &UdfDefinition,
    entrypoint: &Entrypoint,
    warnings: &mut Warnings,
) -> Result<(bool, bool)> {
    let mut wants = (false, false);
    for param in &entrypoint.params {
        match (param.name.as_str(), param.shape) {
            (OUTPUT_PARAM, ParameterShape::OutputHandle) => wants.0 = true,
            (CONTEXT_PARAM, ParameterShape::ExecutionContext) => wants.1 = true,
            (name, shape) if shape.is_reserved() => {
                return Err(Error::sandbox(
                    Stage::Bind,
                    format!("parameter `{name}` cannot take the {shape:?} handle"),
                    param_line(udf, name),
                ));
            }
            (name @ (OUTPUT_PARAM | CONTEXT_PARAM), _) => warnings.push(format!(
                "`{name}` is a reserved parameter name and should not be used for other parameters"
            )),
            _ => {}
        }
    }
    Ok(wants)
}

fn coerce_args(
    udf: &UdfDefinition,
    entrypoint: &Entrypoint,
    input: &SampleInput,
    warnings: &mut Warnings,
) -> Result<BTreeMap<String, ArgValue>> {
    let ordinary: Vec<_> = entrypoint
        .params
        .iter()
        .filter(|p| !p.shape.is_reserved())
        .collect();
    if input.positional.len() > ordinary.len() {
        return Err(Error::sandbox(
            Stage::Coerce,
            format!(
                "{}() takes {} positional arguments but {} were given",
                udf.entrypoint,
                ordinary.len(),
                input.positional.len()
            ),
            line_of(&udf.code, 0, &udf.entrypoint),
        ));
    }

    let mut raw: BTreeMap<&str, &Value> = ordinary
        .iter()
        .map(|p| p.name.as_str())
        .zip(&input.positional)
        .collect();

    let bound_by_position: Vec<&str> = raw.keys().copied().collect();
    for (name, value) in udf.parameters.iter().chain(&input.kwargs) {
        let from_caller = input.kwargs.contains_key(name);
        match entrypoint.param(name) {
            Some(p) if p.shape.is_reserved() => warnings.push(format!(
                "`{name}` is reserved for the {:?} handle; the supplied value was ignored",
                p.shape
            )),
            Some(p) if bound_by_position.contains(&p.name.as_str()) => {
                if from_caller {
                    return Err(Error::sandbox(
                        Stage::Coerce,
                        format!("{}() got multiple values for argument '{name}'", udf.entrypoint),
                        param_line(udf, name),
                    ));
                }
            }
            Some(p) => {
                raw.insert(p.name.as_str(), value);
            }
            None => tracing::debug!(
                event = "udf.sandbox.unused_parameter",
                udf = %udf.name,
                parameter = %name
            ),
        }
    }

    let mut args = BTreeMap::new();
    for param in ordinary {
        let (value, is_default) = match (raw.get(param.name.as_str()), &param.default) {
            (Some(value), _) => (*value, false),
            (None, Some(default)) => (default, true),
            (None, None) => {
                return Err(Error::sandbox(
                    Stage::Coerce,
                    format!(
                        "{}() missing required argument: '{}'",
                        udf.entrypoint, param.name
                    ),
                    param_line(udf, &param.name),
                ))
            }
        };
        let coerced = if value.is_null() && (param.optional || is_default) {
            ArgValue::Null
        } else {
            coerce(value, param.shape).map_err(|reason| {
                Error::sandbox(
                    Stage::Coerce,
                    format!("parameter `{}`: {reason}", param.name),
                    param_line(udf, &param.name),
                )
            })?
        };
        args.insert(param.name.clone(), coerced);
    }
    Ok(args)
}

/// 1-based line of the first occurrence of `needle` at or after line index `from`.
fn line_of(source: &str, from: usize, needle: &str) -> Option<u32> {
    source
        .lines()
        .enumerate()
        .skip(from)
        .find(|(_, line)| line.contains(needle))
        .map(|(i, _)| i as u32 + 1)
}

/// Where a parameter is declared: searched from the entrypoint's signature onward.
fn param_line(udf: &UdfDefinition, param: &str) -> Option<u32> {
    let signature = line_of(&udf.code, 0, &udf.entrypoint).map_or(0, |l| l as usize - 1);
    line_of(&udf.code, signature, param)
}

/// Warnings returned with the result, each also logged.
struct Warnings {
    udf: String,
    list: Vec<String>,
}

impl Warnings {
    fn new(udf: &str) -> Self {
        Self {
            udf: udf.to_string(),
            list: Vec::new(),
        }
    }

    fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(event = "udf.sandbox.warning", udf = %self.udf, "{message}");
        self.list.push(message);
    }

    fn into_inner(self) -> Vec<String> {
        self.list
    }
}
