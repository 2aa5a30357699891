//! Local execution of one unit of work against one sample input.
//!
//! The [`Sandbox`] never compiles source text. It runs callables resolved from a caller-provided
//! [`SymbolTable`], coerces loosely-typed inputs to each parameter's declared
//! [`ParameterShape`], and validates the returned table against the declared schema.

pub mod coerce;
pub mod geo;
pub mod imports;
pub mod invocation;
pub mod registry;
pub mod sandbox;
pub mod validate;
pub mod value;

pub use coerce::{coerce, ParameterShape};
pub use geo::{bounding_tile, Bbox, GeoTable, TileXyz};
pub use imports::ImportAllowlist;
pub use invocation::{ColumnKey, ExecutionContext, Invocation, OutputHandle, UdfError, UdfReturn};
pub use registry::{CompiledUnit, HeaderUnit, ModuleScope, ParamSpec, SymbolTable};
pub use sandbox::{SampleInput, Sandbox, SandboxOptions};
pub use value::ArgValue;
