//! Output normalization and schema validation.

use serde_json::Value;
use udf_core::{PrimitiveType, Table, TableSchema, UdfData, INDEX_COLUMN_NAME};

use crate::invocation::UdfReturn;

/// Tabular form of a return value, with every column label rendered as text.
///
/// `Ok(None)` means the entrypoint returned nothing.
pub fn normalize(ret: UdfReturn) -> Result<Option<Table>, String> {
    let table = match ret {
        UdfReturn::Nothing | UdfReturn::Value(Value::Null) => return Ok(None),
        UdfReturn::Table(table) => table,
        UdfReturn::Records(records) => from_records(&records)?,
        UdfReturn::Columns(columns) => {
            let mut table = Table::new();
            for (key, values) in columns {
                table
                    .push_column(key.to_string(), values)
                    .map_err(|e| e.to_string())?;
            }
            table
        }
        UdfReturn::Geo(geo) => geo.to_table().map_err(|e| e.to_string())?,
        UdfReturn::Value(Value::Array(records)) if records.iter().all(Value::is_object) => {
            from_records(&records)?
        }
        UdfReturn::Value(Value::Object(columns))
            if columns.values().all(Value::is_array) && !columns.is_empty() =>
        {
            let mut table = Table::new();
            for (name, values) in columns {
                let Value::Array(values) = values else {
                    continue;
                };
                table.push_column(name, values).map_err(|e| e.to_string())?;
            }
            table
        }
        UdfReturn::Value(other) => {
            return Err(format!(
                "Unexpected result type {}",
                json_type_name(&other)
            ))
        }
    };
    Ok(Some(table))
}

fn from_records(records: &[Value]) -> Result<Table, String> {
    Table::from_records(records).map_err(|e| e.to_string())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// The return value as-is, for callers that opted out of validation.
pub fn raw_data(ret: UdfReturn) -> Option<UdfData> {
    match ret {
        UdfReturn::Nothing => None,
        UdfReturn::Table(table) => Some(UdfData::Table(table)),
        UdfReturn::Records(records) => Some(UdfData::Json(Value::Array(records))),
        UdfReturn::Columns(columns) => Some(UdfData::Json(Value::Object(
            columns
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::Array(v)))
                .collect(),
        ))),
        UdfReturn::Geo(geo) => Some(UdfData::Json(geo.to_feature_collection())),
        UdfReturn::Value(value) => Some(UdfData::Json(value)),
    }
}

/// Check `table` against `schema`, pushing non-fatal findings onto `warnings`.
///
/// The identity column is required unless `skip_index` is set. Columns outside the schema fail;
/// values must cast laxly into their field's type, except geometry columns.
pub fn validate(
    table: &Table,
    schema: &TableSchema,
    skip_index: bool,
    warnings: &mut Vec<String>,
) -> Result<(), String> {
    match table.column(INDEX_COLUMN_NAME) {
        Some(index) => check_index(&index.values, warnings),
        None if skip_index => {}
        None => {
            return Err(format!(
                "Output is missing the required `{INDEX_COLUMN_NAME}` column"
            ))
        }
    }

    let extra: Vec<&str> = table
        .column_names()
        .filter(|name| *name != INDEX_COLUMN_NAME && schema.field(name).is_none())
        .collect();
    if !extra.is_empty() {
        return Err(format!(
            "Additional columns specified that were not in the schema: {extra:?}"
        ));
    }

    for field in &schema.fields {
        if field.name == INDEX_COLUMN_NAME {
            continue;
        }
        let Some(column) = table.column(&field.name) else {
            return Err(format!(
                "Column `{}` is declared in the schema but missing from the output",
                field.name
            ));
        };
        if field.data_type == PrimitiveType::Geometry {
            continue;
        }
        for value in &column.values {
            if value.is_null() && !field.nullable {
                return Err(format!("Column `{}` is not nullable", field.name));
            }
            if !field.data_type.accepts(value) {
                return Err(format!(
                    "Column `{}`: cannot cast {value} to {:?}",
                    field.name, field.data_type
                ));
            }
        }
    }
    Ok(())
}

fn check_index(values: &[Value], warnings: &mut Vec<String>) {
    match PrimitiveType::infer(values) {
        Some(PrimitiveType::Null) => {}
        Some(t) if t.is_integral() => {
            if values.iter().any(|v| v.as_i64().is_some_and(|i| i < 0)) {
                warnings.push(format!(
                    "`{INDEX_COLUMN_NAME}` has negative values, which may cause errors."
                ));
            }
        }
        other => {
            let dtype = other
                .map(|t| format!("{t:?}").to_lowercase())
                .unwrap_or_else(|| "mixed".to_string());
            warnings.push(format!(
                "Expected `{INDEX_COLUMN_NAME}` to be an integer, but it was {dtype}"
            ));
        }
    }
}
