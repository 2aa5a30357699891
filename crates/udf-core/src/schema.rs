//! Declared output schemas and the tabular value local executions return.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row-identity column every validated output must carry.
pub const INDEX_COLUMN_NAME: &str = "fused_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    Date32,
    Date64,
    String,
    LargeString,
    Binary,
    LargeBinary,
    Geometry,
}

impl PrimitiveType {
    pub fn is_integral(self) -> bool {
        self.int_range().is_some()
    }

    pub fn is_numeric(self) -> bool {
        self.is_integral()
            || matches!(
                self,
                PrimitiveType::Float16 | PrimitiveType::Float32 | PrimitiveType::Float64
            )
    }

    fn int_range(self) -> Option<(i128, i128)> {
        let range = match self {
            PrimitiveType::Int8 => (i8::MIN as i128, i8::MAX as i128),
            PrimitiveType::Int16 => (i16::MIN as i128, i16::MAX as i128),
            PrimitiveType::Int32 => (i32::MIN as i128, i32::MAX as i128),
            PrimitiveType::Int64 => (i64::MIN as i128, i64::MAX as i128),
            PrimitiveType::Uint8 => (0, u8::MAX as i128),
            PrimitiveType::Uint16 => (0, u16::MAX as i128),
            PrimitiveType::Uint32 => (0, u32::MAX as i128),
            PrimitiveType::Uint64 => (0, u64::MAX as i128),
            _ => return None,
        };
        Some(range)
    }

    /// Whether `value` can be cast into this type without losing data. Numbers may widen, and
    /// a float fits an integer field only when it is whole. Nothing is rendered as text and text
    /// never becomes a number.
    pub fn accepts(self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }

        if let Some((min, max)) = self.int_range() {
            let as_int = match value {
                Value::Bool(b) => Some(*b as i128),
                Value::Number(n) => n
                    .as_i64()
                    .map(i128::from)
                    .or_else(|| n.as_u64().map(i128::from))
                    .or_else(|| {
                        n.as_f64()
                            .filter(|f| f.is_finite() && f.fract() == 0.0)
                            .map(|f| f as i128)
                    }),
                _ => None,
            };
            return as_int.is_some_and(|v| v >= min && v <= max);
        }

        match self {
            PrimitiveType::Null => false,
            PrimitiveType::Bool => value.is_boolean(),
            PrimitiveType::Float16 | PrimitiveType::Float32 | PrimitiveType::Float64 => {
                matches!(value, Value::Bool(_) | Value::Number(_))
            }
            PrimitiveType::Date32 | PrimitiveType::Date64 => match value {
                Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                Value::Number(n) => n.as_i64().is_some(),
                _ => false,
            },
            PrimitiveType::String | PrimitiveType::LargeString => value.is_string(),
            PrimitiveType::Binary | PrimitiveType::LargeBinary => match value {
                Value::String(_) => true,
                Value::Array(items) => items
                    .iter()
                    .all(|v| v.as_u64().is_some_and(|b| b <= u8::MAX as u64)),
                _ => false,
            },
            PrimitiveType::Geometry => value.is_string() || is_geometry(value),
            _ => false,
        }
    }

    /// Narrowest type describing every value in a column, or `None` when values disagree.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<PrimitiveType> {
        let mut inferred = PrimitiveType::Null;
        for value in values {
            let this = match value {
                Value::Null => continue,
                Value::Bool(_) => PrimitiveType::Bool,
                Value::Number(n) if n.is_i64() => PrimitiveType::Int64,
                Value::Number(n) if n.is_u64() => PrimitiveType::Uint64,
                Value::Number(_) => PrimitiveType::Float64,
                Value::String(_) => PrimitiveType::String,
                v if is_geometry(v) => PrimitiveType::Geometry,
                _ => return None,
            };
            inferred = match (inferred, this) {
                (PrimitiveType::Null, t) => t,
                (a, b) if a == b => a,
                (PrimitiveType::Int64, PrimitiveType::Float64)
                | (PrimitiveType::Float64, PrimitiveType::Int64)
                | (PrimitiveType::Uint64, PrimitiveType::Float64)
                | (PrimitiveType::Float64, PrimitiveType::Uint64) => PrimitiveType::Float64,
                (PrimitiveType::Int64, PrimitiveType::Uint64)
                | (PrimitiveType::Uint64, PrimitiveType::Int64) => PrimitiveType::Float64,
                _ => return None,
            };
        }
        Some(inferred)
    }
}

/// A GeoJSON geometry object.
pub fn is_geometry(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("type").is_some_and(Value::is_string)
        && (obj.contains_key("coordinates") || obj.contains_key("geometries"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: PrimitiveType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: PrimitiveType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Ordered output schema declared by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<Field>,
}

impl TableSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The natural schema of `table`, one field per column in column order.
    pub fn infer(table: &Table) -> crate::Result<Self> {
        let mut fields = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            let data_type = PrimitiveType::infer(&column.values).ok_or_else(|| {
                crate::Error::validation(format!(
                    "cannot infer a single type for column {:?}",
                    column.name
                ))
            })?;
            fields.push(Field::new(column.name.clone(), data_type));
        }
        Ok(Self { fields })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// A small columnar table of JSON cells.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Append a column. All columns must have the same length and distinct names.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) -> crate::Result<()> {
        let name = name.into();
        if self.column(&name).is_some() {
            return Err(crate::Error::validation(format!("duplicate column {name:?}")));
        }
        if !self.columns.is_empty() && values.len() != self.num_rows() {
            return Err(crate::Error::validation(format!(
                "column {name:?} has {} rows, expected {}",
                values.len(),
                self.num_rows()
            )));
        }
        self.columns.push(Column { name, values });
        Ok(())
    }

    pub fn with_column(mut self, name: impl Into<String>, values: Vec<Value>) -> crate::Result<Self> {
        self.push_column(name, values)?;
        Ok(self)
    }

    /// Build a table from an array of JSON objects. Columns appear in the order keys are first seen.
    pub fn from_records(records: &[Value]) -> crate::Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            let obj = record.as_object().ok_or_else(|| {
                crate::Error::validation("table records must be JSON objects")
            })?;
            for key in obj.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }

        let mut table = Table::new();
        for name in names {
            let values = records
                .iter()
                .map(|r| r.get(&name).cloned().unwrap_or(Value::Null))
                .collect();
            table.push_column(name, values)?;
        }
        Ok(table)
    }

    pub fn to_records(&self) -> Vec<Value> {
        (0..self.num_rows())
            .map(|row| {
                let mut obj = Map::new();
                for column in &self.columns {
                    obj.insert(column.name.clone(), column.values[row].clone());
                }
                Value::Object(obj)
            })
            .collect()
    }
}
