use serde_json::{Map, Value};
use udf_core::Table;
use uuid::Uuid;

use crate::geo::{Bbox, GeoTable, TileXyz};

/// A parameter value after coercion to the shape its entrypoint declares.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Dict(Map<String, Value>),
    Tuple(Vec<Value>),
    Uuid(Uuid),
    Bbox(Bbox),
    Tile(TileXyz),
    Geo(GeoTable),
    Table(Table),
    /// Undeclared shape; the caller's value passes through unchanged.
    Json(Value),
}

impl ArgValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            ArgValue::Json(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float(f) => Some(*f),
            ArgValue::Int(i) => Some(*i as f64),
            ArgValue::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            ArgValue::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            ArgValue::List(items) | ArgValue::Tuple(items) => Some(items),
            ArgValue::Json(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Map<String, Value>> {
        match self {
            ArgValue::Dict(map) => Some(map),
            ArgValue::Json(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            ArgValue::Uuid(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_bbox(&self) -> Option<Bbox> {
        match self {
            ArgValue::Bbox(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_tile(&self) -> Option<TileXyz> {
        match self {
            ArgValue::Tile(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_geo(&self) -> Option<&GeoTable> {
        match self {
            ArgValue::Geo(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            ArgValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null | ArgValue::Json(Value::Null))
    }
}
