//! Conversion of loosely-typed call inputs into the shapes entrypoints declare.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use udf_core::Table;
use uuid::Uuid;

use crate::{
    geo::{bounding_tile, Bbox, GeoTable},
    value::ArgValue,
};

/// Declared type of one entrypoint parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterShape {
    /// No annotation; values pass through untouched.
    Any,
    Int,
    Float,
    Bool,
    Text,
    List,
    Dict,
    Tuple,
    Uuid,
    BoundingBox,
    TileXyz,
    /// Feature table with `x`/`y`/`z` columns added from its bounding tile.
    TileGeometry,
    /// Feature table covering the requested area, without tile columns.
    ViewportGeometry,
    GeoTable,
    Table,
    /// Reserved: the per-call output handle, bound under `output`.
    OutputHandle,
    /// Reserved: the per-call execution context, bound under `context`.
    ExecutionContext,
}

impl ParameterShape {
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            ParameterShape::OutputHandle | ParameterShape::ExecutionContext
        )
    }
}

/// Coerce `value` into `shape`. The error is a human-readable reason.
pub fn coerce(value: &Value, shape: ParameterShape) -> Result<ArgValue, String> {
    match shape {
        ParameterShape::Any | ParameterShape::OutputHandle | ParameterShape::ExecutionContext => {
            Ok(ArgValue::Json(value.clone()))
        }
        ParameterShape::Int => to_int(value).map(ArgValue::Int),
        ParameterShape::Float => to_float(value).map(ArgValue::Float),
        ParameterShape::Bool => Ok(ArgValue::Bool(to_bool(value))),
        ParameterShape::Text => Ok(ArgValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ParameterShape::List => match parse_text(value)? {
            Value::Array(items) => Ok(ArgValue::List(items)),
            other => Ok(ArgValue::Json(other)),
        },
        ParameterShape::Dict => match parse_text(value)? {
            Value::Object(map) => Ok(ArgValue::Dict(map)),
            other => Ok(ArgValue::Json(other)),
        },
        ParameterShape::Tuple => match parse_text(value)? {
            Value::Array(items) => Ok(ArgValue::Tuple(items)),
            other => Err(format!("cannot convert {other} to a tuple")),
        },
        ParameterShape::Uuid => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("cannot convert {value} to a UUID"))?;
            Uuid::parse_str(text)
                .map(ArgValue::Uuid)
                .map_err(|e| format!("invalid UUID {text:?}: {e}"))
        }
        ParameterShape::BoundingBox => match spatial(value)? {
            Spatial::Bounds(b) => Ok(ArgValue::Bbox(b)),
            Spatial::Features(geo) => geo
                .total_bounds()
                .map(ArgValue::Bbox)
                .ok_or_else(|| "feature table has no coordinates".to_string()),
        },
        ParameterShape::TileXyz => match spatial(value)? {
            Spatial::Bounds(b) => Ok(ArgValue::Tile(bounding_tile(b))),
            Spatial::Features(geo) => {
                if let Some(tile) = geo.first_tile() {
                    return Ok(ArgValue::Tile(tile));
                }
                geo.total_bounds()
                    .map(|b| ArgValue::Tile(bounding_tile(b)))
                    .ok_or_else(|| "feature table has no coordinates".to_string())
            }
        },
        ParameterShape::TileGeometry | ParameterShape::ViewportGeometry => {
            let mut geo = match spatial(value)? {
                Spatial::Bounds(b) => GeoTable::from_bbox(b),
                Spatial::Features(geo) => geo,
            };
            if shape == ParameterShape::TileGeometry && !geo.has_properties(&["x", "y", "z"]) {
                let bounds = geo
                    .total_bounds()
                    .ok_or_else(|| "feature table has no coordinates".to_string())?;
                geo.assign_tile(bounding_tile(bounds));
            }
            Ok(ArgValue::Geo(geo))
        }
        ParameterShape::GeoTable => match spatial(value)? {
            Spatial::Bounds(b) => Ok(ArgValue::Geo(GeoTable::from_bbox(b))),
            Spatial::Features(geo) => Ok(ArgValue::Geo(geo)),
        },
        ParameterShape::Table => table(&parse_text(value)?).map(ArgValue::Table),
    }
}

/// Strings parse in base 10; numbers truncate toward zero.
fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("invalid literal for int with base 10: {s:?}")),
        Value::Bool(b) => Ok(*b as i64),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or_else(|| format!("cannot convert {n} to int")),
        other => Err(format!("cannot convert {other} to int")),
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("could not convert string to float: {s:?}")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("cannot convert {n} to float")),
        other => Err(format!("cannot convert {other} to float")),
    }
}

/// Only the text `false` (any case) is false among strings; everything else follows truthiness.
fn to_bool(value: &Value) -> bool {
    match value {
        Value::String(s) if s.to_lowercase() == "false" => false,
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Strings are JSON text; other values are already parsed.
fn parse_text(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(s) => serde_json::from_str(s).map_err(|e| format!("invalid JSON {s:?}: {e}")),
        other => Ok(other.clone()),
    }
}

enum Spatial {
    Bounds(Bbox),
    Features(GeoTable),
}

/// `[minx, miny, maxx, maxy]` or GeoJSON, either inline or as JSON text.
fn spatial(value: &Value) -> Result<Spatial, String> {
    match parse_text(value)? {
        Value::Array(items) => Bbox::from_slice(&items)
            .map(Spatial::Bounds)
            .ok_or_else(|| format!("expected [minx, miny, maxx, maxy], got {}", Value::Array(items))),
        obj @ Value::Object(_) => GeoTable::from_geojson(&obj).map(Spatial::Features),
        other => Err(format!("not sure how to convert {other} to a feature table")),
    }
}

/// Records (`[{..}, ..]`) or columns (`{"col": [..]}`).
fn table(value: &Value) -> Result<Table, String> {
    match value {
        Value::Array(records) => Table::from_records(records).map_err(|e| e.to_string()),
        Value::Object(columns) => columns_table(columns),
        other => Err(format!("not sure how to convert {other} to a table")),
    }
}

fn columns_table(columns: &Map<String, Value>) -> Result<Table, String> {
    let mut table = Table::new();
    for (name, values) in columns {
        let values = match values {
            Value::Array(items) => items.clone(),
            // `{"col": {"0": v0, "1": v1}}`, keyed by row label.
            Value::Object(rows) => rows.values().cloned().collect(),
            other => return Err(format!("column {name:?} is not a list: {other}")),
        };
        table.push_column(name.clone(), values).map_err(|e| e.to_string())?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::TileXyz;
    use serde_json::json;

    #[test]
    fn only_the_word_false_is_false_among_strings() {
        for (input, expected) in [
            (json!("false"), false),
            (json!("FALSE"), false),
            (json!("False"), false),
            (json!("0"), true),
            (json!("no"), true),
            (json!(""), false),
            (json!(0), false),
            (json!(2), true),
            (json!(null), false),
            (json!([]), false),
        ] {
            assert_eq!(
                coerce(&input, ParameterShape::Bool).unwrap(),
                ArgValue::Bool(expected),
                "{input}"
            );
        }
    }

    #[test]
    fn ints_parse_base_ten_and_truncate() {
        assert_eq!(coerce(&json!(" 42 "), ParameterShape::Int).unwrap(), ArgValue::Int(42));
        assert_eq!(coerce(&json!(3.9), ParameterShape::Int).unwrap(), ArgValue::Int(3));
        assert_eq!(coerce(&json!(true), ParameterShape::Int).unwrap(), ArgValue::Int(1));
        assert!(coerce(&json!("0x10"), ParameterShape::Int).is_err());
        assert!(coerce(&json!("1.5"), ParameterShape::Int).is_err());
        assert_eq!(coerce(&json!("1.5"), ParameterShape::Float).unwrap(), ArgValue::Float(1.5));
    }

    #[test]
    fn containers_parse_parse_text() {
        assert_eq!(
            coerce(&json!("[1, 2]"), ParameterShape::List).unwrap(),
            ArgValue::List(vec![json!(1), json!(2)])
        );
        assert_eq!(
            coerce(&json!([1, 2]), ParameterShape::Tuple).unwrap(),
            ArgValue::Tuple(vec![json!(1), json!(2)])
        );
        let dict = coerce(&json!("{\"a\": 1}"), ParameterShape::Dict).unwrap();
        assert_eq!(dict.as_dict().and_then(|d| d.get("a")), Some(&json!(1)));
        assert!(coerce(&json!("{oops"), ParameterShape::Dict).is_err());
    }

    #[test]
    fn uuids_must_be_text() {
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        assert!(matches!(coerce(&json!(id), ParameterShape::Uuid), Ok(ArgValue::Uuid(_))));
        assert!(coerce(&json!(7), ParameterShape::Uuid).is_err());
    }

    #[test]
    fn tile_shapes_derive_from_bounds() {
        let tile = TileXyz::new(1, 2, 3);
        let b = tile.bounds();
        let bounds = json!([b.minx, b.miny, b.maxx, b.maxy]);

        assert_eq!(
            coerce(&bounds, ParameterShape::TileXyz).unwrap(),
            ArgValue::Tile(tile)
        );
        let as_text = Value::String(bounds.to_string());
        let ArgValue::Geo(geo) = coerce(&as_text, ParameterShape::TileGeometry).unwrap() else {
            panic!("expected a feature table");
        };
        assert_eq!(geo.first_tile(), Some(tile));

        let ArgValue::Geo(viewport) = coerce(&bounds, ParameterShape::ViewportGeometry).unwrap()
        else {
            panic!("expected a feature table");
        };
        assert!(!viewport.has_properties(&["x"]));
        assert_eq!(coerce(&bounds, ParameterShape::BoundingBox).unwrap(), ArgValue::Bbox(b));
    }

    #[test]
    fn existing_tile_columns_are_kept() {
        let fc = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [0.5, 0.5]},
                "properties": {"x": 9, "y": 8, "z": 7},
            }],
        });
        assert_eq!(
            coerce(&fc, ParameterShape::TileXyz).unwrap(),
            ArgValue::Tile(TileXyz::new(9, 8, 7))
        );
        let ArgValue::Geo(geo) = coerce(&fc, ParameterShape::TileGeometry).unwrap() else {
            panic!("expected a feature table");
        };
        assert_eq!(geo.first_tile(), Some(TileXyz::new(9, 8, 7)));
    }

    #[test]
    fn tables_accept_records_and_columns() {
        let records = coerce(&json!("[{\"a\": 1}, {\"a\": 2}]"), ParameterShape::Table).unwrap();
        assert_eq!(records.as_table().map(Table::num_rows), Some(2));
        let columns = coerce(&json!({"a": [1, 2, 3]}), ParameterShape::Table).unwrap();
        assert_eq!(columns.as_table().map(Table::num_rows), Some(3));
    }

    #[test]
    fn unannotated_values_pass_through() {
        let value = json!({"nested": [1, "two"]});
        assert_eq!(coerce(&value, ParameterShape::Any).unwrap(), ArgValue::Json(value));
    }
}
