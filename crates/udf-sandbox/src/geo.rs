//! Bounding boxes, web-mercator tiles and feature tables.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::f64::consts::PI;
use udf_core::Table;

const EPSILON: f64 = 1e-14;
const LL_EPSILON: f64 = 1e-11;
const MAX_BBOX_ZOOM: u32 = 28;

/// `[west, south, east, north]` in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl Bbox {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
        }
    }

    pub fn from_slice(values: &[Value]) -> Option<Self> {
        let nums: Vec<f64> = values.iter().map(Value::as_f64).collect::<Option<_>>()?;
        match nums.as_slice() {
            [minx, miny, maxx, maxy] => Some(Self::new(*minx, *miny, *maxx, *maxy)),
            _ => None,
        }
    }

    fn extend(self, other: Bbox) -> Bbox {
        Bbox::new(
            self.minx.min(other.minx),
            self.miny.min(other.miny),
            self.maxx.max(other.maxx),
            self.maxy.max(other.maxy),
        )
    }

    /// Closed GeoJSON polygon covering the box.
    pub fn to_polygon(&self) -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[
                [self.maxx, self.miny],
                [self.maxx, self.maxy],
                [self.minx, self.maxy],
                [self.minx, self.miny],
                [self.maxx, self.miny],
            ]],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileXyz {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl TileXyz {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn bounds(&self) -> Bbox {
        let z2 = 2f64.powi(self.z as i32);
        let lon = |x: f64| x / z2 * 360.0 - 180.0;
        let lat = |y: f64| (PI * (1.0 - 2.0 * y / z2)).sinh().atan().to_degrees();
        Bbox::new(
            lon(self.x as f64),
            lat(self.y as f64 + 1.0),
            lon(self.x as f64 + 1.0),
            lat(self.y as f64),
        )
    }
}

fn mercator_fraction(lng: f64, lat: f64) -> Option<(f64, f64)> {
    if lat.abs() >= 90.0 {
        return None;
    }
    let x = lng / 360.0 + 0.5;
    let sinlat = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sinlat) / (1.0 - sinlat)).ln() / PI;
    Some((x, y))
}

fn tile_index(fraction: f64, z2: f64) -> u64 {
    if fraction <= 0.0 {
        0
    } else if fraction >= 1.0 {
        (z2 - 1.0) as u64
    } else {
        ((fraction + EPSILON) * z2).floor() as u64
    }
}

/// Tile at `zoom` containing the point.
pub fn tile(lng: f64, lat: f64, zoom: u32) -> Option<(u64, u64)> {
    let (x, y) = mercator_fraction(lng, lat)?;
    let z2 = 2f64.powi(zoom as i32);
    Some((tile_index(x, z2), tile_index(y, z2)))
}

/// Smallest tile fully containing `bbox`; `0/0/0` when the box cannot be placed.
pub fn bounding_tile(bbox: Bbox) -> TileXyz {
    let east = bbox.maxx - LL_EPSILON;
    let south = bbox.miny + LL_EPSILON;
    let (Some(min), Some(max)) = (tile(bbox.minx, bbox.maxy, 32), tile(east, south, 32)) else {
        return TileXyz::new(0, 0, 0);
    };

    let mut zoom = MAX_BBOX_ZOOM;
    for z in 0..MAX_BBOX_ZOOM {
        let mask = 1u64 << (32 - (z + 1));
        if (min.0 & mask) != (max.0 & mask) || (min.1 & mask) != (max.1 & mask) {
            zoom = z;
            break;
        }
    }
    if zoom == 0 {
        return TileXyz::new(0, 0, 0);
    }
    TileXyz::new(
        (min.0 >> (32 - zoom)) as u32,
        (min.1 >> (32 - zoom)) as u32,
        zoom,
    )
}

/// Bounds of every position inside a GeoJSON geometry.
pub fn geometry_bounds(geometry: &Value) -> Option<Bbox> {
    match geometry {
        Value::Object(obj) => {
            if let Some(geoms) = obj.get("geometries").and_then(Value::as_array) {
                return geoms
                    .iter()
                    .filter_map(geometry_bounds)
                    .reduce(Bbox::extend);
            }
            obj.get("coordinates").and_then(geometry_bounds)
        }
        Value::Array(items) => match items.as_slice() {
            [Value::Number(x), Value::Number(y), ..] => {
                let (x, y) = (x.as_f64()?, y.as_f64()?);
                Some(Bbox::new(x, y, x, y))
            }
            _ => items
                .iter()
                .filter_map(geometry_bounds)
                .reduce(Bbox::extend),
        },
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// A table of features, each a geometry plus properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoTable {
    pub features: Vec<Feature>,
}

impl GeoTable {
    pub fn from_bbox(bbox: Bbox) -> Self {
        Self {
            features: vec![Feature {
                geometry: bbox.to_polygon(),
                properties: Map::new(),
            }],
        }
    }

    /// Parse a FeatureCollection, a single Feature, or a bare geometry.
    pub fn from_geojson(value: &Value) -> Result<Self, String> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "GeoJSON object has no `type`".to_string())?;
        match kind {
            "FeatureCollection" => {
                let features = value
                    .get("features")
                    .cloned()
                    .ok_or_else(|| "FeatureCollection has no `features`".to_string())?;
                let features: Vec<Feature> = serde_json::from_value(features)
                    .map_err(|e| format!("invalid feature: {e}"))?;
                Ok(Self { features })
            }
            "Feature" => {
                let feature: Feature = serde_json::from_value(value.clone())
                    .map_err(|e| format!("invalid feature: {e}"))?;
                Ok(Self {
                    features: vec![feature],
                })
            }
            _ if udf_core::schema::is_geometry(value) => Ok(Self {
                features: vec![Feature {
                    geometry: value.clone(),
                    properties: Map::new(),
                }],
            }),
            other => Err(format!("unsupported GeoJSON type {other:?}")),
        }
    }

    pub fn total_bounds(&self) -> Option<Bbox> {
        self.features
            .iter()
            .filter_map(|f| geometry_bounds(&f.geometry))
            .reduce(Bbox::extend)
    }

    pub fn has_properties(&self, names: &[&str]) -> bool {
        !self.features.is_empty()
            && self
                .features
                .iter()
                .all(|f| names.iter().all(|n| f.properties.contains_key(*n)))
    }

    /// Tile recorded on the first feature's `x`/`y`/`z` properties.
    pub fn first_tile(&self) -> Option<TileXyz> {
        let props = &self.features.first()?.properties;
        let get = |k: &str| props.get(k).and_then(Value::as_u64).map(|v| v as u32);
        Some(TileXyz::new(get("x")?, get("y")?, get("z")?))
    }

    pub fn assign_tile(&mut self, tile: TileXyz) {
        for feature in &mut self.features {
            feature.properties.insert("x".to_string(), json!(tile.x));
            feature.properties.insert("y".to_string(), json!(tile.y));
            feature.properties.insert("z".to_string(), json!(tile.z));
        }
    }

    pub fn to_feature_collection(&self) -> Value {
        let features: Vec<Value> = self
            .features
            .iter()
            .map(|f| json!({ "type": "Feature", "geometry": f.geometry, "properties": f.properties }))
            .collect();
        json!({ "type": "FeatureCollection", "features": features })
    }

    /// Property columns followed by a `geometry` column.
    pub fn to_table(&self) -> udf_core::Result<Table> {
        let records: Vec<Value> = self
            .features
            .iter()
            .map(|f| Value::Object(f.properties.clone()))
            .collect();
        let mut table = Table::from_records(&records)?;
        let geometry = self.features.iter().map(|f| f.geometry.clone()).collect();
        table.push_column("geometry", geometry)?;
        Ok(table)
    }
}
