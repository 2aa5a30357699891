//! Content-type driven interpretation of remote response bodies.
//!
//! Pixel and columnar codecs are not implemented here. The default decoder tags the bytes, reads
//! what the PNG header says about the image's shape, and reads the provenance a producer left in
//! a TIFF's GDAL metadata.

use serde::Deserialize;
use udf_core::payload::{
    RasterLayout, RasterProvenance, RemotePayload, ORIG_TYPE_DATA_ARRAY,
};

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// TIFF tag holding GDAL's metadata XML.
const GDAL_METADATA_TAG: u16 = 42112;

/// Metadata domain the producer writes raster provenance under.
pub const PROVENANCE_DOMAIN: &str = "udf";

const DEFAULT_DATASET_KEY: &str = "image";

pub trait PayloadDecoder: Send + Sync {
    /// Interpret a successful response body. Errors are reported as malformed remote payloads.
    fn decode(&self, content_type: Option<&str>, bytes: Vec<u8>) -> Result<RemotePayload, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl PayloadDecoder for DefaultDecoder {
    fn decode(&self, content_type: Option<&str>, bytes: Vec<u8>) -> Result<RemotePayload, String> {
        match content_type {
            Some("application/octet-stream") => Ok(RemotePayload::Columnar(bytes)),
            Some("image/png") => {
                let (width, height, bands) = png_dimensions(&bytes)?;
                let (dims, shape) = if bands == 1 {
                    (vec!["y", "x"], vec![height, width])
                } else {
                    (vec!["band", "y", "x"], vec![bands, height, width])
                };
                Ok(RemotePayload::Image {
                    dims: dims.into_iter().map(String::from).collect(),
                    shape,
                    bytes,
                })
            }
            Some("image/tiff") => {
                let provenance = tiff_provenance(&bytes)?;
                let layout = raster_layout(provenance.as_ref());
                Ok(RemotePayload::GeoRaster {
                    bytes,
                    provenance,
                    layout,
                })
            }
            other => Ok(RemotePayload::Raw {
                content_type: other.map(str::to_string),
                bytes,
            }),
        }
    }
}

/// Width, height and band count from the IHDR chunk.
pub fn png_dimensions(bytes: &[u8]) -> Result<(usize, usize, usize), String> {
    if bytes.len() < 26 || &bytes[..8] != PNG_SIGNATURE || &bytes[12..16] != b"IHDR" {
        return Err("response is labeled image/png but is not a PNG image".to_string());
    }
    let be = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let width = be(16) as usize;
    let height = be(20) as usize;
    let bands = match bytes[25] {
        0 | 3 => 1,
        4 => 2,
        2 => 3,
        6 => 4,
        other => return Err(format!("unsupported PNG color type {other}")),
    };
    Ok((width, height, bands))
}

/// Present the raster the way its producer had it: a bare array is rehydrated to its original
/// shape, anything else without a known type becomes a one-variable dataset.
pub fn raster_layout(provenance: Option<&RasterProvenance>) -> RasterLayout {
    let Some(provenance) = provenance else {
        return RasterLayout::Dataset {
            key: DEFAULT_DATASET_KEY.to_string(),
        };
    };
    if provenance.wants_rehydration() {
        if let Some(shape) = &provenance.shape {
            return RasterLayout::Array {
                shape: shape.clone(),
                bounds: provenance.bounds,
            };
        }
    }
    if provenance.orig_type.as_deref() == Some(ORIG_TYPE_DATA_ARRAY) {
        return RasterLayout::DataArray;
    }
    RasterLayout::Dataset {
        key: provenance
            .key
            .clone()
            .unwrap_or_else(|| DEFAULT_DATASET_KEY.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct GdalMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<GdalItem>,
}

#[derive(Debug, Deserialize)]
struct GdalItem {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@domain", default)]
    domain: Option<String>,
    #[serde(rename = "$text", default)]
    value: String,
}

/// Provenance items from the TIFF's GDAL metadata, or `None` when it carries none.
pub fn tiff_provenance(bytes: &[u8]) -> Result<Option<RasterProvenance>, String> {
    let Some(xml) = gdal_metadata(bytes)? else {
        return Ok(None);
    };
    let metadata: GdalMetadata =
        quick_xml::de::from_str(&xml).map_err(|e| format!("malformed GDAL metadata: {e}"))?;

    let mut provenance = RasterProvenance::default();
    let mut found = false;
    for item in metadata.items {
        if item.domain.as_deref() != Some(PROVENANCE_DOMAIN) {
            continue;
        }
        found = true;
        match item.name.as_str() {
            "orig_type" => provenance.orig_type = Some(item.value),
            "shape" => {
                provenance.shape = Some(
                    serde_json::from_str(&item.value)
                        .map_err(|e| format!("malformed raster shape {:?}: {e}", item.value))?,
                )
            }
            "bounds" => {
                provenance.bounds = Some(
                    serde_json::from_str(&item.value)
                        .map_err(|e| format!("malformed raster bounds {:?}: {e}", item.value))?,
                )
            }
            "key" => provenance.key = Some(item.value),
            _ => {}
        }
    }
    Ok(found.then_some(provenance))
}

struct TiffReader<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl TiffReader<'_> {
    fn u16(&self, at: usize) -> Result<u16, String> {
        let b = self.slice(at, 2)?;
        let b = [b[0], b[1]];
        Ok(if self.little_endian {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        })
    }

    fn u32(&self, at: usize) -> Result<u32, String> {
        let b = self.slice(at, 4)?;
        let b = [b[0], b[1], b[2], b[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn slice(&self, at: usize, len: usize) -> Result<&[u8], String> {
        at.checked_add(len)
            .and_then(|end| self.bytes.get(at..end))
            .ok_or_else(|| "truncated TIFF directory".to_string())
    }
}

/// The GDAL metadata XML stored in the first image directory.
fn gdal_metadata(bytes: &[u8]) -> Result<Option<String>, String> {
    let little_endian = match bytes.get(..4) {
        Some(b"II*\0") => true,
        Some(b"MM\0*") => false,
        _ => return Err("response is labeled image/tiff but is not a TIFF image".to_string()),
    };
    let tiff = TiffReader {
        bytes,
        little_endian,
    };

    let ifd = tiff.u32(4)? as usize;
    let entries = tiff.u16(ifd)? as usize;
    for i in 0..entries {
        let entry = ifd + 2 + 12 * i;
        if tiff.u16(entry)? != GDAL_METADATA_TAG {
            continue;
        }
        let len = tiff.u32(entry + 4)? as usize;
        let at = if len <= 4 {
            entry + 8
        } else {
            tiff.u32(entry + 8)? as usize
        };
        let raw = tiff.slice(at, len)?;
        let text = String::from_utf8_lossy(raw);
        return Ok(Some(text.trim_end_matches('\0').to_string()));
    }
    Ok(None)
}
