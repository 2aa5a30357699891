use serde::{Deserialize, Serialize};

/// `orig_type` of a raster that was a bare array before it was encoded.
pub const ORIG_TYPE_ARRAY: &str = "numpy.ndarray";

/// `orig_type` of a raster that was a labeled array before it was encoded.
pub const ORIG_TYPE_DATA_ARRAY: &str = "xarray.DataArray";

/// Provenance embedded in a geographic raster response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RasterProvenance {
    /// Original in-memory type of the raster before it was encoded.
    pub orig_type: Option<String>,
    pub shape: Option<Vec<usize>>,
    pub bounds: Option<[f64; 4]>,
    /// Variable name for rasters handed back as a dataset.
    pub key: Option<String>,
}

impl RasterProvenance {
    /// Whether the raster should be handed back as a bare array in its original shape.
    pub fn wants_rehydration(&self) -> bool {
        self.orig_type.as_deref() == Some(ORIG_TYPE_ARRAY) && self.shape.is_some()
    }
}

/// How a decoded geographic raster is presented.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterLayout {
    /// Bare array in its original shape, with the bounds the producer recorded.
    Array {
        shape: Vec<usize>,
        bounds: Option<[f64; 4]>,
    },

    /// Labeled `band`/`y`/`x` array.
    DataArray,

    /// Dataset holding the raster under one variable.
    Dataset { key: String },
}

/// A response body tagged with the content type it arrived as. Pixel and columnar codecs are
/// out of scope; bytes are kept opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePayload {
    /// Structured columnar bytes (`application/octet-stream`).
    Columnar(Vec<u8>),

    /// A single raster image with labeled dimensions (`image/png`).
    Image {
        dims: Vec<String>,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    },

    /// A single-band geographic raster (`image/tiff`).
    GeoRaster {
        bytes: Vec<u8>,
        provenance: Option<RasterProvenance>,
        layout: RasterLayout,
    },

    Raw {
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
}

impl RemotePayload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            RemotePayload::Columnar(bytes) => bytes,
            RemotePayload::Image { bytes, .. }
            | RemotePayload::GeoRaster { bytes, .. }
            | RemotePayload::Raw { bytes, .. } => bytes,
        }
    }
}
