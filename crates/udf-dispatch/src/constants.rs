/// Client id that targets a realtime server running on this machine.
pub const LOCAL_CLIENT_ID: &str = "_local";
pub const LOCAL_REALTIME_URL: &str = "http://127.0.0.1:8000";

pub const DEFAULT_BASE_URL: &str = "https://www.udf.dev/server/v1";

/// Nesting depth of the calling execution; remote workers use it to bound recursion.
pub const RECURSION_HEADER: &str = "Udf-Recursion";

/// Structured error message set by the realtime service; wins over every other error source.
pub const ERROR_HEADER: &str = "x-udf-error";

/// JSON log handler of the worker process: stdout, stderr and exception details.
pub const METADATA_HEADER: &str = "x-udf-metadata";

pub const DEFAULT_DTYPE_VECTOR: &str = "parquet";
pub const DEFAULT_DTYPE_RASTER: &str = "tiff";
