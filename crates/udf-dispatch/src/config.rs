use std::time::Duration;
use udf_core::Engine;

use crate::constants::DEFAULT_BASE_URL;

/// Router configuration.
///
/// Built once by the caller and passed to [`crate::DispatchRouter::new`]; nothing here is read
/// from process-wide state.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Base URL of the compute service API.
    pub base_url: String,

    /// Realtime instance to target. `None` picks the highest-ranked available instance;
    /// `_local` targets a server on this machine.
    pub realtime_client_id: Option<String>,

    /// Engine for in-memory definitions when the caller names none.
    pub default_udf_run_engine: Option<Engine>,

    pub default_validate_imports: bool,

    /// Sent in the recursion header of every remote call.
    pub recursion_depth: u32,

    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            realtime_client_id: None,
            default_udf_run_engine: None,
            default_validate_imports: false,
            recursion_depth: 1,
            request_timeout: Duration::from_secs(120),
        }
    }
}
