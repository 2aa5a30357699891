use serde_json::Value;
use std::collections::BTreeSet;
use udf_core::{Error, Result, UdfDefinition};

/// Top-level module name of this SDK; always importable.
pub const SDK_MODULE: &str = "udf";

/// Modules known to be available on the remote runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportAllowlist {
    modules: BTreeSet<String>,
}

impl ImportAllowlist {
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }

    /// The keys of a dependency whitelist document (`{"numpy": "1.26", ...}`).
    pub fn from_whitelist(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::validation("dependency whitelist must be a JSON object"))?;
        Ok(Self::new(obj.keys().cloned()))
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains(module)
    }

    /// Reject imports that are neither allow-listed, a header module, nor the SDK itself.
    pub fn check(&self, udf: &UdfDefinition) -> Result<()> {
        let missing: Vec<&str> = udf
            .imports
            .iter()
            .map(|import| import.split('.').next().unwrap_or(import.as_str()))
            .filter(|top| {
                *top != SDK_MODULE
                    && !self.contains(top)
                    && !udf.headers.iter().any(|h| h.module_name == *top)
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::validation(format!(
            "The following imports in the UDF might not be available: {missing:?}. Please check the UDF headers and imports and try again."
        )))
    }
}
