use serde::Serialize;
use std::fmt;
use udf_core::sha256_hex;

use crate::fingerprint::Fingerprint;

/// Hex digest of a value's canonical JSON form.
///
/// Values that fail to serialize contribute an empty string instead of aborting the lookup.
/// Two such values then collide on that position; the warning below is the only signal.
pub fn hashify<T: Serialize + ?Sized>(value: &T) -> String {
    // Going through `Value` sorts map keys, so hash maps hash the same regardless of
    // iteration order.
    match serde_json::to_value(value).and_then(|v| serde_json::to_vec(&v)) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(err) => {
            tracing::warn!(event = "udf.cache.hash_failed", error = %err, "Error hashing cache argument");
            String::new()
        }
    }
}

/// Arguments of one cached call, already reduced to their digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheArgs {
    positional: Vec<String>,
    keyword: Vec<(String, String)>,
    cache_id: Option<String>,
}

impl CacheArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.positional.push(hashify(value));
        self
    }

    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.keyword.push((name.into(), hashify(value)));
        self
    }

    /// A callable passed as an argument is identified by its code, not its serialized form.
    pub fn callable(mut self, code: &Fingerprint) -> Self {
        self.positional.push(code.digest());
        self
    }

    /// Explicit cache-busting token.
    pub fn cache_id(mut self, id: impl Into<String>) -> Self {
        self.cache_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(code: &Fingerprint, args: &CacheArgs) -> Self {
        let mut id = code.digest();
        for arg in &args.positional {
            id.push('_');
            id.push_str(arg);
        }
        for (name, digest) in &args.keyword {
            id.push_str(name);
            id.push_str(digest);
        }
        id.push_str(&hashify(&args.cache_id));
        Self(sha256_hex(id.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("data_{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use std::collections::HashMap;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("cannot serialize"))
        }
    }

    fn code() -> Fingerprint {
        Fingerprint::from_source("fn f(x: i64) -> i64 { x + 1 }")
    }

    #[test]
    fn key_is_deterministic_and_argument_sensitive() {
        let a = CacheKey::derive(&code(), &CacheArgs::new().arg(&1).kwarg("k", "v"));
        let b = CacheKey::derive(&code(), &CacheArgs::new().arg(&1).kwarg("k", "v"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other_arg = CacheKey::derive(&code(), &CacheArgs::new().arg(&2).kwarg("k", "v"));
        let other_kw = CacheKey::derive(&code(), &CacheArgs::new().arg(&1).kwarg("k", "w"));
        let other_name = CacheKey::derive(&code(), &CacheArgs::new().arg(&1).kwarg("j", "v"));
        let busted = CacheKey::derive(
            &code(),
            &CacheArgs::new().arg(&1).kwarg("k", "v").cache_id("again"),
        );
        for other in [other_arg, other_kw, other_name, busted] {
            assert_ne!(a, other);
        }
    }

    #[test]
    fn positional_order_matters() {
        let ab = CacheKey::derive(&code(), &CacheArgs::new().arg("a").arg("b"));
        let ba = CacheKey::derive(&code(), &CacheArgs::new().arg("b").arg("a"));
        assert_ne!(ab, ba);
    }

    #[test]
    fn hash_maps_hash_independently_of_insertion_order() {
        let mut one = HashMap::new();
        let mut two = HashMap::new();
        for i in 0..32 {
            one.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            two.insert(format!("k{i}"), i);
        }
        assert_eq!(hashify(&one), hashify(&two));
    }

    #[test]
    fn unserializable_values_degrade_to_empty_hash() {
        assert_eq!(hashify(&Unserializable), "");
        let key = CacheKey::derive(&code(), &CacheArgs::new().arg(&Unserializable));
        assert_eq!(key.as_str().len(), 64);
    }
}
