//! Content-addressable memoization for expensive local computations.
//!
//! Entries are keyed only by code identity ([`Fingerprint`]) and argument values
//! ([`CacheArgs`]), never by time, and stored one file per key under
//! `<root>/<namespace>/data_<key>`.

pub mod fingerprint;
pub mod key;
pub mod store;

pub use fingerprint::{Constant, Fingerprint};
pub use key::{hashify, CacheArgs, CacheKey};
pub use store::{default_cache_root, CacheConfig, CacheOptions, Cached, ContentCache};
