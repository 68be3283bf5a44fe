//! Registry access: raw HTTP, the caching layer, document types and the
//! search index.

pub mod caching;
pub mod client;
pub mod index;
pub mod packument;

pub use caching::{CachedResponse, CachingClient, GetOptions, ResponseSource};
pub use client::{RegistryClient, RegistryResponse, RequestOptions};
pub use index::update_index;
pub use packument::{Dist, Manifest, Packument};
