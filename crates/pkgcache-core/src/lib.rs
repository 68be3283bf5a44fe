#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! npm-compatible package cache and fetch engine.
//!
//! [`CacheService`] is the entry point: it resolves specifiers against the
//! registry (through an on-disk metadata cache), downloads and verifies
//! tarballs, mirrors git dependencies and places everything under one cache
//! root that several processes may share.

pub mod cache_dir;
pub mod config;
pub mod error;
pub mod git;
pub mod inflight;
pub mod locker;
pub mod paths;
pub mod range;
pub mod registry;
pub mod resolve;
pub mod service;
pub mod spec;
pub mod store;
pub mod version;

pub use config::{CacheConfig, ConfigLayer, ConfigLayers};
pub use error::{CacheError, Result};
pub use git::GitUrl;
pub use inflight::Inflight;
pub use registry::{update_index, CachingClient, Manifest, Packument};
pub use service::{CacheService, CachedPackage};
pub use spec::{PackageSpecifier, SpecKind};
pub use version::VERSION;
