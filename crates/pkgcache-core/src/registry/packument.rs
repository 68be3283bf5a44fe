//! Registry document types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// `dist` block of a version manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A `package.json`-shaped manifest plus the cache bookkeeping fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    /// `engines`; usually an object, occasionally a legacy array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engines: Option<Value>,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_from", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "_resolved", default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(rename = "_shasum", default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Parse a manifest from JSON text.
    ///
    /// # Errors
    /// Returns the serde error for malformed JSON.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// `name@version`
    #[must_use]
    pub fn spec_id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Set `_id` to `name@version` when missing.
    pub fn ensure_id(&mut self) {
        if self.id.is_none() {
            self.id = Some(self.spec_id());
        }
    }

    #[must_use]
    pub fn tarball_url(&self) -> Option<&str> {
        self.dist.as_ref()?.tarball.as_deref()
    }

    #[must_use]
    pub fn dist_shasum(&self) -> Option<&str> {
        self.dist.as_ref()?.shasum.as_deref()
    }

    /// `engines.<engine>` as a range string, if declared.
    #[must_use]
    pub fn engine(&self, engine: &str) -> Option<&str> {
        self.engines.as_ref()?.get(engine)?.as_str()
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A full package document (`GET {registry}/{name}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packument {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, Manifest>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Packument {
    /// Parse from a registry JSON value.
    ///
    /// # Errors
    /// Returns the serde error for documents that are not package documents.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    #[must_use]
    pub fn tag(&self, tag: &str) -> Option<&str> {
        self.dist_tags.get(tag).map(String::as_str)
    }

    #[must_use]
    pub fn version(&self, version: &str) -> Option<&Manifest> {
        self.versions.get(version)
    }
}
