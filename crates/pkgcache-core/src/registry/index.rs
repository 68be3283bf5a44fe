//! Local copy of the registry's `/-/all` listing.
//!
//! The first update downloads the full dump; later updates ask for entries
//! changed since the stored `_updated` watermark and merge them in, the newer
//! entry winning per package name.

use super::caching::{read_sidecar, CachingClient};
use crate::error::{CacheError, Result};
use chrono::Utc;
use reqwest::Method;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Index younger than this is returned before the delta fetch completes.
pub const IMMEDIATE_WINDOW: Duration = Duration::from_secs(60);

const UPDATED_FIELD: &str = "_updated";

/// Bring the local search index up to date and return it.
///
/// An index younger than `staleness` is returned without contacting the
/// registry. One younger than [`IMMEDIATE_WINDOW`] is returned at once while
/// the update continues in the background.
///
/// # Errors
/// Registry errors when the index has to be fetched synchronously.
pub async fn update_index(client: &CachingClient, staleness: Duration) -> Result<Value> {
    let all_uri = format!("{}-/all", client.config().registry);
    let sidecar = client.sidecar_path(&all_uri)?;

    let (index, age) = match read_sidecar(&sidecar) {
        Some((Value::Object(map), age)) => (map, Some(age)),
        _ => (Map::new(), None),
    };

    if let Some(age) = age {
        if age < staleness {
            debug!(age_ms = age.as_millis() as u64, "index is fresh");
            return Ok(Value::Object(index));
        }
        if age < IMMEDIATE_WINDOW && !index.is_empty() {
            debug!("returning recent index, updating in background");
            let background = client.clone();
            let snapshot = index.clone();
            tokio::spawn(async move {
                if let Err(e) = merge_updates(&background, snapshot).await {
                    debug!(error = %e, "background index update failed");
                }
            });
            return Ok(Value::Object(index));
        }
    }

    merge_updates(client, index).await.map(Value::Object)
}

async fn merge_updates(client: &CachingClient, mut index: Map<String, Value>) -> Result<Map<String, Value>> {
    let registry = &client.config().registry;
    let all_uri = format!("{registry}-/all");
    let watermark = index.get(UPDATED_FIELD).and_then(Value::as_i64).unwrap_or(0);

    let uri = if watermark > 0 {
        format!("{registry}-/all/since?stale=update_after&startkey={watermark}")
    } else {
        all_uri.clone()
    };

    let response = client.request(Method::GET, &uri, None).await?;
    let Some(Value::Object(mut delta)) = response.data else {
        return Err(CacheError::Json {
            what: uri,
            message: "index response is not an object".into(),
        });
    };

    let updated = delta
        .remove(UPDATED_FIELD)
        .and_then(|v| v.as_i64())
        .or_else(|| response.date.map(|d| d.timestamp_millis()))
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let changed = delta.len();
    for (name, entry) in delta {
        index.insert(name, entry);
    }
    index.insert(UPDATED_FIELD.to_string(), Value::from(updated));
    info!(changed, total = index.len() - 1, "search index updated");

    client
        .save(&client.sidecar_path(&all_uri)?, &Value::Object(index.clone()))
        .await;
    Ok(index)
}
