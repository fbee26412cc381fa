use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

use crate::collaborator::ConstantsSource;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex"));

/// Replace every `{{key}}` occurrence in `text` with the stringified value
/// from `vars`. Occurrences whose key is absent are left verbatim; that is
/// the contract, not a fallback.
pub fn resolve(text: &str, vars: &HashMap<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value_to_string(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// All distinct `{{...}}` keys referenced by `text`, in sorted order.
/// Used by the builder UI to highlight variable usage.
pub fn extract_names(text: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Tenant-scoped system constants behind a TTL-bounded read-through cache.
///
/// Constants are fetched once per tenant and served from the cache until the
/// TTL expires or an admin write calls [`VariableStore::invalidate`].
/// Conversation variables always win over constants on a key clash.
pub struct VariableStore {
    source: Arc<dyn ConstantsSource>,
    cache: Cache<String, Arc<HashMap<String, String>>>,
}

impl VariableStore {
    pub fn new(source: Arc<dyn ConstantsSource>, ttl: Duration) -> Self {
        let cache = Cache::builder().time_to_live(ttl).build();
        Self { source, cache }
    }

    /// The constants for `tenant_id`, fetched through the cache. A source
    /// failure serves an empty map without caching it, so the next call
    /// retries; a broken constants store must not halt conversations.
    pub async fn constants(&self, tenant_id: &str) -> Arc<HashMap<String, String>> {
        if let Some(hit) = self.cache.get(tenant_id).await {
            return hit;
        }
        match self.source.fetch(tenant_id).await {
            Ok(map) => {
                let map = Arc::new(map);
                self.cache.insert(tenant_id.to_string(), map.clone()).await;
                map
            }
            Err(e) => {
                warn!(tenant = %tenant_id, "constants fetch failed: {e}");
                Arc::new(HashMap::new())
            }
        }
    }

    /// Drop the cached constants for a tenant after an admin write.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.invalidate(tenant_id).await;
    }

    /// Resolve `text` against the conversation `vars` layered over the
    /// tenant's system constants.
    pub async fn render(
        &self,
        tenant_id: &str,
        text: &str,
        vars: &HashMap<String, Value>,
    ) -> String {
        let constants = self.constants(tenant_id).await;
        let mut merged: HashMap<String, Value> = constants
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        for (k, v) in vars {
            merged.insert(k.clone(), v.clone());
        }
        resolve(text, &merged)
    }
}
