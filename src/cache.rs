//! Namespaced TTL cache with deterministic key derivation.
//!
//! Keys are `namespace:<sha256-hex>` over a canonical JSON rendering of the
//! key payload: strings trimmed, object keys sorted, arrays preserved in
//! order, compact separators, raw UTF-8.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::contracts::Metadata;
use crate::error::{Error, Result};

pub const ITEM_MAPPING_CACHE: &str = "item_mapping_cache";
pub const NOTE_MODS_CACHE: &str = "note_mods_cache";
pub const GROUP_PATTERN_CACHE: &str = "group_pattern_cache";

pub const CACHE_NAMESPACES: [&str; 3] =
    [ITEM_MAPPING_CACHE, NOTE_MODS_CACHE, GROUP_PATTERN_CACHE];

fn required_key_fields(namespace: &str) -> Option<&'static [&'static str]> {
    match namespace {
        ITEM_MAPPING_CACHE => Some(&["name_raw", "menu_catalog_version"]),
        NOTE_MODS_CACHE => Some(&["note_raw", "allowed_mods_version"]),
        GROUP_PATTERN_CACHE => {
            Some(&["group_pattern", "menu_catalog_version", "allowed_mods_version"])
        }
        _ => None,
    }
}

fn default_ttl(namespace: &str) -> i64 {
    match namespace {
        GROUP_PATTERN_CACHE => 1800,
        _ => 3600,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub confidence: f64,
    #[serde(default)]
    pub meta: Metadata,
    pub created_at: f64,
    #[serde(default)]
    pub expires_at: Option<f64>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: f64) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

/// Storage seam. Implementations must make `get`/`set`/`delete` atomic per
/// `(namespace, key)` pair.
pub trait CacheBackend: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Option<CacheEntry>;
    fn set(&self, namespace: &str, key: &str, entry: CacheEntry);
    fn delete(&self, namespace: &str, key: &str);
}

/// In-process backend. Operations take one mutex-guarded map write, so
/// concurrent writers resolve last-write-wins.
#[derive(Default)]
pub struct MemoryCacheBackend {
    store: Mutex<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
        self.store.lock().unwrap().get(namespace).and_then(|bucket| bucket.get(key)).cloned()
    }

    fn set(&self, namespace: &str, key: &str, entry: CacheEntry) {
        self.store
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), entry);
    }

    fn delete(&self, namespace: &str, key: &str) {
        if let Some(bucket) = self.store.lock().unwrap().get_mut(namespace) {
            bucket.remove(key);
        }
    }
}

/// Canonical JSON bytes: object keys sorted lexicographically, arrays in
/// order, compact separators, no trailing newline.
fn write_canonical_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            let quoted = serde_json::to_string(s).expect("string serialization cannot fail");
            out.extend_from_slice(quoted.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let quoted = serde_json::to_string(key).expect("key serialization cannot fail");
                out.extend_from_slice(quoted.as_bytes());
                out.push(b':');
                write_canonical_value(&map[*key], out);
            }
            out.push(b'}');
        }
    }
}

pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_canonical_value(value, &mut out);
    out
}

/// Recursive payload normalization applied before hashing: strings are
/// trimmed at every depth; everything else is kept structurally.
fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter().map(|(key, inner)| (key.clone(), normalize_value(inner))).collect(),
        ),
        other => other.clone(),
    }
}

fn is_missing_required(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn now_epoch() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// The three-namespace TTL cache. TTLs of zero or below mean no expiry.
pub struct PosNormCache {
    backend: Box<dyn CacheBackend>,
    namespace_ttls: HashMap<String, i64>,
}

impl std::fmt::Debug for PosNormCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosNormCache")
            .field("namespace_ttls", &self.namespace_ttls)
            .finish()
    }
}

impl Default for PosNormCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PosNormCache {
    pub fn new() -> Self {
        Self::with_backend(Box::new(MemoryCacheBackend::default()))
    }

    pub fn with_backend(backend: Box<dyn CacheBackend>) -> Self {
        let namespace_ttls = CACHE_NAMESPACES
            .iter()
            .map(|namespace| (namespace.to_string(), default_ttl(namespace)))
            .collect();
        Self { backend, namespace_ttls }
    }

    /// Override per-namespace TTLs. Unknown namespaces are rejected.
    pub fn with_namespace_ttls(mut self, namespace_ttls: &HashMap<String, i64>) -> Result<Self> {
        let mut unknown: Vec<&str> = namespace_ttls
            .keys()
            .map(String::as_str)
            .filter(|namespace| !CACHE_NAMESPACES.contains(namespace))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(Error::Cache(format!(
                "Unsupported TTL namespace(s): {}",
                unknown.join(", ")
            )));
        }
        for (namespace, ttl) in namespace_ttls {
            self.namespace_ttls.insert(namespace.clone(), *ttl);
        }
        Ok(self)
    }

    pub fn get(&self, namespace: &str, key_payload: &Value) -> Result<Option<CacheEntry>> {
        self.get_at(namespace, key_payload, now_epoch())
    }

    /// `get` with an explicit clock; expired entries are deleted and miss.
    pub fn get_at(
        &self,
        namespace: &str,
        key_payload: &Value,
        now: f64,
    ) -> Result<Option<CacheEntry>> {
        let key = self.make_key(namespace, key_payload)?;
        match self.backend.get(namespace, &key) {
            None => Ok(None),
            Some(entry) if entry.is_expired(now) => {
                self.backend.delete(namespace, &key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry)),
        }
    }

    pub fn set(
        &self,
        namespace: &str,
        key_payload: &Value,
        value: Value,
        confidence: f64,
        meta: Metadata,
    ) -> Result<CacheEntry> {
        self.set_at(namespace, key_payload, value, confidence, meta, now_epoch())
    }

    pub fn set_at(
        &self,
        namespace: &str,
        key_payload: &Value,
        value: Value,
        confidence: f64,
        meta: Metadata,
        now: f64,
    ) -> Result<CacheEntry> {
        let key = self.make_key(namespace, key_payload)?;
        let ttl = self.namespace_ttls.get(namespace).copied().unwrap_or(0);
        let expires_at = if ttl > 0 { Some(now + ttl as f64) } else { None };
        let entry = CacheEntry {
            value,
            confidence: confidence.clamp(0.0, 1.0),
            meta,
            created_at: now,
            expires_at,
        };
        self.backend.set(namespace, &key, entry.clone());
        Ok(entry)
    }

    pub fn invalidate(&self, namespace: &str, key_payload: &Value) -> Result<()> {
        let key = self.make_key(namespace, key_payload)?;
        self.backend.delete(namespace, &key);
        Ok(())
    }

    /// Derive the deterministic cache key for a payload, validating the
    /// namespace and its required fields.
    pub fn make_key(&self, namespace: &str, key_payload: &Value) -> Result<String> {
        let Some(required) = required_key_fields(namespace) else {
            return Err(Error::Cache(format!("Unsupported namespace: {namespace}")));
        };
        let Some(payload) = key_payload.as_object() else {
            return Err(Error::Cache("cache key payload must be an object".to_string()));
        };
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|field| is_missing_required(payload.get(*field)))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Cache(format!(
                "Missing key fields for {namespace}: {}",
                missing.join(", ")
            )));
        }

        let canonical = canonical_json_bytes(&normalize_value(key_payload));
        let digest = Sha256::digest(&canonical);
        Ok(format!("{namespace}:{}", hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: f64 = 1_700_000_000.0;

    fn item_key() -> Value {
        json!({"name_raw": "酸辣湯", "menu_catalog_version": "menu-v1"})
    }

    fn ttl_cache(namespace: &str, ttl: i64) -> PosNormCache {
        PosNormCache::new()
            .with_namespace_ttls(&HashMap::from([(namespace.to_string(), ttl)]))
            .unwrap()
    }

    #[test]
    fn test_hit_and_miss_for_item_mapping_namespace() {
        let cache = ttl_cache(ITEM_MAPPING_CACHE, 30);
        let key = json!({"name_raw": "咖哩雞肉鍋貼", "menu_catalog_version": "menu-v1"});

        assert!(cache.get_at(ITEM_MAPPING_CACHE, &key, BASE).unwrap().is_none());

        let mut meta = Metadata::new();
        meta.insert("source".to_string(), json!("candidate_top1"));
        cache
            .set_at(ITEM_MAPPING_CACHE, &key, json!({"item_id": "I003"}), 0.93, meta, BASE)
            .unwrap();

        let entry = cache.get_at(ITEM_MAPPING_CACHE, &key, BASE + 1.0).unwrap().unwrap();
        assert_eq!(entry.value, json!({"item_id": "I003"}));
        assert_eq!(entry.confidence, 0.93);
        assert_eq!(entry.meta["source"], "candidate_top1");
    }

    #[test]
    fn test_ttl_expiration_boundary() {
        let cache = ttl_cache(ITEM_MAPPING_CACHE, 5);
        cache
            .set_at(ITEM_MAPPING_CACHE, &item_key(), json!({"item_id": "I007"}), 0.9, Metadata::new(), BASE)
            .unwrap();

        assert!(cache.get_at(ITEM_MAPPING_CACHE, &item_key(), BASE + 4.99).unwrap().is_some());
        assert!(cache.get_at(ITEM_MAPPING_CACHE, &item_key(), BASE + 5.0).unwrap().is_none());
        // The expired entry was deleted, not just hidden.
        assert!(cache.get_at(ITEM_MAPPING_CACHE, &item_key(), BASE).unwrap().is_none());
    }

    #[test]
    fn test_ttl_expiration_all_namespaces() {
        for (namespace, key, value) in [
            (ITEM_MAPPING_CACHE, item_key(), json!({"item_id": "I001"})),
            (
                NOTE_MODS_CACHE,
                json!({"note_raw": "加辣去醬", "allowed_mods_version": "mods-v1"}),
                json!(["加辣", "去醬"]),
            ),
            (
                GROUP_PATTERN_CACHE,
                json!({
                    "group_pattern": "上面兩項同袋",
                    "menu_catalog_version": "menu-v1",
                    "allowed_mods_version": "mods-v1",
                }),
                json!({"grouping": "pack_together", "line_indices": [0, 1]}),
            ),
        ] {
            let cache = ttl_cache(namespace, 5);
            cache.set_at(namespace, &key, value, 0.8, Metadata::new(), BASE).unwrap();
            assert!(cache.get_at(namespace, &key, BASE + 4.99).unwrap().is_some());
            assert!(cache.get_at(namespace, &key, BASE + 5.0).unwrap().is_none());
        }
    }

    #[test]
    fn test_ttl_zero_means_no_expiry() {
        let cache = ttl_cache(ITEM_MAPPING_CACHE, 0);
        cache
            .set_at(ITEM_MAPPING_CACHE, &item_key(), json!({"item_id": "I007"}), 0.9, Metadata::new(), BASE)
            .unwrap();
        assert!(
            cache.get_at(ITEM_MAPPING_CACHE, &item_key(), BASE + 99_999.0).unwrap().is_some()
        );
    }

    #[test]
    fn test_version_change_misses() {
        let cache = PosNormCache::new();
        cache
            .set(ITEM_MAPPING_CACHE, &item_key(), json!({"item_id": "I007"}), 0.99, Metadata::new())
            .unwrap();

        assert!(cache.get(ITEM_MAPPING_CACHE, &item_key()).unwrap().is_some());
        let changed = json!({"name_raw": "酸辣湯", "menu_catalog_version": "menu-v2"});
        assert!(cache.get(ITEM_MAPPING_CACHE, &changed).unwrap().is_none());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let cache = PosNormCache::new();
        let err = cache
            .set(
                ITEM_MAPPING_CACHE,
                &json!({"name_raw": "酸辣湯", "menu_catalog_version": "   "}),
                json!({"item_id": "I007"}),
                0.9,
                Metadata::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("menu_catalog_version"), "got: {err}");
    }

    #[test]
    fn test_unknown_ttl_namespace_is_rejected() {
        let err = PosNormCache::new()
            .with_namespace_ttls(&HashMap::from([("unknown_namespace".to_string(), 10)]))
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported TTL namespace"), "got: {err}");
    }

    #[test]
    fn test_unknown_namespace_on_get_is_rejected() {
        let cache = PosNormCache::new();
        assert!(cache.get(ITEM_MAPPING_CACHE, &item_key()).unwrap().is_none());
        let err = cache.get("mystery_cache", &item_key()).unwrap_err();
        assert!(err.to_string().contains("Unsupported namespace"), "got: {err}");
    }

    #[test]
    fn test_key_derivation_is_deterministic_and_normalized() {
        let cache = PosNormCache::new();
        let spaced = json!({"menu_catalog_version": " menu-v1 ", "name_raw": "  酸辣湯  "});
        let plain = json!({"name_raw": "酸辣湯", "menu_catalog_version": "menu-v1"});
        assert_eq!(
            cache.make_key(ITEM_MAPPING_CACHE, &spaced).unwrap(),
            cache.make_key(ITEM_MAPPING_CACHE, &plain).unwrap()
        );
        let key = cache.make_key(ITEM_MAPPING_CACHE, &plain).unwrap();
        assert!(key.starts_with("item_mapping_cache:"));
        assert_eq!(key.len(), "item_mapping_cache:".len() + 64);
    }

    #[test]
    fn test_nested_payloads_hash_recursively() {
        let cache = PosNormCache::new();
        let left = json!({
            "group_pattern": "上面兩項同袋",
            "menu_catalog_version": "menu-v1",
            "allowed_mods_version": "mods-v1",
            "extra": {"b": [" x ", 1], "a": "y"},
        });
        let right = json!({
            "group_pattern": "上面兩項同袋",
            "menu_catalog_version": "menu-v1",
            "allowed_mods_version": "mods-v1",
            "extra": {"a": "y", "b": ["x", 1]},
        });
        assert_eq!(
            cache.make_key(GROUP_PATTERN_CACHE, &left).unwrap(),
            cache.make_key(GROUP_PATTERN_CACHE, &right).unwrap()
        );
    }

    #[test]
    fn test_confidence_is_clamped() {
        let cache = PosNormCache::new();
        let entry = cache
            .set(ITEM_MAPPING_CACHE, &item_key(), json!(1), 7.5, Metadata::new())
            .unwrap();
        assert_eq!(entry.confidence, 1.0);
        let entry = cache
            .set(ITEM_MAPPING_CACHE, &item_key(), json!(1), -0.5, Metadata::new())
            .unwrap();
        assert_eq!(entry.confidence, 0.0);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = PosNormCache::new();
        cache
            .set(ITEM_MAPPING_CACHE, &item_key(), json!({"item_id": "I007"}), 0.9, Metadata::new())
            .unwrap();
        cache.invalidate(ITEM_MAPPING_CACHE, &item_key()).unwrap();
        assert!(cache.get(ITEM_MAPPING_CACHE, &item_key()).unwrap().is_none());
    }

    #[test]
    fn test_canonical_json_sorts_objects_and_preserves_arrays() {
        let value = json!({"b": 1, "a": {"y": 1, "x": 2}, "arr": [{"k": 2, "j": 1}, 3, "z"]});
        let bytes = canonical_json_bytes(&value);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"x":2,"y":1},"arr":[{"j":1,"k":2},3,"z"],"b":1}"#
        );
    }
}
