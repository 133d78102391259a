//! Bundled default component state
//!
//! Components may ship a default state resource that is applied when no
//! storage holds state for them. Resources are parsed once per
//! (resource scope, path) pair and memoized, including the case where the
//! resource does not exist.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Source of bundled resources owned by one plugin or module.
pub trait ResourceProvider: Send + Sync {
    /// Stable identity of the scope (plugin or module id)
    fn scope_id(&self) -> &str;

    /// Raw resource bytes, `Ok(None)` if the resource does not exist
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Resources read from a directory on disk
#[derive(Debug, Clone)]
pub struct DirResources {
    id: String,
    root: PathBuf,
}

impl DirResources {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}

impl ResourceProvider for DirResources {
    fn scope_id(&self) -> &str {
        &self.id
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        let full = self.root.join(path.trim_start_matches('/'));
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Resources compiled into the host binary
#[derive(Debug, Clone, Default)]
pub struct BundledResources {
    id: String,
    files: HashMap<String, Vec<u8>>,
}

impl BundledResources {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            files: HashMap::new(),
        }
    }

    pub fn with(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(normalize(path), content.into());
        self
    }
}

impl ResourceProvider for BundledResources {
    fn scope_id(&self) -> &str {
        &self.id
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.get(&normalize(path)).cloned())
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Memoized load result; `Missing` is cached so absent resources are read once
#[derive(Debug, Clone)]
enum CachedDefault {
    Missing,
    Present(Arc<Value>),
}

/// Process-wide cache of parsed default state trees
#[derive(Debug, Default)]
pub struct DefaultStateCache {
    entries: Mutex<HashMap<(String, String), CachedDefault>>,
}

impl DefaultStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed default tree for `path` in `scope`, or `None` if there is none.
    ///
    /// The returned tree is a detached copy the caller may mutate freely.
    /// A malformed resource is an error and is not cached.
    pub fn find(&self, scope: &dyn ResourceProvider, path: &str) -> Result<Option<Value>> {
        let key = (scope.scope_id().to_string(), normalize(path));
        let mut entries = self.entries.lock();
        if let Some(cached) = entries.get(&key) {
            return Ok(match cached {
                CachedDefault::Missing => None,
                CachedDefault::Present(tree) => Some(Value::clone(tree)),
            });
        }

        let loaded = match scope.read(&key.1).map_err(|e| StoreError::io(&key.1, e))? {
            None => {
                debug!(scope = %key.0, path = %key.1, "No default state resource");
                CachedDefault::Missing
            }
            Some(bytes) => {
                let tree: Value = serde_json::from_slice(&bytes).map_err(|source| {
                    StoreError::MalformedDefaultState {
                        path: key.1.clone(),
                        source,
                    }
                })?;
                info!(scope = %key.0, path = %key.1, "Loaded default state resource");
                CachedDefault::Present(Arc::new(tree))
            }
        };
        let result = match &loaded {
            CachedDefault::Missing => None,
            CachedDefault::Present(tree) => Some(Value::clone(tree)),
        };
        entries.insert(key, loaded);
        Ok(result)
    }

    /// Drop entries of one resource scope (plugin unload).
    pub fn dispose_scope(&self, scope_id: &str) {
        self.entries.lock().retain(|(scope, _), _| scope != scope_id);
    }

    /// Drop every cached entry.
    pub fn dispose(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how often the cache actually reads a resource
    struct CountingResources {
        inner: BundledResources,
        reads: AtomicUsize,
    }

    impl ResourceProvider for CountingResources {
        fn scope_id(&self) -> &str {
            self.inner.scope_id()
        }

        fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(path)
        }
    }

    fn counting(id: &str) -> CountingResources {
        CountingResources {
            inner: BundledResources::new(id).with("/defaults/Foo.json", r#"{"enabled": true}"#),
            reads: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_find_loads_once_per_scope_and_path() {
        let cache = DefaultStateCache::new();
        let resources = counting("plugin-a");

        for _ in 0..5 {
            let tree = cache.find(&resources, "/defaults/Foo.json").unwrap();
            assert_eq!(tree, Some(json!({"enabled": true})));
        }
        assert_eq!(resources.reads.load(Ordering::SeqCst), 1);

        // Another scope with the same path is a distinct entry
        let other = counting("plugin-b");
        cache.find(&other, "/defaults/Foo.json").unwrap();
        assert_eq!(other.reads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_missing_resource_is_memoized() {
        let cache = DefaultStateCache::new();
        let resources = counting("plugin-a");

        assert!(cache.find(&resources, "/defaults/None.json").unwrap().is_none());
        assert!(cache.find(&resources, "defaults/None.json").unwrap().is_none());
        assert_eq!(resources.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_returned_tree_is_detached() {
        let cache = DefaultStateCache::new();
        let resources = counting("plugin-a");

        let mut tree = cache.find(&resources, "/defaults/Foo.json").unwrap().unwrap();
        tree["enabled"] = json!(false);

        let again = cache.find(&resources, "/defaults/Foo.json").unwrap().unwrap();
        assert_eq!(again["enabled"], json!(true));
    }

    #[test]
    fn test_malformed_resource_is_an_error() {
        let cache = DefaultStateCache::new();
        let resources = BundledResources::new("broken").with("/bad.json", "{not json");

        let err = cache.find(&resources, "/bad.json").unwrap_err();
        assert!(matches!(err, StoreError::MalformedDefaultState { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dispose_scope_and_dispose() {
        let cache = DefaultStateCache::new();
        let a = counting("plugin-a");
        let b = counting("plugin-b");
        cache.find(&a, "/defaults/Foo.json").unwrap();
        cache.find(&b, "/defaults/Foo.json").unwrap();

        cache.dispose_scope("plugin-a");
        assert_eq!(cache.len(), 1);
        cache.find(&a, "/defaults/Foo.json").unwrap();
        assert_eq!(a.reads.load(Ordering::SeqCst), 2);

        cache.dispose();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dir_resources_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("defaults")).unwrap();
        std::fs::write(dir.path().join("defaults/Foo.json"), r#"{"level": 3}"#).unwrap();

        let resources = DirResources::new("dir", dir.path());
        let cache = DefaultStateCache::new();
        assert_eq!(
            cache.find(&resources, "/defaults/Foo.json").unwrap(),
            Some(json!({"level": 3}))
        );
        assert!(cache.find(&resources, "/defaults/Bar.json").unwrap().is_none());
    }
}
