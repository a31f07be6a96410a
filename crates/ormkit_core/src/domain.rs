//! Process-wide structures shared by every session.

use crate::config::{DomainConfig, SessionConfig};
use crate::error::CoreResult;
use crate::keygen::{KeyGenerator, SequentialKeyGenerator};
use crate::model::DomainModel;
use crate::session::Session;
use crate::storage::StorageDriver;
use lru::LruCache;
use ormkit_types::{EntityTypeId, Key, TypeReference};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Opaque key of a compiled query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryCacheKey(String);

impl QueryCacheKey {
    /// Creates a cache key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

/// A cached compiled query.
pub type CachedQuery = Arc<dyn Any + Send + Sync>;

/// The root object owning the model, key generators and shared caches.
///
/// A domain is shared across threads; sessions opened from it are not.
pub struct Domain {
    model: Arc<DomainModel>,
    config: DomainConfig,
    generators: RwLock<HashMap<EntityTypeId, Arc<dyn KeyGenerator>>>,
    default_generator: Arc<dyn KeyGenerator>,
    key_cache: Mutex<LruCache<Key, Key>>,
    query_cache: Mutex<LruCache<QueryCacheKey, CachedQuery>>,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("config", &self.config)
            .field("generators", &self.generators.read().len())
            .field("key_cache", &self.key_cache.lock().len())
            .field("query_cache", &self.query_cache.lock().len())
            .finish()
    }
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl Domain {
    /// Builds a domain with the default sequential key generator.
    #[must_use]
    pub fn new(model: DomainModel, config: DomainConfig) -> Arc<Self> {
        Self::with_generator(model, config, Arc::new(SequentialKeyGenerator::new()))
    }

    /// Builds a domain with a custom fallback key generator.
    #[must_use]
    pub fn with_generator(
        model: DomainModel,
        config: DomainConfig,
        default_generator: Arc<dyn KeyGenerator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model: Arc::new(model),
            key_cache: Mutex::new(LruCache::new(capacity(config.key_cache_size))),
            query_cache: Mutex::new(LruCache::new(capacity(config.query_cache_size))),
            config,
            generators: RwLock::new(HashMap::new()),
            default_generator,
        })
    }

    /// Returns the model.
    #[must_use]
    pub fn model(&self) -> &DomainModel {
        &self.model
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Opens a session over `driver`.
    pub fn open_session<D: StorageDriver>(self: &Arc<Self>, driver: D, config: SessionConfig) -> Session<D> {
        Session::new(Arc::clone(self), driver, config)
    }

    /// Registers a generator for a hierarchy. Keeps an existing registration.
    pub fn register_key_generator(&self, hierarchy_root: EntityTypeId, generator: Arc<dyn KeyGenerator>) -> bool {
        let mut generators = self.generators.write();
        if generators.contains_key(&hierarchy_root) {
            return false;
        }
        generators.insert(hierarchy_root, generator);
        true
    }

    /// Returns the generator responsible for a type.
    pub fn key_generator(&self, type_id: EntityTypeId) -> CoreResult<Arc<dyn KeyGenerator>> {
        let root = self.model.type_info(type_id)?.hierarchy_root();
        Ok(self
            .generators
            .read()
            .get(&root)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_generator)))
    }

    /// Generates a key for an entity of `type_id`.
    pub fn generate_key(&self, type_id: EntityTypeId, temporary: bool) -> CoreResult<Key> {
        let info = self.model.type_info(type_id)?;
        let type_ref = TypeReference::exact(type_id, info.hierarchy_root());
        let key = self.key_generator(type_id)?.generate(type_ref, temporary)?;
        Ok(key)
    }

    /// Remembers the exact type of a key.
    pub fn remember_key(&self, key: &Key) {
        if key.is_exact() && !key.is_temporary() {
            let mut cache = self.key_cache.lock();
            if cache.get(key).is_none() {
                cache.put(key.clone(), key.clone());
            }
        }
    }

    /// Resolves a key to its exact-typed form, if known.
    pub fn resolve_key(&self, key: &Key) -> Option<Key> {
        if key.is_exact() {
            return Some(key.clone());
        }
        self.key_cache.lock().get(key).cloned()
    }

    /// Returns a cached query or builds and caches it.
    pub fn cached_query(&self, key: QueryCacheKey, build: impl FnOnce() -> CachedQuery) -> CachedQuery {
        let mut cache = self.query_cache.lock();
        if let Some(query) = cache.get(&key) {
            return Arc::clone(query);
        }
        let query = build();
        cache.put(key, Arc::clone(&query));
        query
    }

    /// Number of cached queries.
    #[must_use]
    pub fn cached_query_count(&self) -> usize {
        self.query_cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::GuidKeyGenerator;
    use crate::model::TypeInfo;
    use ormkit_types::Value;

    const ROOT: EntityTypeId = EntityTypeId::new(1);
    const LEAF: EntityTypeId = EntityTypeId::new(2);

    fn domain(config: DomainConfig) -> Arc<Domain> {
        let model = DomainModel::new(vec![
            TypeInfo::entity(ROOT, "Root").field("name"),
            TypeInfo::entity(LEAF, "Leaf").derived_from(ROOT),
        ])
        .unwrap();
        Domain::new(model, config)
    }

    #[test]
    fn generators_are_looked_up_by_hierarchy() {
        let d = domain(DomainConfig::default());
        assert!(d.register_key_generator(ROOT, Arc::new(GuidKeyGenerator)));
        assert!(!d.register_key_generator(ROOT, Arc::new(SequentialKeyGenerator::new())));
        let key = d.generate_key(LEAF, false).unwrap();
        assert!(matches!(key.values()[0], Value::Uuid(_)));
        assert_eq!(key.type_id(), LEAF);
    }

    #[test]
    fn key_cache_resolves_hierarchy_keys() {
        let d = domain(DomainConfig::default());
        let exact = d.generate_key(LEAF, false).unwrap();
        let loose = Key::new(TypeReference::hierarchy(ROOT), exact.values().to_vec()).unwrap();
        assert_eq!(d.resolve_key(&loose), None);
        d.remember_key(&exact);
        assert_eq!(d.resolve_key(&loose).map(|k| k.type_id()), Some(LEAF));
    }

    #[test]
    fn query_cache_is_bounded() {
        let d = domain(DomainConfig::default().query_cache_size(2));
        for i in 0..3 {
            d.cached_query(QueryCacheKey::new(format!("q{i}")), || Arc::new(i));
        }
        assert_eq!(d.cached_query_count(), 2);

        let mut built = false;
        let q = d.cached_query(QueryCacheKey::new("q2"), || {
            built = true;
            Arc::new(0)
        });
        assert!(!built);
        assert_eq!(q.downcast_ref::<i32>(), Some(&2));
    }
}
