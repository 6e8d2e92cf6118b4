//! Type objects and the versioned attribute lookup cache.
//!
//! Every type carries a version tag drawn from a global counter. Lookups
//! through [`TypeObject::lookup`] are memoized in a process-wide cache keyed by
//! `(type id, attribute name)` and stamped with the version seen at fill time;
//! an entry whose stamp no longer matches the type's current version is a miss.
//! [`TypeObject::modified`] assigns a fresh version to the type and, recursively,
//! to every live subclass, which invalidates everything cached for them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::RuntimeError;
use crate::object::{Header, Value};

/// Shared handle to a [`TypeObject`].
pub type TypeRef = Arc<TypeObject>;

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// A named type with an attribute table.
pub struct TypeObject {
    header: Header,
    id: u64,
    name: String,
    bases: Vec<TypeRef>,
    immutable: bool,
    dict: RwLock<BTreeMap<String, Value>>,
    version: AtomicU64,
    subclasses: Mutex<Vec<Weak<TypeObject>>>,
}

/// Builder for [`TypeObject`].
#[derive(Default)]
pub struct TypeBuilder {
    name: String,
    bases: Vec<TypeRef>,
    attrs: Vec<(String, Value)>,
    immutable: bool,
}

impl TypeBuilder {
    #[must_use]
    pub fn base(mut self, base: &TypeRef) -> Self {
        self.bases.push(Arc::clone(base));
        self
    }

    #[must_use]
    pub fn attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attrs.push((name.to_string(), value.into()));
        self
    }

    /// Refuse ordinary attribute assignment once built.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    #[must_use]
    pub fn build(self) -> TypeRef {
        let mut dict = BTreeMap::new();
        for (name, value) in self.attrs {
            value.retain();
            if let Some(previous) = dict.insert(name, value) {
                previous.release();
            }
        }
        let typ = Arc::new(TypeObject {
            header: Header::new(),
            id: NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            bases: self.bases,
            immutable: self.immutable,
            dict: RwLock::new(dict),
            version: AtomicU64::new(next_version()),
            subclasses: Mutex::new(Vec::new()),
        });
        for base in &typ.bases {
            base.subclasses.lock().push(Arc::downgrade(&typ));
        }
        typ
    }
}

impl TypeObject {
    /// Start building a type called `name`.
    #[must_use]
    pub fn builder(name: &str) -> TypeBuilder {
        TypeBuilder {
            name: name.to_string(),
            ..TypeBuilder::default()
        }
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn bases(&self) -> &[TypeRef] {
        &self.bases
    }

    #[must_use]
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Current version tag.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Method resolution order: depth-first, left to right, first occurrence wins.
    #[must_use]
    pub fn mro(self: &Arc<Self>) -> Vec<TypeRef> {
        let mut order: Vec<TypeRef> = Vec::new();
        let mut pending = vec![Arc::clone(self)];
        while let Some(typ) = pending.pop() {
            if order.iter().any(|seen| seen.id == typ.id) {
                continue;
            }
            pending.extend(typ.bases.iter().rev().cloned());
            order.push(typ);
        }
        order
    }

    /// Entry in this type's own table, without consulting bases or the cache.
    #[must_use]
    pub fn own_attr(&self, name: &str) -> Option<Value> {
        self.dict.read().get(name).cloned()
    }

    /// Names in this type's own table.
    #[must_use]
    pub fn attr_names(&self) -> Vec<String> {
        self.dict.read().keys().cloned().collect()
    }

    /// Cached attribute lookup along the MRO.
    #[must_use]
    pub fn lookup(self: &Arc<Self>, name: &str) -> Option<Value> {
        let cache = attribute_cache();
        let version = self.version();
        if let Some(value) = cache.get(self.id, name, version) {
            return value;
        }
        let found = self.mro().iter().find_map(|typ| typ.own_attr(name));
        cache.fill(self.id, name, version, found.clone());
        found
    }

    /// Ordinary attribute assignment. Immutable types refuse.
    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        if self.immutable {
            return Err(RuntimeError::ImmutableType {
                type_name: self.name.clone(),
                attr: name.to_string(),
            });
        }
        self.store_attr(name, value);
        self.modified();
        Ok(())
    }

    /// Write into the attribute table with ownership bookkeeping but no checks
    /// and no cache invalidation. Callers are expected to call
    /// [`TypeObject::modified`] afterwards.
    pub fn store_attr(&self, name: &str, value: Value) {
        value.retain();
        let previous = self.dict.write().insert(name.to_string(), value);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    /// Invalidate cached lookups for this type and every live subclass.
    pub fn modified(&self) {
        self.version.store(next_version(), Ordering::Release);
        let subclasses: Vec<TypeRef> = {
            let mut subs = self.subclasses.lock();
            subs.retain(|weak| weak.strong_count() > 0);
            subs.iter().filter_map(Weak::upgrade).collect()
        };
        for sub in subclasses {
            sub.modified();
        }
    }

    /// Whether `self` is `other` or derives from it.
    #[must_use]
    pub fn is_subtype_of(self: &Arc<Self>, other: &TypeObject) -> bool {
        self.mro().iter().any(|typ| typ.id == other.id)
    }
}

impl Drop for TypeObject {
    fn drop(&mut self) {
        if let Some(cache) = ATTRIBUTE_CACHE.get() {
            cache.purge(self.id);
        }
    }
}

impl fmt::Debug for TypeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeObject")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("immutable", &self.immutable)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Attribute cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    version: u64,
    value: Option<Value>,
}

/// Hit/miss counters for the attribute cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct AttributeCache {
    entries: RwLock<HashMap<(u64, String), CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AttributeCache {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, type_id: u64, name: &str, version: u64) -> Option<Option<Value>> {
        let entries = self.entries.read();
        match entries.get(&(type_id, name.to_string())) {
            Some(entry) if entry.version == version => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    // Values leaving the cache are dropped only after the lock is released:
    // the last reference to a type re-enters through its Drop.
    fn fill(&self, type_id: u64, name: &str, version: u64, value: Option<Value>) {
        let replaced = self
            .entries
            .write()
            .insert((type_id, name.to_string()), CacheEntry { version, value });
        drop(replaced);
    }

    /// Evict every entry cached for `type_id`.
    fn purge(&self, type_id: u64) {
        let evicted: Vec<CacheEntry> = {
            let mut entries = self.entries.write();
            let keys: Vec<(u64, String)> = entries
                .keys()
                .filter(|(id, _)| *id == type_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        drop(evicted);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

static ATTRIBUTE_CACHE: OnceLock<AttributeCache> = OnceLock::new();

fn attribute_cache() -> &'static AttributeCache {
    ATTRIBUTE_CACHE.get_or_init(AttributeCache::new)
}

/// Process-wide attribute cache counters.
#[must_use]
pub fn cache_stats() -> CacheStats {
    attribute_cache().stats()
}
