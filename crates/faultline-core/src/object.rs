//! Managed object model.
//!
//! Heap values carry a [`Header`] with a lifetime count that belongs to the
//! runtime, not to Rust: memory is owned by `Arc`, while the count is the
//! runtime's own bookkeeping of how many runtime-level owners (attribute tables,
//! frame slots, explicit retains) hold the value. When a release drops the count
//! to zero the value is deallocated in the runtime sense: its payload is cleared
//! and it is flagged dead, mirroring a refcounted interpreter's dealloc.
//!
//! Instances are additionally tracked in a weak registry keyed by address so an
//! address obtained from [`address_of`] can be turned back into a value with
//! [`dereference_tracked`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;

use crate::call::CallableRef;
use crate::error::RuntimeError;
use crate::frame::FrameRef;
use crate::types::TypeRef;

/// Lifetime bookkeeping shared by every heap value.
#[derive(Debug)]
pub struct Header {
    count: AtomicIsize,
    deallocated: AtomicBool,
}

impl Header {
    /// A fresh header owned by its creator (count 1).
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: AtomicIsize::new(1),
            deallocated: AtomicBool::new(false),
        }
    }

    /// Current lifetime count.
    #[must_use]
    pub fn count(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }

    /// Increment and return the new count.
    pub fn retain(&self) -> isize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement and return the new count.
    pub fn release(&self) -> isize {
        self.count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Overwrite the count. No invariant is checked.
    pub fn set(&self, count: isize) {
        self.count.store(count, Ordering::Release);
    }

    /// Whether the value has gone through deallocation.
    #[must_use]
    pub fn is_deallocated(&self) -> bool {
        self.deallocated.load(Ordering::Acquire)
    }

    fn mark_deallocated(&self) -> bool {
        !self.deallocated.swap(true, Ordering::AcqRel)
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// A user-visible instance of a [`crate::types::TypeObject`].
pub struct Instance {
    header: Header,
    class: TypeRef,
    attrs: RwLock<BTreeMap<String, Value>>,
}

/// Shared handle to an [`Instance`].
pub type InstanceRef = Arc<Instance>;

impl Instance {
    /// Allocate a new instance of `class` and track it.
    #[must_use]
    pub fn new(class: &TypeRef) -> InstanceRef {
        let instance = Arc::new(Self {
            header: Header::new(),
            class: Arc::clone(class),
            attrs: RwLock::new(BTreeMap::new()),
        });
        global_registry().track(&instance);
        instance
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn class(&self) -> &TypeRef {
        &self.class
    }

    /// Attribute lookup: the instance's own table first, then the type's
    /// (cached) lookup.
    pub fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self.attrs.read().get(name) {
            return Ok(value.clone());
        }
        self.class
            .lookup(name)
            .ok_or_else(|| RuntimeError::AttributeNotFound {
                type_name: self.class.name().to_string(),
                attr: name.to_string(),
            })
    }

    /// Bind an attribute on the instance, retaining the new value and releasing
    /// the one it replaces.
    pub fn set_attr(&self, name: &str, value: Value) {
        value.retain();
        let previous = self.attrs.write().insert(name.to_string(), value);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    fn clear(&self) {
        let attrs = std::mem::take(&mut *self.attrs.write());
        for value in attrs.into_values() {
            value.release();
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        global_registry().forget(self as *const Instance as usize);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} object at {:#x}>",
            self.class.name(),
            self as *const Instance as usize
        )
    }
}

/// Any value the runtime can hold.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Instance(InstanceRef),
    Type(TypeRef),
    Callable(CallableRef),
    Frame(FrameRef),
}

impl Value {
    /// Build a string value.
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// Lifetime header, if this is a heap value.
    #[must_use]
    pub fn header(&self) -> Option<&Header> {
        match self {
            Self::Instance(obj) => Some(obj.header()),
            Self::Type(typ) => Some(typ.header()),
            Self::Callable(callable) => Some(callable.header()),
            Self::Frame(frame) => Some(frame.header()),
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) => None,
        }
    }

    /// Name of the value's type.
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".to_string(),
            Self::Bool(_) => "bool".to_string(),
            Self::Int(_) => "int".to_string(),
            Self::Float(_) => "float".to_string(),
            Self::Str(_) => "str".to_string(),
            Self::Instance(obj) => obj.class().name().to_string(),
            Self::Type(_) => "type".to_string(),
            Self::Callable(_) => "function".to_string(),
            Self::Frame(_) => "frame".to_string(),
        }
    }

    /// Identity comparison: pointer identity for heap values, equality for
    /// immediates.
    #[must_use]
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Instance(a), Self::Instance(b)) => Arc::ptr_eq(a, b),
            (Self::Type(a), Self::Type(b)) => Arc::ptr_eq(a, b),
            (Self::Callable(a), Self::Callable(b)) => Arc::ptr_eq(a, b),
            (Self::Frame(a), Self::Frame(b)) => Arc::ptr_eq(a, b),
            (Self::Str(a), Self::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }

    /// Record a new runtime-level owner.
    pub fn retain(&self) {
        if let Some(header) = self.header() {
            header.retain();
        }
    }

    /// Drop a runtime-level owner, deallocating on zero.
    pub fn release(&self) {
        if let Some(header) = self.header()
            && header.release() == 0
        {
            self.deallocate();
        }
    }

    /// Run deallocation: clear the payload and flag the value dead. Runs at
    /// most once per value; immediates are ignored.
    pub fn deallocate(&self) {
        let Some(header) = self.header() else {
            return;
        };
        if !header.mark_deallocated() {
            return;
        }
        if let Self::Instance(obj) = self {
            obj.clear();
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_instance(&self) -> Option<&InstanceRef> {
        match self {
            Self::Instance(obj) => Some(obj),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_type(&self) -> Option<&TypeRef> {
        match self {
            Self::Type(typ) => Some(typ),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            _ => self.is(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Instance(obj) => write!(f, "{obj:?}"),
            Self::Type(typ) => write!(f, "<type '{}'>", typ.name()),
            Self::Callable(callable) => write!(f, "<function {}>", callable.name()),
            Self::Frame(frame) => write!(f, "<frame of {}>", frame.name()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::str(v)
    }
}

impl From<InstanceRef> for Value {
    fn from(v: InstanceRef) -> Self {
        Self::Instance(v)
    }
}

impl From<TypeRef> for Value {
    fn from(v: TypeRef) -> Self {
        Self::Type(v)
    }
}

impl From<CallableRef> for Value {
    fn from(v: CallableRef) -> Self {
        Self::Callable(v)
    }
}

// ---------------------------------------------------------------------------
// Address registry
// ---------------------------------------------------------------------------

/// Weak registry of live instances keyed by address.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: RwLock<HashMap<usize, Weak<Instance>>>,
}

impl ObjectRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, instance: &InstanceRef) {
        let addr = Arc::as_ptr(instance) as usize;
        self.objects.write().insert(addr, Arc::downgrade(instance));
    }

    fn forget(&self, addr: usize) {
        self.objects.write().remove(&addr);
    }

    /// Number of tracked instances (live or pending removal).
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live, not deallocated instance by address.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<InstanceRef> {
        let found = self.objects.read().get(&addr).and_then(Weak::upgrade)?;
        (!found.header().is_deallocated()).then_some(found)
    }
}

static GLOBAL_REGISTRY: OnceLock<ObjectRegistry> = OnceLock::new();

/// Process-wide instance registry.
#[must_use]
pub fn global_registry() -> &'static ObjectRegistry {
    GLOBAL_REGISTRY.get_or_init(ObjectRegistry::new)
}

/// Address of a heap value, `None` for immediates.
#[must_use]
pub fn address_of(value: &Value) -> Option<usize> {
    match value {
        Value::Instance(obj) => Some(Arc::as_ptr(obj) as usize),
        Value::Type(typ) => Some(Arc::as_ptr(typ) as usize),
        Value::Callable(callable) => Some(Arc::as_ptr(callable) as usize),
        Value::Frame(frame) => Some(Arc::as_ptr(frame) as usize),
        Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => None,
    }
}

/// Turn an instance address back into a value.
pub fn dereference_tracked(addr: usize) -> Result<Value, RuntimeError> {
    global_registry()
        .lookup(addr)
        .map(Value::Instance)
        .ok_or(RuntimeError::Dereference(addr))
}
