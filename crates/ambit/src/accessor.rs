use std::{any::Any, cell::RefCell, fmt, sync::Arc, thread::LocalKey};

use crate::{CaptureFilter, ContextType, Key, Value, ValueMap};

/// Bridge to one kind of per-thread ambient slot.
///
/// An accessor instance describes exactly one slot. The slot's key is stable
/// for the lifetime of the accessor and [`get`] returning `None` is the only
/// way the accessor signals *not set*. After [`set`] followed by [`clear`] a
/// subsequent [`get`] must return `None`.
///
/// Two accessors must not alias the same underlying slot, the core cannot
/// detect aliasing and restore order becomes load bearing if they do.
///
/// [`get`]: ThreadLocalAccessor::get
/// [`set`]: ThreadLocalAccessor::set
/// [`clear`]: ThreadLocalAccessor::clear
pub trait ThreadLocalAccessor: Send + Sync + 'static {
    /// Identity of the slot.
    fn key(&self) -> Key;

    /// Current value in the calling thread, or `None` if the slot is not set.
    fn get(&self) -> Option<Value>;

    /// Install `value` in the calling thread.
    ///
    /// The core never passes an absent value here.
    fn set(&self, value: Value);

    /// Remove any value from the calling thread.
    fn clear(&self);

    /// Install `value` and return the reverter that undoes the installation.
    ///
    /// Implement this instead of relying on plain [`set`] restore when the
    /// underlying slot has non-trivial open/close semantics, a stack that must
    /// be popped rather than overwritten for example. Returning `None` means
    /// the capability is not implemented and **nothing was installed**, the
    /// core falls back to remembering the current value and calling [`set`].
    ///
    /// [`set`]: ThreadLocalAccessor::set
    fn open_scope(&self, value: Value) -> Option<Reverter> {
        let _ = value;
        None
    }

    /// Clear the slot and return the reverter that undoes the clear.
    ///
    /// Same capability contract as [`open_scope`], `None` means not
    /// implemented and nothing was cleared.
    ///
    /// [`open_scope`]: ThreadLocalAccessor::open_scope
    fn close_scope(&self) -> Option<Reverter> {
        None
    }
}

/// Undoes one slot modification performed by a scope open.
///
/// Produced by [`ThreadLocalAccessor::open_scope`] and
/// [`ThreadLocalAccessor::close_scope`], consumed exactly once when the
/// [`Scope`] closes, on the same thread that opened it.
///
/// [`Scope`]: crate::Scope
pub struct Reverter(Box<dyn FnOnce()>);
impl Reverter {
    /// New from a closure that restores the previous slot state.
    pub fn new(revert: impl FnOnce() + 'static) -> Self {
        Self(Box::new(revert))
    }

    pub(crate) fn revert(self) {
        (self.0)()
    }
}
impl fmt::Debug for Reverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reverter(_)")
    }
}

/// Bridge to one family of external map-like context objects.
///
/// Context objects are values threaded through a pipeline instead of being
/// bound to a thread, often immutable. The accessor declares the static types
/// it handles, [`readable_type`] and [`writeable_type`] are distinct roles
/// because many context families split the read-only view from the producer.
///
/// Writes must be idempotent, writing the same mapping twice into the same
/// target yields an equal context.
///
/// [`readable_type`]: ContextAccessor::readable_type
/// [`writeable_type`]: ContextAccessor::writeable_type
pub trait ContextAccessor: Send + Sync + 'static {
    /// Type of context objects this accessor reads from.
    fn readable_type(&self) -> ContextType;

    /// Type of context objects this accessor writes into.
    fn writeable_type(&self) -> ContextType;

    /// Read all entries of `context` that pass `filter` into `into`.
    ///
    /// `context` is a value of the [`readable_type`]. Absent entries are not
    /// representable in a [`ValueMap`] so they simply must not be read.
    ///
    /// [`readable_type`]: ContextAccessor::readable_type
    fn read_values(&self, context: &dyn Any, filter: &CaptureFilter, into: &mut ValueMap);

    /// Read a single entry of `context`.
    fn read_value(&self, context: &dyn Any, key: &Key) -> Option<Value>;

    /// Write `values` into `context`, returning the updated context.
    ///
    /// `context` is a value of the [`writeable_type`] and the returned box
    /// must contain the same type, possibly a new instance when the context
    /// family is immutable.
    ///
    /// [`writeable_type`]: ContextAccessor::writeable_type
    fn write_values(&self, values: &ValueMap, context: &dyn Any) -> Box<dyn Any>;
}

impl core::fmt::Debug for dyn ContextAccessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContextAccessor")
            .field("readable_type", &self.readable_type())
            .field("writeable_type", &self.writeable_type())
            .finish()
    }
}

/// Thread-local accessor synthesized from callbacks.
///
/// See [`ContextRegistry::register_thread_local_fns`].
///
/// [`ContextRegistry::register_thread_local_fns`]: crate::ContextRegistry::register_thread_local_fns
pub struct FnThreadLocalAccessor {
    key: Key,
    get: Box<dyn Fn() -> Option<Value> + Send + Sync>,
    set: Box<dyn Fn(Value) + Send + Sync>,
    clear: Box<dyn Fn() + Send + Sync>,
}
impl FnThreadLocalAccessor {
    /// New from the three slot callbacks.
    pub fn new(
        key: impl Into<Key>,
        get: impl Fn() -> Option<Value> + Send + Sync + 'static,
        set: impl Fn(Value) + Send + Sync + 'static,
        clear: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            get: Box::new(get),
            set: Box::new(set),
            clear: Box::new(clear),
        }
    }
}
impl ThreadLocalAccessor for FnThreadLocalAccessor {
    fn key(&self) -> Key {
        self.key.clone()
    }

    fn get(&self) -> Option<Value> {
        (self.get)()
    }

    fn set(&self, value: Value) {
        (self.set)(value)
    }

    fn clear(&self) {
        (self.clear)()
    }
}
impl fmt::Debug for FnThreadLocalAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnThreadLocalAccessor").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Thread-local accessor over a plain `thread_local!` optional slot.
///
/// This is the accessor shape most integrations start with, the slot is a
/// `RefCell<Option<Arc<T>>>` declared with `std::thread_local!`.
///
/// # Panics
///
/// [`set`] panics if the value payload is not a `T`, slots are strongly typed.
///
/// [`set`]: ThreadLocalAccessor::set
pub struct LocalSlot<T: Any + Send + Sync> {
    key: Key,
    slot: &'static LocalKey<RefCell<Option<Arc<T>>>>,
}
impl<T: Any + Send + Sync> LocalSlot<T> {
    /// New accessor for the `slot` static.
    pub fn new(key: impl Into<Key>, slot: &'static LocalKey<RefCell<Option<Arc<T>>>>) -> Self {
        Self { key: key.into(), slot }
    }
}
impl<T: Any + Send + Sync> ThreadLocalAccessor for LocalSlot<T> {
    fn key(&self) -> Key {
        self.key.clone()
    }

    fn get(&self) -> Option<Value> {
        self.slot.with_borrow(|s| s.clone().map(|v| v as Value))
    }

    fn set(&self, value: Value) {
        match value.downcast::<T>() {
            Ok(value) => self.slot.with_borrow_mut(|s| *s = Some(value)),
            Err(_) => panic!("slot `{}` received a value of an unexpected type", self.key),
        }
    }

    fn clear(&self) {
        self.slot.with_borrow_mut(|s| *s = None)
    }
}
impl<T: Any + Send + Sync> fmt::Debug for LocalSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSlot").field("key", &self.key).finish_non_exhaustive()
    }
}

/// An accessor produced by an external discovery pass.
///
/// See [`ContextRegistry::load_discovered`].
///
/// [`ContextRegistry::load_discovered`]: crate::ContextRegistry::load_discovered
pub enum Discovered {
    /// A per-thread slot accessor.
    ThreadLocal(Arc<dyn ThreadLocalAccessor>),
    /// A context object accessor.
    Context(Arc<dyn ContextAccessor>),
}
impl fmt::Debug for Discovered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadLocal(a) => f.debug_tuple("ThreadLocal").field(&a.key()).finish(),
            Self::Context(a) => f.debug_tuple("Context").field(&a.readable_type().name()).finish(),
        }
    }
}
