use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    AccessDirection, ContextRef, DuplicateType, Key, SnapshotError, TypeRole, Value,
    accessor::{ContextAccessor, Discovered, FnThreadLocalAccessor, ThreadLocalAccessor},
};

/// Published snapshot of the registered thread-local accessors, in registration order.
pub type ThreadLocalAccessors = Arc<Vec<Arc<dyn ThreadLocalAccessor>>>;

/// Published snapshot of the registered context accessors, in registration order.
pub type ContextAccessors = Arc<Vec<Arc<dyn ContextAccessor>>>;

/// Set of pluggable accessors.
///
/// The registry holds ordered lists of both accessor families under
/// copy-on-write semantics, readers receive an immutable published list and
/// are never blocked by a registration in flight. An in-flight lookup may or
/// may not observe a concurrent registration, once visible it is visible
/// atomically.
///
/// The handle is cheap to clone, clones share the same accessor lists.
#[derive(Clone, Default)]
pub struct ContextRegistry(Arc<RegistryInner>);

#[derive(Default)]
struct RegistryInner {
    thread_locals: RwLock<ThreadLocalAccessors>,
    contexts: RwLock<ContextAccessors>,
}

impl ContextRegistry {
    /// New empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread-local accessor.
    ///
    /// Keys are unique among thread-local accessors, an already registered
    /// accessor with the same key is removed and the new accessor is appended.
    pub fn register_thread_local(&self, accessor: Arc<dyn ThreadLocalAccessor>) -> &Self {
        let key = accessor.key();
        let mut list = self.0.thread_locals.write();
        if list.iter().any(|a| a.key() == key) {
            tracing::warn!("thread-local accessor for {key:?} replaced");
        }
        let mut new: Vec<_> = list.iter().filter(|a| a.key() != key).cloned().collect();
        new.push(accessor);
        *list = Arc::new(new);
        self
    }

    /// Register a thread-local accessor synthesized from the three slot callbacks.
    pub fn register_thread_local_fns(
        &self,
        key: impl Into<Key>,
        get: impl Fn() -> Option<Value> + Send + Sync + 'static,
        set: impl Fn(Value) + Send + Sync + 'static,
        clear: impl Fn() + Send + Sync + 'static,
    ) -> &Self {
        self.register_thread_local(Arc::new(FnThreadLocalAccessor::new(key, get, set, clear)))
    }

    /// Register a context accessor.
    ///
    /// Rejected if the accessor's readable or writeable type is already
    /// covered by a registered accessor, at most one accessor can handle a
    /// given context type.
    pub fn register_context(&self, accessor: Arc<dyn ContextAccessor>) -> Result<&Self, DuplicateType> {
        let readable = accessor.readable_type();
        let writeable = accessor.writeable_type();
        let mut list = self.0.contexts.write();
        for existing in list.iter() {
            if existing.readable_type() == readable {
                return Err(DuplicateType::new(TypeRole::Readable, existing.readable_type(), readable));
            }
            if existing.writeable_type() == writeable {
                return Err(DuplicateType::new(TypeRole::Writeable, existing.writeable_type(), writeable));
            }
        }
        let mut new: Vec<_> = list.iter().cloned().collect();
        new.push(accessor);
        *list = Arc::new(new);
        Ok(self)
    }

    /// Remove the thread-local accessor registered for `key`.
    ///
    /// Returns `true` if an accessor was found and removed.
    pub fn remove_thread_local(&self, key: &Key) -> bool {
        let mut list = self.0.thread_locals.write();
        match list.iter().position(|a| a.key() == *key) {
            Some(i) => {
                let mut new: Vec<_> = list.iter().cloned().collect();
                new.remove(i);
                *list = Arc::new(new);
                true
            }
            None => false,
        }
    }

    /// Remove a context accessor by instance identity.
    ///
    /// Returns `true` if the accessor was found and removed.
    pub fn remove_context(&self, accessor: &Arc<dyn ContextAccessor>) -> bool {
        let mut list = self.0.contexts.write();
        match list.iter().position(|a| Arc::ptr_eq(a, accessor)) {
            Some(i) => {
                let mut new: Vec<_> = list.iter().cloned().collect();
                new.remove(i);
                *list = Arc::new(new);
                true
            }
            None => false,
        }
    }

    /// Register every accessor produced by an external discovery pass.
    ///
    /// Discovered thread-local accessors follow the replace-on-same-key rule.
    /// Discovered context accessors that overlap an already registered type
    /// are skipped with a warning, discovery is best-effort.
    pub fn load_discovered(&self, provider: impl IntoIterator<Item = Discovered>) {
        for discovered in provider {
            match discovered {
                Discovered::ThreadLocal(a) => {
                    self.register_thread_local(a);
                }
                Discovered::Context(a) => {
                    if let Err(e) = self.register_context(a) {
                        tracing::warn!("skipped discovered context accessor, {e}");
                    }
                }
            }
        }
    }

    /// The registered thread-local accessors.
    pub fn thread_locals(&self) -> ThreadLocalAccessors {
        self.0.thread_locals.read().clone()
    }

    /// The registered context accessors.
    pub fn context_accessors(&self) -> ContextAccessors {
        self.0.contexts.read().clone()
    }

    /// First registered accessor that can read from the `context` type.
    pub fn context_accessor_for_read(&self, context: ContextRef) -> Result<Arc<dyn ContextAccessor>, SnapshotError> {
        let ty = context.context_type();
        self.context_accessors()
            .iter()
            .find(|a| a.readable_type() == ty)
            .cloned()
            .ok_or(SnapshotError::NoAccessor {
                direction: AccessDirection::Read,
                context: ty,
            })
    }

    /// First registered accessor that can write into the `context` type.
    pub fn context_accessor_for_write(&self, context: ContextRef) -> Result<Arc<dyn ContextAccessor>, SnapshotError> {
        let ty = context.context_type();
        self.context_accessors()
            .iter()
            .find(|a| a.writeable_type() == ty)
            .cloned()
            .ok_or(SnapshotError::NoAccessor {
                direction: AccessDirection::Write,
                context: ty,
            })
    }
}
impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("<thread-locals>", &self.thread_locals().len())
            .field("<contexts>", &self.context_accessors().len())
            .finish()
    }
}
