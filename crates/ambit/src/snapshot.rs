use std::{any::Any, fmt, sync::Arc};

use once_cell::sync::Lazy;

use crate::{CaptureFilter, ContextRef, ContextRegistry, Key, Scope, SnapshotError, Value, ValueMap};

static EMPTY_ENTRIES: Lazy<Arc<ValueMap>> = Lazy::new(|| Arc::new(ValueMap::default()));

/// Immutable mapping of ambient values captured at a point in time.
///
/// Snapshots are produced by a [`SnapshotFactory`], are cheap to clone and
/// safe to share across threads, every application reads the same entries. A
/// snapshot never maps a key to an absent value, absence is dropped at
/// capture.
///
/// The snapshot can be applied three ways, into the current thread's slots
/// with [`set_thread_locals`], into an outgoing context object with
/// [`update_context`] and around a unit of work with [`wrap`].
///
/// [`set_thread_locals`]: Snapshot::set_thread_locals
/// [`update_context`]: Snapshot::update_context
/// [`wrap`]: Snapshot::wrap
#[derive(Clone)]
pub struct Snapshot {
    entries: Arc<ValueMap>,
    registry: ContextRegistry,
    clear_missing: bool,
}
impl Snapshot {
    /// Captured value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Checks if `key` was captured.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate the captured keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// If nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The registry this snapshot was captured from.
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Write every captured entry into `context`, returning the updated context.
    ///
    /// The context family's accessor decides how entries land, for immutable
    /// families the returned context is a new instance. No thread-local slot
    /// is touched.
    pub fn update_context<C: Any>(&self, context: C) -> Result<C, SnapshotError> {
        self.update_context_filtered(context, &CaptureFilter::All)
    }

    /// Write the captured entries that pass `filter` into `context`.
    pub fn update_context_filtered<C: Any>(&self, context: C, filter: &CaptureFilter) -> Result<C, SnapshotError> {
        let accessor = self.registry.context_accessor_for_write(ContextRef::new(&context))?;
        let updated = match filter {
            CaptureFilter::All => accessor.write_values(&self.entries, &context),
            _ => {
                let filtered: ValueMap = self
                    .entries
                    .iter()
                    .filter(|(key, _)| filter.allows(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                accessor.write_values(&filtered, &context)
            }
        };
        match updated.downcast::<C>() {
            Ok(updated) => Ok(*updated),
            Err(_) => panic!(
                "context accessor for `{}` returned a different context type",
                accessor.writeable_type()
            ),
        }
    }

    /// Install the captured values in the current thread's slots.
    ///
    /// Every registered thread-local accessor is considered. Slots with a
    /// captured value are set, slots without one are left untouched, or
    /// cleared when the factory was configured with
    /// [`SnapshotFactory::clear_missing`]. The returned scope restores every
    /// modified slot on close.
    pub fn set_thread_locals(&self) -> Scope {
        self.set_thread_locals_filtered(&CaptureFilter::All)
    }

    /// Same as [`set_thread_locals`], considering only keys that pass `filter`.
    ///
    /// [`set_thread_locals`]: Snapshot::set_thread_locals
    pub fn set_thread_locals_filtered(&self, filter: &CaptureFilter) -> Scope {
        let thread_locals = self.registry.thread_locals();
        Scope::open(&thread_locals, &self.entries, &|key| filter.allows(key), self.clear_missing)
    }

    /// Calls `task` with the captured values installed.
    pub fn run<R>(&self, task: impl FnOnce() -> R) -> R {
        let _scope = self.set_thread_locals();
        task()
    }

    /// Binds this snapshot to `task`.
    ///
    /// The returned task installs the captured values on whatever thread
    /// invokes it, runs the delegate and restores the previous thread state on
    /// every exit path, including panics. Delegate failures propagate
    /// unchanged after restoration.
    pub fn wrap<R>(self, task: impl FnOnce() -> R) -> impl FnOnce() -> R {
        move || {
            let _scope = self.set_thread_locals();
            task()
        }
    }

    /// Binds this snapshot to a reusable `task`.
    ///
    /// Same semantics as [`wrap`], every invocation opens a fresh scope.
    ///
    /// [`wrap`]: Snapshot::wrap
    pub fn wrap_fn<R>(self, task: impl Fn() -> R) -> impl Fn() -> R {
        move || {
            let _scope = self.set_thread_locals();
            task()
        }
    }

    /// Binds this snapshot to a single-argument `task`.
    ///
    /// Same semantics as [`wrap`].
    ///
    /// [`wrap`]: Snapshot::wrap
    pub fn wrap_consumer<A, R>(self, task: impl FnOnce(A) -> R) -> impl FnOnce(A) -> R {
        move |arg| {
            let _scope = self.set_thread_locals();
            task(arg)
        }
    }
}
impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("<entries>", &self.entries.len()).finish()
    }
}

/// Policy for [`SnapshotFactory::set_thread_locals_from`] with an empty key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyKeys {
    /// Treat the empty list as *all registered keys*.
    #[default]
    ApplyAll,

    /// Reject the call with [`SnapshotError::MissingKeys`].
    Reject,
}

/// Configured builder for [`Snapshot`] instances.
///
/// The factory pairs a [`ContextRegistry`] with a capture-time
/// [`CaptureFilter`] and the clear-missing policy. Factories are cheap to
/// clone and the builder methods are chainable.
#[derive(Clone, Debug)]
pub struct SnapshotFactory {
    registry: ContextRegistry,
    filter: CaptureFilter,
    clear_missing: bool,
    empty_keys: EmptyKeys,
}
impl SnapshotFactory {
    /// New factory over `registry`, capturing all keys, merge semantics.
    pub fn new(registry: ContextRegistry) -> Self {
        Self {
            registry,
            filter: CaptureFilter::All,
            clear_missing: false,
            empty_keys: EmptyKeys::default(),
        }
    }

    /// New factory over the process-wide [`default_registry`].
    ///
    /// [`default_registry`]: crate::default_registry
    pub fn with_default_registry() -> Self {
        Self::new(crate::default_registry().clone())
    }

    /// Sets the capture-time key filter.
    pub fn filter(mut self, filter: CaptureFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the clear-missing policy.
    ///
    /// When enabled, applying a snapshot *clears* every considered slot that
    /// has no captured value, replacing the ambient state exactly instead of
    /// merging over it.
    pub fn clear_missing(mut self, clear_missing: bool) -> Self {
        self.clear_missing = clear_missing;
        self
    }

    /// Sets the empty key list policy of [`set_thread_locals_from`].
    ///
    /// [`set_thread_locals_from`]: SnapshotFactory::set_thread_locals_from
    pub fn empty_keys(mut self, policy: EmptyKeys) -> Self {
        self.empty_keys = policy;
        self
    }

    /// The configured registry.
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Capture from the current thread's slots only.
    pub fn capture(&self) -> Snapshot {
        let mut entries = ValueMap::default();
        self.capture_thread_locals(&mut entries);
        self.snapshot(entries)
    }

    /// Capture from the current thread's slots, then from each context in order.
    ///
    /// Later contexts overwrite earlier entries for the same key, an absent
    /// entry in a later context is ignored, never a delete marker.
    pub fn capture_all(&self, contexts: &[ContextRef]) -> Result<Snapshot, SnapshotError> {
        let mut entries = ValueMap::default();
        self.capture_thread_locals(&mut entries);
        self.capture_contexts(contexts, &mut entries)?;
        Ok(self.snapshot(entries))
    }

    /// Capture from the given contexts only, no thread-local slot is read.
    pub fn capture_from(&self, contexts: &[ContextRef]) -> Result<Snapshot, SnapshotError> {
        let mut entries = ValueMap::default();
        self.capture_contexts(contexts, &mut entries)?;
        Ok(self.snapshot(entries))
    }

    /// Install values read from `context` directly, without a caller-visible snapshot.
    ///
    /// With explicit `keys` only those slots are considered, every other slot
    /// is untouched. An empty `keys` list follows the configured
    /// [`EmptyKeys`] policy.
    pub fn set_thread_locals_from(&self, context: ContextRef, keys: &[Key]) -> Result<Scope, SnapshotError> {
        if keys.is_empty() {
            return match self.empty_keys {
                EmptyKeys::ApplyAll => self.set_all_thread_locals_from(context),
                EmptyKeys::Reject => Err(SnapshotError::MissingKeys),
            };
        }
        let accessor = self.registry.context_accessor_for_read(context)?;
        let mut entries = ValueMap::default();
        for key in keys {
            if let Some(value) = accessor.read_value(context.as_any(), key) {
                entries.insert(key.clone(), value);
            }
        }
        let thread_locals = self.registry.thread_locals();
        Ok(Scope::open(&thread_locals, &entries, &|key| keys.contains(key), self.clear_missing))
    }

    /// Install values read from `context` into every registered slot.
    pub fn set_all_thread_locals_from(&self, context: ContextRef) -> Result<Scope, SnapshotError> {
        let accessor = self.registry.context_accessor_for_read(context)?;
        let mut entries = ValueMap::default();
        accessor.read_values(context.as_any(), &CaptureFilter::All, &mut entries);
        let thread_locals = self.registry.thread_locals();
        Ok(Scope::open(&thread_locals, &entries, &|_| true, self.clear_missing))
    }

    fn capture_thread_locals(&self, entries: &mut ValueMap) {
        for accessor in self.registry.thread_locals().iter() {
            let key = accessor.key();
            if self.filter.allows(&key) {
                if let Some(value) = accessor.get() {
                    entries.insert(key, value);
                }
            }
        }
    }

    fn capture_contexts(&self, contexts: &[ContextRef], entries: &mut ValueMap) -> Result<(), SnapshotError> {
        for context in contexts {
            let accessor = self.registry.context_accessor_for_read(*context)?;
            let mut read = ValueMap::default();
            accessor.read_values(context.as_any(), &self.filter, &mut read);
            for (key, value) in read {
                // accessors receive the filter, re-check in case one ignores it
                if self.filter.allows(&key) {
                    entries.insert(key, value);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self, entries: ValueMap) -> Snapshot {
        let entries = if entries.is_empty() { EMPTY_ENTRIES.clone() } else { Arc::new(entries) };
        Snapshot {
            entries,
            registry: self.registry.clone(),
            clear_missing: self.clear_missing,
        }
    }
}
