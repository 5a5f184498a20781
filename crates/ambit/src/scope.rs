use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    Key, Value, ValueMap,
    accessor::{Reverter, ThreadLocalAccessor},
};

/// An in-progress restoration of ambient state on the current thread.
///
/// Produced by [`Snapshot::set_thread_locals`] and the factory shortcuts. The
/// scope records the previous state of every slot it modified and restores it
/// when the scope closes, explicitly via [`close`] or implicitly on drop, so
/// restoration runs on every exit path of the guarded region.
///
/// Scopes are bound to the thread that opened them, the type is not [`Send`].
/// Nested scopes must close in reverse order of opening, ordinary lexical
/// nesting does this naturally and the core does not detect violations.
///
/// [`Snapshot::set_thread_locals`]: crate::Snapshot::set_thread_locals
/// [`close`]: Scope::close
#[must_use = "dropping the scope immediately restores the previous thread state"]
pub struct Scope {
    restores: Vec<Restore>,
    _not_send: PhantomData<*const ()>,
}

enum Restore {
    Previous {
        accessor: Arc<dyn ThreadLocalAccessor>,
        value: Option<Value>,
    },
    Revert(Reverter),
}

impl Scope {
    /// Applies `entries` to every accessor whose key passes `considered`.
    ///
    /// Considered keys present in `entries` are installed, considered keys
    /// absent from `entries` are cleared when `clear_missing` is enabled and
    /// left untouched otherwise. Not-considered slots are never modified.
    pub(crate) fn open(
        thread_locals: &[Arc<dyn ThreadLocalAccessor>],
        entries: &ValueMap,
        considered: &dyn Fn(&Key) -> bool,
        clear_missing: bool,
    ) -> Self {
        let mut restores = Vec::new();
        for accessor in thread_locals {
            let key = accessor.key();
            if !considered(&key) {
                continue;
            }
            if let Some(value) = entries.get(&key) {
                match accessor.open_scope(value.clone()) {
                    Some(reverter) => restores.push(Restore::Revert(reverter)),
                    None => {
                        let previous = accessor.get();
                        accessor.set(value.clone());
                        restores.push(Restore::Previous {
                            accessor: accessor.clone(),
                            value: previous,
                        });
                    }
                }
            } else if clear_missing {
                match accessor.close_scope() {
                    Some(reverter) => restores.push(Restore::Revert(reverter)),
                    None => {
                        let previous = accessor.get();
                        accessor.clear();
                        restores.push(Restore::Previous {
                            accessor: accessor.clone(),
                            value: previous,
                        });
                    }
                }
            }
        }
        Self {
            restores,
            _not_send: PhantomData,
        }
    }

    /// Number of slots this scope modified.
    pub fn touched(&self) -> usize {
        self.restores.len()
    }

    /// Restore every modified slot to its exact previous state.
    ///
    /// Restores are independent per slot, the order among keys of one scope is
    /// unspecified but always complete.
    pub fn close(self) {
        // restoration runs in the drop
    }
}
impl Drop for Scope {
    fn drop(&mut self) {
        for restore in self.restores.drain(..) {
            // restores are independent per slot and must all run, a panic restoring
            // one slot is contained so it cannot mask the delegate failure either
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match restore {
                Restore::Previous { accessor, value } => match value {
                    Some(value) => accessor.set(value),
                    None => accessor.clear(),
                },
                Restore::Revert(reverter) => reverter.revert(),
            }));
            if result.is_err() {
                tracing::error!("panic restoring ambient slot, thread state may be inconsistent");
            }
        }
    }
}
impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("touched()", &self.touched()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, sync::Arc};

    use crate::{
        CaptureFilter, ContextRegistry, Key, SnapshotFactory, Value,
        accessor::{LocalSlot, ThreadLocalAccessor},
        value,
    };

    use super::*;

    thread_local! {
        static FOO: RefCell<Option<Arc<String>>> = const { RefCell::new(None) };
        static BAR: RefCell<Option<Arc<String>>> = const { RefCell::new(None) };
        static STACK: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
    }

    fn foo(v: &str) {
        FOO.with_borrow_mut(|s| *s = Some(Arc::new(v.to_owned())));
    }
    fn read_foo() -> Option<String> {
        FOO.with_borrow(|s| s.as_ref().map(|v| v.to_string()))
    }
    fn bar(v: &str) {
        BAR.with_borrow_mut(|s| *s = Some(Arc::new(v.to_owned())));
    }
    fn read_bar() -> Option<String> {
        BAR.with_borrow(|s| s.as_ref().map(|v| v.to_string()))
    }

    fn registry() -> ContextRegistry {
        let registry = ContextRegistry::new();
        registry
            .register_thread_local(Arc::new(LocalSlot::new("foo", &FOO)))
            .register_thread_local(Arc::new(LocalSlot::new("bar", &BAR)));
        registry
    }

    #[test]
    fn restores_exact_previous_value() {
        FOO.with_borrow_mut(|s| *s = None);
        foo("f1");
        let factory = SnapshotFactory::new(registry());
        let snapshot = factory.capture();

        foo("changed");
        let scope = snapshot.set_thread_locals();
        assert_eq!(read_foo(), Some("f1".to_owned()));
        scope.close();
        assert_eq!(read_foo(), Some("changed".to_owned()));
    }

    #[test]
    fn open_close_is_noop() {
        FOO.with_borrow_mut(|s| *s = None);
        foo("f1");
        bar("b1");
        let snapshot = SnapshotFactory::new(registry()).capture();

        let scope = snapshot.set_thread_locals();
        scope.close();
        assert_eq!(read_foo(), Some("f1".to_owned()));
        assert_eq!(read_bar(), Some("b1".to_owned()));
    }

    #[test]
    fn merge_keeps_unrelated_slots() {
        // default semantics, considered keys absent from the snapshot are left untouched
        foo("f2");
        let snapshot = SnapshotFactory::new(registry())
            .filter(CaptureFilter::Include([Key::new("foo")].into_iter().collect()))
            .capture();

        foo("f1");
        bar("b1");
        let scope = snapshot.set_thread_locals();
        assert_eq!(read_foo(), Some("f2".to_owned()));
        assert_eq!(read_bar(), Some("b1".to_owned()));
        scope.close();
        assert_eq!(read_foo(), Some("f1".to_owned()));
        assert_eq!(read_bar(), Some("b1".to_owned()));
    }

    #[test]
    fn clear_missing_replaces_exactly() {
        foo("f1");
        bar("b1");
        let registry = registry();
        // snapshot with only foo captured
        let factory = SnapshotFactory::new(registry)
            .filter(CaptureFilter::Include([Key::new("foo")].into_iter().collect()))
            .clear_missing(true);
        let snapshot = factory.capture();

        foo("f2");
        let scope = snapshot.set_thread_locals();
        assert_eq!(read_foo(), Some("f1".to_owned()));
        assert_eq!(read_bar(), None, "clear-missing must clear considered keys absent from the snapshot");
        scope.close();
        assert_eq!(read_foo(), Some("f2".to_owned()));
        assert_eq!(read_bar(), Some("b1".to_owned()));
    }

    #[test]
    fn clear_missing_considered_set_honors_filter() {
        foo("f1");
        bar("b1");
        let registry = registry();
        let factory = SnapshotFactory::new(registry).filter(CaptureFilter::None).clear_missing(true);
        let snapshot = factory.capture();
        assert!(snapshot.is_empty());

        // only `foo` is considered at apply time, `bar` stays set
        let scope = snapshot.set_thread_locals_filtered(&CaptureFilter::Include([Key::new("foo")].into_iter().collect()));
        assert_eq!(read_foo(), None);
        assert_eq!(read_bar(), Some("b1".to_owned()));
        scope.close();
        assert_eq!(read_foo(), Some("f1".to_owned()));
    }

    #[test]
    fn nested_scopes_unwind_in_order() {
        FOO.with_borrow_mut(|s| *s = None);
        let registry = registry();

        foo("A");
        let outer_snapshot = SnapshotFactory::new(registry.clone()).capture();
        foo("B");
        let inner_snapshot = SnapshotFactory::new(registry).capture();
        FOO.with_borrow_mut(|s| *s = None);

        let outer = outer_snapshot.set_thread_locals();
        assert_eq!(read_foo(), Some("A".to_owned()));
        let inner = inner_snapshot.set_thread_locals();
        assert_eq!(read_foo(), Some("B".to_owned()));
        inner.close();
        assert_eq!(read_foo(), Some("A".to_owned()));
        outer.close();
        assert_eq!(read_foo(), None);
    }

    #[test]
    fn panic_in_guarded_region_restores() {
        FOO.with_borrow_mut(|s| *s = None);
        foo("before");
        let snapshot = {
            foo("captured");
            let s = SnapshotFactory::new(registry()).capture();
            foo("before");
            s
        };

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            snapshot.run(|| {
                assert_eq!(read_foo(), Some("captured".to_owned()));
                panic!("boom");
            })
        }));
        assert!(panicked.is_err());
        assert_eq!(read_foo(), Some("before".to_owned()));
    }

    #[test]
    fn lifo_slot_uses_reverters() {
        // a stack slot where install pushes and revert pops
        struct StackSlot;
        impl ThreadLocalAccessor for StackSlot {
            fn key(&self) -> Key {
                Key::new("stack")
            }
            fn get(&self) -> Option<Value> {
                STACK.with_borrow(|s| s.last().cloned())
            }
            fn set(&self, value: Value) {
                STACK.with_borrow_mut(|s| {
                    s.pop();
                    s.push(value);
                });
            }
            fn clear(&self) {
                STACK.with_borrow_mut(|s| {
                    s.pop();
                });
            }
            fn open_scope(&self, value: Value) -> Option<Reverter> {
                STACK.with_borrow_mut(|s| s.push(value));
                Some(Reverter::new(|| {
                    STACK.with_borrow_mut(|s| {
                        s.pop();
                    });
                }))
            }
        }

        let registry = ContextRegistry::new();
        registry.register_thread_local(Arc::new(StackSlot));

        STACK.with_borrow_mut(|s| s.push(value("base".to_owned())));
        let snapshot = SnapshotFactory::new(registry).capture();

        let depth = || STACK.with_borrow(|s| s.len());
        assert_eq!(depth(), 1);
        let scope = snapshot.set_thread_locals();
        assert_eq!(depth(), 2, "open must push, not overwrite");
        scope.close();
        assert_eq!(depth(), 1, "close must pop the pushed frame");
    }
}
