//! Ambient value propagation.
//!
//! # Crate
//!
#![doc = include_str!(concat!("../", std::env!("CARGO_PKG_README")))]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};

mod accessor;
mod registry;
mod scope;
mod snapshot;

pub use accessor::{ContextAccessor, Discovered, FnThreadLocalAccessor, LocalSlot, Reverter, ThreadLocalAccessor};
pub use registry::{ContextAccessors, ContextRegistry, ThreadLocalAccessors};
pub use scope::Scope;
pub use snapshot::{EmptyKeys, Snapshot, SnapshotFactory};

/// Identifies one ambient slot.
///
/// Keys are opaque short strings with cheap clone, equality and hash. Dotted
/// segments give an optional grouping, `"log.trace"` belongs to group `"log"`,
/// see [`Key::in_group`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);
impl Key {
    /// New key.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dotted group prefix, the key up to the last `.` separator.
    ///
    /// Is `None` for keys without any separator.
    pub fn group(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(g, _)| g)
    }

    /// Gets if the key equals `group` or descends from it by dotted segments.
    ///
    /// `"log"` contains `"log"` and `"log.trace"`, not `"logging"`.
    pub fn in_group(&self, group: &str) -> bool {
        match self.0.strip_prefix(group) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.0)
    }
}
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}
impl From<String> for Key {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}
impl From<Arc<str>> for Key {
    fn from(key: Arc<str>) -> Self {
        Self(key)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A captured ambient value.
///
/// Values are shared type-erased payloads, the core only clones the handle and
/// never inspects the payload. Absence is represented by the *missing entry*,
/// a mapping to an absent value never appears in a [`Snapshot`].
pub type Value = Arc<dyn Any + Send + Sync>;

/// New [`Value`] from any shareable payload.
pub fn value<T: Any + Send + Sync>(payload: T) -> Value {
    Arc::new(payload)
}

/// Mutable mapping from key to captured value.
///
/// Used as the transfer buffer between accessors and the core, see
/// [`ContextAccessor::read_values`].
pub type ValueMap = FxHashMap<Key, Value>;

/// Identifies a selection of keys.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct KeySet(FxHashSet<Key>);
impl KeySet {
    /// New empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key.
    pub fn insert(&mut self, key: impl Into<Key>) -> bool {
        self.0.insert(key.into())
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &Key) -> bool {
        self.0.remove(key)
    }

    /// Checks if the key is in the set.
    pub fn contains(&self, key: &Key) -> bool {
        self.0.contains(key)
    }

    /// Number of unique keys in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// If the set has any keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the keys, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    /// Extend this set with all `other` keys.
    pub fn insert_all(&mut self, other: &Self) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Removes all `other` keys from this set.
    pub fn remove_all(&mut self, other: &Self) {
        for o in other.0.iter() {
            self.0.remove(o);
        }
    }
}
impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet").field("len()", &self.len()).finish()
    }
}
impl FromIterator<Key> for KeySet {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
impl Extend<Key> for KeySet {
    fn extend<I: IntoIterator<Item = Key>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// Defines a capture or apply time key selection.
///
/// The filter restricts the keys in play without touching the accessors that
/// own them, see [`SnapshotFactory::filter`] and
/// [`Snapshot::set_thread_locals_filtered`].
#[derive(Clone, Default)]
pub enum CaptureFilter {
    /// All keys.
    #[default]
    All,

    /// No keys.
    None,

    /// Only this set.
    Include(KeySet),

    /// All except this set.
    Exclude(KeySet),

    /// Bulk selection by dotted key group.
    Group {
        /// Dotted group prefixes to include, empty includes every key.
        include: Vec<String>,
        /// Dotted group prefixes excluded even when included above.
        exclude: Vec<String>,
    },

    /// Arbitrary key predicate.
    Custom(Arc<dyn Fn(&Key) -> bool + Send + Sync>),
}
impl CaptureFilter {
    /// Gets if `key` passes the filter.
    pub fn allows(&self, key: &Key) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Include(set) => set.contains(key),
            Self::Exclude(set) => !set.contains(key),
            Self::Group { include, exclude } => {
                (include.is_empty() || include.iter().any(|g| key.in_group(g))) && !exclude.iter().any(|g| key.in_group(g))
            }
            Self::Custom(allows) => allows(key),
        }
    }

    /// New filter that only allows keys in the dotted `group`.
    pub fn group(group: impl Into<String>) -> Self {
        Self::Group {
            include: vec![group.into()],
            exclude: vec![],
        }
    }

    /// New filter that allows every key not in the dotted `group`.
    pub fn exclude_group(group: impl Into<String>) -> Self {
        Self::Group {
            include: vec![],
            exclude: vec![group.into()],
        }
    }

    /// New filter from a key predicate.
    pub fn custom(allows: impl Fn(&Key) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(allows))
    }
}
impl fmt::Debug for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::None => write!(f, "None"),
            Self::Include(set) => f.debug_tuple("Include").field(set).finish(),
            Self::Exclude(set) => f.debug_tuple("Exclude").field(set).finish(),
            Self::Group { include, exclude } => f.debug_struct("Group").field("include", include).field("exclude", exclude).finish(),
            Self::Custom(_) => write!(f, "Custom(_)"),
        }
    }
}

/// Identifies a context object type.
///
/// Pairs the [`TypeId`] used for accessor lookup with the type name used in
/// error messages. Equality and hash consider the ID only.
#[derive(Clone, Copy, Debug)]
pub struct ContextType {
    id: TypeId,
    name: &'static str,
}
impl ContextType {
    /// Type of `C` context objects.
    pub fn of<C: Any>() -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: std::any::type_name::<C>(),
        }
    }

    /// Unique type ID.
    pub fn id(self) -> TypeId {
        self.id
    }

    /// Type name, for diagnostics only.
    pub fn name(self) -> &'static str {
        self.name
    }
}
impl PartialEq for ContextType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ContextType {}
impl std::hash::Hash for ContextType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased borrow of a context object.
///
/// Remembers the static type at the borrow site so that lookup failures can
/// name the type, see [`ContextRegistry::context_accessor_for_read`].
#[derive(Clone, Copy)]
pub struct ContextRef<'a> {
    any: &'a dyn Any,
    ty: ContextType,
}
impl<'a> ContextRef<'a> {
    /// Borrow `context` type-erased.
    pub fn new<C: Any>(context: &'a C) -> Self {
        Self {
            any: context,
            ty: ContextType::of::<C>(),
        }
    }

    /// The context object.
    pub fn as_any(&self) -> &'a dyn Any {
        self.any
    }

    /// The context type.
    pub fn context_type(&self) -> ContextType {
        self.ty
    }
}
impl<'a, C: Any> From<&'a C> for ContextRef<'a> {
    fn from(context: &'a C) -> Self {
        Self::new(context)
    }
}
impl fmt::Debug for ContextRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextRef").field(&self.ty.name()).finish()
    }
}

/// Error registering a context accessor that overlaps an already registered one.
///
/// At most one accessor can handle a given context type, otherwise lookup
/// would be ambiguous. See [`ContextRegistry::register_context`].
#[derive(Debug, Clone)]
pub struct DuplicateType {
    role: TypeRole,
    existing: ContextType,
    offered: ContextType,
}
impl DuplicateType {
    pub(crate) fn new(role: TypeRole, existing: ContextType, offered: ContextType) -> Self {
        Self { role, existing, offered }
    }

    /// Which of the accessor types overlapped.
    pub fn role(&self) -> TypeRole {
        self.role
    }

    /// Type declared by the already registered accessor.
    pub fn existing(&self) -> ContextType {
        self.existing
    }

    /// Type declared by the rejected accessor.
    pub fn offered(&self) -> ContextType {
        self.offered
    }
}
impl fmt::Display for DuplicateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            TypeRole::Readable => "readable",
            TypeRole::Writeable => "writeable",
        };
        write!(
            f,
            "cannot register context accessor, {role} type `{}` is already covered by the accessor for `{}`",
            self.offered, self.existing
        )
    }
}
impl std::error::Error for DuplicateType {}

/// Role of a context accessor type in a [`DuplicateType`] rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRole {
    /// The type read from, see [`ContextAccessor::readable_type`].
    Readable,
    /// The type written into, see [`ContextAccessor::writeable_type`].
    Writeable,
}

/// Direction of a context accessor lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    /// Lookup for [`ContextAccessor::read_values`].
    Read,
    /// Lookup for [`ContextAccessor::write_values`].
    Write,
}

/// Error building or applying a [`Snapshot`].
#[derive(Debug, Clone)]
pub enum SnapshotError {
    /// No registered context accessor can handle the context type.
    NoAccessor {
        /// Lookup direction.
        direction: AccessDirection,
        /// Dynamic type of the rejected context object.
        context: ContextType,
    },

    /// Explicit empty key list rejected by the factory.
    ///
    /// See [`EmptyKeys::Reject`].
    MissingKeys,
}
impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAccessor { direction, context } => {
                let direction = match direction {
                    AccessDirection::Read => "read from",
                    AccessDirection::Write => "write to",
                };
                write!(f, "no context accessor registered that can {direction} `{context}`")
            }
            Self::MissingKeys => write!(f, "no keys specified and the factory rejects empty key lists"),
        }
    }
}
impl std::error::Error for SnapshotError {}

/// The lazily initialized process-wide registry.
///
/// This is a convenience for hosts that expect a single ambient registry, core
/// operations never reach for it implicitly. Prefer an explicitly constructed
/// [`ContextRegistry`] handed to the [`SnapshotFactory`].
pub fn default_registry() -> &'static ContextRegistry {
    static DEFAULT: Lazy<ContextRegistry> = Lazy::new(ContextRegistry::new);
    &DEFAULT
}

#[cfg(test)]
mod key_tests {
    use super::*;

    #[test]
    fn key_groups() {
        let key = Key::new("log.mdc.trace");
        assert_eq!(key.group(), Some("log.mdc"));
        assert!(key.in_group("log"));
        assert!(key.in_group("log.mdc"));
        assert!(key.in_group("log.mdc.trace"));
        assert!(!key.in_group("log.md"));
        assert!(!key.in_group("logging"));
        assert_eq!(Key::new("flat").group(), None);
    }

    #[test]
    fn filter_include_exclude() {
        let set: KeySet = [Key::new("a"), Key::new("b")].into_iter().collect();

        let include = CaptureFilter::Include(set.clone());
        assert!(include.allows(&Key::new("a")));
        assert!(!include.allows(&Key::new("c")));

        let exclude = CaptureFilter::Exclude(set);
        assert!(!exclude.allows(&Key::new("a")));
        assert!(exclude.allows(&Key::new("c")));
    }

    #[test]
    fn filter_group() {
        let filter = CaptureFilter::Group {
            include: vec!["log".to_owned()],
            exclude: vec!["log.noisy".to_owned()],
        };

        assert!(filter.allows(&Key::new("log.trace")));
        assert!(filter.allows(&Key::new("log")));
        assert!(!filter.allows(&Key::new("log.noisy")));
        assert!(!filter.allows(&Key::new("log.noisy.child")));
        assert!(!filter.allows(&Key::new("metrics.count")));
    }

    #[test]
    fn filter_exclude_group() {
        let filter = CaptureFilter::exclude_group("metrics");
        assert!(filter.allows(&Key::new("log.trace")));
        assert!(!filter.allows(&Key::new("metrics.count")));
    }

    #[test]
    fn filter_custom() {
        let filter = CaptureFilter::custom(|k| k.as_str().len() == 3);
        assert!(filter.allows(&Key::new("abc")));
        assert!(!filter.allows(&Key::new("abcd")));
    }
}
