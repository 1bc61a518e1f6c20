//! # Deferred References
//!
//! A [`Reference`] is a by-name pointer from one node to another,
//! carried in the persisted form as a string. It exists in one of two
//! modes:
//!
//! - **write**: constructed around a resolved node; the persisted
//!   string form is computed lazily when first asked for
//! - **read**: constructed around the persisted string form; the node
//!   is resolved lazily on first access
//!
//! Resolution goes through a [`ReferenceResolver`] capability — the
//! concrete binding knows how names map to nodes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::component::{ComponentKind, ComponentRef};

#[derive(Error, Debug)]
pub enum ResolveError {
    /// The target node has been detached from its tree.
    #[error("reference target is detached")]
    TargetDetached,

    #[error("reference resolution failed: {0}")]
    Failed(String),
}

/// Name-to-node resolution capability supplied by the binding.
pub trait ReferenceResolver: Send + Sync {
    /// Resolve a persisted string form against the owning parent.
    /// `Ok(None)` means the name denotes nothing (a broken
    /// reference); `Err(TargetDetached)` means resolution found a
    /// node that is no longer attached.
    fn resolve(
        &self,
        parent: &ComponentRef,
        kind: ComponentKind,
        persisted: &str,
    ) -> Result<Option<ComponentRef>, ResolveError>;

    /// Compute the persisted string form for a resolved node, or
    /// `None` when the node has no stable name yet.
    fn persisted_form(&self, target: &ComponentRef) -> Option<String>;
}

#[derive(Default)]
struct Inner {
    resolved: Option<ComponentRef>,
    persisted: Option<String>,
}

/// A deferred cross-node pointer.
pub struct Reference {
    parent: ComponentRef,
    kind: ComponentKind,
    resolver: Arc<dyn ReferenceResolver>,
    inner: Mutex<Inner>,
}

impl Reference {
    /// Write mode: the node is known, the string form is computed
    /// lazily.
    pub fn resolved(
        parent: ComponentRef,
        kind: ComponentKind,
        target: ComponentRef,
        resolver: Arc<dyn ReferenceResolver>,
    ) -> Self {
        Self {
            parent,
            kind,
            resolver,
            inner: Mutex::new(Inner {
                resolved: Some(target),
                persisted: None,
            }),
        }
    }

    /// Read mode: only the string form is known, the node resolves
    /// lazily on first access.
    pub fn by_name(
        parent: ComponentRef,
        kind: ComponentKind,
        persisted: impl Into<String>,
        resolver: Arc<dyn ReferenceResolver>,
    ) -> Self {
        Self {
            parent,
            kind,
            resolver,
            inner: Mutex::new(Inner {
                resolved: None,
                persisted: Some(persisted.into()),
            }),
        }
    }

    pub fn parent(&self) -> &ComponentRef {
        &self.parent
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// The referenced node, resolving and memoizing on first access.
    ///
    /// A detached-target failure is caught here: the resolved value
    /// is cleared and `Ok(None)` returned. Other resolution failures
    /// propagate.
    pub fn get(&self) -> Result<Option<ComponentRef>, ResolveError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = &inner.resolved {
            return Ok(Some(node.clone()));
        }
        let Some(persisted) = inner.persisted.clone() else {
            return Ok(None);
        };
        match self.resolver.resolve(&self.parent, self.kind, &persisted) {
            Ok(node) => {
                inner.resolved = node.clone();
                Ok(node)
            }
            Err(ResolveError::TargetDetached) => {
                inner.resolved = None;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Whether resolution yields no node.
    ///
    /// Note: a resolution failure caused by the target having been
    /// detached clears the resolved value and reports `false` here —
    /// resolution was cleared, not broken. See DESIGN.md.
    pub fn is_broken(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.resolved.is_some() {
            return false;
        }
        let Some(persisted) = inner.persisted.clone() else {
            return true;
        };
        match self.resolver.resolve(&self.parent, self.kind, &persisted) {
            Ok(Some(node)) => {
                inner.resolved = Some(node);
                false
            }
            Ok(None) => true,
            Err(ResolveError::TargetDetached) => {
                inner.resolved = None;
                false
            }
            Err(_) => true,
        }
    }

    /// The persisted string form, computing and memoizing it for
    /// write-mode references.
    pub fn persisted_form(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.persisted.is_none() {
            if let Some(target) = &inner.resolved {
                inner.persisted = self.resolver.persisted_form(target);
            }
        }
        inner.persisted.clone()
    }
}

impl PartialEq for Reference {
    /// Structural equality: persisted form, owning parent and
    /// requested kind all match.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && Arc::ptr_eq(&self.parent, &other.parent)
            && self.persisted_form() == other.persisted_form()
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    /// Derived from the parent only; coarse bucketing is fine for
    /// the small reference sets this model carries.
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.parent) as usize).hash(state);
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Reference")
            .field("kind", &self.kind.name())
            .field("persisted", &inner.persisted)
            .field("resolved", &inner.resolved.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{node, LABEL, ROOT, WIDGET};
    use std::collections::{HashMap, HashSet};
    use std::hash::DefaultHasher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Name-keyed resolver with scripted detached targets.
    struct MapResolver {
        targets: Mutex<HashMap<String, ComponentRef>>,
        detached: Mutex<HashSet<String>>,
        resolutions: AtomicUsize,
    }

    impl MapResolver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                targets: Mutex::new(HashMap::new()),
                detached: Mutex::new(HashSet::new()),
                resolutions: AtomicUsize::new(0),
            })
        }

        fn add(&self, name: &str, target: ComponentRef) {
            self.targets.lock().unwrap().insert(name.to_string(), target);
        }

        fn mark_detached(&self, name: &str) {
            self.detached.lock().unwrap().insert(name.to_string());
        }
    }

    impl ReferenceResolver for MapResolver {
        fn resolve(
            &self,
            _parent: &ComponentRef,
            _kind: ComponentKind,
            persisted: &str,
        ) -> Result<Option<ComponentRef>, ResolveError> {
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            if self.detached.lock().unwrap().contains(persisted) {
                return Err(ResolveError::TargetDetached);
            }
            Ok(self.targets.lock().unwrap().get(persisted).cloned())
        }

        fn persisted_form(&self, target: &ComponentRef) -> Option<String> {
            self.targets
                .lock()
                .unwrap()
                .iter()
                .find(|(_, node)| Arc::ptr_eq(node, target))
                .map(|(name, _)| name.clone())
        }
    }

    #[test]
    fn test_read_mode_resolves_lazily_and_memoizes() {
        let resolver = MapResolver::new();
        let target = node(WIDGET);
        resolver.add("w1", target.clone());

        let reference = Reference::by_name(node(ROOT), WIDGET, "w1", resolver.clone());
        assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 0);

        let first = reference.get().unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &target));
        reference.get().unwrap().unwrap();
        assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_mode_computes_form_lazily() {
        let resolver = MapResolver::new();
        let target = node(WIDGET);
        resolver.add("w1", target.clone());

        let reference = Reference::resolved(node(ROOT), WIDGET, target.clone(), resolver);
        assert!(Arc::ptr_eq(&reference.get().unwrap().unwrap(), &target));
        assert_eq!(reference.persisted_form().as_deref(), Some("w1"));
    }

    #[test]
    fn test_broken_when_name_resolves_to_nothing() {
        let resolver = MapResolver::new();
        let reference = Reference::by_name(node(ROOT), WIDGET, "missing", resolver);
        assert!(reference.is_broken());
        assert!(reference.get().unwrap().is_none());
    }

    /// Pins the `is_broken` contract: a detached-target failure is
    /// caught and reported as "resolution cleared", not broken.
    #[test]
    fn test_detached_target_clears_without_breaking() {
        let resolver = MapResolver::new();
        resolver.mark_detached("gone");

        let reference = Reference::by_name(node(ROOT), WIDGET, "gone", resolver);
        assert!(!reference.is_broken());
        assert!(reference.get().unwrap().is_none());
        // Still not broken on re-query; the resolved slot stays
        // cleared rather than erroring.
        assert!(!reference.is_broken());
    }

    #[test]
    fn test_structural_equality_and_parent_hash() {
        use std::hash::{Hash, Hasher};

        let resolver = MapResolver::new();
        let parent = node(ROOT);
        let other_parent = node(ROOT);
        let target = node(WIDGET);
        resolver.add("w1", target.clone());

        let a = Reference::by_name(parent.clone(), WIDGET, "w1", resolver.clone());
        let b = Reference::resolved(parent.clone(), WIDGET, target, resolver.clone());
        assert_eq!(a, b);

        let other = Reference::by_name(other_parent, WIDGET, "w1", resolver.clone());
        assert_ne!(a, other);
        let other_kind = Reference::by_name(parent, LABEL, "w1", resolver);
        assert_ne!(a, other_kind);

        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }
}
