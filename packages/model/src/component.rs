//! # Component Tree
//!
//! Tree nodes of the document model. A [`Component`] owns its
//! children (ordered, populated from the binding exactly once and
//! memoized), holds a non-owning back-reference to its parent, and —
//! while attached — a back-reference to its [`Model`].
//!
//! ## Mutation Semantics
//!
//! Every public mutator requires an open transaction owned by the
//! calling thread. Each call mutates the persisted-side structure
//! through the node's [`ComponentBacking`], updates the memoized
//! child order, stamps parent/model links, appends one reversible
//! edit, and enqueues exactly one fine-grained and one coarse-grained
//! event on the transaction.
//!
//! ### Positioning by sibling kind
//!
//! `add_before`/`add_after` place a child relative to siblings by an
//! ordered list of kind priorities. Children of the new child's own
//! concrete kind dominate: the new child always lands after the
//! existing ones of its kind. An empty priority list, an empty child
//! list, or no matching sibling means append.
//!
//! ### Replace-all-of-kind
//!
//! `set_child` removes every child assignable to the requested kind,
//! inserts the replacement (if any) by the positioning rules, and
//! fires exactly one fine-grained change: old is the last removed
//! child, new is the inserted one.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;

use crate::binding::ComponentBacking;
use crate::errors::ModelError;
use crate::events::{PropertyChange, PropertyValue, StructuralChange, StructuralEvent};
use crate::model::Model;

/// Concrete type tag of a node. Compared by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ComponentKind(&'static str);

impl ComponentKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Shared handle to a node. Node identity is pointer identity.
pub type ComponentRef = Arc<Component>;

/// Insertion point for [`Component::insert_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Absolute index, clamped to the child count.
    At(usize),
    /// Before the first sibling of the given kind; appends when none
    /// exists.
    BeforeKind(ComponentKind),
    /// After the first sibling of the given kind; appends when none
    /// exists.
    AfterKind(ComponentKind),
}

#[derive(Default)]
struct Links {
    parent: Weak<Component>,
    model: Option<Weak<Model>>,
    children: Vec<ComponentRef>,
    populated: bool,
    detached: bool,
}

/// A tree node of the document model.
pub struct Component {
    backing: Box<dyn ComponentBacking>,
    links: Mutex<Links>,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("kind", &self.kind().name())
            .field("addr", &(self as *const Component))
            .finish()
    }
}

impl Component {
    pub fn new(backing: Box<dyn ComponentBacking>) -> ComponentRef {
        Arc::new(Self {
            backing,
            links: Mutex::new(Links::default()),
        })
    }

    pub fn kind(&self) -> ComponentKind {
        self.backing.kind()
    }

    pub fn backing(&self) -> &dyn ComponentBacking {
        &*self.backing
    }

    /// The node's parent, or `None` at the root or when detached.
    pub fn parent(&self) -> Option<ComponentRef> {
        self.links.lock().unwrap().parent.upgrade()
    }

    /// The model this node is attached to. `None` once detached.
    pub fn model(&self) -> Option<Arc<Model>> {
        self.links.lock().unwrap().model.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_attached(&self) -> bool {
        self.links.lock().unwrap().model.is_some()
    }

    /// True once the node has been removed from an attached tree.
    /// Detached nodes cannot be re-attached outside undo/redo replay.
    pub fn is_detached(&self) -> bool {
        self.links.lock().unwrap().detached
    }

    /// Ordered children, populating from the binding on first access.
    pub fn children(self: &Arc<Self>) -> Vec<ComponentRef> {
        self.ensure_populated();
        self.links.lock().unwrap().children.clone()
    }

    /// Children assignable to `kind`.
    pub fn children_of_type(self: &Arc<Self>, kind: ComponentKind) -> Vec<ComponentRef> {
        self.children()
            .into_iter()
            .filter(|c| c.backing.is_kind(kind))
            .collect()
    }

    pub fn children_count(self: &Arc<Self>) -> usize {
        self.ensure_populated();
        self.links.lock().unwrap().children.len()
    }

    pub fn index_of_child(self: &Arc<Self>, child: &ComponentRef) -> Option<usize> {
        self.ensure_populated();
        self.links
            .lock()
            .unwrap()
            .children
            .iter()
            .position(|c| Arc::ptr_eq(c, child))
    }

    /// Append `child` as the last child.
    pub fn append_child(self: &Arc<Self>, child: ComponentRef) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        self.ensure_populated();
        let index = self.links.lock().unwrap().children.len();
        self.insert_internal(&model, index, child, true)
    }

    /// Insert `child` at an absolute index or relative to the first
    /// occurrence of a sibling kind.
    pub fn insert_child(
        self: &Arc<Self>,
        at: InsertPosition,
        child: ComponentRef,
    ) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        self.ensure_populated();
        let index = {
            let links = self.links.lock().unwrap();
            let len = links.children.len();
            match at {
                InsertPosition::At(index) => index.min(len),
                InsertPosition::BeforeKind(kind) => links
                    .children
                    .iter()
                    .position(|c| c.kind() == kind)
                    .unwrap_or(len),
                InsertPosition::AfterKind(kind) => links
                    .children
                    .iter()
                    .position(|c| c.kind() == kind)
                    .map(|i| i + 1)
                    .unwrap_or(len),
            }
        };
        self.insert_internal(&model, index, child, true)
    }

    /// Insert `child` before the run of siblings whose kind appears
    /// in `priorities`.
    pub fn add_before(
        self: &Arc<Self>,
        child: ComponentRef,
        priorities: &[ComponentKind],
    ) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        self.ensure_populated();
        let index = {
            let links = self.links.lock().unwrap();
            position_before(&links.children, child.kind(), priorities)
        };
        self.insert_internal(&model, index, child, true)
    }

    /// Insert `child` after the run of siblings whose kind appears in
    /// `priorities`.
    pub fn add_after(
        self: &Arc<Self>,
        child: ComponentRef,
        priorities: &[ComponentKind],
    ) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        self.ensure_populated();
        let index = {
            let links = self.links.lock().unwrap();
            position_after(&links.children, child.kind(), priorities)
        };
        self.insert_internal(&model, index, child, true)
    }

    /// Remove `child` from this node, clearing its parent and model
    /// links and marking it detached.
    pub fn remove_child(self: &Arc<Self>, child: &ComponentRef) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        self.ensure_populated();
        self.remove_internal(&model, child, true)
    }

    /// Replace all children assignable to `kind` with `new`, inserted
    /// after the priority run.
    pub fn set_child(
        self: &Arc<Self>,
        kind: ComponentKind,
        new: Option<ComponentRef>,
        priorities: &[ComponentKind],
    ) -> Result<(), ModelError> {
        self.replace_of_kind(kind, new, priorities, Side::After)
    }

    /// Replace all children assignable to `kind` with `new`, inserted
    /// before the priority run.
    pub fn set_child_before(
        self: &Arc<Self>,
        kind: ComponentKind,
        new: Option<ComponentRef>,
        priorities: &[ComponentKind],
    ) -> Result<(), ModelError> {
        self.replace_of_kind(kind, new, priorities, Side::Before)
    }

    /// Replace all children assignable to `kind` with `new`, inserted
    /// after the priority run.
    pub fn set_child_after(
        self: &Arc<Self>,
        kind: ComponentKind,
        new: Option<ComponentRef>,
        priorities: &[ComponentKind],
    ) -> Result<(), ModelError> {
        self.replace_of_kind(kind, new, priorities, Side::After)
    }

    /// Set the named value on this node through the backing.
    pub fn set_value(self: &Arc<Self>, name: &str, value: Option<Value>) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        let old = self.backing.quiet_set_value(name, value.clone());
        model.record_mutation(
            PropertyChange {
                source: self.clone(),
                property: name.to_string(),
                old: old.clone().map(PropertyValue::Value).unwrap_or(PropertyValue::Absent),
                new: value.clone().map(PropertyValue::Value).unwrap_or(PropertyValue::Absent),
            },
            StructuralEvent {
                node: self.clone(),
                change: StructuralChange::ValueChanged,
            },
            Some(crate::edits::Edit::SetValue {
                node: self.clone(),
                name: name.to_string(),
                old,
                new: value,
            }),
        )
    }

    fn replace_of_kind(
        self: &Arc<Self>,
        kind: ComponentKind,
        new: Option<ComponentRef>,
        priorities: &[ComponentKind],
        side: Side,
    ) -> Result<(), ModelError> {
        let model = self.require_model()?;
        model.check_write_access()?;
        self.ensure_populated();

        let existing: Vec<ComponentRef> = {
            let links = self.links.lock().unwrap();
            links
                .children
                .iter()
                .filter(|c| c.backing.is_kind(kind))
                .cloned()
                .collect()
        };
        let last_removed = existing.last().cloned();
        for child in &existing {
            self.remove_internal(&model, child, false)?;
        }

        let inserted = match new {
            Some(child) => {
                let index = {
                    let links = self.links.lock().unwrap();
                    match side {
                        Side::Before => position_before(&links.children, child.kind(), priorities),
                        Side::After => position_after(&links.children, child.kind(), priorities),
                    }
                };
                self.insert_internal(&model, index, child.clone(), false)?;
                Some(child)
            }
            None => None,
        };

        model.record_property(PropertyChange {
            source: self.clone(),
            property: kind.name().to_string(),
            old: last_removed
                .map(PropertyValue::Component)
                .unwrap_or(PropertyValue::Absent),
            new: inserted
                .map(PropertyValue::Component)
                .unwrap_or(PropertyValue::Absent),
        })
    }

    /// Insert already validated against the open transaction. When
    /// `fine_event` is false only the coarse event and the edit are
    /// recorded (`set_child` fires its single property change itself).
    fn insert_internal(
        self: &Arc<Self>,
        model: &Arc<Model>,
        index: usize,
        child: ComponentRef,
        fine_event: bool,
    ) -> Result<(), ModelError> {
        if Arc::ptr_eq(self, &child) {
            return Err(ModelError::InvalidArgument(
                "cannot add a component to itself".to_string(),
            ));
        }
        {
            let links = self.links.lock().unwrap();
            if links.children.iter().any(|c| Arc::ptr_eq(c, &child)) {
                return Err(ModelError::InvalidArgument(
                    "child is already present".to_string(),
                ));
            }
        }
        {
            let mut child_links = child.links.lock().unwrap();
            if child_links.detached && !model.is_replaying() {
                return Err(ModelError::InvalidArgument(
                    "cannot re-attach a detached component".to_string(),
                ));
            }
            if child_links.parent.upgrade().is_some() {
                return Err(ModelError::InvalidArgument(
                    "child already has a parent".to_string(),
                ));
            }
            child_links.detached = false;
            child_links.parent = Arc::downgrade(self);
            child_links.model = Some(Arc::downgrade(model));
        }
        child.stamp_descendants(Some(model));

        let index = {
            let mut links = self.links.lock().unwrap();
            let index = index.min(links.children.len());
            if index == links.children.len() {
                self.backing.quiet_append(&child);
            } else {
                self.backing.quiet_insert(index, &child);
            }
            links.children.insert(index, child.clone());
            index
        };

        let structural = StructuralEvent {
            node: self.clone(),
            change: StructuralChange::ChildAdded,
        };
        let edit = Some(crate::edits::Edit::AddChild {
            parent: self.clone(),
            child: child.clone(),
            index,
        });
        if fine_event {
            model.record_mutation(
                PropertyChange {
                    source: self.clone(),
                    property: child.kind().name().to_string(),
                    old: PropertyValue::Absent,
                    new: PropertyValue::Component(child),
                },
                structural,
                edit,
            )
        } else {
            model.record_structural(structural)?;
            model.record_edit(edit)
        }
    }

    fn remove_internal(
        self: &Arc<Self>,
        model: &Arc<Model>,
        child: &ComponentRef,
        fine_event: bool,
    ) -> Result<(), ModelError> {
        let index = {
            let mut links = self.links.lock().unwrap();
            let Some(index) = links.children.iter().position(|c| Arc::ptr_eq(c, child)) else {
                return Err(ModelError::InvalidArgument(
                    "not a child of this component".to_string(),
                ));
            };
            self.backing.quiet_remove(child);
            links.children.remove(index);
            index
        };
        {
            let mut child_links = child.links.lock().unwrap();
            child_links.parent = Weak::new();
            child_links.model = None;
            child_links.detached = true;
        }
        child.stamp_descendants(None);

        let structural = StructuralEvent {
            node: self.clone(),
            change: StructuralChange::ChildRemoved,
        };
        let edit = Some(crate::edits::Edit::RemoveChild {
            parent: self.clone(),
            child: child.clone(),
            index,
        });
        if fine_event {
            model.record_mutation(
                PropertyChange {
                    source: self.clone(),
                    property: child.kind().name().to_string(),
                    old: PropertyValue::Component(child.clone()),
                    new: PropertyValue::Absent,
                },
                structural,
                edit,
            )
        } else {
            model.record_structural(structural)?;
            model.record_edit(edit)
        }
    }

    /// Populate the memoized child list from the binding. Guarded so
    /// population happens at most once per node, even if the backing
    /// panics mid-way.
    fn ensure_populated(self: &Arc<Self>) {
        let mut links = self.links.lock().unwrap();
        if links.populated {
            return;
        }
        links.populated = true;
        let children = self.backing.populate_children();
        let model = links.model.clone();
        for child in &children {
            let mut child_links = child.links.lock().unwrap();
            child_links.parent = Arc::downgrade(self);
            child_links.model = model.clone();
        }
        links.children = children;
    }

    /// Stamp (or clear) the model link across the already-populated
    /// subtree below this node.
    fn stamp_descendants(self: &Arc<Self>, model: Option<&Arc<Model>>) {
        let children: Vec<ComponentRef> = {
            let links = self.links.lock().unwrap();
            if !links.populated {
                return;
            }
            links.children.clone()
        };
        for child in children {
            {
                let mut child_links = child.links.lock().unwrap();
                child_links.model = model.map(Arc::downgrade);
            }
            child.stamp_descendants(model);
        }
    }

    /// Attach this node as the root of `model`. Called once by the
    /// model when the binding hands over the root.
    pub(crate) fn attach_root(self: &Arc<Self>, model: &Arc<Model>) {
        {
            let mut links = self.links.lock().unwrap();
            links.model = Some(Arc::downgrade(model));
        }
        self.stamp_descendants(Some(model));
    }

    fn require_model(&self) -> Result<Arc<Model>, ModelError> {
        self.model().ok_or_else(|| {
            ModelError::IllegalTransactionState("component is not attached to a model".to_string())
        })
    }
}

#[derive(Clone, Copy)]
enum Side {
    Before,
    After,
}

/// Position for `add_before`: after existing children of the same
/// concrete kind, else before the first priority-kind sibling. An
/// empty priority list or an empty child list means append.
fn position_before(
    children: &[ComponentRef],
    kind: ComponentKind,
    priorities: &[ComponentKind],
) -> usize {
    if children.is_empty() || priorities.is_empty() {
        return children.len();
    }
    if let Some(i) = children.iter().rposition(|c| c.kind() == kind) {
        return i + 1;
    }
    children
        .iter()
        .position(|c| priorities.contains(&c.kind()))
        .unwrap_or(children.len())
}

/// Position for `add_after`: after the last same-kind or
/// priority-kind sibling, whichever is later. An empty priority list
/// or an empty child list means append.
fn position_after(
    children: &[ComponentRef],
    kind: ComponentKind,
    priorities: &[ComponentKind],
) -> usize {
    if children.is_empty() || priorities.is_empty() {
        return children.len();
    }
    let same = children.iter().rposition(|c| c.kind() == kind).map(|i| i + 1);
    let run = children
        .iter()
        .rposition(|c| priorities.contains(&c.kind()))
        .map(|i| i + 1);
    match (same, run) {
        (None, None) => children.len(),
        _ => same.unwrap_or(0).max(run.unwrap_or(0)),
    }
}
