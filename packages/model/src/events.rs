//! # Change Events
//!
//! Two granularities of notification, both buffered on the open
//! transaction and delivered in firing passes when it closes:
//!
//! - [`PropertyChange`]: fine-grained, one per mutation, carrying the
//!   old and new value of a named property.
//! - [`StructuralEvent`]: coarse-grained, one of
//!   `ChildAdded`/`ChildRemoved`/`ValueChanged` per node. Within one
//!   firing pass, duplicates for the same (node, change) pair
//!   coalesce into a single delivery.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::component::ComponentRef;

/// Value slot of a fine-grained change. Attribute-shaped properties
/// carry a JSON value; child-shaped properties carry the node itself.
#[derive(Clone)]
pub enum PropertyValue {
    Absent,
    Value(Value),
    Component(ComponentRef),
}

impl PropertyValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, PropertyValue::Absent)
    }

    pub fn as_component(&self) -> Option<&ComponentRef> {
        match self {
            PropertyValue::Component(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PropertyValue::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Absent, PropertyValue::Absent) => true,
            (PropertyValue::Value(a), PropertyValue::Value(b)) => a == b,
            (PropertyValue::Component(a), PropertyValue::Component(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Absent => write!(f, "Absent"),
            PropertyValue::Value(value) => write!(f, "Value({value})"),
            PropertyValue::Component(node) => write!(f, "Component({})", node.kind()),
        }
    }
}

/// Fine-grained attribute change: old/new value per named property.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub source: ComponentRef,
    pub property: String,
    pub old: PropertyValue,
    pub new: PropertyValue,
}

/// Coarse-grained structural change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StructuralChange {
    ChildAdded,
    ChildRemoved,
    ValueChanged,
}

/// Coarse-grained structural event, delivered per node.
#[derive(Debug, Clone)]
pub struct StructuralEvent {
    pub node: ComponentRef,
    pub change: StructuralChange,
}

impl StructuralEvent {
    /// Coalescing identity: same node, same change kind.
    pub(crate) fn same_slot(&self, other: &StructuralEvent) -> bool {
        self.change == other.change && Arc::ptr_eq(&self.node, &other.node)
    }
}

/// Handle for removing a registered listener.
pub type ListenerId = u64;

pub(crate) type PropertyListener = Arc<dyn Fn(&PropertyChange) + Send + Sync>;
pub(crate) type StructureListener = Arc<dyn Fn(&StructuralEvent) + Send + Sync>;
