//! # Capability Traits
//!
//! The model core never parses or serializes the persisted form
//! itself. Everything format-specific is consumed through the traits
//! in this module:
//!
//! - [`DocumentBinding`]: the persisted-form side of a model — parse
//!   (`sync`), write-back (`flush`), and the bookkeeping hooks the
//!   transaction machinery calls around undo/redo and auto-sync.
//! - [`ModelSource`]: the opaque handle a model was opened from, with
//!   an editability flag and an identity key used for registry
//!   caching.
//! - [`ComponentBacking`]: the per-node structural extension point.
//!   Concrete node types implement the quiet primitives; the generic
//!   [`crate::Component`] wrapper supplies transaction checks, link
//!   stamping, event enqueueing and edit logging on top.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::component::{ComponentKind, ComponentRef};
use crate::errors::SyncError;
use crate::model::Model;

/// Result of a successful [`DocumentBinding::sync`] pass.
///
/// `NotSynced` is a recoverable parse failure: the persisted form
/// could not be reconciled but the structure is not corrupted.
/// Unrecoverable corruption is reported as `Err(SyncError)` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    Synced,
    NotSynced,
}

/// The persisted-form capability a model is constructed over.
///
/// `sync` runs inside the model's privileged pseudo-transaction and
/// may freely mutate the component tree; the mutations are delivered
/// to listeners when the pseudo-transaction closes.
pub trait DocumentBinding: Send + Sync {
    /// Reconcile the in-memory tree with the persisted form.
    fn sync(&self, model: &Arc<Model>) -> Result<SyncOutcome, SyncError>;

    /// Write buffered in-memory mutations back to the persisted form.
    fn flush(&self);

    /// Cheap pre-sync step, safe to call from the sweep thread.
    fn prepare_sync(&self);

    /// Bracket hooks around undo/redo replay.
    fn prepare_for_undo_redo(&self) -> Result<(), SyncError>;
    fn finish_undo_redo(&self);

    /// Whether the background sweep may re-sync this document.
    fn is_auto_sync(&self) -> bool;
    fn set_auto_sync(&self, on: bool);

    /// Age of the oldest unflushed modification, or `None` when the
    /// persisted form is clean. The sweep only re-syncs documents
    /// whose dirty age exceeds the quiescence threshold.
    fn dirty_age(&self) -> Option<Duration>;
}

/// Opaque handle a model is opened from.
pub trait ModelSource: Send + Sync {
    /// Read-only sources reject `start_transaction`.
    fn is_editable(&self) -> bool;

    /// Default cache identity; registries may override the key
    /// extraction per binding.
    fn identity_key(&self) -> String;
}

/// Structural extension point implemented by each concrete node type.
///
/// The quiet primitives mutate the node's persisted-side structure
/// only — no notification, no link stamping, no logging. They are
/// never called directly by model consumers; the generic component
/// layer wraps each of them exactly once per public mutation.
///
/// Implementations must not call back into the generic component
/// layer (the calling node's lock is held).
pub trait ComponentBacking: Send + Sync + 'static {
    /// Concrete type tag of this node.
    fn kind(&self) -> ComponentKind;

    /// Assignability test used by `children_of_type` and
    /// `set_child`. Defaults to concrete-kind equality; node types
    /// that stand in for several kinds override this.
    fn is_kind(&self, kind: ComponentKind) -> bool {
        self.kind() == kind
    }

    /// Append `child` to the persisted-side structural list.
    fn quiet_append(&self, child: &ComponentRef);

    /// Insert `child` at `index` in the persisted-side structural list.
    fn quiet_insert(&self, index: usize, child: &ComponentRef);

    /// Remove `child` from the persisted-side structural list.
    fn quiet_remove(&self, child: &ComponentRef);

    /// Materialize this node's children from the persisted form.
    /// Called at most once per node, under the node's lock.
    fn populate_children(&self) -> Vec<ComponentRef>;

    /// Replace the named value in the persisted form, returning the
    /// previous one.
    fn quiet_set_value(&self, name: &str, value: Option<Value>) -> Option<Value>;
}
