//! # Folio Model
//!
//! Transactional document-component model: a tree of mutable nodes
//! backed by an external persisted representation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ binding: persisted form ↔ tree (capability) │
//! └─────────────────────────────────────────────┘
//!                     ↕
//! ┌─────────────────────────────────────────────┐
//! │ model: transactions + events + undo         │
//! │  - single-writer transaction state machine  │
//! │  - coalesced firing to a fixed point        │
//! │  - reversible edit log, undo/redo replay    │
//! │  - sync state machine                       │
//! └─────────────────────────────────────────────┘
//!                     ↕
//! ┌─────────────────────────────────────────────┐
//! │ component: tree nodes, lazy population      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **One writer**: at most one open transaction per model, owned
//!    by the thread that opened it
//! 2. **No half-applied state observable**: events buffer on the
//!    transaction and fire only when it closes
//! 3. **Listeners may mutate**: listener-induced events land in a
//!    later firing pass, never mid-pass
//! 4. **Format-agnostic**: parsing and serialization live behind the
//!    [`DocumentBinding`] capability
//!
//! ## Usage
//!
//! ```rust,ignore
//! use folio_model::{Model, InsertPosition};
//!
//! let model = registry.get_model(source)?;
//! if model.start_transaction()? {
//!     let root = model.root().unwrap();
//!     root.append_child(child)?;
//!     model.end_transaction(false)?;
//! }
//! ```

mod binding;
mod component;
mod edits;
mod errors;
mod events;
mod model;
mod reference;

#[cfg(test)]
mod testutil;

pub use binding::{ComponentBacking, DocumentBinding, ModelSource, SyncOutcome};
pub use component::{Component, ComponentKind, ComponentRef, InsertPosition};
pub use edits::{Edit, EditBatch, UndoStack};
pub use errors::{ModelError, SyncError};
pub use events::{
    ListenerId, PropertyChange, PropertyValue, StructuralChange, StructuralEvent,
};
pub use model::{EditListener, EditListenerSet, Model, ModelState, StateListener};
pub use reference::{Reference, ReferenceResolver, ResolveError};
