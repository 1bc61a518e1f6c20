//! # Reversible Edit Log
//!
//! Tracks the edits buffered by a transaction and enables undo/redo.
//!
//! ## Design
//!
//! - Each mutation primitive appends one [`Edit`] carrying enough of
//!   the old and new state to be replayed in either direction
//! - Closing a transaction pushes the accumulated edits as one
//!   [`EditBatch`] (one undo step)
//! - Undo replays a batch backward, redo replays it forward, both
//!   through the same mutation primitives with re-logging suppressed
//! - New batches clear the redo stack

use serde_json::Value;

use crate::component::ComponentRef;

/// One reversible entry in a transaction's edit log.
///
/// Entries hold strong references to the nodes they touched so a
/// removed subtree stays alive for as long as it can be restored.
#[derive(Clone)]
pub enum Edit {
    AddChild {
        parent: ComponentRef,
        child: ComponentRef,
        index: usize,
    },
    RemoveChild {
        parent: ComponentRef,
        child: ComponentRef,
        index: usize,
    },
    SetValue {
        node: ComponentRef,
        name: String,
        old: Option<Value>,
        new: Option<Value>,
    },
}

impl Edit {
    /// Debug name of this edit kind.
    pub fn name(&self) -> &'static str {
        match self {
            Edit::AddChild { .. } => "add-child",
            Edit::RemoveChild { .. } => "remove-child",
            Edit::SetValue { .. } => "set-value",
        }
    }
}

impl std::fmt::Debug for Edit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edit::AddChild { child, index, .. } => {
                write!(f, "AddChild({} @ {index})", child.kind())
            }
            Edit::RemoveChild { child, index, .. } => {
                write!(f, "RemoveChild({} @ {index})", child.kind())
            }
            Edit::SetValue { name, .. } => write!(f, "SetValue({name})"),
        }
    }
}

/// A group of edits that undo/redo together (one transaction scope).
#[derive(Debug, Clone, Default)]
pub struct EditBatch {
    /// The edits in application order.
    pub edits: Vec<Edit>,

    /// Optional description of this batch.
    pub description: Option<String>,
}

impl EditBatch {
    pub fn new(edits: Vec<Edit>) -> Self {
        Self {
            edits,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

const DEFAULT_MAX_LEVELS: usize = 100;

/// Undo/redo stack over closed edit batches.
#[derive(Debug)]
pub struct UndoStack {
    undo_stack: Vec<EditBatch>,
    redo_stack: Vec<EditBatch>,
    max_levels: usize,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoStack {
    pub fn new() -> Self {
        Self::with_max_levels(DEFAULT_MAX_LEVELS)
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_levels,
        }
    }

    /// Record a freshly closed batch. Clears the redo stack and
    /// evicts the oldest batch beyond the level cap.
    pub fn push(&mut self, batch: EditBatch) {
        self.redo_stack.clear();
        self.undo_stack.push(batch);
        if self.undo_stack.len() > self.max_levels {
            self.undo_stack.remove(0);
        }
    }

    /// Take the most recent batch for backward replay.
    pub fn pop_undo(&mut self) -> Option<EditBatch> {
        self.undo_stack.pop()
    }

    /// Park an undone batch for redo.
    pub fn push_redo(&mut self, batch: EditBatch) {
        self.redo_stack.push(batch);
    }

    /// Take the most recently undone batch for forward replay.
    pub fn pop_redo(&mut self) -> Option<EditBatch> {
        self.redo_stack.pop()
    }

    /// Restore a redone batch to the undo stack. Unlike [`push`],
    /// this keeps the remaining redo entries intact.
    ///
    /// [`push`]: UndoStack::push
    pub fn restore_undone(&mut self, batch: EditBatch) {
        self.undo_stack.push(batch);
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.redo_stack.len()
    }

    /// Description of the batch `undo` would replay next.
    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.last().and_then(|b| b.description.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> EditBatch {
        EditBatch::new(Vec::new()).with_description(format!("batch {n}"))
    }

    #[test]
    fn test_push_clears_redo() {
        let mut stack = UndoStack::new();
        stack.push(batch(0));
        let undone = stack.pop_undo().unwrap();
        stack.push_redo(undone);
        assert_eq!(stack.redo_levels(), 1);

        stack.push(batch(1));
        assert_eq!(stack.redo_levels(), 0);
        assert_eq!(stack.undo_levels(), 1);
    }

    #[test]
    fn test_restore_undone_keeps_redo() {
        let mut stack = UndoStack::new();
        stack.push(batch(0));
        stack.push(batch(1));

        // Undo both.
        for _ in 0..2 {
            let b = stack.pop_undo().unwrap();
            stack.push_redo(b);
        }
        assert_eq!(stack.redo_levels(), 2);

        // Redo one; the other stays redoable.
        let b = stack.pop_redo().unwrap();
        stack.restore_undone(b);
        assert_eq!(stack.redo_levels(), 1);
        assert_eq!(stack.undo_levels(), 1);
    }

    #[test]
    fn test_max_levels_enforced() {
        let mut stack = UndoStack::with_max_levels(2);
        for n in 0..3 {
            stack.push(batch(n));
        }
        assert_eq!(stack.undo_levels(), 2);
        assert_eq!(stack.undo_description(), Some("batch 2"));
    }
}
