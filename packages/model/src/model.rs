//! # Model
//!
//! Owns the single-writer transaction state machine, the event
//! firing loop, the reversible edit log, and the sync state machine.
//!
//! ## Transaction Discipline
//!
//! At most one transaction is open per model at any instant, owned by
//! the thread that opened it. `start_transaction` blocks on a
//! condition variable until the current owner releases; nesting from
//! the owning thread is an error. Mutation primitives verify the
//! calling thread owns the open transaction before touching the tree.
//!
//! ## Firing
//!
//! Closing a transaction delivers buffered events to a fixed point:
//! each pass snapshots and clears the pending queues, then delivers
//! the snapshot with the model lock released. Listeners may mutate
//! the model; their events land in a strictly later pass, never
//! mid-pass. The loop carries a defensive pass cap: a listener chain
//! that never converges stops with an error instead of spinning.
//!
//! ## Sync States
//!
//! `Valid ⇄ NotSynced` on recoverable parse outcomes,
//! `* → NotWellFormed` on unrecoverable ones, `NotWellFormed → Valid`
//! only via a later successful `sync()`. Mutation is forbidden while
//! `NotWellFormed`; `sync()` itself runs in a privileged
//! pseudo-transaction since repairing that state is its job.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use serde::Serialize;

use crate::binding::{DocumentBinding, ModelSource, SyncOutcome};
use crate::component::{ComponentRef, InsertPosition};
use crate::edits::{Edit, EditBatch, UndoStack};
use crate::errors::ModelError;
use crate::events::{
    ListenerId, PropertyChange, PropertyListener, StructuralEvent, StructureListener,
};

/// Iteration cap for the firing loop. Convergence is the caller's
/// responsibility; the cap turns a runaway listener chain into an
/// error instead of a hang.
const MAX_FIRING_PASSES: usize = 32;

/// Sync state of a model relative to its persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelState {
    /// In-memory tree and persisted form agree.
    Valid,
    /// The persisted form is structurally corrupted; mutation is
    /// forbidden until a successful sync repairs it.
    NotWellFormed,
    /// The last sync could not reconcile, without corruption.
    NotSynced,
}

/// Listener over closed edit batches (the undo/redo hook).
pub type EditListener = Arc<dyn Fn(&EditBatch) + Send + Sync>;

/// Listener over sync-state transitions, called with (old, new).
pub type StateListener = Arc<dyn Fn(ModelState, ModelState) + Send + Sync>;

/// The edit-listener table, swappable as a unit so bulk refactors can
/// divert their edits away from normal undo-history consumers.
#[derive(Default)]
pub struct EditListenerSet(BTreeMap<ListenerId, EditListener>);

impl EditListenerSet {
    /// A set holding one listener.
    pub fn single(listener: impl Fn(&EditBatch) + Send + Sync + 'static) -> Self {
        let mut map = BTreeMap::new();
        map.insert(0, Arc::new(listener) as EditListener);
        Self(map)
    }
}

struct Transaction {
    owner: ThreadId,
    pending_properties: Vec<PropertyChange>,
    pending_structure: Vec<StructuralEvent>,
    edits: Vec<Edit>,
    produced_events: bool,
    description: Option<String>,
}

impl Transaction {
    fn new(owner: ThreadId) -> Self {
        Self {
            owner,
            pending_properties: Vec::new(),
            pending_structure: Vec::new(),
            edits: Vec::new(),
            produced_events: false,
            description: None,
        }
    }
}

struct Core {
    state: ModelState,
    txn: Option<Transaction>,
    syncing: bool,
    replaying: bool,
}

#[derive(Default)]
struct ListenerTables {
    next_id: ListenerId,
    properties: BTreeMap<ListenerId, PropertyListener>,
    structure: BTreeMap<ListenerId, StructureListener>,
    edits: EditListenerSet,
    state: BTreeMap<ListenerId, StateListener>,
}

impl ListenerTables {
    fn allocate(&mut self) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// A document model: the transactional facade over one component
/// tree and its persisted form.
pub struct Model {
    binding: Arc<dyn DocumentBinding>,
    source: Arc<dyn ModelSource>,
    core: Mutex<Core>,
    txn_released: Condvar,
    listeners: Mutex<ListenerTables>,
    undo: Mutex<UndoStack>,
    root: OnceLock<ComponentRef>,
}

enum ReplayDirection {
    Backward,
    Forward,
}

impl Model {
    /// Create a model over a source and its document binding. The
    /// model starts `NotSynced` until the first `sync()`.
    pub fn new(source: Arc<dyn ModelSource>, binding: Arc<dyn DocumentBinding>) -> Arc<Self> {
        let model = Arc::new(Self {
            binding,
            source,
            core: Mutex::new(Core {
                state: ModelState::NotSynced,
                txn: None,
                syncing: false,
                replaying: false,
            }),
            txn_released: Condvar::new(),
            listeners: Mutex::new(ListenerTables::default()),
            undo: Mutex::new(UndoStack::new()),
            root: OnceLock::new(),
        });

        // The model's own undo history is wired up as an ordinary
        // edit-log listener, so a refactor listener swap diverts it
        // together with every external undo consumer.
        let history = Arc::downgrade(&model);
        model.observe_edits(move |batch| {
            if let Some(model) = history.upgrade() {
                model.undo.lock().unwrap().push(batch.clone());
            }
        });
        model
    }

    /// Attach the root component. Set once, by the binding, when the
    /// tree is first materialized.
    pub fn set_root(self: &Arc<Self>, root: ComponentRef) -> Result<(), ModelError> {
        root.attach_root(self);
        self.root
            .set(root)
            .map_err(|_| ModelError::InvalidArgument("root is already set".to_string()))
    }

    pub fn root(&self) -> Option<ComponentRef> {
        self.root.get().cloned()
    }

    pub fn binding(&self) -> &Arc<dyn DocumentBinding> {
        &self.binding
    }

    pub fn source(&self) -> &Arc<dyn ModelSource> {
        &self.source
    }

    pub fn state(&self) -> ModelState {
        self.core.lock().unwrap().state
    }

    pub fn is_transaction_active(&self) -> bool {
        self.core.lock().unwrap().txn.is_some()
    }

    // ---- transactions ----------------------------------------------------

    /// Open the model's single write transaction, blocking until no
    /// transaction is active.
    ///
    /// Returns `Ok(false)` without opening anything when the model is
    /// `NotWellFormed` — mutation is forbidden on malformed state and
    /// only `sync()` may repair it. Nesting from the owning thread
    /// and write attempts on a read-only source are errors.
    pub fn start_transaction(&self) -> Result<bool, ModelError> {
        self.begin(false)
    }

    fn begin(&self, privileged: bool) -> Result<bool, ModelError> {
        if !privileged && !self.source.is_editable() {
            return Err(ModelError::IllegalTransactionState(
                "source is read-only".to_string(),
            ));
        }
        let me = thread::current().id();
        let mut core = self.core.lock().unwrap();
        if let Some(txn) = &core.txn {
            if txn.owner == me {
                return Err(ModelError::IllegalTransactionState(
                    "transaction already open on this thread".to_string(),
                ));
            }
        }
        while core.txn.is_some() {
            core = self.txn_released.wait(core).unwrap();
        }
        if !privileged && core.state == ModelState::NotWellFormed {
            return Ok(false);
        }
        core.txn = Some(Transaction::new(me));
        Ok(true)
    }

    /// Close the open transaction: fire buffered events to a fixed
    /// point (unless `quiet`), flush the binding if real mutation
    /// occurred outside sync, close the edit-log scope, release the
    /// transaction and wake waiters.
    ///
    /// A no-op when no transaction exists or the caller is not the
    /// owner, so calling it twice is harmless.
    pub fn end_transaction(&self, quiet: bool) -> Result<(), ModelError> {
        if !self.owns_transaction() {
            return Ok(());
        }

        let fired = if quiet { Ok(()) } else { self.fire_pending() };

        let (produced, syncing) = {
            let core = self.core.lock().unwrap();
            let txn = core.txn.as_ref();
            (
                txn.map(|t| t.produced_events).unwrap_or(false),
                core.syncing,
            )
        };
        if produced && !syncing {
            self.binding.flush();
        }

        let (edits, description, replaying) = {
            let mut core = self.core.lock().unwrap();
            let txn = core.txn.take();
            let (edits, description) = txn
                .map(|t| (t.edits, t.description))
                .unwrap_or_default();
            (edits, description, core.replaying)
        };
        self.txn_released.notify_all();

        if !replaying && !edits.is_empty() {
            let mut batch = EditBatch::new(edits);
            batch.description = description;
            let listeners: Vec<EditListener> = {
                self.listeners.lock().unwrap().edits.0.values().cloned().collect()
            };
            for listener in listeners {
                listener(&batch);
            }
        }

        fired
    }

    /// Revert the edits buffered by the open transaction, discard its
    /// pending events, and release it. Only available outside sync
    /// and undo/redo replay.
    pub fn rollback_transaction(&self) -> Result<(), ModelError> {
        {
            let core = self.core.lock().unwrap();
            if core.syncing || core.replaying {
                return Err(ModelError::IllegalTransactionState(
                    "rollback during sync or undo/redo replay".to_string(),
                ));
            }
        }
        if !self.owns_transaction() {
            return Ok(());
        }

        let edits = {
            let mut core = self.core.lock().unwrap();
            core.replaying = true;
            core.txn
                .as_mut()
                .map(|t| std::mem::take(&mut t.edits))
                .unwrap_or_default()
        };
        let reverted = edits
            .iter()
            .rev()
            .try_for_each(|edit| self.apply_edit(edit, ReplayDirection::Backward));

        {
            let mut core = self.core.lock().unwrap();
            core.replaying = false;
            core.txn = None;
        }
        self.txn_released.notify_all();
        reverted
    }

    /// Label the open transaction; the label lands on the closed
    /// edit batch (and so on the undo history entry).
    pub fn describe_transaction(&self, description: impl Into<String>) -> Result<(), ModelError> {
        let mut core = self.core.lock().unwrap();
        let txn = Self::open_txn_mut(&mut core)?;
        txn.description = Some(description.into());
        Ok(())
    }

    fn owns_transaction(&self) -> bool {
        let me = thread::current().id();
        let core = self.core.lock().unwrap();
        matches!(&core.txn, Some(txn) if txn.owner == me)
    }

    /// Deliver buffered events until a pass finds the queues empty.
    fn fire_pending(&self) -> Result<(), ModelError> {
        for pass in 0..MAX_FIRING_PASSES {
            let (properties, structure) = {
                let mut core = self.core.lock().unwrap();
                let Some(txn) = core.txn.as_mut() else {
                    return Ok(());
                };
                (
                    std::mem::take(&mut txn.pending_properties),
                    std::mem::take(&mut txn.pending_structure),
                )
            };
            if properties.is_empty() && structure.is_empty() {
                return Ok(());
            }
            if pass > 0 {
                tracing::debug!(pass, "delivering listener-induced events");
            }

            let (property_listeners, structure_listeners) = {
                let tables = self.listeners.lock().unwrap();
                (
                    tables.properties.values().cloned().collect::<Vec<_>>(),
                    tables.structure.values().cloned().collect::<Vec<_>>(),
                )
            };
            for event in &properties {
                for listener in &property_listeners {
                    listener(event);
                }
            }
            for event in &structure {
                for listener in &structure_listeners {
                    listener(event);
                }
            }
        }
        tracing::error!(
            passes = MAX_FIRING_PASSES,
            "event delivery did not converge; remaining events dropped"
        );
        Err(ModelError::IllegalTransactionState(
            "event delivery did not converge".to_string(),
        ))
    }

    // ---- sync ------------------------------------------------------------

    /// Reconcile with the persisted form inside a privileged
    /// pseudo-transaction. Runs synchronously on the calling thread;
    /// an unrecoverable binding failure moves the model to
    /// `NotWellFormed` and propagates.
    pub fn sync(self: &Arc<Self>) -> Result<(), ModelError> {
        self.begin(true)?;
        {
            self.core.lock().unwrap().syncing = true;
        }

        let outcome = self.binding.sync(self);
        let result = match outcome {
            Ok(SyncOutcome::Synced) => {
                self.set_state(ModelState::Valid);
                Ok(())
            }
            Ok(SyncOutcome::NotSynced) => {
                self.set_state(ModelState::NotSynced);
                Ok(())
            }
            Err(err) => {
                self.set_state(ModelState::NotWellFormed);
                Err(ModelError::Sync(err))
            }
        };

        let ended = self.end_transaction(false);
        {
            self.core.lock().unwrap().syncing = false;
        }
        result.and(ended)
    }

    fn set_state(&self, new: ModelState) {
        let old = {
            let mut core = self.core.lock().unwrap();
            std::mem::replace(&mut core.state, new)
        };
        if old == new {
            return;
        }
        tracing::debug!(?old, ?new, "model state changed");
        let listeners: Vec<StateListener> = {
            self.listeners.lock().unwrap().state.values().cloned().collect()
        };
        for listener in listeners {
            listener(old, new);
        }
    }

    // ---- undo / redo -----------------------------------------------------

    /// Replay the most recent edit batch backward. Returns `Ok(false)`
    /// when there is nothing to undo.
    pub fn undo(self: &Arc<Self>) -> Result<bool, ModelError> {
        let Some(batch) = self.undo.lock().unwrap().pop_undo() else {
            return Ok(false);
        };
        match self.replay(&batch, ReplayDirection::Backward) {
            Ok(()) => {
                self.undo.lock().unwrap().push_redo(batch);
                Ok(true)
            }
            Err(err) => {
                // Keep the batch undoable rather than dropping it.
                self.undo.lock().unwrap().restore_undone(batch);
                Err(err)
            }
        }
    }

    /// Replay the most recently undone batch forward. Returns
    /// `Ok(false)` when there is nothing to redo.
    pub fn redo(self: &Arc<Self>) -> Result<bool, ModelError> {
        let Some(batch) = self.undo.lock().unwrap().pop_redo() else {
            return Ok(false);
        };
        match self.replay(&batch, ReplayDirection::Forward) {
            Ok(()) => {
                self.undo.lock().unwrap().restore_undone(batch);
                Ok(true)
            }
            Err(err) => {
                self.undo.lock().unwrap().push_redo(batch);
                Err(err)
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        self.undo.lock().unwrap().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.lock().unwrap().can_redo()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo.lock().unwrap().undo_description().map(str::to_string)
    }

    fn replay(self: &Arc<Self>, batch: &EditBatch, direction: ReplayDirection) -> Result<(), ModelError> {
        self.begin(true)?;
        if let Err(err) = self.binding.prepare_for_undo_redo() {
            self.end_transaction(true)?;
            return Err(ModelError::UndoReplay(err.to_string()));
        }
        {
            self.core.lock().unwrap().replaying = true;
        }

        let applied = match direction {
            ReplayDirection::Backward => batch
                .edits
                .iter()
                .rev()
                .try_for_each(|edit| self.apply_edit(edit, ReplayDirection::Backward)),
            ReplayDirection::Forward => batch
                .edits
                .iter()
                .try_for_each(|edit| self.apply_edit(edit, ReplayDirection::Forward)),
        };

        let ended = self.end_transaction(false);
        {
            self.core.lock().unwrap().replaying = false;
        }
        self.binding.finish_undo_redo();

        applied
            .map_err(|e| ModelError::UndoReplay(e.to_string()))
            .and(ended)
    }

    /// Replay one edit through the same mutation primitives that
    /// recorded it. Re-logging is suppressed by the replay flag.
    fn apply_edit(&self, edit: &Edit, direction: ReplayDirection) -> Result<(), ModelError> {
        match (edit, direction) {
            (Edit::AddChild { parent, child, .. }, ReplayDirection::Backward) => {
                parent.remove_child(child)
            }
            (Edit::AddChild { parent, child, index }, ReplayDirection::Forward) => {
                parent.insert_child(InsertPosition::At(*index), child.clone())
            }
            (Edit::RemoveChild { parent, child, index }, ReplayDirection::Backward) => {
                parent.insert_child(InsertPosition::At(*index), child.clone())
            }
            (Edit::RemoveChild { parent, child, .. }, ReplayDirection::Forward) => {
                parent.remove_child(child)
            }
            (Edit::SetValue { node, name, old, .. }, ReplayDirection::Backward) => {
                node.set_value(name, old.clone())
            }
            (Edit::SetValue { node, name, new, .. }, ReplayDirection::Forward) => {
                node.set_value(name, new.clone())
            }
        }
    }

    // ---- listeners -------------------------------------------------------

    /// Register a fine-grained attribute-change listener.
    pub fn observe_properties(
        &self,
        listener: impl Fn(&PropertyChange) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut tables = self.listeners.lock().unwrap();
        let id = tables.allocate();
        tables.properties.insert(id, Arc::new(listener));
        id
    }

    /// Register a coarse-grained structural listener.
    pub fn observe_structure(
        &self,
        listener: impl Fn(&StructuralEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut tables = self.listeners.lock().unwrap();
        let id = tables.allocate();
        tables.structure.insert(id, Arc::new(listener));
        id
    }

    /// Register an edit-log listener (the undo/redo hook).
    pub fn observe_edits(
        &self,
        listener: impl Fn(&EditBatch) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut tables = self.listeners.lock().unwrap();
        let id = tables.allocate();
        tables.edits.0.insert(id, Arc::new(listener));
        id
    }

    /// Register a sync-state transition listener.
    pub fn observe_state(
        &self,
        listener: impl Fn(ModelState, ModelState) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut tables = self.listeners.lock().unwrap();
        let id = tables.allocate();
        tables.state.insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener registered through any of the `observe_*`
    /// methods.
    pub fn unobserve(&self, id: ListenerId) {
        let mut tables = self.listeners.lock().unwrap();
        tables.properties.remove(&id);
        tables.structure.remove(&id);
        tables.edits.0.remove(&id);
        tables.state.remove(&id);
    }

    /// Swap the whole edit-listener set, returning the previous one.
    /// Bulk refactors divert their edits this way and restore the
    /// original set afterwards.
    pub fn swap_edit_listeners(&self, replacement: EditListenerSet) -> EditListenerSet {
        let mut tables = self.listeners.lock().unwrap();
        std::mem::replace(&mut tables.edits, replacement)
    }

    // ---- recording (called by component mutators) ------------------------

    pub(crate) fn check_write_access(&self) -> Result<(), ModelError> {
        let me = thread::current().id();
        let core = self.core.lock().unwrap();
        match &core.txn {
            Some(txn) if txn.owner == me => Ok(()),
            Some(_) => Err(ModelError::IllegalTransactionState(
                "transaction is owned by another thread".to_string(),
            )),
            None => Err(ModelError::IllegalTransactionState(
                "no open transaction".to_string(),
            )),
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.core.lock().unwrap().replaying
    }

    pub(crate) fn record_mutation(
        &self,
        property: PropertyChange,
        structural: StructuralEvent,
        edit: Option<Edit>,
    ) -> Result<(), ModelError> {
        let mut core = self.core.lock().unwrap();
        // Replay must not re-log its own edits, and sync
        // repopulation is not part of the user-facing history.
        let suppress_log = core.replaying || core.syncing;
        let txn = Self::open_txn_mut(&mut core)?;
        txn.produced_events = true;
        txn.pending_properties.push(property);
        if !txn.pending_structure.iter().any(|e| e.same_slot(&structural)) {
            txn.pending_structure.push(structural);
        }
        if let Some(edit) = edit {
            if !suppress_log {
                txn.edits.push(edit);
            }
        }
        Ok(())
    }

    pub(crate) fn record_property(&self, property: PropertyChange) -> Result<(), ModelError> {
        let mut core = self.core.lock().unwrap();
        let txn = Self::open_txn_mut(&mut core)?;
        txn.produced_events = true;
        txn.pending_properties.push(property);
        Ok(())
    }

    pub(crate) fn record_structural(&self, structural: StructuralEvent) -> Result<(), ModelError> {
        let mut core = self.core.lock().unwrap();
        let txn = Self::open_txn_mut(&mut core)?;
        txn.produced_events = true;
        if !txn.pending_structure.iter().any(|e| e.same_slot(&structural)) {
            txn.pending_structure.push(structural);
        }
        Ok(())
    }

    pub(crate) fn record_edit(&self, edit: Option<Edit>) -> Result<(), ModelError> {
        let mut core = self.core.lock().unwrap();
        let suppress_log = core.replaying || core.syncing;
        let txn = Self::open_txn_mut(&mut core)?;
        if let Some(edit) = edit {
            if !suppress_log {
                txn.edits.push(edit);
            }
        }
        Ok(())
    }

    fn open_txn_mut(core: &mut Core) -> Result<&mut Transaction, ModelError> {
        let me = thread::current().id();
        match core.txn.as_mut() {
            Some(txn) if txn.owner == me => Ok(txn),
            Some(_) => Err(ModelError::IllegalTransactionState(
                "transaction is owned by another thread".to_string(),
            )),
            None => Err(ModelError::IllegalTransactionState(
                "no open transaction".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock().unwrap();
        f.debug_struct("Model")
            .field("state", &core.state)
            .field("transaction_active", &core.txn.is_some())
            .finish()
    }
}
