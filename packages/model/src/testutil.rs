//! Shared fixtures for the unit tests: a bare tree node backing, a
//! scriptable document binding, and an in-memory source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::binding::{ComponentBacking, DocumentBinding, ModelSource, SyncOutcome};
use crate::component::{Component, ComponentKind, ComponentRef};
use crate::errors::SyncError;
use crate::model::Model;

pub(crate) const ROOT: ComponentKind = ComponentKind::new("root");
pub(crate) const WIDGET: ComponentKind = ComponentKind::new("widget");
pub(crate) const PANEL: ComponentKind = ComponentKind::new("panel");
pub(crate) const LABEL: ComponentKind = ComponentKind::new("label");

/// Minimal node backing: records quiet calls, stores values, and
/// hands out a preset child list on population.
pub(crate) struct TestNode {
    kind: ComponentKind,
    extra_kinds: Vec<ComponentKind>,
    initial: Mutex<Vec<ComponentRef>>,
    quiet_calls: Arc<Mutex<Vec<&'static str>>>,
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl TestNode {
    pub(crate) fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            extra_kinds: Vec::new(),
            initial: Mutex::new(Vec::new()),
            quiet_calls: Arc::new(Mutex::new(Vec::new())),
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle for asserting which quiet primitives ran, usable after
    /// the backing moves into a component.
    pub(crate) fn call_log(&self) -> Arc<Mutex<Vec<&'static str>>> {
        self.quiet_calls.clone()
    }

    /// Handle onto the persisted-side value map.
    pub(crate) fn value_store(&self) -> Arc<Mutex<HashMap<String, Value>>> {
        self.values.clone()
    }

    pub(crate) fn with_initial_children(kind: ComponentKind, children: Vec<ComponentRef>) -> Self {
        let node = Self::new(kind);
        *node.initial.lock().unwrap() = children;
        node
    }

    /// Additional kinds this node is assignable to.
    pub(crate) fn also_kind(mut self, kind: ComponentKind) -> Self {
        self.extra_kinds.push(kind);
        self
    }
}

impl ComponentBacking for TestNode {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn is_kind(&self, kind: ComponentKind) -> bool {
        self.kind == kind || self.extra_kinds.contains(&kind)
    }

    fn quiet_append(&self, _child: &ComponentRef) {
        self.quiet_calls.lock().unwrap().push("append");
    }

    fn quiet_insert(&self, _index: usize, _child: &ComponentRef) {
        self.quiet_calls.lock().unwrap().push("insert");
    }

    fn quiet_remove(&self, _child: &ComponentRef) {
        self.quiet_calls.lock().unwrap().push("remove");
    }

    fn populate_children(&self) -> Vec<ComponentRef> {
        std::mem::take(&mut *self.initial.lock().unwrap())
    }

    fn quiet_set_value(&self, name: &str, value: Option<Value>) -> Option<Value> {
        let mut values = self.values.lock().unwrap();
        match value {
            Some(value) => values.insert(name.to_string(), value),
            None => values.remove(name),
        }
    }
}

pub(crate) fn node(kind: ComponentKind) -> ComponentRef {
    Component::new(Box::new(TestNode::new(kind)))
}

/// What the next `sync` call should report.
pub(crate) enum SyncPlan {
    Outcome(SyncOutcome),
    Malformed(&'static str),
}

/// Scriptable binding: counts flushes and syncs, reports a settable
/// dirty age, and plays back the scripted sync outcome.
pub(crate) struct TestBinding {
    pub(crate) plan: Mutex<SyncPlan>,
    pub(crate) flushes: AtomicUsize,
    pub(crate) syncs: AtomicUsize,
    auto_sync: AtomicBool,
    dirty_since: Mutex<Option<Instant>>,
}

impl TestBinding {
    pub(crate) fn new() -> Self {
        Self {
            plan: Mutex::new(SyncPlan::Outcome(SyncOutcome::Synced)),
            flushes: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            auto_sync: AtomicBool::new(true),
            dirty_since: Mutex::new(None),
        }
    }

    pub(crate) fn plan(&self, plan: SyncPlan) {
        *self.plan.lock().unwrap() = plan;
    }
}

impl DocumentBinding for TestBinding {
    fn sync(&self, _model: &Arc<Model>) -> Result<SyncOutcome, SyncError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        *self.dirty_since.lock().unwrap() = None;
        match &*self.plan.lock().unwrap() {
            SyncPlan::Outcome(outcome) => Ok(*outcome),
            SyncPlan::Malformed(message) => Err(SyncError::Malformed(message.to_string())),
        }
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn prepare_sync(&self) {}

    fn prepare_for_undo_redo(&self) -> Result<(), SyncError> {
        Ok(())
    }

    fn finish_undo_redo(&self) {}

    fn is_auto_sync(&self) -> bool {
        self.auto_sync.load(Ordering::SeqCst)
    }

    fn set_auto_sync(&self, on: bool) {
        self.auto_sync.store(on, Ordering::SeqCst);
    }

    fn dirty_age(&self) -> Option<Duration> {
        self.dirty_since.lock().unwrap().map(|at| at.elapsed())
    }
}

pub(crate) struct TestSource {
    pub(crate) key: String,
    pub(crate) editable: bool,
}

impl TestSource {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            editable: true,
        }
    }

    pub(crate) fn read_only(key: &str) -> Self {
        Self {
            key: key.to_string(),
            editable: false,
        }
    }
}

impl ModelSource for TestSource {
    fn is_editable(&self) -> bool {
        self.editable
    }

    fn identity_key(&self) -> String {
        self.key.clone()
    }
}

/// A freshly built model with an attached root node.
pub(crate) fn model_with_root() -> (Arc<Model>, ComponentRef, Arc<TestBinding>) {
    let binding = Arc::new(TestBinding::new());
    let model = Model::new(
        Arc::new(TestSource::new("mem:test")),
        binding.clone(),
    );
    let root = node(ROOT);
    model.set_root(root.clone()).unwrap();
    (model, root, binding)
}

/// Same, over a read-only source.
pub(crate) fn read_only_model() -> (Arc<Model>, ComponentRef) {
    let binding = Arc::new(TestBinding::new());
    let model = Model::new(Arc::new(TestSource::read_only("mem:ro")), binding);
    let root = node(ROOT);
    model.set_root(root.clone()).unwrap();
    (model, root)
}
