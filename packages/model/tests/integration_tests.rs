//! Cross-thread transaction discipline, exercised through the public
//! API only.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use folio_model::{
    Component, ComponentBacking, ComponentKind, ComponentRef, DocumentBinding, Model, ModelError,
    ModelSource, SyncError, SyncOutcome,
};

const ROOT: ComponentKind = ComponentKind::new("root");
const ITEM: ComponentKind = ComponentKind::new("item");

struct BareNode {
    kind: ComponentKind,
}

impl ComponentBacking for BareNode {
    fn kind(&self) -> ComponentKind {
        self.kind
    }
    fn quiet_append(&self, _child: &ComponentRef) {}
    fn quiet_insert(&self, _index: usize, _child: &ComponentRef) {}
    fn quiet_remove(&self, _child: &ComponentRef) {}
    fn populate_children(&self) -> Vec<ComponentRef> {
        Vec::new()
    }
    fn quiet_set_value(&self, _name: &str, _value: Option<Value>) -> Option<Value> {
        None
    }
}

fn bare(kind: ComponentKind) -> ComponentRef {
    Component::new(Box::new(BareNode { kind }))
}

struct BareBinding;

impl DocumentBinding for BareBinding {
    fn sync(&self, _model: &Arc<Model>) -> Result<SyncOutcome, SyncError> {
        Ok(SyncOutcome::Synced)
    }
    fn flush(&self) {}
    fn prepare_sync(&self) {}
    fn prepare_for_undo_redo(&self) -> Result<(), SyncError> {
        Ok(())
    }
    fn finish_undo_redo(&self) {}
    fn is_auto_sync(&self) -> bool {
        false
    }
    fn set_auto_sync(&self, _on: bool) {}
    fn dirty_age(&self) -> Option<Duration> {
        None
    }
}

struct BareSource;

impl ModelSource for BareSource {
    fn is_editable(&self) -> bool {
        true
    }
    fn identity_key(&self) -> String {
        "mem:integration".to_string()
    }
}

fn new_model() -> (Arc<Model>, ComponentRef) {
    let model = Model::new(Arc::new(BareSource), Arc::new(BareBinding));
    let root = bare(ROOT);
    model.set_root(root.clone()).unwrap();
    (model, root)
}

#[test]
fn test_at_most_one_writer_across_threads() {
    let (model, root) = new_model();
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let model = model.clone();
        let root = root.clone();
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                assert!(model.start_transaction().unwrap());
                if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }

                let child = bare(ITEM);
                root.append_child(child.clone()).unwrap();
                thread::yield_now();
                root.remove_child(&child).unwrap();

                inside.fetch_sub(1, Ordering::SeqCst);
                model.end_transaction(false).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(root.children().is_empty());
}

#[test]
fn test_start_transaction_blocks_until_owner_releases() {
    let (model, _root) = new_model();
    let released = Arc::new(AtomicBool::new(false));

    assert!(model.start_transaction().unwrap());

    let waiter = {
        let model = model.clone();
        let released = released.clone();
        thread::spawn(move || {
            assert!(model.start_transaction().unwrap());
            // We only get here once the owner has ended its
            // transaction.
            assert!(released.load(Ordering::SeqCst));
            model.end_transaction(false).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    released.store(true, Ordering::SeqCst);
    model.end_transaction(false).unwrap();
    waiter.join().unwrap();
}

#[test]
fn test_end_transaction_from_non_owner_is_noop() {
    let (model, _root) = new_model();
    assert!(model.start_transaction().unwrap());

    {
        let model = model.clone();
        thread::spawn(move || {
            model.end_transaction(false).unwrap();
        })
        .join()
        .unwrap();
    }

    // The owner still holds the transaction.
    assert!(model.is_transaction_active());
    model.end_transaction(false).unwrap();
    assert!(!model.is_transaction_active());
}

#[test]
fn test_mutation_from_non_owner_thread_fails() {
    let (model, root) = new_model();
    assert!(model.start_transaction().unwrap());

    let result = {
        let root = root.clone();
        thread::spawn(move || root.append_child(bare(ITEM)))
            .join()
            .unwrap()
    };
    assert!(matches!(
        result,
        Err(ModelError::IllegalTransactionState(_))
    ));

    model.end_transaction(false).unwrap();
    assert!(root.children().is_empty());
}

#[test]
fn test_events_fire_on_closing_thread_in_enqueue_order() -> anyhow::Result<()> {
    let (model, root) = new_model();
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    model.observe_properties(move |event| {
        seen.lock().unwrap().push(event.property.clone());
    });

    assert!(model.start_transaction()?);
    let a = bare(ITEM);
    root.append_child(a.clone())?;
    a.set_value("first", Some(Value::from(1)))?;
    a.set_value("second", Some(Value::from(2)))?;
    model.end_transaction(false)?;

    assert_eq!(
        *order.lock().unwrap(),
        vec!["item".to_string(), "first".to_string(), "second".to_string()]
    );
    Ok(())
}
