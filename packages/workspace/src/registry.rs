//! # Model Registry
//!
//! Weak-cached model factory. Models are cached under an identity
//! key extracted from their source; the cache holds weak handles, so
//! a model lives exactly as long as someone outside the registry
//! keeps it alive. A later `get_model` for a collected entry rebuilds
//! the model from scratch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use folio_model::{Model, ModelError, ModelSource};

use crate::sweep::SweepService;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to open model: {0}")]
    Open(#[from] ModelError),
}

/// The concrete document binding's side of model construction.
///
/// `open` builds a model (binding, source, root tree) without syncing
/// it; the registry runs the initial sync. `identity_key` is the
/// pluggable key-extraction policy — the default defers to the
/// source's own identity, bindings override it to share models across
/// equivalent sources.
pub trait ModelProvider: Send + Sync {
    fn open(&self, source: Arc<dyn ModelSource>) -> Result<Arc<Model>, ModelError>;

    fn identity_key(&self, source: &dyn ModelSource) -> String {
        source.identity_key()
    }
}

type LoadedListener = Arc<dyn Fn(&Arc<Model>) + Send + Sync>;

#[derive(Default)]
struct LoadedListeners {
    next_id: u64,
    table: BTreeMap<u64, LoadedListener>,
}

/// Weak-cached model factory for one document binding.
pub struct ModelRegistry {
    provider: Arc<dyn ModelProvider>,
    cache: Mutex<HashMap<String, Weak<Model>>>,
    loaded: Mutex<LoadedListeners>,
}

impl ModelRegistry {
    /// Create a registry and register it with the process-wide sweep
    /// service.
    pub fn new(provider: Arc<dyn ModelProvider>) -> Arc<Self> {
        Self::with_sweep(provider, &SweepService::global())
    }

    /// Create a registry registered with a specific sweep service
    /// (embedders and tests that manage their own sweep cadence).
    pub fn with_sweep(provider: Arc<dyn ModelProvider>, sweep: &SweepService) -> Arc<Self> {
        let registry = Arc::new(Self {
            provider,
            cache: Mutex::new(HashMap::new()),
            loaded: Mutex::new(LoadedListeners::default()),
        });
        sweep.register(&registry);
        registry
    }

    /// Resolve or create the model for `source`.
    ///
    /// A live cached model for the same identity key is returned
    /// as-is; a collected or absent entry is rebuilt, synced once,
    /// cached, and announced to the model-loaded listeners. An
    /// initial-sync failure is recorded in the model's state (and
    /// logged), not propagated — the model is still returned so
    /// callers can observe `NotWellFormed` and re-sync later.
    pub fn get_model(&self, source: Arc<dyn ModelSource>) -> Result<Arc<Model>, RegistryError> {
        let key = self.provider.identity_key(source.as_ref());

        let mut cache = self.cache.lock().unwrap();
        if let Some(model) = cache.get(&key).and_then(Weak::upgrade) {
            return Ok(model);
        }
        cache.retain(|_, handle| handle.strong_count() > 0);

        let model = self.build(source)?;
        cache.insert(key, Arc::downgrade(&model));
        drop(cache);

        let listeners: Vec<LoadedListener> = {
            self.loaded.lock().unwrap().table.values().cloned().collect()
        };
        for listener in listeners {
            listener(&model);
        }
        Ok(model)
    }

    /// Construct and sync a model without touching the cache — for
    /// one-shot, throwaway parses.
    pub fn create_fresh_model(
        &self,
        source: Arc<dyn ModelSource>,
    ) -> Result<Arc<Model>, RegistryError> {
        self.build(source)
    }

    fn build(&self, source: Arc<dyn ModelSource>) -> Result<Arc<Model>, RegistryError> {
        let model = self.provider.open(source)?;
        if let Err(err) = model.sync() {
            tracing::warn!(error = %err, "initial sync failed; model is not well-formed");
        }
        Ok(model)
    }

    /// Snapshot of the still-live cached models (the sweep input).
    pub fn models(&self) -> Vec<Arc<Model>> {
        self.cache
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Register a registry-wide listener fired for every newly
    /// loaded (cached) model.
    pub fn on_model_loaded(&self, listener: impl Fn(&Arc<Model>) + Send + Sync + 'static) -> u64 {
        let mut loaded = self.loaded.lock().unwrap();
        let id = loaded.next_id;
        loaded.next_id += 1;
        loaded.table.insert(id, Arc::new(listener));
        id
    }

    pub fn remove_loaded_listener(&self, id: u64) {
        self.loaded.lock().unwrap().table.remove(&id);
    }
}
