//! # Background Sweep
//!
//! One process-wide periodic task that re-syncs quiescent models.
//!
//! The debounce is two-stage: the sweep itself runs on a coarse
//! period, and within a sweep each model is only re-synced when its
//! binding has been dirty for longer than the quiescence threshold —
//! a document still being actively edited is left alone.
//!
//! The sweep task never parses anything itself: it calls the cheap
//! `prepare_sync` inline and submits the full `sync` to a bounded
//! blocking pool. Failures on this unattended path are logged and
//! swallowed; the next sweep retries.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use folio_model::Model;

use crate::registry::ModelRegistry;

/// Cadence configuration for a sweep service.
#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    /// Period between sweep passes.
    pub period: Duration,
    /// Minimum dirty age before a model is re-synced.
    pub quiescence: Duration,
    /// Bound on concurrently running sync jobs.
    pub max_sync_workers: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            quiescence: Duration::from_secs(1),
            max_sync_workers: 4,
        }
    }
}

static GLOBAL: OnceLock<Arc<SweepService>> = OnceLock::new();

/// The periodic auto-sync sweep over every live registry.
pub struct SweepService {
    settings: SweepSettings,
    registries: Mutex<Vec<Weak<ModelRegistry>>>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl SweepService {
    /// The process-wide service, started on first use with default
    /// cadence.
    pub fn global() -> Arc<SweepService> {
        GLOBAL
            .get_or_init(|| SweepService::start(SweepSettings::default()))
            .clone()
    }

    /// Start a sweep service with explicit cadence. If the backing
    /// runtime cannot be built the service still constructs, logs the
    /// failure, and never sweeps.
    pub fn start(settings: SweepSettings) -> Arc<SweepService> {
        let service = Arc::new(SweepService {
            settings,
            registries: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(settings.max_sync_workers)
            .thread_name("folio-sweep")
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => {
                let handle = Arc::downgrade(&service);
                let period = settings.period;
                runtime.spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        ticker.tick().await;
                        let Some(service) = handle.upgrade() else {
                            break;
                        };
                        service.sweep();
                    }
                });
                *service.runtime.lock().unwrap() = Some(runtime);
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to start sweep runtime; auto-sync disabled");
            }
        }
        service
    }

    /// Track a registry. Called at registry construction; dead
    /// handles are purged as they are encountered.
    pub fn register(&self, registry: &Arc<ModelRegistry>) {
        let mut registries = self.registries.lock().unwrap();
        registries.retain(|handle| handle.strong_count() > 0);
        registries.push(Arc::downgrade(registry));
    }

    /// One sweep pass: visit every live model of every live registry
    /// and re-sync the quiescent dirty ones.
    fn sweep(&self) {
        let registries: Vec<Arc<ModelRegistry>> = {
            let registries = self.registries.lock().unwrap();
            registries.iter().filter_map(Weak::upgrade).collect()
        };
        for registry in registries {
            for model in registry.models() {
                if !model.binding().is_auto_sync() {
                    continue;
                }
                let Some(age) = model.binding().dirty_age() else {
                    continue;
                };
                if age >= self.settings.quiescence {
                    self.run_auto_sync(model);
                }
            }
        }
    }

    /// Prepare synchronously, then hand the full sync to the bounded
    /// blocking pool. Failures are logged and retried on a later
    /// sweep — this path is unattended.
    pub fn run_auto_sync(&self, model: Arc<Model>) {
        model.binding().prepare_sync();
        let runtime = self.runtime.lock().unwrap();
        let Some(runtime) = runtime.as_ref() else {
            return;
        };
        runtime.spawn_blocking(move || {
            if let Err(err) = model.sync() {
                tracing::warn!(error = %err, "auto-sync failed; will retry on a later sweep");
            }
        });
    }

    /// Stop sweeping and drop every tracked registry handle.
    pub fn shutdown(&self) {
        self.registries.lock().unwrap().clear();
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for SweepService {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }
}
