//! Application state shared across request handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadence_metrics_store::StorageBackend;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    backend: Arc<dyn StorageBackend>,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                backend,
                ready: AtomicBool::new(false),
            }),
        }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.inner.backend.as_ref()
    }

    /// The backend finished initializing.
    pub fn mark_ready(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }
}
