//! Controllers started by the binary.
//!
//! `main` builds a [`ControllerRegistry`], registers one start function per
//! resource kind and starts them all at once. Each start function runs until
//! the shared shutdown flag flips.

use std::future::Future;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

type StartFn = Box<dyn FnOnce(watch::Receiver<bool>) -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct ControllerRegistry {
    entries: Vec<(&'static str, StartFn)>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, kind: &'static str, start: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entries
            .push((kind, Box::new(move |shutdown| Box::pin(start(shutdown)))));
    }

    /// Registered kinds, in registration order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn every controller. Each gets its own handle on `shutdown`.
    pub fn start_all(self, shutdown: &watch::Receiver<bool>) -> Vec<(&'static str, JoinHandle<()>)> {
        self.entries
            .into_iter()
            .map(|(kind, start)| {
                info!(kind, "Starting controller");
                (kind, tokio::spawn(start(shutdown.clone())))
            })
            .collect()
    }
}
