//! In-process backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::DEFAULT_WINDOW;
use crate::{ResultRow, SaveResult, StorageBackend, StorageError};

/// (namespace, inference, node, key)
type RowKey = (String, String, String, String);

/// Metrics backend holding rows in memory.
///
/// Usable without `initialize`. After `close`, `save` and `get` fail with
/// [`StorageError::NotInitialized`] until the next `initialize`.
pub struct MemoryBackend {
    rows: Mutex<BTreeMap<RowKey, (u64, String)>>,
    sequence: AtomicU64,
    window: usize,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW as usize)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            window,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored rows across all inferences.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::NotInitialized(self.name()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, result: &SaveResult) -> Result<(), StorageError> {
        self.ensure_open()?;
        result.validate()?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = (
            result.namespace.clone(),
            result.inference_name.clone(),
            result.node_key().to_string(),
            result.key.clone(),
        );

        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StorageError::Poisoned)?;
        rows.insert(key, (seq, result.value.clone()));
        Ok(())
    }

    async fn get(
        &self,
        namespace: &str,
        inference_name: &str,
    ) -> Result<Vec<ResultRow>, StorageError> {
        self.ensure_open()?;
        let rows = self
            .rows
            .lock()
            .map_err(|_| StorageError::Poisoned)?;

        let mut matching: Vec<_> = rows
            .iter()
            .filter(|((ns, inf, _, _), _)| ns == namespace && inf == inference_name)
            .map(|((_, _, node, key), (seq, value))| {
                let row = ResultRow {
                    node_name: (!node.is_empty()).then(|| node.clone()),
                    key: key.clone(),
                    value: value.clone(),
                };
                (*seq, row)
            })
            .collect();

        matching.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matching
            .into_iter()
            .take(self.window)
            .map(|(_, row)| row)
            .collect())
    }
}
