//! Outbound search-index queue.
//!
//! Catalog writes enqueue keyword rows and return immediately. A worker task
//! drains the queue and writes each event through [`SearchIndexStore`],
//! retrying with exponential backoff. Indexing failures never reach the
//! operation that produced the event.

use crate::config::ControlConfig;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tablegate_core::{
    ControlError, Database, Result, Scope, SearchKeyword, SearchKind, TableInfo,
};
use tablegate_storage::SearchIndexStore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Jitter factor for retry delays (±25%)
const JITTER_FACTOR: f64 = 0.25;

/// Keyword rows for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEvent {
    pub rows: Vec<SearchKeyword>,
}

/// Producer handle for the index queue.
#[derive(Debug, Clone)]
pub struct IndexSender {
    tx: mpsc::Sender<IndexEvent>,
}

impl IndexSender {
    /// Queue an event without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, event: IndexEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(rows = event.rows.len(), "Index queue is full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(rows = event.rows.len(), "Index queue is closed, dropping event");
                false
            }
        }
    }
}

/// Totals reported by the worker when the queue closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub written: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as u64;
        let jitter_range = (base_ms as f64 * JITTER_FACTOR) as u64;
        let jitter = if jitter_range > 0 {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..jitter_range * 2) as i64 - jitter_range as i64
        } else {
            0
        };
        Duration::from_millis((base_ms as i64 + jitter).max(1) as u64)
    }
}

pub struct IndexQueue;

impl IndexQueue {
    /// Start the worker on the current tokio runtime.
    ///
    /// The worker exits once every [`IndexSender`] is dropped and the queue is
    /// drained; the handle yields its totals.
    pub fn spawn<S>(store: Arc<S>, config: &ControlConfig) -> (IndexSender, JoinHandle<IndexStats>)
    where
        S: SearchIndexStore + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel(config.index_queue_capacity);
        let policy = RetryPolicy {
            max_attempts: config.index_max_retries,
            initial_delay: config.index_retry_initial_delay,
            max_delay: config.index_retry_max_delay,
        };

        let handle = tokio::spawn(async move {
            let mut stats = IndexStats::default();
            while let Some(event) = rx.recv().await {
                match write_with_retry(&store, event, policy).await {
                    Ok(()) => stats.written += 1,
                    Err(_) => stats.failed += 1,
                }
            }
            info!(written = stats.written, failed = stats.failed, "Index worker stopped");
            stats
        });

        (IndexSender { tx }, handle)
    }
}

async fn write_with_retry<S>(store: &Arc<S>, event: IndexEvent, policy: RetryPolicy) -> Result<()>
where
    S: SearchIndexStore + Send + Sync + 'static,
{
    let rows = Arc::new(event.rows);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let store = Arc::clone(store);
        let batch = Arc::clone(&rows);
        let result = tokio::task::spawn_blocking(move || store.upsert_keywords(&batch))
            .await
            .map_err(|e| ControlError::Other(format!("index write task failed: {}", e)))
            .and_then(|r| r);

        match result {
            Ok(()) => {
                debug!(rows = rows.len(), attempts, "Keywords indexed");
                return Ok(());
            }
            Err(e) if attempts < policy.max_attempts => {
                let delay = policy.delay(attempts);
                debug!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Index write failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    rows = rows.len(),
                    attempts,
                    error = %e,
                    "Index write permanently failed after all retries"
                );
                return Err(e);
            }
        }
    }
}

fn keyword(kind: SearchKind, id: i64, name: &str, field: &str, key: String, content: String) -> SearchKeyword {
    SearchKeyword {
        kind,
        subject_id: id,
        subject_name: name.to_string(),
        field: field.to_string(),
        key,
        content,
    }
}

fn manager_keywords(kind: SearchKind, id: i64, name: &str, managers: &[u64]) -> Vec<SearchKeyword> {
    managers
        .iter()
        .map(|m| keyword(kind, id, name, "manager", m.to_string(), m.to_string()))
        .collect()
}

pub fn product_keywords(product: &Scope) -> IndexEvent {
    let kind = SearchKind::Product;
    let (id, name) = (product.id, product.name.as_str());
    let mut rows = vec![
        keyword(kind, id, name, "name", String::new(), name.to_string()),
        keyword(kind, id, name, "intro", String::new(), product.intro.clone()),
        keyword(kind, id, name, "creator", String::new(), product.creator.to_string()),
    ];
    rows.extend(manager_keywords(kind, id, name, &product.managers));
    IndexEvent { rows }
}

pub fn database_keywords(database: &Database) -> IndexEvent {
    let kind = SearchKind::Database;
    let (id, name) = (database.id, database.name.as_str());
    let mut rows = vec![
        keyword(kind, id, name, "name", String::new(), name.to_string()),
        keyword(kind, id, name, "product", String::new(), database.product_id.to_string()),
    ];
    rows.extend(manager_keywords(kind, id, name, &database.managers));
    IndexEvent { rows }
}

pub fn table_keywords(table: &TableInfo) -> IndexEvent {
    let kind = SearchKind::Table;
    let (id, name) = (table.id, table.name.as_str());
    IndexEvent {
        rows: vec![
            keyword(kind, id, name, "name", String::new(), name.to_string()),
            keyword(kind, id, name, "database", String::new(), table.database_id.to_string()),
        ],
    }
}
