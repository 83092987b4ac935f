//! Asynchronous write-back of origin responses into the cache store.
//!
//! Request tasks only ever call [`WriteBackQueue::enqueue`], which never
//! waits. A single [`WriteBackWorker`] owns the store write path, so cache
//! writes need no locking and a slow store cannot delay a client response.

use std::time::Duration;

use metrics::counter;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache_key::CacheKey;
use crate::error::ProxyError;
use crate::store::{CacheStoreAdapter, CachedResponse};

pub(crate) const METRIC_WRITEBACK_ENQUEUED: &str = "cache_proxy_writeback_enqueued_total";
pub(crate) const METRIC_WRITEBACK_DROPPED: &str = "cache_proxy_writeback_dropped_total";
pub(crate) const METRIC_WRITEBACK_WRITTEN: &str = "cache_proxy_writeback_written_total";
pub(crate) const METRIC_WRITEBACK_FAILED: &str = "cache_proxy_writeback_failed_total";

/// A pending cache write. Owns the document until the worker is done with it.
#[derive(Debug)]
pub struct WriteBackItem {
    pub key: CacheKey,
    pub value: CachedResponse,
    pub ttl: Duration,
}

impl WriteBackItem {
    pub fn new(key: CacheKey, value: CachedResponse, ttl: Duration) -> Self {
        Self { key, value, ttl }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue was full; the item was dropped and the entry stays uncached.
    Dropped,
    /// Worker has shut down.
    Closed,
}

/// Producer side of the bounded write-back channel.
#[derive(Clone)]
pub struct WriteBackQueue {
    tx: mpsc::Sender<WriteBackItem>,
    capacity: usize,
}

impl WriteBackQueue {
    /// Hand an item to the worker without waiting. A full queue drops the
    /// item and logs it; the caller proceeds either way.
    pub fn enqueue(&self, item: WriteBackItem) -> EnqueueOutcome {
        match self.tx.try_send(item) {
            Ok(()) => {
                counter!(METRIC_WRITEBACK_ENQUEUED).increment(1);
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(item)) => {
                counter!(METRIC_WRITEBACK_DROPPED).increment(1);
                warn!(
                    key = %item.key,
                    capacity = self.capacity,
                    "write-back queue full, dropping item"
                );
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(item)) => {
                warn!(key = %item.key, "write-back queue closed, dropping item");
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items waiting for the worker.
    pub fn pending(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Totals reported by the worker when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBackReport {
    pub written: u64,
    pub failed: u64,
    /// Items still queued at shutdown, never written.
    pub abandoned: u64,
}

/// Owned handle to the drain task. Dropping it also stops the worker.
pub struct WriteBackWorker {
    handle: JoinHandle<WriteBackReport>,
    shutdown: watch::Sender<bool>,
}

impl WriteBackWorker {
    /// Start the worker and return the queue feeding it.
    pub fn spawn(store: CacheStoreAdapter, capacity: usize) -> (WriteBackQueue, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(drain(rx, store, shutdown_rx));

        let queue = WriteBackQueue { tx, capacity };
        (queue, Self { handle, shutdown })
    }

    /// Close the queue and wait for the worker. An item already pulled is
    /// written to completion; anything still queued is abandoned.
    pub async fn shutdown(self) -> WriteBackReport {
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "write-back worker terminated abnormally");
                WriteBackReport::default()
            }
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<WriteBackItem>,
    store: CacheStoreAdapter,
    mut shutdown: watch::Receiver<bool>,
) -> WriteBackReport {
    let mut report = WriteBackReport::default();

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match store.write(&item.key, &item.value, item.ttl).await {
            Ok(()) => {
                report.written += 1;
                counter!(METRIC_WRITEBACK_WRITTEN).increment(1);
                debug!(key = %item.key, ttl = ?item.ttl, "cached origin response");
            }
            Err(err) => {
                report.failed += 1;
                counter!(METRIC_WRITEBACK_FAILED).increment(1);
                let err = ProxyError::WriteBack(err);
                warn!(key = %item.key, error = %err, "dropping write-back");
            }
        }
    }

    rx.close();
    while rx.try_recv().is_ok() {
        report.abandoned += 1;
    }

    info!(
        written = report.written,
        failed = report.failed,
        abandoned = report.abandoned,
        "write-back worker stopped"
    );
    report
}
