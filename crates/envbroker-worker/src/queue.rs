// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation queue and worker pool.
//!
//! Workers pull operation IDs and hand them to an [`Executor`]. The result
//! decides what happens to the ID:
//!
//! | Result | Action |
//! |--------|--------|
//! | `Err` | log, requeue after the error backoff |
//! | `Ok(delay > 0)` | requeue after `delay` |
//! | `Ok(0)` | drop |
//!
//! An ID is never handed to two workers at once. Adding an ID that is
//! already queued is a no-op; adding one that is being executed marks it to
//! run again as soon as the current execution ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use envbroker_core::Executor;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Tracking {
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    rerun: HashSet<String>,
}

struct Inner {
    name: String,
    executor: Arc<dyn Executor>,
    error_backoff: Duration,
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    tracking: Mutex<Tracking>,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deduplicating queue of operation IDs with a pool of workers.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Inner>,
}

impl OperationQueue {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
        error_backoff: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                executor,
                error_backoff,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                tracking: Mutex::new(Tracking::default()),
                shutdown_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `operation_id` for execution now.
    pub fn add(&self, operation_id: &str) {
        if self.is_shut_down() {
            return;
        }

        let mut tracking = self.inner.tracking();
        if tracking.in_flight.contains(operation_id) {
            tracking.rerun.insert(operation_id.to_string());
            return;
        }
        if !tracking.queued.insert(operation_id.to_string()) {
            return;
        }
        drop(tracking);

        if self.inner.tx.send(operation_id.to_string()).is_err() {
            self.inner.tracking().queued.remove(operation_id);
        }
    }

    /// Queue `operation_id` once `delay` has passed.
    pub fn add_after(&self, operation_id: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(operation_id);
            return;
        }

        let queue = self.clone();
        let operation_id = operation_id.to_string();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(&operation_id),
                _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
            }
        });
    }

    /// IDs waiting for a worker.
    pub fn queued_len(&self) -> usize {
        self.inner.tracking().queued.len()
    }

    /// IDs currently being executed.
    pub fn in_flight_len(&self) -> usize {
        self.inner.tracking().in_flight.len()
    }

    /// Stop all workers after their current execution.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Run `workers` workers until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self, workers: usize) {
        let workers = workers.max(1);
        info!(queue = %self.inner.name, workers, "Operation queue started");

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let queue = self.clone();
            tasks.spawn(async move { queue.worker_loop(worker).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(queue = %self.inner.name, error = %e, "Queue worker panicked");
            }
        }

        info!(queue = %self.inner.name, "Operation queue stopped");
    }

    async fn worker_loop(&self, worker: usize) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown_rx.wait_for(|stopped| *stopped) => None,
                id = async { self.inner.rx.lock().await.recv().await } => id,
            };
            let Some(operation_id) = next else {
                break;
            };

            {
                let mut tracking = self.inner.tracking();
                tracking.queued.remove(&operation_id);
                tracking.in_flight.insert(operation_id.clone());
            }

            self.process(worker, &operation_id).await;
        }

        debug!(queue = %self.inner.name, worker, "Queue worker stopped");
    }

    async fn process(&self, worker: usize, operation_id: &str) {
        let result = self.inner.executor.execute(operation_id).await;

        let rerun = {
            let mut tracking = self.inner.tracking();
            tracking.in_flight.remove(operation_id);
            tracking.rerun.remove(operation_id)
        };

        match result {
            Err(e) => {
                warn!(
                    queue = %self.inner.name,
                    worker,
                    operation_id,
                    error = %e,
                    backoff_ms = self.inner.error_backoff.as_millis() as u64,
                    "Operation execution failed, backing off"
                );
                if rerun {
                    self.add(operation_id);
                } else {
                    self.add_after(operation_id, self.inner.error_backoff);
                }
            }
            Ok(delay) if !delay.is_zero() => {
                debug!(
                    queue = %self.inner.name,
                    operation_id,
                    requeue_after_ms = delay.as_millis() as u64,
                    "Operation requeued"
                );
                if rerun {
                    self.add(operation_id);
                } else {
                    self.add_after(operation_id, delay);
                }
            }
            Ok(_) => {
                debug!(queue = %self.inner.name, operation_id, "Operation done");
                if rerun {
                    self.add(operation_id);
                }
            }
        }
    }
}
