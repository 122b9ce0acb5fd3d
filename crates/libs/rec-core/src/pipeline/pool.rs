//! Bounded worker pool.
//!
//! A fixed-capacity FIFO queue decouples the poller from the runners.
//! `submit` never blocks: a full queue returns `false`, which the poller
//! treats as backpressure and the control plane resolves by re-delivering
//! after the visibility window.
//!
//! Workers scale between `min_workers` and `max_workers`: a monitor task
//! samples queue depth and adds workers while the queue is behind; workers
//! idle past `keepalive_ms` retire down to the floor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rec_common::config::PoolConfig;

use crate::exec::Executor;
use crate::metrics;
use crate::model::delivery::Delivery;

/// How long `shutdown` waits for queued deliveries before stopping workers.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// How long `shutdown` waits for in-flight executions before cancelling them.
const FINISH_DEADLINE: Duration = Duration::from_secs(30);

enum Dequeued {
    Delivery(Delivery),
    /// Channel closed; no more work will ever arrive.
    Closed,
    /// Keepalive elapsed with nothing to do.
    Idle,
}

pub struct WorkerPool {
    config: PoolConfig,
    executor: Arc<Executor>,
    tx: mpsc::Sender<Delivery>,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    depth: Arc<AtomicUsize>,
    worker_count: Arc<AtomicUsize>,
    next_worker_id: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    /// Tells idle workers to exit; running workers finish their delivery.
    stop: CancellationToken,
    /// Cancels in-flight executions; only fired when draining overruns.
    exec_token: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, executor: Arc<Executor>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size);
        Self {
            config,
            executor,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            worker_count: Arc::new(AtomicUsize::new(0)),
            next_worker_id: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            stop: CancellationToken::new(),
            exec_token: CancellationToken::new(),
        }
    }

    /// Spawn the initial workers and the scaling monitor. `token` cancels
    /// in-flight executions on hard shutdown.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) {
        // Cancelling the caller's token cancels executions too.
        let exec_token = self.exec_token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            exec_token.cancel();
        });

        let mut workers = self.workers.lock().await;
        for _ in 0..self.config.min_workers {
            workers.push(self.spawn_worker());
        }
        drop(workers);

        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.monitor().await });
        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            queue_size = self.config.queue_size,
            "Worker pool started"
        );
    }

    /// Non-blocking enqueue. `false` means the queue is full (or the pool is
    /// shutting down) and the delivery was not accepted.
    pub fn submit(&self, delivery: Delivery) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(delivery) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
                metrics::queue_depth(depth);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue depth right now.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Live worker tasks right now.
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Acquire)
    }

    /// Stop intake, drain the queue (bounded), then stop workers. Workers
    /// finish the delivery they hold, including its report; only if they
    /// overrun [`FINISH_DEADLINE`] are executions cancelled outright.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        info!(depth = self.depth(), "Worker pool draining");

        let drain = async {
            while self.depth() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            warn!(depth = self.depth(), "Drain deadline hit, abandoning queue");
        }

        self.stop.cancel();

        let mut workers = self.workers.lock().await;
        let join_all = async {
            for handle in workers.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(FINISH_DEADLINE, join_all).await.is_err() {
            warn!("Workers still busy, cancelling in-flight executions");
            self.exec_token.cancel();
            for handle in workers.drain(..) {
                let _ = handle.await;
            }
        }
        info!("Worker pool stopped");
    }

    fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.worker_count.fetch_add(1, Ordering::AcqRel);
        metrics::workers_active(self.worker_count());

        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.worker_loop(id).await })
    }

    async fn worker_loop(&self, id: usize) {
        debug!(worker = id, "Worker started");
        let keepalive = Duration::from_millis(self.config.keepalive_ms);

        loop {
            let above_floor = self.worker_count() > self.config.min_workers;

            let delivery = tokio::select! {
                _ = self.stop.cancelled() => break,
                received = self.dequeue(above_floor.then_some(keepalive)) => match received {
                    Dequeued::Delivery(delivery) => delivery,
                    Dequeued::Closed => break,
                    Dequeued::Idle => {
                        // Retire if still above the floor; the compare-and-swap
                        // keeps two idle workers from both taking the last slot.
                        let retired = self
                            .worker_count
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                                (n > self.config.min_workers).then_some(n - 1)
                            })
                            .is_ok();
                        if retired {
                            metrics::workers_active(self.worker_count());
                            debug!(worker = id, "Worker retired after keepalive");
                            return;
                        }
                        continue;
                    }
                },
            };

            let depth = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
            metrics::queue_depth(depth);

            self.executor.handle(&delivery, &self.exec_token).await;
        }

        self.worker_count.fetch_sub(1, Ordering::AcqRel);
        metrics::workers_active(self.worker_count());
        debug!(worker = id, "Worker stopped");
    }

    async fn dequeue(&self, keepalive: Option<Duration>) -> Dequeued {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        let received = match keepalive {
            Some(keepalive) => match tokio::time::timeout(keepalive, recv).await {
                Ok(received) => received,
                Err(_) => return Dequeued::Idle,
            },
            None => recv.await,
        };
        match received {
            Some(delivery) => Dequeued::Delivery(delivery),
            None => Dequeued::Closed,
        }
    }

    /// Scaling monitor: adds a worker per tick while the queue is behind.
    async fn monitor(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.monitoring_period_ms);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            let depth = self.depth();
            let count = self.worker_count();
            metrics::queue_depth(depth);

            if depth > count && count < self.config.max_workers {
                debug!(depth, workers = count, "Scaling up");
                let handle = self.spawn_worker();
                self.workers.lock().await.push(handle);
            }
        }
        debug!("Pool monitor stopped");
    }
}
