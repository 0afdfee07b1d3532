//! Bounded, parallel pipeline stages.
//!
//! A stage is a bounded `mpsc` queue plus a fixed pool of worker tasks.
//! The queue bound is the backpressure mechanism: senders either block
//! (`send`) or observe fullness (`offer`) and let the orchestrator retry.
//! Item order across a pool's workers is not preserved.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of a non-blocking offer.
#[derive(Debug)]
pub enum OfferError<T> {
    /// Queue is at capacity; the item is handed back for retry.
    Full(T),
    /// Stage completed or was torn down.
    Closed,
}

/// 1:N transform applied by a stage worker.
pub type TransformFn<T, U> = Arc<dyn Fn(T) -> BoxFuture<'static, Vec<U>> + Send + Sync>;

/// Terminal action applied by a sink stage worker.
pub type ActionFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// How a broadcast stage distributes items over its lanes.
pub enum BroadcastMode<T> {
    /// Every lane receives a copy of every item.
    All,
    /// The route key picks exactly one lane per item.
    Route(Arc<dyn Fn(&T) -> usize + Send + Sync>),
}

impl<T> Clone for BroadcastMode<T> {
    fn clone(&self) -> Self {
        match self {
            BroadcastMode::All => BroadcastMode::All,
            BroadcastMode::Route(route) => BroadcastMode::Route(Arc::clone(route)),
        }
    }
}

/// Handle to a running stage: the offer side plus its completion signal.
pub struct StageHandle<T> {
    name: String,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    completed_rx: watch::Receiver<bool>,
}

impl<T> StageHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking offer; a full queue hands the item back.
    pub async fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        let sender = self.tx.lock().await.clone();
        match sender {
            Some(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(item) => OfferError::Full(item),
                mpsc::error::TrySendError::Closed(_) => OfferError::Closed,
            }),
            None => Err(OfferError::Closed),
        }
    }

    /// Blocking send; waits on backpressure instead of reporting it.
    pub async fn send(&self, item: T) -> Result<(), OfferError<T>> {
        let sender = self.tx.lock().await.clone();
        match sender {
            Some(tx) => tx.send(item).await.map_err(|_| OfferError::Closed),
            None => Err(OfferError::Closed),
        }
    }

    /// Mark the input complete. Workers drain the queue and exit; the
    /// completion signal fires once the pool is done.
    pub async fn complete(&self) {
        self.tx.lock().await.take();
    }

    /// Whether the stage has fully drained.
    pub fn is_complete(&self) -> bool {
        *self.completed_rx.borrow()
    }

    /// Wait until the stage reports completion.
    pub async fn wait_complete(&self) {
        let mut rx = self.completed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

fn new_handle<T>(name: &str, capacity: usize) -> (Arc<StageHandle<T>>, mpsc::Receiver<T>, watch::Sender<bool>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (done_tx, done_rx) = watch::channel(false);
    let handle = Arc::new(StageHandle {
        name: name.to_string(),
        tx: Mutex::new(Some(tx)),
        completed_rx: done_rx,
    });
    (handle, rx, done_tx)
}

/// Receive the next item, exiting early on cancellation.
async fn next_item<T>(
    rx: &Arc<Mutex<mpsc::Receiver<T>>>,
    cancel: &mut watch::Receiver<bool>,
) -> Option<T> {
    loop {
        if *cancel.borrow() {
            return None;
        }
        let mut guard = rx.lock().await;
        tokio::select! {
            item = guard.recv() => return item,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return None;
                }
            }
        }
    }
}

fn supervise(
    name: String,
    joins: Vec<JoinHandle<()>>,
    done_tx: watch::Sender<bool>,
    on_drained: Option<BoxFuture<'static, ()>>,
) {
    tokio::spawn(async move {
        for join in joins {
            let _ = join.await;
        }
        debug!(stage = %name, "stage drained");
        let _ = done_tx.send(true);
        if let Some(fut) = on_drained {
            fut.await;
        }
    });
}

/// Spawn a transform stage: `workers` tasks apply `func` to each item and
/// forward the outputs downstream with backpressure.
pub fn spawn_transform<T, U>(
    name: &str,
    capacity: usize,
    workers: usize,
    cancel: watch::Receiver<bool>,
    func: TransformFn<T, U>,
    downstream: Arc<StageHandle<U>>,
    propagate_completion: bool,
) -> Arc<StageHandle<T>>
where
    T: Send + 'static,
    U: Send + 'static,
{
    let (handle, rx, done_tx) = new_handle(name, capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut joins = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let mut cancel = cancel.clone();
        let func = Arc::clone(&func);
        let downstream = Arc::clone(&downstream);
        let stage_name = name.to_string();
        joins.push(tokio::spawn(async move {
            while let Some(item) = next_item(&rx, &mut cancel).await {
                for out in func(item).await {
                    if downstream.send(out).await.is_err() {
                        warn!(stage = %stage_name, "downstream closed, dropping output");
                        return;
                    }
                }
            }
        }));
    }

    let on_drained = propagate_completion.then(|| {
        let downstream = Arc::clone(&downstream);
        Box::pin(async move { downstream.complete().await }) as BoxFuture<'static, ()>
    });
    supervise(name.to_string(), joins, done_tx, on_drained);
    handle
}

/// Spawn a terminal action stage.
pub fn spawn_action<T>(
    name: &str,
    capacity: usize,
    workers: usize,
    cancel: watch::Receiver<bool>,
    func: ActionFn<T>,
) -> Arc<StageHandle<T>>
where
    T: Send + 'static,
{
    let (handle, rx, done_tx) = new_handle(name, capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut joins = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let mut cancel = cancel.clone();
        let func = Arc::clone(&func);
        joins.push(tokio::spawn(async move {
            while let Some(item) = next_item(&rx, &mut cancel).await {
                func(item).await;
            }
        }));
    }

    supervise(name.to_string(), joins, done_tx, None);
    handle
}

/// Spawn a batch stage: coalesces up to `batch_size` items, flushing a
/// partial batch when the time window elapses. Batching is a single
/// worker; parallelism here would reorder without gaining anything.
pub fn spawn_batch<T>(
    name: &str,
    capacity: usize,
    batch_size: usize,
    window: Duration,
    cancel: watch::Receiver<bool>,
    downstream: Arc<StageHandle<Vec<T>>>,
    propagate_completion: bool,
) -> Arc<StageHandle<T>>
where
    T: Send + 'static,
{
    let (handle, mut rx, done_tx) = new_handle(name, capacity);
    let batch_size = batch_size.max(1);
    let worker_downstream = Arc::clone(&downstream);
    let mut worker_cancel = cancel;

    let join = tokio::spawn(async move {
        let mut buf: Vec<T> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => {
                        buf.push(item);
                        if buf.len() >= batch_size
                            && worker_downstream.send(std::mem::take(&mut buf)).await.is_err()
                        {
                            return;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buf.is_empty()
                        && worker_downstream.send(std::mem::take(&mut buf)).await.is_err()
                    {
                        return;
                    }
                }
                changed = worker_cancel.changed() => {
                    if changed.is_err() || *worker_cancel.borrow() {
                        break;
                    }
                }
            }
        }
        if !buf.is_empty() {
            let _ = worker_downstream.send(buf).await;
        }
    });

    let on_drained = propagate_completion.then(|| {
        let downstream = Arc::clone(&downstream);
        Box::pin(async move { downstream.complete().await }) as BoxFuture<'static, ()>
    });
    supervise(name.to_string(), vec![join], done_tx, on_drained);
    handle
}

/// Spawn a broadcast stage fanning items out over downstream lanes.
pub fn spawn_broadcast<T>(
    name: &str,
    capacity: usize,
    cancel: watch::Receiver<bool>,
    mode: BroadcastMode<T>,
    lanes: Vec<Arc<StageHandle<T>>>,
    propagate_completion: bool,
) -> Arc<StageHandle<T>>
where
    T: Clone + Send + 'static,
{
    let (handle, mut rx, done_tx) = new_handle(name, capacity);
    let worker_lanes = lanes.clone();
    let mut worker_cancel = cancel;

    let join = tokio::spawn(async move {
        loop {
            let item: Option<T> = tokio::select! {
                item = rx.recv() => item,
                changed = worker_cancel.changed() => {
                    if changed.is_err() || *worker_cancel.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(item) = item else { break };
            match &mode {
                BroadcastMode::All => {
                    for lane in &worker_lanes {
                        let _ = lane.send(item.clone()).await;
                    }
                }
                BroadcastMode::Route(route) => {
                    let lane = &worker_lanes[route(&item) % worker_lanes.len()];
                    let _ = lane.send(item).await;
                }
            }
        }
    });

    let on_drained = propagate_completion.then(|| {
        Box::pin(async move {
            for lane in &lanes {
                lane.complete().await;
            }
        }) as BoxFuture<'static, ()>
    });
    supervise(name.to_string(), vec![join], done_tx, on_drained);
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_transform_forwards_to_action() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_action = Arc::clone(&seen);
        let action: ActionFn<i64> = Arc::new(move |n| {
            let seen = Arc::clone(&seen_in_action);
            Box::pin(async move {
                seen.fetch_add(n as usize, Ordering::SeqCst);
            })
        });
        let sink = spawn_action("sink", 16, 2, no_cancel(), action);

        let double: TransformFn<i64, i64> = Arc::new(|n| Box::pin(async move { vec![n * 2] }));
        let head = spawn_transform("double", 16, 2, no_cancel(), double, Arc::clone(&sink), true);

        for n in 1..=5 {
            head.send(n).await.unwrap();
        }
        head.complete().await;
        sink.wait_complete().await;

        // 2 + 4 + 6 + 8 + 10
        assert_eq!(seen.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn test_offer_reports_full() {
        let slow: ActionFn<i64> = Arc::new(|_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        });
        let sink = spawn_action("slow", 1, 1, no_cancel(), slow);

        // Capacity 1 plus one in-flight worker item; keep offering until
        // the queue reports Full.
        let mut full_seen = false;
        for n in 0..16 {
            match sink.offer(n).await {
                Ok(()) => continue,
                Err(OfferError::Full(_)) => {
                    full_seen = true;
                    break;
                }
                Err(OfferError::Closed) => panic!("stage closed unexpectedly"),
            }
        }
        assert!(full_seen);
    }

    #[tokio::test]
    async fn test_batch_coalesces_and_flushes_remainder() {
        let batches: Arc<Mutex<Vec<Vec<i64>>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_in_action = Arc::clone(&batches);
        let collect: ActionFn<Vec<i64>> = Arc::new(move |batch| {
            let batches = Arc::clone(&batches_in_action);
            Box::pin(async move {
                batches.lock().await.push(batch);
            })
        });
        let sink = spawn_action("collect", 16, 1, no_cancel(), collect);
        let batcher = spawn_batch(
            "batch",
            16,
            3,
            Duration::from_secs(3600),
            no_cancel(),
            Arc::clone(&sink),
            true,
        );

        for n in 1..=7 {
            batcher.send(n).await.unwrap();
        }
        batcher.complete().await;
        sink.wait_complete().await;

        let batches = batches.lock().await;
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|&s| s <= 3));
    }

    #[tokio::test]
    async fn test_broadcast_all_lanes_see_every_item() {
        let counts: Vec<Arc<AtomicUsize>> =
            (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let lanes: Vec<Arc<StageHandle<i64>>> = counts
            .iter()
            .map(|count| {
                let count = Arc::clone(count);
                let action: ActionFn<i64> = Arc::new(move |_| {
                    let count = Arc::clone(&count);
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                });
                spawn_action("lane", 16, 1, no_cancel(), action)
            })
            .collect();

        let head = spawn_broadcast(
            "fanout",
            16,
            no_cancel(),
            BroadcastMode::All,
            lanes.clone(),
            true,
        );
        for n in 0..10 {
            head.send(n).await.unwrap();
        }
        head.complete().await;
        for lane in &lanes {
            lane.wait_complete().await;
        }

        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 10);
        }
    }

    #[tokio::test]
    async fn test_route_key_partitions_items() {
        let counts: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let lanes: Vec<Arc<StageHandle<i64>>> = counts
            .iter()
            .map(|count| {
                let count = Arc::clone(count);
                let action: ActionFn<i64> = Arc::new(move |_| {
                    let count = Arc::clone(&count);
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                });
                spawn_action("lane", 16, 1, no_cancel(), action)
            })
            .collect();

        let head = spawn_broadcast(
            "route",
            16,
            no_cancel(),
            BroadcastMode::Route(Arc::new(|n: &i64| *n as usize)),
            lanes.clone(),
            true,
        );
        for n in 0..9 {
            head.send(n).await.unwrap();
        }
        head.complete().await;
        for lane in &lanes {
            lane.wait_complete().await;
        }

        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 3);
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let processed = Arc::new(AtomicUsize::new(0));
        let processed_in_action = Arc::clone(&processed);
        let action: ActionFn<i64> = Arc::new(move |_| {
            let processed = Arc::clone(&processed_in_action);
            Box::pin(async move {
                processed.fetch_add(1, Ordering::SeqCst);
            })
        });
        let sink = spawn_action("cancelable", 64, 1, cancel_rx, action);

        cancel_tx.send(true).unwrap();
        // Offers after cancellation may still be accepted by the queue,
        // but the worker pool exits without draining them all.
        for n in 0..32 {
            let _ = sink.offer(n).await;
        }
        sink.wait_complete().await;
        assert!(processed.load(Ordering::SeqCst) < 32);
    }
}
