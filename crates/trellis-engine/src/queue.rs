use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::warn;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::JobQueue;
use trellis_core::types::{Delivery, Job};

/// In-process FIFO job queue with at-least-once delivery.
///
/// A dequeued job sits in an in-flight table until acknowledged; if the
/// visibility timeout passes first (worker died mid-job), the job goes back
/// to the front of the queue and is delivered again. A broker-backed queue
/// can replace this behind the same trait.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    visibility: Duration,
    next_receipt: AtomicU64,
}

struct QueueInner {
    ready: VecDeque<Job>,
    in_flight: HashMap<u64, InFlight>,
}

struct InFlight {
    job: Job,
    taken_at: Instant,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            notify: Notify::new(),
            visibility: visibility_timeout,
            next_receipt: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|e| TrellisError::Queue(e.to_string()))
    }

    /// Move expired in-flight jobs back to the ready queue.
    fn redeliver_expired(&self, inner: &mut QueueInner) {
        let expired: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.taken_at.elapsed() >= self.visibility)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(flight) = inner.in_flight.remove(&receipt) {
                warn!(
                    run_id = %flight.job.run_id,
                    node_id = %flight.job.node_id,
                    "Job visibility timeout expired, redelivering"
                );
                inner.ready.push_front(flight.job);
            }
        }
    }

    /// Number of jobs currently waiting or in flight.
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.ready.len() + inner.in_flight.len())
            .unwrap_or(0)
    }
}

impl JobQueue for MemoryQueue {
    fn enqueue(&self, job: Job) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock()?.ready.push_back(job);
            self.notify.notify_one();
            Ok(())
        })
    }

    fn dequeue(&self) -> BoxFuture<'_, Result<Delivery>> {
        Box::pin(async move {
            loop {
                {
                    let mut inner = self.lock()?;
                    self.redeliver_expired(&mut inner);
                    if let Some(job) = inner.ready.pop_front() {
                        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
                        inner.in_flight.insert(
                            receipt,
                            InFlight {
                                job: job.clone(),
                                taken_at: Instant::now(),
                            },
                        );
                        return Ok(Delivery { receipt, job });
                    }
                }
                // Wake on enqueue, or periodically to notice expired in-flight jobs
                let _ = tokio::time::timeout(Duration::from_millis(250), self.notify.notified())
                    .await;
            }
        })
    }

    fn ack(&self, receipt: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock()?.in_flight.remove(&receipt);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::types::RunId;

    fn job(node: &str) -> Job {
        Job {
            run_id: RunId::from_string("run-1"),
            workflow_id: "wf-1".into(),
            node_id: node.into(),
            input: json!({}),
        }
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.enqueue(job("a")).await.expect("enqueue");
        queue.enqueue(job("b")).await.expect("enqueue");

        let first = queue.dequeue().await.expect("dequeue");
        let second = queue.dequeue().await.expect("dequeue");
        assert_eq!(first.job.node_id, "a");
        assert_eq!(second.job.node_id, "b");
    }

    #[tokio::test]
    async fn ack_removes_in_flight() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.enqueue(job("a")).await.expect("enqueue");

        let delivery = queue.dequeue().await.expect("dequeue");
        assert_eq!(queue.depth(), 1);
        queue.ack(delivery.receipt).await.expect("ack");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn unacked_job_is_redelivered() {
        let queue = MemoryQueue::new(Duration::from_millis(50));
        queue.enqueue(job("a")).await.expect("enqueue");

        // Dequeue and never ack: the worker "crashed"
        let first = queue.dequeue().await.expect("dequeue");
        assert_eq!(first.job.node_id, "a");

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = queue.dequeue().await.expect("dequeue");
        assert_eq!(second.job.node_id, "a");
        assert_ne!(first.receipt, second.receipt);

        queue.ack(second.receipt).await.expect("ack");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(MemoryQueue::new(Duration::from_secs(60)));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(job("late")).await.expect("enqueue");
        let delivery = waiter.await.expect("join").expect("dequeue");
        assert_eq!(delivery.job.node_id, "late");
    }
}
