//! Work queue carrying job ids from the gateway to workers.
//!
//! Delivery is at-least-once: a dequeued item stays invisible for the
//! visibility window and reappears if it is not acknowledged in time. The
//! queue never decides whether a job should run; that is the job store's
//! claim. A duplicate delivery is harmless because the second claim fails.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::common::JobId;

/// One delivery of a job id to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Identifies this delivery for extend/ack/release.
    pub receipt: Uuid,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Make a job id available to workers. Enqueuing an id that is already
    /// queued keeps its position and makes it visible now if it was hidden.
    async fn enqueue(&self, job_id: JobId) -> Result<()>;

    /// Take the next visible item and hide it for `visibility`.
    async fn dequeue(&self, worker_id: &str, visibility: Duration) -> Result<Option<Delivery>>;

    /// Push the visibility deadline out. Returns false if the receipt is stale.
    async fn extend(&self, receipt: Uuid, visibility: Duration) -> Result<bool>;

    /// Remove the item for good.
    async fn ack(&self, receipt: Uuid) -> Result<()>;

    /// Give the item back, visible again after `delay`.
    async fn release(&self, receipt: Uuid, delay: Duration) -> Result<()>;

    /// Items held by the queue, visible or not.
    async fn pending(&self) -> Result<usize>;
}

#[derive(Debug)]
struct InFlight {
    job_id: JobId,
    delivery_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(JobId, Instant)>,
    in_flight: HashMap<Uuid, InFlight>,
    deliveries: HashMap<JobId, u32>,
}

impl QueueState {
    /// Move in-flight items whose visibility ran out back to the ready list.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, item)| item.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(item) = self.in_flight.remove(&receipt) {
                self.ready.push_back((item.job_id, now));
            }
        }
    }

    fn contains(&self, job_id: JobId) -> bool {
        self.ready.iter().any(|(id, _)| *id == job_id)
            || self.in_flight.values().any(|item| item.job_id == job_id)
    }
}

/// Process-local queue. Ordering is FIFO among visible items.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if !state.contains(job_id) {
            state.ready.push_back((job_id, now));
            return Ok(());
        }
        // Already held: keep its place, only pull a deferred or leased item forward.
        for (id, visible_at) in state.ready.iter_mut() {
            if *id == job_id && *visible_at > now {
                *visible_at = now;
            }
        }
        for item in state.in_flight.values_mut() {
            if item.job_id == job_id && item.visible_at > now {
                item.visible_at = now;
            }
        }
        Ok(())
    }

    async fn dequeue(&self, _worker_id: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.requeue_expired(now);

        let Some(position) = state.ready.iter().position(|(_, visible_at)| *visible_at <= now) else {
            return Ok(None);
        };
        let Some((job_id, _)) = state.ready.remove(position) else {
            return Ok(None);
        };

        let count = state.deliveries.entry(job_id).or_insert(0);
        *count += 1;
        let delivery_count = *count;

        let receipt = Uuid::new_v4();
        state.in_flight.insert(
            receipt,
            InFlight {
                job_id,
                delivery_count,
                visible_at: now + visibility,
            },
        );

        Ok(Some(Delivery {
            job_id,
            receipt,
            delivery_count,
        }))
    }

    async fn extend(&self, receipt: Uuid, visibility: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(&receipt) {
            Some(item) => {
                item.visible_at = Instant::now() + visibility;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, receipt: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.in_flight.remove(&receipt) {
            if !state.contains(item.job_id) {
                state.deliveries.remove(&item.job_id);
            }
        }
        Ok(())
    }

    async fn release(&self, receipt: Uuid, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.in_flight.remove(&receipt) {
            state.ready.push_back((item.job_id, Instant::now() + delay));
        }
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.ready.len() + state.in_flight.len())
    }
}
