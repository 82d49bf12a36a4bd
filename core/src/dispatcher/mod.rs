//! C5 — bounded-parallelism FIFO gateway: caps in-flight inferences and
//! queues excess requests with observable positions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Active,
    Streaming,
    Done,
    Failed,
    Cancelled,
}

pub struct Ticket {
    pub queue_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStats {
    pub depth: usize,
    pub active: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
    pub completed_total: u64,
}

struct RequestHandle {
    state: RwLock<RequestState>,
    cancel: CancellationToken,
    enqueued_at: Instant,
    deadline: Duration,
}

/// Guard returned by [`Dispatcher::acquire`]; holds the in-flight slot until
/// dropped, at which point the slot is released and another queued request
/// may be admitted.
pub struct Admission {
    queue_id: Uuid,
    dispatcher: std::sync::Arc<DispatcherInner>,
}

impl Admission {
    pub fn queue_id(&self) -> Uuid {
        self.queue_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.dispatcher
            .requests
            .get(&self.queue_id)
            .map(|h| h.cancel.clone())
            .unwrap_or_else(CancellationToken::new)
    }

    pub fn mark_streaming(&self) {
        self.dispatcher.set_state(self.queue_id, RequestState::Streaming);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.dispatcher.active_count.fetch_sub(1, Ordering::SeqCst);
        self.dispatcher.notify.notify_waiters();
    }
}

struct DispatcherInner {
    max_concurrent: usize,
    max_queue_depth: usize,
    default_deadline: Duration,
    queue: Mutex<VecDeque<Uuid>>,
    requests: dashmap::DashMap<Uuid, RequestHandle>,
    active_count: AtomicUsize,
    notify: Notify,
    admitted_total: AtomicU64,
    rejected_total: AtomicU64,
    completed_total: AtomicU64,
}

impl DispatcherInner {
    fn set_state(&self, queue_id: Uuid, state: RequestState) {
        if let Some(handle) = self.requests.get(&queue_id) {
            *handle.state.write() = state;
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: std::sync::Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(max_concurrent: usize, max_queue_depth: usize, default_deadline: Duration) -> Self {
        Self {
            inner: std::sync::Arc::new(DispatcherInner {
                max_concurrent,
                max_queue_depth,
                default_deadline,
                queue: Mutex::new(VecDeque::new()),
                requests: dashmap::DashMap::new(),
                active_count: AtomicUsize::new(0),
                notify: Notify::new(),
                admitted_total: AtomicU64::new(0),
                rejected_total: AtomicU64::new(0),
                completed_total: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueues a request. Priority, if present, is explicitly ignored — it
    /// is reserved for a future admission scheduler this core never builds.
    pub fn submit(&self) -> GatewayResult<Ticket> {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.max_queue_depth {
            self.inner.rejected_total.fetch_add(1, Ordering::SeqCst);
            return Err(GatewayError::QueueFull {
                depth: queue.len(),
                estimated_wait_secs: (queue.len() as u64) * 5,
            });
        }
        let queue_id = Uuid::new_v4();
        queue.push_back(queue_id);
        self.inner.requests.insert(
            queue_id,
            RequestHandle {
                state: RwLock::new(RequestState::Queued),
                cancel: CancellationToken::new(),
                enqueued_at: Instant::now(),
                deadline: self.inner.default_deadline,
            },
        );
        self.inner.admitted_total.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        Ok(Ticket { queue_id })
    }

    /// Waits until `queue_id` reaches the head of the queue and a worker
    /// slot is free, or until its end-to-end deadline or cancellation fires
    /// first.
    pub async fn acquire(&self, queue_id: Uuid) -> GatewayResult<Admission> {
        let (deadline, cancel) = {
            let handle = self
                .inner
                .requests
                .get(&queue_id)
                .ok_or(GatewayError::NotFound)?;
            (handle.deadline, handle.cancel.clone())
        };
        let deadline_fut = tokio::time::sleep(deadline.saturating_sub(
            self.inner
                .requests
                .get(&queue_id)
                .map(|h| h.enqueued_at.elapsed())
                .unwrap_or_default(),
        ));
        tokio::pin!(deadline_fut);

        loop {
            if cancel.is_cancelled() {
                self.inner.set_state(queue_id, RequestState::Cancelled);
                return Err(GatewayError::Cancelled);
            }
            {
                let mut queue = self.inner.queue.lock();
                let at_head = queue.front() == Some(&queue_id);
                if at_head
                    && self.inner.active_count.load(Ordering::SeqCst) < self.inner.max_concurrent
                {
                    queue.pop_front();
                    self.inner.active_count.fetch_add(1, Ordering::SeqCst);
                    drop(queue);
                    self.inner.set_state(queue_id, RequestState::Active);
                    return Ok(Admission {
                        queue_id,
                        dispatcher: self.inner.clone(),
                    });
                }
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = &mut deadline_fut => {
                    self.cancel(queue_id);
                    return Err(GatewayError::Timeout(deadline));
                }
                _ = cancel.cancelled() => {
                    self.inner.set_state(queue_id, RequestState::Cancelled);
                    return Err(GatewayError::Cancelled);
                }
            }
        }
    }

    /// `0` iff active/streaming, positive 1-based FIFO position while
    /// queued, `-1` once terminal, `-2` if unknown.
    pub fn position(&self, queue_id: Uuid) -> i64 {
        let Some(handle) = self.inner.requests.get(&queue_id) else {
            return -2;
        };
        let state = *handle.state.read();
        let result = match state {
            RequestState::Active | RequestState::Streaming => 0,
            RequestState::Done | RequestState::Failed | RequestState::Cancelled => -1,
            RequestState::Queued => {
                let queue = self.inner.queue.lock();
                match queue.iter().position(|id| *id == queue_id) {
                    Some(idx) => (idx + 1) as i64,
                    None => -2,
                }
            }
        };
        result
    }

    /// Queued -> cancelled immediately; active -> cancelled cooperatively by
    /// signaling the request's token. The slot itself is released when the
    /// holder's [`Admission`] is dropped, not synchronously here.
    pub fn cancel(&self, queue_id: Uuid) {
        let Some(handle) = self.inner.requests.get(&queue_id) else {
            return;
        };
        let was_queued = matches!(*handle.state.read(), RequestState::Queued);
        if was_queued {
            self.inner.queue.lock().retain(|id| *id != queue_id);
        }
        handle.cancel.cancel();
        if matches!(
            *handle.state.read(),
            RequestState::Done | RequestState::Failed | RequestState::Cancelled
        ) {
            return;
        }
        *handle.state.write() = RequestState::Cancelled;
        self.inner.notify.notify_waiters();
    }

    /// Records a terminal outcome and counts it. A no-op if the request is
    /// already terminal (cancelling a `done` request is a no-op).
    pub fn complete(&self, queue_id: Uuid, failed: bool) {
        if let Some(handle) = self.inner.requests.get(&queue_id) {
            let mut state = handle.state.write();
            if matches!(*state, RequestState::Done | RequestState::Cancelled) {
                return;
            }
            *state = if failed {
                RequestState::Failed
            } else {
                RequestState::Done
            };
        }
        self.inner.completed_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            depth: self.inner.queue.lock().len(),
            active: self.inner.active_count.load(Ordering::SeqCst),
            admitted_total: self.inner.admitted_total.load(Ordering::SeqCst),
            rejected_total: self.inner.rejected_total.load(Ordering::SeqCst),
            completed_total: self.inner.completed_total.load(Ordering::SeqCst),
        }
    }
}
