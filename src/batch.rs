//! # Write-Batch Coalescer
//!
//! This module implements the batched write strategy for high-throughput
//! storage. Individual `set` calls are collected over a short window and
//! delivered to the backend as one grouped write, amortizing the cost of a
//! backend round-trip the same way group commit amortizes fsync:
//!
//! ```text
//! Without coalescing:              With coalescing:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ set1 → write → sync      │     │ queue: set1 set2 set3 …  │
//! │ set2 → write → sync      │     │ deadline or full batch   │
//! │ set3 → write → sync      │     │   → one grouped write    │
//! │ 100 round-trips          │     │ 1 round-trip             │
//! └──────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! ## Lifecycle of an Operation
//!
//! 1. `enqueue` appends `(key, value, completion)` to the FIFO queue. A full
//!    queue triggers exponential-backoff retries before giving up.
//! 2. Reaching `max_batch_size` schedules an immediate flush; otherwise the
//!    first queued operation arms a deadline timer of `max_wait`.
//! 3. `flush` detaches up to `max_batch_size` operations in FIFO order,
//!    invokes the executor under `operation_timeout`, and completes every
//!    detached slot with the group's outcome: all-or-nothing per partition.
//! 4. Flushes never overlap: a flush gate serializes dispatch, and a flush
//!    keeps draining partitions until the queue is empty.
//!
//! ## Ordering Guarantee
//!
//! Operations reach the executor in the same FIFO partition they were
//! enqueued in; within a partition, insertion order is preserved in the
//! slice handed to the executor. No cross-partition ordering is promised.
//!
//! ## Cancellation
//!
//! `clear` drops the queue without completing anyone: awaiting callers
//! observe a closed completion channel. This silent cancellation is the
//! documented contract, not an accident. Executor futures that outlive
//! `operation_timeout` are cancelled by drop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::value::Value;

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum operations per flushed partition.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default deadline before a partial batch is flushed.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);

/// Default time budget for one executor invocation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Enqueue retries before a full queue becomes an error.
pub const RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay for a full queue.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Backoff ceiling.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the coalescer.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Maximum operations per flushed partition.
    pub max_batch_size: usize,

    /// Deadline before a partial batch is flushed.
    pub max_wait: Duration,

    /// Time budget for one executor invocation.
    pub operation_timeout: Duration,

    /// Maximum queued operations before enqueue starts retrying.
    pub max_queue_size: usize,

    /// Full-queue retries before failing.
    pub retry_attempts: u32,

    /// First backoff delay; doubles per retry up to `retry_max_delay`.
    pub retry_initial_delay: Duration,

    /// Backoff ceiling.
    pub retry_max_delay: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_queue_size: DEFAULT_MAX_BATCH_SIZE * 100,
            retry_attempts: RETRY_ATTEMPTS,
            retry_initial_delay: RETRY_INITIAL_DELAY,
            retry_max_delay: RETRY_MAX_DELAY,
        }
    }
}

// =============================================================================
// Operations and Completions
// =============================================================================

/// A queued write: one key and its new value.
#[derive(Debug, Clone)]
pub struct BatchOp {
    /// The key being written.
    pub key: String,
    /// The value being written.
    pub value: Value,
}

/// The failure side of a partition outcome.
///
/// Cloneable so one observed failure can complete every slot in the
/// partition.
#[derive(Debug, Clone)]
pub enum BatchError {
    /// The executor exceeded `operation_timeout`.
    Timeout(Duration),
    /// The executor failed; the message is the observed error.
    Failed(String),
}

impl BatchError {
    /// Folds into the crate error taxonomy.
    pub fn into_error(self) -> Error {
        match self {
            BatchError::Timeout(budget) => Error::Timeout(budget),
            BatchError::Failed(message) => Error::Write(message),
        }
    }
}

/// Receives a partition's outcome, exactly once: unless the queue was
/// cleared, in which case the channel closes without a value.
pub type CompletionReceiver = oneshot::Receiver<std::result::Result<(), BatchError>>;

struct Pending {
    op: BatchOp,
    done: oneshot::Sender<std::result::Result<(), BatchError>>,
}

// =============================================================================
// Executor Seam
// =============================================================================

/// The grouped-write sink the coalescer drives.
///
/// The façade supplies an executor that forwards a partition to the backend's
/// batch primitive; tests supply recording or failing executors. The returned
/// future is raced against `operation_timeout` and cancelled by drop if it
/// loses.
pub trait BatchExecutor: Send + Sync + 'static {
    /// Persists one partition. All-or-nothing: an error fails every
    /// operation in the slice.
    fn execute(&self, ops: Vec<BatchOp>) -> BoxFuture<'static, Result<()>>;
}

// =============================================================================
// Coalescer
// =============================================================================

struct QueueState {
    queue: VecDeque<Pending>,
    deadline: Option<JoinHandle<()>>,
    flushing: bool,
}

/// The write-batch coalescer.
///
/// Created behind `Arc`; it keeps a weak handle to itself so deadline
/// timers and immediate-flush tasks can call back in without keeping the
/// coalescer alive.
pub struct BatchCoalescer {
    config: CoalescerConfig,
    executor: Arc<dyn BatchExecutor>,
    state: Mutex<QueueState>,
    /// Serializes flush dispatch; concurrent flushes queue up here.
    flush_gate: tokio::sync::Mutex<()>,
    weak_self: Weak<BatchCoalescer>,
}

impl BatchCoalescer {
    /// Creates a coalescer draining into `executor`.
    pub fn new(config: CoalescerConfig, executor: Arc<dyn BatchExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            executor,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                deadline: None,
                flushing: false,
            }),
            flush_gate: tokio::sync::Mutex::new(()),
            weak_self: weak_self.clone(),
        })
    }

    /// Current queue length.
    pub fn size(&self) -> usize {
        self.state.lock().expect("batch lock").queue.len()
    }

    /// Enqueues a write and returns its completion receiver.
    ///
    /// When the queue is full, waits the retry delay, doubles it (capped),
    /// and retries up to the configured attempts before failing with a
    /// queue-full write error.
    pub async fn enqueue(&self, op: BatchOp) -> Result<CompletionReceiver> {
        let mut delay = self.config.retry_initial_delay;

        for attempt in 0..=self.config.retry_attempts {
            let mut op_slot = Some(op.clone());
            {
                let mut state = self.state.lock().expect("batch lock");
                if state.queue.len() < self.config.max_queue_size {
                    let (done, rx) = oneshot::channel();
                    state.queue.push_back(Pending {
                        op: op_slot.take().expect("op"),
                        done,
                    });

                    if state.queue.len() == self.config.max_batch_size {
                        // Full partition: flush now, deadline no longer needed.
                        // The flush loop drains anything queued past this point.
                        if let Some(timer) = state.deadline.take() {
                            timer.abort();
                        }
                        self.spawn_flush();
                    } else if state.deadline.is_none() && !state.flushing {
                        self.arm_deadline(&mut state);
                    }
                    return Ok(rx);
                }
            }

            if attempt == self.config.retry_attempts {
                break;
            }
            tracing::debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "batch queue full, backing off"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.retry_max_delay);
        }

        Err(Error::Write(format!(
            "batch queue is full ({} operations)",
            self.config.max_queue_size
        )))
    }

    /// Drains the queue, partition by partition, completing every detached
    /// slot with its partition's outcome.
    ///
    /// Awaits any in-progress flush before dispatching; flushes never
    /// overlap. Returns once the queue observed empty.
    pub async fn flush(&self) {
        let _gate = self.flush_gate.lock().await;

        loop {
            let batch: Vec<Pending> = {
                let mut state = self.state.lock().expect("batch lock");
                if let Some(timer) = state.deadline.take() {
                    timer.abort();
                }
                if state.queue.is_empty() {
                    state.flushing = false;
                    return;
                }
                state.flushing = true;
                let take = state.queue.len().min(self.config.max_batch_size);
                state.queue.drain(..take).collect()
            };

            let mut ops = Vec::with_capacity(batch.len());
            let mut completions = Vec::with_capacity(batch.len());
            for pending in batch {
                ops.push(pending.op);
                completions.push(pending.done);
            }

            let outcome =
                match timeout(self.config.operation_timeout, self.executor.execute(ops)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(BatchError::Failed(e.to_string())),
                    Err(_) => Err(BatchError::Timeout(self.config.operation_timeout)),
                };

            if let Err(e) = &outcome {
                tracing::warn!(error = ?e, "batch partition failed");
            }

            for done in completions {
                let _ = done.send(outcome.clone());
            }
        }
    }

    /// Drops the queue and disarms the timer, completing no callers.
    ///
    /// Pending completion channels close without a value: the documented
    /// silent cancellation of queued writes.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("batch lock");
        if let Some(timer) = state.deadline.take() {
            timer.abort();
        }
        state.queue.clear();
    }

    /// Arms the deadline timer. The timer clears its own registration before
    /// flushing so the flush cannot abort the very task running it.
    fn arm_deadline(&self, state: &mut QueueState) {
        let weak = self.weak_self.clone();
        let wait = self.config.max_wait;
        state.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(coalescer) = weak.upgrade() {
                {
                    let mut state = coalescer.state.lock().expect("batch lock");
                    state.deadline = None;
                }
                coalescer.flush().await;
            }
        }));
    }

    /// Schedules an immediate flush on its own task.
    fn spawn_flush(&self) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(coalescer) = weak.upgrade() {
                coalescer.flush().await;
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
