//! ID batching for bulk reference lookups.
//!
//! [`IdBatcher`] collects requested IDs and hands them to a callback as deduplicated batches, so
//! that scattered lookups turn into a handful of bulk list calls instead of one request per ID.
//!
//! # Flush triggers
//!
//! ```text
//! enqueue(id) ─→ [queued set, first-seen order]
//!                      │
//!          ┌───────────┼──────────────────────────┐
//!          ↓           ↓                          ↓
//!   len == batch_size  no enqueue for `debounce`  `max_wait` since first ID
//!   (sync, in enqueue) (timer, reset per enqueue) (clamps the debounce timer)
//!          └───────────┴──────────────────────────┘
//!                      ↓
//!            on_batch_ready(ids), state cleared
//! ```
//!
//! The debounce timer restarts on every `enqueue`, including repeats of an ID that is already
//! queued. Without `max_wait`, a stream of enqueues spaced closer than `debounce` never flushes
//! by timer; `max_wait` bounds how long the first ID of a batch can be held back.
//!
//! The batcher does no I/O. The callback runs outside the internal lock, so it may enqueue
//! again.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::BatcherConfig;
use crate::errors::{Error, Result};
use crate::types::ReferenceId;

/// Callback receiving each flushed batch.
pub type BatchCallback = Arc<dyn Fn(Vec<ReferenceId>) + Send + Sync>;

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Debounce,
    MaxWait,
    Manual,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Debounce => "debounce",
            FlushTrigger::MaxWait => "max_wait",
            FlushTrigger::Manual => "manual",
        }
    }
}

#[derive(Default)]
struct BatchState {
    queued: Vec<ReferenceId>,
    seen: HashSet<ReferenceId>,
    first_enqueued_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is re-armed or the batch is taken; a timer only flushes if
    /// the sequence it was armed with is still current.
    timer_seq: u64,
}

impl BatchState {
    fn take(&mut self) -> Vec<ReferenceId> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_seq = self.timer_seq.wrapping_add(1);
        self.seen.clear();
        self.first_enqueued_at = None;
        std::mem::take(&mut self.queued)
    }
}

struct Inner {
    config: BatcherConfig,
    label: String,
    on_batch_ready: BatchCallback,
    runtime: Option<Handle>,
    state: Mutex<BatchState>,
}

impl Inner {
    fn deliver(&self, ids: Vec<ReferenceId>, trigger: FlushTrigger) {
        if ids.is_empty() {
            return;
        }

        counter!("refcache_batches_flushed_total", "resource_type" => self.label.clone(), "trigger" => trigger.as_str()).increment(1);
        histogram!("refcache_batch_size", "resource_type" => self.label.clone()).record(ids.len() as f64);
        debug!(resource_type = %self.label, batch_size = ids.len(), trigger = trigger.as_str(), "Flushing ID batch");

        (self.on_batch_ready)(ids);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Deduplicating ID batcher with size, debounce and max-wait flush triggers.
///
/// Cloning is cheap and clones share the same queue.
#[derive(Clone)]
pub struct IdBatcher {
    inner: Arc<Inner>,
}

impl IdBatcher {
    /// Creates a batcher that calls `on_batch_ready` with every flushed batch.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the configuration has no flush trigger, or if a
    /// debounce is configured but no Tokio runtime is available to run the timer.
    pub fn new<F>(config: &BatcherConfig, on_batch_ready: F) -> Result<Self>
    where
        F: Fn(Vec<ReferenceId>) + Send + Sync + 'static,
    {
        config.validate()?;

        let runtime = Handle::try_current().ok();
        if config.debounce.is_some() && runtime.is_none() {
            return Err(Error::InvalidConfig {
                message: "a debounced batcher must be created inside a Tokio runtime".to_string(),
            });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                label: "unlabelled".to_string(),
                on_batch_ready: Arc::new(on_batch_ready),
                runtime,
                state: Mutex::new(BatchState::default()),
            }),
        })
    }

    /// Sets the label used for logs and metrics (usually the resource type).
    ///
    /// Must be called before the batcher is cloned.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.label = label.into();
        }
        self
    }

    /// Adds `id` to the current batch.
    ///
    /// Flushes synchronously when the batch reaches `batch_size` unique IDs; otherwise
    /// (re)starts the debounce timer.
    pub fn enqueue(&self, id: impl Into<ReferenceId>) {
        let id = id.into();
        let flushed = {
            let mut state = self.inner.state.lock();

            if state.seen.insert(id.clone()) {
                trace!(resource_type = %self.inner.label, id = %id, "Queued ID");
                state.queued.push(id);
                if state.first_enqueued_at.is_none() {
                    state.first_enqueued_at = Some(Instant::now());
                }
            }

            match self.inner.config.batch_size {
                Some(batch_size) if state.queued.len() >= batch_size => Some(state.take()),
                _ => {
                    self.arm_timer(&mut state);
                    None
                }
            }
        };

        if let Some(ids) = flushed {
            self.inner.deliver(ids, FlushTrigger::Size);
        }
    }

    /// Flushes whatever is queued right now. Returns the number of IDs flushed.
    pub fn flush_now(&self) -> usize {
        let ids = self.inner.state.lock().take();
        let count = ids.len();
        self.inner.deliver(ids, FlushTrigger::Manual);
        count
    }

    /// Drops the queued IDs without flushing them.
    pub fn clear(&self) -> usize {
        self.inner.state.lock().take().len()
    }

    /// Number of unique IDs waiting for the next flush.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn arm_timer(&self, state: &mut BatchState) {
        let (Some(debounce), Some(runtime)) = (self.inner.config.debounce, self.inner.runtime.as_ref()) else {
            return;
        };

        let mut deadline = Instant::now() + debounce;
        let mut trigger = FlushTrigger::Debounce;
        if let (Some(max_wait), Some(first)) = (self.inner.config.max_wait, state.first_enqueued_at) {
            let ceiling = first + max_wait;
            if ceiling <= deadline {
                deadline = ceiling;
                trigger = FlushTrigger::MaxWait;
            }
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer_seq = state.timer_seq.wrapping_add(1);
        let seq = state.timer_seq;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let ids = {
                let mut state = inner.state.lock();
                if state.timer_seq != seq {
                    return;
                }
                // Detach our own handle so `take` doesn't abort the running task
                state.timer = None;
                state.take()
            };
            inner.deliver(ids, trigger);
        }));
    }
}

impl std::fmt::Debug for IdBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdBatcher")
            .field("label", &self.inner.label)
            .field("config", &self.inner.config)
            .field("queued", &self.len())
            .finish()
    }
}
