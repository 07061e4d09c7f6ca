//! Capture lifecycle: configure → per-flow capture → shutdown.
//!
//! The controller is driven by the external proxy engine's hooks. Encoding
//! and timing reconstruction run in the calling worker context with no
//! shared state; only the hand-off to the writer (or the bounded queue)
//! touches the shared mutex domain, keeping the engine's hot path bounded
//! to one short critical section.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CaptureConfig, OverflowPolicy, QueueMode};
use crate::encode::encode_flow;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{FlowRecord, FlowSnapshot};
use crate::writer::{AppendWriter, RecordSink};

/// How long `shutdown` waits for the queue drain task before force-closing.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum URL length echoed into per-flow debug logs.
const LOG_URL_MAX: usize = 80;

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

enum CaptureState {
    Unconfigured,
    Open(Active),
    Closed,
}

struct Active {
    writer: Arc<AppendWriter>,
    queue: Option<QueueHandle>,
}

/// Owns the capture pipeline and its state machine:
/// `Unconfigured → Open → Closed`, with `Open → Open` on reconfigure and
/// `Closed → Open` only via a fresh [`configure`](Self::configure).
pub struct CaptureController {
    state: Mutex<CaptureState>,
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CaptureState::Unconfigured),
        }
    }

    /// Open (or replace) the capture target. On failure the previous state,
    /// including a previously open handle, is left untouched. When replacing
    /// an open target, records already accepted keep draining to the old
    /// handle, which closes once they are out; nothing is lost or
    /// duplicated.
    ///
    /// Queued mode spawns a drain task and therefore requires a running
    /// Tokio runtime.
    pub fn configure(&self, config: &CaptureConfig) -> CaptureResult<()> {
        if let Some(parent) = config.output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CaptureError::Config(format!(
                        "cannot create parent directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let writer = Arc::new(AppendWriter::open(&config.output, config.durability)?);
        let queue = match config.queue {
            QueueMode::Direct => None,
            QueueMode::Queued { capacity, policy } => {
                Some(QueueHandle::spawn(writer.clone(), capacity, policy))
            }
        };

        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, CaptureState::Open(Active { writer, queue }))
        };
        if let CaptureState::Open(old) = previous {
            old.retire();
        }
        info!(path = %config.output.display(), "capture log opened");
        Ok(())
    }

    /// Engine hook: encode and persist one completed flow. All failures are
    /// logged and contained; a bad flow never stops capture of later flows.
    pub fn on_flow_completed(&self, snapshot: FlowSnapshot) {
        let flow_id = snapshot.id.clone();
        if let Err(e) = self.capture(snapshot) {
            warn!(flow_id, "error capturing flow: {e}");
        }
    }

    /// Fallible capture path; [`on_flow_completed`](Self::on_flow_completed)
    /// is the contain-and-log wrapper around this.
    pub fn capture(&self, snapshot: FlowSnapshot) -> CaptureResult<()> {
        let record = encode_flow(&snapshot)?;
        debug!(
            method = %record.request.method,
            url = %truncated(&record.request.url),
            "captured flow"
        );

        let shared = {
            let state = self.state.lock();
            match &*state {
                CaptureState::Open(active) => match &active.queue {
                    Some(queue) => queue.shared.clone(),
                    // Direct mode appends under the state lock: a concurrent
                    // reconfigure or shutdown cannot retire the handle out
                    // from under an in-flight append.
                    None => return active.writer.append(&record),
                },
                CaptureState::Unconfigured => {
                    return Err(CaptureError::Config("capture is not configured".into()))
                }
                CaptureState::Closed => return Err(CaptureError::Closed),
            }
        };
        // Queue admission happens outside the state lock so a producer
        // blocked on a full queue can never stall reconfigure or shutdown.
        shared.enqueue(record)
    }

    /// Total records evicted by the `DropOldest` overflow policy.
    pub fn dropped_records(&self) -> u64 {
        match &*self.state.lock() {
            CaptureState::Open(active) => active
                .queue
                .as_ref()
                .map_or(0, |q| q.shared.dropped.load(Ordering::Relaxed)),
            _ => 0,
        }
    }

    /// Drain pending records (bounded by [`SHUTDOWN_DRAIN_TIMEOUT`]), flush
    /// and close the handle. Idempotent; appends afterwards fail until a
    /// fresh `configure`.
    pub async fn shutdown(&self) -> CaptureResult<()> {
        let previous = {
            let mut state = self.state.lock();
            if !matches!(*state, CaptureState::Open(_)) {
                return Ok(());
            }
            std::mem::replace(&mut *state, CaptureState::Closed)
        };
        let CaptureState::Open(active) = previous else {
            unreachable!("checked Open above");
        };

        if let Some(queue) = active.queue {
            queue.shared.begin_close();
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, queue.task).await {
                Ok(join) => {
                    if let Err(e) = join {
                        warn!("queue drain task failed: {e}");
                    }
                }
                Err(_) => {
                    warn!(
                        pending = queue.shared.len(),
                        "drain timed out, force-closing capture log"
                    );
                }
            }
        }
        // Close is idempotent, so this is safe whether or not the drain task
        // already closed the writer on its way out.
        let result = active.writer.close();
        info!("capture log closed");
        result
    }
}

impl Active {
    /// Retire a replaced target: queued records keep draining in the
    /// background and the old handle closes after them; a direct target
    /// closes immediately.
    fn retire(self) {
        match self.queue {
            Some(queue) => queue.shared.begin_close(),
            None => {
                if let Err(e) = self.writer.close() {
                    warn!("closing replaced capture log failed: {e}");
                }
            }
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if let CaptureState::Open(active) = &*self.state.lock() {
            if let Some(queue) = &active.queue {
                queue.shared.begin_close();
            }
            if let Err(e) = active.writer.flush() {
                warn!("final capture log flush failed: {e}");
            }
        }
    }
}

fn truncated(url: &str) -> String {
    url.chars().take(LOG_URL_MAX).collect()
}

// ---------------------------------------------------------------------------
// Bounded record queue (Queued mode)
// ---------------------------------------------------------------------------

/// Bounded hand-off between engine workers and the single drain task.
/// Admission runs under a plain mutex so producers pay queue admission, not
/// disk latency; the drain task owns all writer I/O.
struct QueueShared {
    records: Mutex<VecDeque<FlowRecord>>,
    /// Signals producers blocked on a full queue (Block policy).
    space: Condvar,
    /// Wakes the drain task on arrival or close.
    arrival: Notify,
    closing: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
}

struct QueueHandle {
    shared: Arc<QueueShared>,
    task: JoinHandle<()>,
}

impl QueueHandle {
    fn spawn(writer: Arc<AppendWriter>, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let shared = Arc::new(QueueShared {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            arrival: Notify::new(),
            closing: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity,
            policy,
        });
        let task = tokio::spawn(drain_task(shared.clone(), writer));
        Self { shared, task }
    }
}

impl QueueShared {
    fn enqueue(&self, record: FlowRecord) -> CaptureResult<()> {
        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            if self.closing.load(Ordering::Acquire) {
                return Err(CaptureError::Closed);
            }
            match self.policy {
                OverflowPolicy::DropOldest => {
                    records.pop_front();
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(dropped, "capture queue full, dropping oldest record");
                }
                OverflowPolicy::Block => self.space.wait(&mut records),
            }
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(CaptureError::Closed);
        }
        records.push_back(record);
        drop(records);
        self.arrival.notify_one();
        Ok(())
    }

    fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.arrival.notify_one();
        // Unstick producers blocked on a full queue; they observe `closing`.
        self.space.notify_all();
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// Single consumer: drains batches to the writer until told to close, then
/// flushes and closes the handle so the last accepted record is durable.
async fn drain_task(shared: Arc<QueueShared>, writer: Arc<AppendWriter>) {
    loop {
        let batch: Vec<FlowRecord> = {
            let mut records = shared.records.lock();
            records.drain(..).collect()
        };
        if batch.is_empty() {
            if shared.closing.load(Ordering::Acquire) {
                break;
            }
            shared.arrival.notified().await;
            continue;
        }
        shared.space.notify_all();
        for record in &batch {
            if let Err(e) = writer.append(record) {
                warn!(record_id = %record.id, "queued append failed: {e}");
            }
        }
    }
    if let Err(e) = writer.close() {
        warn!("closing drained capture log failed: {e}");
    }
}
