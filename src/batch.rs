//! Per-namespace batch writer.
//!
//! Operations submitted through [`BatchWriter::add`] are collected by a single task and cut into
//! a batch when `maxOperationsPerBatch` (at the current ledger height) is reached or when the
//! batch timeout expires. Each batch is anchored in CAS and its operations are appended to the
//! operation store. Stopping flushes whatever is pending.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    cas::Cas,
    id::new_batch_id,
    opstore::{Operation, OperationStore},
    protocol::ProtocolVersionSet,
};

pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    Invalid { reason: String },
    Busy,
    Stopped,
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { reason } => write!(f, "invalid operation: {reason}"),
            Self::Busy => write!(f, "batch writer queue is full"),
            Self::Stopped => write!(f, "batch writer is stopped"),
        }
    }
}

impl std::error::Error for BatchError {}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_BATCH_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Collaborators of one writer, bound to a (channel, namespace).
#[derive(Clone)]
pub struct BatchContext {
    pub channel_id: String,
    pub namespace: String,
    pub opstore: Arc<OperationStore>,
    pub protocol: ProtocolVersionSet,
    pub cas: Arc<dyn Cas>,
}

#[derive(Debug, Default)]
struct BatchCounters {
    submitted: AtomicU64,
    written: AtomicU64,
    batches: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub submitted: u64,
    pub written: u64,
    pub batches: u64,
    pub failed: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnchoredBatch<'a> {
    batch_id: String,
    namespace: &'a str,
    operations: &'a [Operation],
}

enum Command {
    Add(Operation),
    Flush(oneshot::Sender<()>),
    Stop,
}

pub struct BatchWriter {
    namespace: String,
    tx: mpsc::Sender<Command>,
    counters: Arc<BatchCounters>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub fn spawn_batch_writer(ctx: BatchContext, opts: BatchOptions) -> BatchWriter {
    let (tx, rx) = mpsc::channel(opts.queue_capacity.max(1));
    let counters = Arc::new(BatchCounters::default());
    let namespace = ctx.namespace.clone();

    info!(
        channel_id = %ctx.channel_id,
        namespace = %ctx.namespace,
        timeout_ms = opts.timeout.as_millis() as u64,
        "batch writer started"
    );
    let task = tokio::spawn(batch_task(ctx, opts, rx, counters.clone()));

    BatchWriter {
        namespace,
        tx,
        counters,
        stopped: AtomicBool::new(false),
        task: Mutex::new(Some(task)),
    }
}

impl BatchWriter {
    /// Queues `operation` and returns its fully qualified id. Never waits for the batch.
    pub fn add(&self, mut operation: Operation) -> Result<String, BatchError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BatchError::Stopped);
        }
        operation
            .normalize(&self.namespace)
            .map_err(|e| BatchError::Invalid {
                reason: e.to_string(),
            })?;
        let id = operation.id.clone();
        self.tx
            .try_send(Command::Add(operation))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => BatchError::Busy,
                mpsc::error::TrySendError::Closed(_) => BatchError::Stopped,
            })?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Writes out everything queued so far.
    pub async fn flush(&self) -> Result<(), BatchError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| BatchError::Stopped)?;
        done_rx.await.map_err(|_| BatchError::Stopped)
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Rejects new operations, flushes pending ones and waits for the task to exit. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let _ = self.tx.send(Command::Stop).await;
        if let Err(err) = task.await {
            warn!(namespace = %self.namespace, error = %err, "batch writer task failed");
        }
    }
}

/// Hands out ledger positions. Resumes after the last position already stored for the namespace
/// so a restarted writer never reuses one.
#[derive(Debug, PartialEq, Eq)]
struct Sequencer {
    time: u64,
    next_number: u64,
}

impl Sequencer {
    fn resume(last: Option<(u64, u64)>) -> Self {
        match last {
            Some((time, number)) => Self {
                time,
                next_number: number + 1,
            },
            None => Self {
                time: 0,
                next_number: 0,
            },
        }
    }

    /// Transaction numbers count up within one ledger time and restart when it moves.
    fn next(&mut self, time: u64) -> (u64, u64) {
        if time > self.time {
            self.time = time;
            self.next_number = 0;
        }
        let number = self.next_number;
        self.next_number += 1;
        (self.time, number)
    }
}

async fn batch_task(
    ctx: BatchContext,
    opts: BatchOptions,
    mut rx: mpsc::Receiver<Command>,
    counters: Arc<BatchCounters>,
) {
    let mut pending: Vec<Operation> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut sequencer: Option<Sequencer> = None;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(Command::Add(op)) => {
                        if pending.is_empty() {
                            deadline = Some(Instant::now() + opts.timeout);
                        }
                        pending.push(op);
                        if pending.len() as u64 >= max_operations_per_batch(&ctx) {
                            cut_batch(&ctx, &mut pending, &mut sequencer, &counters);
                            deadline = None;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        cut_batch(&ctx, &mut pending, &mut sequencer, &counters);
                        deadline = None;
                        let _ = done.send(());
                    }
                    Some(Command::Stop) | None => {
                        cut_batch(&ctx, &mut pending, &mut sequencer, &counters);
                        break;
                    }
                }
            }
            _ = async {
                if let Some(at) = deadline {
                    tokio::time::sleep_until(at).await;
                }
            }, if deadline.is_some() => {
                cut_batch(&ctx, &mut pending, &mut sequencer, &counters);
                deadline = None;
            }
        }
    }

    info!(
        channel_id = %ctx.channel_id,
        namespace = %ctx.namespace,
        "batch writer stopped"
    );
}

fn max_operations_per_batch(ctx: &BatchContext) -> u64 {
    match ctx.protocol.current() {
        Ok(params) => params.max_operations_per_batch,
        Err(err) => {
            debug!(
                namespace = %ctx.namespace,
                error = %err,
                "no protocol parameters; batching on timeout only"
            );
            u64::MAX
        }
    }
}

fn cut_batch(
    ctx: &BatchContext,
    pending: &mut Vec<Operation>,
    sequencer: &mut Option<Sequencer>,
    counters: &BatchCounters,
) {
    if pending.is_empty() {
        return;
    }
    let mut operations = std::mem::take(pending);
    if sequencer.is_none() {
        match ctx.opstore.last_position() {
            Ok(last) => *sequencer = Some(Sequencer::resume(last)),
            Err(err) => {
                counters
                    .failed
                    .fetch_add(operations.len() as u64, Ordering::Relaxed);
                warn!(
                    channel_id = %ctx.channel_id,
                    namespace = %ctx.namespace,
                    count = operations.len(),
                    error = %err,
                    "cannot read last ledger position; operations dropped"
                );
                return;
            }
        }
    }
    let Some(sequencer) = sequencer.as_mut() else {
        return;
    };
    let time = ctx.protocol.ledger_time();
    for op in operations.iter_mut() {
        let (time, number) = sequencer.next(time);
        op.transaction_time = time;
        op.transaction_number = number;
    }
    let count = operations.len() as u64;

    if let Err(err) = write_batch(ctx, &operations) {
        counters.failed.fetch_add(count, Ordering::Relaxed);
        warn!(
            channel_id = %ctx.channel_id,
            namespace = %ctx.namespace,
            count,
            error = %err,
            "batch write failed; operations dropped"
        );
        return;
    }
    counters.batches.fetch_add(1, Ordering::Relaxed);
    counters.written.fetch_add(count, Ordering::Relaxed);
}

fn write_batch(ctx: &BatchContext, operations: &[Operation]) -> Result<(), String> {
    let anchored = AnchoredBatch {
        batch_id: new_batch_id(),
        namespace: &ctx.namespace,
        operations,
    };
    let bytes = serde_json::to_vec(&anchored).map_err(|e| e.to_string())?;
    let address = ctx.cas.put(bytes).map_err(|e| e.to_string())?;
    ctx.opstore.put(operations).map_err(|e| e.to_string())?;
    debug!(
        channel_id = %ctx.channel_id,
        namespace = %ctx.namespace,
        batch_id = %anchored.batch_id,
        %address,
        count = operations.len(),
        "batch written"
    );
    Ok(())
}
