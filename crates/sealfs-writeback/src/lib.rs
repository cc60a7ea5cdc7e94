#![forbid(unsafe_code)]
//! Writeback queue.
//!
//! A bounded FIFO of work items drained by a single consumer thread. Each
//! work item is an ordered list of tagged units: block writes, barriers,
//! sync callbacks, and an error marker. Writes within a work item are
//! issued in order and work items drain in FIFO order; a `Sync` unit's
//! callback fires only after every earlier write in the queue has reached
//! the device and a flush barrier has been issued.
//!
//! Capacity is counted in blocks. Work items larger than 3/4 of capacity
//! are rejected as a contract violation; callers split bulk data into
//! paginated chunks instead.

use parking_lot::{Condvar, Mutex};
use sealfs_block::{BlockBuffer, BlockRequest, BlockSession};
use sealfs_error::{Result, SealError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Completion callback carried by a `Sync` unit.
pub type SyncCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// One block-write run inside a work item.
pub struct WriteRequest {
    pub buffer: BlockBuffer,
    pub buffer_block: u64,
    pub device_block: u64,
    pub length: u32,
}

/// The tagged unit boundary between the engine and the consumer.
pub enum WorkUnit {
    Write(WriteRequest),
    Flush,
    Sync(SyncCallback),
    SetError,
}

/// An ordered batch of work units, enqueued and drained atomically.
#[derive(Default)]
pub struct WritebackWork {
    units: Vec<WorkUnit>,
}

impl WritebackWork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write of `length` blocks from `buffer` to the device.
    pub fn enqueue(
        &mut self,
        buffer: &BlockBuffer,
        buffer_block: u64,
        device_block: u64,
        length: u32,
    ) {
        self.units.push(WorkUnit::Write(WriteRequest {
            buffer: buffer.clone(),
            buffer_block,
            device_block,
            length,
        }));
    }

    /// Append an explicit device barrier.
    pub fn enqueue_flush(&mut self) {
        self.units.push(WorkUnit::Flush);
    }

    /// Append a completion callback, ordered after everything before it.
    pub fn set_sync_callback(&mut self, callback: SyncCallback) {
        self.units.push(WorkUnit::Sync(callback));
    }

    /// Append a marker that forces the queue into its error state.
    pub fn set_error(&mut self) {
        self.units.push(WorkUnit::SetError);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Total blocks written by this work item.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.units
            .iter()
            .map(|unit| match unit {
                WorkUnit::Write(write) => u64::from(write.length),
                _ => 0,
            })
            .sum()
    }

    /// Units in this work item (for journal serialization).
    #[must_use]
    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// Consume the work item, returning its units.
    #[must_use]
    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }

    /// Abandon the work item, completing its callbacks with `BadState`.
    pub fn reset(self) {
        for unit in self.units {
            if let WorkUnit::Sync(callback) = unit {
                callback(Err(SealError::BadState));
            }
        }
    }
}

struct QueueState {
    queue: VecDeque<WritebackWork>,
    queued_blocks: u64,
    readonly: bool,
    shutdown: bool,
    processing: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    capacity: u64,
    /// Signals producers waiting on capacity.
    space: Condvar,
    /// Signals the consumer that work arrived.
    work: Condvar,
    /// Signals waiters that the queue went idle.
    idle: Condvar,
    session: Arc<dyn BlockSession>,
}

/// Bounded single-consumer writeback queue.
pub struct WritebackQueue {
    shared: Arc<Shared>,
    consumer: Option<JoinHandle<()>>,
}

impl WritebackQueue {
    /// Spawn the consumer thread with `capacity_blocks` of queue depth.
    #[must_use]
    pub fn new(session: Arc<dyn BlockSession>, capacity_blocks: u64) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued_blocks: 0,
                readonly: false,
                shutdown: false,
                processing: false,
            }),
            capacity: capacity_blocks.max(1),
            space: Condvar::new(),
            work: Condvar::new(),
            idle: Condvar::new(),
            session,
        });
        let consumer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("sealfs-writeback".to_owned())
                .spawn(move || consumer_loop(&shared))
                .expect("spawn writeback consumer")
        };
        Self {
            shared,
            consumer: Some(consumer),
        }
    }

    /// Queue depth in blocks.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Largest work item the queue accepts, in blocks.
    #[must_use]
    pub fn max_work_blocks(&self) -> u64 {
        (3 * self.shared.capacity) / 4
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.shared.state.lock().readonly
    }

    /// Enqueue a work item, blocking while the queue is full.
    pub fn enqueue(&self, work: WritebackWork) -> Result<()> {
        let blocks = work.block_count();
        if blocks > self.max_work_blocks() {
            warn!(
                target: "sealfs::writeback",
                blocks,
                capacity = self.shared.capacity,
                "oversized work item rejected"
            );
            work.reset();
            return Err(SealError::InvalidArgs);
        }

        let mut state = self.shared.state.lock();
        while !state.readonly
            && !state.shutdown
            && state.queued_blocks + blocks > self.shared.capacity
        {
            self.shared.space.wait(&mut state);
        }
        if state.readonly || state.shutdown {
            drop(state);
            work.reset();
            return Err(SealError::BadState);
        }
        state.queued_blocks += blocks;
        state.queue.push_back(work);
        trace!(
            target: "sealfs::writeback",
            queued_blocks = state.queued_blocks,
            "work enqueued"
        );
        self.shared.work.notify_one();
        Ok(())
    }

    /// Block until everything currently enqueued has been issued to the
    /// device, then issue a barrier. Returns the queue's health.
    pub fn barrier(&self) -> Result<()> {
        let done: Arc<(Mutex<Option<Result<()>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let signal = Arc::clone(&done);
        let mut work = WritebackWork::new();
        work.set_sync_callback(Box::new(move |status| {
            *signal.0.lock() = Some(status);
            signal.1.notify_all();
        }));
        self.enqueue(work)?;

        let mut slot = done.0.lock();
        while slot.is_none() {
            done.1.wait(&mut slot);
        }
        slot.take().expect("signalled")
    }

    /// Wait for the queue to drain completely.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.processing {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl Drop for WritebackQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work.notify_all();
        self.shared.space.notify_all();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

fn consumer_loop(shared: &Shared) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.shutdown {
                shared.work.wait(&mut state);
            }
            let Some(work) = state.queue.pop_front() else {
                // Shutdown with an empty queue.
                break;
            };
            state.queued_blocks -= work.block_count();
            state.processing = true;
            shared.space.notify_all();
            work
        };

        let readonly = shared.state.lock().readonly;
        if readonly {
            work.reset();
        } else if let Err(err) = process_work(shared, work) {
            error!(target: "sealfs::writeback", %err, "writeback failed; queue is read-only");
            shared.state.lock().readonly = true;
        }

        let mut state = shared.state.lock();
        state.processing = false;
        if state.queue.is_empty() {
            shared.idle.notify_all();
        }
    }
    debug!(target: "sealfs::writeback", "consumer exited");
}

/// Issue one work item. On failure the failing `Sync` (if any) and every
/// later callback in the item observe the error; the caller flips the
/// queue read-only.
fn process_work(shared: &Shared, work: WritebackWork) -> std::result::Result<(), SealError> {
    let mut units = work.into_units().into_iter();
    let mut failure: Option<SealError> = None;

    for unit in units.by_ref() {
        let outcome = match unit {
            WorkUnit::Write(write) => issue_write(shared, &write),
            WorkUnit::Flush => shared.session.flush(),
            WorkUnit::Sync(callback) => {
                let outcome = shared.session.flush();
                match outcome {
                    Ok(()) => {
                        callback(Ok(()));
                        Ok(())
                    }
                    Err(err) => {
                        callback(Err(err));
                        Err(SealError::BadState)
                    }
                }
            }
            WorkUnit::SetError => Err(SealError::BadState),
        };
        if let Err(err) = outcome {
            failure = Some(err);
            break;
        }
    }

    if let Some(err) = failure {
        for unit in units {
            if let WorkUnit::Sync(callback) = unit {
                callback(Err(SealError::BadState));
            }
        }
        return Err(err);
    }
    Ok(())
}

fn issue_write(shared: &Shared, write: &WriteRequest) -> Result<()> {
    let id = shared.session.attach(&write.buffer)?;
    let outcome = shared.session.transact(&[BlockRequest::write(
        id,
        write.device_block,
        write.buffer_block,
        write.length,
    )]);
    let detach = shared.session.detach(id);
    outcome.and(detach)
}
