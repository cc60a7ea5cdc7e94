#![forbid(unsafe_code)]
//! Metadata journal.
//!
//! A ring of blocks in front of the writeback queue. Metadata work items
//! (superblock, bitmap, node-table writes) are snapshotted at enqueue
//! time, group-committed into the ring with a checksummed header per
//! entry, and only then drained to their home locations through
//! writeback. A committed entry is either fully visible at its home
//! region after a crash or entirely absent: replay walks the ring from
//! the persisted head and stops at the first entry whose sequence or
//! checksum does not line up.
//!
//! Ordering: before an entry lands in the ring, the commit thread issues
//! a writeback barrier, so a blob's data writes are durable before the
//! metadata that references them.
//!
//! Ring layout: block 0 of the journal region holds the info block
//! (magic, next sequence, head offset, checksum); the remaining blocks
//! form the entry ring. Each entry is one header block (magic, sequence,
//! payload block count, checksum, target block list) followed by its
//! payload blocks.

use parking_lot::{Condvar, Mutex};
use sealfs_block::{BlockBuffer, BlockRequest, BlockSession, ByteDevice};
use sealfs_error::{Result, SealError};
use sealfs_types::{read_le_u32, read_le_u64, ParseError, BLOCK_SIZE};
use sealfs_writeback::{SyncCallback, WorkUnit, WritebackQueue, WritebackWork};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace};

const INFO_MAGIC: u64 = 0x4A52_4E4C_5345_414C; // "SEALJRNL"
const ENTRY_MAGIC: u64 = 0x4A45_4E54_5345_414C;
const BS: usize = BLOCK_SIZE as usize;

/// Header block overhead before the target list.
const ENTRY_HEADER_LEN: usize = 24;
/// Maximum payload blocks one entry can describe.
pub const MAX_ENTRY_BLOCKS: u64 = ((BS - ENTRY_HEADER_LEN) / 8) as u64;

fn info_block(sequence: u64, head: u64) -> Vec<u8> {
    let mut block = vec![0_u8; BS];
    block[0..8].copy_from_slice(&INFO_MAGIC.to_le_bytes());
    block[8..16].copy_from_slice(&sequence.to_le_bytes());
    block[16..24].copy_from_slice(&head.to_le_bytes());
    let checksum = crc32fast::hash(&block[0..24]);
    block[24..28].copy_from_slice(&checksum.to_le_bytes());
    block
}

fn parse_info(block: &[u8]) -> std::result::Result<(u64, u64), ParseError> {
    let magic = read_le_u64(block, 0)?;
    if magic != INFO_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: INFO_MAGIC,
            actual: magic,
        });
    }
    let sequence = read_le_u64(block, 8)?;
    let head = read_le_u64(block, 16)?;
    let checksum = read_le_u32(block, 24)?;
    if checksum != crc32fast::hash(&block[0..24]) {
        return Err(ParseError::InvalidField {
            field: "journal_info",
            reason: "bad checksum",
        });
    }
    Ok((sequence, head))
}

fn entry_checksum(targets: &[u64], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for target in targets {
        hasher.update(&target.to_le_bytes());
    }
    hasher.update(payload);
    hasher.finalize()
}

fn entry_header(sequence: u64, targets: &[u64], payload: &[u8]) -> Vec<u8> {
    debug_assert!(targets.len() as u64 <= MAX_ENTRY_BLOCKS);
    debug_assert_eq!(targets.len() * BS, payload.len());
    let mut block = vec![0_u8; BS];
    block[0..8].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
    block[8..16].copy_from_slice(&sequence.to_le_bytes());
    block[16..20].copy_from_slice(&(targets.len() as u32).to_le_bytes());
    block[20..24].copy_from_slice(&entry_checksum(targets, payload).to_le_bytes());
    for (i, target) in targets.iter().enumerate() {
        let at = ENTRY_HEADER_LEN + i * 8;
        block[at..at + 8].copy_from_slice(&target.to_le_bytes());
    }
    block
}

/// Write an empty journal (fresh format).
pub fn format_region(device: &dyn ByteDevice, start_block: u64) -> Result<()> {
    device.write_all_at(start_block * BS as u64, &info_block(1, 0))?;
    Ok(())
}

/// The next sequence number recorded in a journal info block.
pub fn info_sequence(block: &[u8]) -> std::result::Result<u64, ParseError> {
    parse_info(block).map(|(sequence, _)| sequence)
}

/// Counters from a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayStats {
    pub entries_scanned: u64,
    pub entries_replayed: u64,
    pub blocks_replayed: u64,
    /// Sequence the live journal should continue from.
    pub next_sequence: u64,
}

/// Walk the ring and re-apply every intact committed entry, then reset
/// the ring. Runs at mount, before any other metadata write; after it
/// returns the caller must reload its metadata images from disk.
pub fn replay(
    device: &dyn ByteDevice,
    start_block: u64,
    journal_blocks: u64,
) -> Result<ReplayStats> {
    if journal_blocks < 2 {
        return Err(SealError::InvalidArgs);
    }
    let ring_blocks = journal_blocks - 1;
    let ring_start = start_block + 1;

    let mut block = vec![0_u8; BS];
    device.read_exact_at(start_block * BS as u64, &mut block)?;
    let (mut sequence, head) = parse_info(&block).map_err(SealError::Format)?;

    let mut stats = ReplayStats::default();
    let mut offset = head % ring_blocks;
    let mut scanned_blocks = 0_u64;

    loop {
        if scanned_blocks >= ring_blocks {
            break;
        }
        let mut header = vec![0_u8; BS];
        device.read_exact_at((ring_start + offset) * BS as u64, &mut header)?;
        stats.entries_scanned += 1;

        let magic = read_le_u64(&header, 0).map_err(SealError::Format)?;
        let entry_sequence = read_le_u64(&header, 8).map_err(SealError::Format)?;
        let count = u64::from(read_le_u32(&header, 16).map_err(SealError::Format)?);
        if magic != ENTRY_MAGIC || entry_sequence != sequence {
            break;
        }
        if count == 0 || count > MAX_ENTRY_BLOCKS || count > ring_blocks - 1 {
            break;
        }
        let stored_checksum = read_le_u32(&header, 20).map_err(SealError::Format)?;

        let mut targets = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            targets.push(read_le_u64(&header, ENTRY_HEADER_LEN + i * 8).map_err(SealError::Format)?);
        }

        let mut payload = vec![0_u8; count as usize * BS];
        let mut intact = true;
        for i in 0..count {
            let ring_offset = (offset + 1 + i) % ring_blocks;
            let at = (ring_start + ring_offset) * BS as u64;
            if device
                .read_exact_at(at, &mut payload[i as usize * BS..(i as usize + 1) * BS])
                .is_err()
            {
                intact = false;
                break;
            }
        }
        if !intact || entry_checksum(&targets, &payload) != stored_checksum {
            break;
        }

        // Targets must land inside the device; a wild target means the
        // entry is garbage even though its checksum matched.
        if targets
            .iter()
            .any(|target| (target + 1) * BS as u64 > device.len_bytes())
        {
            break;
        }

        for (i, target) in targets.iter().enumerate() {
            device.write_all_at(target * BS as u64, &payload[i * BS..(i + 1) * BS])?;
            stats.blocks_replayed += 1;
        }
        stats.entries_replayed += 1;
        sequence += 1;
        scanned_blocks += 1 + count;
        offset = (offset + 1 + count) % ring_blocks;
    }

    device.sync()?;
    device.write_all_at(start_block * BS as u64, &info_block(sequence, 0))?;
    device.sync()?;

    stats.next_sequence = sequence;
    if stats.entries_replayed > 0 {
        info!(
            target: "sealfs::journal",
            entries = stats.entries_replayed,
            blocks = stats.blocks_replayed,
            "journal replay applied entries"
        );
    }
    Ok(stats)
}

struct Run {
    device_block: u64,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct PendingEntry {
    runs: Vec<Run>,
    callbacks: Vec<SyncCallback>,
    set_error: bool,
}

impl PendingEntry {
    fn payload_blocks(&self) -> u64 {
        self.runs
            .iter()
            .map(|run| (run.bytes.len() / BS) as u64)
            .sum()
    }

    fn fail(self) {
        for callback in self.callbacks {
            callback(Err(SealError::BadState));
        }
    }
}

struct JournalState {
    pending: VecDeque<PendingEntry>,
    sequence: u64,
    readonly: bool,
    shutdown: bool,
    processing: bool,
}

struct Shared {
    state: Mutex<JournalState>,
    work: Condvar,
    idle: Condvar,
    session: Arc<dyn BlockSession>,
    writeback: Arc<WritebackQueue>,
    start_block: u64,
    ring_blocks: u64,
}

/// Live journal: accepts metadata work items and group-commits them.
pub struct Journal {
    shared: Arc<Shared>,
    commit: Option<JoinHandle<()>>,
}

impl Journal {
    /// Start the commit thread. `next_sequence` comes from the replay pass.
    #[must_use]
    pub fn new(
        session: Arc<dyn BlockSession>,
        writeback: Arc<WritebackQueue>,
        start_block: u64,
        journal_blocks: u64,
        next_sequence: u64,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(JournalState {
                pending: VecDeque::new(),
                sequence: next_sequence,
                readonly: false,
                shutdown: false,
                processing: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            session,
            writeback,
            start_block,
            ring_blocks: journal_blocks.saturating_sub(1),
        });
        let commit = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("sealfs-journal".to_owned())
                .spawn(move || commit_loop(&shared))
                .expect("spawn journal commit thread")
        };
        Self {
            shared,
            commit: Some(commit),
        }
    }

    /// Accept a metadata work item. Payloads are snapshotted here so the
    /// ring records exactly the state the caller committed.
    pub fn enqueue(&self, work: WritebackWork) -> Result<()> {
        let mut entry = PendingEntry::default();
        for unit in work.into_units() {
            match unit {
                WorkUnit::Write(write) => {
                    let bytes = write.buffer.snapshot(
                        (write.buffer_block * BS as u64) as usize,
                        write.length as usize * BS,
                    )?;
                    entry.runs.push(Run {
                        device_block: write.device_block,
                        bytes,
                    });
                }
                WorkUnit::Sync(callback) => entry.callbacks.push(callback),
                // The commit path flushes between the ring and the home
                // writes; standalone flush units collapse into that.
                WorkUnit::Flush => {}
                WorkUnit::SetError => entry.set_error = true,
            }
        }

        if entry.payload_blocks() + 1 > self.shared.ring_blocks {
            entry.fail();
            return Err(SealError::InvalidArgs);
        }

        let mut state = self.shared.state.lock();
        if state.readonly || state.shutdown {
            drop(state);
            entry.fail();
            return Err(SealError::BadState);
        }
        state.pending.push_back(entry);
        trace!(target: "sealfs::journal", pending = state.pending.len(), "entry enqueued");
        self.shared.work.notify_one();
        Ok(())
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.shared.state.lock().readonly
    }

    /// Wait until every accepted entry has been committed and drained.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.pending.is_empty() || state.processing {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work.notify_all();
        if let Some(commit) = self.commit.take() {
            let _ = commit.join();
        }
    }
}

fn commit_loop(shared: &Shared) {
    loop {
        let batch = {
            let mut state = shared.state.lock();
            while state.pending.is_empty() && !state.shutdown {
                shared.work.wait(&mut state);
            }
            if state.pending.is_empty() {
                // Shutdown with nothing left to drain.
                break;
            }
            state.processing = true;
            std::mem::take(&mut state.pending)
        };

        let readonly = shared.state.lock().readonly;
        if readonly {
            for entry in batch {
                entry.fail();
            }
        } else if let Err(err) = commit_batch(shared, batch) {
            error!(target: "sealfs::journal", %err, "journal commit failed; journal is read-only");
            shared.state.lock().readonly = true;
        }

        let mut state = shared.state.lock();
        state.processing = false;
        if state.pending.is_empty() {
            shared.idle.notify_all();
        }
    }
    debug!(target: "sealfs::journal", "commit thread exited");
}

fn commit_batch(shared: &Shared, batch: VecDeque<PendingEntry>) -> Result<()> {
    // Group entries into ring-sized sub-batches.
    let mut group: Vec<PendingEntry> = Vec::new();
    let mut group_blocks = 0_u64;
    let mut batches: Vec<Vec<PendingEntry>> = Vec::new();
    for entry in batch {
        let blocks = entry.payload_blocks() + 1;
        if group_blocks + blocks > shared.ring_blocks && !group.is_empty() {
            batches.push(std::mem::take(&mut group));
            group_blocks = 0;
        }
        group_blocks += blocks;
        group.push(entry);
    }
    if !group.is_empty() {
        batches.push(group);
    }

    for group in batches {
        commit_group(shared, group)?;
    }
    Ok(())
}

fn commit_group(shared: &Shared, group: Vec<PendingEntry>) -> Result<()> {
    // Order data ahead of metadata: everything already in writeback must
    // be durable before the ring commit can reference it.
    shared.writeback.barrier()?;

    let base_sequence = shared.state.lock().sequence;

    // Serialize ring entries. Entries with no payload carry callbacks
    // only and never touch the ring.
    let mut image: Vec<u8> = Vec::new();
    let mut sequence = base_sequence;
    for entry in &group {
        let blocks = entry.payload_blocks();
        if blocks == 0 {
            continue;
        }
        let mut targets = Vec::with_capacity(blocks as usize);
        let mut payload = Vec::with_capacity(blocks as usize * BS);
        for run in &entry.runs {
            let run_blocks = (run.bytes.len() / BS) as u64;
            for i in 0..run_blocks {
                targets.push(run.device_block + i);
            }
            payload.extend_from_slice(&run.bytes);
        }
        image.extend_from_slice(&entry_header(sequence, &targets, &payload));
        image.extend_from_slice(&payload);
        sequence += 1;
    }
    let committed_entries = sequence - base_sequence;

    if !image.is_empty() {
        let ring = BlockBuffer::from_vec(image);
        let ring_len_blocks = (ring.len() / BS) as u32;
        let info = BlockBuffer::from_vec(info_block(base_sequence, 0));
        let ring_id = shared.session.attach(&ring)?;
        let info_id = shared.session.attach(&info)?;
        let outcome = shared.session.transact(&[
            BlockRequest::write(ring_id, shared.start_block + 1, 0, ring_len_blocks),
            BlockRequest::write(info_id, shared.start_block, 0, 1),
            BlockRequest::flush(),
        ]);
        let _ = shared.session.detach(ring_id);
        let _ = shared.session.detach(info_id);
        outcome?;
        trace!(
            target: "sealfs::journal",
            entries = committed_entries,
            blocks = ring_len_blocks,
            "ring committed"
        );
    }

    // Drain to home locations through writeback, then wait for the
    // barrier so the ring can be retired.
    let max_blocks = shared.writeback.max_work_blocks().max(1);
    let mut work = WritebackWork::new();
    let mut work_blocks = 0_u64;
    let mut poisoned = false;
    let mut callbacks: Vec<SyncCallback> = Vec::new();
    for entry in group {
        if entry.set_error {
            poisoned = true;
        }
        for run in entry.runs {
            let run_blocks = (run.bytes.len() / BS) as u64;
            if work_blocks + run_blocks > max_blocks && !work.is_empty() {
                shared.writeback.enqueue(std::mem::take(&mut work))?;
                work_blocks = 0;
            }
            work.enqueue(
                &BlockBuffer::from_vec(run.bytes),
                0,
                run.device_block,
                run_blocks as u32,
            );
            work_blocks += run_blocks;
        }
        callbacks.extend(entry.callbacks);
    }
    if poisoned {
        work.set_error();
    }
    for callback in callbacks {
        work.set_sync_callback(callback);
    }
    if !work.is_empty() || poisoned {
        shared.writeback.enqueue(work)?;
    }
    shared.writeback.barrier()?;

    // Retire the group: bump the persisted sequence so stale ring entries
    // are ignored by the next replay. Idempotent replays make a lazy
    // flush of this update safe.
    if committed_entries > 0 {
        let mut state = shared.state.lock();
        state.sequence = base_sequence + committed_entries;
        drop(state);
        let info = BlockBuffer::from_vec(info_block(base_sequence + committed_entries, 0));
        let info_id = shared.session.attach(&info)?;
        let outcome = shared.session.transact(&[BlockRequest::write(
            info_id,
            shared.start_block,
            0,
            1,
        )]);
        let _ = shared.session.detach(info_id);
        outcome?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealfs_block::{DeviceSession, MemoryByteDevice};

    const JOURNAL_START: u64 = 1;
    const JOURNAL_BLOCKS: u64 = 8;

    fn fresh_device(blocks: u64) -> MemoryByteDevice {
        let device = MemoryByteDevice::new((blocks * BS as u64) as usize);
        format_region(&device, JOURNAL_START).expect("format journal");
        device
    }

    fn read_home_block(device: &MemoryByteDevice, block: u64) -> Vec<u8> {
        let mut out = vec![0_u8; BS];
        device
            .read_exact_at(block * BS as u64, &mut out)
            .expect("read");
        out
    }

    /// Write an entry directly into the ring, simulating a crash after
    /// ring commit but before the home writes landed.
    fn stage_entry(
        device: &MemoryByteDevice,
        ring_offset: u64,
        sequence: u64,
        targets: &[u64],
        fill: u8,
    ) -> u64 {
        let payload = vec![fill; targets.len() * BS];
        let header = entry_header(sequence, targets, &payload);
        let ring_start = JOURNAL_START + 1;
        device
            .write_all_at((ring_start + ring_offset) * BS as u64, &header)
            .expect("stage header");
        device
            .write_all_at((ring_start + ring_offset + 1) * BS as u64, &payload)
            .expect("stage payload");
        ring_offset + 1 + targets.len() as u64
    }

    #[test]
    fn empty_journal_replays_nothing() {
        let device = fresh_device(32);
        let stats = replay(&device, JOURNAL_START, JOURNAL_BLOCKS).expect("replay");
        assert_eq!(stats.entries_replayed, 0);
        assert_eq!(stats.blocks_replayed, 0);
        assert_eq!(stats.next_sequence, 1);
    }

    #[test]
    fn corrupt_info_block_fails_replay() {
        let device = fresh_device(32);
        device.write_all_at(JOURNAL_START * BS as u64 + 9, &[0xFF]).expect("corrupt");
        assert!(matches!(
            replay(&device, JOURNAL_START, JOURNAL_BLOCKS),
            Err(SealError::Format(_))
        ));
    }

    #[test]
    fn staged_entries_are_applied_in_order() {
        let device = fresh_device(32);
        let next = stage_entry(&device, 0, 1, &[20], 0xAA);
        stage_entry(&device, next, 2, &[21, 22], 0xBB);

        let stats = replay(&device, JOURNAL_START, JOURNAL_BLOCKS).expect("replay");
        assert_eq!(stats.entries_replayed, 2);
        assert_eq!(stats.blocks_replayed, 3);
        assert_eq!(stats.next_sequence, 3);
        assert!(read_home_block(&device, 20).iter().all(|b| *b == 0xAA));
        assert!(read_home_block(&device, 21).iter().all(|b| *b == 0xBB));
        assert!(read_home_block(&device, 22).iter().all(|b| *b == 0xBB));

        // The ring was retired: a second replay applies nothing.
        let stats = replay(&device, JOURNAL_START, JOURNAL_BLOCKS).expect("replay");
        assert_eq!(stats.entries_replayed, 0);
        assert_eq!(stats.next_sequence, 3);
    }

    #[test]
    fn bad_checksum_terminates_replay() {
        let device = fresh_device(32);
        let next = stage_entry(&device, 0, 1, &[20], 0xAA);
        let after_second = stage_entry(&device, next, 2, &[21], 0xBB);
        // Corrupt the second entry's payload after its checksum was taken.
        device
            .write_all_at((JOURNAL_START + 1 + next + 1) * BS as u64 + 7, &[0x00])
            .expect("corrupt");
        stage_entry(&device, after_second, 3, &[22], 0xCC);

        let stats = replay(&device, JOURNAL_START, JOURNAL_BLOCKS).expect("replay");
        // First entry applied; the corrupt one and everything after it
        // are dropped.
        assert_eq!(stats.entries_replayed, 1);
        assert!(read_home_block(&device, 20).iter().all(|b| *b == 0xAA));
        assert!(read_home_block(&device, 21).iter().all(|b| *b == 0x00));
        assert!(read_home_block(&device, 22).iter().all(|b| *b == 0x00));
    }

    #[test]
    fn sequence_gap_terminates_replay() {
        let device = fresh_device(32);
        // Entry claims sequence 7 but the info block expects 1.
        stage_entry(&device, 0, 7, &[20], 0xAA);
        let stats = replay(&device, JOURNAL_START, JOURNAL_BLOCKS).expect("replay");
        assert_eq!(stats.entries_replayed, 0);
        assert!(read_home_block(&device, 20).iter().all(|b| *b == 0x00));
    }

    #[test]
    fn live_journal_drains_to_home_locations() {
        let device = fresh_device(64);
        let session: Arc<dyn BlockSession> =
            Arc::new(DeviceSession::new(Arc::new(device.clone())));
        let writeback = Arc::new(WritebackQueue::new(Arc::clone(&session), 64));
        let journal = Journal::new(
            Arc::clone(&session),
            Arc::clone(&writeback),
            JOURNAL_START,
            JOURNAL_BLOCKS,
            1,
        );

        let metadata = BlockBuffer::new(2 * BS);
        metadata.write_at(0, b"superblockish").expect("seed");
        metadata.write_at(BS, b"bitmapish").expect("seed");

        let mut work = WritebackWork::new();
        work.enqueue(&metadata, 0, 30, 1);
        work.enqueue(&metadata, 1, 31, 1);
        let done = Arc::new(Mutex::new(None));
        let signal = Arc::clone(&done);
        work.set_sync_callback(Box::new(move |status| {
            *signal.lock() = Some(status.is_ok());
        }));
        journal.enqueue(work).expect("enqueue");
        journal.wait_idle();

        assert_eq!(*done.lock(), Some(true));
        assert_eq!(&read_home_block(&device, 30)[..13], b"superblockish");
        assert_eq!(&read_home_block(&device, 31)[..9], b"bitmapish");

        // The snapshot was taken at enqueue time: mutating the buffer now
        // must not change what was committed.
        metadata.write_at(0, b"MUTATED").expect("seed");
        drop(journal);
        drop(writeback);
        let stats = replay(&device, JOURNAL_START, JOURNAL_BLOCKS).expect("replay");
        assert_eq!(stats.entries_replayed, 0);
        assert_eq!(&read_home_block(&device, 30)[..13], b"superblockish");
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let device = fresh_device(64);
        let session: Arc<dyn BlockSession> =
            Arc::new(DeviceSession::new(Arc::new(device.clone())));
        let writeback = Arc::new(WritebackQueue::new(Arc::clone(&session), 64));
        let journal = Journal::new(
            Arc::clone(&session),
            Arc::clone(&writeback),
            JOURNAL_START,
            JOURNAL_BLOCKS,
            1,
        );

        // Ring holds 7 blocks; an 8-block payload cannot ever fit.
        let big = BlockBuffer::new(8 * BS);
        let mut work = WritebackWork::new();
        work.enqueue(&big, 0, 40, 8);
        assert!(matches!(journal.enqueue(work), Err(SealError::InvalidArgs)));
    }
}
