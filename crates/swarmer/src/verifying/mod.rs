//! A file that is downloaded from many sources and verified as it lands.
//!
//! Every byte is in one of these pools:
//!
//! - white: needed and not claimed by anyone.
//! - leased: claimed by a transfer, not written yet.
//! - written: on disk, waiting for its chunk to be verified.
//! - verified: on disk and matching the hash tree.
//!
//! Workers lease ranges, write the bytes they receive and release what they
//! could not get. Once all the bytes of a chunk are written, the chunk is
//! read back and checked against the [`HashTree`] on the blocking pool.
//! Corrupt chunks go back to white, unless the file keeps them.
mod disk;
mod ledger;

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
};
use tracing::{debug, info, warn};

pub use disk::{FileStorage, MemoryStorage, Storage};
pub use ledger::DEFAULT_CHUNK_SIZE;

use crate::{
    config::{Config, VerifyingConfig},
    error::Error,
    hash_tree::HashTree,
    interval::{Interval, IntervalSet},
    strategy::{BiasedRandomStrategy, SelectionStrategy},
};

use disk::{Disk, DiskMsg};
use ledger::{Job, Ledger, Verdict};

/// Invoked once a write that could not be queued was performed.
pub type WriteCallback = Box<dyn FnOnce() + Send + 'static>;

/// Bytes to write at an offset of the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub offset: u64,
    pub data: Bytes,
}

impl WriteRequest {
    pub fn new(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes covered, `None` for an empty write or one past `u64::MAX`.
    pub fn range(&self) -> Option<Interval> {
        match self.len() {
            0 => None,
            len => self
                .offset
                .checked_add(len - 1)
                .map(|high| Interval::new(self.offset, high)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Pending {
    tasks: usize,
    closed: bool,
}

struct State {
    ledger: Ledger,
    strategy: Box<dyn SelectionStrategy>,
    tree: Option<Arc<HashTree>>,
    storage: Option<Arc<dyn Storage>>,
    disk_tx: Option<mpsc::Sender<DiskMsg>>,
    runtime: Option<Handle>,
    /// Writes refused for lack of buffer space, with the callback to run
    /// once they are done.
    waiting: VecDeque<(WriteRequest, WriteCallback)>,
    /// Queued writes plus running verifications.
    tasks: usize,
    closed: bool,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    pending: watch::Sender<Pending>,
    config: VerifyingConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.pending.send_replace(Pending {
            tasks: state.tasks,
            closed: state.closed,
        });
    }

    pub(crate) fn next_waiting(&self) -> Option<(WriteRequest, WriteCallback)> {
        self.lock().waiting.pop_front()
    }

    pub(crate) fn write_landed(self: &Arc<Self>, range: Interval) {
        let mut state = self.lock();
        state.tasks = state.tasks.saturating_sub(1);
        let jobs = state.ledger.on_written(range);
        self.schedule(&mut state, jobs);
        self.publish(&state);
    }

    pub(crate) fn write_failed(&self, range: Interval, reason: &str) {
        warn!("write of {range} failed: {reason}");
        let mut state = self.lock();
        state.tasks = state.tasks.saturating_sub(1);
        state.ledger.release(range);
        self.publish(&state);
    }

    /// Run verification of `jobs` on the blocking pool.
    fn schedule(self: &Arc<Self>, state: &mut State, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let (Some(tree), Some(storage), Some(runtime)) = (
            state.tree.clone(),
            state.storage.clone(),
            state.runtime.clone(),
        ) else {
            warn!("{} chunks cannot be verified, the file is not open", jobs.len());
            for job in jobs {
                state.ledger.abandon(job);
            }
            return;
        };

        let retries = self.config.verify_read_retries;
        for job in jobs {
            debug!("verifying chunk {} {}", job.chunk, job.range);
            state.tasks += 1;
            let shared = self.clone();
            let tree = tree.clone();
            let storage = storage.clone();
            runtime.spawn_blocking(move || {
                let matches = disk::read_chunk(storage.as_ref(), job.range, retries)
                    .is_some_and(|bytes| tree.verify(job.chunk, &bytes));
                shared.chunk_verified(job, matches);
            });
        }
    }

    fn chunk_verified(&self, job: Job, matches: bool) {
        let mut state = self.lock();
        state.tasks = state.tasks.saturating_sub(1);

        match state.ledger.on_verified(job, matches) {
            Verdict::Stale => debug!("chunk {} result is stale", job.chunk),
            Verdict::Verified => debug!("chunk {} verified", job.chunk),
            Verdict::NotOnDisk => {
                debug!("existing bytes of chunk {} do not match", job.chunk)
            }
            Verdict::Corrupt { kept } => {
                warn!(
                    "chunk {} {} is corrupt, kept: {kept}, lost so far: {}",
                    job.chunk,
                    job.range,
                    state.ledger.lost()
                );
                if state.ledger.is_hopeless() {
                    warn!("too much corruption, the download is hopeless");
                }
            }
        }
        self.publish(&state);
    }
}

/// The ledger of one download. Cheap to clone, clones share the file.
#[derive(Clone)]
pub struct VerifyingFile {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for VerifyingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("VerifyingFile")
            .field("ledger", &state.ledger)
            .field("tree", &state.tree)
            .field("tasks", &state.tasks)
            .field("closed", &state.closed)
            .finish()
    }
}

impl VerifyingFile {
    /// A file using the [`BiasedRandomStrategy`].
    pub fn new(total_size: u64, config: &Config) -> Self {
        Self::with_strategy(
            total_size,
            &config.verifying,
            Box::new(BiasedRandomStrategy::new(total_size, &config.selection)),
        )
    }

    pub fn with_strategy(
        total_size: u64,
        config: &VerifyingConfig,
        strategy: Box<dyn SelectionStrategy>,
    ) -> Self {
        let state = State {
            ledger: Ledger::new(total_size, config),
            strategy,
            tree: None,
            storage: None,
            disk_tx: None,
            runtime: None,
            waiting: VecDeque::new(),
            tasks: 0,
            closed: false,
        };
        let (pending, _) = watch::channel(Pending::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                pending,
                config: config.clone(),
            }),
        }
    }

    /// Attach the storage and start the disk actor. Must be called from
    /// within a tokio runtime.
    pub fn open(&self, storage: Arc<dyn Storage>) -> Result<(), Error> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut state = self.shared.lock();
        if state.disk_tx.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<DiskMsg>(self.shared.config.write_buffers);
        let disk = Disk::new(rx, storage.clone(), Arc::downgrade(&self.shared));
        runtime.spawn(disk.run());

        state.storage = Some(storage);
        state.disk_tx = Some(tx);
        state.runtime = Some(runtime);
        state.closed = false;
        self.shared.publish(&state);
        info!("opened a file of {} bytes", state.ledger.total());
        Ok(())
    }

    /// Open a file on disk, keeping its content.
    pub fn open_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let storage = FileStorage::open(path)?;
        self.open(Arc::new(storage))
    }

    /// Stop accepting writes and leases. Queued writes still land,
    /// leases go back to white and threads waiting for pending work are
    /// released.
    pub fn close(&self) {
        let waiting = {
            let mut state = self.shared.lock();
            if let Some(tx) = state.disk_tx.take() {
                let _ = tx.try_send(DiskMsg::Quit);
            }
            state.closed = true;
            state.ledger.release_all_leases();
            let waiting = std::mem::take(&mut state.waiting);
            state.tasks = state.tasks.saturating_sub(waiting.len());
            self.shared.publish(&state);
            waiting
        };
        // dropped outside the lock, callbacks may own channels
        drop(waiting);
        info!("file closed");
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().disk_tx.is_some()
    }

    fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn total_size(&self) -> u64 {
        self.shared.lock().ledger.total()
    }

    /// Node size of the tree, or [`DEFAULT_CHUNK_SIZE`] without a tree.
    pub fn chunk_size(&self) -> u64 {
        self.shared.lock().ledger.chunk_size()
    }

    /// Lease up to `max_len` needed bytes.
    pub fn lease_white(&self, max_len: u64) -> Result<Interval, Error> {
        self.lease(None, max_len)
    }

    /// Lease up to `max_len` needed bytes among those in `available`,
    /// usually the ranges a source claims to have.
    pub fn lease_white_from(
        &self,
        available: &IntervalSet,
        max_len: u64,
    ) -> Result<Interval, Error> {
        self.lease(Some(available), max_len)
    }

    fn lease(
        &self,
        available: Option<&IntervalSet>,
        max_len: u64,
    ) -> Result<Interval, Error> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(Error::FileClosed);
        }
        let State {
            ledger, strategy, ..
        } = &mut *state;
        let lease = ledger.lease(strategy.as_mut(), available, max_len)?;
        debug!("leased {lease}");
        Ok(lease)
    }

    /// Give back bytes that will not be written. Safe to call more than
    /// once, or on bytes that were never leased.
    pub fn release_block(&self, range: Interval) {
        debug!("released {range}");
        self.shared.lock().ledger.release(range);
    }

    fn check_bounds(&self, state: &State, req: &WriteRequest) -> bool {
        let size = state.ledger.total();
        if req.offset.checked_add(req.len()).map_or(true, |end| end > size) {
            warn!(
                "dropping write of {} bytes at {}, the file has {size}",
                req.len(),
                req.offset
            );
            return false;
        }
        true
    }

    /// Queue a write. Returns false when the write buffer is full, the
    /// caller must then use [`VerifyingFile::register_write_callback`].
    /// Never blocks.
    pub fn write_block(&self, req: WriteRequest) -> bool {
        if req.is_empty() {
            return true;
        }
        let mut state = self.shared.lock();
        if state.closed || !self.check_bounds(&state, &req) {
            return false;
        }
        let Some(tx) = &state.disk_tx else {
            return false;
        };
        match tx.try_send(DiskMsg::Write(req)) {
            Ok(()) => {
                state.tasks += 1;
                self.shared.publish(&state);
                true
            }
            Err(_) => false,
        }
    }

    /// Perform `req` as soon as the buffer has room, then run `callback`.
    ///
    /// If the file is closed the callback is dropped without being run.
    pub fn register_write_callback(
        &self,
        req: WriteRequest,
        callback: WriteCallback,
    ) {
        if req.is_empty() {
            callback();
            return;
        }
        let mut state = self.shared.lock();
        if state.closed || !self.check_bounds(&state, &req) {
            return;
        }
        let Some(tx) = &state.disk_tx else {
            return;
        };
        // room may have been freed since the write was refused
        match tx.try_send(DiskMsg::Write(req)) {
            Ok(()) => {
                state.tasks += 1;
                self.shared.publish(&state);
                drop(state);
                callback();
            }
            Err(TrySendError::Full(DiskMsg::Write(req))) => {
                state.waiting.push_back((req, callback));
                state.tasks += 1;
                self.shared.publish(&state);
            }
            Err(_) => {}
        }
    }

    /// Write `data` at `offset`, in pieces of the buffer unit, waiting for
    /// buffer space when needed.
    pub async fn write_all(&self, offset: u64, data: Bytes) -> Result<(), Error> {
        let size = self.total_size();
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::WriteOutOfBounds {
                offset,
                len,
                size,
            });
        }

        let unit = self.shared.config.buffer_unit;
        let mut at = 0;
        while at < data.len() {
            let end = (at + unit).min(data.len());
            let req = WriteRequest::new(offset + at as u64, data.slice(at..end));

            if !self.write_block(req.clone()) {
                if self.is_closed() || !self.is_open() {
                    return Err(Error::FileClosed);
                }
                let (tx, rx) = oneshot::channel();
                self.register_write_callback(
                    req,
                    Box::new(move || {
                        let _ = tx.send(());
                    }),
                );
                rx.await.map_err(|_| Error::FileClosed)?;
            }
            at = end;
        }
        Ok(())
    }

    /// Attach the tree chunks are verified against.
    ///
    /// Chunks already written are scheduled for verification. Attaching
    /// the tree already in use does nothing. A tree with a different root
    /// replaces the current one only while few chunks were verified,
    /// in which case every byte on disk is verified again.
    pub fn set_hash_tree(&self, tree: Arc<HashTree>) -> Result<(), Error> {
        let mut state = self.shared.lock();
        let size = state.ledger.total();
        if tree.file_size() != size {
            warn!("ignoring a tree for {} bytes", tree.file_size());
            return Err(Error::TreeSizeMismatch {
                tree: tree.file_size(),
                file: size,
            });
        }
        if let Some(current) = &state.tree {
            if current.root_hash() == tree.root_hash() {
                debug!("tree {} is already attached", tree.root_hex());
                return Ok(());
            }
        }

        let jobs = match state.ledger.attach_tree(tree.node_size()) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("refusing tree {}", tree.root_hex());
                return Err(e);
            }
        };
        info!("using hash tree {}", tree.root_hex());
        state.tree = Some(tree);
        self.shared.schedule(&mut state, jobs);
        self.shared.publish(&state);
        Ok(())
    }

    pub fn hash_tree(&self) -> Option<Arc<HashTree>> {
        self.shared.lock().tree.clone()
    }

    /// Treat bytes already in storage, up to `known_len`, as written.
    /// They are verified once a tree is attached, and bytes that do not
    /// match go back to white without counting as corruption.
    pub fn set_scan_for_existing_blocks(
        &self,
        enabled: bool,
        known_len: u64,
    ) -> Result<(), Error> {
        if !enabled {
            return Ok(());
        }
        let storage = self.shared.lock().storage.clone();
        let storage = storage.ok_or(Error::FileNotOpen)?;
        let on_disk = storage.len()?;

        let mut state = self.shared.lock();
        let jobs = state.ledger.scan_existing(known_len.min(on_disk));
        info!(
            "adopted existing bytes, {} on disk",
            state.ledger.block_size()
        );
        self.shared.schedule(&mut state, jobs);
        self.shared.publish(&state);
        Ok(())
    }

    /// When false, corrupt chunks are kept instead of downloaded again.
    pub fn set_discard_unverified(&self, discard: bool) {
        self.shared.lock().ledger.discard_unverified = discard;
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().ledger.is_complete()
    }

    pub fn is_hopeless(&self) -> bool {
        self.shared.lock().ledger.is_hopeless()
    }

    /// Bytes matching the tree.
    pub fn verified_block_size(&self) -> u64 {
        self.shared.lock().ledger.verified.size()
    }

    /// Bytes on disk, verified or not.
    pub fn block_size(&self) -> u64 {
        self.shared.lock().ledger.block_size()
    }

    /// Bytes that failed verification so far.
    pub fn amount_lost(&self) -> u64 {
        self.shared.lock().ledger.lost()
    }

    /// Length of the prefix of the file that is already on disk.
    pub fn preview_len(&self) -> u64 {
        self.shared.lock().ledger.preview_len()
    }

    /// Bytes nobody is working on.
    pub fn white(&self) -> IntervalSet {
        self.shared.lock().ledger.white.clone()
    }

    /// Bytes not on disk yet, leased or not.
    pub fn needed(&self) -> IntervalSet {
        let state = self.shared.lock();
        let mut needed = state.ledger.white.clone();
        needed.add_all(&state.ledger.leased);
        needed
    }

    pub fn has_white(&self) -> bool {
        !self.shared.lock().ledger.white.is_empty()
    }

    /// Writes and verifications not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.shared.lock().tasks
    }

    /// Wait until queued writes landed and running verifications are done,
    /// or the file is closed.
    pub async fn wait_for_pending_if_needed(&self) {
        let mut rx = self.shared.pending.subscribe();
        let _ = rx.wait_for(|p| p.tasks == 0 || p.closed).await;
    }

    /// Same as [`VerifyingFile::wait_for_pending_if_needed`] with a
    /// deadline, returns false on timeout.
    pub async fn wait_for_pending(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_pending_if_needed())
            .await
            .is_ok()
    }
}
