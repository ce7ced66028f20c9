//! Byte pools of a verifying file and the state of every chunk.
//!
//! The ledger is plain data, the caller holds the lock. Every offset of
//! the file is in exactly one of `white`, `leased`, `written`, `verified`
//! or `kept` at any time.
use std::ops::RangeInclusive;

use tracing::debug;

use crate::{
    config::VerifyingConfig,
    error::Error,
    interval::{Interval, IntervalSet},
    strategy::SelectionStrategy,
};

/// Lease size and chunk size when no hash tree is known.
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Unverified,
    /// Handed to a verification task.
    Pending,
    Verified,
    /// Failed verification but kept on disk.
    Corrupt,
}

/// A chunk that must be checked against the tree of `generation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Job {
    pub chunk: usize,
    pub range: Interval,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The tree changed, or the chunk was already settled.
    Stale,
    Verified,
    /// Pre-existing bytes did not match, they go back to white for free.
    NotOnDisk,
    Corrupt { kept: bool },
}

#[derive(Debug)]
pub(crate) struct Ledger {
    total: u64,
    pub white: IntervalSet,
    pub leased: IntervalSet,
    pub written: IntervalSet,
    pub verified: IntervalSet,
    /// Corrupt bytes kept on disk.
    pub kept: IntervalSet,
    /// Bytes adopted from disk instead of downloaded.
    scanned: IntervalSet,
    node_size: Option<u64>,
    chunks: Vec<ChunkState>,
    generation: u64,
    lost: u64,
    max_corruption: f64,
    pub discard_unverified: bool,
    tree_swap_leaves: usize,
}

impl Ledger {
    pub fn new(total: u64, config: &VerifyingConfig) -> Self {
        Self {
            total,
            white: IntervalSet::full(total),
            leased: IntervalSet::new(),
            written: IntervalSet::new(),
            verified: IntervalSet::new(),
            kept: IntervalSet::new(),
            scanned: IntervalSet::new(),
            node_size: None,
            chunks: Vec::new(),
            generation: 0,
            lost: 0,
            max_corruption: config.max_corruption,
            discard_unverified: config.discard_unverified,
            tree_swap_leaves: config.tree_swap_leaves,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> u64 {
        self.node_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn has_tree(&self) -> bool {
        self.node_size.is_some()
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn is_hopeless(&self) -> bool {
        self.lost as f64 > self.total as f64 * self.max_corruption
    }

    pub fn is_complete(&self) -> bool {
        if self.has_tree() {
            self.verified.size() + self.kept.size() == self.total
        } else {
            self.white.is_empty() && self.leased.is_empty()
        }
    }

    /// Bytes on disk, verified or not.
    pub fn block_size(&self) -> u64 {
        self.written.size() + self.verified.size() + self.kept.size()
    }

    /// Length of the prefix of the file that is on disk.
    pub fn preview_len(&self) -> u64 {
        let mut on_disk = self.written.clone();
        on_disk.add_all(&self.verified);
        on_disk.add_all(&self.kept);
        match on_disk.first() {
            Some(run) if run.low() == 0 => run.high() + 1,
            _ => 0,
        }
    }

    fn chunk_range(&self, chunk: usize) -> Interval {
        let size = self.chunk_size();
        let low = chunk as u64 * size;
        let high = (low + size).min(self.total) - 1;
        Interval::new(low, high)
    }

    fn chunks_in(&self, range: Interval) -> RangeInclusive<usize> {
        let size = self.chunk_size();
        (range.low() / size) as usize..=(range.high() / size) as usize
    }

    fn verified_leaves(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| **c == ChunkState::Verified)
            .count()
    }

    /// Move one picked range from white to leased.
    pub fn lease(
        &mut self,
        strategy: &mut dyn SelectionStrategy,
        available: Option<&IntervalSet>,
        max_len: u64,
    ) -> Result<Interval, Error> {
        if self.is_hopeless() {
            return Err(Error::Hopeless);
        }
        if max_len == 0 {
            return Err(Error::InvalidArgument("lease of zero bytes".into()));
        }
        let (Some(first), Some(last)) = (self.white.first(), self.white.last())
        else {
            return Err(Error::Exhausted);
        };

        let candidates = match available {
            Some(available) => self.white.intersect(available),
            None => self.white.clone(),
        };
        if candidates.is_empty() {
            return Err(Error::Exhausted);
        }

        let pick = strategy.pick(&candidates, first.low(), last.high(), max_len)?;
        self.white.delete(pick);
        self.leased.add(pick);
        Ok(pick)
    }

    /// Give back leased bytes, and written bytes that are not being
    /// verified right now.
    pub fn release(&mut self, range: Interval) {
        for part in self.leased.clip(range).iter() {
            self.leased.delete(part);
            self.white.add(part);
        }

        let mut releasable = self.written.clip(range);
        if releasable.is_empty() {
            return;
        }
        if self.has_tree() {
            for chunk in self.chunks_in(range) {
                if self.chunks.get(chunk) == Some(&ChunkState::Pending) {
                    releasable.delete(self.chunk_range(chunk));
                }
            }
        }
        for part in releasable.iter() {
            self.written.delete(part);
            self.scanned.delete(part);
            self.white.add(part);
        }
    }

    /// Record bytes that reached storage, returns the chunks that are now
    /// complete and must be verified.
    pub fn on_written(&mut self, range: Interval) -> Vec<Job> {
        let mut fresh = IntervalSet::from(range);
        fresh.delete_all(&self.verified);
        fresh.delete_all(&self.kept);

        self.white.delete(range);
        self.leased.delete(range);

        if !self.has_tree() {
            // nothing to check against
            self.verified.add_all(&fresh);
            return Vec::new();
        }

        self.written.add_all(&fresh);
        self.ready_chunks(range)
    }

    fn ready_chunks(&mut self, range: Interval) -> Vec<Job> {
        let mut jobs = Vec::new();
        for chunk in self.chunks_in(range) {
            if self.chunks.get(chunk) != Some(&ChunkState::Unverified) {
                continue;
            }
            let range = self.chunk_range(chunk);
            if self.written.covers(&range) {
                self.chunks[chunk] = ChunkState::Pending;
                jobs.push(Job {
                    chunk,
                    range,
                    generation: self.generation,
                });
            }
        }
        jobs
    }

    fn all_ready_chunks(&mut self) -> Vec<Job> {
        match self.total {
            0 => Vec::new(),
            total => self.ready_chunks(Interval::new(0, total - 1)),
        }
    }

    pub fn on_verified(&mut self, job: Job, matches: bool) -> Verdict {
        if job.generation != self.generation
            || self.chunks.get(job.chunk) != Some(&ChunkState::Pending)
        {
            return Verdict::Stale;
        }
        let range = job.range;
        self.written.delete(range);

        if matches {
            self.scanned.delete(range);
            self.verified.add(range);
            self.chunks[job.chunk] = ChunkState::Verified;
            return Verdict::Verified;
        }

        if self.scanned.overlaps(&range) {
            self.scanned.delete(range);
            self.white.add(range);
            self.chunks[job.chunk] = ChunkState::Unverified;
            return Verdict::NotOnDisk;
        }

        self.lost += range.len();
        if self.discard_unverified {
            self.white.add(range);
            self.chunks[job.chunk] = ChunkState::Unverified;
            Verdict::Corrupt { kept: false }
        } else {
            self.kept.add(range);
            self.chunks[job.chunk] = ChunkState::Corrupt;
            Verdict::Corrupt { kept: true }
        }
    }

    /// Forget that `job` was handed out, it will be scheduled again the
    /// next time its chunk is touched.
    pub fn abandon(&mut self, job: Job) {
        if job.generation == self.generation
            && self.chunks.get(job.chunk) == Some(&ChunkState::Pending)
        {
            self.chunks[job.chunk] = ChunkState::Unverified;
        }
    }

    /// Verify everything on disk against a tree with chunks of
    /// `node_size` bytes.
    ///
    /// When a tree is already attached, the swap is refused once more
    /// than `tree_swap_leaves` chunks were verified against it.
    pub fn attach_tree(&mut self, node_size: u64) -> Result<Vec<Job>, Error> {
        if self.has_tree() && self.verified_leaves() > self.tree_swap_leaves {
            return Err(Error::TreeRefused);
        }

        // everything on disk is checked again
        let verified = std::mem::take(&mut self.verified);
        let kept = std::mem::take(&mut self.kept);
        self.written.add_all(&verified);
        self.written.add_all(&kept);

        self.generation += 1;
        self.node_size = Some(node_size);
        let chunks = self.total.div_ceil(node_size) as usize;
        self.chunks = vec![ChunkState::Unverified; chunks];
        debug!(
            "tree attached, {chunks} chunks of {node_size} bytes, generation {}",
            self.generation
        );

        Ok(self.all_ready_chunks())
    }

    /// Adopt bytes already in storage up to `known_len` as written.
    pub fn scan_existing(&mut self, known_len: u64) -> Vec<Job> {
        let end = known_len.min(self.total);
        if end == 0 {
            return Vec::new();
        }
        let existing = self.white.clip(Interval::new(0, end - 1));
        self.white.delete_all(&existing);
        self.written.add_all(&existing);
        self.scanned.add_all(&existing);

        if self.has_tree() {
            self.ready_chunks(Interval::new(0, end - 1))
        } else {
            Vec::new()
        }
    }

    /// Return every lease to white, used when the file is closed.
    pub fn release_all_leases(&mut self) {
        let leased = std::mem::take(&mut self.leased);
        self.white.add_all(&leased);
    }
}
