//! Strategies that choose the next byte range to request.
//!
//! Every strategy answers the same question: given the bytes a source can
//! give us, the first byte we still need (the preview boundary), the last
//! byte we still need and the largest lease allowed, which range should be
//! requested next?
//!
//! - [`SequentialStrategy`] always takes the lowest block.
//! - [`RandomStrategy`] spreads leases over the file, growing picks so
//!   small fragments do not get stranded between leases.
//! - [`BiasedRandomStrategy`] downloads the start of the file in order,
//!   mixes in random picks until half the file is committed, then goes
//!   fully random. It is the default.
mod biased;
mod random;
mod sequential;

use std::{collections::VecDeque, sync::Arc, sync::Mutex};

use rand::{rngs::StdRng, Rng, SeedableRng};

pub use biased::BiasedRandomStrategy;
pub use random::RandomStrategy;
pub use sequential::SequentialStrategy;

use crate::{
    error::Error,
    interval::{Interval, IntervalSet},
};

/// Picks one range out of the bytes a source has available.
pub trait SelectionStrategy: Send {
    /// The returned interval lies within
    /// `available ∩ [preview_len, last_needed]` and never spans more than
    /// `block_size` bytes or crosses a `block_size` boundary.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero block size, a preview
    ///   boundary past `last_needed + 1`, or a `last_needed` past the end
    ///   of the file.
    /// - [`Error::Exhausted`] when nothing in range is available.
    fn pick(
        &mut self,
        available: &IntervalSet,
        preview_len: u64,
        last_needed: u64,
        block_size: u64,
    ) -> Result<Interval, Error>;
}

/// Source of randomness used by the strategies, injected so tests can
/// script every draw.
pub trait PseudoRandom: Send {
    /// Uniform in `[0, 1)`.
    fn next_float(&mut self) -> f64;
    /// Uniform in `[0, bound)`. `bound` is never zero.
    fn next_index(&mut self, bound: usize) -> usize;
    fn next_u64(&mut self) -> u64;
}

/// [`PseudoRandom`] backed by the `rand` crate.
#[derive(Debug)]
pub struct SystemRandom(StdRng);

impl SystemRandom {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Default for SystemRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl PseudoRandom for SystemRandom {
    fn next_float(&mut self) -> f64 {
        self.0.gen::<f64>()
    }

    fn next_index(&mut self, bound: usize) -> usize {
        self.0.gen_range(0..bound)
    }

    fn next_u64(&mut self) -> u64 {
        self.0.gen()
    }
}

#[derive(Debug, Default)]
struct Script {
    floats: VecDeque<f64>,
    ints: VecDeque<usize>,
    longs: VecDeque<u64>,
}

fn draw<T: Copy + Default>(queue: &mut VecDeque<T>) -> T {
    // the last value sticks
    if queue.len() > 1 {
        queue.pop_front().unwrap_or_default()
    } else {
        queue.front().copied().unwrap_or_default()
    }
}

/// A [`PseudoRandom`] that returns scripted values.
///
/// Values are consumed in order and the last one of each kind is
/// repeated forever. Clones share the same script, so a test can keep a
/// handle after moving one into a strategy.
#[derive(Debug, Clone, Default)]
pub struct PredeterminedRandom {
    script: Arc<Mutex<Script>>,
}

impl PredeterminedRandom {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script(&self, f: impl FnOnce(&mut Script)) {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut script);
    }

    pub fn set_floats(&self, values: &[f64]) {
        self.with_script(|s| s.floats = values.iter().copied().collect());
    }

    pub fn set_float(&self, value: f64) {
        self.set_floats(&[value]);
    }

    pub fn set_ints(&self, values: &[usize]) {
        self.with_script(|s| s.ints = values.iter().copied().collect());
    }

    pub fn set_int(&self, value: usize) {
        self.set_ints(&[value]);
    }

    pub fn set_longs(&self, values: &[u64]) {
        self.with_script(|s| s.longs = values.iter().copied().collect());
    }

    pub fn set_long(&self, value: u64) {
        self.set_longs(&[value]);
    }
}

impl PseudoRandom for PredeterminedRandom {
    fn next_float(&mut self) -> f64 {
        let mut v = 0.0;
        self.with_script(|s| v = draw(&mut s.floats));
        v
    }

    fn next_index(&mut self, bound: usize) -> usize {
        let mut v = 0;
        self.with_script(|s| v = draw(&mut s.ints));
        v % bound
    }

    fn next_u64(&mut self) -> u64 {
        let mut v = 0;
        self.with_script(|s| v = draw(&mut s.longs));
        v
    }
}

/// Checks the common arguments and returns the candidate bytes:
/// `available ∩ [preview_len, last_needed]`.
pub(crate) fn candidates(
    available: &IntervalSet,
    preview_len: u64,
    last_needed: u64,
    block_size: u64,
    file_size: u64,
) -> Result<IntervalSet, Error> {
    if block_size == 0 {
        return Err(Error::InvalidArgument("block size is zero".into()));
    }
    if last_needed >= file_size {
        return Err(Error::InvalidArgument(format!(
            "last needed byte {last_needed} is past the end of a {file_size} \
             bytes file"
        )));
    }
    if preview_len > last_needed.saturating_add(1) {
        return Err(Error::InvalidArgument(format!(
            "preview length {preview_len} is past the last needed byte \
             {last_needed}"
        )));
    }
    if preview_len > last_needed {
        return Err(Error::Exhausted);
    }

    let candidates = available.clip(Interval::new(preview_len, last_needed));
    if candidates.is_empty() {
        return Err(Error::Exhausted);
    }
    Ok(candidates)
}

/// Last offset of the block holding `offset`.
pub(crate) fn block_end(offset: u64, block_size: u64) -> u64 {
    (offset / block_size)
        .saturating_add(1)
        .saturating_mul(block_size)
        .saturating_sub(1)
}

/// The lowest candidate bytes, cut at the first block boundary.
pub(crate) fn lowest_block(
    candidates: &IntervalSet,
    block_size: u64,
) -> Result<Interval, Error> {
    let first = candidates.first().ok_or(Error::Exhausted)?;
    let high = first.high().min(block_end(first.low(), block_size));
    if high == first.high() {
        Ok(first)
    } else {
        Ok(Interval::new(first.low(), high))
    }
}
