use tracing::debug;

use crate::{
    config::SelectionConfig,
    error::Error,
    interval::{Interval, IntervalSet},
};

use super::{
    candidates, lowest_block, PseudoRandom, RandomStrategy, SelectionStrategy,
    SystemRandom,
};

/// Sequential at first, random later.
///
/// - Until the preview limit is committed, picks are strictly sequential.
/// - Until half the file is committed, each pick flips a coin.
/// - After that, picks are random for the rest of the download.
///
/// Committed bytes are the highest preview boundary seen so far, so the
/// phases only ever move forward.
pub struct BiasedRandomStrategy {
    random: RandomStrategy,
    min_preview_bytes: u64,
    min_preview_fraction: f64,
    committed: u64,
    random_only: bool,
}

impl BiasedRandomStrategy {
    pub fn new(file_size: u64, config: &SelectionConfig) -> Self {
        Self::with_random(file_size, config, Box::new(SystemRandom::new()))
    }

    pub fn with_random(
        file_size: u64,
        config: &SelectionConfig,
        rng: Box<dyn PseudoRandom>,
    ) -> Self {
        Self {
            random: RandomStrategy::with_random(file_size, config, rng),
            min_preview_bytes: config.min_preview_bytes,
            min_preview_fraction: config.min_preview_fraction,
            committed: 0,
            random_only: false,
        }
    }

    /// First byte after the preview window, on a block boundary.
    pub fn preview_limit(&self, block_size: u64) -> u64 {
        let file_size = self.random.file_size();
        let by_fraction = (file_size as f64 * self.min_preview_fraction).ceil();
        let limit = self.min_preview_bytes.max(by_fraction as u64);
        limit.div_ceil(block_size).saturating_mul(block_size)
    }

    fn wants_sequential(&mut self, block_size: u64) -> bool {
        if self.committed < self.preview_limit(block_size) {
            return true;
        }
        if self.random_only {
            return false;
        }
        if self.committed >= self.random.file_size() / 2 {
            debug!("half of the file committed, switching to random picks");
            self.random_only = true;
            return false;
        }
        self.random.rng.next_float() < 0.5
    }
}

impl SelectionStrategy for BiasedRandomStrategy {
    fn pick(
        &mut self,
        available: &IntervalSet,
        preview_len: u64,
        last_needed: u64,
        block_size: u64,
    ) -> Result<Interval, Error> {
        let candidates = candidates(
            available,
            preview_len,
            last_needed,
            block_size,
            self.random.file_size(),
        )?;
        self.committed = self.committed.max(preview_len);

        if self.wants_sequential(block_size) {
            lowest_block(&candidates, block_size)
        } else {
            self.random.pick_random(
                &candidates,
                preview_len,
                last_needed,
                block_size,
            )
        }
    }
}
