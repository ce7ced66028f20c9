use crate::{
    error::Error,
    interval::{Interval, IntervalSet},
};

use super::{candidates, lowest_block, SelectionStrategy};

/// Always picks the lowest available block, for streaming.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    file_size: u64,
}

impl SequentialStrategy {
    pub fn new(file_size: u64) -> Self {
        Self { file_size }
    }
}

impl SelectionStrategy for SequentialStrategy {
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
            self.file_size,
        )?;
        lowest_block(&candidates, block_size)
    }
}
