use tracing::trace;

use crate::{
    config::SelectionConfig,
    error::Error,
    interval::{Interval, IntervalSet},
};

use super::{block_end, candidates, PseudoRandom, SelectionStrategy, SystemRandom};

/// Picks block aligned ranges at random.
///
/// A handful of random locations is cached and reused while still
/// available, so concurrent workers tend to download neighbouring blocks
/// instead of scattering one block per random draw. Picks grow to fill
/// the block they land in, absorbing fragments left over by shorter
/// leases.
pub struct RandomStrategy {
    file_size: u64,
    locations: Vec<Option<u64>>,
    pub(super) rng: Box<dyn PseudoRandom>,
}

impl RandomStrategy {
    pub fn new(file_size: u64, config: &SelectionConfig) -> Self {
        Self::with_random(file_size, config, Box::new(SystemRandom::new()))
    }

    pub fn with_random(
        file_size: u64,
        config: &SelectionConfig,
        rng: Box<dyn PseudoRandom>,
    ) -> Self {
        Self {
            file_size,
            locations: vec![None; config.random_locations.max(1)],
            rng,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// A block aligned offset within `[lower, upper]`, clamped to `lower`.
    fn random_location(
        &mut self,
        lower: u64,
        upper: u64,
        block_size: u64,
    ) -> u64 {
        let first_block = lower / block_size;
        let blocks = upper / block_size - first_block + 1;
        let block = first_block + self.rng.next_u64() % blocks;
        (block * block_size).max(lower)
    }

    /// Pick among candidates that were already validated.
    pub(super) fn pick_random(
        &mut self,
        candidates: &IntervalSet,
        preview_len: u64,
        last_needed: u64,
        block_size: u64,
    ) -> Result<Interval, Error> {
        let first = candidates.first().ok_or(Error::Exhausted)?;

        // a sliver or a single byte, nothing to choose from
        if candidates.size() < block_size {
            return Ok(first);
        }

        let slot = self.rng.next_index(self.locations.len());
        let location = match self.locations[slot] {
            Some(loc) if candidates.contains(loc) => loc,
            _ => {
                let loc =
                    self.random_location(preview_len, last_needed, block_size);
                trace!("random slot {slot} moved to {loc}");
                self.locations[slot] = Some(loc);
                loc
            }
        };

        let run = candidates.interval_at_or_after(location).unwrap_or(first);

        Ok(grow(run, location, block_size))
    }
}

/// Expand around `location` inside `run` up to the edges of its block.
fn grow(run: Interval, location: u64, block_size: u64) -> Interval {
    let start = if run.contains(location) { location } else { run.low() };
    let block_low = start - start % block_size;
    let low = run.low().max(block_low);
    let high = run.high().min(block_end(start, block_size));

    if low == run.low() && high == run.high() {
        run
    } else {
        Interval::new(low, high)
    }
}

impl SelectionStrategy for RandomStrategy {
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
        self.pick_random(&candidates, preview_len, last_needed, block_size)
    }
}

#[cfg(test)]
mod tests {
    use crate::strategy::PredeterminedRandom;

    use super::*;

    fn strategy(file_size: u64) -> (RandomStrategy, PredeterminedRandom) {
        let rng = PredeterminedRandom::new();
        let s = RandomStrategy::with_random(
            file_size,
            &SelectionConfig::default(),
            Box::new(rng.clone()),
        );
        (s, rng)
    }

    #[test]
    fn drains_the_whole_file() {
        let file_size = 12345;
        let block_size = 1234;
        let mut s = RandomStrategy::new(file_size, &SelectionConfig::default());
        let mut available = IntervalSet::full(file_size);
        let mut taken = IntervalSet::new();
        let mut picks = 0;

        while !available.is_empty() {
            let pick = s.pick(&available, 0, file_size - 1, block_size).unwrap();
            assert!(pick.len() <= block_size);
            assert!(available.covers(&pick));
            assert!(!taken.overlaps(&pick));
            available.delete(pick);
            taken.add(pick);
            picks += 1;
        }

        assert_eq!(picks, file_size.div_ceil(block_size));
        assert_eq!(taken, IntervalSet::full(file_size));
    }

    #[test]
    fn picks_the_drawn_block() {
        let (mut s, rng) = strategy(1000);
        rng.set_int(0);
        rng.set_long(3);

        let available = IntervalSet::full(1000);
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(300, 399)
        );
    }

    #[test]
    fn stale_locations_are_recomputed() {
        let (mut s, rng) = strategy(1000);
        rng.set_int(0);
        rng.set_long(3);

        let mut available = IntervalSet::full(1000);
        let first = s.pick(&available, 0, 999, 100).unwrap();
        available.delete(first);

        rng.set_long(5);
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(500, 599)
        );

        // slot 0 still points at 500, which is available
        rng.set_long(9);
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(500, 599)
        );
    }

    #[test]
    fn grows_into_fragments() {
        let (mut s, rng) = strategy(1000);
        rng.set_long(3);

        // only the tail of block 3 is left
        let mut available = IntervalSet::full(1000);
        available.delete(Interval::new(250, 349));
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(350, 399)
        );

        // only the head of block 3 is left
        let mut available = IntervalSet::full(1000);
        available.delete(Interval::new(320, 399));
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(300, 319)
        );
    }

    #[test]
    fn wraps_to_the_first_run() {
        let (mut s, rng) = strategy(1000);
        rng.set_long(9);

        let available: IntervalSet =
            [Interval::new(100, 149), Interval::new(400, 420)].into_iter().collect();
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(100, 149)
        );
    }

    #[test]
    fn returns_existing_runs_as_is() {
        let (mut s, rng) = strategy(1000);
        rng.set_long(6);

        let run = Interval::new(600, 650);
        let available: IntervalSet =
            [Interval::new(100, 199), run].into_iter().collect();
        assert_eq!(s.pick(&available, 0, 999, 100).unwrap(), run);
    }

    #[test]
    fn slivers_ignore_the_draw() {
        let (mut s, rng) = strategy(1000);
        rng.set_long(2);

        let available: IntervalSet =
            [Interval::new(990, 995), Interval::new(997, 999)].into_iter().collect();
        assert_eq!(
            s.pick(&available, 0, 999, 100).unwrap(),
            Interval::new(990, 995)
        );

        let single = IntervalSet::from(Interval::single(500));
        assert_eq!(
            s.pick(&single, 0, 999, 100).unwrap(),
            Interval::single(500)
        );
    }

    #[test]
    fn stays_after_the_preview_boundary() {
        let (mut s, rng) = strategy(1000);
        rng.set_long(0);

        let available = IntervalSet::full(1000);
        assert_eq!(
            s.pick(&available, 150, 999, 100).unwrap(),
            Interval::new(150, 199)
        );
    }
}
