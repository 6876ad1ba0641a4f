use rand::Rng;
use serde::{Deserialize, Serialize};

/// The per-bit stochastic decision of whether to invert a bit.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for the draw.
pub trait FlipTrial<R: Rng + ?Sized> {
    /// Returns `true` if the bit under test should be flipped at error rate `rate`.
    ///
    /// `rate` is always in `(0, 1]`; callers validate it before mutation starts.
    fn flips(&mut self, rate: f64, rng: &mut R) -> bool;
}

/// Draws two uniform numbers, divides each by the rate and floors them; the bit
/// flips when both quotients land in the same bucket.
///
/// This is the historical trial. Its flip probability is close to, but not exactly,
/// `rate`: at `rate = 1.0` it always flips, and for `1/rate` an integer `k` it is
/// `1/k`, while other rates give a partial last bucket and a different law.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuotientMatchTrial;

impl<R: Rng + ?Sized> FlipTrial<R> for QuotientMatchTrial {
    fn flips(&mut self, rate: f64, rng: &mut R) -> bool {
        let first: f64 = rng.random();
        let second: f64 = rng.random();
        (first / rate).floor() == (second / rate).floor()
    }
}

/// Flips independently with probability exactly `rate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BernoulliTrial;

impl<R: Rng + ?Sized> FlipTrial<R> for BernoulliTrial {
    fn flips(&mut self, rate: f64, rng: &mut R) -> bool {
        rng.random_bool(rate.clamp(0.0, 1.0))
    }
}

/// Selects which flip trial the injector runs.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TrialKind {
    #[default]
    QuotientMatch,
    Bernoulli,
}

impl TrialKind {
    pub fn build<R: Rng + ?Sized>(self) -> Box<dyn FlipTrial<R> + Send> {
        match self {
            TrialKind::QuotientMatch => Box::new(QuotientMatchTrial),
            TrialKind::Bernoulli => Box::new(BernoulliTrial),
        }
    }
}

/// The result of one mutation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// The buffer after mutation; identical to the input when nothing flipped.
    pub bytes: Vec<u8>,
    /// Global positions of flipped bits, in the order they were tested.
    ///
    /// Position `i * 8 + j` is bit `j` of byte `len - 1 - i` of the big-endian
    /// buffer, so position 0 is the least-significant bit of the last byte.
    pub flipped: Vec<usize>,
}

impl Mutation {
    pub fn is_noop(&self) -> bool {
        self.flipped.is_empty()
    }
}

/// A `Mutator` corrupts a canonical byte buffer at a given error rate.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    /// Performs one mutation pass over `bytes` at error rate `rate`.
    ///
    /// The input slice is left untouched; the mutated copy and the flipped
    /// positions are returned together.
    fn mutate(&mut self, bytes: &[u8], rate: f64, rng: &mut R) -> Mutation;
}

/// Tests every bit of the buffer once, least-significant byte first, and inverts
/// the ones the configured [`FlipTrial`] selects.
pub struct BitFlipMutator<R: Rng + ?Sized> {
    trial: Box<dyn FlipTrial<R> + Send>,
}

impl<R: Rng + ?Sized> BitFlipMutator<R> {
    pub fn new(trial: Box<dyn FlipTrial<R> + Send>) -> Self {
        Self { trial }
    }

    pub fn with_kind(kind: TrialKind) -> Self {
        Self::new(kind.build())
    }
}

impl<R: Rng + ?Sized> std::fmt::Debug for BitFlipMutator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitFlipMutator").finish_non_exhaustive()
    }
}

impl<R: Rng + ?Sized> Mutator<R> for BitFlipMutator<R> {
    fn mutate(&mut self, bytes: &[u8], rate: f64, rng: &mut R) -> Mutation {
        let mut mutated = bytes.to_vec();
        let mut flipped = Vec::new();
        let last = mutated.len().saturating_sub(1);

        for i in 0..mutated.len() {
            for j in 0..8 {
                if self.trial.flips(rate, rng) {
                    mutated[last - i] ^= 1 << j;
                    flipped.push(i * 8 + j);
                }
            }
        }

        Mutation {
            bytes: mutated,
            flipped,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::HashSet;

    /// Flips exactly the bits whose global position is listed, ignoring the rate.
    #[derive(Debug, Default, Clone)]
    pub struct ScriptedTrial {
        positions: HashSet<usize>,
        tested: usize,
    }

    impl ScriptedTrial {
        pub fn new(positions: &[usize]) -> Self {
            Self {
                positions: positions.iter().copied().collect(),
                tested: 0,
            }
        }
    }

    impl<R: Rng + ?Sized> FlipTrial<R> for ScriptedTrial {
        fn flips(&mut self, _rate: f64, _rng: &mut R) -> bool {
            let position = self.tested;
            self.tested += 1;
            self.positions.contains(&position)
        }
    }

    /// A scripted trial that restarts its position count for every value,
    /// for buffers of `width` bytes.
    #[derive(Debug, Clone)]
    pub struct RepeatingTrial {
        positions: HashSet<usize>,
        width_bits: usize,
        tested: usize,
    }

    impl RepeatingTrial {
        pub fn new(positions: &[usize], width_bytes: usize) -> Self {
            Self {
                positions: positions.iter().copied().collect(),
                width_bits: width_bytes * 8,
                tested: 0,
            }
        }
    }

    impl<R: Rng + ?Sized> FlipTrial<R> for RepeatingTrial {
        fn flips(&mut self, _rate: f64, _rng: &mut R) -> bool {
            let position = self.tested % self.width_bits;
            self.tested += 1;
            self.positions.contains(&position)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::ScriptedTrial;
    use super::*;
    use crate::value::{Injectable, Value};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn flipping_bit_zero_of_0x00ff_yields_0x00fe() {
        let mut mutator = BitFlipMutator::<ChaCha8Rng>::new(Box::new(ScriptedTrial::new(&[0])));
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let value = 0x00FFu16.into_value();
        let kind = value.kind();

        let mutation = mutator.mutate(&value.encode().unwrap(), 1.0, &mut rng);

        assert_eq!(mutation.flipped, vec![0]);
        let decoded = Value::decode(&mutation.bytes, kind).unwrap();
        assert_eq!(u16::from_value(decoded), Some(0x00FE));
    }

    #[test]
    fn position_nine_targets_second_least_significant_byte() {
        let mut mutator = BitFlipMutator::<ChaCha8Rng>::new(Box::new(ScriptedTrial::new(&[9])));
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);

        let mutation = mutator.mutate(&[0x00, 0x00, 0x00], 1.0, &mut rng);

        assert_eq!(mutation.flipped, vec![9]);
        assert_eq!(mutation.bytes, vec![0x00, 0x02, 0x00]);
    }

    #[test]
    fn rate_one_flips_every_bit_for_both_trials() {
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        for kind in [TrialKind::QuotientMatch, TrialKind::Bernoulli] {
            let mut mutator = BitFlipMutator::<ChaCha8Rng>::with_kind(kind);
            let mutation = mutator.mutate(&[0x0F, 0xA5], 1.0, &mut rng);
            assert_eq!(mutation.bytes, vec![0xF0, 0x5A]);
            assert_eq!(mutation.flipped, (0..16).collect::<Vec<_>>());
        }
    }

    #[test]
    fn negligible_rate_leaves_buffer_untouched() {
        let mut mutator = BitFlipMutator::<ChaCha8Rng>::with_kind(TrialKind::Bernoulli);
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let input = vec![0xAB; 8];

        let mutation = mutator.mutate(&input, 1e-15, &mut rng);

        assert!(mutation.is_noop());
        assert_eq!(mutation.bytes, input);
    }

    #[test]
    fn empty_buffer_is_a_noop() {
        let mut mutator = BitFlipMutator::<ChaCha8Rng>::with_kind(TrialKind::QuotientMatch);
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let mutation = mutator.mutate(&[], 1.0, &mut rng);
        assert!(mutation.is_noop());
        assert!(mutation.bytes.is_empty());
    }

    #[test]
    fn flipped_positions_are_unique_and_in_bounds() {
        let mut rng = ChaCha8Rng::from_seed([42u8; 32]);
        for kind in [TrialKind::QuotientMatch, TrialKind::Bernoulli] {
            let mut mutator = BitFlipMutator::<ChaCha8Rng>::with_kind(kind);
            for _ in 0..50 {
                let input = vec![0x5Au8; 12];
                let mutation = mutator.mutate(&input, 0.3, &mut rng);
                let unique: HashSet<_> = mutation.flipped.iter().collect();
                assert_eq!(unique.len(), mutation.flipped.len());
                assert!(mutation.flipped.iter().all(|&p| p < input.len() * 8));

                // Every recorded position must account for exactly the changed bits.
                let mut expected = input.clone();
                let last = input.len() - 1;
                for &p in &mutation.flipped {
                    expected[last - p / 8] ^= 1 << (p % 8);
                }
                assert_eq!(expected, mutation.bytes);
            }
        }
    }

    #[test]
    fn quotient_match_frequency_tracks_reciprocal_rates() {
        let mut rng = ChaCha8Rng::from_seed([11u8; 32]);
        let mut trial = QuotientMatchTrial;
        let draws = 20_000;
        let hits = (0..draws)
            .filter(|_| FlipTrial::<ChaCha8Rng>::flips(&mut trial, 0.25, &mut rng))
            .count();
        let observed = hits as f64 / draws as f64;
        assert!(
            (observed - 0.25).abs() < 0.03,
            "observed flip frequency {observed} too far from 0.25"
        );
    }
}
