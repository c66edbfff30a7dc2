//! Probabilistic sampling gate for match emission.

use rand::Rng;

/// Per-rule probabilistic filter. Sampling only thins emissions; it never
/// admits a position the automaton did not match.
pub struct SamplingGate;

impl SamplingGate {
    /// Whether a match for a rule with the given `sample_percent` should be
    /// emitted. 100 always admits; otherwise a uniform draw from `[0, 100)`
    /// must land under the percentage.
    pub fn admit<R: Rng + ?Sized>(sample_percent: u8, rng: &mut R) -> bool {
        if sample_percent >= 100 {
            return true;
        }
        rng.gen_range(0u8..100) < sample_percent
    }
}
