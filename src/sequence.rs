// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Sequence accumulator
//!
//! Hands out the accumulated value stored with each ledger record. The value
//! lives in memory only and restarts from its baseline with the process,
//! unless the pipeline is configured to resume from the ledger.

/// Strictly increasing per-process counter
///
/// Owned by the ledger writer, which is its only caller.
#[derive(Debug, Clone, Default)]
pub struct SequenceAccumulator {
    last: u64,
}

impl SequenceAccumulator {
    /// Start from baseline 0; the first value handed out is 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after a previously issued value
    pub fn resume_after(last: u64) -> Self {
        Self { last }
    }

    /// Issue the next value
    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    /// Last value issued (the baseline if none yet)
    pub fn last(&self) -> u64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_one() {
        let mut seq = SequenceAccumulator::new();
        assert_eq!(seq.last(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_strictly_increasing() {
        let mut seq = SequenceAccumulator::new();
        let values: Vec<u64> = (0..100).map(|_| seq.next()).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_resume_after() {
        let mut seq = SequenceAccumulator::resume_after(41);
        assert_eq!(seq.next(), 42);
    }
}
