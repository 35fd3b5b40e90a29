//! In-process stand-in for the real target runner.
//!
//! For smoke testing the search loop on a machine without the instrumented
//! target. Cost grows with input length plus a little seeded noise, so the
//! search has a real gradient to climb and runs are reproducible.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use mcts::{Executor, ExecutorError, RunFeedback, RunKind};

pub struct FakeExecutor {
    rng: ChaCha20Rng,
    seen_lens: HashSet<usize>,
    max_hotspot: u32,
    base_cost: u64,
    cost_per_byte: u64,
}

impl FakeExecutor {
    pub fn new(seed: u64) -> Self {
        debug!(seed, "fake target runner created");
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seen_lens: HashSet::new(),
            max_hotspot: 0,
            base_cost: 200,
            cost_per_byte: 37,
        }
    }
}

impl Executor for FakeExecutor {
    fn run_input(&mut self, input: &str, _kind: RunKind) -> Result<RunFeedback, ExecutorError> {
        let len = input.len();
        let noise = self.rng.gen_range(0..10);
        let cost = self.base_cost + self.cost_per_byte * len as u64 + noise;

        // A never-seen length stands in for a never-seen edge.
        let hnb = if self.seen_lens.insert(len) { 2 } else { 0 };

        let hotspot = (len as u32) * 3 + self.rng.gen_range(0..3);
        let hnm = hotspot > self.max_hotspot;
        if hnm {
            self.max_hotspot = hotspot;
        }

        Ok(RunFeedback {
            cost,
            hnb,
            hnm,
            hotspot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_and_inputs_give_the_same_feedback() {
        let inputs = ["a", "bbbb", "cc", "dddddddd"];
        let mut a = FakeExecutor::new(9);
        let mut b = FakeExecutor::new(9);
        for input in inputs {
            let fa = a.run_input(input, RunKind::Normal).unwrap();
            let fb = b.run_input(input, RunKind::Normal).unwrap();
            assert_eq!(fa.cost, fb.cost);
            assert_eq!(fa.hnb, fb.hnb);
            assert_eq!(fa.hnm, fb.hnm);
            assert_eq!(fa.hotspot, fb.hotspot);
        }
    }

    #[test]
    fn longer_inputs_cost_more() {
        let mut exec = FakeExecutor::new(0);
        let short = exec.run_input("ab", RunKind::Normal).unwrap();
        let long = exec.run_input("abababababab", RunKind::Normal).unwrap();
        assert!(long.cost > short.cost);
    }

    #[test]
    fn novel_lengths_report_coverage_news() {
        let mut exec = FakeExecutor::new(0);
        assert_eq!(exec.run_input("xyz", RunKind::Normal).unwrap().hnb, 2);
        assert_eq!(exec.run_input("abc", RunKind::Normal).unwrap().hnb, 0);
        assert_eq!(exec.run_input("wxyz", RunKind::Normal).unwrap().hnb, 2);
    }

    #[test]
    fn max_hit_only_fires_on_a_new_maximum() {
        let mut exec = FakeExecutor::new(0);
        assert!(exec
            .run_input("aaaaaaaaaa", RunKind::Normal)
            .unwrap()
            .hnm);
        // A much shorter input cannot beat the recorded hotspot.
        assert!(!exec.run_input("a", RunKind::Normal).unwrap().hnm);
    }
}
