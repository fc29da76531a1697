use serde::{Deserialize, Serialize};

/// The four behavior postures a response can be tagged with. Selected by
/// the strategy table *before* the gateway call is made; never inferred
/// from what the model says about itself afterward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Polite,
    Efficient,
    Violating,
    Defensive,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Polite,
        Strategy::Efficient,
        Strategy::Violating,
        Strategy::Defensive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Polite => "polite",
            Strategy::Efficient => "efficient",
            Strategy::Violating => "violating",
            Strategy::Defensive => "defensive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub strategy: Strategy,
    pub usage_count: u64,
    pub success_count: u64,
    pub violation_count: u64,
    pub cumulative_reward: f64,
    pub average_reward: f64,
    pub selection_probability: f64,
    pub score: f64,
}

impl StrategyRecord {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            usage_count: 0,
            success_count: 0,
            violation_count: 0,
            cumulative_reward: 0.0,
            average_reward: 0.0,
            selection_probability: 0.25,
            score: 0.0,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }

    fn violation_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.violation_count as f64 / self.usage_count as f64
        }
    }

    fn recompute_score(&mut self) {
        let normalized_reward = ((self.average_reward + 100.0) / 200.0).clamp(0.0, 1.0);
        self.score = 0.6 * self.success_rate() + 0.4 * normalized_reward - 0.5 * self.violation_rate();
    }
}

/// Tracks per-strategy statistics and performs epsilon-greedy selection.
/// Each experiment owns its own table so that concurrent experiments never
/// share learning state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTable {
    pub epsilon: f64,
    records: Vec<StrategyRecord>,
}

impl StrategyTable {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon: epsilon.clamp(0.0, 1.0),
            records: Strategy::ALL.iter().map(|&s| StrategyRecord::new(s)).collect(),
        }
    }

    pub fn records(&self) -> &[StrategyRecord] {
        &self.records
    }

    pub fn record(&self, strategy: Strategy) -> &StrategyRecord {
        self.records
            .iter()
            .find(|r| r.strategy == strategy)
            .expect("every Strategy variant has a record")
    }

    /// Epsilon-greedy selection using a caller-supplied uniform random
    /// source in `[0, 1)`, so selection is reproducible given a seeded RNG.
    pub fn select(&self, roll: f64, tie_break_roll: f64) -> Strategy {
        if roll < self.epsilon {
            let idx = (tie_break_roll * Strategy::ALL.len() as f64) as usize;
            return Strategy::ALL[idx.min(Strategy::ALL.len() - 1)];
        }

        let mut best = self.records[0].strategy;
        let mut best_score = f64::NEG_INFINITY;
        for record in &self.records {
            if record.score > best_score {
                best_score = record.score;
                best = record.strategy;
            }
        }
        best
    }

    /// Updates the record for `strategy` after one scored episode, then
    /// recomputes every record's selection probability from its score.
    pub fn update(&mut self, strategy: Strategy, reward: f64, is_successful: bool, is_violation: bool) {
        if let Some(record) = self.records.iter_mut().find(|r| r.strategy == strategy) {
            record.usage_count += 1;
            if is_successful {
                record.success_count += 1;
            }
            if is_violation {
                record.violation_count += 1;
            }
            record.cumulative_reward += reward;
            record.average_reward = record.cumulative_reward / record.usage_count as f64;
            record.recompute_score();
        }

        let total_score: f64 = self.records.iter().map(|r| r.score.max(0.0)).sum();
        if total_score > 0.0 {
            for record in &mut self.records {
                record.selection_probability = record.score.max(0.0) / total_score;
            }
        } else {
            let uniform = 1.0 / self.records.len() as f64;
            for record in &mut self.records {
                record.selection_probability = uniform;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epsilon_zero_is_deterministic_argmax() {
        let mut table = StrategyTable::new(0.0);
        table.update(Strategy::Polite, 50.0, true, false);
        let chosen = table.select(0.5, 0.9);
        assert_eq!(chosen, Strategy::Polite);
    }

    #[test]
    fn epsilon_one_is_uniform_via_tie_break_roll() {
        let table = StrategyTable::new(1.0);
        assert_eq!(table.select(0.0, 0.0), Strategy::Polite);
        assert_eq!(table.select(0.0, 0.99), Strategy::Defensive);
    }

    #[test]
    fn usage_and_success_counts_respect_invariant() {
        let mut table = StrategyTable::new(0.1);
        table.update(Strategy::Efficient, 10.0, true, false);
        table.update(Strategy::Efficient, -5.0, false, true);
        let record = table.record(Strategy::Efficient);
        assert!(record.success_count + record.violation_count <= record.usage_count);
        assert_eq!(record.usage_count, 2);
    }

    #[test]
    fn average_reward_matches_cumulative_over_usage() {
        let mut table = StrategyTable::new(0.1);
        table.update(Strategy::Defensive, 20.0, true, false);
        table.update(Strategy::Defensive, 40.0, true, false);
        let record = table.record(Strategy::Defensive);
        assert!((record.average_reward - 30.0).abs() < 1e-9);
    }

    #[test]
    fn selection_probabilities_sum_to_one_after_updates() {
        let mut table = StrategyTable::new(0.1);
        for &s in Strategy::ALL.iter() {
            table.update(s, 10.0, true, false);
        }
        let sum: f64 = table.records().iter().map(|r| r.selection_probability).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
