use ocd_decision_types::{TrainingExample, UserFeedback};
use serde::Serialize;

/// Summary statistics over an exported example set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportStats {
    pub count: usize,
    pub mean_reward: f64,
    pub min_reward: f64,
    pub max_reward: f64,
    pub confirmed: usize,
    pub corrected: usize,
    pub ignored: usize,
}

impl ExportStats {
    pub fn from_examples(examples: &[TrainingExample]) -> Self {
        let Some(first) = examples.first() else {
            return Self::default();
        };

        let mut stats = Self {
            count: examples.len(),
            min_reward: first.reward,
            max_reward: first.reward,
            ..Self::default()
        };
        let mut sum = 0.0;
        for example in examples {
            sum += example.reward;
            stats.min_reward = stats.min_reward.min(example.reward);
            stats.max_reward = stats.max_reward.max(example.reward);
            match example.metadata.user_feedback {
                Some(UserFeedback::Confirmed) => stats.confirmed += 1,
                Some(UserFeedback::Corrected) => stats.corrected += 1,
                Some(UserFeedback::Ignored) => stats.ignored += 1,
                _ => {}
            }
        }
        stats.mean_reward = sum / examples.len() as f64;
        stats
    }

    pub fn confirmed_pct(&self) -> f64 {
        self.percentage(self.confirmed)
    }

    pub fn corrected_pct(&self) -> f64 {
        self.percentage(self.corrected)
    }

    pub fn ignored_pct(&self) -> f64 {
        self.percentage(self.ignored)
    }

    fn percentage(&self, part: usize) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        part as f64 * 100.0 / self.count as f64
    }
}
