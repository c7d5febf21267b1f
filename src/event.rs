use serde::Deserialize;

use crate::labels::Labels;
use crate::{Error, Result};

/// One inference cycle's output: a probability per label, index-aligned with [`Labels`].
///
/// No ordering or summing invariant is enforced; the engine is trusted to produce comparable
/// scores.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassificationEvent {
    pub scores: Vec<f32>,
}

/// The winning label of a [`ClassificationEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct TopPrediction<'a> {
    pub index: usize,
    pub label: &'a str,
    pub confidence: f32,
}

impl ClassificationEvent {
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores }
    }

    /// Highest-scoring label.
    ///
    /// Ties go to the first index holding the maximum. NaN scores never win. Fails when the
    /// score count doesn't match the label count.
    pub fn top<'a>(&self, labels: &'a Labels) -> Result<TopPrediction<'a>> {
        if self.scores.len() != labels.len() {
            return Err(Error::ContractViolation {
                expected: labels.len(),
                actual: self.scores.len(),
            });
        }

        let mut best: Option<(usize, f32)> = None;
        for (index, &score) in self.scores.iter().enumerate() {
            if score.is_nan() {
                continue;
            }
            match best {
                // Strict `>` keeps the earliest index on ties.
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((index, score)),
            }
        }

        // All-NaN vectors fall back to index 0 with zero confidence so they land below the floor.
        let (index, confidence) = best.unwrap_or((0, 0.0));
        let label = labels.get(index).ok_or_else(|| Error::ContractViolation {
            expected: labels.len(),
            actual: self.scores.len(),
        })?;

        Ok(TopPrediction {
            index,
            label,
            confidence,
        })
    }
}
