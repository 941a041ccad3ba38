use std::collections::BTreeMap;

use crate::{error::Result, TrainingError};

pub type MetricMap = BTreeMap<String, f64>;

/// Scores a generated corpus against its references.
pub trait Evaluator {
    fn evaluate(&self, generated: &[String], references: &[String]) -> Result<MetricMap>;
}

/// Percentage of generations equal to their reference after trimming.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchEvaluator;

impl Evaluator for ExactMatchEvaluator {
    fn evaluate(&self, generated: &[String], references: &[String]) -> Result<MetricMap> {
        if generated.len() != references.len() {
            return Err(TrainingError::runtime(format!(
                "{} generations for {} references",
                generated.len(),
                references.len()
            )));
        }
        let matches = generated
            .iter()
            .zip(references)
            .filter(|(hypothesis, reference)| hypothesis.trim() == reference.trim())
            .count();
        let score = if references.is_empty() {
            0.0
        } else {
            100.0 * matches as f64 / references.len() as f64
        };
        Ok(BTreeMap::from([("exact_match".to_string(), score)]))
    }
}
