//! Inference-only generation over an evaluation split and the text
//! transforms applied before scoring.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

mod evaluator;
mod generation;

pub use evaluator::{Evaluator, ExactMatchEvaluator, MetricMap};
pub use generation::{
    DialogueBatch, DialogueOracle, GenerationStrategy, SinglePass, StagedDialogue, DB_PLACEHOLDER,
};

use crate::{config::PostProcessing, error::Result, TrainingError};

const SEPARATOR: &str = "[SEP]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalSplit {
    Valid,
    Test,
}

impl EvalSplit {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalSplit::Valid => "valid",
            EvalSplit::Test => "test",
        }
    }
}

impl PostProcessing {
    pub fn apply(self, generated: &str) -> String {
        match self {
            PostProcessing::None => generated.to_string(),
            PostProcessing::Paraphrase => paraphrase(generated),
        }
    }
}

/// Keeps the paraphrase part of a generation: the segment after the first
/// `[SEP]`, or without a separator everything from the first space after the
/// last parenthesis.
fn paraphrase(generated: &str) -> String {
    if generated.contains(SEPARATOR) {
        return generated
            .split(SEPARATOR)
            .nth(1)
            .unwrap_or_default()
            .trim()
            .to_string();
    }
    let Some(last_paren) = generated.rfind(['(', ')']) else {
        return generated.trim().to_string();
    };
    match generated[last_paren..].find(' ') {
        Some(offset) => generated[last_paren + offset..].trim().to_string(),
        None => String::new(),
    }
}

/// Drops generations beyond the reference corpus; distributed samplers pad
/// the last batch and can over-produce.
pub fn truncate_to_references(corpus: &mut Vec<String>, reference_len: usize) {
    corpus.truncate(reference_len);
}

/// One generation per line.
pub fn persist_generated_text(path: &Path, corpus: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let mut writer = BufWriter::new(file);
    for line in corpus {
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paraphrase_takes_text_after_separator() {
        let processing = PostProcessing::Paraphrase;
        assert_eq!(processing.apply("foo [SEP] bar baz"), "bar baz");
        assert_eq!(processing.apply("a [SEP] b [SEP] c"), "b");
        assert_eq!(processing.apply("[SEP]"), "");
    }

    #[test]
    fn paraphrase_without_separator_trims_past_last_paren() {
        let processing = PostProcessing::Paraphrase;
        assert_eq!(
            processing.apply("(root (np it)) it rains today"),
            "it rains today"
        );
        assert_eq!(processing.apply("  plain text  "), "plain text");
        assert_eq!(processing.apply("dangling(paren"), "");
    }

    #[test]
    fn identity_post_processing_keeps_text() {
        assert_eq!(PostProcessing::None.apply(" x [SEP] y "), " x [SEP] y ");
    }

    #[test]
    fn corpus_is_truncated_to_reference_length() {
        let mut corpus: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        truncate_to_references(&mut corpus, 2);
        assert_eq!(corpus, vec!["a", "b"]);
        truncate_to_references(&mut corpus, 5);
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn generated_text_is_newline_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.txt");
        persist_generated_text(&path, &["one".to_string(), "two".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "one\ntwo\n");
    }
}
