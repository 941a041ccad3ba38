use crate::{
    config::GenerationMode, error::Result, evaluation::EvalSplit, model::Model, TrainingError,
};

/// Placeholder in dialogue contexts that the database span replaces.
pub const DB_PLACEHOLDER: &str = "[db_nores]";

/// Turns evaluation batches into generated text.
pub trait GenerationStrategy<M: Model> {
    fn mode(&self) -> GenerationMode;

    /// Called once before a pass over `split`.
    fn begin(&mut self, _split: EvalSplit) -> Result<()> {
        Ok(())
    }

    fn generate_batch(&mut self, model: &M, batch: &M::Batch) -> Result<Vec<String>>;
}

/// One generation call per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePass;

impl<M: Model> GenerationStrategy<M> for SinglePass {
    fn mode(&self) -> GenerationMode {
        GenerationMode::SinglePass
    }

    fn generate_batch(&mut self, model: &M, batch: &M::Batch) -> Result<Vec<String>> {
        model.generate(batch)
    }
}

/// Batch whose rows can be regrouped for staged dialogue generation.
pub trait DialogueBatch: Sized {
    fn rows(&self) -> usize;

    fn select_rows(&self, rows: &[usize]) -> Result<Self>;

    /// Replaces the [`DB_PLACEHOLDER`] of `row` with `span`.
    fn splice_placeholder(&mut self, row: usize, span: &str) -> Result<()>;
}

/// Task-side knowledge consulted between the generation stages.
pub trait DialogueOracle {
    fn load_split(&mut self, split: EvalSplit) -> Result<()>;

    /// Domain of every turn of the loaded split, in loader order.
    fn turn_domains(&self) -> &[String];

    /// Database span for a generated belief state.
    fn span_db(&self, belief_state: &str, domain: &str) -> Result<String>;
}

/// Three-stage generation for task-oriented dialogue. Every turn occupies
/// three consecutive rows: the belief state context and two response
/// contexts. Belief states are generated first, looked up in the database,
/// and the resulting spans are spliced into the response contexts before
/// the second generation call.
pub struct StagedDialogue<O> {
    oracle: O,
    turn_offset: usize,
}

impl<O: DialogueOracle> StagedDialogue<O> {
    pub fn new(oracle: O) -> Self {
        Self {
            oracle,
            turn_offset: 0,
        }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }
}

impl<M, O> GenerationStrategy<M> for StagedDialogue<O>
where
    M: Model,
    M::Batch: DialogueBatch,
    O: DialogueOracle,
{
    fn mode(&self) -> GenerationMode {
        GenerationMode::StagedDialogue
    }

    fn begin(&mut self, split: EvalSplit) -> Result<()> {
        self.turn_offset = 0;
        self.oracle.load_split(split)
    }

    fn generate_batch(&mut self, model: &M, batch: &M::Batch) -> Result<Vec<String>> {
        let rows = batch.rows();
        if rows % 3 != 0 {
            return Err(TrainingError::runtime(format!(
                "dialogue batches need a multiple of 3 rows, got {rows}"
            )));
        }
        let turns = rows / 3;

        let belief_rows: Vec<usize> = (0..turns).map(|turn| turn * 3).collect();
        let belief_states = model.generate(&batch.select_rows(&belief_rows)?)?;
        expect_outputs("belief state", turns, belief_states.len())?;

        let domains = self
            .oracle
            .turn_domains()
            .get(self.turn_offset..self.turn_offset + turns)
            .ok_or_else(|| {
                TrainingError::runtime(format!(
                    "turn domains exhausted at turn {} (batch of {turns} turns)",
                    self.turn_offset
                ))
            })?;
        let spans = belief_states
            .iter()
            .zip(domains)
            .map(|(belief, domain)| self.oracle.span_db(belief, domain))
            .collect::<Result<Vec<_>>>()?;

        let response_rows: Vec<usize> = (0..rows).filter(|row| row % 3 != 0).collect();
        let mut responses = batch.select_rows(&response_rows)?;
        for row in 0..response_rows.len() {
            responses.splice_placeholder(row, &spans[row / 2])?;
        }
        let answers = model.generate(&responses)?;
        expect_outputs("response", 2 * turns, answers.len())?;

        self.turn_offset += turns;
        let mut corpus = Vec::with_capacity(rows);
        for (turn, belief) in belief_states.into_iter().enumerate() {
            corpus.push(belief);
            corpus.push(answers[2 * turn].clone());
            corpus.push(answers[2 * turn + 1].clone());
        }
        Ok(corpus)
    }
}

fn expect_outputs(stage: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(TrainingError::runtime(format!(
            "{stage} generation returned {actual} outputs for {expected} rows"
        )));
    }
    Ok(())
}
