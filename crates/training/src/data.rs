use crate::error::Result;

/// Source of batches for one split.
pub trait DataLoader<B> {
    /// Number of batches a full pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh pass over the split.
    fn batches(&self) -> Box<dyn Iterator<Item = Result<B>> + '_>;

    /// Reference corpus of an evaluation split, one entry per example.
    fn references(&self) -> &[String] {
        &[]
    }
}

/// Loader over batches already held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryLoader<B> {
    batches: Vec<B>,
    references: Vec<String>,
}

impl<B: Clone> InMemoryLoader<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self {
            batches,
            references: Vec::new(),
        }
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }
}

impl<B: Clone> DataLoader<B> for InMemoryLoader<B> {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<B>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }

    fn references(&self) -> &[String] {
        &self.references
    }
}
