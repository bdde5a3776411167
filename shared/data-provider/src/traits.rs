use anyhow::{anyhow, Result};

/// Random-access source of token sequences, one per example.
///
/// Items use `-1` as the prompt/response separator.
pub trait TokenDataset: Send + Sync {
    fn len(&self) -> usize;

    fn item(&self, index: usize) -> Result<Vec<i32>>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn items(&self, indices: &[usize]) -> Result<Vec<Vec<i32>>> {
        indices.iter().map(|i| self.item(*i)).collect()
    }
}

impl TokenDataset for Vec<Vec<i32>> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn item(&self, index: usize) -> Result<Vec<i32>> {
        self.get(index).cloned().ok_or_else(|| {
            anyhow!(
                "index {index} is out of bounds, we only have {} samples.",
                Vec::len(self)
            )
        })
    }
}
