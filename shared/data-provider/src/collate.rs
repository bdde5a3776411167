use thiserror::Error;

/// Token value marking the end of the prompt inside a stored item.
pub const SEPARATOR_TOKEN: i32 = -1;

/// Label value for padded positions. Always paired with a zero loss mask.
const LABEL_PAD: i64 = -100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollateError {
    #[error("cannot collate an empty batch")]
    Empty,

    #[error("item {index} has {len} tokens, at least two are needed to form an input/label pair")]
    TooShort { index: usize, len: usize },

    #[error("item {index} contains more than one prompt/response separator")]
    MultipleSeparators { index: usize },
}

/// Right-padded batch in row-major `[batch][seq]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct CollatedBatch {
    pub input_ids: Vec<Vec<i64>>,
    pub attention_mask: Vec<Vec<i64>>,
    pub label: Vec<Vec<i64>>,
    pub loss_mask: Vec<Vec<f32>>,
}

impl CollatedBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map(|row| row.len()).unwrap_or(0)
    }
}

/// Turns stored `prompt ++ [-1] ++ response` items into shifted next-token batches.
///
/// Only response positions carry loss. An item with no separator is treated as all
/// response.
#[derive(Debug, Clone, Copy)]
pub struct LmCollator {
    pub max_length: usize,
    pub pad_token_id: i64,
}

struct Row {
    input: Vec<i64>,
    label: Vec<i64>,
    loss_mask: Vec<f32>,
}

impl LmCollator {
    pub fn new(max_length: usize, pad_token_id: i64) -> Self {
        Self {
            max_length,
            pad_token_id,
        }
    }

    fn row(&self, index: usize, item: &[i32]) -> Result<Row, CollateError> {
        let mut separators = item
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == SEPARATOR_TOKEN)
            .map(|(i, _)| i);
        let prompt_len = separators.next();
        if separators.next().is_some() {
            return Err(CollateError::MultipleSeparators { index });
        }

        let mut full: Vec<i64> = item
            .iter()
            .filter(|t| **t != SEPARATOR_TOKEN)
            .map(|t| *t as i64)
            .collect();
        full.truncate(self.max_length + 1);
        if full.len() < 2 {
            return Err(CollateError::TooShort {
                index,
                len: full.len(),
            });
        }

        let n = full.len();
        let prompt_len = prompt_len.unwrap_or(0);
        // position i predicts full[i + 1], which is a response token once i + 1 >= prompt_len
        let loss_mask = (0..n - 1)
            .map(|i| if i + 1 >= prompt_len { 1.0 } else { 0.0 })
            .collect();
        Ok(Row {
            input: full[..n - 1].to_vec(),
            label: full[1..].to_vec(),
            loss_mask,
        })
    }

    /// Collates `items` and right-pads every row to the longest one.
    pub fn collate(&self, items: &[Vec<i32>]) -> Result<CollatedBatch, CollateError> {
        if items.is_empty() {
            return Err(CollateError::Empty);
        }
        let rows = items
            .iter()
            .enumerate()
            .map(|(i, item)| self.row(i, item))
            .collect::<Result<Vec<_>, _>>()?;
        let width = rows.iter().map(|r| r.input.len()).max().unwrap_or(0);

        let mut batch = CollatedBatch {
            input_ids: Vec::with_capacity(rows.len()),
            attention_mask: Vec::with_capacity(rows.len()),
            label: Vec::with_capacity(rows.len()),
            loss_mask: Vec::with_capacity(rows.len()),
        };
        for Row {
            mut input,
            mut label,
            mut loss_mask,
        } in rows
        {
            let real = input.len();
            let mut attention = vec![1i64; real];
            input.resize(width, self.pad_token_id);
            label.resize(width, LABEL_PAD);
            loss_mask.resize(width, 0.0);
            attention.resize(width, 0);
            batch.input_ids.push(input);
            batch.attention_mask.push(attention);
            batch.label.push(label);
            batch.loss_mask.push(loss_mask);
        }
        Ok(batch)
    }
}
