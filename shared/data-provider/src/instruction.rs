use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::collate::SEPARATOR_TOKEN;

const PREAMBLE_NO_INPUT: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.";

const PREAMBLE_WITH_INPUT: &str = "Below is an instruction that describes a task, \
paired with an input that provides further context. \
Write a response that appropriately completes the request.";

/// One line of an instruction-tuning `raw.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub instruction: String,
    #[serde(default)]
    pub input: String,
    pub output: String,
}

/// Renders the instruction template, choosing the input-bearing variant only when
/// `record.input` is non-empty.
pub fn format_prompt(record: &InstructionRecord) -> String {
    if record.input.is_empty() {
        format!(
            "{PREAMBLE_NO_INPUT}\n\n### Instruction:\n{}\n\n### Response:\n",
            record.instruction
        )
    } else {
        format!(
            "{PREAMBLE_WITH_INPUT}\n\n### Instruction:\n{}\n\n### Input:\n{}\n\n### Response:\n",
            record.instruction, record.input
        )
    }
}

/// Text to token ids, without special tokens.
pub trait TextEncoder: Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub max_prompt_length: usize,
    /// Prepended to both prompt and full sequence when set.
    pub bos_token_id: Option<u32>,
    pub eos_token_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedInstruction {
    pub instruction: String,
    pub prompt: String,
    pub input: String,
    pub output: String,
    #[serde(skip)]
    pub prompt_tokens: Vec<u32>,
    #[serde(skip)]
    pub response_tokens: Vec<u32>,
}

impl EncodedInstruction {
    /// The stored item: `prompt ++ [-1] ++ response`.
    pub fn to_item(&self) -> Vec<i32> {
        self.prompt_tokens
            .iter()
            .map(|t| *t as i32)
            .chain(std::iter::once(SEPARATOR_TOKEN))
            .chain(self.response_tokens.iter().map(|t| *t as i32))
            .collect()
    }
}

/// Tokenizes one record. Returns `None` when the prompt is longer than
/// `max_prompt_length` tokens.
///
/// The response tokens are the tail of `encode(prompt + output) ++ [eos]` past the prompt
/// length, so merges across the boundary stay with the response.
pub fn encode_instruction(
    encoder: &dyn TextEncoder,
    record: &InstructionRecord,
    options: &EncodeOptions,
) -> Result<Option<EncodedInstruction>> {
    let prompt = format_prompt(record);
    let mut prompt_tokens = encoder.encode(&prompt)?;
    let mut full_tokens = encoder.encode(&format!("{prompt}{}", record.output))?;
    full_tokens.push(options.eos_token_id);
    if let Some(bos) = options.bos_token_id {
        prompt_tokens.insert(0, bos);
        full_tokens.insert(0, bos);
    }
    if prompt_tokens.len() > options.max_prompt_length {
        return Ok(None);
    }
    let response_tokens = full_tokens
        .get(prompt_tokens.len()..)
        .map(|tail| tail.to_vec())
        .unwrap_or_default();
    Ok(Some(EncodedInstruction {
        instruction: record.instruction.clone(),
        prompt,
        input: record.input.clone(),
        output: record.output.clone(),
        prompt_tokens,
        response_tokens,
    }))
}

/// Mean / max / min of a list of lengths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthStats {
    pub mean: f64,
    pub max: usize,
    pub min: usize,
}

impl LengthStats {
    pub fn from_lengths(lengths: &[usize]) -> Option<Self> {
        let max = *lengths.iter().max()?;
        let min = *lengths.iter().min()?;
        let mean = lengths.iter().sum::<usize>() as f64 / lengths.len() as f64;
        Some(Self { mean, max, min })
    }
}

impl std::fmt::Display for LengthStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mean: {:.2} Max: {} Min: {}", self.mean, self.max, self.min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// One token per byte.
    struct ByteEncoder;

    impl TextEncoder for ByteEncoder {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }
    }

    fn record(input: &str) -> InstructionRecord {
        InstructionRecord {
            instruction: "Add.".to_string(),
            input: input.to_string(),
            output: "4".to_string(),
        }
    }

    #[test]
    fn test_template_selection() {
        let no_input = format_prompt(&record(""));
        assert!(no_input.starts_with("Below is an instruction that describes a task. Write"));
        assert!(no_input.ends_with("### Instruction:\nAdd.\n\n### Response:\n"));
        assert!(!no_input.contains("### Input:"));

        let with_input = format_prompt(&record("2 + 2"));
        assert!(with_input.contains("paired with an input that provides further context."));
        assert!(with_input.ends_with("### Instruction:\nAdd.\n\n### Input:\n2 + 2\n\n### Response:\n"));
    }

    #[test]
    fn test_encode_splits_prompt_and_response() {
        let options = EncodeOptions {
            max_prompt_length: 1024,
            bos_token_id: Some(1),
            eos_token_id: 2,
        };
        let encoded = encode_instruction(&ByteEncoder, &record(""), &options)
            .unwrap()
            .unwrap();
        assert_eq!(encoded.prompt_tokens[0], 1);
        assert_eq!(encoded.prompt_tokens.len(), encoded.prompt.len() + 1);
        assert_eq!(encoded.response_tokens, vec![u32::from(b'4'), 2]);

        let item = encoded.to_item();
        assert_eq!(item.len(), encoded.prompt_tokens.len() + 1 + 2);
        assert_eq!(item[encoded.prompt_tokens.len()], -1);
    }

    #[test]
    fn test_long_prompt_is_dropped() {
        let options = EncodeOptions {
            max_prompt_length: 8,
            bos_token_id: None,
            eos_token_id: 2,
        };
        assert!(encode_instruction(&ByteEncoder, &record(""), &options)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_length_stats() {
        assert_eq!(LengthStats::from_lengths(&[]), None);
        let stats = LengthStats::from_lengths(&[2, 4, 9]).unwrap();
        assert_eq!(stats.max, 9);
        assert_eq!(stats.min, 2);
        assert_eq!(stats.mean, 5.0);
    }
}
