use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rkd_core::{logging, TokenSize};
use rkd_data_provider::{
    encode_instruction, EncodeOptions, EncodedInstruction, IndexedDatasetBuilder,
    InstructionRecord, LengthStats, TextEncoder,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tokenizers::Tokenizer;
use tracing::info;

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Directory containing raw.jsonl
    #[arg(long)]
    data_dir: PathBuf,

    /// Path to a tokenizer.json
    #[arg(long)]
    tokenizer: PathBuf,

    /// Output directory for <split>_0.{bin,idx} and <split>.jsonl
    #[arg(long)]
    save: PathBuf,

    /// The first N lines become the dev split; 0 writes only train
    #[arg(long, default_value_t = 1000)]
    dev_num: usize,

    #[arg(long, default_value_t = 256)]
    max_prompt_length: usize,

    #[arg(long, default_value = "</s>")]
    eos_token: String,

    /// Prepended to every prompt when set, for tokenizers that expect it (llama, mistral)
    #[arg(long)]
    bos_token: Option<String>,

    #[arg(long, default_value_t = 2)]
    token_size: usize,

    /// Encoding threads; defaults to one per core
    #[arg(long)]
    workers: Option<usize>,
}

struct HfEncoder(Tokenizer);

impl TextEncoder for HfEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.0.encode(text, false).map_err(|e| anyhow!(e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .with_context(|| format!("token {token:?} is not in the tokenizer vocabulary"))
}

/// `(split name, lines)` in write order.
fn split_lines(lines: Vec<String>, dev_num: usize) -> Vec<(&'static str, Vec<String>)> {
    if dev_num == 0 {
        return vec![("train", lines)];
    }
    let mut dev = lines;
    let train = dev.split_off(dev_num.min(dev.len()));
    vec![("dev", dev), ("train", train)]
}

#[derive(Debug, PartialEq)]
struct SplitSummary {
    kept: usize,
    dropped: usize,
    prompt: Option<LengthStats>,
    response: Option<LengthStats>,
}

/// Encodes one split in parallel and writes `<save>/<split>_0.{bin,idx}` and
/// `<save>/<split>.jsonl`, keeping input order.
fn process_split(
    encoder: &dyn TextEncoder,
    options: &EncodeOptions,
    token_size: TokenSize,
    save: &Path,
    split: &str,
    lines: &[String],
) -> Result<SplitSummary> {
    let progress = ProgressBar::new(lines.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{msg} {bar:40} {pos}/{len} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.set_message(split.to_string());

    let encoded = lines
        .par_iter()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let record: InstructionRecord = serde_json::from_str(line)
                .with_context(|| format!("{split} line {}: malformed record", index + 1))?;
            let encoded = encode_instruction(encoder, &record, options)?;
            progress.inc(1);
            Ok(encoded)
        })
        .collect::<Result<Vec<Option<EncodedInstruction>>>>()?;
    progress.finish_and_clear();

    let prefix = save.join(format!("{split}_0"));
    let mut builder = IndexedDatasetBuilder::new(&prefix, token_size)?;
    let json_path = save.join(format!("{split}.jsonl"));
    let mut json = BufWriter::new(
        File::create(&json_path).with_context(|| format!("creating {}", json_path.display()))?,
    );

    let mut prompt_lens = Vec::new();
    let mut response_lens = Vec::new();
    let mut dropped = 0;
    for instance in encoded {
        let Some(instance) = instance else {
            dropped += 1;
            continue;
        };
        if prompt_lens.is_empty() {
            info!(
                split,
                prompt = %instance.prompt,
                prompt_tokens = ?instance.prompt_tokens,
                response_tokens = ?instance.response_tokens,
                "First instance"
            );
        }
        builder.add_item(&instance.to_item())?;
        serde_json::to_writer(&mut json, &instance)?;
        writeln!(json)?;
        prompt_lens.push(instance.prompt_tokens.len());
        response_lens.push(instance.response_tokens.len());
    }
    json.flush()?;
    builder.finalize()?;

    Ok(SplitSummary {
        kept: prompt_lens.len(),
        dropped,
        prompt: LengthStats::from_lengths(&prompt_lens),
        response: LengthStats::from_lengths(&response_lens),
    })
}

fn main() -> Result<()> {
    logging().init()?;
    let args = Args::parse();

    if let Some(workers) = args.workers {
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build_global()?;
    }

    let tokenizer = Tokenizer::from_file(&args.tokenizer)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("loading tokenizer {}", args.tokenizer.display()))?;
    let options = EncodeOptions {
        max_prompt_length: args.max_prompt_length,
        bos_token_id: args
            .bos_token
            .as_deref()
            .map(|t| token_id(&tokenizer, t))
            .transpose()?,
        eos_token_id: token_id(&tokenizer, &args.eos_token)?,
    };
    let token_size: TokenSize = args.token_size.try_into()?;
    let encoder = HfEncoder(tokenizer);

    let raw_path = args.data_dir.join("raw.jsonl");
    let raw = std::fs::read_to_string(&raw_path)
        .with_context(|| format!("reading {}", raw_path.display()))?;
    let lines: Vec<String> = raw.lines().map(str::to_string).collect();
    std::fs::create_dir_all(&args.save)?;

    for (split, lines) in split_lines(lines, args.dev_num) {
        let summary = process_split(&encoder, &options, token_size, &args.save, split, &lines)?;
        info!(
            split,
            kept = summary.kept,
            dropped = summary.dropped,
            "Data num {}",
            summary.kept
        );
        if let (Some(prompt), Some(response)) = (summary.prompt, summary.response) {
            info!(split, "Prompt lengths. {prompt}");
            info!(split, "Response lengths. {response}");
        }
    }
    Ok(())
}
