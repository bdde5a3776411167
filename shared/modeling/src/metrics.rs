//! JSONL recording of per-step training metrics and evaluation reports, for comparing
//! runs and plotting convergence offline.

use crate::{EvalReport, Scorer, TrainStepMetrics};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Non-finite values have no JSON form: they are written as `null` and read back as NaN.
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// One line of the metrics file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricsRecord {
    Train {
        step: u64,
        /// Local loss of the coordinating replica
        #[serde(with = "nan_as_null")]
        loss: f64,
        lr: f64,
        /// Display metrics averaged across replicas
        #[serde(flatten)]
        metrics: TrainStepMetrics,
        /// L2 norm over all trainable gradients
        #[serde(with = "nan_as_null")]
        grad_norm: f64,
        timestamp_ms: u64,
    },
    Eval {
        step: u64,
        #[serde(flatten)]
        report: EvalReport,
        timestamp_ms: u64,
    },
}

impl MetricsRecord {
    pub fn step(&self) -> u64 {
        match self {
            MetricsRecord::Train { step, .. } | MetricsRecord::Eval { step, .. } => *step,
        }
    }
}

/// Global L2 norm of the gradients currently held by `model`'s trainable variables.
pub fn grad_norm(model: &dyn Scorer) -> f64 {
    let _guard = tch::no_grad_guard();
    model
        .trainable_variables()
        .iter()
        .map(|v| v.grad())
        .filter(|g| g.defined())
        .map(|g| {
            g.to_kind(tch::Kind::Float)
                .square()
                .sum(tch::Kind::Float)
                .double_value(&[])
        })
        .sum::<f64>()
        .sqrt()
}

/// Configuration for metrics recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Path to the JSONL output file
    pub output_path: PathBuf,
    /// Record training metrics every N steps (1 = every step). Evaluations are always recorded.
    pub record_every_n_steps: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_path: PathBuf::from("training_metrics.jsonl"),
            record_every_n_steps: 1,
        }
    }
}

impl MetricsConfig {
    pub fn enabled(output_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    pub fn record_every(mut self, n: u64) -> Self {
        self.record_every_n_steps = n.max(1);
        self
    }
}

/// Recorder that appends [`MetricsRecord`]s to a JSONL file
pub struct MetricsRecorder {
    config: MetricsConfig,
    writer: Option<BufWriter<File>>,
    records_written: u64,
}

impl MetricsRecorder {
    pub fn new(config: MetricsConfig) -> std::io::Result<Self> {
        let writer = if config.enabled {
            if let Some(parent) = config.output_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output_path)?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            config,
            writer,
            records_written: 0,
        })
    }

    /// A no-op recorder, used on every replica but the coordinator.
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            writer: None,
            records_written: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.writer.is_some()
    }

    pub fn should_record(&self, step: u64) -> bool {
        self.is_enabled() && step % self.config.record_every_n_steps == 0
    }

    pub fn record(&mut self, record: &MetricsRecord) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            let json = serde_json::to_string(record)?;
            writeln!(writer, "{}", json)?;
            writer.flush()?;
            self.records_written += 1;
        }
        Ok(())
    }

    /// Records a training step if `step` falls on the recording interval. Call after the
    /// backward pass so gradients are still populated.
    pub fn record_train_step(
        &mut self,
        step: u64,
        loss: f64,
        lr: f64,
        metrics: &TrainStepMetrics,
        model: &dyn Scorer,
    ) -> std::io::Result<()> {
        if !self.should_record(step) {
            return Ok(());
        }
        self.record(&MetricsRecord::Train {
            step,
            loss,
            lr,
            metrics: metrics.clone(),
            grad_norm: grad_norm(model),
            timestamp_ms: now_ms(),
        })
    }

    pub fn record_eval(&mut self, step: u64, report: &EvalReport) -> std::io::Result<()> {
        self.record(&MetricsRecord::Eval {
            step,
            report: report.clone(),
            timestamp_ms: now_ms(),
        })
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn output_path(&self) -> &Path {
        &self.config.output_path
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for MetricsRecorder {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Load records from a JSONL file, skipping blank lines
pub fn load_metrics(path: impl AsRef<Path>) -> std::io::Result<Vec<MetricsRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }

    Ok(records)
}
