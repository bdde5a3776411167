use indicatif::{ProgressBar, ProgressStyle};
use rkd_data_provider::{DistributedPartition, LmCollator, TokenDataset};
use serde::{Deserialize, Serialize};
use std::{fmt::Write as _, path::PathBuf};
use tch::{Device, Kind, Tensor};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{
    batches_from_collated, reduction::dataset_mean, Communicator, CommunicatorError, ModelBatch,
    NoModelBatch, ResidualKdLosses,
};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluation step did not produce {0}; request all losses")]
    MissingMetric(&'static str),

    #[error("failed to append evaluation report to {path}: {source}")]
    WriteLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Communicator(#[from] CommunicatorError),

    #[error(transparent)]
    Step(#[from] anyhow::Error),
}

/// The nine per-example quantities collected by evaluation, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EvalMetric {
    Loss,
    LmLoss,
    KdLoss,
    KdEntropy,
    TeacherLoss,
    BaseLoss,
    ResidualLoss,
    ResidualRealLoss,
    ResidualEntropy,
}

impl EvalMetric {
    pub const ALL: [EvalMetric; 9] = [
        EvalMetric::Loss,
        EvalMetric::LmLoss,
        EvalMetric::KdLoss,
        EvalMetric::KdEntropy,
        EvalMetric::TeacherLoss,
        EvalMetric::BaseLoss,
        EvalMetric::ResidualLoss,
        EvalMetric::ResidualRealLoss,
        EvalMetric::ResidualEntropy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EvalMetric::Loss => "loss",
            EvalMetric::LmLoss => "lm_loss",
            EvalMetric::KdLoss => "kd_loss",
            EvalMetric::KdEntropy => "kd_entropy",
            EvalMetric::TeacherLoss => "teacher_loss",
            EvalMetric::BaseLoss => "base_loss",
            EvalMetric::ResidualLoss => "residual_loss",
            EvalMetric::ResidualRealLoss => "residual_real_loss",
            EvalMetric::ResidualEntropy => "residual_entropy",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    fn select<'a>(&self, losses: &'a ResidualKdLosses) -> Option<&'a Tensor> {
        match self {
            EvalMetric::Loss => Some(&losses.loss),
            EvalMetric::LmLoss => Some(&losses.lm_loss),
            EvalMetric::KdLoss => Some(&losses.kd_loss),
            EvalMetric::KdEntropy => Some(&losses.kd_entropy),
            EvalMetric::TeacherLoss => losses.teacher_loss.as_ref(),
            EvalMetric::BaseLoss => losses.base_loss.as_ref(),
            EvalMetric::ResidualLoss => losses.residual_loss.as_ref(),
            EvalMetric::ResidualRealLoss => losses.residual_real_loss.as_ref(),
            EvalMetric::ResidualEntropy => losses.residual_entropy.as_ref(),
        }
    }
}

/// Dataset-wide averages, one per [`EvalMetric`]. An all-masked example makes its
/// averages NaN, which serializes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_lm_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_kd_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_kd_entropy: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_teacher_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_base_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_residual_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_residual_real_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub avg_residual_entropy: f64,
    /// Examples across all replicas.
    pub num_examples: usize,
}

impl EvalReport {
    fn from_averages(averages: [f64; 9], num_examples: usize) -> Self {
        let [avg_loss, avg_lm_loss, avg_kd_loss, avg_kd_entropy, avg_teacher_loss, avg_base_loss, avg_residual_loss, avg_residual_real_loss, avg_residual_entropy] =
            averages;
        Self {
            avg_loss,
            avg_lm_loss,
            avg_kd_loss,
            avg_kd_entropy,
            avg_teacher_loss,
            avg_base_loss,
            avg_residual_loss,
            avg_residual_real_loss,
            avg_residual_entropy,
            num_examples,
        }
    }

    pub fn get(&self, metric: EvalMetric) -> f64 {
        match metric {
            EvalMetric::Loss => self.avg_loss,
            EvalMetric::LmLoss => self.avg_lm_loss,
            EvalMetric::KdLoss => self.avg_kd_loss,
            EvalMetric::KdEntropy => self.avg_kd_entropy,
            EvalMetric::TeacherLoss => self.avg_teacher_loss,
            EvalMetric::BaseLoss => self.avg_base_loss,
            EvalMetric::ResidualLoss => self.avg_residual_loss,
            EvalMetric::ResidualRealLoss => self.avg_residual_real_loss,
            EvalMetric::ResidualEntropy => self.avg_residual_entropy,
        }
    }

    /// `tag | avg_loss: 2.345678 | avg_lm_loss: ...`
    pub fn log_line(&self, tag: &str) -> String {
        let mut line = tag.to_string();
        for metric in EvalMetric::ALL {
            let _ = write!(line, " | avg_{}: {:.6}", metric.name(), self.get(metric));
        }
        line
    }
}

/// Per-metric lists of `[B]` vectors, one entry per evaluated batch.
#[derive(Debug, Default)]
pub struct EvalAccumulator {
    columns: [Vec<Tensor>; 9],
    examples: usize,
}

impl EvalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local example count so far.
    pub fn len(&self) -> usize {
        self.examples
    }

    pub fn is_empty(&self) -> bool {
        self.examples == 0
    }

    /// Appends one per-example step. All nine metrics must be present.
    pub fn push(&mut self, losses: &ResidualKdLosses) -> Result<(), EvalError> {
        let selected = EvalMetric::ALL
            .iter()
            .map(|metric| {
                metric
                    .select(losses)
                    .ok_or(EvalError::MissingMetric(metric.name()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (metric, tensor) in EvalMetric::ALL.iter().zip(selected) {
            self.columns[metric.index()].push(
                tensor
                    .detach()
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float)
                    .flatten(0, -1),
            );
        }
        self.examples += losses.loss.numel();
        Ok(())
    }

    /// Local per-example vector for `metric`, batches concatenated in push order.
    pub fn concat(&self, metric: EvalMetric) -> Tensor {
        let column = &self.columns[metric.index()];
        if column.is_empty() {
            Tensor::zeros([0], (Kind::Float, Device::Cpu))
        } else {
            Tensor::cat(column, 0)
        }
    }

    /// Gathers every replica's vectors and averages each metric over all examples.
    ///
    /// Collective: every replica must call this, in the same metric order.
    pub fn reduce(&self, comm: &Communicator) -> Result<EvalReport, EvalError> {
        let mut averages = [0.0; 9];
        for metric in EvalMetric::ALL {
            averages[metric.index()] = dataset_mean(comm, &self.concat(metric))?;
        }
        let mut count = Tensor::from_slice(&[self.examples as i64]);
        comm.all_reduce(&mut count, crate::ReduceType::Sum)?;
        Ok(EvalReport::from_averages(
            averages,
            count.int64_value(&[0]) as usize,
        ))
    }
}

/// Source of evaluation batches addressed by example index.
pub trait EvalDataset {
    fn num_examples(&self) -> usize;
    fn batch(&self, indices: &[usize]) -> anyhow::Result<(ModelBatch, NoModelBatch)>;
}

/// Evaluation batches collated from a token dataset and placed on `device`.
pub struct TokenEvalDataset<D: TokenDataset> {
    dataset: D,
    collator: LmCollator,
    device: Device,
}

impl<D: TokenDataset> TokenEvalDataset<D> {
    pub fn new(dataset: D, collator: LmCollator, device: Device) -> Self {
        Self {
            dataset,
            collator,
            device,
        }
    }
}

impl<D: TokenDataset> EvalDataset for TokenEvalDataset<D> {
    fn num_examples(&self) -> usize {
        self.dataset.len()
    }

    fn batch(&self, indices: &[usize]) -> anyhow::Result<(ModelBatch, NoModelBatch)> {
        let items = self.dataset.items(indices)?;
        let collated = self.collator.collate(&items)?;
        let (model_batch, no_model_batch) = batches_from_collated(&collated);
        Ok((
            model_batch.to_device(self.device),
            no_model_batch.to_device(self.device),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    Idle,
    Running { batch_index: usize },
    Reducing,
    Reported,
}

/// One pass over a held-out set: a non-shuffled, non-dropping shard per replica,
/// per-example accumulation, an exact cross-replica mean, a report written by the
/// coordinator, and a closing barrier.
pub struct Evaluator<'a> {
    comm: &'a Communicator,
    batch_size: usize,
    log_file: Option<PathBuf>,
    phase: EvalPhase,
}

impl<'a> Evaluator<'a> {
    pub fn new(comm: &'a Communicator, batch_size: usize) -> Self {
        assert!(batch_size > 0, "eval batch size must be positive");
        Self {
            comm,
            batch_size,
            log_file: None,
            phase: EvalPhase::Idle,
        }
    }

    /// Append the report line to `path` on the coordinating replica.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn phase(&self) -> EvalPhase {
        self.phase
    }

    fn transition(&mut self, next: EvalPhase) {
        trace!(rank = self.comm.rank(), from = ?self.phase, to = ?next, "eval phase");
        self.phase = next;
    }

    fn publish(&self, report: &EvalReport) -> Result<(), EvalError> {
        let line = report.log_line("eval");
        info!(
            examples = report.num_examples,
            avg_loss = report.avg_loss,
            avg_lm_loss = report.avg_lm_loss,
            avg_kd_loss = report.avg_kd_loss,
            "{line}"
        );
        if let Some(path) = &self.log_file {
            rkd_core::append_log_line(path, &line).map_err(|source| EvalError::WriteLog {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Runs `step` on every local batch with gradients disabled and returns the report on
    /// the coordinating replica (`None` elsewhere).
    ///
    /// `step` must return per-example vectors with all losses present.
    pub fn run<F>(&mut self, dataset: &dyn EvalDataset, mut step: F) -> Result<Option<EvalReport>, EvalError>
    where
        F: FnMut(&ModelBatch, &NoModelBatch) -> anyhow::Result<ResidualKdLosses>,
    {
        let _guard = tch::no_grad_guard();
        let partition = DistributedPartition::new(self.comm.rank(), self.comm.size());
        let batches = partition.batches(dataset.num_examples(), self.batch_size);

        let progress = if self.comm.is_coordinator() {
            ProgressBar::new(batches.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        progress.set_style(
            ProgressStyle::with_template("LM Evaluation {bar:40} {pos}/{len} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut accumulator = EvalAccumulator::new();
        for (batch_index, indices) in batches.iter().enumerate() {
            self.transition(EvalPhase::Running { batch_index });
            if batch_index % 10 == 0 {
                debug!(
                    rank = self.comm.rank(),
                    batch = batch_index,
                    total = batches.len(),
                    "Evaluating batch"
                );
            }
            let (model_batch, no_model_batch) = dataset.batch(indices)?;
            let losses = step(&model_batch, &no_model_batch)?;
            accumulator.push(&losses)?;
            progress.inc(1);
        }
        progress.finish_and_clear();

        self.transition(EvalPhase::Reducing);
        let report = accumulator.reduce(self.comm)?;

        let written = if self.comm.is_coordinator() {
            self.publish(&report)
        } else {
            Ok(())
        };
        self.transition(EvalPhase::Reported);

        // peers wait here even when the coordinator failed to write
        self.comm.barrier();
        self.transition(EvalPhase::Idle);
        written?;
        let report = self.comm.is_coordinator().then_some(report);
        Ok(report)
    }
}
