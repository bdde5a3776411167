use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tch::{nn, Tensor};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    checkpoint_dir, frozen_forward, reduce_for_logging, BaseModelRecord, CheckpointError,
    Communicator, CommunicatorError, ComposerError, EvalDataset, EvalError, EvalReport,
    Evaluator, LossError, LossReduction, ModelBatch, NoModelBatch, ReduceType,
    ResidualKdComposer, ResidualKdConfig, ResidualKdLosses, ResidualLogits, Scorer, ScorerError,
    ScorerRole, TrainStepMetrics,
};

/// File name of the trainable weights inside a checkpoint directory.
pub const MODEL_FILE_NAME: &str = "model.safetensors";

#[derive(Debug, Error)]
pub enum TrainerSetupError {
    #[error("no {0} model was provided")]
    MissingModel(&'static str),

    #[error("{which} model must be {expected:?}, got {actual:?}")]
    WrongRole {
        which: &'static str,
        expected: ScorerRole,
        actual: ScorerRole,
    },

    #[error("base_model_path is required to record which base a checkpoint belongs to")]
    MissingBasePath,

    #[error("eval batch size must be positive")]
    ZeroEvalBatchSize,

    #[error(transparent)]
    Config(#[from] ComposerError),
}

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Scorer(#[from] ScorerError),

    #[error(transparent)]
    Loss(#[from] LossError),

    #[error(transparent)]
    Composer(#[from] ComposerError),

    #[error(transparent)]
    Communicator(#[from] CommunicatorError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Trains a residual model on top of a frozen base by distilling from a frozen teacher.
///
/// The student's effective logits are `logits + rsd_mix_ratio * base_logits`; only the
/// residual model receives gradients.
pub struct ResidualKdTrainer {
    model: Box<dyn Scorer>,
    base: Box<dyn Scorer>,
    teacher: Box<dyn Scorer>,
    composer: ResidualKdComposer,
    comm: Arc<Communicator>,
    eval_batch_size: usize,
    log_file: PathBuf,
    base_record: BaseModelRecord,
}

#[derive(Default)]
pub struct ResidualKdTrainerBuilder {
    model: Option<Box<dyn Scorer>>,
    base: Option<Box<dyn Scorer>>,
    teacher: Option<Box<dyn Scorer>>,
    config: ResidualKdConfig,
    comm: Option<Arc<Communicator>>,
    eval_batch_size: Option<usize>,
    log_file: Option<PathBuf>,
    base_model_path: Option<String>,
    base_path: String,
    base_ckpt_name: Option<String>,
}

impl ResidualKdTrainerBuilder {
    pub fn model(mut self, model: Box<dyn Scorer>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn base(mut self, base: Box<dyn Scorer>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn teacher(mut self, teacher: Box<dyn Scorer>) -> Self {
        self.teacher = Some(teacher);
        self
    }

    pub fn config(mut self, config: ResidualKdConfig) -> Self {
        self.config = config;
        self
    }

    pub fn communicator(mut self, comm: Arc<Communicator>) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn eval_batch_size(mut self, eval_batch_size: usize) -> Self {
        self.eval_batch_size = Some(eval_batch_size);
        self
    }

    /// Evaluation reports are appended to this file on the coordinator.
    pub fn log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn base_model_path(mut self, path: impl Into<String>) -> Self {
        self.base_model_path = Some(path.into());
        self
    }

    /// Shared model root stripped from `base_model_path` in the checkpoint record.
    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into();
        self
    }

    pub fn base_ckpt_name(mut self, name: Option<String>) -> Self {
        self.base_ckpt_name = name;
        self
    }

    pub fn build(self) -> Result<ResidualKdTrainer, TrainerSetupError> {
        let model = expect_role(self.model, "trainable", ScorerRole::Trainable)?;
        let mut base = expect_role(self.base, "base", ScorerRole::Frozen)?;
        let mut teacher = expect_role(self.teacher, "teacher", ScorerRole::Frozen)?;
        let base_model_path = self
            .base_model_path
            .ok_or(TrainerSetupError::MissingBasePath)?;
        let eval_batch_size = self.eval_batch_size.unwrap_or(8);
        if eval_batch_size == 0 {
            return Err(TrainerSetupError::ZeroEvalBatchSize);
        }
        let composer = ResidualKdComposer::new(self.config)?;

        base.set_train(false);
        teacher.set_train(false);

        let log_file = self.log_file.unwrap_or_else(|| PathBuf::from("log.txt"));
        let base_record =
            BaseModelRecord::new(&base_model_path, &self.base_path, self.base_ckpt_name);
        let comm = self.comm.unwrap_or_else(|| Arc::new(Communicator::none()));

        info!(
            rank = comm.rank(),
            world_size = comm.size(),
            rsd_mix_ratio = composer.config().rsd_mix_ratio,
            kd_ratio = composer.config().kd_ratio,
            kd_rsd_loss = ?composer.config().kd_rsd_loss,
            base_model = %base_record.base_model_path,
            "Residual KD trainer ready"
        );

        Ok(ResidualKdTrainer {
            model,
            base,
            teacher,
            composer,
            comm,
            eval_batch_size,
            log_file,
            base_record,
        })
    }
}

fn expect_role(
    scorer: Option<Box<dyn Scorer>>,
    which: &'static str,
    expected: ScorerRole,
) -> Result<Box<dyn Scorer>, TrainerSetupError> {
    let scorer = scorer.ok_or(TrainerSetupError::MissingModel(which))?;
    let actual = scorer.role();
    if actual != expected {
        return Err(TrainerSetupError::WrongRole {
            which,
            expected,
            actual,
        });
    }
    Ok(scorer)
}

impl ResidualKdTrainer {
    pub fn builder() -> ResidualKdTrainerBuilder {
        ResidualKdTrainerBuilder::default()
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn config(&self) -> &ResidualKdConfig {
        self.composer.config()
    }

    pub fn model(&self) -> &dyn Scorer {
        self.model.as_ref()
    }

    /// Forward passes for all three models and the composed losses.
    ///
    /// Base and teacher run under a no-grad guard and are moved to the trainable model's
    /// device.
    pub fn compute_losses(
        &self,
        model_batch: &ModelBatch,
        no_model_batch: &NoModelBatch,
        reduction: LossReduction,
        output_all_losses: bool,
    ) -> Result<ResidualKdLosses, TrainerError> {
        let logits = self.model.score(model_batch)?;
        no_model_batch.validate(&logits)?;
        let device = logits.device();
        let base_logits = frozen_forward(self.base.as_ref(), model_batch)?.to_device(device);
        let teacher_logits =
            frozen_forward(self.teacher.as_ref(), model_batch)?.to_device(device);

        Ok(self.composer.compose(
            ResidualLogits {
                logits: &logits,
                base_logits: &base_logits,
                teacher_logits: &teacher_logits,
            },
            &no_model_batch.label,
            &no_model_batch.loss_mask,
            reduction,
            output_all_losses,
        )?)
    }

    /// The local scalar loss to backpropagate, plus display metrics averaged over the group.
    ///
    /// Collective: every replica must call this once per step.
    pub fn compute_loss(
        &self,
        model_batch: &ModelBatch,
        no_model_batch: &NoModelBatch,
    ) -> Result<(Tensor, TrainStepMetrics), TrainerError> {
        let losses =
            self.compute_losses(model_batch, no_model_batch, LossReduction::Mean, false)?;
        let metrics = reduce_for_logging(&self.comm, &losses)?;
        Ok((losses.loss, metrics))
    }

    /// Replaces every trainable gradient with its mean over the group.
    fn average_gradients(&self) -> Result<(), CommunicatorError> {
        if self.comm.size() == 1 {
            return Ok(());
        }
        let _guard = tch::no_grad_guard();
        let size = self.comm.size() as f64;
        for variable in self.model.trainable_variables() {
            let mut grad = variable.grad();
            if !grad.defined() {
                continue;
            }
            self.comm.all_reduce(&mut grad, ReduceType::Sum)?;
            let mean = &grad / size;
            grad.copy_(&mean);
        }
        Ok(())
    }

    /// One optimizer step: loss, backward, gradient averaging across replicas, update.
    ///
    /// Returns this replica's loss with the group-averaged metrics. Gradients are left in
    /// place for inspection until the next step.
    pub fn train_step(
        &mut self,
        optimizer: &mut nn::Optimizer,
        model_batch: &ModelBatch,
        no_model_batch: &NoModelBatch,
    ) -> Result<(f64, TrainStepMetrics), TrainerError> {
        optimizer.zero_grad();
        let (loss, metrics) = self.compute_loss(model_batch, no_model_batch)?;
        loss.backward();
        self.average_gradients()?;
        optimizer.step();
        let loss = loss.double_value(&[]);
        debug!(
            rank = self.comm.rank(),
            loss,
            lm_loss = metrics.lm_loss,
            kd_loss = metrics.kd_loss,
            "Train step"
        );
        Ok((loss, metrics))
    }

    /// Evaluates on `dataset` with all nine metrics and returns the report on the
    /// coordinator. The trainable model is put back into training mode afterwards, also
    /// when evaluation fails.
    pub fn evaluate(
        &mut self,
        dataset: &dyn EvalDataset,
    ) -> Result<Option<EvalReport>, TrainerError> {
        self.model.set_train(false);
        let result = {
            let this = &*self;
            Evaluator::new(&this.comm, this.eval_batch_size)
                .with_log_file(&this.log_file)
                .run(dataset, |model_batch, no_model_batch| {
                    Ok(this.compute_losses(
                        model_batch,
                        no_model_batch,
                        LossReduction::PerExample,
                        true,
                    )?)
                })
        };
        self.model.set_train(true);
        Ok(result?)
    }

    /// Saves the trainable weights and `base_model.json` into `<dir>/<global_steps>` on the
    /// coordinator, then waits for the whole group.
    pub fn save(&self, dir: &Path, global_steps: u64) -> Result<PathBuf, TrainerError> {
        let dir = checkpoint_dir(dir, global_steps);
        let written = if self.comm.is_coordinator() {
            self.write_checkpoint(&dir)
        } else {
            Ok(())
        };
        self.comm.barrier();
        written?;
        Ok(dir)
    }

    fn write_checkpoint(&self, dir: &Path) -> Result<(), TrainerError> {
        let record = self.base_record.write(dir)?;
        self.model.save(&dir.join(MODEL_FILE_NAME))?;
        info!(
            dir = %dir.display(),
            record = %record.display(),
            base_model = %self.base_record.base_model_path,
            "Saved checkpoint"
        );
        Ok(())
    }
}
