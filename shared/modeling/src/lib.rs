mod batch;
mod checkpoint;
mod device_utils;
mod evaluator;
mod loss;
pub mod metrics;
mod parallelism;
mod reduction;
mod residual;
mod scorer;
mod trainer;

pub use batch::{batches_from_collated, move_to_device, ModelBatch, NoModelBatch};
pub use checkpoint::{checkpoint_dir, BaseModelRecord, CheckpointError};
pub use device_utils::{get_optimal_devices, Devices, DevicesParseError};
pub use evaluator::{
    EvalAccumulator, EvalDataset, EvalError, EvalMetric, EvalPhase, EvalReport, Evaluator,
    TokenEvalDataset,
};
pub use loss::{lm_loss, masked_divergence, masked_entropy, LossError};
pub use parallelism::{Communicator, CommunicatorError, LocalCommunicator, LocalGroup, ReduceType};
pub use reduction::{average_across_replicas, dataset_mean, reduce_for_logging, TrainStepMetrics};
pub use residual::{
    ComposerError, LossReduction, ResidualKdComposer, ResidualKdConfig, ResidualKdLosses,
    ResidualLogits,
};
pub use scorer::{
    frozen_forward, Scorer, ScorerError, ScorerRole, TorchScriptScorer,
    TrainableTorchScriptScorer,
};
pub use trainer::{
    ResidualKdTrainer, ResidualKdTrainerBuilder, TrainerError, TrainerSetupError,
    MODEL_FILE_NAME,
};

/// Seeds torch's global generator and logs the seed, so dropout and initialization are
/// reproducible across runs.
pub fn set_torch_rng_seed(seed: i64) {
    tch::manual_seed(seed);
    tracing::info!(seed, "torch seed set");
}
