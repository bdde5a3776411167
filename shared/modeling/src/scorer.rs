use std::path::Path;
use tch::{nn, CModule, Device, IValue, TchError, Tensor, TrainableCModule};
use thiserror::Error;
use tracing::info;

use crate::ModelBatch;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("model returned {0}, expected logits or a tuple starting with logits")]
    UnexpectedOutput(String),

    #[error(transparent)]
    Torch(#[from] TchError),
}

/// Whether a scorer's parameters are updated during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerRole {
    Trainable,
    Frozen,
}

/// Anything that maps a batch of token ids to `[B, S, V]` logits.
///
/// The trainable, base and teacher models are three instances of this capability that
/// differ only in [`ScorerRole`].
pub trait Scorer: Send {
    fn score(&self, batch: &ModelBatch) -> Result<Tensor, ScorerError>;
    fn role(&self) -> ScorerRole;
    fn device(&self) -> Device;
    /// Toggles dropout and other train-only behavior.
    fn set_train(&mut self, train: bool);
    /// Parameters the optimizer updates. Empty for frozen scorers.
    fn trainable_variables(&self) -> Vec<Tensor> {
        Vec::new()
    }
    /// Persists trainable parameters. Frozen scorers have nothing to save.
    fn save(&self, _path: &Path) -> Result<(), ScorerError> {
        Ok(())
    }
}

/// Runs a forward pass with gradient tracking suspended.
///
/// The guard is dropped on every exit path, so gradient mode is restored even when the
/// forward fails.
pub fn frozen_forward(scorer: &dyn Scorer, batch: &ModelBatch) -> Result<Tensor, ScorerError> {
    let _guard = tch::no_grad_guard();
    scorer.score(batch)
}

fn forward_inputs(batch: &ModelBatch) -> Vec<IValue> {
    let mut inputs = vec![
        IValue::Tensor(batch.input_ids.shallow_clone()),
        IValue::Tensor(batch.attention_mask.shallow_clone()),
    ];
    if let Some(position_ids) = &batch.position_ids {
        inputs.push(IValue::Tensor(position_ids.shallow_clone()));
    }
    inputs
}

fn logits_from_output(output: IValue) -> Result<Tensor, ScorerError> {
    match output {
        IValue::Tensor(logits) => Ok(logits),
        IValue::Tuple(mut items) if !items.is_empty() => match items.swap_remove(0) {
            IValue::Tensor(logits) => Ok(logits),
            other => Err(ScorerError::UnexpectedOutput(format!("tuple of {other:?}"))),
        },
        other => Err(ScorerError::UnexpectedOutput(format!("{other:?}"))),
    }
}

/// A frozen TorchScript model called as `forward(input_ids, attention_mask[, position_ids])`.
pub struct TorchScriptScorer {
    module: CModule,
    device: Device,
}

impl TorchScriptScorer {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self, ScorerError> {
        let path = path.as_ref();
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        info!(path = %path.display(), ?device, "Loaded frozen scorer");
        Ok(Self { module, device })
    }
}

impl Scorer for TorchScriptScorer {
    fn score(&self, batch: &ModelBatch) -> Result<Tensor, ScorerError> {
        logits_from_output(self.module.forward_is(&forward_inputs(batch))?)
    }

    fn role(&self) -> ScorerRole {
        ScorerRole::Frozen
    }

    fn device(&self) -> Device {
        self.device
    }

    /// Frozen scorers stay in eval mode.
    fn set_train(&mut self, _train: bool) {}
}

/// A TorchScript model whose parameters live in a [`nn::VarStore`] for the optimizer.
pub struct TrainableTorchScriptScorer {
    var_store: nn::VarStore,
    module: TrainableCModule,
}

impl TrainableTorchScriptScorer {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self, ScorerError> {
        let path = path.as_ref();
        let var_store = nn::VarStore::new(device);
        let mut module = TrainableCModule::load(path, var_store.root())?;
        module.set_train();
        info!(
            path = %path.display(),
            ?device,
            variables = var_store.variables().len(),
            "Loaded trainable scorer"
        );
        Ok(Self { var_store, module })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }
}

impl Scorer for TrainableTorchScriptScorer {
    fn score(&self, batch: &ModelBatch) -> Result<Tensor, ScorerError> {
        logits_from_output(self.module.forward_is(&forward_inputs(batch))?)
    }

    fn role(&self) -> ScorerRole {
        ScorerRole::Trainable
    }

    fn device(&self) -> Device {
        self.var_store.device()
    }

    fn set_train(&mut self, train: bool) {
        if train {
            self.module.set_train();
        } else {
            self.module.set_eval();
        }
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        self.var_store.trainable_variables()
    }

    fn save(&self, path: &Path) -> Result<(), ScorerError> {
        self.var_store.save(path)?;
        Ok(())
    }
}
