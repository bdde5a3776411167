use rkd_data_provider::CollatedBatch;
use tch::{Device, Kind, Tensor};

use crate::loss::{expect_shape, logits_dims, LossError};

/// Inputs to a forward pass.
#[derive(Debug)]
pub struct ModelBatch {
    /// `[B, S]` int64
    pub input_ids: Tensor,
    /// `[B, S]` int64, 1 on real tokens
    pub attention_mask: Tensor,
    pub position_ids: Option<Tensor>,
}

/// Targets aligned with the logits of a [`ModelBatch`].
#[derive(Debug)]
pub struct NoModelBatch {
    /// `[B, S]` int64
    pub label: Tensor,
    /// `[B, S]` float32 in {0, 1}
    pub loss_mask: Tensor,
}

fn rows_to_tensor<T: tch::kind::Element + Copy>(rows: &[Vec<T>]) -> Tensor {
    let width = rows.first().map(|r| r.len()).unwrap_or(0) as i64;
    let flat: Vec<T> = rows.iter().flatten().copied().collect();
    Tensor::from_slice(&flat).view([rows.len() as i64, width])
}

impl ModelBatch {
    pub fn batch_size(&self) -> i64 {
        self.input_ids.size()[0]
    }

    pub fn seq_len(&self) -> i64 {
        self.input_ids.size()[1]
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            input_ids: self.input_ids.to_device(device),
            attention_mask: self.attention_mask.to_device(device),
            position_ids: self.position_ids.as_ref().map(|p| p.to_device(device)),
        }
    }
}

impl NoModelBatch {
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            label: self.label.to_device(device),
            loss_mask: self.loss_mask.to_device(device),
        }
    }

    /// Checks that `logits` is `[B, S, V]` for this batch's `[B, S]`.
    pub fn validate(&self, logits: &Tensor) -> Result<(), LossError> {
        let [b, s, _] = logits_dims("logits", logits)?;
        expect_shape("label", &self.label, &[b, s])?;
        expect_shape("loss_mask", &self.loss_mask, &[b, s])
    }
}

/// Splits a collated CPU batch into forward inputs and targets.
pub fn batches_from_collated(batch: &CollatedBatch) -> (ModelBatch, NoModelBatch) {
    let model_batch = ModelBatch {
        input_ids: rows_to_tensor(&batch.input_ids),
        attention_mask: rows_to_tensor(&batch.attention_mask),
        position_ids: None,
    };
    let no_model_batch = NoModelBatch {
        label: rows_to_tensor(&batch.label),
        loss_mask: rows_to_tensor(&batch.loss_mask).to_kind(Kind::Float),
    };
    (model_batch, no_model_batch)
}

/// Moves both halves of a batch to `device`.
pub fn move_to_device(
    model_batch: &ModelBatch,
    no_model_batch: &NoModelBatch,
    device: Device,
) -> (ModelBatch, NoModelBatch) {
    (
        model_batch.to_device(device),
        no_model_batch.to_device(device),
    )
}
