use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tch::{Kind, Tensor};

use crate::{Communicator, CommunicatorError, ReduceType, ResidualKdLosses};

/// Training-step metrics for display, each averaged across the replica group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStepMetrics {
    #[serde(with = "crate::metrics::nan_as_null")]
    pub lm_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub kd_loss: f64,
    #[serde(with = "crate::metrics::nan_as_null")]
    pub kd_entropy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_real_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_entropy: Option<f64>,
}

impl TrainStepMetrics {
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::from([
            ("lm_loss".to_string(), self.lm_loss),
            ("kd_loss".to_string(), self.kd_loss),
            ("kd_entropy".to_string(), self.kd_entropy),
        ]);
        if let Some(value) = self.residual_real_loss {
            map.insert("residual_real_loss".to_string(), value);
        }
        if let Some(value) = self.residual_entropy {
            map.insert("residual_entropy".to_string(), value);
        }
        map
    }
}

/// Sum of a scalar across the group divided by the world size.
///
/// Works on a detached copy, so the caller's tensor and its graph are untouched.
pub fn average_across_replicas(comm: &Communicator, value: &Tensor) -> Result<f64, CommunicatorError> {
    let _guard = tch::no_grad_guard();
    let mut reduced = value.detach().to_kind(Kind::Float).copy();
    comm.all_reduce(&mut reduced, ReduceType::Sum)?;
    Ok(reduced.double_value(&[]) / comm.size() as f64)
}

/// Reduces the display metrics of a mean-reduced training step.
///
/// `loss` itself is left alone: each replica backpropagates its local value. The residual
/// metrics are reduced only when the step produced them, which is decided by shared
/// configuration and therefore identical on every replica.
pub fn reduce_for_logging(
    comm: &Communicator,
    losses: &ResidualKdLosses,
) -> Result<TrainStepMetrics, CommunicatorError> {
    let lm_loss = average_across_replicas(comm, &losses.lm_loss)?;
    let kd_loss = average_across_replicas(comm, &losses.kd_loss)?;
    let kd_entropy = average_across_replicas(comm, &losses.kd_entropy)?;
    let residual_real_loss = losses
        .residual_real_loss
        .as_ref()
        .map(|t| average_across_replicas(comm, t))
        .transpose()?;
    let residual_entropy = losses
        .residual_entropy
        .as_ref()
        .map(|t| average_across_replicas(comm, t))
        .transpose()?;
    Ok(TrainStepMetrics {
        lm_loss,
        kd_loss,
        kd_entropy,
        residual_real_loss,
        residual_entropy,
    })
}

/// Mean over every example held by every replica.
///
/// Each replica contributes its whole per-example vector (lengths may differ), the
/// concatenation is summed in double precision, then divided by the total count. An empty
/// dataset yields NaN.
pub fn dataset_mean(comm: &Communicator, per_example: &Tensor) -> Result<f64, CommunicatorError> {
    let _guard = tch::no_grad_guard();
    let all = comm.all_gather_concat(&per_example.detach().to_kind(Kind::Float))?;
    let count = all.numel();
    let sum = all.to_kind(Kind::Double).sum(Kind::Double).double_value(&[]);
    Ok(sum / count as f64)
}
