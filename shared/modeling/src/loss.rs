use tch::{Kind, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LossError {
    #[error("shape mismatch: {name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("{name} must be a [batch, seq, vocab] tensor, got shape {actual:?}")]
    NotLogits { name: &'static str, actual: Vec<i64> },
}

pub(crate) fn logits_dims(name: &'static str, logits: &Tensor) -> Result<[i64; 3], LossError> {
    match logits.size().as_slice() {
        &[b, s, v] => Ok([b, s, v]),
        actual => Err(LossError::NotLogits {
            name,
            actual: actual.to_vec(),
        }),
    }
}

pub(crate) fn expect_shape(
    name: &'static str,
    tensor: &Tensor,
    expected: &[i64],
) -> Result<(), LossError> {
    let actual = tensor.size();
    if actual != expected {
        return Err(LossError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual,
        });
    }
    Ok(())
}

/// `Σ_s mask * values / Σ_s mask` per example. A zero mask row yields NaN.
fn masked_mean_over_positions(values: &Tensor, mask: &Tensor) -> Tensor {
    let mask = mask.to_kind(Kind::Float);
    (values * &mask).sum_dim_intlist(-1, false, Kind::Float)
        / mask.sum_dim_intlist(-1, false, Kind::Float)
}

/// Per-example masked divergence between `logits` and `reference_logits`:
///
/// `div[b] = -Σ_s mask[b,s] Σ_v softmax(ref[b,s])[v] * log_softmax(logits[b,s])[v] / Σ_s mask[b,s]`
///
/// Both softmaxes run in float32. Vocabulary entries where `logits` is infinite (either
/// sign) are excluded from the student distribution and their term contributes zero, so a
/// `+inf` sentinel never turns the row into NaN. Examples whose mask sums to zero come out
/// as NaN.
///
/// Returns a `[B]` float32 tensor.
pub fn masked_divergence(
    logits: &Tensor,
    reference_logits: &Tensor,
    mask: &Tensor,
) -> Result<Tensor, LossError> {
    let [b, s, v] = logits_dims("logits", logits)?;
    expect_shape("reference_logits", reference_logits, &[b, s, v])?;
    expect_shape("loss_mask", mask, &[b, s])?;

    let reference_probs = reference_logits.softmax(-1, Kind::Float);
    let inf_mask = logits.isinf();
    let log_probs = logits
        .to_kind(Kind::Float)
        .masked_fill(&inf_mask, f64::NEG_INFINITY)
        .log_softmax(-1, Kind::Float);
    let per_position = (&reference_probs * &log_probs)
        .masked_fill(&inf_mask, 0.0)
        .sum_dim_intlist(-1, false, Kind::Float);

    Ok(-masked_mean_over_positions(&per_position, mask))
}

/// Masked entropy of `softmax(logits)`, i.e. `masked_divergence(logits, logits, mask)`.
///
/// Non-negative for every example with a non-zero mask row.
pub fn masked_entropy(logits: &Tensor, mask: &Tensor) -> Result<Tensor, LossError> {
    masked_divergence(logits, logits, mask)
}

/// Per-example masked negative log-likelihood of `label` under `softmax(logits)`.
///
/// Labels at masked-out positions may hold any value (pad id, `-100`); they are clamped
/// into the vocabulary before the gather and their term is zeroed.
///
/// Returns a `[B]` float32 tensor.
pub fn lm_loss(logits: &Tensor, label: &Tensor, mask: &Tensor) -> Result<Tensor, LossError> {
    let [b, s, v] = logits_dims("logits", logits)?;
    expect_shape("label", label, &[b, s])?;
    expect_shape("loss_mask", mask, &[b, s])?;

    let log_probs = logits.log_softmax(-1, Kind::Float);
    let target = label.to_kind(Kind::Int64).clamp(0, v - 1).unsqueeze(-1);
    let nll = -log_probs.gather(-1, &target, false).squeeze_dim(-1);
    let nll = nll.masked_fill(&mask.eq(0.0), 0.0);

    Ok(masked_mean_over_positions(&nll, mask))
}
