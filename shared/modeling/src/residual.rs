use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};
use thiserror::Error;
use tracing::trace;

use crate::loss::{expect_shape, lm_loss, logits_dims, masked_divergence, masked_entropy, LossError};

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("kd_ratio must be within [0, 1], got {0}")]
    InvalidKdRatio(f64),

    #[error("{name} must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },

    #[error(transparent)]
    Loss(#[from] LossError),
}

/// Mixing weights for the residual distillation objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualKdConfig {
    /// Weight on the base logits in `L + rsd_mix_ratio * Lb`.
    pub rsd_mix_ratio: f64,
    /// Blend between LM loss (0) and KD loss (1).
    pub kd_ratio: f64,
    /// Weight of the explicit residual term. `None` disables it.
    pub kd_rsd_loss: Option<f64>,
}

impl Default for ResidualKdConfig {
    fn default() -> Self {
        Self {
            rsd_mix_ratio: 0.0,
            kd_ratio: 0.5,
            kd_rsd_loss: None,
        }
    }
}

impl ResidualKdConfig {
    pub fn validate(&self) -> Result<(), ComposerError> {
        for (name, value) in [
            ("rsd_mix_ratio", Some(self.rsd_mix_ratio)),
            ("kd_ratio", Some(self.kd_ratio)),
            ("kd_rsd_loss", self.kd_rsd_loss),
        ] {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(ComposerError::NonFinite { name, value });
                }
            }
        }
        if !(0.0..=1.0).contains(&self.kd_ratio) {
            return Err(ComposerError::InvalidKdRatio(self.kd_ratio));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReduction {
    /// Average every quantity over the batch; used for the training step.
    Mean,
    /// Keep `[B]` vectors; used by evaluation to accumulate exactly.
    PerExample,
}

/// The three logit tensors of one step, all `[B, S, V]`.
#[derive(Debug, Clone, Copy)]
pub struct ResidualLogits<'a> {
    /// Trainable residual model.
    pub logits: &'a Tensor,
    pub base_logits: &'a Tensor,
    pub teacher_logits: &'a Tensor,
}

/// Output of [`ResidualKdComposer::compose`]. Each tensor is a scalar under
/// [`LossReduction::Mean`] and a `[B]` vector under [`LossReduction::PerExample`].
#[derive(Debug)]
pub struct ResidualKdLosses {
    pub loss: Tensor,
    pub lm_loss: Tensor,
    pub kd_loss: Tensor,
    pub kd_entropy: Tensor,
    /// Present when the residual term is configured or all losses were requested.
    pub residual_real_loss: Option<Tensor>,
    pub residual_entropy: Option<Tensor>,
    /// Present only when all losses were requested.
    pub teacher_loss: Option<Tensor>,
    pub base_loss: Option<Tensor>,
    pub residual_loss: Option<Tensor>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResidualKdComposer {
    config: ResidualKdConfig,
}

impl ResidualKdComposer {
    pub fn new(config: ResidualKdConfig) -> Result<Self, ComposerError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ResidualKdConfig {
        &self.config
    }

    /// Combines trainable, base and teacher logits into the distillation objective.
    ///
    /// With `output_all_losses` the LM losses of teacher, base and the raw residual logits
    /// are added, and the residual metrics are computed even when the residual term is
    /// not part of the loss.
    pub fn compose(
        &self,
        logits: ResidualLogits<'_>,
        label: &Tensor,
        loss_mask: &Tensor,
        reduction: LossReduction,
        output_all_losses: bool,
    ) -> Result<ResidualKdLosses, ComposerError> {
        let ResidualLogits {
            logits,
            base_logits,
            teacher_logits,
        } = logits;
        let [b, s, v] = logits_dims("logits", logits)?;
        expect_shape("base_logits", base_logits, &[b, s, v])?;
        expect_shape("teacher_logits", teacher_logits, &[b, s, v])?;
        expect_shape("label", label, &[b, s])?;
        expect_shape("loss_mask", loss_mask, &[b, s])?;

        let config = &self.config;
        let total_logits = logits + base_logits * config.rsd_mix_ratio;

        let lm = lm_loss(&total_logits, label, loss_mask)?;
        let kd = masked_divergence(&total_logits, teacher_logits, loss_mask)?;
        let kd_entropy = masked_entropy(teacher_logits, loss_mask)?;

        let residual = if config.kd_rsd_loss.is_some() || output_all_losses {
            let residual_truth = teacher_logits - base_logits;
            Some((
                masked_divergence(logits, &residual_truth, loss_mask)?,
                masked_entropy(&residual_truth, loss_mask)?,
            ))
        } else {
            None
        };

        let mut loss = &lm * (1.0 - config.kd_ratio) + &kd * config.kd_ratio;
        if let (Some(weight), Some((residual_real, _))) = (config.kd_rsd_loss, &residual) {
            loss = loss + residual_real * weight;
        }

        let (teacher_loss, base_loss, residual_loss) = if output_all_losses {
            (
                Some(lm_loss(teacher_logits, label, loss_mask)?),
                Some(lm_loss(base_logits, label, loss_mask)?),
                Some(lm_loss(logits, label, loss_mask)?),
            )
        } else {
            (None, None, None)
        };
        let (residual_real_loss, residual_entropy) = match residual {
            Some((real, entropy)) => (Some(real), Some(entropy)),
            None => (None, None),
        };

        trace!(
            batch = b,
            seq = s,
            vocab = v,
            residual = residual_real_loss.is_some(),
            output_all_losses,
            "Composed residual KD losses"
        );

        let reduce = |t: Tensor| match reduction {
            LossReduction::Mean => t.mean(Kind::Float),
            LossReduction::PerExample => t,
        };
        Ok(ResidualKdLosses {
            loss: reduce(loss),
            lm_loss: reduce(lm),
            kd_loss: reduce(kd),
            kd_entropy: reduce(kd_entropy),
            residual_real_loss: residual_real_loss.map(reduce),
            residual_entropy: residual_entropy.map(reduce),
            teacher_loss: teacher_loss.map(reduce),
            base_loss: base_loss.map(reduce),
            residual_loss: residual_loss.map(reduce),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::tests::{reference_divergence, reference_nll, rows, tensor3, to_vec};
    use tch::Device;

    const B: usize = 2;
    const S: usize = 3;
    const V: usize = 4;

    #[rustfmt::skip]
    const L: [f32; 24] = [
        0.2, -0.1, 0.5, 0.0,   1.0, 0.3, -0.4, 0.1,   0.0, 0.0, 0.7, -0.2,
        -0.3, 0.4, 0.1, 0.6,   0.5, -0.5, 0.2, 0.0,   0.9, 0.1, -0.6, 0.3,
    ];
    #[rustfmt::skip]
    const LB: [f32; 24] = [
        1.0, 0.5, -0.5, 0.0,   0.2, 0.8, 0.1, -0.3,   -1.0, 0.4, 0.6, 0.2,
        0.3, 0.0, 0.9, -0.4,   0.7, 0.1, -0.2, 0.5,   0.0, -0.8, 0.4, 1.1,
    ];
    #[rustfmt::skip]
    const LT: [f32; 24] = [
        1.5, 0.2, 0.0, -0.5,   0.4, 1.2, -0.1, 0.0,   -0.7, 0.9, 1.1, 0.0,
        0.2, 0.3, 1.4, -0.2,   1.0, 0.0, 0.1, 0.8,   0.5, -0.4, 0.0, 1.6,
    ];
    const LABEL: [i64; 6] = [0, 1, 3, 2, 3, 3];
    const MASK: [f32; 6] = [1.0, 1.0, 0.0, 1.0, 1.0, 1.0];

    struct Inputs {
        logits: Tensor,
        base: Tensor,
        teacher: Tensor,
        label: Tensor,
        mask: Tensor,
    }

    fn inputs() -> Inputs {
        Inputs {
            logits: tensor3(&L, [2, 3, 4]),
            base: tensor3(&LB, [2, 3, 4]),
            teacher: tensor3(&LT, [2, 3, 4]),
            label: Tensor::from_slice(&LABEL).reshape([2, 3]),
            mask: Tensor::from_slice(&MASK).reshape([2, 3]),
        }
    }

    fn compose(
        config: ResidualKdConfig,
        inputs: &Inputs,
        reduction: LossReduction,
        output_all_losses: bool,
    ) -> ResidualKdLosses {
        ResidualKdComposer::new(config)
            .unwrap()
            .compose(
                ResidualLogits {
                    logits: &inputs.logits,
                    base_logits: &inputs.base,
                    teacher_logits: &inputs.teacher,
                },
                &inputs.label,
                &inputs.mask,
                reduction,
                output_all_losses,
            )
            .unwrap()
    }

    fn scalar(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    fn assert_close(got: f64, expected: f64, what: &str) {
        assert!(
            (got - expected).abs() < 1e-5,
            "{what}: got {got}, expected {expected}"
        );
    }

    fn mixed(mix: f64) -> Vec<f32> {
        L.iter()
            .zip(LB.iter())
            .map(|(l, b)| (*l as f64 + mix * *b as f64) as f32)
            .collect()
    }

    fn mask_row(b: usize) -> Vec<f64> {
        MASK[b * S..(b + 1) * S].iter().map(|m| *m as f64).collect()
    }

    fn label_row(b: usize) -> Vec<usize> {
        LABEL[b * S..(b + 1) * S].iter().map(|y| *y as usize).collect()
    }

    #[test]
    fn test_hand_computed_lm_and_kd() {
        let config = ResidualKdConfig {
            rsd_mix_ratio: 0.5,
            kd_ratio: 0.5,
            kd_rsd_loss: None,
        };
        let out = compose(config, &inputs(), LossReduction::PerExample, false);

        let combined = rows(&mixed(0.5), S, V);
        let teacher = rows(&LT, S, V);
        let lm = to_vec(&out.lm_loss);
        let kd = to_vec(&out.kd_loss);
        let entropy = to_vec(&out.kd_entropy);
        let loss = to_vec(&out.loss);
        for b in 0..B {
            let expected_lm = reference_nll(&combined[b], &label_row(b), &mask_row(b));
            let expected_kd = reference_divergence(&combined[b], &teacher[b], &mask_row(b));
            let expected_entropy = reference_divergence(&teacher[b], &teacher[b], &mask_row(b));
            assert_close(lm[b] as f64, expected_lm, "lm_loss");
            assert_close(kd[b] as f64, expected_kd, "kd_loss");
            assert_close(entropy[b] as f64, expected_entropy, "kd_entropy");
            assert_close(
                loss[b] as f64,
                0.5 * expected_lm + 0.5 * expected_kd,
                "loss",
            );
        }
        assert!(out.residual_real_loss.is_none());
        assert!(out.teacher_loss.is_none());
    }

    #[test]
    fn test_infinite_student_entry_keeps_kd_finite() {
        let config = ResidualKdConfig {
            rsd_mix_ratio: 0.5,
            kd_ratio: 0.5,
            kd_rsd_loss: None,
        };
        let mut poisoned = L;
        poisoned[5] = f32::INFINITY;
        let mut inputs = inputs();
        inputs.logits = tensor3(&poisoned, [2, 3, 4]);
        let out = compose(config, &inputs, LossReduction::PerExample, false);
        let kd = to_vec(&out.kd_loss);
        assert!(kd.iter().all(|x| x.is_finite()), "{kd:?}");

        // the infinite entry is dropped from example 0, position 1
        let mut combined = rows(&mixed(0.5), S, V);
        combined[0][1][1] = f64::NEG_INFINITY;
        let teacher = rows(&LT, S, V);
        let mut expected = 0.0;
        for (s, m) in mask_row(0).iter().enumerate() {
            let max = teacher[0][s].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let z: f64 = teacher[0][s].iter().map(|x| (x - max).exp()).sum();
            let lmax = combined[0][s].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let lz: f64 = combined[0][s].iter().map(|x| (x - lmax).exp()).sum();
            for v in 0..V {
                if combined[0][s][v].is_infinite() {
                    continue;
                }
                let p = (teacher[0][s][v] - max).exp() / z;
                let logq = combined[0][s][v] - lmax - lz.ln();
                expected -= m * p * logq;
            }
        }
        expected /= mask_row(0).iter().sum::<f64>();
        assert_close(kd[0] as f64, expected, "kd_loss with +inf");
    }

    #[test]
    fn test_kd_ratio_zero_is_plain_lm_loss() {
        let config = ResidualKdConfig {
            rsd_mix_ratio: 0.3,
            kd_ratio: 0.0,
            kd_rsd_loss: None,
        };
        let base = inputs();
        let out = compose(config, &base, LossReduction::Mean, false);

        let mut other_teacher = inputs();
        other_teacher.teacher = Tensor::randn([2, 3, 4], (Kind::Float, Device::Cpu)) * 5.0;
        let out_other = compose(config, &other_teacher, LossReduction::Mean, false);

        let combined = &base.logits + &base.base * 0.3;
        let expected = lm_loss(&combined, &base.label, &base.mask)
            .unwrap()
            .mean(Kind::Float);
        assert_close(scalar(&out.loss), scalar(&expected), "loss");
        assert_close(scalar(&out_other.loss), scalar(&expected), "loss with other teacher");
    }

    #[test]
    fn test_kd_ratio_one_is_divergence() {
        let config = ResidualKdConfig {
            rsd_mix_ratio: 0.5,
            kd_ratio: 1.0,
            kd_rsd_loss: None,
        };
        let inputs = inputs();
        let out = compose(config, &inputs, LossReduction::PerExample, false);
        let combined = &inputs.logits + &inputs.base * 0.5;
        let expected = masked_divergence(&combined, &inputs.teacher, &inputs.mask).unwrap();
        for (got, want) in to_vec(&out.loss).iter().zip(to_vec(&expected)) {
            assert_close(*got as f64, want as f64, "loss");
        }
    }

    #[test]
    fn test_residual_term_is_added() {
        let config = ResidualKdConfig {
            rsd_mix_ratio: 0.5,
            kd_ratio: 0.25,
            kd_rsd_loss: Some(1.0),
        };
        let inputs = inputs();
        let out = compose(config, &inputs, LossReduction::Mean, false);
        let residual_real = out.residual_real_loss.as_ref().unwrap();
        assert!(out.residual_entropy.is_some());
        assert_close(
            scalar(&out.loss),
            0.75 * scalar(&out.lm_loss) + 0.25 * scalar(&out.kd_loss) + scalar(residual_real),
            "loss",
        );

        let truth = &inputs.teacher - &inputs.base;
        let expected = masked_divergence(&inputs.logits, &truth, &inputs.mask)
            .unwrap()
            .mean(Kind::Float);
        assert_close(scalar(residual_real), scalar(&expected), "residual_real_loss");
    }

    #[test]
    fn test_output_all_losses() {
        let config = ResidualKdConfig {
            rsd_mix_ratio: 1.0,
            kd_ratio: 0.5,
            kd_rsd_loss: None,
        };
        let inputs = inputs();
        let plain = compose(config, &inputs, LossReduction::PerExample, false);
        let all = compose(config, &inputs, LossReduction::PerExample, true);

        // residual metrics are reported but not added to the loss
        assert_eq!(to_vec(&plain.loss), to_vec(&all.loss));
        for t in [
            &all.residual_real_loss,
            &all.residual_entropy,
            &all.teacher_loss,
            &all.base_loss,
            &all.residual_loss,
        ] {
            assert_eq!(t.as_ref().unwrap().size(), vec![2]);
        }

        let teacher_lm = lm_loss(&inputs.teacher, &inputs.label, &inputs.mask).unwrap();
        assert_eq!(to_vec(all.teacher_loss.as_ref().unwrap()), to_vec(&teacher_lm));
        let raw_lm = lm_loss(&inputs.logits, &inputs.label, &inputs.mask).unwrap();
        assert_eq!(to_vec(all.residual_loss.as_ref().unwrap()), to_vec(&raw_lm));
    }

    #[test]
    fn test_invalid_config() {
        let config = ResidualKdConfig {
            kd_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            ResidualKdComposer::new(config),
            Err(ComposerError::InvalidKdRatio(_))
        ));
        let config = ResidualKdConfig {
            kd_rsd_loss: Some(f64::NAN),
            ..Default::default()
        };
        assert!(matches!(
            ResidualKdComposer::new(config),
            Err(ComposerError::NonFinite {
                name: "kd_rsd_loss",
                ..
            })
        ));
    }

    #[test]
    fn test_mismatched_model_logits() {
        let mut inputs = inputs();
        inputs.base = Tensor::zeros([2, 3, 5], (Kind::Float, Device::Cpu));
        let err = ResidualKdComposer::new(ResidualKdConfig::default())
            .unwrap()
            .compose(
                ResidualLogits {
                    logits: &inputs.logits,
                    base_logits: &inputs.base,
                    teacher_logits: &inputs.teacher,
                },
                &inputs.label,
                &inputs.mask,
                LossReduction::Mean,
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Loss(LossError::ShapeMismatch {
                name: "base_logits",
                ..
            })
        ));
    }
}
