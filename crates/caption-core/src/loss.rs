//! Masked token-level loss and accuracy.
//!
//! Both functions only count positions where `mask` is true, so padding
//! tokens never contribute to the reported figures.

use tch::{Kind, Tensor};

/// Sparse categorical cross-entropy on logits, averaged over unmasked tokens.
///
/// logits: [batch, len, vocab], targets: [batch, len] int64, mask: [batch, len] bool
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    let nll = -log_probs
        .gather(-1, &targets.unsqueeze(-1), false)
        .squeeze_dim(-1);

    let mask = mask.to_kind(Kind::Float);
    (nll * &mask).sum(Kind::Float) / mask.sum(Kind::Float).clamp_min(1.0)
}

/// Fraction of unmasked tokens whose argmax logit equals the target.
pub fn masked_accuracy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Tensor {
    let predictions = logits.argmax(-1, false);
    let correct = predictions
        .eq_tensor(targets)
        .logical_and(mask)
        .to_kind(Kind::Float);

    correct.sum(Kind::Float) / mask.to_kind(Kind::Float).sum(Kind::Float).clamp_min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, IndexOp};

    fn one_hot_logits(targets: &[i64], vocab: i64) -> Tensor {
        let t = Tensor::from_slice(targets).view([1, targets.len() as i64]);
        t.one_hot(vocab).to_kind(Kind::Float) * 20.0
    }

    #[test]
    fn padding_positions_do_not_change_loss() {
        let targets = Tensor::from_slice(&[2i64, 3, 0, 0]).view([1, 4]);
        let mask = targets.ne(0);
        let logits = Tensor::randn([1, 4, 5], (Kind::Float, Device::Cpu));

        let base = masked_cross_entropy(&logits, &targets, &mask).double_value(&[]);

        let garbage = logits.copy();
        let _ = garbage.i((.., 2.., ..)).fill_(100.0);
        let changed = masked_cross_entropy(&garbage, &targets, &mask).double_value(&[]);

        assert!((base - changed).abs() < 1e-6);
    }

    #[test]
    fn confident_correct_predictions_have_low_loss() {
        let targets = Tensor::from_slice(&[1i64, 4, 2]).view([1, 3]);
        let logits = one_hot_logits(&[1, 4, 2], 5);
        let mask = targets.ne(0);
        let loss = masked_cross_entropy(&logits, &targets, &mask).double_value(&[]);
        assert!(loss < 1e-3);
    }

    #[test]
    fn accuracy_ignores_padding() {
        let targets = Tensor::from_slice(&[1i64, 4, 0, 0]).view([1, 4]);
        // Last two predictions are wrong but sit on padding.
        let logits = one_hot_logits(&[1, 3, 2, 2], 5);
        let mask = targets.ne(0);
        let acc = masked_accuracy(&logits, &targets, &mask).double_value(&[]);
        assert!((acc - 0.5).abs() < 1e-6);
    }

    #[test]
    fn fully_masked_batch_is_finite() {
        let targets = Tensor::zeros([1, 3], (Kind::Int64, Device::Cpu));
        let logits = Tensor::randn([1, 3, 4], (Kind::Float, Device::Cpu));
        let mask = targets.ne(0);
        let loss = masked_cross_entropy(&logits, &targets, &mask).double_value(&[]);
        assert_eq!(loss, 0.0);
    }
}
