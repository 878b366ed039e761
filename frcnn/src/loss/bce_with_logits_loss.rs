use crate::common::*;

#[derive(Debug)]
pub struct BceWithLogitsLossInit {
    pub weight: Option<Tensor>,
    pub pos_weight: Option<Tensor>,
    pub reduction: Reduction,
}

impl BceWithLogitsLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            weight: None,
            pos_weight: None,
            reduction,
        }
    }

    pub fn build(self) -> BceWithLogitsLoss {
        let Self {
            weight,
            pos_weight,
            reduction,
        } = self;

        BceWithLogitsLoss {
            weight,
            pos_weight,
            reduction,
        }
    }
}

/// Binary cross entropy on logits, used for anchor objectness.
#[derive(Debug)]
pub struct BceWithLogitsLoss {
    weight: Option<Tensor>,
    pos_weight: Option<Tensor>,
    reduction: Reduction,
}

impl BceWithLogitsLoss {
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target tensors must have equal shape, but get {:?} and {:?}",
            input.size(),
            target.size()
        );
        input.ensure_same_device(target)?;

        // empty input yields a zero loss
        if input.is_empty() {
            return Ok(Tensor::zeros([], (Kind::Float, input.device())));
        }
        ensure!(
            target.ge(0.0).logical_and(&target.le(1.0)).all().int64_value(&[]) == 1,
            "target values must be in range of [0.0, 1.0]"
        );

        Ok(input.binary_cross_entropy_with_logits(
            &target.to_kind(input.kind()),
            self.weight.as_ref(),
            self.pos_weight.as_ref(),
            self.reduction,
        ))
    }
}
