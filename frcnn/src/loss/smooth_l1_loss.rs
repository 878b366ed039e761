use crate::common::*;

/// Huber-like loss, quadratic below `beta` and linear above.
///
/// A `beta` below `1e-5` degenerates to plain L1.
#[derive(Debug)]
pub struct SmoothL1Loss {
    beta: f64,
    reduction: Reduction,
}

impl SmoothL1Loss {
    pub fn new(beta: f64, reduction: Reduction) -> Self {
        Self { beta, reduction }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target tensors must have equal shape, but get {:?} and {:?}",
            input.size(),
            target.size()
        );
        input.ensure_same_device(target)?;

        if input.is_empty() && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros([], (Kind::Float, input.device())));
        }

        let diff = (input - target).abs();
        let loss = if self.beta < 1e-5 {
            diff
        } else {
            let quadratic = diff.square() * (0.5 / self.beta);
            let linear = &diff - 0.5 * self.beta;
            quadratic.where_self(&diff.lt(self.beta), &linear)
        };

        let loss = match self.reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.mean(Kind::Float),
            Reduction::Other(_) => bail!("unsupported reduction"),
        };
        Ok(loss)
    }
}
