use crate::common::*;

/// Softmax cross entropy over `[N, K]` logits and `[N]` class ids.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (batch_size, num_classes) = input.size2()?;
        input.ensure_same_device(target)?;
        ensure!(
            target.kind() == Kind::Int64 && target.size1()? == batch_size,
            "expect target a [{}] int64 tensor",
            batch_size
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if batch_size == 0 && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros([], (Kind::Float, input.device())));
        }
        ensure!(
            target.ge(0).logical_and(&target.lt(num_classes)).all().int64_value(&[]) == 1,
            "target values must be in range of [0, {})",
            num_classes
        );

        let loss = -input
            .log_softmax(1, Kind::Float)
            .gather(1, &target.unsqueeze(1), false)
            .squeeze_dim(1);

        let loss = match self.reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.mean(Kind::Float),
            Reduction::Other(_) => bail!("unsupported reduction"),
        };
        Ok(loss)
    }
}
