use crate::common::*;

/// The number of groups used by [NormKind::GroupNorm].
pub const NUM_GROUPS: i64 = 32;

/// Normalization layer choice, resolved when a layer is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    BatchNorm,
    GroupNorm,
    /// Cross-device batch norm. Statistics are computed per device.
    SyncBatchNorm,
}

impl NormKind {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>, channels: i64) -> Result<Norm> {
        let path = path.borrow();
        ensure!(channels > 0, "channels must be positive");

        let norm = match self {
            Self::BatchNorm | Self::SyncBatchNorm => {
                Norm::BatchNorm(nn::batch_norm2d(path, channels, Default::default()))
            }
            Self::GroupNorm => {
                ensure!(
                    channels % NUM_GROUPS == 0,
                    "group norm needs channels divisible by {}, but get {}",
                    NUM_GROUPS,
                    channels
                );
                Norm::GroupNorm(nn::group_norm(path, NUM_GROUPS, channels, Default::default()))
            }
        };
        Ok(norm)
    }
}

#[derive(Debug)]
pub enum Norm {
    BatchNorm(nn::BatchNorm),
    GroupNorm(nn::GroupNorm),
}

impl nn::ModuleT for Norm {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        match self {
            Self::BatchNorm(norm) => norm.forward_t(input, train),
            Self::GroupNorm(norm) => norm.forward(input),
        }
    }
}
