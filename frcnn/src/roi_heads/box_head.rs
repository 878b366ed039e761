use crate::common::*;

/// Turns `[R, C, h, w]` pooled crops into `[R, D]` box features.
pub trait BoxHead: nn::ModuleT {
    /// The feature width `D` produced from crops of `in_channels` channels.
    fn output_size(&self, in_channels: i64, pooler_resolution: [i64; 2]) -> i64;
}

/// Averages each crop over its spatial extent.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAvgPool;

impl nn::ModuleT for GlobalAvgPool {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        xs.mean_dim(&[2i64, 3][..], false, Kind::Float)
    }
}

impl BoxHead for GlobalAvgPool {
    fn output_size(&self, in_channels: i64, _pooler_resolution: [i64; 2]) -> i64 {
        in_channels
    }
}
