//! Loss function building blocks.

mod bce_with_logits_loss;
mod cross_entropy;
mod smooth_l1_loss;

pub use bce_with_logits_loss::*;
pub use cross_entropy::*;
pub use smooth_l1_loss::*;
