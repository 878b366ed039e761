//! Tensor-level box sets and region operations built on top of tch.

mod common;

pub mod boxes;
pub mod error;
pub mod nms;
pub mod roi;
pub mod rotated_boxes;
pub mod sort;
pub mod tensor;

pub use boxes::*;
pub use error::*;
pub use nms::*;
pub use roi::*;
pub use rotated_boxes::*;
pub use sort::*;
pub use tensor::*;
