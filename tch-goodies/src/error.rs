use tch::Device;
use thiserror::Error;

/// Errors raised by box computations.
///
/// They travel inside [anyhow::Error] and can be recovered with
/// `error.downcast_ref::<BoxError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BoxError {
    #[error("box {index} has non-positive size (width {width}, height {height})")]
    InvalidBox { index: i64, width: f64, height: f64 },
    #[error("box coordinates contain NaN or infinite values")]
    NonFiniteBox,
    #[error("device mismatch: expected {expected:?}, found {found:?}")]
    DeviceMismatch { expected: Device, found: Device },
}
