use crate::{common::*, error::BoxError};

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    /// Fails with [BoxError::DeviceMismatch] unless `other` lives on the same device.
    fn ensure_same_device(&self, other: &Tensor) -> Result<()>;

    /// Copies all elements in row-major order to a host vector.
    fn to_f32_vec(&self) -> Result<Vec<f32>>;

    /// Copies all elements in row-major order to a host vector.
    fn to_i64_vec(&self) -> Result<Vec<i64>>;

    fn to_bool_vec(&self) -> Result<Vec<bool>>;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn ensure_same_device(&self, other: &Tensor) -> Result<()> {
        let expected = self.device();
        let found = other.device();
        if expected != found {
            return Err(BoxError::DeviceMismatch { expected, found }.into());
        }
        Ok(())
    }

    fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let flat = self
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .view([-1]);
        Ok(Vec::<f32>::try_from(&flat)?)
    }

    fn to_i64_vec(&self) -> Result<Vec<i64>> {
        let flat = self
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Int64)
            .contiguous()
            .view([-1]);
        Ok(Vec::<i64>::try_from(&flat)?)
    }

    fn to_bool_vec(&self) -> Result<Vec<bool>> {
        Ok(self.to_i64_vec()?.into_iter().map(|v| v != 0).collect())
    }
}
