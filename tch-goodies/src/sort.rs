use crate::{common::*, tensor::TensorExt};

/// Top-k along the last dimension of a 1-D or 2-D tensor.
///
/// Values are sorted in descending order and equal values keep their
/// original order. `k` larger than the dimension takes every element.
/// Returns `(values, indices)` on the input device.
pub fn topk_stable(input: &Tensor, k: i64) -> Result<(Tensor, Tensor)> {
    ensure!(k >= 0, "k must be non-negative, but get {}", k);
    let (rows, cols) = match input.size().as_slice() {
        &[cols] => (1, cols),
        &[rows, cols] => (rows, cols),
        _ => bail!("expect a 1-D or 2-D tensor, but get shape {:?}", input.size()),
    };
    let k = k.min(cols);
    let device = input.device();

    let values = input.to_f32_vec()?;
    let indices: Vec<i64> = if cols == 0 {
        vec![]
    } else {
        values
            .chunks(cols as usize)
            .flat_map(|row| {
                let mut order: Vec<i64> = (0..cols).collect();
                order.sort_by(|&lhs, &rhs| row[rhs as usize].total_cmp(&row[lhs as usize]));
                order.truncate(k as usize);
                order
            })
            .collect()
    };

    let indices = Tensor::from_slice(&indices).to_device(device);
    let indices = match input.dim() {
        1 => indices.view([k]),
        _ => indices.view([rows, k]),
    };
    let values = input.gather(-1, &indices, false);
    Ok((values, indices))
}

/// Indices that sort a 1-D tensor in descending order, ties keeping their original order.
pub fn argsort_descending_stable(input: &Tensor) -> Result<Tensor> {
    let len = input.size1()?;
    let (_, indices) = topk_stable(input, len)?;
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topk_stable_ties() -> Result<()> {
        let input = Tensor::from_slice(&[0.5f32, 0.9, 0.5, 0.1, 0.9, 0.5]);
        let (values, indices) = topk_stable(&input, 4)?;
        assert_eq!(indices.to_i64_vec()?, vec![1, 4, 0, 2]);
        assert_eq!(values.to_f32_vec()?, vec![0.9, 0.9, 0.5, 0.5]);
        Ok(())
    }

    #[test]
    fn topk_stable_rows() -> Result<()> {
        let input = Tensor::from_slice(&[3f32, 1.0, 2.0, 1.0, 1.0, 5.0]).view([2, 3]);
        let (values, indices) = topk_stable(&input, 10)?;
        assert_eq!(indices.size(), vec![2, 3]);
        assert_eq!(indices.to_i64_vec()?, vec![0, 2, 1, 2, 0, 1]);
        assert_eq!(values.to_f32_vec()?, vec![3.0, 2.0, 1.0, 5.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn topk_stable_empty() -> Result<()> {
        let input = Tensor::zeros([2, 0], (Kind::Float, Device::Cpu));
        let (values, indices) = topk_stable(&input, 3)?;
        assert_eq!(values.size(), vec![2, 0]);
        assert_eq!(indices.size(), vec![2, 0]);

        let order = argsort_descending_stable(&Tensor::from_slice(&[1f32, 3.0, 2.0]))?;
        assert_eq!(order.to_i64_vec()?, vec![1, 2, 0]);
        Ok(())
    }
}
