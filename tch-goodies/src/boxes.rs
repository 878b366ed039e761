use crate::{
    common::*,
    error::BoxError,
    nms::{batched_nms, nms},
    tensor::TensorExt,
};

/// Capabilities shared by the axis-aligned and rotated box sets.
pub trait BoxSet: Sized {
    /// The host-side box type used to evaluate pairwise overlaps.
    type Rect;

    /// The number of parameters per box.
    const BOX_DIM: i64;

    /// Wraps a `[N, BOX_DIM]` tensor. An empty tensor of any shape yields an empty set.
    fn from_tensor(tensor: Tensor) -> Result<Self>;

    fn tensor(&self) -> &Tensor;

    fn area(&self) -> Tensor;

    /// Returns a copy with the boxes clamped into the image.
    fn clip(&self, image_size: &HW<i64>) -> Result<Self>;

    /// Boolean mask of boxes whose sides are both strictly longer than `threshold`.
    fn nonempty(&self, threshold: f64) -> Tensor;

    fn index_select(&self, index: &Tensor) -> Self;

    /// Boolean mask of boxes lying inside the image extended by `boundary_threshold` pixels.
    fn inside_box(&self, image_size: &HW<i64>, boundary_threshold: f64) -> Tensor;

    fn pairwise_iou(&self, other: &Self) -> Result<Tensor>;

    fn to_rects(&self) -> Result<Vec<Self::Rect>>;

    fn rect_iou(lhs: &Self::Rect, rhs: &Self::Rect) -> f32;

    fn len(&self) -> i64 {
        self.tensor().size()[0]
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn device(&self) -> Device {
        self.tensor().device()
    }

    fn masked_select(&self, mask: &Tensor) -> Self {
        let index = mask.nonzero().view([-1]);
        self.index_select(&index)
    }

    fn cat(sets: &[Self]) -> Result<Self> {
        let first = sets
            .first()
            .ok_or_else(|| format_err!("cannot concatenate an empty list of box sets"))?;
        let device = first.device();
        let tensors: Vec<_> = sets
            .iter()
            .map(|set| -> Result<_> {
                if set.device() != device {
                    return Err(BoxError::DeviceMismatch {
                        expected: device,
                        found: set.device(),
                    }
                    .into());
                }
                Ok(set.tensor())
            })
            .try_collect()?;
        Self::from_tensor(Tensor::cat(&tensors, 0))
    }

    fn nms(&self, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
        nms(self, scores, iou_threshold)
    }

    fn batched_nms(&self, scores: &Tensor, group_ids: &Tensor, iou_threshold: f64) -> Result<Tensor> {
        batched_nms(self, scores, group_ids, iou_threshold)
    }
}

/// Axis-aligned boxes stored as a `[N, 4]` tensor in `(x1, y1, x2, y2)` format.
#[derive(Debug)]
pub struct Boxes {
    tensor: Tensor,
}

impl Boxes {
    pub fn empty(device: Device) -> Self {
        Self {
            tensor: Tensor::zeros([0, 4], (Kind::Float, device)),
        }
    }

    pub fn x1(&self) -> Tensor {
        self.tensor.select(1, 0)
    }

    pub fn y1(&self) -> Tensor {
        self.tensor.select(1, 1)
    }

    pub fn x2(&self) -> Tensor {
        self.tensor.select(1, 2)
    }

    pub fn y2(&self) -> Tensor {
        self.tensor.select(1, 3)
    }

    pub fn widths(&self) -> Tensor {
        self.x2() - self.x1()
    }

    pub fn heights(&self) -> Tensor {
        self.y2() - self.y1()
    }

    /// Box centers in `[N, 2]` `(cx, cy)` layout.
    pub fn centers(&self) -> Tensor {
        (self.tensor.i((.., 0..2)) + self.tensor.i((.., 2..4))) / 2.0
    }

    /// Multiplies x coordinates by `scale_x` and y coordinates by `scale_y`.
    pub fn scale(&self, scale_x: f64, scale_y: f64) -> Self {
        let factors = Tensor::from_slice(&[scale_x, scale_y, scale_x, scale_y])
            .to_kind(self.tensor.kind())
            .to_device(self.tensor.device());
        Self {
            tensor: &self.tensor * factors.view([1, 4]),
        }
    }

    pub fn pairwise_intersection(&self, other: &Self) -> Result<Tensor> {
        self.tensor.ensure_same_device(&other.tensor)?;
        let lhs = &self.tensor;
        let rhs = &other.tensor;

        let top_left = lhs
            .i((.., 0..2))
            .unsqueeze(1)
            .maximum(&rhs.i((.., 0..2)).unsqueeze(0));
        let bottom_right = lhs
            .i((.., 2..4))
            .unsqueeze(1)
            .minimum(&rhs.i((.., 2..4)).unsqueeze(0));
        let extent = (bottom_right - top_left).clamp_min(0.0);
        Ok(extent.select(2, 0) * extent.select(2, 1))
    }

    /// Intersection over the area of each box in `other`, shaped `[N, M]`.
    pub fn pairwise_ioa(&self, other: &Self) -> Result<Tensor> {
        let inter = self.pairwise_intersection(other)?;
        let area = other.area().unsqueeze(0);
        let ioa = (&inter / area).where_self(&inter.gt(0.0), &inter.zeros_like());
        Ok(ioa)
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            tensor: self.tensor.shallow_clone(),
        }
    }
}

impl BoxSet for Boxes {
    type Rect = XYXY<f32>;

    const BOX_DIM: i64 = 4;

    fn from_tensor(tensor: Tensor) -> Result<Self> {
        if tensor.numel() == 0 {
            return Ok(Self {
                tensor: tensor.reshape([0, Self::BOX_DIM]),
            });
        }
        ensure!(
            tensor.dim() == 2 && tensor.size()[1] == Self::BOX_DIM,
            "expect a [N, 4] tensor, but get shape {:?}",
            tensor.size()
        );
        Ok(Self { tensor })
    }

    fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    fn area(&self) -> Tensor {
        self.widths() * self.heights()
    }

    fn clip(&self, image_size: &HW<i64>) -> Result<Self> {
        if !self.is_empty() && self.tensor.isfinite().all().int64_value(&[]) == 0 {
            return Err(BoxError::NonFiniteBox.into());
        }
        let height = image_size.h() as f64;
        let width = image_size.w() as f64;

        let tensor = Tensor::stack(
            &[
                self.x1().clamp(0.0, width),
                self.y1().clamp(0.0, height),
                self.x2().clamp(0.0, width),
                self.y2().clamp(0.0, height),
            ],
            1,
        );
        Ok(Self { tensor })
    }

    fn nonempty(&self, threshold: f64) -> Tensor {
        self.widths()
            .gt(threshold)
            .logical_and(&self.heights().gt(threshold))
    }

    fn index_select(&self, index: &Tensor) -> Self {
        Self {
            tensor: self.tensor.index_select(0, index),
        }
    }

    fn inside_box(&self, image_size: &HW<i64>, boundary_threshold: f64) -> Tensor {
        let height = image_size.h() as f64;
        let width = image_size.w() as f64;
        self.x1()
            .ge(-boundary_threshold)
            .logical_and(&self.y1().ge(-boundary_threshold))
            .logical_and(&self.x2().lt(width + boundary_threshold))
            .logical_and(&self.y2().lt(height + boundary_threshold))
    }

    fn pairwise_iou(&self, other: &Self) -> Result<Tensor> {
        let inter = self.pairwise_intersection(other)?;
        let union = self.area().unsqueeze(1) + other.area().unsqueeze(0) - &inter;
        let iou = (&inter / union).where_self(&inter.gt(0.0), &inter.zeros_like());
        Ok(iou)
    }

    fn to_rects(&self) -> Result<Vec<Self::Rect>> {
        self.tensor
            .to_f32_vec()?
            .chunks(Self::BOX_DIM as usize)
            .map(|xyxy| {
                // inverted boxes are treated as empty
                let [x1, y1, x2, y2] = [xyxy[0], xyxy[1], xyxy[2], xyxy[3]];
                XYXY::try_from_xyxy([x1, y1, x2.max(x1), y2.max(y1)])
            })
            .try_collect()
    }

    fn rect_iou(lhs: &Self::Rect, rhs: &Self::Rect) -> f32 {
        lhs.iou_with(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;

    fn random_boxes(rng: &mut impl Rng, num: usize) -> Result<Boxes> {
        let values: Vec<f32> = (0..num)
            .flat_map(|_| {
                let x1 = rng.gen_range(0.0..100.0);
                let y1 = rng.gen_range(0.0..100.0);
                let w = rng.gen_range(1.0..50.0);
                let h = rng.gen_range(1.0..50.0);
                [x1, y1, x1 + w, y1 + h]
            })
            .collect();
        Boxes::from_tensor(Tensor::from_slice(&values).view([num as i64, 4]))
    }

    #[test]
    fn boxes_pairwise_iou_properties() -> Result<()> {
        let mut rng = rand::thread_rng();
        let lhs = random_boxes(&mut rng, 7)?;
        let rhs = random_boxes(&mut rng, 5)?;

        let iou = lhs.pairwise_iou(&rhs)?;
        let iou_t = rhs.pairwise_iou(&lhs)?.tr();
        ensure!(iou.size() == [7, 5]);
        ensure!(iou.ge(0.0).all().int64_value(&[]) == 1);
        ensure!(iou.le(1.0 + 1e-6).all().int64_value(&[]) == 1);
        ensure!(iou.allclose(&iou_t, 1e-6, 1e-6, false));

        let diag = lhs.pairwise_iou(&lhs)?.diagonal(0, 0, 1);
        ensure!(diag.allclose(&diag.ones_like(), 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn boxes_iou_and_ioa_values() -> Result<()> {
        let lhs = Boxes::from_tensor(Tensor::from_slice(&[0f32, 0.0, 10.0, 10.0]).view([1, 4]))?;
        let rhs = Boxes::from_tensor(
            Tensor::from_slice(&[5f32, 0.0, 15.0, 10.0, 20.0, 20.0, 20.0, 30.0]).view([2, 4]),
        )?;

        let iou = lhs.pairwise_iou(&rhs)?.to_f32_vec()?;
        assert_abs_diff_eq!(iou[0], 50.0 / 150.0, epsilon = 1e-6);
        assert_eq!(iou[1], 0.0);

        // the second box has zero area
        let ioa = lhs.pairwise_ioa(&rhs)?.to_f32_vec()?;
        assert_abs_diff_eq!(ioa[0], 0.5, epsilon = 1e-6);
        assert_eq!(ioa[1], 0.0);
        Ok(())
    }

    #[test]
    fn boxes_clip_and_nonempty() -> Result<()> {
        let boxes = Boxes::from_tensor(
            Tensor::from_slice(&[-5f32, -5.0, 5.0, 5.0, 8.0, 2.0, 30.0, 3.0]).view([2, 4]),
        )?;
        let clipped = boxes.clip(&HW::try_from_hw([10, 20])?)?;
        assert_eq!(
            clipped.tensor().to_f32_vec()?,
            vec![0.0, 0.0, 5.0, 5.0, 8.0, 2.0, 20.0, 3.0]
        );
        assert_eq!(
            clipped.nonempty(1.0).to_bool_vec()?,
            vec![true, false]
        );
        assert_eq!(boxes.nonempty(0.0).to_bool_vec()?, vec![true, true]);
        Ok(())
    }

    #[test]
    fn boxes_clip_rejects_non_finite() -> Result<()> {
        let boxes =
            Boxes::from_tensor(Tensor::from_slice(&[0f32, 0.0, f32::NAN, 5.0]).view([1, 4]))?;
        let err = boxes.clip(&HW::try_from_hw([10, 10])?).unwrap_err();
        assert_eq!(err.downcast_ref::<BoxError>(), Some(&BoxError::NonFiniteBox));
        Ok(())
    }

    #[test]
    fn boxes_inside_and_cat() -> Result<()> {
        let boxes = Boxes::from_tensor(
            Tensor::from_slice(&[0f32, 0.0, 5.0, 5.0, -2.0, 0.0, 4.0, 4.0]).view([2, 4]),
        )?;
        let size = HW::try_from_hw([10, 10])?;
        assert_eq!(boxes.inside_box(&size, 0.0).to_bool_vec()?, vec![true, false]);
        assert_eq!(boxes.inside_box(&size, 3.0).to_bool_vec()?, vec![true, true]);

        let merged = Boxes::cat(&[boxes.shallow_clone(), Boxes::empty(Device::Cpu), boxes])?;
        assert_eq!(merged.len(), 4);
        assert!(Boxes::cat(&[]).is_err());
        Ok(())
    }

    #[test]
    fn boxes_empty_tensor() -> Result<()> {
        let boxes = Boxes::from_tensor(Tensor::zeros([0], (Kind::Float, Device::Cpu)))?;
        assert!(boxes.is_empty());
        assert_eq!(boxes.clip(&HW::try_from_hw([4, 4])?)?.len(), 0);
        assert_eq!(boxes.pairwise_iou(&boxes)?.size(), vec![0, 0]);
        Ok(())
    }
}
