use crate::{boxes::BoxSet, common::*, error::BoxError, tensor::TensorExt};

/// Boxes whose normalized angle magnitude exceeds this many degrees are left untouched by `clip`.
pub const CLIP_ANGLE_THRESHOLD: f64 = 1.0;

/// Rotated boxes stored as a `[N, 5]` tensor in `(cx, cy, w, h, angle)` format.
///
/// Angles are in degrees, counter-clockwise.
#[derive(Debug)]
pub struct RotatedBoxes {
    tensor: Tensor,
}

impl RotatedBoxes {
    pub fn empty(device: Device) -> Self {
        Self {
            tensor: Tensor::zeros([0, 5], (Kind::Float, device)),
        }
    }

    pub fn cx(&self) -> Tensor {
        self.tensor.select(1, 0)
    }

    pub fn cy(&self) -> Tensor {
        self.tensor.select(1, 1)
    }

    pub fn widths(&self) -> Tensor {
        self.tensor.select(1, 2)
    }

    pub fn heights(&self) -> Tensor {
        self.tensor.select(1, 3)
    }

    pub fn angles(&self) -> Tensor {
        self.tensor.select(1, 4)
    }

    /// Maps the angles into `[-180, 180)`.
    pub fn normalize_angles(&self) -> Self {
        let angles = (self.angles() + 180.0).remainder(360.0) - 180.0;
        let tensor = Tensor::cat(&[self.tensor.i((.., 0..4)), angles.unsqueeze(1)], 1);
        Self { tensor }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            tensor: self.tensor.shallow_clone(),
        }
    }
}

impl BoxSet for RotatedBoxes {
    type Rect = RotatedRect<f32>;

    const BOX_DIM: i64 = 5;

    fn from_tensor(tensor: Tensor) -> Result<Self> {
        if tensor.numel() == 0 {
            return Ok(Self {
                tensor: tensor.reshape([0, Self::BOX_DIM]),
            });
        }
        ensure!(
            tensor.dim() == 2 && tensor.size()[1] == Self::BOX_DIM,
            "expect a [N, 5] tensor, but get shape {:?}",
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

    /// Clips nearly horizontal boxes into the image.
    ///
    /// Only boxes whose normalized angle is within [CLIP_ANGLE_THRESHOLD] are
    /// clipped, through their axis-aligned extent. The others are returned
    /// with normalized angles only.
    fn clip(&self, image_size: &HW<i64>) -> Result<Self> {
        if !self.is_empty() && self.tensor.isfinite().all().int64_value(&[]) == 0 {
            return Err(BoxError::NonFiniteBox.into());
        }
        let height = image_size.h() as f64;
        let width = image_size.w() as f64;

        let normalized = self.normalize_angles();
        let cx = normalized.cx();
        let cy = normalized.cy();
        let w = normalized.widths();
        let h = normalized.heights();
        let angles = normalized.angles();

        let x1 = (&cx - &w / 2.0).clamp(0.0, width);
        let y1 = (&cy - &h / 2.0).clamp(0.0, height);
        let x2 = (&cx + &w / 2.0).clamp(0.0, width);
        let y2 = (&cy + &h / 2.0).clamp(0.0, height);

        let clipped = Tensor::stack(
            &[
                (&x1 + &x2) / 2.0,
                (&y1 + &y2) / 2.0,
                w.minimum(&(&x2 - &x1)),
                h.minimum(&(&y2 - &y1)),
                angles.shallow_clone(),
            ],
            1,
        );
        let mask = angles.abs().le(CLIP_ANGLE_THRESHOLD).unsqueeze(1);
        let tensor = clipped.where_self(&mask, normalized.tensor());

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

    /// Tests the axis-aligned extent of each rotated box.
    fn inside_box(&self, image_size: &HW<i64>, boundary_threshold: f64) -> Tensor {
        let height = image_size.h() as f64;
        let width = image_size.w() as f64;
        let cx = self.cx();
        let cy = self.cy();
        let half_w = self.widths() / 2.0;
        let half_h = self.heights() / 2.0;
        let radians = self.angles() * (std::f64::consts::PI / 180.0);
        let cos = radians.cos().abs();
        let sin = radians.sin().abs();

        let dx = &cos * &half_w + &sin * &half_h;
        let dy = &cos * &half_h + &sin * &half_w;

        (&cx - &dx)
            .ge(-boundary_threshold)
            .logical_and(&(&cy - &dy).ge(-boundary_threshold))
            .logical_and(&(&cx + &dx).lt(width + boundary_threshold))
            .logical_and(&(&cy + &dy).lt(height + boundary_threshold))
    }

    fn pairwise_iou(&self, other: &Self) -> Result<Tensor> {
        self.tensor.ensure_same_device(&other.tensor)?;
        let lhs = self.to_rects()?;
        let rhs = other.to_rects()?;

        let values: Vec<f32> = lhs
            .iter()
            .cartesian_product(rhs.iter())
            .map(|(lhs, rhs)| lhs.iou_with(rhs))
            .collect();
        let iou = Tensor::from_slice(&values)
            .view([lhs.len() as i64, rhs.len() as i64])
            .to_device(self.device());
        Ok(iou)
    }

    fn to_rects(&self) -> Result<Vec<Self::Rect>> {
        self.tensor
            .to_f32_vec()?
            .chunks(Self::BOX_DIM as usize)
            .map(|params| {
                let [cx, cy, w, h, angle] = [params[0], params[1], params[2], params[3], params[4]];
                RotatedRect::try_from_cxcywha([cx, cy, w.max(0.0), h.max(0.0), angle])
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

    #[test]
    fn rotated_boxes_clip() -> Result<()> {
        let boxes = RotatedBoxes::from_tensor(
            Tensor::from_slice(&[
                2f32, 5.0, 8.0, 4.0, 360.0, //
                2.0, 5.0, 8.0, 4.0, 30.0,
            ])
            .view([2, 5]),
        )?;
        let clipped = boxes.clip(&HW::try_from_hw([20, 20])?)?;
        let values = clipped.tensor().to_f32_vec()?;

        // the first box spans x in [-2, 6] and is cut at the left border
        assert_eq!(&values[0..5], &[3.0, 5.0, 6.0, 4.0, 0.0]);
        assert_eq!(&values[5..10], &[2.0, 5.0, 8.0, 4.0, 30.0]);
        Ok(())
    }

    #[test]
    fn rotated_boxes_pairwise_iou() -> Result<()> {
        let lhs = RotatedBoxes::from_tensor(
            Tensor::from_slice(&[0f32, 0.0, 4.0, 2.0, 0.0]).view([1, 5]),
        )?;
        let rhs = RotatedBoxes::from_tensor(
            Tensor::from_slice(&[
                0f32, 0.0, 2.0, 4.0, 90.0, //
                0.0, 0.0, 2.0, 4.0, 0.0, //
                50.0, 50.0, 2.0, 2.0, 10.0,
            ])
            .view([3, 5]),
        )?;
        let iou = lhs.pairwise_iou(&rhs)?;
        assert_eq!(iou.size(), vec![1, 3]);

        let values = iou.to_f32_vec()?;
        assert_abs_diff_eq!(values[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(values[1], 4.0 / 12.0, epsilon = 1e-5);
        assert_eq!(values[2], 0.0);
        Ok(())
    }

    #[test]
    fn rotated_boxes_inside() -> Result<()> {
        let boxes = RotatedBoxes::from_tensor(
            Tensor::from_slice(&[
                5f32, 5.0, 4.0, 4.0, 0.0, //
                5.0, 10.0, 12.0, 2.0, 90.0, //
                5.0, 5.0, 12.0, 2.0, 0.0,
            ])
            .view([3, 5]),
        )?;
        let size = HW::try_from_hw([20, 10])?;
        assert_eq!(
            boxes.inside_box(&size, 0.0).to_bool_vec()?,
            vec![true, true, false]
        );
        Ok(())
    }

    #[test]
    fn rotated_boxes_empty() -> Result<()> {
        let boxes = RotatedBoxes::empty(Device::Cpu);
        assert_eq!(boxes.pairwise_iou(&boxes)?.size(), vec![0, 0]);
        assert_eq!(boxes.area().size(), vec![0]);
        Ok(())
    }
}
