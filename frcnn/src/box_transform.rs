//! Conversion between boxes and regression deltas.

use crate::common::*;

/// The default clamp on `dw` and `dh` before exponentiation.
pub fn default_scale_clamp() -> R64 {
    r64((1000.0f64 / 16.0).ln())
}

/// Encodes target boxes relative to source boxes and decodes them back.
pub trait BoxTransform {
    type Boxes: BoxSet;

    /// Deltas in shape `[N, BOX_DIM]` that turn `src_boxes` into `target_boxes`.
    fn get_deltas(&self, src_boxes: &Tensor, target_boxes: &Tensor) -> Result<Tensor>;

    /// Applies `[N, K * BOX_DIM]` deltas to `[N, BOX_DIM]` boxes.
    ///
    /// Each of the `K` deltas of a box is decoded independently and the
    /// output keeps the `[N, K * BOX_DIM]` layout of the input.
    fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Result<Tensor>;
}

fn check_pair(lhs: &Tensor, rhs: &Tensor, lhs_dim: Option<i64>, rhs_dim: i64) -> Result<(i64, i64)> {
    lhs.ensure_same_device(rhs)?;
    let (num_lhs, lhs_cols) = lhs.size2()?;
    let (num_rhs, rhs_cols) = rhs.size2()?;
    ensure!(
        num_lhs == num_rhs,
        "expect equal number of rows, but get {} and {}",
        num_lhs,
        num_rhs
    );
    ensure!(
        rhs_cols == rhs_dim,
        "expect {} box parameters, but get {}",
        rhs_dim,
        rhs_cols
    );
    match lhs_dim {
        Some(dim) => ensure!(lhs_cols == dim, "expect {} box parameters, but get {}", dim, lhs_cols),
        None => ensure!(
            lhs_cols % rhs_dim == 0,
            "the delta width {} is not a multiple of {}",
            lhs_cols,
            rhs_dim
        ),
    }
    Ok((num_lhs, lhs_cols / rhs_dim))
}

fn ensure_positive_size(widths: &Tensor, heights: &Tensor) -> Result<()> {
    let invalid = widths.le(0.0).logical_or(&heights.le(0.0));
    if invalid.any().int64_value(&[]) == 0 {
        return Ok(());
    }
    let index = invalid.nonzero().int64_value(&[0, 0]);
    Err(BoxError::InvalidBox {
        index,
        width: widths.double_value(&[index]),
        height: heights.double_value(&[index]),
    }
    .into())
}

#[derive(Debug, Clone)]
pub struct Box2BoxTransformInit {
    /// Weights of `(dx, dy, dw, dh)`.
    pub weights: [R64; 4],
    pub scale_clamp: R64,
}

impl Box2BoxTransformInit {
    pub fn new(weights: [f64; 4]) -> Self {
        Self {
            weights: weights.map(r64),
            scale_clamp: default_scale_clamp(),
        }
    }

    pub fn build(self) -> Result<Box2BoxTransform> {
        let Self {
            weights,
            scale_clamp,
        } = self;
        ensure!(
            weights.iter().all(|&weight| weight > 0.0),
            "box regression weights must be positive"
        );
        ensure!(scale_clamp > 0.0, "scale_clamp must be positive");

        Ok(Box2BoxTransform {
            weights: weights.map(|weight| weight.raw()),
            scale_clamp: scale_clamp.raw(),
        })
    }
}

/// Center-offset and log-scale parameterization of axis-aligned boxes.
#[derive(Debug, Clone)]
pub struct Box2BoxTransform {
    weights: [f64; 4],
    scale_clamp: f64,
}

impl BoxTransform for Box2BoxTransform {
    type Boxes = Boxes;

    fn get_deltas(&self, src_boxes: &Tensor, target_boxes: &Tensor) -> Result<Tensor> {
        check_pair(src_boxes, target_boxes, Some(4), 4)?;
        let [wx, wy, ww, wh] = self.weights;
        let src_boxes = src_boxes.to_kind(Kind::Float);
        let target_boxes = target_boxes.to_kind(Kind::Float);

        let src_widths = src_boxes.select(1, 2) - src_boxes.select(1, 0);
        let src_heights = src_boxes.select(1, 3) - src_boxes.select(1, 1);
        ensure_positive_size(&src_widths, &src_heights)?;
        let src_ctr_x = src_boxes.select(1, 0) + &src_widths * 0.5;
        let src_ctr_y = src_boxes.select(1, 1) + &src_heights * 0.5;

        let target_widths = target_boxes.select(1, 2) - target_boxes.select(1, 0);
        let target_heights = target_boxes.select(1, 3) - target_boxes.select(1, 1);
        let target_ctr_x = target_boxes.select(1, 0) + &target_widths * 0.5;
        let target_ctr_y = target_boxes.select(1, 1) + &target_heights * 0.5;

        let dx = (target_ctr_x - src_ctr_x) / &src_widths * wx;
        let dy = (target_ctr_y - src_ctr_y) / &src_heights * wy;
        let dw = (target_widths / &src_widths).log() * ww;
        let dh = (target_heights / &src_heights).log() * wh;

        Ok(Tensor::stack(&[dx, dy, dw, dh], 1))
    }

    fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Result<Tensor> {
        let (num_boxes, num_deltas) = check_pair(deltas, boxes, None, 4)?;
        let [wx, wy, ww, wh] = self.weights;
        let boxes = boxes.to_kind(deltas.kind());

        let widths = (boxes.select(1, 2) - boxes.select(1, 0)).unsqueeze(1);
        let heights = (boxes.select(1, 3) - boxes.select(1, 1)).unsqueeze(1);
        let ctr_x = boxes.select(1, 0).unsqueeze(1) + &widths * 0.5;
        let ctr_y = boxes.select(1, 1).unsqueeze(1) + &heights * 0.5;

        let deltas = deltas.view([num_boxes, num_deltas, 4]);
        let dx = deltas.select(2, 0) / wx;
        let dy = deltas.select(2, 1) / wy;
        let dw = (deltas.select(2, 2) / ww).clamp_max(self.scale_clamp);
        let dh = (deltas.select(2, 3) / wh).clamp_max(self.scale_clamp);

        let pred_ctr_x = dx * &widths + ctr_x;
        let pred_ctr_y = dy * &heights + ctr_y;
        let pred_w = dw.exp() * &widths;
        let pred_h = dh.exp() * &heights;

        let pred_boxes = Tensor::stack(
            &[
                &pred_ctr_x - &pred_w * 0.5,
                &pred_ctr_y - &pred_h * 0.5,
                &pred_ctr_x + &pred_w * 0.5,
                &pred_ctr_y + &pred_h * 0.5,
            ],
            2,
        );
        Ok(pred_boxes.view([num_boxes, num_deltas * 4]))
    }
}

#[derive(Debug, Clone)]
pub struct Box2BoxTransformRotatedInit {
    /// Weights of `(dx, dy, dw, dh, da)`.
    pub weights: [R64; 5],
    pub scale_clamp: R64,
}

impl Box2BoxTransformRotatedInit {
    pub fn new(weights: [f64; 5]) -> Self {
        Self {
            weights: weights.map(r64),
            scale_clamp: default_scale_clamp(),
        }
    }

    pub fn build(self) -> Result<Box2BoxTransformRotated> {
        let Self {
            weights,
            scale_clamp,
        } = self;
        ensure!(
            weights.iter().all(|&weight| weight > 0.0),
            "box regression weights must be positive"
        );
        ensure!(scale_clamp > 0.0, "scale_clamp must be positive");

        Ok(Box2BoxTransformRotated {
            weights: weights.map(|weight| weight.raw()),
            scale_clamp: scale_clamp.raw(),
        })
    }
}

/// Parameterization of rotated boxes.
///
/// The angle delta is the angle difference in radians, wrapped into
/// `[-180, 180)` degrees before conversion.
#[derive(Debug, Clone)]
pub struct Box2BoxTransformRotated {
    weights: [f64; 5],
    scale_clamp: f64,
}

impl BoxTransform for Box2BoxTransformRotated {
    type Boxes = RotatedBoxes;

    fn get_deltas(&self, src_boxes: &Tensor, target_boxes: &Tensor) -> Result<Tensor> {
        check_pair(src_boxes, target_boxes, Some(5), 5)?;
        let [wx, wy, ww, wh, wa] = self.weights;
        let src = src_boxes.to_kind(Kind::Float);
        let target = target_boxes.to_kind(Kind::Float);

        let src_widths = src.select(1, 2);
        let src_heights = src.select(1, 3);
        ensure_positive_size(&src_widths, &src_heights)?;

        let dx = (target.select(1, 0) - src.select(1, 0)) / &src_widths * wx;
        let dy = (target.select(1, 1) - src.select(1, 1)) / &src_heights * wy;
        let dw = (target.select(1, 2) / &src_widths).log() * ww;
        let dh = (target.select(1, 3) / &src_heights).log() * wh;

        let da = (target.select(1, 4) - src.select(1, 4) + 180.0).remainder(360.0) - 180.0;
        let da = da * (wa * PI / 180.0);

        Ok(Tensor::stack(&[dx, dy, dw, dh, da], 1))
    }

    fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Result<Tensor> {
        let (num_boxes, num_deltas) = check_pair(deltas, boxes, None, 5)?;
        let [wx, wy, ww, wh, wa] = self.weights;
        let boxes = boxes.to_kind(deltas.kind());

        let ctr_x = boxes.select(1, 0).unsqueeze(1);
        let ctr_y = boxes.select(1, 1).unsqueeze(1);
        let widths = boxes.select(1, 2).unsqueeze(1);
        let heights = boxes.select(1, 3).unsqueeze(1);
        let angles = boxes.select(1, 4).unsqueeze(1);

        let deltas = deltas.view([num_boxes, num_deltas, 5]);
        let dx = deltas.select(2, 0) / wx;
        let dy = deltas.select(2, 1) / wy;
        let dw = (deltas.select(2, 2) / ww).clamp_max(self.scale_clamp);
        let dh = (deltas.select(2, 3) / wh).clamp_max(self.scale_clamp);
        let da = deltas.select(2, 4) / wa;

        let pred_angle = da * (180.0 / PI) + angles;
        let pred_angle = (pred_angle + 180.0).remainder(360.0) - 180.0;

        let pred_boxes = Tensor::stack(
            &[
                dx * &widths + ctr_x,
                dy * &heights + ctr_y,
                dw.exp() * &widths,
                dh.exp() * &heights,
                pred_angle,
            ],
            2,
        );
        Ok(pred_boxes.view([num_boxes, num_deltas * 5]))
    }
}
