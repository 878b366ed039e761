use super::XYXY;
use crate::common::*;

/// Rotated box in `(cx, cy, w, h, angle)` format.
///
/// The angle is measured in degrees, counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect<T> {
    pub(crate) cx: T,
    pub(crate) cy: T,
    pub(crate) w: T,
    pub(crate) h: T,
    pub(crate) angle: T,
}

impl<T> RotatedRect<T>
where
    T: Float,
{
    pub fn try_from_cxcywha(cxcywha: [T; 5]) -> Result<Self> {
        let [cx, cy, w, h, angle] = cxcywha;
        let zero = T::zero();
        ensure!(w >= zero && h >= zero, "w and h must be non-negative");
        Ok(Self {
            cx,
            cy,
            w,
            h,
            angle,
        })
    }

    pub fn cxcywha(&self) -> [T; 5] {
        [self.cx, self.cy, self.w, self.h, self.angle]
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }

    /// The four corners in traversal order.
    pub fn corners(&self) -> [[T; 2]; 4] {
        let half = T::from(0.5).unwrap_or_else(T::zero);
        let theta = self.angle.to_radians();
        let cos = theta.cos() * half;
        let sin = theta.sin() * half;
        let Self { cx, cy, w, h, .. } = *self;

        let p0 = [cx + sin * h + cos * w, cy + cos * h - sin * w];
        let p1 = [cx - sin * h + cos * w, cy - cos * h - sin * w];
        let p2 = [cx + cx - p0[0], cy + cy - p0[1]];
        let p3 = [cx + cx - p1[0], cy + cy - p1[1]];
        [p0, p1, p2, p3]
    }

    /// The axis-aligned box with the same center and size, ignoring the angle.
    pub fn to_unrotated(&self) -> XYXY<T> {
        let two = T::one() + T::one();
        XYXY {
            x1: self.cx - self.w / two,
            y1: self.cy - self.h / two,
            x2: self.cx + self.w / two,
            y2: self.cy + self.h / two,
        }
    }

    pub fn intersection_area_with(&self, other: &Self) -> T {
        let lhs = self.corners();
        let rhs = other.corners();
        let polygon = clip_polygon(&lhs, &rhs);
        signed_area(&polygon).abs()
    }

    /// Intersection over union, zero when the boxes do not overlap.
    pub fn iou_with(&self, other: &Self) -> T {
        let inter_area = self.intersection_area_with(other);
        if inter_area <= T::zero() {
            return T::zero();
        }
        let union_area = self.area() + other.area() - inter_area;
        inter_area / union_area
    }
}

fn cross<T: Float>(lhs: [T; 2], rhs: [T; 2]) -> T {
    lhs[0] * rhs[1] - lhs[1] * rhs[0]
}

fn sub<T: Float>(lhs: [T; 2], rhs: [T; 2]) -> [T; 2] {
    [lhs[0] - rhs[0], lhs[1] - rhs[1]]
}

/// Shoelace formula.
fn signed_area<T: Float>(polygon: &[[T; 2]]) -> T {
    let two = T::one() + T::one();
    let len = polygon.len();
    let sum = (0..len).fold(T::zero(), |sum, idx| {
        sum + cross(polygon[idx], polygon[(idx + 1) % len])
    });
    sum / two
}

/// Sutherland-Hodgman clipping of `subject` against the convex polygon `clip`.
fn clip_polygon<T: Float>(subject: &[[T; 2]], clip: &[[T; 2]]) -> Vec<[T; 2]> {
    let orientation = signed_area(clip);
    if orientation == T::zero() || signed_area(subject) == T::zero() {
        return vec![];
    }
    let orientation = orientation.signum();
    let mut output = subject.to_vec();

    for idx in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let from = clip[idx];
        let dir = sub(clip[(idx + 1) % clip.len()], from);
        let side = |point: [T; 2]| cross(dir, sub(point, from)) * orientation;

        let input = mem::take(&mut output);
        let len = input.len();

        for (jdx, &curr) in input.iter().enumerate() {
            let prev = input[(jdx + len - 1) % len];
            let curr_side = side(curr);
            let prev_side = side(prev);
            let crossing = || {
                let ratio = prev_side / (prev_side - curr_side);
                [
                    prev[0] + (curr[0] - prev[0]) * ratio,
                    prev[1] + (curr[1] - prev[1]) * ratio,
                ]
            };

            if curr_side >= T::zero() {
                if prev_side < T::zero() {
                    output.push(crossing());
                }
                output.push(curr);
            } else if prev_side >= T::zero() {
                output.push(crossing());
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RectFloat, RectNum};
    use approx::assert_abs_diff_eq;

    #[test]
    fn rotated_axis_aligned_matches_rect_iou() -> Result<()> {
        let lhs = RotatedRect::try_from_cxcywha([5.0, 5.0, 10.0, 10.0, 0.0])?;
        let rhs = RotatedRect::try_from_cxcywha([10.0, 5.0, 10.0, 10.0, 0.0])?;
        let expect = lhs.to_unrotated().iou_with(&rhs.to_unrotated());

        assert_abs_diff_eq!(lhs.iou_with(&rhs), expect, epsilon = 1e-9);
        assert_abs_diff_eq!(lhs.iou_with(&rhs), rhs.iou_with(&lhs), epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn rotated_square_quarter_turn() -> Result<()> {
        let lhs = RotatedRect::try_from_cxcywha([0.0, 0.0, 4.0, 4.0, 0.0])?;
        let rhs = RotatedRect::try_from_cxcywha([0.0, 0.0, 4.0, 4.0, 90.0])?;
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 1.0, epsilon = 1e-9);

        let tilted = RotatedRect::try_from_cxcywha([3.0, -2.0, 6.0, 2.0, 30.0])?;
        assert_abs_diff_eq!(tilted.iou_with(&tilted), 1.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn rotated_diamond_in_square() -> Result<()> {
        let square = RotatedRect::try_from_cxcywha([0.0, 0.0, 2.0, 2.0, 0.0])?;
        let diamond = RotatedRect::try_from_cxcywha([0.0, 0.0, 2.0, 2.0, 45.0])?;

        // the overlap is a regular octagon with inradius 1
        let octagon = 8.0 * (std::f64::consts::PI / 8.0).tan();
        assert_abs_diff_eq!(
            square.intersection_area_with(&diamond),
            octagon,
            epsilon = 1e-9
        );
        Ok(())
    }

    #[test]
    fn rotated_degenerate() -> Result<()> {
        let lhs = RotatedRect::try_from_cxcywha([0.0, 0.0, 0.0, 4.0, 10.0])?;
        let rhs = RotatedRect::try_from_cxcywha([0.0, 0.0, 4.0, 4.0, 0.0])?;
        assert_eq!(lhs.iou_with(&rhs), 0.0);
        assert_eq!(rhs.to_unrotated().xyxy(), [-2.0, -2.0, 2.0, 2.0]);
        Ok(())
    }
}
