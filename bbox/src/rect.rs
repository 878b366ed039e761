use super::{HW, XYXY};
use crate::common::*;

/// The generic axis-aligned rectangle.
pub trait Rect {
    type Type;

    fn x1(&self) -> Self::Type;
    fn y1(&self) -> Self::Type;
    fn x2(&self) -> Self::Type;
    fn y2(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn w(&self) -> Self::Type;
    fn h(&self) -> Self::Type;

    fn try_from_xyxy(xyxy: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cxcywh(cxcywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn xyxy(&self) -> [Self::Type; 4] {
        [self.x1(), self.y1(), self.x2(), self.y2()]
    }

    fn cxcywh(&self) -> [Self::Type; 4] {
        [self.cx(), self.cy(), self.w(), self.h()]
    }

    fn to_xyxy(&self) -> XYXY<Self::Type> {
        XYXY {
            x1: self.x1(),
            y1: self.y1(),
            x2: self.x2(),
            y2: self.y2(),
        }
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.w() * self.h()
    }

    /// True iff both sides are strictly longer than `threshold`.
    fn is_nonempty(&self, threshold: Self::Type) -> bool {
        self.w() > threshold && self.h() > threshold
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    fn intersect_with<R>(&self, other: &R) -> Option<XYXY<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let x1 = self.x1().max(other.x1());
        let y1 = self.y1().max(other.y1());
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        (x2 > x1 && y2 > y1).then_some(XYXY { x1, y1, x2, y2 })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    /// Intersection over union, zero when the boxes do not overlap.
    fn iou_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        if inter_area <= Self::Type::zero() {
            return Self::Type::zero();
        }
        let union_area = self.area() + other.w() * other.h() - inter_area;
        inter_area / union_area
    }

    /// Intersection over the area of `other`, zero when the boxes do not overlap.
    fn ioa_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        if inter_area <= Self::Type::zero() {
            return Self::Type::zero();
        }
        inter_area / (other.w() * other.h())
    }

    /// Clamps the corners into `[0, w] x [0, h]`.
    fn clip_to(&self, size: &HW<Self::Type>) -> XYXY<Self::Type> {
        let zero = Self::Type::zero();
        let clamp = |value: Self::Type, max: Self::Type| value.max(zero).min(max);
        XYXY {
            x1: clamp(self.x1(), size.w()),
            y1: clamp(self.y1(), size.h()),
            x2: clamp(self.x2(), size.w()),
            y2: clamp(self.y2(), size.h()),
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rect_iou_symmetric() -> Result<()> {
        let lhs = XYXY::try_from_xyxy([0.0, 0.0, 10.0, 10.0])?;
        let rhs = XYXY::try_from_xyxy([5.0, 0.0, 15.0, 10.0])?;

        assert_abs_diff_eq!(lhs.iou_with(&rhs), 50.0 / 150.0);
        assert_abs_diff_eq!(lhs.iou_with(&rhs), rhs.iou_with(&lhs));
        assert_abs_diff_eq!(lhs.iou_with(&lhs), 1.0);
        Ok(())
    }

    #[test]
    fn rect_disjoint() -> Result<()> {
        let lhs = XYXY::try_from_xyxy([0.0, 0.0, 1.0, 1.0])?;
        let rhs = XYXY::try_from_xyxy([2.0, 2.0, 3.0, 3.0])?;
        let empty = XYXY::try_from_xyxy([2.0, 2.0, 2.0, 2.0])?;

        assert!(lhs.intersect_with(&rhs).is_none());
        assert_eq!(lhs.iou_with(&rhs), 0.0);
        assert_eq!(lhs.ioa_with(&empty), 0.0);
        assert!(!empty.is_nonempty(0.0));
        Ok(())
    }

    #[test]
    fn rect_ioa() -> Result<()> {
        let outer = XYXY::try_from_xyxy([0.0, 0.0, 10.0, 10.0])?;
        let inner = XYXY::try_from_xyxy([2.0, 2.0, 4.0, 4.0])?;

        assert_abs_diff_eq!(outer.ioa_with(&inner), 1.0);
        assert_abs_diff_eq!(inner.ioa_with(&outer), 0.04);
        Ok(())
    }

    #[test]
    fn rect_clip() -> Result<()> {
        let rect = XYXY::try_from_xyxy([-5.0, 3.0, 40.0, 50.0])?;
        let size = HW::try_from_hw([20.0, 30.0])?;
        assert_eq!(rect.clip_to(&size).xyxy(), [0.0, 3.0, 30.0, 20.0]);
        Ok(())
    }
}
