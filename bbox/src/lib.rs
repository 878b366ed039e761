//! Safe bounding box types and functions.
//!
//! Boxes are stored in absolute pixel coordinates. Axis-aligned boxes use
//! the `(x1, y1, x2, y2)` corner layout, rotated boxes use
//! `(cx, cy, w, h, angle)` with the angle in degrees, counter-clockwise.

mod common;

pub use rect::*;
pub mod rect;

pub use xyxy::*;
pub mod xyxy;

pub use rotated::*;
pub mod rotated;

pub use hw::*;
pub mod hw;

pub use transform::*;
mod transform;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
