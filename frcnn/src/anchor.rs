//! Dense anchor generation over feature pyramid levels.

use crate::common::*;

/// Produces per-level anchors for a list of feature maps.
pub trait GenerateAnchors {
    type Boxes: BoxSet;

    fn num_levels(&self) -> usize;

    /// The number of anchors placed at each grid cell, per level.
    fn num_cell_anchors(&self) -> Vec<i64>;

    /// Tiles the cell anchors over `[height, width]` grids, one per level.
    ///
    /// Each level yields `height * width * A` boxes ordered by grid row, then
    /// grid column, then cell anchor.
    fn grid_anchors(&self, grid_sizes: &[[i64; 2]], device: Device) -> Result<Vec<Self::Boxes>>;

    /// Anchors of `[N, C, H, W]` feature maps, shared by every image of the batch.
    fn forward(&self, features: &[&Tensor]) -> Result<Vec<Self::Boxes>> {
        ensure!(
            features.len() == self.num_levels(),
            "expect {} feature levels, but get {}",
            self.num_levels(),
            features.len()
        );
        let device = match features.first() {
            Some(feature) => feature.device(),
            None => return Ok(vec![]),
        };
        let grid_sizes: Vec<[i64; 2]> = features
            .iter()
            .map(|feature| -> Result<_> {
                feature.ensure_same_device(features[0])?;
                match feature.size().as_slice() {
                    &[_, _, height, width] => Ok([height, width]),
                    shape => bail!("expect a [N, C, H, W] feature map, but get {:?}", shape),
                }
            })
            .try_collect()?;
        self.grid_anchors(&grid_sizes, device)
    }
}

/// Repeats a single-level parameter list for every level.
fn broadcast_params<T: Clone>(params: Vec<Vec<T>>, num_levels: usize, name: &str) -> Result<Vec<Vec<T>>> {
    match params.len() {
        1 => Ok(vec![params[0].clone(); num_levels]),
        len if len == num_levels => Ok(params),
        len => bail!(
            "{} has {} levels, but the generator has {} levels",
            name,
            len,
            num_levels
        ),
    }
}

fn check_common(strides: &[i64], offset: R64) -> Result<()> {
    ensure!(!strides.is_empty(), "at least one feature level is required");
    ensure!(strides.iter().all(|&stride| stride > 0), "strides must be positive");
    ensure!(
        (0.0..1.0).contains(&offset.raw()),
        "offset must be in range [0, 1), but get {}",
        offset
    );
    Ok(())
}

/// `(w, h)` of the cell anchor with area `size²` and height/width ratio `ratio`.
fn cell_size(size: f64, ratio: f64) -> (f64, f64) {
    let width = (size * size / ratio).sqrt();
    (width, width * ratio)
}

/// Grid cell origins of one level as `[H * W]` x and y offsets.
fn grid_shifts(grid_size: [i64; 2], stride: i64, offset: f64, device: Device) -> (Tensor, Tensor) {
    let [height, width] = grid_size;
    let stride = stride as f64;
    let shifts_x = Tensor::arange(width, (Kind::Float, device)) * stride + offset * stride;
    let shifts_y = Tensor::arange(height, (Kind::Float, device)) * stride + offset * stride;
    let shift_x = shifts_x
        .unsqueeze(0)
        .expand([height, width], false)
        .reshape([-1]);
    let shift_y = shifts_y
        .unsqueeze(1)
        .expand([height, width], false)
        .reshape([-1]);
    (shift_x, shift_y)
}

#[derive(Debug, Clone)]
pub struct AnchorGeneratorInit {
    /// Anchor sizes in pixels, either one list for all levels or one list per level.
    pub sizes: Vec<Vec<R64>>,
    /// Height/width ratios, broadcast like `sizes`.
    pub aspect_ratios: Vec<Vec<R64>>,
    /// Feature strides, one per level.
    pub strides: Vec<i64>,
    /// Relative offset of the first anchor center within a grid cell.
    pub offset: R64,
}

impl AnchorGeneratorInit {
    pub fn new(strides: Vec<i64>) -> Self {
        Self {
            sizes: vec![[32.0, 64.0, 128.0, 256.0, 512.0].iter().map(|&size| r64(size)).collect()],
            aspect_ratios: vec![vec![r64(0.5), r64(1.0), r64(2.0)]],
            strides,
            offset: r64(0.0),
        }
    }

    pub fn build(self) -> Result<AnchorGenerator> {
        let Self {
            sizes,
            aspect_ratios,
            strides,
            offset,
        } = self;
        check_common(&strides, offset)?;
        let num_levels = strides.len();
        let sizes = broadcast_params(sizes, num_levels, "sizes")?;
        let aspect_ratios = broadcast_params(aspect_ratios, num_levels, "aspect_ratios")?;

        let cell_anchors: Vec<Vec<f32>> = izip!(&sizes, &aspect_ratios)
            .map(|(sizes, ratios)| -> Result<_> {
                ensure!(
                    !sizes.is_empty() && !ratios.is_empty(),
                    "every level needs at least one size and one aspect ratio"
                );
                ensure!(
                    sizes.iter().chain(ratios).all(|&value| value > 0.0),
                    "anchor sizes and aspect ratios must be positive"
                );
                let values = sizes
                    .iter()
                    .cartesian_product(ratios)
                    .flat_map(|(size, ratio)| {
                        let (w, h) = cell_size(size.raw(), ratio.raw());
                        [-w / 2.0, -h / 2.0, w / 2.0, h / 2.0].map(|v| v as f32)
                    })
                    .collect();
                Ok(values)
            })
            .try_collect()?;

        Ok(AnchorGenerator {
            cell_anchors,
            strides,
            offset: offset.raw(),
        })
    }
}

/// Axis-aligned anchors centered on a regular grid.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    /// Flattened `[A, 4]` zero-centered cell anchors per level.
    cell_anchors: Vec<Vec<f32>>,
    strides: Vec<i64>,
    offset: f64,
}

impl GenerateAnchors for AnchorGenerator {
    type Boxes = Boxes;

    fn num_levels(&self) -> usize {
        self.strides.len()
    }

    fn num_cell_anchors(&self) -> Vec<i64> {
        self.cell_anchors
            .iter()
            .map(|cells| cells.len() as i64 / 4)
            .collect()
    }

    fn grid_anchors(&self, grid_sizes: &[[i64; 2]], device: Device) -> Result<Vec<Boxes>> {
        ensure!(
            grid_sizes.len() == self.num_levels(),
            "expect {} grid sizes, but get {}",
            self.num_levels(),
            grid_sizes.len()
        );
        izip!(grid_sizes, &self.strides, &self.cell_anchors)
            .map(|(&grid_size, &stride, cells)| {
                let cells = Tensor::from_slice(cells).to_device(device).view([1, -1, 4]);
                let (shift_x, shift_y) = grid_shifts(grid_size, stride, self.offset, device);
                let shifts = Tensor::stack(&[&shift_x, &shift_y, &shift_x, &shift_y], 1);
                let anchors = (shifts.view([-1, 1, 4]) + cells).reshape([-1, 4]);
                Boxes::from_tensor(anchors)
            })
            .try_collect()
    }
}

#[derive(Debug, Clone)]
pub struct RotatedAnchorGeneratorInit {
    pub sizes: Vec<Vec<R64>>,
    pub aspect_ratios: Vec<Vec<R64>>,
    /// Anchor angles in degrees, broadcast like `sizes`.
    pub angles: Vec<Vec<R64>>,
    pub strides: Vec<i64>,
    pub offset: R64,
}

impl RotatedAnchorGeneratorInit {
    pub fn new(strides: Vec<i64>) -> Self {
        let AnchorGeneratorInit {
            sizes,
            aspect_ratios,
            offset,
            ..
        } = AnchorGeneratorInit::new(vec![]);
        Self {
            sizes,
            aspect_ratios,
            angles: vec![[-90.0, 0.0, 90.0].iter().map(|&angle| r64(angle)).collect()],
            strides,
            offset,
        }
    }

    pub fn build(self) -> Result<RotatedAnchorGenerator> {
        let Self {
            sizes,
            aspect_ratios,
            angles,
            strides,
            offset,
        } = self;
        check_common(&strides, offset)?;
        let num_levels = strides.len();
        let sizes = broadcast_params(sizes, num_levels, "sizes")?;
        let aspect_ratios = broadcast_params(aspect_ratios, num_levels, "aspect_ratios")?;
        let angles = broadcast_params(angles, num_levels, "angles")?;

        let cell_anchors: Vec<Vec<f32>> = izip!(&sizes, &aspect_ratios, &angles)
            .map(|(sizes, ratios, angles)| -> Result<_> {
                ensure!(
                    !sizes.is_empty() && !ratios.is_empty() && !angles.is_empty(),
                    "every level needs at least one size, aspect ratio and angle"
                );
                ensure!(
                    sizes.iter().chain(ratios).all(|&value| value > 0.0),
                    "anchor sizes and aspect ratios must be positive"
                );
                let values = cell_params(sizes, ratios, angles)
                    .flat_map(|(size, ratio, angle)| {
                        let (w, h) = cell_size(size.raw(), ratio.raw());
                        [0.0, 0.0, w, h, angle.raw()].map(|v| v as f32)
                    })
                    .collect();
                Ok(values)
            })
            .try_collect()?;

        Ok(RotatedAnchorGenerator {
            cell_anchors,
            strides,
            offset: offset.raw(),
        })
    }
}

fn cell_params<'a>(
    sizes: &'a [R64],
    ratios: &'a [R64],
    angles: &'a [R64],
) -> impl Iterator<Item = (&'a R64, &'a R64, &'a R64)> {
    sizes
        .iter()
        .cartesian_product(ratios)
        .cartesian_product(angles)
        .map(|((size, ratio), angle)| (size, ratio, angle))
}

/// Rotated anchors in `(cx, cy, w, h, angle)` format centered on a regular grid.
#[derive(Debug, Clone)]
pub struct RotatedAnchorGenerator {
    /// Flattened `[A, 5]` cell anchors per level.
    cell_anchors: Vec<Vec<f32>>,
    strides: Vec<i64>,
    offset: f64,
}

impl GenerateAnchors for RotatedAnchorGenerator {
    type Boxes = RotatedBoxes;

    fn num_levels(&self) -> usize {
        self.strides.len()
    }

    fn num_cell_anchors(&self) -> Vec<i64> {
        self.cell_anchors
            .iter()
            .map(|cells| cells.len() as i64 / 5)
            .collect()
    }

    fn grid_anchors(&self, grid_sizes: &[[i64; 2]], device: Device) -> Result<Vec<RotatedBoxes>> {
        ensure!(
            grid_sizes.len() == self.num_levels(),
            "expect {} grid sizes, but get {}",
            self.num_levels(),
            grid_sizes.len()
        );
        izip!(grid_sizes, &self.strides, &self.cell_anchors)
            .map(|(&grid_size, &stride, cells)| {
                let cells = Tensor::from_slice(cells).to_device(device).view([1, -1, 5]);
                let (shift_x, shift_y) = grid_shifts(grid_size, stride, self.offset, device);
                let zeros = shift_x.zeros_like();
                let shifts = Tensor::stack(&[&shift_x, &shift_y, &zeros, &zeros, &zeros], 1);
                let anchors = (shifts.view([-1, 1, 5]) + cells).reshape([-1, 5]);
                RotatedBoxes::from_tensor(anchors)
            })
            .try_collect()
    }
}
