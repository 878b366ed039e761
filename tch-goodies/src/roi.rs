//! Region of interest pooling kernels.
//!
//! Both kernels take a `[N, C, H, W]` feature tensor and `[R, 5]` regions in
//! `(batch_index, x1, y1, x2, y2)` format given in image coordinates, and
//! return `[R, C, out_h, out_w]` crops on the feature device.

use crate::{common::*, tensor::TensorExt};

struct FeatureMap {
    data: Vec<f32>,
    batch: i64,
    channels: i64,
    height: i64,
    width: i64,
}

impl FeatureMap {
    fn new(input: &Tensor) -> Result<Self> {
        let (batch, channels, height, width) = match input.size().as_slice() {
            &[n, c, h, w] => (n, c, h, w),
            shape => bail!("expect a [N, C, H, W] feature tensor, but get {:?}", shape),
        };
        Ok(Self {
            data: input.to_f32_vec()?,
            batch,
            channels,
            height,
            width,
        })
    }

    fn plane(&self, batch: i64, channel: i64) -> &[f32] {
        let size = (self.height * self.width) as usize;
        let start = ((batch * self.channels + channel) as usize) * size;
        &self.data[start..(start + size)]
    }

    fn at(plane: &[f32], width: i64, y: i64, x: i64) -> f32 {
        plane[(y * width + x) as usize]
    }

    /// Bilinear interpolation with zero outside `[-1, H] x [-1, W]`.
    fn bilinear(&self, plane: &[f32], y: f32, x: f32) -> f32 {
        let height = self.height;
        let width = self.width;
        if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
            return 0.0;
        }
        let y = y.max(0.0);
        let x = x.max(0.0);

        let (y_low, y_high, y) = match y as i64 {
            low if low >= height - 1 => (height - 1, height - 1, (height - 1) as f32),
            low => (low, low + 1, y),
        };
        let (x_low, x_high, x) = match x as i64 {
            low if low >= width - 1 => (width - 1, width - 1, (width - 1) as f32),
            low => (low, low + 1, x),
        };

        let ly = y - y_low as f32;
        let lx = x - x_low as f32;
        let hy = 1.0 - ly;
        let hx = 1.0 - lx;

        hy * hx * Self::at(plane, width, y_low, x_low)
            + hy * lx * Self::at(plane, width, y_low, x_high)
            + ly * hx * Self::at(plane, width, y_high, x_low)
            + ly * lx * Self::at(plane, width, y_high, x_high)
    }
}

fn parse_rois(input: &Tensor, rois: &Tensor, batch: i64) -> Result<Vec<[f32; 5]>> {
    input.ensure_same_device(rois)?;
    let num_rois = match rois.size().as_slice() {
        &[num, 5] => num,
        &[0] => 0,
        shape => bail!("expect [R, 5] regions, but get {:?}", shape),
    };
    let values = rois.to_f32_vec()?;
    let rois: Vec<[f32; 5]> = values
        .chunks(5)
        .map(|roi| [roi[0], roi[1], roi[2], roi[3], roi[4]])
        .collect();
    debug_assert_eq!(rois.len() as i64, num_rois);

    if let Some(roi) = rois
        .iter()
        .find(|roi| roi[0] < 0.0 || roi[0] as i64 >= batch)
    {
        bail!(
            "region batch index {} is out of range for {} feature maps",
            roi[0],
            batch
        );
    }
    Ok(rois)
}

fn finish(
    values: Vec<f32>,
    input: &Tensor,
    num_rois: usize,
    channels: i64,
    output_size: [i64; 2],
) -> Tensor {
    let [out_h, out_w] = output_size;
    Tensor::from_slice(&values)
        .view([num_rois as i64, channels, out_h, out_w])
        .to_kind(input.kind())
        .to_device(input.device())
}

/// Max pooling over quantized bins.
///
/// Region corners are rounded to the feature grid, bins are split with
/// floor/ceil and empty bins produce zero.
pub fn roi_pool(
    input: &Tensor,
    rois: &Tensor,
    spatial_scale: f64,
    output_size: [i64; 2],
) -> Result<Tensor> {
    let [out_h, out_w] = output_size;
    ensure!(out_h > 0 && out_w > 0, "output size must be positive");
    let features = FeatureMap::new(input)?;
    let rois = parse_rois(input, rois, features.batch)?;
    let scale = spatial_scale as f32;
    let FeatureMap {
        channels,
        height,
        width,
        ..
    } = features;

    let mut output = Vec::with_capacity(rois.len() * (channels * out_h * out_w) as usize);

    for &[batch_index, x1, y1, x2, y2] in &rois {
        let start_w = (x1 * scale).round() as i64;
        let start_h = (y1 * scale).round() as i64;
        let end_w = (x2 * scale).round() as i64;
        let end_h = (y2 * scale).round() as i64;

        let roi_w = (end_w - start_w + 1).max(1);
        let roi_h = (end_h - start_h + 1).max(1);
        let bin_h = roi_h as f32 / out_h as f32;
        let bin_w = roi_w as f32 / out_w as f32;

        for channel in 0..channels {
            let plane = features.plane(batch_index as i64, channel);

            for ph in 0..out_h {
                let h_start = ((ph as f32 * bin_h).floor() as i64 + start_h).clamp(0, height);
                let h_end = (((ph + 1) as f32 * bin_h).ceil() as i64 + start_h).clamp(0, height);

                for pw in 0..out_w {
                    let w_start = ((pw as f32 * bin_w).floor() as i64 + start_w).clamp(0, width);
                    let w_end =
                        (((pw + 1) as f32 * bin_w).ceil() as i64 + start_w).clamp(0, width);

                    let value = if h_end <= h_start || w_end <= w_start {
                        0.0
                    } else {
                        (h_start..h_end)
                            .flat_map(|y| (w_start..w_end).map(move |x| (y, x)))
                            .map(|(y, x)| FeatureMap::at(plane, width, y, x))
                            .fold(f32::MIN, f32::max)
                    };
                    output.push(value);
                }
            }
        }
    }

    Ok(finish(output, input, rois.len(), channels, output_size))
}

/// Average of bilinear samples taken on a regular grid inside each bin.
///
/// `sampling_ratio` samples are taken per bin side, or `ceil(roi / out)`
/// when it is not positive. With `aligned` the region is shifted by half a
/// pixel so that pixel centers sit on integer coordinates; without it,
/// regions are at least one feature pixel wide.
pub fn roi_align(
    input: &Tensor,
    rois: &Tensor,
    spatial_scale: f64,
    output_size: [i64; 2],
    sampling_ratio: i64,
    aligned: bool,
) -> Result<Tensor> {
    let [out_h, out_w] = output_size;
    ensure!(out_h > 0 && out_w > 0, "output size must be positive");
    let features = FeatureMap::new(input)?;
    let rois = parse_rois(input, rois, features.batch)?;
    let scale = spatial_scale as f32;
    let offset = if aligned { 0.5 } else { 0.0 };
    let channels = features.channels;

    let mut output = Vec::with_capacity(rois.len() * (channels * out_h * out_w) as usize);

    for &[batch_index, x1, y1, x2, y2] in &rois {
        let start_w = x1 * scale - offset;
        let start_h = y1 * scale - offset;
        let end_w = x2 * scale - offset;
        let end_h = y2 * scale - offset;

        let (roi_w, roi_h) = if aligned {
            (end_w - start_w, end_h - start_h)
        } else {
            ((end_w - start_w).max(1.0), (end_h - start_h).max(1.0))
        };
        let bin_h = roi_h / out_h as f32;
        let bin_w = roi_w / out_w as f32;

        let grid_h = if sampling_ratio > 0 {
            sampling_ratio
        } else {
            (roi_h / out_h as f32).ceil() as i64
        };
        let grid_w = if sampling_ratio > 0 {
            sampling_ratio
        } else {
            (roi_w / out_w as f32).ceil() as i64
        };
        let count = (grid_h * grid_w).max(1) as f32;

        for channel in 0..channels {
            let plane = features.plane(batch_index as i64, channel);

            for ph in 0..out_h {
                for pw in 0..out_w {
                    let mut sum = 0.0;
                    for iy in 0..grid_h {
                        let y = start_h
                            + ph as f32 * bin_h
                            + (iy as f32 + 0.5) * bin_h / grid_h as f32;
                        for ix in 0..grid_w {
                            let x = start_w
                                + pw as f32 * bin_w
                                + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                            sum += features.bilinear(plane, y, x);
                        }
                    }
                    output.push(sum / count);
                }
            }
        }
    }

    Ok(finish(output, input, rois.len(), channels, output_size))
}
