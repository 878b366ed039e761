//! Fixed-size feature crops of boxes from a feature pyramid.

use crate::common::*;
use tch_goodies::{roi_align, roi_pool};

/// The crop-and-resize kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolerType {
    /// Max pooling over quantized bins.
    RoiPool,
    /// Bilinear average pooling.
    RoiAlign,
    /// Bilinear average pooling with half-pixel aligned coordinates.
    RoiAlignV2,
}

#[derive(Debug, Clone)]
pub struct RoiPoolerInit {
    /// Output `[height, width]` of each crop.
    pub output_size: [i64; 2],
    /// `1 / stride` of each level, from fine to coarse.
    pub scales: Vec<R64>,
    /// Bilinear samples per bin side. Non-positive values adapt to the box size.
    pub sampling_ratio: i64,
    pub pooler_type: PoolerType,
    /// The box side that maps exactly onto `canonical_level`.
    pub canonical_box_size: i64,
    pub canonical_level: i64,
}

impl RoiPoolerInit {
    pub fn new(output_size: i64, scales: Vec<R64>) -> Self {
        Self {
            output_size: [output_size, output_size],
            scales,
            sampling_ratio: 0,
            pooler_type: PoolerType::RoiAlignV2,
            canonical_box_size: 224,
            canonical_level: 4,
        }
    }

    pub fn build(self) -> Result<RoiPooler> {
        let Self {
            output_size,
            scales,
            sampling_ratio,
            pooler_type,
            canonical_box_size,
            canonical_level,
        } = self;

        ensure!(
            output_size.iter().all(|&side| side > 0),
            "output_size must be positive, but get {:?}",
            output_size
        );
        ensure!(canonical_box_size > 0, "canonical_box_size must be positive");
        let (first, last) = match (scales.first(), scales.last()) {
            (Some(first), Some(last)) => (first.raw(), last.raw()),
            _ => bail!("at least one scale is required"),
        };
        ensure!(
            scales.iter().all(|&scale| scale > 0.0),
            "scales must be positive"
        );

        let level_of = |scale: f64| -> Result<i64> {
            let level = -scale.log2();
            ensure!(
                (level - level.round()).abs() < 1e-6,
                "the feature stride {} is not a power of 2",
                1.0 / scale
            );
            Ok(level.round() as i64)
        };
        let min_level = level_of(first)?;
        let max_level = level_of(last)?;
        ensure!(
            0 < min_level && min_level <= max_level,
            "expect levels in increasing order starting above 0, but get {} to {}",
            min_level,
            max_level
        );
        ensure!(
            scales.len() as i64 == max_level - min_level + 1,
            "the scales do not form a contiguous pyramid"
        );
        scales
            .iter()
            .enumerate()
            .try_for_each(|(index, &scale)| -> Result<_> {
                ensure!(
                    level_of(scale.raw())? == min_level + index as i64,
                    "the scales do not form a contiguous pyramid"
                );
                Ok(())
            })?;
        if scales.len() > 1 {
            ensure!(
                (min_level..=max_level).contains(&canonical_level),
                "canonical_level {} is out of range [{}, {}]",
                canonical_level,
                min_level,
                max_level
            );
        }

        Ok(RoiPooler {
            output_size,
            scales: scales.into_iter().map(|scale| scale.raw()).collect(),
            sampling_ratio,
            pooler_type,
            canonical_box_size,
            canonical_level,
            min_level,
            max_level,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoiPooler {
    output_size: [i64; 2],
    scales: Vec<f64>,
    sampling_ratio: i64,
    pooler_type: PoolerType,
    canonical_box_size: i64,
    canonical_level: i64,
    min_level: i64,
    max_level: i64,
}

impl RoiPooler {
    pub fn num_levels(&self) -> usize {
        self.scales.len()
    }

    pub fn output_size(&self) -> [i64; 2] {
        self.output_size
    }

    /// Crops the boxes of every image from `[N, C, H, W]` feature levels.
    ///
    /// `boxes` holds one box set per image. The output is
    /// `[R, C, out_h, out_w]`, where `R` counts the boxes of all images in
    /// input order.
    pub fn forward(&self, features: &[&Tensor], boxes: &[&Boxes]) -> Result<Tensor> {
        ensure!(
            features.len() == self.num_levels(),
            "expect {} feature levels, but get {}",
            self.num_levels(),
            features.len()
        );
        let (batch, channels, _, _) = features[0].size4()?;
        features.iter().try_for_each(|feature| -> Result<_> {
            feature.ensure_same_device(features[0])?;
            let (level_batch, level_channels, _, _) = feature.size4()?;
            ensure!(
                level_batch == batch && level_channels == channels,
                "feature levels must agree on batch size and channels"
            );
            Ok(())
        })?;
        ensure!(
            boxes.len() as i64 == batch,
            "expect box sets of {} images, but get {}",
            batch,
            boxes.len()
        );
        let device = features[0].device();
        let [out_h, out_w] = self.output_size;

        let rois = convert_boxes_to_pooler_format(boxes, device)?;
        let num_rois = rois.size()[0];
        if num_rois == 0 {
            return Ok(Tensor::zeros(
                [0, channels, out_h, out_w],
                (features[0].kind(), device),
            ));
        }

        if self.num_levels() == 1 {
            return self.pool(features[0], &rois, self.scales[0]);
        }

        let levels = assign_boxes_to_levels(
            boxes,
            self.min_level,
            self.max_level,
            self.canonical_box_size,
            self.canonical_level,
        )?;
        izip!(features, &self.scales).enumerate().try_fold(
            Tensor::zeros([num_rois, channels, out_h, out_w], (features[0].kind(), device)),
            |output, (level, (feature, &scale))| -> Result<_> {
                let indices = levels.eq(level as i64).nonzero().view([-1]);
                if indices.numel() == 0 {
                    return Ok(output);
                }
                let pooled = self.pool(feature, &rois.index_select(0, &indices), scale)?;
                Ok(output.index_copy(0, &indices, &pooled))
            },
        )
    }

    fn pool(&self, feature: &Tensor, rois: &Tensor, scale: f64) -> Result<Tensor> {
        match self.pooler_type {
            PoolerType::RoiPool => roi_pool(feature, rois, scale, self.output_size),
            PoolerType::RoiAlign => roi_align(
                feature,
                rois,
                scale,
                self.output_size,
                self.sampling_ratio,
                false,
            ),
            PoolerType::RoiAlignV2 => roi_align(
                feature,
                rois,
                scale,
                self.output_size,
                self.sampling_ratio,
                true,
            ),
        }
    }
}

/// The pyramid level of each box, relative to `min_level`.
///
/// A box of side `canonical_box_size` maps onto `canonical_level`, and
/// every doubling of the side moves one level up. Levels are clamped into
/// `[min_level, max_level]`.
pub fn assign_boxes_to_levels(
    boxes: &[&Boxes],
    min_level: i64,
    max_level: i64,
    canonical_box_size: i64,
    canonical_level: i64,
) -> Result<Tensor> {
    ensure!(!boxes.is_empty(), "at least one box set is required");
    let sizes: Vec<Tensor> = boxes.iter().map(|boxes| boxes.area().sqrt()).collect();
    let sizes = Tensor::cat(&sizes, 0);

    let levels = ((sizes / canonical_box_size as f64 + 1e-8).log2() + canonical_level as f64)
        .floor()
        .clamp(min_level as f64, max_level as f64);
    Ok(levels.to_kind(Kind::Int64) - min_level)
}

/// Concatenates the boxes of all images into `[R, 5]` `(image_index, x1, y1, x2, y2)` rows.
pub fn convert_boxes_to_pooler_format(boxes: &[&Boxes], device: Device) -> Result<Tensor> {
    let rows: Vec<Tensor> = boxes
        .iter()
        .enumerate()
        .map(|(index, boxes)| -> Result<_> {
            ensure!(
                boxes.device() == device,
                BoxError::DeviceMismatch {
                    expected: device,
                    found: boxes.device(),
                }
            );
            let tensor = boxes.tensor().to_kind(Kind::Float);
            let indices = Tensor::full([boxes.len(), 1], index as i64, (Kind::Float, device));
            Ok(Tensor::cat(&[indices, tensor], 1))
        })
        .try_collect()?;

    if rows.is_empty() {
        return Ok(Tensor::zeros([0, 5], (Kind::Float, device)));
    }
    Ok(Tensor::cat(&rows, 0))
}
