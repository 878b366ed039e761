//! Serializable model configuration.

use crate::{
    anchor::{AnchorGeneratorInit, RotatedAnchorGeneratorInit},
    box_transform::Box2BoxTransformInit,
    common::*,
    model::{GeneralizedRcnnInit, ProposalNetworkInit},
    norm::NormKind,
    pooler::PoolerType,
    roi_heads::RoiHeadsInit,
    rpn::RpnInit,
};

/// The configuration of a two-stage detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub test: TestConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        Self::from_json5_str(&text)
    }

    pub fn from_json5_str(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)?;
        info!(
            "loaded a detector config with {} classes",
            config.model.roi_heads.num_classes
        );
        Ok(config)
    }

    /// Anchor generator over the levels of the given strides.
    pub fn anchor_generator_init(&self, strides: Vec<i64>) -> AnchorGeneratorInit {
        let AnchorGeneratorConfig {
            sizes,
            aspect_ratios,
            offset,
            ..
        } = self.model.anchor_generator.clone();
        AnchorGeneratorInit {
            sizes,
            aspect_ratios,
            strides,
            offset,
        }
    }

    pub fn rotated_anchor_generator_init(&self, strides: Vec<i64>) -> RotatedAnchorGeneratorInit {
        let AnchorGeneratorConfig {
            sizes,
            aspect_ratios,
            angles,
            offset,
        } = self.model.anchor_generator.clone();
        RotatedAnchorGeneratorInit {
            sizes,
            aspect_ratios,
            angles,
            strides,
            offset,
        }
    }

    pub fn rpn_box_transform_init(&self) -> Box2BoxTransformInit {
        Box2BoxTransformInit::new(self.model.rpn.bbox_reg_weights.map(|weight| weight.raw()))
    }

    pub fn rpn_init(&self) -> RpnInit {
        let ProposalGeneratorConfig {
            min_size,
            hid_channels,
        } = self.model.proposal_generator;
        let RpnConfig {
            ref in_features,
            ref iou_thresholds,
            ref iou_labels,
            batch_size_per_image,
            positive_fraction,
            smooth_l1_beta,
            loss_weight,
            nms_thresh,
            pre_nms_topk_train,
            pre_nms_topk_test,
            post_nms_topk_train,
            post_nms_topk_test,
            boundary_thresh,
            head_norm,
            ..
        } = self.model.rpn;

        RpnInit {
            in_features: in_features.clone(),
            iou_thresholds: iou_thresholds.clone(),
            iou_labels: iou_labels.clone(),
            batch_size_per_image,
            positive_fraction,
            smooth_l1_beta,
            loss_weight,
            nms_thresh,
            pre_nms_topk_train,
            pre_nms_topk_test,
            post_nms_topk_train,
            post_nms_topk_test,
            min_box_side_len: min_size,
            boundary_thresh,
            hid_channels,
            head_norm,
        }
    }

    pub fn roi_heads_init(&self) -> RoiHeadsInit {
        let RoiHeadsConfig {
            num_classes,
            ref in_features,
            ref iou_thresholds,
            ref iou_labels,
            batch_size_per_image,
            positive_fraction,
            score_thresh_test,
            nms_thresh_test,
            proposal_append_gt,
        } = self.model.roi_heads;
        let RoiBoxHeadConfig {
            bbox_reg_weights,
            smooth_l1_beta,
            pooler_resolution,
            pooler_sampling_ratio,
            pooler_type,
            cls_agnostic_bbox_reg,
            canonical_box_size,
            canonical_level,
            num_attrs,
        } = self.model.roi_box_head;

        RoiHeadsInit {
            num_classes,
            in_features: in_features.clone(),
            iou_thresholds: iou_thresholds.clone(),
            iou_labels: iou_labels.clone(),
            batch_size_per_image,
            positive_fraction,
            score_thresh: score_thresh_test,
            nms_thresh: nms_thresh_test,
            detections_per_image: self.test.detections_per_image,
            proposal_append_gt,
            bbox_reg_weights,
            smooth_l1_beta,
            cls_agnostic_bbox_reg,
            num_attrs,
            pooler_resolution,
            pooler_sampling_ratio,
            pooler_type,
            canonical_box_size,
            canonical_level,
        }
    }

    /// The whole detector. Anchor strides are taken from the backbone shapes at build time.
    pub fn generalized_rcnn_init(&self) -> GeneralizedRcnnInit {
        GeneralizedRcnnInit {
            anchor_generator: self.anchor_generator_init(vec![]),
            rpn_box_transform: self.rpn_box_transform_init(),
            rpn: self.rpn_init(),
            roi_heads: self.roi_heads_init(),
        }
    }

    /// The RPN-only detector. Anchor strides are taken from the backbone shapes at build time.
    pub fn proposal_network_init(&self) -> ProposalNetworkInit {
        ProposalNetworkInit {
            anchor_generator: self.anchor_generator_init(vec![]),
            rpn_box_transform: self.rpn_box_transform_init(),
            rpn: self.rpn_init(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub anchor_generator: AnchorGeneratorConfig,
    #[serde(default)]
    pub proposal_generator: ProposalGeneratorConfig,
    #[serde(default)]
    pub rpn: RpnConfig,
    #[serde(default)]
    pub roi_heads: RoiHeadsConfig,
    #[serde(default)]
    pub roi_box_head: RoiBoxHeadConfig,
}

/// Anchor shapes, one list per level or a single list shared by all levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorGeneratorConfig {
    pub sizes: Vec<Vec<R64>>,
    pub aspect_ratios: Vec<Vec<R64>>,
    /// Angles in degrees, only used by rotated anchors.
    pub angles: Vec<Vec<R64>>,
    /// Relative offset of the anchor centers within a cell, in `[0, 1)`.
    pub offset: R64,
}

impl Default for AnchorGeneratorConfig {
    fn default() -> Self {
        let AnchorGeneratorInit {
            sizes,
            aspect_ratios,
            offset,
            ..
        } = AnchorGeneratorInit::new(vec![]);
        let RotatedAnchorGeneratorInit { angles, .. } = RotatedAnchorGeneratorInit::new(vec![]);
        Self {
            sizes,
            aspect_ratios,
            angles,
            offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalGeneratorConfig {
    /// Proposals with a side not longer than this are dropped.
    pub min_size: R64,
    pub hid_channels: Option<i64>,
}

impl Default for ProposalGeneratorConfig {
    fn default() -> Self {
        let RpnInit {
            min_box_side_len,
            hid_channels,
            ..
        } = RpnInit::default();
        Self {
            min_size: min_box_side_len,
            hid_channels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpnConfig {
    pub in_features: Vec<String>,
    pub iou_thresholds: Vec<R64>,
    pub iou_labels: Vec<i64>,
    pub batch_size_per_image: i64,
    pub positive_fraction: R64,
    pub bbox_reg_weights: [R64; 4],
    pub smooth_l1_beta: R64,
    pub loss_weight: R64,
    pub nms_thresh: R64,
    pub pre_nms_topk_train: i64,
    pub pre_nms_topk_test: i64,
    pub post_nms_topk_train: i64,
    pub post_nms_topk_test: i64,
    /// Negative values disable the border check of anchors.
    pub boundary_thresh: i64,
    pub head_norm: Option<NormKind>,
}

impl Default for RpnConfig {
    fn default() -> Self {
        let RpnInit {
            in_features,
            iou_thresholds,
            iou_labels,
            batch_size_per_image,
            positive_fraction,
            smooth_l1_beta,
            loss_weight,
            nms_thresh,
            pre_nms_topk_train,
            pre_nms_topk_test,
            post_nms_topk_train,
            post_nms_topk_test,
            boundary_thresh,
            head_norm,
            ..
        } = RpnInit::default();
        Self {
            in_features,
            iou_thresholds,
            iou_labels,
            batch_size_per_image,
            positive_fraction,
            bbox_reg_weights: [r64(1.0); 4],
            smooth_l1_beta,
            loss_weight,
            nms_thresh,
            pre_nms_topk_train,
            pre_nms_topk_test,
            post_nms_topk_train,
            post_nms_topk_test,
            boundary_thresh,
            head_norm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiHeadsConfig {
    pub num_classes: i64,
    pub in_features: Vec<String>,
    pub iou_thresholds: Vec<R64>,
    pub iou_labels: Vec<i64>,
    pub batch_size_per_image: i64,
    pub positive_fraction: R64,
    pub score_thresh_test: R64,
    pub nms_thresh_test: R64,
    pub proposal_append_gt: bool,
}

impl Default for RoiHeadsConfig {
    fn default() -> Self {
        let RoiHeadsInit {
            num_classes,
            in_features,
            iou_thresholds,
            iou_labels,
            batch_size_per_image,
            positive_fraction,
            score_thresh,
            nms_thresh,
            proposal_append_gt,
            ..
        } = RoiHeadsInit::new(80);
        Self {
            num_classes,
            in_features,
            iou_thresholds,
            iou_labels,
            batch_size_per_image,
            positive_fraction,
            score_thresh_test: score_thresh,
            nms_thresh_test: nms_thresh,
            proposal_append_gt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiBoxHeadConfig {
    pub bbox_reg_weights: [R64; 4],
    pub smooth_l1_beta: R64,
    pub pooler_resolution: i64,
    /// Non-positive values pick the bilinear sample count from the box size.
    pub pooler_sampling_ratio: i64,
    pub pooler_type: PoolerType,
    pub cls_agnostic_bbox_reg: bool,
    pub canonical_box_size: i64,
    pub canonical_level: i64,
    pub num_attrs: Option<i64>,
}

impl Default for RoiBoxHeadConfig {
    fn default() -> Self {
        let RoiHeadsInit {
            bbox_reg_weights,
            smooth_l1_beta,
            pooler_resolution,
            pooler_sampling_ratio,
            pooler_type,
            cls_agnostic_bbox_reg,
            canonical_box_size,
            canonical_level,
            num_attrs,
            ..
        } = RoiHeadsInit::new(80);
        Self {
            bbox_reg_weights,
            smooth_l1_beta,
            pooler_resolution,
            pooler_sampling_ratio,
            pooler_type,
            cls_agnostic_bbox_reg,
            canonical_box_size,
            canonical_level,
            num_attrs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Detections kept per image. A negative value keeps all of them.
    pub detections_per_image: i64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            detections_per_image: RoiHeadsInit::new(80).detections_per_image,
        }
    }
}
