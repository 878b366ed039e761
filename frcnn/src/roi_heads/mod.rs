//! Second stage heads refining proposals into per-class detections.

mod box_head;
mod fast_rcnn;
mod inference;

pub use box_head::*;
pub use fast_rcnn::*;
pub use inference::*;

use crate::{
    box_transform::{Box2BoxTransform, Box2BoxTransformInit},
    common::*,
    instances::{Detections, Proposals, Targets},
    matcher::{Matcher, MatcherInit},
    pooler::{PoolerType, RoiPooler, RoiPoolerInit},
    sampling::subsample_labels,
    shape::{select_features, select_shapes, ShapeSpec},
};

#[derive(Debug, Clone)]
pub struct RoiHeadsInit {
    /// Foreground classes.
    pub num_classes: i64,
    pub in_features: Vec<String>,
    pub iou_thresholds: Vec<R64>,
    pub iou_labels: Vec<i64>,
    /// Sampled proposals per image for the training losses.
    pub batch_size_per_image: i64,
    pub positive_fraction: R64,
    pub score_thresh: R64,
    pub nms_thresh: R64,
    /// Detections kept per image. A negative value keeps all of them.
    pub detections_per_image: i64,
    /// Adds the ground truth boxes to the proposals in training mode.
    pub proposal_append_gt: bool,
    pub bbox_reg_weights: [R64; 4],
    pub smooth_l1_beta: R64,
    pub cls_agnostic_bbox_reg: bool,
    pub num_attrs: Option<i64>,
    pub pooler_resolution: i64,
    pub pooler_sampling_ratio: i64,
    pub pooler_type: PoolerType,
    pub canonical_box_size: i64,
    pub canonical_level: i64,
}

impl RoiHeadsInit {
    pub fn new(num_classes: i64) -> Self {
        Self {
            num_classes,
            in_features: vec!["res4".into()],
            iou_thresholds: vec![r64(0.5)],
            iou_labels: vec![0, 1],
            batch_size_per_image: 512,
            positive_fraction: r64(0.25),
            score_thresh: r64(0.05),
            nms_thresh: r64(0.5),
            detections_per_image: 100,
            proposal_append_gt: true,
            bbox_reg_weights: [r64(10.0), r64(10.0), r64(5.0), r64(5.0)],
            smooth_l1_beta: r64(0.0),
            cls_agnostic_bbox_reg: false,
            num_attrs: None,
            pooler_resolution: 14,
            pooler_sampling_ratio: 0,
            pooler_type: PoolerType::RoiAlignV2,
            canonical_box_size: 224,
            canonical_level: 4,
        }
    }

    pub fn build<'p, H>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &HashMap<String, ShapeSpec>,
        box_head: H,
    ) -> Result<RoiHeads<H>>
    where
        H: BoxHead,
    {
        let path = path.borrow();
        let Self {
            num_classes,
            in_features,
            iou_thresholds,
            iou_labels,
            batch_size_per_image,
            positive_fraction,
            score_thresh,
            nms_thresh,
            detections_per_image,
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
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(batch_size_per_image > 0, "batch_size_per_image must be positive");
        ensure!(
            (0.0..=1.0).contains(&positive_fraction.raw()),
            "positive_fraction must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&score_thresh.raw()),
            "score_thresh must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&nms_thresh.raw()),
            "nms_thresh must be in range [0, 1]"
        );
        ensure!(smooth_l1_beta >= 0.0, "smooth_l1_beta must be non-negative");

        let shapes = select_shapes(input_shapes, &in_features)?;
        let in_channels = shapes[0].channels;
        ensure!(
            shapes.iter().all(|shape| shape.channels == in_channels),
            "every input feature of the ROI heads must have the same number of channels"
        );
        let scales: Vec<R64> = shapes
            .iter()
            .map(|shape| -> Result<_> {
                ensure!(shape.stride > 0, "feature strides must be positive");
                Ok(r64(1.0 / shape.stride as f64))
            })
            .try_collect()?;

        let pooler = RoiPoolerInit {
            sampling_ratio: pooler_sampling_ratio,
            pooler_type,
            canonical_box_size,
            canonical_level,
            ..RoiPoolerInit::new(pooler_resolution, scales)
        }
        .build()?;
        let input_size = box_head.output_size(in_channels, pooler.output_size());
        let box_predictor = FastRcnnOutputLayersInit {
            cls_agnostic_bbox_reg,
            num_attrs,
            ..FastRcnnOutputLayersInit::new(input_size, num_classes)
        }
        .build(path / "box_predictor")?;
        let box_transform = Box2BoxTransformInit::new(bbox_reg_weights.map(|weight| weight.raw())).build()?;
        let proposal_matcher = MatcherInit {
            thresholds: iou_thresholds,
            labels: iou_labels,
            allow_low_quality_matches: false,
        }
        .build()?;

        Ok(RoiHeads {
            in_features,
            pooler,
            box_head,
            box_predictor,
            box_transform,
            proposal_matcher,
            num_classes,
            batch_size_per_image,
            positive_fraction: positive_fraction.raw(),
            proposal_append_gt,
            smooth_l1_beta: smooth_l1_beta.raw(),
            inference_params: InferenceParams {
                score_thresh: score_thresh.raw(),
                nms_thresh: nms_thresh.raw(),
                topk_per_image: detections_per_image,
            },
        })
    }
}

/// Sampled proposals of one image with their training targets.
#[derive(Debug, Getters)]
pub struct SampledProposals {
    #[get = "pub"]
    proposals: Proposals<Boxes>,
    /// Class ids in `[0, K]`, where `K` stands for background.
    #[get = "pub"]
    gt_classes: Tensor,
    /// The matched ground truth box of each proposal.
    #[get = "pub"]
    gt_boxes: Boxes,
}

/// The result of [RoiHeads::forward_t].
#[derive(Debug)]
pub enum RoiHeadsOutput {
    Detections(Vec<Detections>),
    Losses(FastRcnnLosses),
}

#[derive(Debug, Getters)]
pub struct RoiHeads<H> {
    #[get = "pub"]
    in_features: Vec<String>,
    #[get = "pub"]
    pooler: RoiPooler,
    #[get = "pub"]
    box_head: H,
    #[get = "pub"]
    box_predictor: FastRcnnOutputLayers,
    #[get = "pub"]
    box_transform: Box2BoxTransform,
    proposal_matcher: Matcher,
    #[get = "pub"]
    num_classes: i64,
    batch_size_per_image: i64,
    positive_fraction: f64,
    proposal_append_gt: bool,
    smooth_l1_beta: f64,
    inference_params: InferenceParams,
}

impl<H> RoiHeads<H>
where
    H: BoxHead,
{
    /// Detects objects in the proposals, or computes the losses in training mode.
    ///
    /// `features` are the `[N, C, H, W]` maps of the N images the proposals
    /// belong to. Ground truth is required in training mode.
    pub fn forward_t(
        &self,
        features: &HashMap<String, Tensor>,
        proposals: Vec<Proposals<Boxes>>,
        targets: Option<&[Targets]>,
        train: bool,
    ) -> Result<RoiHeadsOutput> {
        let output = if train {
            let targets =
                targets.ok_or_else(|| format_err!("ground truth is required in training mode"))?;
            RoiHeadsOutput::Losses(self.losses(features, proposals, targets)?)
        } else {
            RoiHeadsOutput::Detections(self.inference(features, proposals)?)
        };
        Ok(output)
    }

    /// Samples the proposals against the ground truth and computes the second stage losses.
    pub fn losses(
        &self,
        features: &HashMap<String, Tensor>,
        proposals: Vec<Proposals<Boxes>>,
        targets: &[Targets],
    ) -> Result<FastRcnnLosses> {
        let features = select_features(features, &self.in_features)?;
        let sampled = self.label_and_sample_proposals(proposals, targets)?;
        let proposals = sampled.iter().map(|sampled| &sampled.proposals).collect_vec();

        let predictions = self.predict(&features, &proposals, true)?;
        let outputs = FastRcnnOutputs::new(
            &self.box_transform,
            &predictions.class_logits,
            &predictions.proposal_deltas,
            &proposals,
            self.smooth_l1_beta,
        )?;
        let gt_classes = Tensor::cat(
            &sampled.iter().map(|sampled| &sampled.gt_classes).collect_vec(),
            0,
        );
        let gt_boxes = Boxes::cat(
            &sampled
                .iter()
                .map(|sampled| sampled.gt_boxes.shallow_clone())
                .collect_vec(),
        )?;
        outputs.losses(&gt_classes, &gt_boxes)
    }

    /// Final detections of each image in the input resolution.
    pub fn inference(
        &self,
        features: &HashMap<String, Tensor>,
        proposals: Vec<Proposals<Boxes>>,
    ) -> Result<Vec<Detections>> {
        let features = select_features(features, &self.in_features)?;
        let proposals = proposals.iter().collect_vec();
        let predictions = self.predict(&features, &proposals, false)?;
        let outputs = FastRcnnOutputs::new(
            &self.box_transform,
            &predictions.class_logits,
            &predictions.proposal_deltas,
            &proposals,
            self.smooth_l1_beta,
        )?;
        let detections = outputs.inference(&self.inference_params)?;

        let attr_logits = match &predictions.attr_logits {
            Some(attr_logits) => attr_logits,
            None => return Ok(detections),
        };
        let num_preds = proposals.iter().map(|props| props.len()).collect_vec();
        let attr_probs = attr_logits
            .softmax(-1, Kind::Float)
            .split_with_sizes(num_preds.as_slice(), 0);
        let detections = izip!(detections, attr_probs)
            .map(|(detections, attr_probs)| Detections {
                attribute_scores: Some(attr_probs.index_select(0, &detections.proposal_indices)),
                ..detections
            })
            .collect();
        Ok(detections)
    }

    fn predict(
        &self,
        features: &[&Tensor],
        proposals: &[&Proposals<Boxes>],
        train: bool,
    ) -> Result<BoxPredictions> {
        let boxes = proposals.iter().map(|props| &props.boxes).collect_vec();
        let crops = self.pooler.forward(features, &boxes)?;
        let box_features = self.box_head.forward_t(&crops, train);
        Ok(self.box_predictor.forward(&box_features))
    }

    /// Matches the proposals of each image to the ground truth and samples
    /// a fixed quota of foreground and background proposals.
    ///
    /// Proposals matched at or above the IoU threshold take the class of
    /// their ground truth, the others become background. Sampled
    /// foreground proposals come first.
    pub fn label_and_sample_proposals(
        &self,
        proposals: Vec<Proposals<Boxes>>,
        targets: &[Targets],
    ) -> Result<Vec<SampledProposals>> {
        ensure!(
            proposals.len() == targets.len(),
            "expect ground truth of {} images, but get {}",
            proposals.len(),
            targets.len()
        );
        let proposals = if self.proposal_append_gt {
            let gt_boxes = targets.iter().map(|targets| &targets.boxes).collect_vec();
            add_ground_truth_to_proposals(&gt_boxes, proposals)?
        } else {
            proposals
        };

        tch::no_grad(|| {
            izip!(proposals, targets)
                .map(|(proposals, targets)| -> Result<_> {
                    targets
                        .boxes
                        .tensor()
                        .ensure_same_device(proposals.boxes.tensor())?;
                    let device = proposals.boxes.device();

                    let matched = self
                        .proposal_matcher
                        .forward(&targets.boxes.pairwise_iou(&proposals.boxes)?)?;
                    let labels = matched.labels().to_kind(Kind::Int64);
                    let gt_classes = if targets.is_empty() {
                        Tensor::full([proposals.len()], self.num_classes, (Kind::Int64, device))
                    } else {
                        targets
                            .classes
                            .index_select(0, matched.matches())
                            .masked_fill(&labels.eq(0), self.num_classes)
                            .masked_fill(&labels.eq(-1), -1)
                    };

                    let (positive, negative) = subsample_labels(
                        &gt_classes,
                        self.batch_size_per_image,
                        self.positive_fraction,
                        self.num_classes,
                    )?;
                    debug!(
                        "sampled {} foreground and {} background proposals",
                        positive.numel(),
                        negative.numel()
                    );
                    let sampled = Tensor::cat(&[positive, negative], 0);

                    let gt_boxes = if targets.is_empty() {
                        Boxes::from_tensor(Tensor::zeros(
                            [sampled.size()[0], 4],
                            (Kind::Float, device),
                        ))?
                    } else {
                        targets
                            .boxes
                            .index_select(&matched.matches().index_select(0, &sampled))
                    };

                    Ok(SampledProposals {
                        proposals: proposals.index_select(&sampled),
                        gt_classes: gt_classes.index_select(0, &sampled),
                        gt_boxes,
                    })
                })
                .try_collect()
        })
    }
}

/// Appends the ground truth boxes of each image to its proposals, with an
/// objectness logit standing for a probability of almost one.
pub fn add_ground_truth_to_proposals(
    gt_boxes: &[&Boxes],
    proposals: Vec<Proposals<Boxes>>,
) -> Result<Vec<Proposals<Boxes>>> {
    ensure!(
        gt_boxes.len() == proposals.len(),
        "expect ground truth of {} images, but get {}",
        proposals.len(),
        gt_boxes.len()
    );
    let gt_logit = ((1.0 - 1e-10f64) / (1.0 - (1.0 - 1e-10))).ln();

    izip!(gt_boxes, proposals)
        .map(|(gt_boxes, proposals)| {
            let Proposals {
                boxes,
                objectness_logits,
                image_size,
            } = proposals;
            let gt_logits = Tensor::full(
                [gt_boxes.len()],
                gt_logit,
                (objectness_logits.kind(), objectness_logits.device()),
            );
            Proposals::new(
                Boxes::cat(&[boxes, gt_boxes.shallow_clone()])?,
                Tensor::cat(&[objectness_logits, gt_logits], 0),
                image_size,
            )
        })
        .try_collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn input_shapes() -> HashMap<String, ShapeSpec> {
        let mut shapes = HashMap::new();
        shapes.insert(
            "res4".to_string(),
            ShapeSpec {
                channels: 8,
                stride: 16,
            },
        );
        shapes
    }

    fn roi_heads(vs: &nn::VarStore, init: RoiHeadsInit) -> Result<RoiHeads<GlobalAvgPool>> {
        init.build(vs.root() / "roi_heads", &input_shapes(), GlobalAvgPool)
    }

    fn proposals(boxes: &[f32]) -> Result<Proposals<Boxes>> {
        let num = boxes.len() as i64 / 4;
        Proposals::new(
            Boxes::from_tensor(Tensor::from_slice(boxes).view([num, 4]))?,
            Tensor::zeros([num], (Kind::Float, Device::Cpu)),
            HW::try_from_hw([64, 64])?,
        )
    }

    fn targets(boxes: &[f32], classes: &[i64]) -> Result<Targets> {
        Targets::new(
            Boxes::from_tensor(Tensor::from_slice(boxes).view([classes.len() as i64, 4]))?,
            Tensor::from_slice(classes),
        )
    }

    fn features() -> HashMap<String, Tensor> {
        let mut features = HashMap::new();
        features.insert(
            "res4".to_string(),
            Tensor::randn([1, 8, 4, 4], (Kind::Float, Device::Cpu)),
        );
        features
    }

    #[test]
    fn ground_truth_appended_to_proposals() -> Result<()> {
        let gt = Boxes::from_tensor(Tensor::from_slice(&[1f32, 2.0, 3.0, 4.0]).view([1, 4]))?;
        let output = add_ground_truth_to_proposals(&[&gt], vec![proposals(&[0.0, 0.0, 8.0, 8.0])?])?;

        assert_eq!(output[0].len(), 2);
        assert_eq!(
            output[0].boxes().tensor().get(1).to_f32_vec()?,
            vec![1.0, 2.0, 3.0, 4.0]
        );
        assert_abs_diff_eq!(
            output[0].objectness_logits().double_value(&[1]),
            (1e10f64).ln(),
            epsilon = 1e-3
        );
        Ok(())
    }

    #[test]
    fn label_and_sample_proposals_classes() -> Result<()> {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let heads = roi_heads(&vs, RoiHeadsInit::new(3))?;

        let props = proposals(&[
            0.0, 0.0, 10.0, 10.0, // identical to the ground truth
            40.0, 40.0, 50.0, 50.0, // disjoint
            0.0, 0.0, 10.0, 20.0, // IoU 0.5
        ])?;
        let gt = targets(&[0.0, 0.0, 10.0, 10.0], &[2])?;
        let sampled = heads.label_and_sample_proposals(vec![props], &[gt])?;

        let sampled = &sampled[0];
        assert_eq!(sampled.proposals().len(), 4);
        assert_eq!(sampled.gt_classes().to_i64_vec()?, vec![2, 2, 2, 3]);
        assert_eq!(sampled.gt_boxes().len(), 4);
        assert_eq!(
            sampled.gt_boxes().tensor().get(0).to_f32_vec()?,
            vec![0.0, 0.0, 10.0, 10.0]
        );
        Ok(())
    }

    #[test]
    fn label_and_sample_proposals_without_ground_truth() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let heads = roi_heads(&vs, RoiHeadsInit::new(3))?;

        let props = proposals(&[0.0, 0.0, 10.0, 10.0, 40.0, 40.0, 50.0, 50.0])?;
        let gt = Targets::new(Boxes::empty(Device::Cpu), Tensor::zeros([0], (Kind::Int64, Device::Cpu)))?;
        let sampled = heads.label_and_sample_proposals(vec![props], &[gt])?;

        assert_eq!(sampled[0].gt_classes().to_i64_vec()?, vec![3, 3]);
        assert_eq!(sampled[0].gt_boxes().tensor().size(), vec![2, 4]);
        Ok(())
    }

    #[test]
    fn roi_heads_forward_modes() -> Result<()> {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let heads = roi_heads(
            &vs,
            RoiHeadsInit {
                score_thresh: r64(0.0),
                num_attrs: Some(5),
                ..RoiHeadsInit::new(3)
            },
        )?;
        let features = features();
        let props = || proposals(&[0.0, 0.0, 30.0, 30.0, 20.0, 20.0, 60.0, 50.0]);

        let gt = [targets(&[0.0, 0.0, 32.0, 32.0], &[1])?];
        let losses = match heads.forward_t(&features, vec![props()?], Some(&gt[..]), true)? {
            RoiHeadsOutput::Losses(losses) => losses,
            RoiHeadsOutput::Detections(_) => bail!("expect losses in training mode"),
        };
        ensure!(losses.loss_cls().double_value(&[]).is_finite());
        ensure!(losses.loss_box_reg().double_value(&[]) >= 0.0);

        ensure!(heads.forward_t(&features, vec![props()?], None, true).is_err());

        let detections = match heads.forward_t(&features, vec![props()?], None, false)? {
            RoiHeadsOutput::Detections(detections) => detections,
            RoiHeadsOutput::Losses(_) => bail!("expect detections in evaluation mode"),
        };
        assert_eq!(detections.len(), 1);
        let detections = &detections[0];
        ensure!(detections.len() <= 100);
        let attribute_scores = detections
            .attribute_scores()
            .as_ref()
            .ok_or_else(|| format_err!("missing attribute scores"))?;
        assert_eq!(attribute_scores.size(), vec![detections.len(), 6]);
        Ok(())
    }
}
