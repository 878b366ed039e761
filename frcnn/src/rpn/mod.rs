//! Region proposal network.

mod head;
mod outputs;
mod proposals;

pub use head::*;
pub use outputs::*;
pub use proposals::*;

use crate::{
    anchor::GenerateAnchors,
    box_transform::BoxTransform,
    common::*,
    instances::Proposals,
    matcher::{Matcher, MatcherInit},
    norm::NormKind,
    sampling::subsample_labels,
    shape::{select_features, select_shapes, ShapeSpec},
};

#[derive(Debug, Clone)]
pub struct RpnInit {
    /// Names of the feature levels consumed, from fine to coarse.
    pub in_features: Vec<String>,
    pub iou_thresholds: Vec<R64>,
    pub iou_labels: Vec<i64>,
    /// Sampled anchors per image for the training losses.
    pub batch_size_per_image: i64,
    pub positive_fraction: R64,
    pub smooth_l1_beta: R64,
    pub loss_weight: R64,
    pub nms_thresh: R64,
    pub pre_nms_topk_train: i64,
    pub pre_nms_topk_test: i64,
    pub post_nms_topk_train: i64,
    pub post_nms_topk_test: i64,
    pub min_box_side_len: R64,
    /// Anchors crossing the image border by more than this many pixels are
    /// ignored in training. A negative value keeps every anchor.
    pub boundary_thresh: i64,
    pub hid_channels: Option<i64>,
    pub head_norm: Option<NormKind>,
}

impl Default for RpnInit {
    fn default() -> Self {
        Self {
            in_features: vec!["res4".into()],
            iou_thresholds: vec![r64(0.3), r64(0.7)],
            iou_labels: vec![0, -1, 1],
            batch_size_per_image: 256,
            positive_fraction: r64(0.5),
            smooth_l1_beta: r64(0.0),
            loss_weight: r64(1.0),
            nms_thresh: r64(0.7),
            pre_nms_topk_train: 12000,
            pre_nms_topk_test: 6000,
            post_nms_topk_train: 2000,
            post_nms_topk_test: 1000,
            min_box_side_len: r64(0.0),
            boundary_thresh: -1,
            hid_channels: None,
            head_norm: None,
        }
    }
}

impl RpnInit {
    pub fn build<'p, G, T>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &HashMap<String, ShapeSpec>,
        anchor_generator: G,
        box_transform: T,
    ) -> Result<Rpn<G, T>>
    where
        G: GenerateAnchors,
        T: BoxTransform<Boxes = G::Boxes>,
    {
        let path = path.borrow();
        let Self {
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
            min_box_side_len,
            boundary_thresh,
            hid_channels,
            head_norm,
        } = self;

        let shapes = select_shapes(input_shapes, &in_features)?;
        let in_channels = shapes[0].channels;
        ensure!(
            shapes.iter().all(|shape| shape.channels == in_channels),
            "every input feature of the RPN must have the same number of channels"
        );
        ensure!(
            anchor_generator.num_levels() == shapes.len(),
            "the anchor generator has {} levels, but {} input features are given",
            anchor_generator.num_levels(),
            shapes.len()
        );
        let num_cell_anchors = anchor_generator.num_cell_anchors();
        let num_anchors = num_cell_anchors[0];
        ensure!(
            num_cell_anchors.iter().all(|&count| count == num_anchors),
            "every level must have the same number of cell anchors"
        );
        ensure!(batch_size_per_image > 0, "batch_size_per_image must be positive");
        ensure!(
            (0.0..=1.0).contains(&positive_fraction.raw()),
            "positive_fraction must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&nms_thresh.raw()),
            "nms_thresh must be in range [0, 1]"
        );
        ensure!(smooth_l1_beta >= 0.0, "smooth_l1_beta must be non-negative");
        ensure!(
            [pre_nms_topk_train, pre_nms_topk_test, post_nms_topk_train, post_nms_topk_test]
                .iter()
                .all(|&topk| topk >= 0),
            "topk counts must be non-negative"
        );

        let matcher = MatcherInit {
            thresholds: iou_thresholds,
            labels: iou_labels,
            allow_low_quality_matches: true,
        }
        .build()?;
        let head = StandardRpnHeadInit {
            hid_channels,
            norm: head_norm,
            ..StandardRpnHeadInit::new(
                in_channels,
                num_anchors,
                <G::Boxes as BoxSet>::BOX_DIM,
            )
        }
        .build(path / "head")?;

        Ok(Rpn {
            in_features,
            anchor_generator,
            box_transform,
            head,
            matcher,
            batch_size_per_image,
            positive_fraction: positive_fraction.raw(),
            loss_params: RpnLossParams {
                batch_size_per_image,
                smooth_l1_beta: smooth_l1_beta.raw(),
                loss_weight: loss_weight.raw(),
            },
            nms_thresh: nms_thresh.raw(),
            pre_nms_topk: [pre_nms_topk_test, pre_nms_topk_train],
            post_nms_topk: [post_nms_topk_test, post_nms_topk_train],
            min_box_side_len: min_box_side_len.raw(),
            boundary_thresh,
        })
    }
}

/// Proposals of every image, with the losses in training mode.
#[derive(Debug)]
pub struct RpnOutput<B> {
    pub proposals: Vec<Proposals<B>>,
    pub losses: Option<RpnLosses>,
}

#[derive(Debug, Getters)]
pub struct Rpn<G, T> {
    #[get = "pub"]
    in_features: Vec<String>,
    #[get = "pub"]
    anchor_generator: G,
    #[get = "pub"]
    box_transform: T,
    head: StandardRpnHead,
    matcher: Matcher,
    batch_size_per_image: i64,
    positive_fraction: f64,
    loss_params: RpnLossParams,
    nms_thresh: f64,
    /// Indexed by the training flag.
    pre_nms_topk: [i64; 2],
    post_nms_topk: [i64; 2],
    min_box_side_len: f64,
    boundary_thresh: i64,
}

impl<G, T> Rpn<G, T>
where
    G: GenerateAnchors,
    T: BoxTransform<Boxes = G::Boxes>,
{
    /// Proposes regions for a batch of images.
    ///
    /// `features` maps level names to `[N, C, H, W]` maps of the N images
    /// whose sizes are `image_sizes`. Ground truth boxes are required in
    /// training mode.
    pub fn forward_t(
        &self,
        image_sizes: &[HW<i64>],
        features: &HashMap<String, Tensor>,
        gt_boxes: Option<&[G::Boxes]>,
        train: bool,
    ) -> Result<RpnOutput<G::Boxes>> {
        let features = select_features(features, &self.in_features)?;
        features.iter().try_for_each(|feature| -> Result<_> {
            ensure!(
                feature.size()[0] == image_sizes.len() as i64,
                "expect features of {} images, but get {:?}",
                image_sizes.len(),
                feature.size()
            );
            Ok(())
        })?;

        let anchors = self.anchor_generator.forward(&features)?;
        let (pred_objectness_logits, pred_anchor_deltas) = self.head.forward_t(&features, train);
        let outputs = RpnOutputs::new(
            &self.box_transform,
            &anchors,
            &pred_objectness_logits,
            &pred_anchor_deltas,
        )?;

        let losses = if train {
            let gt_boxes =
                gt_boxes.ok_or_else(|| format_err!("ground truth is required in training mode"))?;
            ensure!(
                gt_boxes.len() == image_sizes.len(),
                "expect ground truth of {} images, but get {}",
                image_sizes.len(),
                gt_boxes.len()
            );
            let (gt_labels, gt_deltas) =
                self.label_and_sample_anchors(&anchors, image_sizes, gt_boxes)?;
            Some(outputs.losses(&gt_labels, &gt_deltas, &self.loss_params)?)
        } else {
            None
        };

        let filter = ProposalFilter {
            nms_thresh: self.nms_thresh,
            pre_nms_topk: self.pre_nms_topk[train as usize],
            post_nms_topk: self.post_nms_topk[train as usize],
            min_box_side_len: self.min_box_side_len,
            train,
        };
        let proposals = tch::no_grad(|| -> Result<_> {
            find_top_rpn_proposals(
                &outputs.predict_proposals()?,
                &outputs.predict_objectness_logits(),
                image_sizes,
                &filter,
            )
        })?;

        Ok(RpnOutput { proposals, losses })
    }

    /// Anchor labels in `{-1, 0, 1}` and regression targets of each image.
    fn label_and_sample_anchors(
        &self,
        anchors: &[G::Boxes],
        image_sizes: &[HW<i64>],
        gt_boxes: &[G::Boxes],
    ) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let anchors = <G::Boxes as BoxSet>::cat(anchors)?;

        tch::no_grad(|| -> Result<_> {
            let pairs: Vec<(Tensor, Tensor)> = izip!(image_sizes, gt_boxes)
                .map(|(image_size, gt_boxes)| -> Result<_> {
                    gt_boxes.tensor().ensure_same_device(anchors.tensor())?;
                    if gt_boxes.nonempty(0.0).all().int64_value(&[]) == 0 {
                        warn!("ground truth boxes with zero width or height yield infinite regression targets");
                    }

                    let matched = self.matcher.forward(&gt_boxes.pairwise_iou(&anchors)?)?;
                    let labels = matched.labels().to_kind(Kind::Int64);
                    let labels = if self.boundary_thresh >= 0 {
                        let inside = anchors.inside_box(image_size, self.boundary_thresh as f64);
                        labels.masked_fill(&inside.logical_not(), -1)
                    } else {
                        labels
                    };
                    let labels = self.resample(&labels)?;

                    let deltas = if gt_boxes.is_empty() {
                        anchors.tensor().zeros_like()
                    } else {
                        let matched_gt = gt_boxes.index_select(matched.matches());
                        self.box_transform
                            .get_deltas(anchors.tensor(), matched_gt.tensor())?
                    };
                    Ok((labels, deltas))
                })
                .try_collect()?;
            Ok(pairs.into_iter().unzip())
        })
    }

    /// Keeps a random subset of positives and negatives and ignores the rest.
    fn resample(&self, labels: &Tensor) -> Result<Tensor> {
        let (positive, negative) =
            subsample_labels(labels, self.batch_size_per_image, self.positive_fraction, 0)?;
        debug!(
            "sampled {} positive and {} negative anchors",
            positive.numel(),
            negative.numel()
        );
        Ok(labels
            .full_like(-1)
            .index_fill(0, &positive, 1)
            .index_fill(0, &negative, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{anchor::AnchorGeneratorInit, box_transform::Box2BoxTransformInit};

    fn input_shapes() -> HashMap<String, ShapeSpec> {
        HashMap::from([(
            "res4".to_string(),
            ShapeSpec {
                channels: 8,
                stride: 16,
            },
        )])
    }

    fn build_rpn(
        vs: &nn::VarStore,
        init: RpnInit,
        sizes: Vec<f64>,
    ) -> Result<Rpn<crate::anchor::AnchorGenerator, crate::box_transform::Box2BoxTransform>> {
        let anchor_generator = AnchorGeneratorInit {
            sizes: vec![sizes.into_iter().map(r64).collect()],
            aspect_ratios: vec![vec![r64(1.0)]],
            strides: vec![16],
            offset: r64(0.5),
        }
        .build()?;
        let box_transform = Box2BoxTransformInit::new([1.0, 1.0, 1.0, 1.0]).build()?;
        init.build(&vs.root(), &input_shapes(), anchor_generator, box_transform)
    }

    #[test]
    fn rpn_anchor_labels() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = build_rpn(&vs, RpnInit::default(), vec![32.0])?;
        let anchors = rpn.anchor_generator().grid_anchors(&[[2, 2]], Device::Cpu)?;
        let image_size = HW::try_from_hw([32, 32])?;
        let gt_boxes = [Boxes::from_tensor(
            Tensor::from_slice(&[-8f32, -8.0, 24.0, 24.0]).view([1, 4]),
        )?];

        let (labels, deltas) = rpn.label_and_sample_anchors(&anchors, &[image_size], &gt_boxes)?;
        assert_eq!(labels[0].to_i64_vec()?, vec![1, -1, -1, 0]);
        assert_eq!(deltas[0].size(), vec![4, 4]);
        assert_eq!(deltas[0].get(0).to_f32_vec()?, vec![0.0; 4]);

        // every anchor crosses the border of a 32x32 image
        let rpn = build_rpn(
            &vs,
            RpnInit {
                boundary_thresh: 0,
                ..RpnInit::default()
            },
            vec![32.0],
        )?;
        let (labels, _) = rpn.label_and_sample_anchors(&anchors, &[image_size], &gt_boxes)?;
        assert_eq!(labels[0].to_i64_vec()?, vec![-1; 4]);
        Ok(())
    }

    #[test]
    fn rpn_anchor_labels_without_ground_truth() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = build_rpn(&vs, RpnInit::default(), vec![32.0])?;
        let anchors = rpn.anchor_generator().grid_anchors(&[[2, 2]], Device::Cpu)?;
        let image_size = HW::try_from_hw([32, 32])?;

        let (labels, deltas) =
            rpn.label_and_sample_anchors(&anchors, &[image_size], &[Boxes::empty(Device::Cpu)])?;
        assert_eq!(labels[0].to_i64_vec()?, vec![0; 4]);
        assert_eq!(deltas[0].abs().sum(Kind::Float).double_value(&[]), 0.0);
        Ok(())
    }

    #[test]
    fn rpn_forward_modes() -> Result<()> {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = build_rpn(
            &vs,
            RpnInit {
                post_nms_topk_test: 5,
                ..RpnInit::default()
            },
            vec![16.0, 32.0],
        )?;
        let features = HashMap::from([(
            "res4".to_string(),
            Tensor::randn([2, 8, 4, 4], (Kind::Float, Device::Cpu)),
        )]);
        let image_sizes = [HW::try_from_hw([64, 64])?, HW::try_from_hw([60, 50])?];

        let output = rpn.forward_t(&image_sizes, &features, None, false)?;
        ensure!(output.losses.is_none());
        assert_eq!(output.proposals.len(), 2);
        output.proposals.iter().try_for_each(|proposals| -> Result<_> {
            ensure!(proposals.len() <= 5);
            let logits = proposals.objectness_logits().to_f32_vec()?;
            ensure!(logits.windows(2).all(|pair| pair[0] >= pair[1]));
            Ok(())
        })?;

        assert!(rpn.forward_t(&image_sizes, &features, None, true).is_err());

        let gt_boxes = [
            Boxes::from_tensor(Tensor::from_slice(&[4f32, 4.0, 30.0, 40.0]).view([1, 4]))?,
            Boxes::empty(Device::Cpu),
        ];
        let output = rpn.forward_t(&image_sizes, &features, Some(&gt_boxes[..]), true)?;
        let losses = output
            .losses
            .ok_or_else(|| format_err!("missing losses"))?;
        ensure!(losses.loss_rpn_cls().double_value(&[]).is_finite());
        ensure!(losses.loss_rpn_loc().double_value(&[]).is_finite());
        ensure!(losses.loss_rpn_loc().double_value(&[]) > 0.0);
        Ok(())
    }
}
