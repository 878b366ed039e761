//! Detectors assembled from the region proposal network and the ROI heads.

use crate::{
    anchor::{AnchorGenerator, AnchorGeneratorInit},
    box_transform::{Box2BoxTransform, Box2BoxTransformInit},
    common::*,
    instances::{Detections, Proposals, Targets},
    postprocess::{detector_postprocess, proposal_postprocess},
    roi_heads::{BoxHead, RoiHeads, RoiHeadsInit},
    rpn::{Rpn, RpnInit, RpnOutput},
    shape::{select_shapes, ShapeSpec},
};

/// The region proposal network over axis-aligned anchors.
pub type StandardRpn = Rpn<AnchorGenerator, Box2BoxTransform>;

/// Losses by name, or per-image predictions.
#[derive(Debug)]
pub enum ModelOutput<T> {
    Losses(BTreeMap<String, Tensor>),
    Predictions(Vec<T>),
}

fn build_rpn<'p>(
    path: &nn::Path<'p>,
    input_shapes: &HashMap<String, ShapeSpec>,
    anchor_generator: AnchorGeneratorInit,
    box_transform: Box2BoxTransformInit,
    rpn: RpnInit,
) -> Result<StandardRpn> {
    let strides = select_shapes(input_shapes, &rpn.in_features)?
        .iter()
        .map(|shape| shape.stride)
        .collect();
    let anchor_generator = AnchorGeneratorInit {
        strides,
        ..anchor_generator
    }
    .build()?;
    rpn.build(path, input_shapes, anchor_generator, box_transform.build()?)
}

fn rpn_losses(
    rpn: &StandardRpn,
    image_sizes: &[HW<i64>],
    features: &HashMap<String, Tensor>,
    gt_boxes: &[Boxes],
) -> Result<(Vec<Proposals<Boxes>>, BTreeMap<String, Tensor>)> {
    let RpnOutput { proposals, losses } = rpn.forward_t(image_sizes, features, Some(gt_boxes), true)?;
    let losses = losses
        .ok_or_else(|| format_err!("the RPN did not produce losses in training mode"))?
        .into_named()
        .into_iter()
        .map(|(name, loss)| (name.to_string(), loss))
        .collect();
    Ok((proposals, losses))
}

fn check_output_sizes(output_sizes: Option<&[HW<i64>]>, num_images: usize) -> Result<()> {
    if let Some(output_sizes) = output_sizes {
        ensure!(
            output_sizes.len() == num_images,
            "expect output sizes of {} images, but get {}",
            num_images,
            output_sizes.len()
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GeneralizedRcnnInit {
    /// Anchor shapes. The strides are replaced by those of the RPN input features.
    pub anchor_generator: AnchorGeneratorInit,
    pub rpn_box_transform: Box2BoxTransformInit,
    pub rpn: RpnInit,
    pub roi_heads: RoiHeadsInit,
}

impl GeneralizedRcnnInit {
    pub fn new(num_classes: i64) -> Self {
        Self {
            anchor_generator: AnchorGeneratorInit::new(vec![]),
            rpn_box_transform: Box2BoxTransformInit::new([1.0; 4]),
            rpn: RpnInit::default(),
            roi_heads: RoiHeadsInit::new(num_classes),
        }
    }

    pub fn build<'p, H>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &HashMap<String, ShapeSpec>,
        box_head: H,
    ) -> Result<GeneralizedRcnn<H>>
    where
        H: BoxHead,
    {
        let path = path.borrow();
        let Self {
            anchor_generator,
            rpn_box_transform,
            rpn,
            roi_heads,
        } = self;

        let rpn = build_rpn(
            &(path / "proposal_generator"),
            input_shapes,
            anchor_generator,
            rpn_box_transform,
            rpn,
        )?;
        let roi_heads = roi_heads.build(path / "roi_heads", input_shapes, box_head)?;
        Ok(GeneralizedRcnn { rpn, roi_heads })
    }
}

/// Two-stage detector: region proposals refined by the ROI heads.
#[derive(Debug, Getters)]
pub struct GeneralizedRcnn<H> {
    #[get = "pub"]
    rpn: StandardRpn,
    #[get = "pub"]
    roi_heads: RoiHeads<H>,
}

impl<H> GeneralizedRcnn<H>
where
    H: BoxHead,
{
    /// Runs the detector on the backbone features of a batch.
    ///
    /// In training mode the losses of both stages are returned under the
    /// names `loss_rpn_cls`, `loss_rpn_loc`, `loss_cls` and `loss_box_reg`.
    /// Otherwise the detections of each image are returned in the input
    /// resolution.
    pub fn forward_t(
        &self,
        image_sizes: &[HW<i64>],
        features: &HashMap<String, Tensor>,
        targets: Option<&[Targets]>,
        train: bool,
    ) -> Result<ModelOutput<Detections>> {
        if !train {
            let detections = self.inference(image_sizes, features, None)?;
            return Ok(ModelOutput::Predictions(detections));
        }

        let targets = targets.ok_or_else(|| format_err!("ground truth is required in training mode"))?;
        let gt_boxes = targets
            .iter()
            .map(|targets| targets.boxes.shallow_clone())
            .collect_vec();
        let (proposals, mut losses) = rpn_losses(&self.rpn, image_sizes, features, &gt_boxes)?;
        let roi_losses = self.roi_heads.losses(features, proposals, targets)?;
        losses.extend(
            roi_losses
                .into_named()
                .into_iter()
                .map(|(name, loss)| (name.to_string(), loss)),
        );
        Ok(ModelOutput::Losses(losses))
    }

    /// Detects objects, optionally rescaling the detections of each image to `output_sizes`.
    pub fn inference(
        &self,
        image_sizes: &[HW<i64>],
        features: &HashMap<String, Tensor>,
        output_sizes: Option<&[HW<i64>]>,
    ) -> Result<Vec<Detections>> {
        check_output_sizes(output_sizes, image_sizes.len())?;
        let RpnOutput { proposals, .. } = self.rpn.forward_t(image_sizes, features, None, false)?;
        let detections = self.roi_heads.inference(features, proposals)?;

        match output_sizes {
            Some(output_sizes) => izip!(detections, output_sizes)
                .map(|(detections, size)| detector_postprocess(detections, size.h(), size.w()))
                .try_collect(),
            None => Ok(detections),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProposalNetworkInit {
    /// Anchor shapes. The strides are replaced by those of the RPN input features.
    pub anchor_generator: AnchorGeneratorInit,
    pub rpn_box_transform: Box2BoxTransformInit,
    pub rpn: RpnInit,
}

impl Default for ProposalNetworkInit {
    fn default() -> Self {
        Self {
            anchor_generator: AnchorGeneratorInit::new(vec![]),
            rpn_box_transform: Box2BoxTransformInit::new([1.0; 4]),
            rpn: RpnInit::default(),
        }
    }
}

impl ProposalNetworkInit {
    pub fn build<'p>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &HashMap<String, ShapeSpec>,
    ) -> Result<ProposalNetwork> {
        let Self {
            anchor_generator,
            rpn_box_transform,
            rpn,
        } = self;
        let rpn = build_rpn(
            &(path.borrow() / "proposal_generator"),
            input_shapes,
            anchor_generator,
            rpn_box_transform,
            rpn,
        )?;
        Ok(ProposalNetwork { rpn })
    }
}

/// Detector made of the region proposal network only.
#[derive(Debug, Getters)]
pub struct ProposalNetwork {
    #[get = "pub"]
    rpn: StandardRpn,
}

impl ProposalNetwork {
    /// Returns the RPN losses in training mode, or the proposals of each image otherwise.
    pub fn forward_t(
        &self,
        image_sizes: &[HW<i64>],
        features: &HashMap<String, Tensor>,
        gt_boxes: Option<&[Boxes]>,
        train: bool,
    ) -> Result<ModelOutput<Proposals<Boxes>>> {
        if train {
            let gt_boxes =
                gt_boxes.ok_or_else(|| format_err!("ground truth is required in training mode"))?;
            let (_, losses) = rpn_losses(&self.rpn, image_sizes, features, gt_boxes)?;
            Ok(ModelOutput::Losses(losses))
        } else {
            let proposals = self.inference(image_sizes, features, None)?;
            Ok(ModelOutput::Predictions(proposals))
        }
    }

    /// Proposes regions, optionally rescaling the proposals of each image to `output_sizes`.
    pub fn inference(
        &self,
        image_sizes: &[HW<i64>],
        features: &HashMap<String, Tensor>,
        output_sizes: Option<&[HW<i64>]>,
    ) -> Result<Vec<Proposals<Boxes>>> {
        check_output_sizes(output_sizes, image_sizes.len())?;
        let RpnOutput { proposals, .. } = self.rpn.forward_t(image_sizes, features, None, false)?;

        match output_sizes {
            Some(output_sizes) => izip!(proposals, output_sizes)
                .map(|(proposals, size)| proposal_postprocess(proposals, size.h(), size.w()))
                .try_collect(),
            None => Ok(proposals),
        }
    }
}
