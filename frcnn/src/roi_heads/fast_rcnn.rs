use super::inference::{fast_rcnn_inference, InferenceParams};
use crate::{
    box_transform::{Box2BoxTransform, BoxTransform},
    common::*,
    instances::{Detections, Proposals},
    loss::{CrossEntropyLoss, SmoothL1Loss},
};

/// Builder of [FastRcnnOutputLayers].
#[derive(Debug, Clone)]
pub struct FastRcnnOutputLayersInit {
    pub input_size: i64,
    /// Foreground classes. The predictor adds one background class.
    pub num_classes: i64,
    pub cls_agnostic_bbox_reg: bool,
    pub box_dim: i64,
    /// Adds an attribute branch predicting `num_attrs + 1` attribute logits
    /// per box, conditioned on the predicted class.
    pub num_attrs: Option<i64>,
}

impl FastRcnnOutputLayersInit {
    pub fn new(input_size: i64, num_classes: i64) -> Self {
        Self {
            input_size,
            num_classes,
            cls_agnostic_bbox_reg: false,
            box_dim: 4,
            num_attrs: None,
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<FastRcnnOutputLayers> {
        let path = path.borrow();
        let Self {
            input_size,
            num_classes,
            cls_agnostic_bbox_reg,
            box_dim,
            num_attrs,
        } = self;
        ensure!(input_size > 0, "input_size must be positive");
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(box_dim > 0, "box_dim must be positive");

        let linear = |name: &str, out_dim: i64, stdev: f64| {
            nn::linear(
                path / name,
                input_size,
                out_dim,
                nn::LinearConfig {
                    ws_init: nn::Init::Randn { mean: 0.0, stdev },
                    bs_init: Some(nn::Init::Const(0.0)),
                    bias: true,
                },
            )
        };
        let num_bbox_reg_classes = if cls_agnostic_bbox_reg { 1 } else { num_classes };
        let cls_score = linear("cls_score", num_classes + 1, 0.01);
        let bbox_pred = linear("bbox_pred", num_bbox_reg_classes * box_dim, 0.001);

        let attr_head = num_attrs
            .map(|num_attrs| -> Result<_> {
                ensure!(num_attrs > 0, "num_attrs must be positive");
                let path = path / "attr";
                let class_embedding =
                    nn::embedding(&path / "cls_embedding", num_classes + 1, 256, Default::default());
                let fc = nn::linear(&path / "fc", input_size + 256, 512, Default::default());
                let score = nn::linear(&path / "score", 512, num_attrs + 1, Default::default());
                Ok(AttrHead {
                    class_embedding,
                    fc,
                    score,
                })
            })
            .transpose()?;

        Ok(FastRcnnOutputLayers {
            num_classes,
            cls_agnostic_bbox_reg,
            box_dim,
            cls_score,
            bbox_pred,
            attr_head,
        })
    }
}

#[derive(Debug)]
struct AttrHead {
    class_embedding: nn::Embedding,
    fc: nn::Linear,
    score: nn::Linear,
}

impl AttrHead {
    fn forward(&self, features: &Tensor, class_logits: &Tensor) -> Tensor {
        let classes = class_logits.argmax(-1, false);
        let embedded = self.class_embedding.forward(&classes);
        let xs = Tensor::cat(&[features, &embedded], 1);
        self.score.forward(&self.fc.forward(&xs).relu())
    }
}

/// Raw predictions of [FastRcnnOutputLayers] on `R` boxes.
#[derive(Debug)]
pub struct BoxPredictions {
    /// `[R, K + 1]` class logits with the background last.
    pub class_logits: Tensor,
    /// `[R, K * box_dim]`, or `[R, box_dim]` for class-agnostic regression.
    pub proposal_deltas: Tensor,
    /// `[R, num_attrs + 1]` attribute logits.
    pub attr_logits: Option<Tensor>,
}

/// Class scores and box regression deltas of the second stage.
#[derive(Debug, Getters)]
pub struct FastRcnnOutputLayers {
    #[get = "pub"]
    num_classes: i64,
    #[get = "pub"]
    cls_agnostic_bbox_reg: bool,
    #[get = "pub"]
    box_dim: i64,
    cls_score: nn::Linear,
    bbox_pred: nn::Linear,
    attr_head: Option<AttrHead>,
}

impl FastRcnnOutputLayers {
    /// Predicts on `[R, input_size]` box features. Inputs of higher rank are flattened first.
    pub fn forward(&self, xs: &Tensor) -> BoxPredictions {
        let xs = if xs.dim() > 2 {
            xs.flatten(1, -1)
        } else {
            xs.shallow_clone()
        };
        let class_logits = self.cls_score.forward(&xs);
        let proposal_deltas = self.bbox_pred.forward(&xs);
        let attr_logits = self
            .attr_head
            .as_ref()
            .map(|head| head.forward(&xs, &class_logits));
        BoxPredictions {
            class_logits,
            proposal_deltas,
            attr_logits,
        }
    }
}

/// Loss terms of the second stage.
#[derive(Debug, Getters)]
pub struct FastRcnnLosses {
    #[get = "pub"]
    pub(crate) loss_cls: Tensor,
    #[get = "pub"]
    pub(crate) loss_box_reg: Tensor,
}

impl FastRcnnLosses {
    pub fn into_named(self) -> Vec<(&'static str, Tensor)> {
        vec![("loss_cls", self.loss_cls), ("loss_box_reg", self.loss_box_reg)]
    }
}

/// Second stage predictions of one batch, together with the proposals they refer to.
#[derive(Debug)]
pub struct FastRcnnOutputs<'a> {
    box_transform: &'a Box2BoxTransform,
    pred_class_logits: &'a Tensor,
    pred_proposal_deltas: &'a Tensor,
    /// Proposal boxes of all images, concatenated.
    proposals: Boxes,
    num_preds_per_image: Vec<i64>,
    image_sizes: Vec<HW<i64>>,
    smooth_l1_beta: f64,
}

impl<'a> FastRcnnOutputs<'a> {
    pub fn new(
        box_transform: &'a Box2BoxTransform,
        pred_class_logits: &'a Tensor,
        pred_proposal_deltas: &'a Tensor,
        proposals: &[&Proposals<Boxes>],
        smooth_l1_beta: f64,
    ) -> Result<Self> {
        ensure!(!proposals.is_empty(), "at least one image is required");
        let num_preds_per_image: Vec<i64> = proposals.iter().map(|props| props.len()).collect();
        let image_sizes = proposals.iter().map(|props| props.image_size).collect();
        let proposals = Boxes::cat(
            &proposals
                .iter()
                .map(|props| props.boxes.shallow_clone())
                .collect_vec(),
        )?;

        let num_preds: i64 = num_preds_per_image.iter().sum();
        let (num_logits, _) = pred_class_logits.size2()?;
        let (num_deltas, num_delta_cols) = pred_proposal_deltas.size2()?;
        ensure!(
            num_logits == num_preds && num_deltas == num_preds,
            "expect predictions for {} proposals, but get {} logits and {} deltas",
            num_preds,
            num_logits,
            num_deltas
        );
        ensure!(
            num_delta_cols % 4 == 0,
            "expect deltas with a multiple of 4 columns, but get {}",
            num_delta_cols
        );
        proposals.tensor().ensure_same_device(pred_proposal_deltas)?;

        Ok(Self {
            box_transform,
            pred_class_logits,
            pred_proposal_deltas,
            proposals,
            num_preds_per_image,
            image_sizes,
            smooth_l1_beta,
        })
    }

    /// Foreground classes, excluding the background column.
    fn num_classes(&self) -> i64 {
        self.pred_class_logits.size()[1] - 1
    }

    /// Decoded boxes of each image, `[R_i, K * 4]` or `[R_i, 4]`.
    pub fn predict_boxes(&self) -> Result<Vec<Tensor>> {
        let boxes = self
            .box_transform
            .apply_deltas(self.pred_proposal_deltas, self.proposals.tensor())?;
        Ok(boxes.split_with_sizes(self.num_preds_per_image.as_slice(), 0))
    }

    /// Class probabilities of each image, `[R_i, K + 1]`.
    pub fn predict_probs(&self) -> Vec<Tensor> {
        self.pred_class_logits
            .softmax(-1, Kind::Float)
            .split_with_sizes(self.num_preds_per_image.as_slice(), 0)
    }

    pub fn inference(&self, params: &InferenceParams) -> Result<Vec<Detections>> {
        fast_rcnn_inference(
            &self.predict_boxes()?,
            &self.predict_probs(),
            &self.image_sizes,
            params,
        )
    }

    /// Classification and box regression losses.
    ///
    /// `gt_classes` are `[R]` labels in `[0, K]`, where `K` is background, and
    /// `gt_boxes` are the `[R]` matched ground truth boxes of the
    /// concatenated proposals. The regression loss is summed over the
    /// foreground proposals and divided by `R`.
    pub fn losses(&self, gt_classes: &Tensor, gt_boxes: &Boxes) -> Result<FastRcnnLosses> {
        let num_preds = self.proposals.len();
        ensure!(
            gt_classes.size1()? == num_preds && gt_boxes.len() == num_preds,
            "expect ground truth for {} proposals",
            num_preds
        );
        let num_classes = self.num_classes();
        let device = self.pred_class_logits.device();

        let loss_cls = CrossEntropyLoss::new(Reduction::Mean).forward(self.pred_class_logits, gt_classes)?;

        let fg = gt_classes
            .ge(0)
            .logical_and(&gt_classes.lt(num_classes))
            .nonzero()
            .view([-1]);
        let gt_deltas = self.box_transform.get_deltas(
            self.proposals.index_select(&fg).tensor(),
            gt_boxes.index_select(&fg).tensor(),
        )?;
        let box_dim = gt_deltas.size()[1];
        let cls_agnostic = self.pred_proposal_deltas.size()[1] == box_dim;
        let box_cols = Tensor::arange(box_dim, (Kind::Int64, device));
        let cols = if cls_agnostic {
            box_cols.unsqueeze(0).expand([fg.size()[0], box_dim], false)
        } else {
            gt_classes.index_select(0, &fg).unsqueeze(1) * box_dim + box_cols.unsqueeze(0)
        };
        let pred_deltas = self
            .pred_proposal_deltas
            .index_select(0, &fg)
            .gather(1, &cols, false);

        let loss_box_reg = SmoothL1Loss::new(self.smooth_l1_beta, Reduction::Sum)
            .forward(&pred_deltas, &gt_deltas.to_kind(pred_deltas.kind()))?
            / num_preds.max(1) as f64;

        Ok(FastRcnnLosses {
            loss_cls,
            loss_box_reg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_transform::Box2BoxTransformInit;
    use approx::assert_abs_diff_eq;

    #[test]
    fn output_layers_shapes() -> Result<()> {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let layers = FastRcnnOutputLayersInit::new(16, 3).build(&root / "specific")?;
        let predictions = layers.forward(&Tensor::randn([5, 16, 1, 1], (Kind::Float, Device::Cpu)));
        assert_eq!(predictions.class_logits.size(), vec![5, 4]);
        assert_eq!(predictions.proposal_deltas.size(), vec![5, 12]);
        ensure!(predictions.attr_logits.is_none());

        let layers = FastRcnnOutputLayersInit {
            cls_agnostic_bbox_reg: true,
            num_attrs: Some(6),
            ..FastRcnnOutputLayersInit::new(16, 3)
        }
        .build(&root / "agnostic")?;
        let predictions = layers.forward(&Tensor::randn([5, 16], (Kind::Float, Device::Cpu)));
        assert_eq!(predictions.proposal_deltas.size(), vec![5, 4]);
        assert_eq!(
            predictions.attr_logits.map(|logits| logits.size()),
            Some(vec![5, 7])
        );
        Ok(())
    }

    fn proposals(boxes: &[f32], image_size: [i64; 2]) -> Result<Proposals<Boxes>> {
        let num = boxes.len() as i64 / 4;
        Proposals::new(
            Boxes::from_tensor(Tensor::from_slice(boxes).view([num, 4]))?,
            Tensor::zeros([num], (Kind::Float, Device::Cpu)),
            HW::try_from_hw(image_size)?,
        )
    }

    #[test]
    fn outputs_split_per_image() -> Result<()> {
        let transform = Box2BoxTransformInit::new([10.0, 10.0, 5.0, 5.0]).build()?;
        let first = proposals(&[0.0, 0.0, 10.0, 10.0, 5.0, 5.0, 15.0, 15.0], [20, 20])?;
        let second = proposals(&[2.0, 2.0, 6.0, 8.0], [10, 10])?;
        let logits = Tensor::zeros([3, 3], (Kind::Float, Device::Cpu));
        let deltas = Tensor::zeros([3, 8], (Kind::Float, Device::Cpu));

        let outputs = FastRcnnOutputs::new(&transform, &logits, &deltas, &[&first, &second], 0.0)?;
        let boxes = outputs.predict_boxes()?;
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].size(), vec![2, 8]);
        assert_eq!(boxes[1].to_f32_vec()?, vec![2.0, 2.0, 6.0, 8.0, 2.0, 2.0, 6.0, 8.0]);

        let probs = outputs.predict_probs();
        assert_eq!(probs[1].size(), vec![1, 3]);
        assert_abs_diff_eq!(probs[1].double_value(&[0, 0]), 1.0 / 3.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn losses_regress_foreground_only() -> Result<()> {
        let transform = Box2BoxTransformInit::new([1.0, 1.0, 1.0, 1.0]).build()?;
        let props = proposals(&[0.0, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0], [20, 20])?;
        let logits = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        // class 1 columns of the first row predict a shift by one width
        let deltas = Tensor::from_slice(&[
            0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, //
            9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0,
        ])
        .view([2, 8]);
        let outputs = FastRcnnOutputs::new(&transform, &logits, &deltas, &[&props], 0.0)?;

        // the second proposal is background and its deltas are ignored
        let gt_classes = Tensor::from_slice(&[1i64, 2]);
        let gt_boxes = Boxes::from_tensor(
            Tensor::from_slice(&[0f32, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0]).view([2, 4]),
        )?;
        let losses = outputs.losses(&gt_classes, &gt_boxes)?;

        assert_abs_diff_eq!(losses.loss_cls().double_value(&[]), 3f64.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(losses.loss_box_reg().double_value(&[]), 0.5, epsilon = 1e-5);
        Ok(())
    }
}
