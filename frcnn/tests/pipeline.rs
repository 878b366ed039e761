use anyhow::{ensure, Result};
use bbox::{prelude::*, HW};
use frcnn::{
    anchor::RotatedAnchorGeneratorInit,
    box_transform::Box2BoxTransformRotatedInit,
    config::Config,
    instances::Targets,
    model::ModelOutput,
    roi_heads::GlobalAvgPool,
    rpn::RpnInit,
    shape::ShapeSpec,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tch::{nn, Device, Kind, Tensor};
use tch_goodies::{BoxSet, Boxes, RotatedBoxes, TensorExt};

const CHANNELS: i64 = 32;
const STRIDE: i64 = 16;

lazy_static::lazy_static! {
    static ref CONFIG_DIR: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("cfg");
    static ref SMALL_CONFIG: PathBuf = CONFIG_DIR.join("frcnn-small.json5");
}

fn input_shapes() -> HashMap<String, ShapeSpec> {
    let mut shapes = HashMap::new();
    shapes.insert(
        "res4".to_string(),
        ShapeSpec {
            channels: CHANNELS,
            stride: STRIDE,
        },
    );
    shapes
}

/// Random features of two 64x64 images.
fn features() -> HashMap<String, Tensor> {
    let mut features = HashMap::new();
    features.insert(
        "res4".to_string(),
        Tensor::randn([2, CHANNELS, 4, 4], (Kind::Float, Device::Cpu)),
    );
    features
}

fn image_sizes() -> Result<Vec<HW<i64>>> {
    Ok(vec![HW::try_from_hw([64, 64])?, HW::try_from_hw([64, 48])?])
}

fn targets() -> Result<Vec<Targets>> {
    let first = Targets::new(
        Boxes::from_tensor(
            Tensor::from_slice(&[4f32, 4.0, 40.0, 36.0, 30.0, 20.0, 60.0, 60.0]).view([2, 4]),
        )?,
        Tensor::from_slice(&[0i64, 2]),
    )?;
    let second = Targets::new(
        Boxes::from_tensor(Tensor::from_slice(&[10f32, 10.0, 40.0, 50.0]).view([1, 4]))?,
        Tensor::from_slice(&[1i64]),
    )?;
    Ok(vec![first, second])
}

#[test]
fn generalized_rcnn_inference() -> Result<()> {
    tch::manual_seed(0);
    let config = Config::open(&*SMALL_CONFIG)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = config
        .generalized_rcnn_init()
        .build(vs.root(), &input_shapes(), GlobalAvgPool)?;
    let features = features();
    let image_sizes = image_sizes()?;

    let detections = match tch::no_grad(|| model.forward_t(&image_sizes, &features, None, false))? {
        ModelOutput::Predictions(detections) => detections,
        ModelOutput::Losses(_) => anyhow::bail!("expect detections in evaluation mode"),
    };
    assert_eq!(detections.len(), 2);

    for (detections, size) in detections.iter().zip(&image_sizes) {
        ensure!(detections.len() <= 10);
        assert_eq!(detections.image_size(), size);

        let scores = detections.scores().to_f32_vec()?;
        ensure!(scores.windows(2).all(|pair| pair[0] >= pair[1]));
        ensure!(detections
            .classes()
            .to_i64_vec()?
            .iter()
            .all(|class| (0..3).contains(class)));

        for det in detections.to_vec()? {
            ensure!(det.bbox.x1() >= 0.0 && det.bbox.x2() <= size.w() as f32);
            ensure!(det.bbox.y1() >= 0.0 && det.bbox.y2() <= size.h() as f32);
        }
    }

    // rescale to twice the input resolution
    let output_sizes = [HW::try_from_hw([128, 128])?, HW::try_from_hw([128, 96])?];
    let rescaled = tch::no_grad(|| model.inference(&image_sizes, &features, Some(&output_sizes[..])))?;
    for (detections, size) in rescaled.iter().zip(&output_sizes) {
        assert_eq!(detections.image_size(), size);
        let boxes = detections.boxes().tensor();
        if !detections.is_empty() {
            ensure!(boxes.max().double_value(&[]) <= 128.0);
        }
    }
    Ok(())
}

#[test]
fn generalized_rcnn_training_losses() -> Result<()> {
    tch::manual_seed(1);
    let config = Config::open(&*SMALL_CONFIG)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = config
        .generalized_rcnn_init()
        .build(vs.root(), &input_shapes(), GlobalAvgPool)?;
    let targets = targets()?;

    let losses = match model.forward_t(&image_sizes()?, &features(), Some(targets.as_slice()), true)? {
        ModelOutput::Losses(losses) => losses,
        ModelOutput::Predictions(_) => anyhow::bail!("expect losses in training mode"),
    };
    assert_eq!(
        losses.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["loss_box_reg", "loss_cls", "loss_rpn_cls", "loss_rpn_loc"]
    );
    for (name, loss) in &losses {
        let value = loss.double_value(&[]);
        ensure!(value.is_finite() && value >= 0.0, "{} is {}", name, value);
    }

    // the predictor weights receive gradients
    let total = losses.values().fold(Tensor::zeros([], (Kind::Float, Device::Cpu)), |sum, loss| sum + loss);
    total.backward();
    let grad_norm = vs
        .trainable_variables()
        .iter()
        .map(|var| var.grad())
        .filter(|grad| grad.defined())
        .map(|grad| grad.abs().sum(Kind::Float).double_value(&[]))
        .sum::<f64>();
    ensure!(grad_norm > 0.0);

    ensure!(model.forward_t(&image_sizes()?, &features(), None, true).is_err());
    Ok(())
}

#[test]
fn proposal_network_outputs() -> Result<()> {
    tch::manual_seed(2);
    let config = Config::open(&*SMALL_CONFIG)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = config.proposal_network_init().build(vs.root(), &input_shapes())?;
    let image_sizes = image_sizes()?;
    let features = features();

    let output_sizes = [HW::try_from_hw([32, 32])?, HW::try_from_hw([32, 24])?];
    let proposals = tch::no_grad(|| model.inference(&image_sizes, &features, Some(&output_sizes[..])))?;
    assert_eq!(proposals.len(), 2);
    for (proposals, size) in proposals.iter().zip(&output_sizes) {
        ensure!(proposals.len() <= 20);
        assert_eq!(proposals.image_size(), size);
        let logits = proposals.objectness_logits().to_f32_vec()?;
        ensure!(logits.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    let gt_boxes = targets()?
        .iter()
        .map(|targets| targets.boxes().shallow_clone())
        .collect::<Vec<_>>();
    match model.forward_t(&image_sizes, &features, Some(gt_boxes.as_slice()), true)? {
        ModelOutput::Losses(losses) => {
            assert_eq!(losses.len(), 2);
            ensure!(losses["loss_rpn_loc"].double_value(&[]) > 0.0);
        }
        ModelOutput::Predictions(_) => anyhow::bail!("expect losses in training mode"),
    }
    Ok(())
}

#[test]
fn rotated_rpn_proposals() -> Result<()> {
    tch::manual_seed(3);
    let vs = nn::VarStore::new(Device::Cpu);
    let anchor_generator = RotatedAnchorGeneratorInit {
        sizes: vec![vec![noisy_float::prelude::r64(32.0)]],
        ..RotatedAnchorGeneratorInit::new(vec![STRIDE])
    }
    .build()?;
    let box_transform = Box2BoxTransformRotatedInit::new([1.0, 1.0, 1.0, 1.0, 1.0]).build()?;
    let rpn = RpnInit {
        post_nms_topk_test: 15,
        ..RpnInit::default()
    }
    .build(vs.root() / "rpn", &input_shapes(), anchor_generator, box_transform)?;

    let image_sizes = image_sizes()?;
    let output = tch::no_grad(|| rpn.forward_t(&image_sizes, &features(), None, false))?;
    ensure!(output.losses.is_none());
    assert_eq!(output.proposals.len(), 2);
    for proposals in &output.proposals {
        let boxes: &RotatedBoxes = proposals.boxes();
        ensure!(!boxes.is_empty() && boxes.len() <= 15);
        assert_eq!(boxes.tensor().size()[1], 5);
    }

    let gt_boxes = vec![
        RotatedBoxes::from_tensor(Tensor::from_slice(&[32f32, 32.0, 20.0, 10.0, 30.0]).view([1, 5]))?,
        RotatedBoxes::from_tensor(Tensor::from_slice(&[20f32, 30.0, 16.0, 16.0, 0.0]).view([1, 5]))?,
    ];
    let output = rpn.forward_t(&image_sizes, &features(), Some(gt_boxes.as_slice()), true)?;
    let losses = output
        .losses
        .ok_or_else(|| anyhow::format_err!("missing RPN losses"))?;
    ensure!(losses.loss_rpn_cls().double_value(&[]).is_finite());
    Ok(())
}
