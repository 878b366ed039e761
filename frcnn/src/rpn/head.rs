use crate::{
    common::*,
    norm::{Norm, NormKind},
};

fn conv_config(padding: i64, bias: bool) -> nn::ConvConfig {
    nn::ConvConfig {
        padding,
        bias,
        ws_init: nn::Init::Randn {
            mean: 0.0,
            stdev: 0.01,
        },
        bs_init: nn::Init::Const(0.0),
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct StandardRpnHeadInit {
    pub in_channels: i64,
    /// Anchors per grid cell.
    pub num_anchors: i64,
    /// Parameters per box, 4 for axis-aligned and 5 for rotated boxes.
    pub box_dim: i64,
    /// Hidden channels of the shared convolution, defaulting to `in_channels`.
    pub hid_channels: Option<i64>,
    pub norm: Option<NormKind>,
}

impl StandardRpnHeadInit {
    pub fn new(in_channels: i64, num_anchors: i64, box_dim: i64) -> Self {
        Self {
            in_channels,
            num_anchors,
            box_dim,
            hid_channels: None,
            norm: None,
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<StandardRpnHead> {
        let path = path.borrow();
        let Self {
            in_channels,
            num_anchors,
            box_dim,
            hid_channels,
            norm,
        } = self;
        let hid_channels = hid_channels.unwrap_or(in_channels);

        ensure!(
            in_channels > 0 && hid_channels > 0,
            "channel counts must be positive"
        );
        ensure!(num_anchors > 0, "num_anchors must be positive");
        ensure!(box_dim > 0, "box_dim must be positive");

        let conv = nn::conv2d(
            path / "conv",
            in_channels,
            hid_channels,
            3,
            conv_config(1, norm.is_none()),
        );
        let norm = norm
            .map(|kind| kind.build(path / "norm", hid_channels))
            .transpose()?;
        let objectness_logits = nn::conv2d(
            path / "objectness_logits",
            hid_channels,
            num_anchors,
            1,
            conv_config(0, true),
        );
        let anchor_deltas = nn::conv2d(
            path / "anchor_deltas",
            hid_channels,
            num_anchors * box_dim,
            1,
            conv_config(0, true),
        );

        Ok(StandardRpnHead {
            conv,
            norm,
            objectness_logits,
            anchor_deltas,
        })
    }
}

/// A shared 3x3 convolution followed by 1x1 objectness and delta projections.
#[derive(Debug)]
pub struct StandardRpnHead {
    conv: nn::Conv2D,
    norm: Option<Norm>,
    objectness_logits: nn::Conv2D,
    anchor_deltas: nn::Conv2D,
}

impl StandardRpnHead {
    /// Returns per-level `[N, A, H, W]` objectness logits and `[N, A * box_dim, H, W]` deltas.
    pub fn forward_t(&self, features: &[&Tensor], train: bool) -> (Vec<Tensor>, Vec<Tensor>) {
        features
            .iter()
            .map(|&feature| {
                let hidden = feature.apply(&self.conv);
                let hidden = match &self.norm {
                    Some(norm) => norm.forward_t(&hidden, train),
                    None => hidden,
                }
                .relu();
                (
                    hidden.apply(&self.objectness_logits),
                    hidden.apply(&self.anchor_deltas),
                )
            })
            .unzip()
    }
}
