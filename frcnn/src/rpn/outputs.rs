use crate::{
    box_transform::BoxTransform,
    common::*,
    loss::{BceWithLogitsLossInit, SmoothL1Loss},
};

/// Loss terms of the region proposal network.
#[derive(Debug, Getters)]
pub struct RpnLosses {
    #[get = "pub"]
    pub(crate) loss_rpn_cls: Tensor,
    #[get = "pub"]
    pub(crate) loss_rpn_loc: Tensor,
}

impl RpnLosses {
    pub fn into_named(self) -> Vec<(&'static str, Tensor)> {
        vec![
            ("loss_rpn_cls", self.loss_rpn_cls),
            ("loss_rpn_loc", self.loss_rpn_loc),
        ]
    }
}

/// Loss hyper-parameters of [RpnOutputs::losses].
#[derive(Debug, Clone, Copy)]
pub struct RpnLossParams {
    pub batch_size_per_image: i64,
    pub smooth_l1_beta: f64,
    pub loss_weight: f64,
}

/// Raw head predictions of one batch, together with the anchors they refer to.
pub struct RpnOutputs<'a, T>
where
    T: BoxTransform,
{
    box_transform: &'a T,
    anchors: &'a [T::Boxes],
    /// `[N, A, H, W]` per level.
    pred_objectness_logits: &'a [Tensor],
    /// `[N, A * BOX_DIM, H, W]` per level.
    pred_anchor_deltas: &'a [Tensor],
    num_images: i64,
}

impl<'a, T> RpnOutputs<'a, T>
where
    T: BoxTransform,
{
    pub fn new(
        box_transform: &'a T,
        anchors: &'a [T::Boxes],
        pred_objectness_logits: &'a [Tensor],
        pred_anchor_deltas: &'a [Tensor],
    ) -> Result<Self> {
        let box_dim = <T::Boxes as BoxSet>::BOX_DIM;
        ensure!(
            anchors.len() == pred_objectness_logits.len()
                && anchors.len() == pred_anchor_deltas.len(),
            "expect anchors and predictions of equal number of levels"
        );
        ensure!(!anchors.is_empty(), "at least one level is required");
        let num_images = pred_objectness_logits[0].size()[0];

        izip!(anchors, pred_objectness_logits, pred_anchor_deltas).try_for_each(
            |(anchors, logits, deltas)| -> Result<_> {
                anchors.tensor().ensure_same_device(logits)?;
                logits.ensure_same_device(deltas)?;
                let (batch, num_cells, height, width) = match logits.size().as_slice() {
                    &[n, a, h, w] => (n, a, h, w),
                    shape => bail!("expect [N, A, H, W] logits, but get {:?}", shape),
                };
                ensure!(batch == num_images, "inconsistent batch sizes across levels");
                ensure!(
                    deltas.size() == [batch, num_cells * box_dim, height, width],
                    "expect deltas of shape {:?}, but get {:?}",
                    [batch, num_cells * box_dim, height, width],
                    deltas.size()
                );
                ensure!(
                    anchors.len() == height * width * num_cells,
                    "expect {} anchors, but get {}",
                    height * width * num_cells,
                    anchors.len()
                );
                Ok(())
            },
        )?;

        Ok(Self {
            box_transform,
            anchors,
            pred_objectness_logits,
            pred_anchor_deltas,
            num_images,
        })
    }

    pub fn num_images(&self) -> i64 {
        self.num_images
    }

    /// Logits reordered to anchor order, `[N, H * W * A]` per level.
    pub fn predict_objectness_logits(&self) -> Vec<Tensor> {
        self.pred_objectness_logits
            .iter()
            .map(|logits| logits.permute([0, 2, 3, 1]).reshape([self.num_images, -1]))
            .collect()
    }

    /// Deltas reordered to anchor order, `[N, H * W * A, BOX_DIM]` per level.
    fn anchor_deltas(&self) -> Result<Vec<Tensor>> {
        let box_dim = <T::Boxes as BoxSet>::BOX_DIM;
        self.pred_anchor_deltas
            .iter()
            .map(|deltas| -> Result<_> {
                let (batch, _, height, width) = deltas.size4()?;
                Ok(deltas
                    .view([batch, -1, box_dim, height, width])
                    .permute([0, 3, 4, 1, 2])
                    .reshape([batch, -1, box_dim]))
            })
            .try_collect()
    }

    /// Decoded proposal boxes, `[N, H * W * A, BOX_DIM]` per level.
    pub fn predict_proposals(&self) -> Result<Vec<Tensor>> {
        let box_dim = <T::Boxes as BoxSet>::BOX_DIM;
        izip!(self.anchors, self.anchor_deltas()?)
            .map(|(anchors, deltas)| -> Result<_> {
                let num_anchors = anchors.len();
                let anchors = anchors
                    .tensor()
                    .unsqueeze(0)
                    .expand([self.num_images, num_anchors, box_dim], false)
                    .reshape([-1, box_dim]);
                let proposals = self
                    .box_transform
                    .apply_deltas(&deltas.reshape([-1, box_dim]), &anchors)?;
                Ok(proposals.view([self.num_images, -1, box_dim]))
            })
            .try_collect()
    }

    /// Objectness and localization losses.
    ///
    /// `gt_labels` are `[R]` labels in `{-1, 0, 1}` and `gt_deltas` are
    /// `[R, BOX_DIM]` regression targets, one pair per image over the
    /// anchors of all levels. Both terms are summed over the sampled anchors,
    /// divided by `batch_size_per_image * N` and scaled by `loss_weight`.
    pub fn losses(
        &self,
        gt_labels: &[Tensor],
        gt_deltas: &[Tensor],
        params: &RpnLossParams,
    ) -> Result<RpnLosses> {
        let RpnLossParams {
            batch_size_per_image,
            smooth_l1_beta,
            loss_weight,
        } = *params;
        let box_dim = <T::Boxes as BoxSet>::BOX_DIM;
        ensure!(
            gt_labels.len() as i64 == self.num_images && gt_deltas.len() as i64 == self.num_images,
            "expect targets for {} images",
            self.num_images
        );

        let pred_logits = Tensor::cat(&self.predict_objectness_logits(), 1).reshape([-1]);
        let pred_deltas = Tensor::cat(&self.anchor_deltas()?, 1).reshape([-1, box_dim]);
        let gt_labels = Tensor::stack(gt_labels, 0).reshape([-1]);
        let gt_deltas = Tensor::stack(gt_deltas, 0).reshape([-1, box_dim]);
        ensure!(
            gt_labels.size() == pred_logits.size(),
            "expect {} anchor labels, but get {}",
            pred_logits.size()[0],
            gt_labels.size()[0]
        );

        let valid = gt_labels.ge(0).nonzero().view([-1]);
        let positive = gt_labels.eq(1).nonzero().view([-1]);

        let loss_cls = BceWithLogitsLossInit::default(Reduction::Sum).build().forward(
            &pred_logits.index_select(0, &valid),
            &gt_labels.index_select(0, &valid).to_kind(Kind::Float),
        )?;
        let loss_loc = SmoothL1Loss::new(smooth_l1_beta, Reduction::Sum).forward(
            &pred_deltas.index_select(0, &positive),
            &gt_deltas.index_select(0, &positive).to_kind(pred_deltas.kind()),
        )?;

        let normalizer = loss_weight / (batch_size_per_image * self.num_images).max(1) as f64;
        Ok(RpnLosses {
            loss_rpn_cls: loss_cls * normalizer,
            loss_rpn_loc: loss_loc * normalizer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_transform::Box2BoxTransformInit;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rpn_outputs_layout() -> Result<()> {
        let transform = Box2BoxTransformInit::new([1.0, 1.0, 1.0, 1.0]).build()?;
        // 2 cells with 2 anchors each, listed cell by cell
        let anchors = [Boxes::from_tensor(
            Tensor::from_slice(&[
                0f32, 0.0, 4.0, 4.0, //
                0.0, 0.0, 8.0, 8.0, //
                4.0, 0.0, 8.0, 4.0, //
                4.0, 0.0, 12.0, 8.0,
            ])
            .view([4, 4]),
        )?];
        // logits[n, a, h, w] = 10 * a + w
        let logits = [Tensor::from_slice(&[0f32, 1.0, 10.0, 11.0]).view([1, 2, 1, 2])];
        let deltas = [Tensor::zeros([1, 8, 1, 2], (Kind::Float, Device::Cpu))];

        let outputs = RpnOutputs::new(&transform, &anchors, &logits, &deltas)?;
        assert_eq!(
            outputs.predict_objectness_logits()[0].to_f32_vec()?,
            vec![0.0, 10.0, 1.0, 11.0]
        );

        let proposals = outputs.predict_proposals()?;
        assert_eq!(proposals[0].size(), vec![1, 4, 4]);
        ensure!(proposals[0]
            .view([4, 4])
            .allclose(anchors[0].tensor(), 1e-5, 1e-5, false));
        Ok(())
    }

    #[test]
    fn rpn_losses_normalization() -> Result<()> {
        let transform = Box2BoxTransformInit::new([1.0, 1.0, 1.0, 1.0]).build()?;
        let anchors = [Boxes::from_tensor(
            Tensor::from_slice(&[0f32, 0.0, 4.0, 4.0, 4.0, 0.0, 8.0, 4.0]).view([2, 4]),
        )?];
        let logits = [Tensor::zeros([1, 1, 1, 2], (Kind::Float, Device::Cpu))];
        let deltas = [Tensor::zeros([1, 4, 1, 2], (Kind::Float, Device::Cpu))];
        let outputs = RpnOutputs::new(&transform, &anchors, &logits, &deltas)?;

        let gt_labels = [Tensor::from_slice(&[1i64, -1])];
        let gt_deltas = [Tensor::from_slice(&[2f32, 0.0, 0.0, 0.0, 5.0, 5.0, 5.0, 5.0]).view([2, 4])];
        let params = RpnLossParams {
            batch_size_per_image: 2,
            smooth_l1_beta: 0.0,
            loss_weight: 1.0,
        };
        let losses = outputs.losses(&gt_labels, &gt_deltas, &params)?;

        assert_abs_diff_eq!(
            losses.loss_rpn_cls().double_value(&[]),
            2f64.ln() / 2.0,
            epsilon = 1e-5
        );
        // the ignored anchor does not contribute to the localization loss
        assert_abs_diff_eq!(losses.loss_rpn_loc().double_value(&[]), 1.0, epsilon = 1e-5);
        Ok(())
    }
}
