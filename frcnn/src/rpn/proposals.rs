use crate::{common::*, instances::Proposals};
use tch_goodies::{argsort_descending_stable, topk_stable};

/// Thresholds of [find_top_rpn_proposals].
#[derive(Debug, Clone, Copy)]
pub struct ProposalFilter {
    pub nms_thresh: f64,
    /// Proposals kept per level and image before NMS.
    pub pre_nms_topk: i64,
    /// Proposals kept per image after NMS.
    pub post_nms_topk: i64,
    pub min_box_side_len: f64,
    /// In evaluation mode the output is sorted by descending objectness.
    pub train: bool,
}

/// Selects the top proposals of each image.
///
/// `proposals` are `[N, R_l, BOX_DIM]` decoded boxes and
/// `pred_objectness_logits` are `[N, R_l]` logits, one pair per level. For
/// every image, the best `pre_nms_topk` boxes of each level are taken (equal
/// logits keep anchor order), clipped, filtered by `min_box_side_len`,
/// suppressed per level by NMS and truncated to `post_nms_topk`.
pub fn find_top_rpn_proposals<B>(
    proposals: &[Tensor],
    pred_objectness_logits: &[Tensor],
    image_sizes: &[HW<i64>],
    filter: &ProposalFilter,
) -> Result<Vec<Proposals<B>>>
where
    B: BoxSet,
{
    let ProposalFilter {
        nms_thresh,
        pre_nms_topk,
        post_nms_topk,
        min_box_side_len,
        train,
    } = *filter;
    ensure!(
        proposals.len() == pred_objectness_logits.len(),
        "expect proposals and logits of equal number of levels, but get {} and {}",
        proposals.len(),
        pred_objectness_logits.len()
    );
    ensure!(!proposals.is_empty(), "at least one level is required");
    ensure!(pre_nms_topk >= 0 && post_nms_topk >= 0, "topk must be non-negative");
    let num_images = image_sizes.len() as i64;
    let device = pred_objectness_logits[0].device();

    let levels: Vec<(Tensor, Tensor, Tensor)> = izip!(proposals, pred_objectness_logits)
        .enumerate()
        .map(|(level, (proposals, logits))| -> Result<_> {
            proposals.ensure_same_device(logits)?;
            let (batch, num_anchors) = logits.size2()?;
            ensure!(
                batch == num_images,
                "expect logits for {} images, but get {}",
                num_images,
                batch
            );
            ensure!(
                proposals.size() == [batch, num_anchors, B::BOX_DIM],
                "expect proposals of shape {:?}, but get {:?}",
                [batch, num_anchors, B::BOX_DIM],
                proposals.size()
            );

            let (scores, indices) = topk_stable(logits, pre_nms_topk)?;
            let num_kept = indices.size()[1];
            let proposals = proposals.gather(
                1,
                &indices
                    .unsqueeze(2)
                    .expand([batch, num_kept, B::BOX_DIM], false),
                false,
            );
            let level_ids = Tensor::full([num_kept], level as i64, (Kind::Int64, device));
            Ok((scores, proposals, level_ids))
        })
        .try_collect()?;
    let (topk_scores, topk_proposals, level_ids): (Vec<_>, Vec<_>, Vec<_>) =
        levels.into_iter().multiunzip();

    let topk_scores = Tensor::cat(&topk_scores, 1);
    let topk_proposals = Tensor::cat(&topk_proposals, 1);
    let level_ids = Tensor::cat(&level_ids, 0);

    image_sizes
        .iter()
        .enumerate()
        .map(|(index, &image_size)| -> Result<_> {
            let boxes = B::from_tensor(topk_proposals.get(index as i64))?.clip(&image_size)?;
            let scores = topk_scores.get(index as i64);

            let keep = boxes.nonempty(min_box_side_len).nonzero().view([-1]);
            let boxes = boxes.index_select(&keep);
            let scores = scores.index_select(0, &keep);
            let levels = level_ids.index_select(0, &keep);

            let keep = boxes.batched_nms(&scores, &levels, nms_thresh)?;
            let keep = keep.narrow(0, 0, keep.size()[0].min(post_nms_topk));
            let proposals = Proposals::new(
                boxes.index_select(&keep),
                scores.index_select(0, &keep),
                image_size,
            )?;

            let proposals = if train {
                proposals
            } else {
                let order = argsort_descending_stable(proposals.objectness_logits())?;
                proposals.index_select(&order)
            };
            debug!("image {} keeps {} proposals", index, proposals.len());
            Ok(proposals)
        })
        .try_collect()
}
