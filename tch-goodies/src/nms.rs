use crate::{boxes::BoxSet, common::*, tensor::TensorExt};

/// Inputs with at least this many boxes run NMS group by group.
pub const BATCHED_NMS_LOOP_THRESHOLD: i64 = 40_000;

/// Indices sorted by descending score. Equal scores keep their original order.
fn descending_order(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&lhs, &rhs| scores[rhs].total_cmp(&scores[lhs]));
    order
}

/// Greedy suppression over `order`, considering only pairs that `same_group` accepts.
fn greedy_suppress<B, F>(
    rects: &[B::Rect],
    order: &[usize],
    iou_threshold: f64,
    same_group: F,
) -> Vec<i64>
where
    B: BoxSet,
    F: Fn(usize, usize) -> bool,
{
    let mut suppressed = vec![false; rects.len()];
    let mut keep = vec![];

    for (pos, &li) in order.iter().enumerate() {
        if suppressed[li] {
            continue;
        }
        keep.push(li as i64);

        for &ri in &order[(pos + 1)..] {
            if suppressed[ri] || !same_group(li, ri) {
                continue;
            }
            let iou = B::rect_iou(&rects[li], &rects[ri]) as f64;
            if iou > iou_threshold {
                suppressed[ri] = true;
            }
        }
    }

    keep
}

fn check_scores<B: BoxSet>(boxes: &B, scores: &Tensor) -> Result<()> {
    boxes.tensor().ensure_same_device(scores)?;
    ensure!(
        scores.dim() == 1 && scores.size()[0] == boxes.len(),
        "boxes and scores should have same number of elements in dimension 0"
    );
    Ok(())
}

/// Non-maximum suppression.
///
/// Boxes are visited in descending score order with ties broken by the
/// original index. A box is dropped if its IoU with an already kept box
/// exceeds `iou_threshold`. Returns the kept indices in visiting order.
pub fn nms<B>(boxes: &B, scores: &Tensor, iou_threshold: f64) -> Result<Tensor>
where
    B: BoxSet,
{
    check_scores(boxes, scores)?;
    let device = boxes.device();

    tch::no_grad(|| -> Result<_> {
        let rects = boxes.to_rects()?;
        let order = descending_order(&scores.to_f32_vec()?);
        let keep = greedy_suppress::<B, _>(&rects, &order, iou_threshold, |_, _| true);
        Ok(Tensor::from_slice(&keep).to_device(device))
    })
}

/// Non-maximum suppression applied independently to each group of boxes.
///
/// Boxes with different `group_ids` never suppress each other. The kept
/// indices of all groups are merged in descending score order, ties broken
/// by the original index. Inputs of [BATCHED_NMS_LOOP_THRESHOLD] boxes or
/// more are processed one group at a time.
pub fn batched_nms<B>(
    boxes: &B,
    scores: &Tensor,
    group_ids: &Tensor,
    iou_threshold: f64,
) -> Result<Tensor>
where
    B: BoxSet,
{
    check_scores(boxes, scores)?;
    boxes.tensor().ensure_same_device(group_ids)?;
    ensure!(
        group_ids.dim() == 1 && group_ids.size()[0] == boxes.len(),
        "boxes and group ids should have same number of elements in dimension 0"
    );
    let device = boxes.device();

    if boxes.is_empty() {
        return Ok(Tensor::zeros([0], (Kind::Int64, device)));
    }

    tch::no_grad(|| -> Result<_> {
        let rects = boxes.to_rects()?;
        let scores = scores.to_f32_vec()?;
        let group_ids = group_ids.to_i64_vec()?;

        let per_group = boxes.len() >= BATCHED_NMS_LOOP_THRESHOLD;
        if per_group {
            warn!(
                "running batched NMS group by group on {} boxes",
                boxes.len()
            );
        }
        let keep = batched_keep::<B>(&rects, &scores, &group_ids, iou_threshold, per_group);

        Ok(Tensor::from_slice(&keep).to_device(device))
    })
}

fn batched_keep<B>(
    rects: &[B::Rect],
    scores: &[f32],
    group_ids: &[i64],
    iou_threshold: f64,
    per_group: bool,
) -> Vec<i64>
where
    B: BoxSet,
{
    if !per_group {
        let order = descending_order(scores);
        return greedy_suppress::<B, _>(rects, &order, iou_threshold, |li, ri| {
            group_ids[li] == group_ids[ri]
        });
    }

    let groups: BTreeMap<i64, Vec<usize>> = group_ids
        .iter()
        .enumerate()
        .map(|(index, &group)| (group, index))
        .into_group_map()
        .into_iter()
        .collect();

    let mut keep: Vec<i64> = groups
        .into_values()
        .flat_map(|members| {
            let member_scores: Vec<f32> = members.iter().map(|&index| scores[index]).collect();
            let member_order: Vec<usize> = descending_order(&member_scores)
                .into_iter()
                .map(|pos| members[pos])
                .collect();
            greedy_suppress::<B, _>(rects, &member_order, iou_threshold, |_, _| true)
        })
        .collect();

    keep.sort_by(|&lhs, &rhs| {
        scores[rhs as usize]
            .total_cmp(&scores[lhs as usize])
            .then(lhs.cmp(&rhs))
    });
    keep
}
