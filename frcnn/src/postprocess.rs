//! Rescaling of model outputs to the resolution requested by the caller.

use crate::{
    common::*,
    instances::{Detections, Proposals},
};

/// The per-axis scale factors `(sx, sy)` mapping `input_size` onto `output_size`.
fn scale_factors(input_size: &HW<i64>, output_size: &HW<i64>) -> Result<(f64, f64)> {
    let cast = |size: &HW<i64>| {
        size.try_cast::<f64>()
            .ok_or_else(|| format_err!("cannot represent size {:?} in floating point", size))
    };
    let Transform { sx, sy, .. } = Transform::from_sizes_exact(&cast(input_size)?, &cast(output_size)?)?;
    Ok((sx, sy))
}

/// Rescales detections from the model input resolution to `output_height` ×
/// `output_width`, clips them into the output image and drops the boxes that
/// become empty.
pub fn detector_postprocess(
    detections: Detections,
    output_height: i64,
    output_width: i64,
) -> Result<Detections> {
    let output_size = HW::try_from_hw([output_height, output_width])?;
    let (sx, sy) = scale_factors(&detections.image_size, &output_size)?;

    let boxes = detections.boxes.scale(sx, sy).clip(&output_size)?;
    let keep = boxes.nonempty(0.0).nonzero().view([-1]);
    let detections = Detections {
        boxes,
        image_size: output_size,
        ..detections
    };
    Ok(detections.index_select(&keep))
}

/// Rescales proposals to `output_height` × `output_width` the same way as
/// [detector_postprocess].
pub fn proposal_postprocess(
    proposals: Proposals<Boxes>,
    output_height: i64,
    output_width: i64,
) -> Result<Proposals<Boxes>> {
    let output_size = HW::try_from_hw([output_height, output_width])?;
    let (sx, sy) = scale_factors(&proposals.image_size, &output_size)?;

    let boxes = proposals.boxes.scale(sx, sy).clip(&output_size)?;
    let keep = boxes.nonempty(0.0).nonzero().view([-1]);
    let proposals = Proposals {
        boxes,
        image_size: output_size,
        ..proposals
    };
    Ok(proposals.index_select(&keep))
}
